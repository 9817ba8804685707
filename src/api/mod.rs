//! HTTP surface of the moderation proxy.

pub mod handlers;
pub mod streaming;

pub use handlers::{
    audio_transcriptions, build_router, chat_completions, images_generations, list_models,
    AppState,
};
pub use streaming::{relay_sse, sse_static_response};
