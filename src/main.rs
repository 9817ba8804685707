//! Moderation proxy server - main entry point.
//!
//! Builds the HTTP server with all configured routes and middleware.
//! Configuration is loaded from environment variables (with .env support).

use anyhow::Result;
use chrono::Local;
use modgate::{build_router, AppConfig, AppState};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Custom time formatter that uses local timezone (respects TZ environment variable)
struct LocalTime;

impl tracing_subscriber::fmt::time::FormatTime for LocalTime {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%d %H:%M:%S"))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (before reading any environment variables)
    dotenvy::dotenv().ok();

    init_logging();

    let config = AppConfig::from_env()?;
    let addr = SocketAddr::new(config.server.host.parse()?, config.server.port);

    let http_client = create_http_client();
    let state = Arc::new(AppState::new(config, http_client));

    // Background maintenance: counter sweeps and breaker ticks
    state.rate_limiter.clone().spawn_sweeper();
    state.breaker.clone().spawn_ticker();

    let app = build_router(state.clone());

    tracing::info!("Starting moderation proxy on {}", addr);
    tracing::info!(
        "Moderation models: {:?} (strategy {:?})",
        state.config.first_provider.models,
        state.config.moderation_strategy
    );
    tracing::info!(
        "Endpoints: /v1/chat/completions, /v1/images/generations, /v1/audio/transcriptions, /v1/models"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn init_logging() {
    // Default filter: info everywhere, debug for this crate. Noisy HTTP
    // library logs are suppressed even when RUST_LOG overrides the default.
    let base_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,modgate=debug".to_string());
    let filter_str = format!("{base_filter},hyper=warn,h2=warn,reqwest=warn");
    let filter = tracing_subscriber::EnvFilter::new(filter_str);

    let no_color = std::env::var("NO_COLOR").is_ok();
    if no_color {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_timer(LocalTime)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_timer(LocalTime))
            .init();
    }
}

/// Create the shared HTTP client with connection pooling.
///
/// No client-wide timeout is set: streaming responses are bounded only by the
/// inactivity watchdog. Unary and moderation calls set per-request timeouts.
fn create_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(15))
        .pool_max_idle_per_host(100)
        .pool_idle_timeout(std::time::Duration::from_secs(90))
        .tcp_keepalive(std::time::Duration::from_secs(60))
        .build()
        .expect("Failed to build HTTP client")
}
