//! Message normalization and long-content sampling for moderation review.
//!
//! Before content is sent to the moderation provider it is normalized to plain
//! text; when the combined length exceeds the review budget, a representative
//! sample is extracted instead of the full conversation. Sampling uses a
//! caller-supplied RNG so tests can seed it.

use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::Value;

/// Total character budget for one review bundle.
pub const MAX_REVIEW_CHARS: usize = 30_000;

/// Marker inserted where content was cut.
pub const TRUNCATED_MARKER: &str = "\n[... content truncated ...]\n";

/// Smallest excerpt worth including from a leftover user message.
const MIN_EXCERPT_CHARS: usize = 200;

/// Non-user messages may claim at most this share of the budget.
const NON_USER_SHARE: usize = 2; // divisor: budget / 2

/// Head/middle/tail segments of a single oversize user message each get
/// budget / this divisor.
const SINGLE_USER_DIVISOR: f64 = 3.5;

const OVERSIZE_NOTICE: &str =
    "The submitted conversation was too large to review; even a reduced sample exceeded the \
     review budget. Treat this request as only partially checked.";

/// One normalized message: role plus flattened text content.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewMessage {
    pub role: String,
    pub content: String,
}

impl ReviewMessage {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

/// Result of sampling: the (possibly reduced) bundle and whether it is partial.
#[derive(Debug, Clone)]
pub struct SampledBundle {
    pub messages: Vec<ReviewMessage>,
    pub is_partial: bool,
}

/// Flatten request messages to plain text.
///
/// Multi-part content keeps only `text` parts, joined by newlines. A string
/// body that parses as a JSON object or array is re-serialized with
/// indentation so the reviewer sees structure instead of one long line.
pub fn normalize_messages(messages: &[Value]) -> Vec<ReviewMessage> {
    messages
        .iter()
        .map(|msg| {
            let role = msg
                .get("role")
                .and_then(|r| r.as_str())
                .unwrap_or("user")
                .to_string();
            let content = normalize_content(msg.get("content").unwrap_or(&Value::Null));
            ReviewMessage { role, content }
        })
        .collect()
}

fn normalize_content(content: &Value) -> String {
    match content {
        Value::String(text) => match serde_json::from_str::<Value>(text) {
            Ok(parsed @ (Value::Object(_) | Value::Array(_))) => {
                serde_json::to_string_pretty(&parsed).unwrap_or_else(|_| text.clone())
            }
            _ => text.clone(),
        },
        Value::Array(parts) => parts
            .iter()
            .filter(|part| part.get("type").and_then(|t| t.as_str()) == Some("text"))
            .filter_map(|part| part.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Reduce a bundle to at most `budget` characters.
///
/// Under budget the input passes through untouched. Over budget, non-user
/// messages get up to half the budget (whole where they fit, the first
/// oversize one truncated), and the remainder is spent on user content:
/// a lone user message is sampled head/middle/tail, multiple user messages
/// are packed shortest-first with shuffled head excerpts from the rest.
pub fn sample_messages<R: Rng + ?Sized>(
    messages: &[ReviewMessage],
    budget: usize,
    rng: &mut R,
) -> SampledBundle {
    let total: usize = messages.iter().map(|m| char_len(&m.content)).sum();
    if total <= budget {
        return SampledBundle {
            messages: messages.to_vec(),
            is_partial: false,
        };
    }

    let marker_len = char_len(TRUNCATED_MARKER);
    let mut packed: Vec<ReviewMessage> = Vec::new();
    let mut used = 0usize;

    // Non-user context first, capped at half the budget.
    let non_user_budget = budget / NON_USER_SHARE;
    for msg in messages.iter().filter(|m| m.role != "user") {
        let len = char_len(&msg.content);
        if used + len <= non_user_budget {
            packed.push(msg.clone());
            used += len;
        } else {
            let room = non_user_budget.saturating_sub(used);
            if room > marker_len + MIN_EXCERPT_CHARS {
                let kept = take_chars(&msg.content, room - marker_len);
                packed.push(ReviewMessage {
                    role: msg.role.clone(),
                    content: format!("{kept}{TRUNCATED_MARKER}"),
                });
                used = non_user_budget;
            }
            break;
        }
    }

    // Spend what is left on user content.
    let mut remaining = budget.saturating_sub(used);
    let users: Vec<&ReviewMessage> = messages.iter().filter(|m| m.role == "user").collect();
    match users.len() {
        0 => {}
        1 => {
            let sampled = sample_single_user(&users[0].content, remaining, rng);
            packed.push(ReviewMessage::new("user", sampled));
        }
        _ => {
            let mut sorted = users;
            sorted.sort_by_key(|m| char_len(&m.content));

            let mut leftovers = Vec::new();
            for msg in sorted {
                let len = char_len(&msg.content);
                if len <= remaining {
                    packed.push(msg.clone());
                    remaining -= len;
                } else {
                    leftovers.push(msg);
                }
            }

            leftovers.shuffle(rng);
            for msg in leftovers {
                if remaining < MIN_EXCERPT_CHARS {
                    break;
                }
                let head = take_chars(&msg.content, remaining.saturating_sub(marker_len));
                let excerpt = format!("{head}{TRUNCATED_MARKER}");
                remaining = remaining.saturating_sub(char_len(&excerpt));
                packed.push(ReviewMessage {
                    role: msg.role.clone(),
                    content: excerpt,
                });
            }
        }
    }

    // Rare overflow paths: drop the last user message, then give up entirely.
    if bundle_len(&packed) > budget {
        if let Some(pos) = packed.iter().rposition(|m| m.role == "user") {
            packed.remove(pos);
        }
    }
    if bundle_len(&packed) > budget {
        packed = vec![ReviewMessage::new("system", OVERSIZE_NOTICE)];
    }

    SampledBundle {
        messages: packed,
        is_partial: true,
    }
}

/// Head + random-offset middle + tail, each capped at `budget / 3.5`.
fn sample_single_user<R: Rng + ?Sized>(content: &str, budget: usize, rng: &mut R) -> String {
    let len = char_len(content);
    if len <= budget {
        return content.to_string();
    }

    let seg = (budget as f64 / SINGLE_USER_DIVISOR).floor() as usize;
    if seg == 0 {
        return String::new();
    }

    let head = take_chars(content, seg);
    let tail = take_last_chars(content, seg);

    // middle segment starts anywhere between the head and the tail
    let max_offset = len - 2 * seg;
    let offset = if max_offset > seg {
        rng.gen_range(seg..=max_offset)
    } else {
        seg
    };
    let middle = slice_chars(content, offset, seg);

    format!("{head}{TRUNCATED_MARKER}{middle}{TRUNCATED_MARKER}{tail}")
}

fn bundle_len(messages: &[ReviewMessage]) -> usize {
    messages.iter().map(|m| char_len(&m.content)).sum()
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// First `n` characters, respecting char boundaries.
fn take_chars(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Last `n` characters, respecting char boundaries.
fn take_last_chars(s: &str, n: usize) -> &str {
    let len = char_len(s);
    if n >= len {
        return s;
    }
    slice_chars(s, len - n, n)
}

/// `n` characters starting at char offset `start`.
fn slice_chars(s: &str, start: usize, n: usize) -> &str {
    let mut indices = s.char_indices().skip(start);
    let begin = match indices.next() {
        Some((idx, _)) => idx,
        None => return "",
    };
    match s[begin..].char_indices().nth(n) {
        Some((idx, _)) => &s[begin..begin + idx],
        None => &s[begin..],
    }
}
