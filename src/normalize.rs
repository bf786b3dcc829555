//! Turning free-form model text into JSON.
//!
//! Models often wrap their JSON in a Markdown fence. [`strip_markdown_fence`]
//! removes one opening and one closing fence. [`normalize_reply`] then parses
//! strictly and applies the caller's [`FallbackPolicy`] when parsing fails.

use crate::ai_client::AiError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use tracing::warn;

static OPENING_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^```[A-Za-z0-9_+-]*[ \t]*\r?\n?").expect("static regex"));
static CLOSING_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\r?\n?```[ \t]*$").expect("static regex"));

pub fn strip_markdown_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let start = OPENING_FENCE.find(trimmed).map(|m| m.end()).unwrap_or(0);
    let body = &trimmed[start..];
    let end = CLOSING_FENCE.find(body).map(|m| m.start()).unwrap_or(body.len());
    body[..end].trim()
}

/// What a call site does when the model's text is not valid JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackPolicy {
    /// Surface the failure as an invalid-response service error.
    Reject,
    /// Wrap the text as a tutor reply with neutral sentiment.
    TutorEnvelope,
    /// Use the text's first line as a conversation title.
    TitleFromText,
}

pub const DEFAULT_CHAT_TITLE: &str = "New Conversation";
const MAX_TITLE_CHARS: usize = 60;

pub fn normalize_reply(raw: &str, policy: FallbackPolicy) -> Result<Value, AiError> {
    let cleaned = strip_markdown_fence(raw);
    match serde_json::from_str::<Value>(cleaned) {
        Ok(value) => Ok(value),
        Err(err) => {
            warn!(?policy, "model reply is not valid JSON: {}", err);
            match policy {
                FallbackPolicy::Reject => Err(AiError::MalformedReply(err.to_string())),
                FallbackPolicy::TutorEnvelope => Ok(tutor_envelope(cleaned)),
                FallbackPolicy::TitleFromText => Ok(json!({ "title": title_from_text(cleaned) })),
            }
        }
    }
}

pub fn tutor_envelope(text: &str) -> Value {
    json!({
        "tutor_response": text,
        "pedagogical_reasoning": "No reasoning provided.",
        "detected_sentiment": "NEUTRAL",
        "suggested_action": "NONE"
    })
}

pub fn title_from_text(text: &str) -> String {
    let line = text
        .lines()
        .map(|l| l.trim().trim_matches(|c| c == '"' || c == '#' || c == '*').trim())
        .find(|l| !l.is_empty())
        .unwrap_or("");
    if line.is_empty() {
        return DEFAULT_CHAT_TITLE.to_string();
    }
    line.chars().take(MAX_TITLE_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_json_fence() {
        let raw = "```json\n{\"a\":1}\n```";
        assert_eq!(normalize_reply(raw, FallbackPolicy::Reject).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn strips_bare_fence_and_whitespace() {
        assert_eq!(strip_markdown_fence("  ```\n[1, 2]\n```  \n"), "[1, 2]");
        assert_eq!(strip_markdown_fence("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_markdown_fence("```json{\"a\":1}```"), "{\"a\":1}");
    }

    #[test]
    fn keeps_inner_fences() {
        let raw = "```json\n{\"steps\":[\"```mermaid\\nA-->B\\n```\"]}\n```";
        let value = normalize_reply(raw, FallbackPolicy::Reject).unwrap();
        assert_eq!(value["steps"][0], "```mermaid\nA-->B\n```");
    }

    #[test]
    fn reject_policy_errors_every_time() {
        for _ in 0..3 {
            let err = normalize_reply("not json", FallbackPolicy::Reject).unwrap_err();
            assert!(matches!(err, AiError::MalformedReply(_)));
        }
    }

    #[test]
    fn tutor_policy_wraps_text() {
        let first = normalize_reply("not json", FallbackPolicy::TutorEnvelope).unwrap();
        let second = normalize_reply("not json", FallbackPolicy::TutorEnvelope).unwrap();
        assert_eq!(first, second);
        assert_eq!(first["tutor_response"], "not json");
        assert_eq!(first["detected_sentiment"], "NEUTRAL");
        assert_eq!(first["suggested_action"], "NONE");
    }

    #[test]
    fn title_policy_uses_first_line() {
        let value = normalize_reply("\n\"Photosynthesis Basics\"\nmore", FallbackPolicy::TitleFromText).unwrap();
        assert_eq!(value["title"], "Photosynthesis Basics");
        assert_eq!(title_from_text("   "), DEFAULT_CHAT_TITLE);
        assert_eq!(title_from_text(&"x".repeat(100)).len(), 60);
    }
}
