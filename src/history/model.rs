//! Chat messages and sessions as they are stored.
//!
//! Field names serialize in camelCase so a stored history keeps the same
//! JSON shape as the browser widget's `localStorage` payload.

use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::clock::to_delta;

static CODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)```|`[^`\n]+`|<code\b|<pre\b").expect("invalid regex pattern")
});

static TABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*\|?\s*:?-{3,}:?\s*\||<table\b").expect("invalid regex pattern")
});

static LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\[[^\]\n]*\]\([^)\s]+\)|<a\b[^>]*\bhref=|https?://\S")
        .expect("invalid regex pattern")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Lifecycle of a message in the UI: pending → rendering → complete or
/// error. A `Complete` message is frozen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderingState {
    #[default]
    Pending,
    Rendering,
    Complete,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessageMetadata {
    pub has_code: bool,
    pub has_tables: bool,
    pub has_links: bool,
    /// Milliseconds between creation and reaching `Complete`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub render_time: Option<u64>,
    pub security_checked: bool,
    /// `true` if sanitization changed the submitted content.
    pub sanitized: bool,
}

impl MessageMetadata {
    /// Detect code, tables and links in (already sanitized) content.
    pub fn detect(content: &str) -> Self {
        Self {
            has_code: CODE.is_match(content),
            has_tables: TABLE.is_match(content),
            has_links: LINK.is_match(content),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub content: String,
    pub role: Role,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub is_markdown: bool,
    #[serde(default)]
    pub rendering_state: RenderingState,
    #[serde(default)]
    pub metadata: MessageMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionMetadata {
    /// Messages ever added, including ones trimmed away since.
    pub total_messages: usize,
    /// Messages whose content had to be sanitized.
    pub security_events: usize,
    pub encryption_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    pub id: String,
    pub messages: Vec<ChatMessage>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(default)]
    pub metadata: SessionMetadata,
}

impl ChatSession {
    pub fn new(id: impl Into<String>, now: DateTime<Utc>, encryption_enabled: bool) -> Self {
        Self {
            id: id.into(),
            messages: Vec::new(),
            created_at: now,
            last_activity: now,
            metadata: SessionMetadata {
                encryption_enabled,
                ..SessionMetadata::default()
            },
        }
    }

    /// `true` once more than `max_age` has passed since the last activity.
    pub fn is_expired(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        now.signed_duration_since(self.last_activity) > to_delta(max_age)
    }

    /// Drop the oldest messages until at most `max` remain. Returns how many
    /// were dropped.
    pub fn trim_to(&mut self, max: usize) -> usize {
        let excess = self.messages.len().saturating_sub(max);
        self.messages.drain(..excess);
        excess
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(content: &str) -> ChatMessage {
        ChatMessage {
            id: content.into(),
            content: content.into(),
            role: Role::User,
            timestamp: Utc::now(),
            is_markdown: true,
            rendering_state: RenderingState::Pending,
            metadata: MessageMetadata::default(),
        }
    }

    #[test]
    fn detects_code() {
        assert!(MessageMetadata::detect("```rust\nfn main() {}\n```").has_code);
        assert!(MessageMetadata::detect("use `cargo build`").has_code);
        assert!(MessageMetadata::detect("<pre><code>x</code></pre>").has_code);
        assert!(!MessageMetadata::detect("no code here").has_code);
    }

    #[test]
    fn detects_tables() {
        assert!(MessageMetadata::detect("| a | b |\n|---|---|\n| 1 | 2 |").has_tables);
        assert!(MessageMetadata::detect("<table><tr><td>1</td></tr></table>").has_tables);
        assert!(!MessageMetadata::detect("a - b --- c").has_tables);
    }

    #[test]
    fn detects_links() {
        assert!(MessageMetadata::detect("[site](https://x.fr)").has_links);
        assert!(MessageMetadata::detect(r#"<a href="/contact">c</a>"#).has_links);
        assert!(MessageMetadata::detect("see https://x.fr").has_links);
        assert!(!MessageMetadata::detect("[not a link]").has_links);
    }

    #[test]
    fn trim_drops_oldest_first() {
        let now = Utc::now();
        let mut session = ChatSession::new("s", now, true);
        session.messages = (0..5).map(|i| message(&i.to_string())).collect();
        assert_eq!(session.trim_to(3), 2);
        let ids: Vec<_> = session.messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["2", "3", "4"]);
        assert_eq!(session.trim_to(3), 0);
    }

    #[test]
    fn expiry_is_strictly_after_max_age() {
        let now = Utc::now();
        let session = ChatSession::new("s", now, true);
        let age = Duration::from_secs(60);
        assert!(!session.is_expired(now + to_delta(age), age));
        assert!(session.is_expired(now + to_delta(age) + chrono::TimeDelta::seconds(1), age));
    }

    #[test]
    fn serializes_in_camel_case() {
        let mut session = ChatSession::new("s", Utc::now(), true);
        session.messages.push(message("m"));
        let json = serde_json::to_value(&session).unwrap();
        assert!(json.get("createdAt").is_some());
        assert!(json.get("lastActivity").is_some());
        assert_eq!(json["metadata"]["encryptionEnabled"], true);
        assert_eq!(json["messages"][0]["isMarkdown"], true);
        assert_eq!(json["messages"][0]["renderingState"], "pending");
        assert_eq!(json["messages"][0]["role"], "user");
        assert!(json["messages"][0]["metadata"].get("renderTime").is_none());
    }

    #[test]
    fn optional_fields_default_on_load() {
        let json = r#"{"id":"s","messages":[{"id":"m","content":"hi","role":"assistant","timestamp":"2026-01-01T00:00:00Z"}],"createdAt":"2026-01-01T00:00:00Z","lastActivity":"2026-01-01T00:00:00Z"}"#;
        let session: ChatSession = serde_json::from_str(json).unwrap();
        assert_eq!(session.messages[0].rendering_state, RenderingState::Pending);
        assert_eq!(session.metadata, SessionMetadata::default());
    }
}
