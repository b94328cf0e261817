//! Error types for the `chat_guard` crate.

use crate::validator::ValidationIssue;

/// All errors that can occur while vetting, sanitizing or storing chat content.
#[derive(Debug, thiserror::Error)]
pub enum ChatGuardError {
    /// User input was rejected by the input validator.
    #[error("Validation failed: {}", join_issues(.0))]
    Validation(Vec<ValidationIssue>),

    /// Content exceeds the configured maximum length.
    #[error("Content too long: {len} characters (max {max})")]
    ContentTooLong { len: usize, max: usize },

    /// The caller exhausted its request budget for the current window.
    #[error("Rate limit exceeded")]
    RateLimited,

    /// Encrypting the chat history failed.
    #[error("Encryption failed: {0}")]
    Encryption(String),

    /// A stored payload could not be decrypted or decoded.
    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A storage backend failed to read or write a key.
    #[error("Storage operation failed: {0}")]
    Storage(Box<dyn std::error::Error + Send + Sync>),

    /// The configuration is invalid or unsafe for the selected environment.
    #[error("Config error: {0}")]
    Config(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    /// An exported session blob did not have the expected shape.
    #[error("Import rejected: {0}")]
    InvalidImport(String),

    /// The message already reached the `complete` rendering state.
    #[error("Message {0} is finalized and can no longer change")]
    MessageFinalized(String),
}

fn join_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// A type alias for `Result<T, ChatGuardError>`.
pub type Result<T> = std::result::Result<T, ChatGuardError>;
