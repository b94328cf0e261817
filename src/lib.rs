//! # chat_guard
//!
//! Content security for a chat widget: validation, sanitization and URL
//! vetting of chat messages, plus an encrypted, size-bounded chat history.
//!
//! ## Overview
//!
//! A [`ContentGuard`] is built once from a [`SecurityConfig`] and owns every
//! security component: the [`InputValidator`], the [`ContentSanitizer`]
//! (allow-list, deny-list and residual passes for HTML and markdown), the
//! [`UrlValidator`], a [`RateLimiter`] and the [`SecurityMonitor`] they all
//! log into. [`ChatHistoryManager`] keeps chat sessions in a [`Storage`]
//! backend (in memory, on the local filesystem, in S3, or your own),
//! encrypted with AES-256-GCM.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use chat_guard::{ContentGuard, ContentKind, FsStorage, HistoryBuilder, Role, SecurityConfig};
//! use std::sync::Arc;
//!
//! # async fn example() -> chat_guard::Result<()> {
//! let config = SecurityConfig::builder()
//!     .encryption_key("a long random passphrase")
//!     .build()?;
//! let guard = Arc::new(ContentGuard::new(config));
//!
//! let html = guard.process_content("tab-1", "<b>Hi</b><script>x()</script>", ContentKind::Html)?;
//! assert_eq!(html, "<b>Hi</b>");
//!
//! let (history, sweeper) = HistoryBuilder::new(FsStorage::new("/tmp/chat"), guard).build_with_sweeper();
//! history.add_message("Bonjour", Role::User).await?;
//!
//! // On shutdown, stop the expiry sweeper:
//! sweeper.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `s3` | **yes** | Enables [`S3Storage`] and re-exports from `aws-sdk-s3` / `aws-config`. |
//! | `rustls-tls` | no | Use `rustls` instead of the platform TLS for the AWS SDK. |

pub mod clock;
pub mod config;
pub mod encryption;
pub mod error;
pub mod handle;
pub mod history;
pub mod monitor;
pub mod pipeline;
pub mod rate_limit;
pub mod sanitizer;
pub mod storage;
mod sweeper;
pub mod url_validator;
pub mod validator;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Environment, HistoryBuilder, SecurityConfig, SecurityConfigBuilder};
pub use encryption::HistoryCipher;
pub use error::{ChatGuardError, Result};
pub use handle::SweeperHandle;
pub use history::{
    ChatHistoryManager, ChatMessage, ChatSession, HistoryLimits, HistoryStats, MessageMetadata,
    RenderingState, Role, SessionMetadata,
};
pub use monitor::{
    EventReporter, EventStats, SecurityEvent, SecurityEventKind, SecurityMonitor, Severity,
    TracingReporter,
};
pub use pipeline::{ContentGuard, ContentGuardBuilder, ContentKind};
pub use rate_limit::{FixedWindowLimiter, RateLimiter};
pub use sanitizer::{ContentSanitizer, Sanitizer, SanitizerPipeline};
#[cfg(feature = "s3")]
pub use storage::{Credentials, Region, S3Client, S3Config, S3ConfigBuilder, S3Storage};
pub use storage::{FsStorage, MemoryStorage, Storage};
pub use url_validator::{UrlRejection, UrlValidator, UrlVerdict};
pub use validator::{InputValidator, ValidationIssue, ValidationOutcome};
