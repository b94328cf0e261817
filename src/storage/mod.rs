//! Pluggable key/value stores for chat history and per-tab state.
//!
//! The crate ships with these backends:
//!
//! - [`MemoryStorage`] -- an in-process map, the per-tab store by default.
//! - [`FsStorage`] -- one file per key on the local filesystem.
//! - [`S3Storage`] -- objects in an Amazon S3 (or compatible) bucket
//!   (requires the `s3` feature).
//!
//! Implement the [`Storage`] trait to add your own backend. Backends do no
//! cross-instance locking: concurrent writers race and the last write wins.

mod fs;
mod memory;
#[cfg(feature = "s3")]
mod s3;

#[cfg(feature = "s3")]
pub use aws_config::Region;
#[cfg(feature = "s3")]
pub use aws_sdk_s3::config::Credentials;
#[cfg(feature = "s3")]
pub use aws_sdk_s3::{Client as S3Client, Config as S3Config, config::Builder as S3ConfigBuilder};
pub use fs::FsStorage;
pub use memory::MemoryStorage;
#[cfg(feature = "s3")]
pub use s3::S3Storage;

use crate::error::Result;

use std::future::Future;

/// Key holding the encrypted list of chat sessions.
pub const HISTORY_KEY: &str = "secure_chat_history";
/// Key holding the id of the session the tab is currently using.
pub const CURRENT_SESSION_KEY: &str = "current_chat_session";
/// Key holding the random identifier used for rate limiting.
pub const CLIENT_ID_KEY: &str = "chat_client_id";

/// Trait for string key/value storage backends.
///
/// Implementations must be `Send + Sync + 'static` so they can be used from
/// the background sweeper task.
///
/// # Implementing a custom backend
///
/// ```rust,no_run
/// use chat_guard::{Storage, Result};
///
/// struct MyStorage;
///
/// impl Storage for MyStorage {
///     async fn get(&self, key: &str) -> Result<Option<String>> {
///         Ok(None)
///     }
///
///     async fn put(&self, key: &str, value: &str) -> Result<()> {
///         // write value somewhere ...
///         Ok(())
///     }
///
///     async fn remove(&self, key: &str) -> Result<()> {
///         Ok(())
///     }
/// }
/// ```
pub trait Storage: Send + Sync + 'static {
    /// Read the value stored under `key`; a missing key is `Ok(None)`.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>>> + Send;

    /// Store `value` under `key`, replacing any previous value.
    fn put(&self, key: &str, value: &str) -> impl Future<Output = Result<()>> + Send;

    /// Delete `key`. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> impl Future<Output = Result<()>> + Send;
}
