//! Builders for the security configuration and the chat history manager.

use std::env::VarError;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ChatGuardError, Result};
use crate::handle::SweeperHandle;
use crate::history::{ChatHistoryManager, HistoryLimits};
use crate::pipeline::ContentGuard;
use crate::storage::{MemoryStorage, Storage};

/// Default maximum accepted content length, in characters.
pub const DEFAULT_MAX_CONTENT_LENGTH: usize = 50_000;
/// Domain that counts as "our own" when vetting links.
pub const DEFAULT_SITE_DOMAIN: &str = "laurent-serre-developpement.fr";

/// Deployment environment the guard runs in.
///
/// Production turns on fail-closed key handling and external event
/// reporting; development echoes every security event to the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Development,
    Test,
    Production,
}

impl Environment {
    /// Parse an environment name. Unknown names map to `Development`.
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Self::Production,
            "test" | "testing" => Self::Test,
            _ => Self::Development,
        }
    }

    pub fn is_production(self) -> bool {
        self == Self::Production
    }
}

/// Immutable, process-wide security settings.
///
/// Built once through [`SecurityConfigBuilder`] and shared behind an `Arc`;
/// there are no setters.
#[derive(Debug, Clone)]
pub struct SecurityConfig {
    enable_content_sanitization: bool,
    enable_xss_protection: bool,
    enable_history_encryption: bool,
    enable_url_validation: bool,
    allowed_domains: Vec<String>,
    max_content_length: usize,
    encryption_key: Option<String>,
    environment: Environment,
    site_origin: String,
    rate_limit_max_attempts: u32,
    rate_limit_window: Duration,
    event_capacity: usize,
}

impl SecurityConfig {
    pub fn builder() -> SecurityConfigBuilder {
        SecurityConfigBuilder::new()
    }

    pub fn enable_content_sanitization(&self) -> bool {
        self.enable_content_sanitization
    }

    pub fn enable_xss_protection(&self) -> bool {
        self.enable_xss_protection
    }

    pub fn enable_history_encryption(&self) -> bool {
        self.enable_history_encryption
    }

    pub fn enable_url_validation(&self) -> bool {
        self.enable_url_validation
    }

    /// Domains treated as internal. Subdomains of an entry match too.
    pub fn allowed_domains(&self) -> &[String] {
        &self.allowed_domains
    }

    pub fn max_content_length(&self) -> usize {
        self.max_content_length
    }

    pub fn encryption_key(&self) -> Option<&str> {
        self.encryption_key.as_deref()
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    /// Origin that relative links are resolved against.
    pub fn site_origin(&self) -> &str {
        &self.site_origin
    }

    pub fn rate_limit_max_attempts(&self) -> u32 {
        self.rate_limit_max_attempts
    }

    pub fn rate_limit_window(&self) -> Duration {
        self.rate_limit_window
    }

    /// Capacity of the security event ring buffer.
    pub fn event_capacity(&self) -> usize {
        self.event_capacity
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enable_content_sanitization: true,
            enable_xss_protection: true,
            enable_history_encryption: true,
            enable_url_validation: true,
            allowed_domains: vec![DEFAULT_SITE_DOMAIN.to_string()],
            max_content_length: DEFAULT_MAX_CONTENT_LENGTH,
            encryption_key: None,
            environment: Environment::Development,
            site_origin: format!("https://{DEFAULT_SITE_DOMAIN}"),
            rate_limit_max_attempts: 10,
            rate_limit_window: Duration::from_secs(60),
            event_capacity: 100,
        }
    }
}

/// Builder for [`SecurityConfig`].
///
/// # Example
///
/// ```
/// use chat_guard::{Environment, SecurityConfig};
/// use std::time::Duration;
///
/// let config = SecurityConfig::builder()
///     .environment(Environment::Production)
///     .encryption_key("a long random passphrase")
///     .add_allowed_domain("calendly.com")
///     .rate_limit(5, Duration::from_secs(30))
///     .build()
///     .unwrap();
/// assert_eq!(config.rate_limit_max_attempts(), 5);
/// ```
#[derive(Debug, Clone, Default)]
pub struct SecurityConfigBuilder {
    config: SecurityConfig,
}

impl SecurityConfigBuilder {
    /// Start from the defaults: every protection on, 50 000 characters,
    /// 10 requests per minute, the site's own domain allowed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a builder from the process environment.
    ///
    /// Reads `CHAT_GUARD_ENV`, `CHAT_GUARD_ENCRYPTION_KEY`,
    /// `CHAT_GUARD_ALLOWED_DOMAINS` and `CHAT_GUARD_MAX_CONTENT_LENGTH`.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|key| std::env::var(key))
    }

    /// Like [`from_env`](Self::from_env) with a custom variable lookup.
    pub fn from_env_with<F>(env_fn: F) -> Result<Self>
    where
        F: Fn(&str) -> std::result::Result<String, VarError>,
    {
        let mut builder = Self::new();

        if let Ok(env) = env_fn("CHAT_GUARD_ENV") {
            builder = builder.environment(Environment::parse(&env));
        }
        if let Ok(key) = env_fn("CHAT_GUARD_ENCRYPTION_KEY") {
            builder = builder.encryption_key(key);
        }
        if let Ok(domains) = env_fn("CHAT_GUARD_ALLOWED_DOMAINS") {
            builder = builder.allowed_domains(domains.split(','));
        }
        if let Ok(raw) = env_fn("CHAT_GUARD_MAX_CONTENT_LENGTH") {
            let max = raw.trim().parse::<usize>().map_err(|e| {
                ChatGuardError::Config(format!("CHAT_GUARD_MAX_CONTENT_LENGTH={raw:?}: {e}"))
            })?;
            builder = builder.max_content_length(max);
        }

        Ok(builder)
    }

    pub fn content_sanitization(mut self, enabled: bool) -> Self {
        self.config.enable_content_sanitization = enabled;
        self
    }

    pub fn xss_protection(mut self, enabled: bool) -> Self {
        self.config.enable_xss_protection = enabled;
        self
    }

    /// When disabled the history is stored as plain JSON.
    pub fn history_encryption(mut self, enabled: bool) -> Self {
        self.config.enable_history_encryption = enabled;
        self
    }

    pub fn url_validation(mut self, enabled: bool) -> Self {
        self.config.enable_url_validation = enabled;
        self
    }

    /// Replace the internal-domain allow-list.
    pub fn allowed_domains<I, D>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: AsRef<str>,
    {
        self.config.allowed_domains = domains
            .into_iter()
            .filter_map(|d| normalize_domain(d.as_ref()))
            .collect();
        self
    }

    pub fn add_allowed_domain(mut self, domain: impl AsRef<str>) -> Self {
        if let Some(domain) = normalize_domain(domain.as_ref()) {
            self.config.allowed_domains.push(domain);
        }
        self
    }

    pub fn max_content_length(mut self, max: usize) -> Self {
        self.config.max_content_length = max;
        self
    }

    /// Passphrase the history encryption key is derived from.
    pub fn encryption_key(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        self.config.encryption_key = (!key.trim().is_empty()).then_some(key);
        self
    }

    pub fn environment(mut self, environment: Environment) -> Self {
        self.config.environment = environment;
        self
    }

    pub fn site_origin(mut self, origin: impl Into<String>) -> Self {
        self.config.site_origin = origin.into();
        self
    }

    /// Fixed-window limit: `max_attempts` requests per `window`.
    pub fn rate_limit(mut self, max_attempts: u32, window: Duration) -> Self {
        self.config.rate_limit_max_attempts = max_attempts;
        self.config.rate_limit_window = window;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    /// Validate and freeze the configuration.
    ///
    /// Refuses to build a production config that would encrypt history
    /// without an explicit key.
    pub fn build(self) -> Result<SecurityConfig> {
        let config = self.config;

        if config.max_content_length == 0 {
            return Err(ChatGuardError::Config(
                "max_content_length must be greater than zero".into(),
            ));
        }
        if config.rate_limit_max_attempts == 0 || config.rate_limit_window.is_zero() {
            return Err(ChatGuardError::Config(
                "rate limit needs at least one attempt per non-empty window".into(),
            ));
        }
        if config.event_capacity == 0 {
            return Err(ChatGuardError::Config(
                "event_capacity must be greater than zero".into(),
            ));
        }
        if url::Url::parse(&config.site_origin).is_err() {
            return Err(ChatGuardError::Config(format!(
                "site_origin {:?} is not an absolute URL",
                config.site_origin
            )));
        }

        if config.enable_history_encryption && config.encryption_key.is_none() {
            if config.environment.is_production() {
                return Err(ChatGuardError::Config(
                    "history encryption is enabled in production but no encryption key is configured"
                        .into(),
                ));
            }
            tracing::warn!(
                "No encryption key configured; using the development placeholder key"
            );
        }

        Ok(config)
    }
}

fn normalize_domain(domain: &str) -> Option<String> {
    let domain = domain.trim().trim_start_matches('.').to_ascii_lowercase();
    (!domain.is_empty()).then_some(domain)
}

/// Builder for configuring and starting a [`ChatHistoryManager`].
///
/// `L` is the durable store (the `localStorage` analogue), `T` the
/// per-tab store holding the current session id and the client id. The
/// latter defaults to a fresh [`MemoryStorage`].
///
/// # Example
///
/// ```rust,no_run
/// use chat_guard::{ContentGuard, FsStorage, HistoryBuilder, SecurityConfig};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # async fn example() {
/// let guard = Arc::new(ContentGuard::new(SecurityConfig::default()));
/// let (history, sweeper) = HistoryBuilder::new(FsStorage::new("/tmp/chat"), guard)
///     .max_history_size(50)
///     .max_session_age(Duration::from_secs(12 * 3600))
///     .sweep_interval(Duration::from_secs(600))
///     .build_with_sweeper();
///
/// history.add_message("Bonjour", chat_guard::Role::User).await.unwrap();
/// sweeper.shutdown().await;
/// # }
/// ```
pub struct HistoryBuilder<L: Storage, T: Storage = MemoryStorage> {
    local: L,
    session: T,
    guard: Arc<ContentGuard>,
    limits: HistoryLimits,
}

impl<L: Storage> HistoryBuilder<L, MemoryStorage> {
    /// Create a builder with the given durable storage and defaults:
    /// 100 messages per session, 24 h session age, 15 min sweep interval.
    pub fn new(local: L, guard: Arc<ContentGuard>) -> Self {
        Self {
            local,
            session: MemoryStorage::new(),
            guard,
            limits: HistoryLimits::default(),
        }
    }
}

impl<L: Storage, T: Storage> HistoryBuilder<L, T> {
    /// Use a specific per-tab store instead of a private in-memory one.
    pub fn session_storage<U: Storage>(self, session: U) -> HistoryBuilder<L, U> {
        HistoryBuilder {
            local: self.local,
            session,
            guard: self.guard,
            limits: self.limits,
        }
    }

    /// Maximum number of messages kept per session; oldest are dropped first.
    pub fn max_history_size(mut self, size: usize) -> Self {
        self.limits.max_history_size = size.max(1);
        self
    }

    /// Inactivity after which a session expires.
    pub fn max_session_age(mut self, age: Duration) -> Self {
        self.limits.max_session_age = age;
        self
    }

    /// How often the background sweeper prunes expired sessions.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.limits.sweep_interval = interval;
        self
    }

    /// Build the manager without a background sweeper.
    pub fn build(self) -> Arc<ChatHistoryManager<L, T>> {
        Arc::new(ChatHistoryManager::new(
            self.local,
            self.session,
            self.guard,
            self.limits,
        ))
    }

    /// Build the manager and spawn the expiry sweeper on the current tokio
    /// runtime.
    pub fn build_with_sweeper(self) -> (Arc<ChatHistoryManager<L, T>>, SweeperHandle) {
        let manager = self.build();
        let handle = manager.spawn_sweeper();
        (manager, handle)
    }
}
