//! In-memory record of recent security-relevant events.
//!
//! The [`SecurityMonitor`] is a passive sink: every component logs into it
//! and diagnostics read back from it. It is created once per
//! [`ContentGuard`](crate::ContentGuard) and shared as an `Arc`, so separate
//! guards (and separate tests) never see each other's events.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::config::Environment;

pub const DEFAULT_EVENT_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
        }
    }
}

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventKind {
    /// Input rejected by the validator (too long, empty).
    InputRejected,
    /// Input matched a known XSS signature.
    XssAttempt,
    /// Sanitization refused the content.
    SanitizationFailure,
    /// Content from a trusted-by-contract source still needed sanitizing.
    UntrustedContent,
    UrlRejected,
    ExternalUrl,
    RateLimitExceeded,
    EncryptionFailure,
    DecryptionFailure,
    StorageFailure,
    SessionExpired,
    SessionImported,
    ImportRejected,
}

impl SecurityEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InputRejected => "input_rejected",
            Self::XssAttempt => "xss_attempt",
            Self::SanitizationFailure => "sanitization_failure",
            Self::UntrustedContent => "untrusted_content",
            Self::UrlRejected => "url_rejected",
            Self::ExternalUrl => "external_url",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::EncryptionFailure => "encryption_failure",
            Self::DecryptionFailure => "decryption_failure",
            Self::StorageFailure => "storage_failure",
            Self::SessionExpired => "session_expired",
            Self::SessionImported => "session_imported",
            Self::ImportRejected => "import_rejected",
        }
    }
}

impl fmt::Display for SecurityEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: SecurityEventKind,
    pub severity: Severity,
    pub details: String,
}

/// Hook for shipping high-severity events somewhere outside the process.
pub trait EventReporter: Send + Sync {
    fn report(&self, event: &SecurityEvent);
}

impl EventReporter for Box<dyn EventReporter> {
    fn report(&self, event: &SecurityEvent) {
        (**self).report(event)
    }
}

/// Default reporter: emits the event on the `chat_guard::report` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl EventReporter for TracingReporter {
    fn report(&self, event: &SecurityEvent) {
        tracing::error!(
            target: "chat_guard::report",
            "security event {} ({}): {}",
            event.kind,
            event.severity,
            event.details
        );
    }
}

/// Event counts per severity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventStats {
    pub total: usize,
    pub low: usize,
    pub medium: usize,
    pub high: usize,
}

/// Bounded ring buffer of [`SecurityEvent`]s; the oldest entry is evicted
/// when the buffer is full.
pub struct SecurityMonitor {
    events: Mutex<VecDeque<SecurityEvent>>,
    capacity: usize,
    environment: Environment,
    clock: Arc<dyn Clock>,
    reporter: Box<dyn EventReporter>,
}

impl SecurityMonitor {
    pub fn new(environment: Environment, clock: Arc<dyn Clock>) -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY, environment, clock)
    }

    pub fn with_capacity(capacity: usize, environment: Environment, clock: Arc<dyn Clock>) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            environment,
            clock,
            reporter: Box::new(TracingReporter),
        }
    }

    /// Replace the reporter used for high-severity events in production.
    pub fn with_reporter(mut self, reporter: impl EventReporter + 'static) -> Self {
        self.reporter = Box::new(reporter);
        self
    }

    /// Record an event.
    pub fn log_event(&self, kind: SecurityEventKind, severity: Severity, details: impl Into<String>) {
        let event = SecurityEvent {
            timestamp: self.clock.now(),
            kind,
            severity,
            details: details.into(),
        };

        match self.environment {
            Environment::Development => {
                tracing::info!("[security] {} ({}): {}", event.kind, event.severity, event.details)
            }
            Environment::Production if severity == Severity::High => self.reporter.report(&event),
            _ => tracing::debug!("[security] {} ({})", event.kind, event.severity),
        }

        let mut events = self.events.lock();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Up to `limit` events, newest first.
    pub fn recent_events(&self, limit: usize) -> Vec<SecurityEvent> {
        self.events.lock().iter().rev().take(limit).cloned().collect()
    }

    /// Number of events recorded of the given kind still in the buffer.
    pub fn count_of(&self, kind: SecurityEventKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind == kind).count()
    }

    pub fn stats(&self) -> EventStats {
        self.events
            .lock()
            .iter()
            .fold(EventStats::default(), |mut stats, event| {
                stats.total += 1;
                match event.severity {
                    Severity::Low => stats.low += 1,
                    Severity::Medium => stats.medium += 1,
                    Severity::High => stats.high += 1,
                }
                stats
            })
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl fmt::Debug for SecurityMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityMonitor")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("environment", &self.environment)
            .finish()
    }
}
