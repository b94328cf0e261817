//! Protocol and domain vetting for outbound links.

use std::fmt;
use std::sync::Arc;

use url::Url;

use crate::config::SecurityConfig;
use crate::monitor::{SecurityEventKind, SecurityMonitor, Severity};

const ALLOWED_SCHEMES: &[&str] = &["http", "https", "mailto", "tel"];

/// Substrings that reject a URL before it is even parsed. Checked on the
/// lowercased URL with whitespace and control characters removed.
const DANGEROUS_PATTERNS: &[&str] = &["javascript:", "vbscript:", "data:text/html"];

/// Why a URL was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlRejection {
    InvalidProtocol(String),
    DangerousPattern(&'static str),
    MalformedUrl,
}

impl fmt::Display for UrlRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UrlRejection::InvalidProtocol(scheme) => write!(f, "Invalid protocol: {scheme}"),
            UrlRejection::DangerousPattern(pattern) => {
                write!(f, "Dangerous pattern detected: {pattern}")
            }
            UrlRejection::MalformedUrl => write!(f, "Malformed URL"),
        }
    }
}

/// Outcome of [`UrlValidator::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlVerdict {
    /// Safe scheme, and for web links a host on the allow-list.
    Allowed { url: String },
    /// Valid web link to a host outside the allow-list. Renderable, but the
    /// UI should warn before following it.
    External { url: String, host: String },
    Rejected(UrlRejection),
}

impl UrlVerdict {
    pub fn is_valid(&self) -> bool {
        !matches!(self, UrlVerdict::Rejected(_))
    }

    pub fn is_external(&self) -> bool {
        matches!(self, UrlVerdict::External { .. })
    }

    /// The normalized, absolute URL for valid verdicts.
    pub fn sanitized_url(&self) -> Option<&str> {
        match self {
            UrlVerdict::Allowed { url } | UrlVerdict::External { url, .. } => Some(url),
            UrlVerdict::Rejected(_) => None,
        }
    }

    /// Human-readable reason for rejections and external-domain warnings.
    pub fn reason(&self) -> Option<String> {
        match self {
            UrlVerdict::Allowed { .. } => None,
            UrlVerdict::External { host, .. } => Some(format!("External domain: {host}")),
            UrlVerdict::Rejected(rejection) => Some(rejection.to_string()),
        }
    }
}

pub struct UrlValidator {
    enabled: bool,
    allowed_domains: Vec<String>,
    base: Option<Url>,
    monitor: Arc<SecurityMonitor>,
}

impl UrlValidator {
    pub fn new(config: &SecurityConfig, monitor: Arc<SecurityMonitor>) -> Self {
        Self {
            enabled: config.enable_url_validation(),
            allowed_domains: config.allowed_domains().to_vec(),
            base: Url::parse(config.site_origin()).ok(),
            monitor,
        }
    }

    /// Check a link target.
    ///
    /// Relative references resolve against the configured site origin.
    /// Rejections are logged as medium-severity events, external domains as
    /// low-severity ones.
    ///
    /// ```
    /// use chat_guard::{ContentGuard, SecurityConfig};
    ///
    /// let guard = ContentGuard::new(SecurityConfig::default());
    /// assert!(!guard.validate_url("javascript:alert(1)").is_valid());
    ///
    /// let own = guard.validate_url("https://laurent-serre-developpement.fr/x");
    /// assert!(own.is_valid() && own.reason().is_none());
    ///
    /// let other = guard.validate_url("https://evil.example.com");
    /// assert!(other.is_valid() && other.reason().is_some());
    /// ```
    pub fn validate(&self, url: &str) -> UrlVerdict {
        let trimmed = url.trim();
        if !self.enabled {
            return UrlVerdict::Allowed {
                url: trimmed.to_string(),
            };
        }

        let verdict = self.check(trimmed);
        match &verdict {
            UrlVerdict::Rejected(rejection) => self.monitor.log_event(
                SecurityEventKind::UrlRejected,
                Severity::Medium,
                format!("{rejection}: {}", truncate(trimmed)),
            ),
            UrlVerdict::External { host, .. } => self.monitor.log_event(
                SecurityEventKind::ExternalUrl,
                Severity::Low,
                format!("External domain: {host}"),
            ),
            UrlVerdict::Allowed { .. } => {}
        }
        verdict
    }

    fn check(&self, url: &str) -> UrlVerdict {
        let compact: String = url
            .chars()
            .filter(|c| !c.is_whitespace() && !c.is_control())
            .collect::<String>()
            .to_ascii_lowercase();
        if let Some(pattern) = DANGEROUS_PATTERNS.iter().find(|p| compact.contains(*p)) {
            return UrlVerdict::Rejected(UrlRejection::DangerousPattern(pattern));
        }

        if url.is_empty() {
            return UrlVerdict::Rejected(UrlRejection::MalformedUrl);
        }

        let parsed = match Url::parse(url) {
            Ok(parsed) => parsed,
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                match self.base.as_ref().map(|base| base.join(url)) {
                    Some(Ok(parsed)) => parsed,
                    _ => return UrlVerdict::Rejected(UrlRejection::MalformedUrl),
                }
            }
            Err(_) => return UrlVerdict::Rejected(UrlRejection::MalformedUrl),
        };

        let scheme = parsed.scheme();
        if !ALLOWED_SCHEMES.contains(&scheme) {
            return UrlVerdict::Rejected(UrlRejection::InvalidProtocol(scheme.to_string()));
        }

        if scheme == "mailto" || scheme == "tel" {
            return UrlVerdict::Allowed {
                url: parsed.to_string(),
            };
        }

        let Some(host) = parsed.host_str().filter(|h| !h.is_empty()) else {
            return UrlVerdict::Rejected(UrlRejection::MalformedUrl);
        };

        if self.is_allowed_domain(host) {
            UrlVerdict::Allowed {
                url: parsed.to_string(),
            }
        } else {
            UrlVerdict::External {
                host: host.to_string(),
                url: parsed.to_string(),
            }
        }
    }

    /// Exact match or subdomain of an allowed domain.
    pub fn is_allowed_domain(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.allowed_domains.iter().any(|domain| {
            host == *domain
                || host
                    .strip_suffix(domain.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }
}

fn truncate(url: &str) -> String {
    const MAX: usize = 120;
    if url.chars().count() <= MAX {
        url.to_string()
    } else {
        let mut short: String = url.chars().take(MAX).collect();
        short.push('…');
        short
    }
}
