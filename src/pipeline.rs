//! The security context: one object wiring validation, sanitization, URL
//! vetting and rate limiting around a shared [`SecurityMonitor`].

use std::sync::Arc;

use scraper::Html;

use crate::clock::{Clock, SystemClock};
use crate::config::SecurityConfig;
use crate::error::{ChatGuardError, Result};
use crate::monitor::{EventReporter, SecurityEventKind, SecurityMonitor, Severity};
use crate::rate_limit::{FixedWindowLimiter, RateLimiter};
use crate::sanitizer::{ContentSanitizer, Disposition, canonical_html, serialize_fragment};
use crate::url_validator::{UrlValidator, UrlVerdict};
use crate::validator::{InputValidator, ValidationIssue, ValidationOutcome};

/// How content is meant to be rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Html,
    Markdown,
}

impl ContentKind {
    /// `true` if sanitizing `original` into `sanitized` removed or rewrote
    /// something a renderer would act on.
    ///
    /// HTML is compared against a parsed and re-serialized copy of the
    /// original, so re-escaping `&` or reordering attributes does not count.
    ///
    /// ```
    /// use chat_guard::ContentKind;
    ///
    /// assert!(!ContentKind::Html.changed("Tom & Jerry", "Tom &amp; Jerry"));
    /// assert!(ContentKind::Html.changed("<b onclick=x()>b</b>", "<b>b</b>"));
    /// assert!(ContentKind::Markdown.changed("Tom & Jerry", "Tom &amp; Jerry"));
    /// ```
    pub fn changed(self, original: &str, sanitized: &str) -> bool {
        if original == sanitized {
            return false;
        }
        match self {
            ContentKind::Html => canonical_html(original) != sanitized,
            ContentKind::Markdown => true,
        }
    }
}

/// Builder for [`ContentGuard`], for callers that need a custom clock, rate
/// limiter or event reporter.
///
/// ```
/// use chat_guard::{ContentGuard, FixedWindowLimiter, ManualClock, SecurityConfig};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let clock = Arc::new(ManualClock::default());
/// let guard = ContentGuard::builder(SecurityConfig::default())
///     .clock(clock.clone())
///     .rate_limiter(FixedWindowLimiter::new(3, Duration::from_secs(10), clock))
///     .build();
/// assert!(!guard.is_rate_limited("tab"));
/// ```
pub struct ContentGuardBuilder {
    config: SecurityConfig,
    clock: Option<Arc<dyn Clock>>,
    limiter: Option<Box<dyn RateLimiter>>,
    reporter: Option<Box<dyn EventReporter>>,
}

impl ContentGuardBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Replace the default fixed-window limiter.
    pub fn rate_limiter(mut self, limiter: impl RateLimiter + 'static) -> Self {
        self.limiter = Some(Box::new(limiter));
        self
    }

    /// Where high-severity events go in production.
    pub fn reporter(mut self, reporter: impl EventReporter + 'static) -> Self {
        self.reporter = Some(Box::new(reporter));
        self
    }

    pub fn build(self) -> ContentGuard {
        let config = self.config;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let mut monitor =
            SecurityMonitor::with_capacity(config.event_capacity(), config.environment(), clock.clone());
        if let Some(reporter) = self.reporter {
            monitor = monitor.with_reporter(reporter);
        }
        let monitor = Arc::new(monitor);

        let limiter = self.limiter.unwrap_or_else(|| {
            Box::new(FixedWindowLimiter::new(
                config.rate_limit_max_attempts(),
                config.rate_limit_window(),
                clock.clone(),
            ))
        });

        ContentGuard {
            validator: InputValidator::new(&config),
            sanitizer: ContentSanitizer::new(&config),
            urls: UrlValidator::new(&config, monitor.clone()),
            limiter,
            monitor,
            clock,
            config,
        }
    }
}

/// Entry point for vetting chat content.
///
/// Owns the [`SecurityMonitor`] every component logs into. Share it as an
/// `Arc`; separate guards keep separate monitors and rate-limit state.
///
/// ```
/// use chat_guard::{ChatGuardError, ContentGuard, ContentKind, SecurityConfig};
///
/// let guard = ContentGuard::new(SecurityConfig::default());
/// let html = guard
///     .process_content("tab-1", "<img src=x onerror=alert(1)>Hello", ContentKind::Html)
///     .unwrap();
/// assert_eq!(html, r#"<img src="x">Hello"#);
///
/// let err = guard.process_content("tab-1", "   ", ContentKind::Html).unwrap_err();
/// assert!(matches!(err, ChatGuardError::Validation(_)));
/// ```
pub struct ContentGuard {
    config: SecurityConfig,
    clock: Arc<dyn Clock>,
    monitor: Arc<SecurityMonitor>,
    validator: InputValidator,
    sanitizer: ContentSanitizer,
    urls: UrlValidator,
    limiter: Box<dyn RateLimiter>,
}

impl ContentGuard {
    /// Guard with the system clock and the configured fixed-window limiter.
    pub fn new(config: SecurityConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: SecurityConfig) -> ContentGuardBuilder {
        ContentGuardBuilder {
            config,
            clock: None,
            limiter: None,
            reporter: None,
        }
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    pub fn monitor(&self) -> &Arc<SecurityMonitor> {
        &self.monitor
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Run untrusted input through the full pipeline: rate-limit gate,
    /// validation, then sanitization for the given rendering `kind`.
    ///
    /// Every failure is logged as a security event before it is returned.
    /// XSS signatures do not fail the call; they are logged and the
    /// sanitizer neutralizes them.
    pub fn process_content(&self, identifier: &str, content: &str, kind: ContentKind) -> Result<String> {
        if !self.limiter.try_acquire(identifier) {
            self.monitor.log_event(
                SecurityEventKind::RateLimitExceeded,
                Severity::Medium,
                format!("Rate limit exceeded for {identifier}"),
            );
            return Err(ChatGuardError::RateLimited);
        }

        let outcome = self.validator.validate(content);
        let (blocking, warnings): (Vec<ValidationIssue>, Vec<ValidationIssue>) = outcome
            .errors
            .into_iter()
            .partition(ValidationIssue::is_blocking);

        if !blocking.is_empty() {
            let err = ChatGuardError::Validation(blocking);
            self.monitor
                .log_event(SecurityEventKind::InputRejected, Severity::Low, err.to_string());
            return Err(err);
        }

        if !warnings.is_empty() {
            let names: Vec<String> = warnings.iter().map(ToString::to_string).collect();
            self.monitor.log_event(
                SecurityEventKind::XssAttempt,
                Severity::High,
                names.join("; "),
            );
        }

        let normalized = outcome.sanitized_input.unwrap_or_default();
        match kind {
            ContentKind::Html => self.sanitize_html(&normalized),
            ContentKind::Markdown => self.sanitize_markdown(&normalized),
        }
    }

    /// Validate and normalize input without sanitizing it.
    pub fn validate_input(&self, input: &str) -> ValidationOutcome {
        self.validator.validate(input)
    }

    pub fn sanitize_html(&self, content: &str) -> Result<String> {
        self.sanitizer
            .sanitize_html(content)
            .inspect_err(|e| self.log_sanitization_failure(e))
    }

    pub fn sanitize_markdown(&self, content: &str) -> Result<String> {
        self.sanitizer
            .sanitize_markdown(content)
            .inspect_err(|e| self.log_sanitization_failure(e))
    }

    /// Sanitize content from a source that is trusted by contract (the
    /// assistant). If sanitization had to change anything the source broke
    /// its contract, which is logged as [`SecurityEventKind::UntrustedContent`].
    pub fn sanitize_untrusted(&self, content: &str, kind: ContentKind) -> Result<String> {
        let sanitized = match kind {
            ContentKind::Html => self.sanitize_html(content)?,
            ContentKind::Markdown => self.sanitize_markdown(content)?,
        };
        if kind.changed(content, &sanitized) {
            self.monitor.log_event(
                SecurityEventKind::UntrustedContent,
                Severity::Medium,
                "Assistant content required sanitization",
            );
        }
        Ok(sanitized)
    }

    pub fn validate_url(&self, url: &str) -> UrlVerdict {
        self.urls.validate(url)
    }

    /// Harden the anchors of already-sanitized HTML.
    ///
    /// `href`s rejected by the URL validator are dropped. Links to external
    /// domains open in a new tab without an opener and carry
    /// `data-external="true"` so the UI can warn before following them.
    ///
    /// ```
    /// use chat_guard::{ContentGuard, SecurityConfig};
    ///
    /// let guard = ContentGuard::new(SecurityConfig::default());
    /// assert_eq!(
    ///     guard.secure_links(r#"<a href="https://example.com">x</a>"#),
    ///     r#"<a data-external="true" href="https://example.com" rel="noopener noreferrer" target="_blank">x</a>"#
    /// );
    /// ```
    pub fn secure_links(&self, html: &str) -> String {
        let document = Html::parse_fragment(html);
        serialize_fragment(&document, |_, el| {
            let mut attrs: Vec<(String, String)> = el
                .attrs()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect();
            if el.name() != "a" {
                attrs.sort();
                return Disposition::Keep(attrs);
            }

            let verdict = el.attr("href").map(|href| self.validate_url(href));
            let external = match &verdict {
                Some(UrlVerdict::Rejected(_)) => {
                    attrs.retain(|(name, _)| name != "href");
                    false
                }
                Some(UrlVerdict::External { .. }) => true,
                _ => false,
            };

            if external {
                attrs.retain(|(name, _)| !matches!(name.as_str(), "target" | "rel" | "data-external"));
                attrs.push(("target".into(), "_blank".into()));
                attrs.push(("data-external".into(), "true".into()));
            }
            if attrs.iter().any(|(name, _)| name == "target") {
                attrs.retain(|(name, _)| name != "rel");
                attrs.push(("rel".into(), "noopener noreferrer".into()));
            }

            attrs.sort_by(|a, b| a.0.cmp(&b.0));
            Disposition::Keep(attrs)
        })
    }

    /// Count a request from `identifier` against the rate limit.
    pub fn is_rate_limited(&self, identifier: &str) -> bool {
        !self.limiter.try_acquire(identifier)
    }

    /// Forget rate-limit windows that have elapsed.
    pub fn purge_rate_limits(&self) -> usize {
        self.limiter.purge_expired()
    }

    fn log_sanitization_failure(&self, err: &ChatGuardError) {
        self.monitor.log_event(
            SecurityEventKind::SanitizationFailure,
            Severity::Medium,
            err.to_string(),
        );
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::clock::ManualClock;

    fn guard_with(config: SecurityConfig) -> (ContentGuard, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        (
            ContentGuard::builder(config).clock(clock.clone()).build(),
            clock,
        )
    }

    fn guard() -> ContentGuard {
        guard_with(SecurityConfig::default()).0
    }

    #[test]
    fn onerror_payload_keeps_text_and_logs_xss() {
        let guard = guard();
        let out = guard
            .process_content("c", "<img src=x onerror=alert(1)>Hello", ContentKind::Markdown)
            .unwrap();
        assert!(out.contains("Hello"));
        assert!(!out.contains("onerror"));
        assert_eq!(guard.monitor().count_of(SecurityEventKind::XssAttempt), 1);
        assert_eq!(guard.monitor().recent_events(1)[0].severity, Severity::High);
    }

    #[test]
    fn clean_input_logs_nothing() {
        let guard = guard();
        let out = guard
            .process_content("c", "  **Bonjour**\r\n\r\n\r\n\r\nça va ?  ", ContentKind::Markdown)
            .unwrap();
        assert_eq!(out, "**Bonjour**\n\nça va ?");
        assert!(guard.monitor().is_empty());
    }

    #[test]
    fn blocking_issues_are_logged_and_returned() {
        let (guard, _) = guard_with(
            SecurityConfig::builder().max_content_length(5).build().unwrap(),
        );
        let err = guard
            .process_content("c", "trop long", ContentKind::Html)
            .unwrap_err();
        match err {
            ChatGuardError::Validation(issues) => {
                assert_eq!(issues, [ValidationIssue::TooLong { len: 9, max: 5 }])
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(guard.monitor().count_of(SecurityEventKind::InputRejected), 1);
    }

    #[test]
    fn rate_limit_gates_the_pipeline() {
        let (guard, clock) = guard_with(
            SecurityConfig::builder()
                .rate_limit(2, Duration::from_secs(60))
                .build()
                .unwrap(),
        );
        for _ in 0..2 {
            guard.process_content("tab", "salut", ContentKind::Html).unwrap();
        }
        let err = guard.process_content("tab", "salut", ContentKind::Html).unwrap_err();
        assert!(matches!(err, ChatGuardError::RateLimited));
        assert_eq!(err.to_string(), "Rate limit exceeded");
        assert_eq!(guard.monitor().count_of(SecurityEventKind::RateLimitExceeded), 1);

        // Other clients are unaffected.
        assert!(guard.process_content("other", "salut", ContentKind::Html).is_ok());

        clock.advance(Duration::from_secs(61));
        assert_eq!(guard.purge_rate_limits(), 2);
        assert!(guard.process_content("tab", "salut", ContentKind::Html).is_ok());
    }

    #[test]
    fn custom_rate_limiter_is_used() {
        struct Never;
        impl RateLimiter for Never {
            fn try_acquire(&self, _: &str) -> bool {
                false
            }
        }
        let guard = ContentGuard::builder(SecurityConfig::default())
            .rate_limiter(Never)
            .build();
        assert!(guard.is_rate_limited("x"));
        assert!(matches!(
            guard.process_content("x", "hi", ContentKind::Html),
            Err(ChatGuardError::RateLimited)
        ));
    }

    #[test]
    fn sanitizer_length_failure_is_logged() {
        let (guard, _) = guard_with(
            SecurityConfig::builder().max_content_length(3).build().unwrap(),
        );
        assert!(matches!(
            guard.sanitize_html("<b>long</b>"),
            Err(ChatGuardError::ContentTooLong { .. })
        ));
        assert_eq!(guard.monitor().count_of(SecurityEventKind::SanitizationFailure), 1);
    }

    #[test]
    fn untrusted_content_is_flagged_only_when_changed() {
        let guard = guard();
        let clean = guard
            .sanitize_untrusted("Voici **trois** étapes.", ContentKind::Markdown)
            .unwrap();
        assert_eq!(clean, "Voici **trois** étapes.");
        assert!(guard.monitor().is_empty());

        let dirty = guard
            .sanitize_untrusted("<script>steal()</script>Réponse", ContentKind::Markdown)
            .unwrap();
        assert_eq!(dirty, "Réponse");
        assert_eq!(guard.monitor().count_of(SecurityEventKind::UntrustedContent), 1);
    }

    #[test]
    fn re_escaping_html_is_not_flagged() {
        let guard = guard();
        for html in [
            "Tom & Jerry",
            "<p title='a' class=\"b\">x < y</p>",
            "<B>gras</B><br/>",
            "<div onmouseover=alert(1)",
        ] {
            guard.sanitize_untrusted(html, ContentKind::Html).unwrap();
        }
        assert!(guard.monitor().is_empty(), "{:?}", guard.monitor().recent_events(5));

        let out = guard
            .sanitize_untrusted("Tom & Jerry<img src=x onerror=alert(1)>", ContentKind::Html)
            .unwrap();
        assert_eq!(out, r#"Tom &amp; Jerry<img src="x">"#);
        assert_eq!(guard.monitor().count_of(SecurityEventKind::UntrustedContent), 1);
    }

    #[test]
    fn secure_links_drops_rejected_hrefs() {
        let guard = guard();
        assert_eq!(
            guard.secure_links(r#"<a href="ftp://x.fr/a">x</a>"#),
            "<a>x</a>"
        );
        assert_eq!(guard.monitor().count_of(SecurityEventKind::UrlRejected), 1);
    }

    #[test]
    fn secure_links_leaves_internal_links_alone() {
        let guard = guard();
        let html = r#"<p class="lead"><a class="cta" href="/contact">Contact</a></p>"#;
        assert_eq!(guard.secure_links(html), html);
    }

    #[test]
    fn secure_links_forces_rel_on_any_target() {
        let guard = guard();
        assert_eq!(
            guard.secure_links(r#"<a href="/x" target="_blank" rel="opener">x</a>"#),
            r#"<a href="/x" rel="noopener noreferrer" target="_blank">x</a>"#
        );
    }

    #[test]
    fn secure_links_overrides_existing_external_attributes() {
        let guard = guard();
        assert_eq!(
            guard.secure_links(r#"<a href="https://evil.example.com" target="_self" data-external="false">x</a>"#),
            r#"<a data-external="true" href="https://evil.example.com" rel="noopener noreferrer" target="_blank">x</a>"#
        );
        assert_eq!(guard.monitor().count_of(SecurityEventKind::ExternalUrl), 1);
    }
}
