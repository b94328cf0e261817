//! Content sanitizer: strips disallowed HTML and markdown constructs before
//! content is rendered.
//!
//! Sanitizers implement the [`Sanitizer`] trait and are composed into a
//! [`SanitizerPipeline`] that runs them sequentially. [`ContentSanitizer`]
//! wires the built-in passes together for HTML and markdown:
//!
//! - [`AllowListSanitizer`] -- rebuilds the fragment from allowed tags and
//!   attributes.
//! - [`DenyListSanitizer`] -- CSS-selector removal of known-dangerous
//!   elements, applied again after the allow-list.
//! - [`ResidualSanitizer`] -- regex cleanup of anything left over.
//! - [`MarkdownSanitizer`] -- the markdown variant of the above.

mod allowlist;
mod denylist;
mod markdown;
mod residual;
mod tree;

pub use allowlist::{ALLOWED_TAGS, AllowListSanitizer, REMOVED_WITH_CONTENT, is_safe_uri};
pub use denylist::{DENIED_TAGS, DenyListSanitizer};
pub use markdown::MarkdownSanitizer;
pub use residual::ResidualSanitizer;

pub(crate) use tree::{Disposition, canonical_html, serialize_fragment};

use crate::config::SecurityConfig;
use crate::error::{ChatGuardError, Result};

/// Upper bound on full HTML passes. The passes only ever remove markup, so
/// the output settles after one or two.
const MAX_HTML_PASSES: usize = 4;

/// Trait for content sanitizers.
///
/// Each sanitizer receives a string and returns a transformed version.
/// Implementations must be `Send + Sync` so a guard can be shared between
/// tasks.
pub trait Sanitizer: Send + Sync {
    /// Transform the given content, returning the sanitized result.
    fn sanitize(&self, html: &str) -> String;
}

/// An ordered chain of [`Sanitizer`] implementations applied sequentially.
///
/// Each sanitizer receives the output of the previous one. An empty pipeline
/// is a no-op.
pub struct SanitizerPipeline {
    sanitizers: Vec<Box<dyn Sanitizer>>,
}

impl SanitizerPipeline {
    /// Create an empty pipeline.
    pub fn new() -> Self {
        Self {
            sanitizers: Vec::new(),
        }
    }

    /// Allow-list, then deny-list, then residual cleanup.
    pub fn html() -> Self {
        let mut pipeline = Self::new();
        pipeline.add(AllowListSanitizer);
        pipeline.add(DenyListSanitizer::default());
        pipeline.add(ResidualSanitizer);
        pipeline
    }

    /// Append a sanitizer to the end of the pipeline.
    pub fn add(&mut self, sanitizer: impl Sanitizer + 'static) {
        self.sanitizers.push(Box::new(sanitizer));
    }

    /// Run the full pipeline on the given content, returning the final result.
    pub fn sanitize(&self, html: &str) -> String {
        self.sanitizers
            .iter()
            .fold(html.to_string(), |acc, s| s.sanitize(&acc))
    }

    /// Returns `true` if no sanitizers have been added.
    pub fn is_empty(&self) -> bool {
        self.sanitizers.is_empty()
    }
}

impl Default for SanitizerPipeline {
    fn default() -> Self {
        Self::new()
    }
}

/// HTML and markdown sanitization with the configured length guard.
///
/// ```
/// use chat_guard::{ContentSanitizer, SecurityConfig};
///
/// let sanitizer = ContentSanitizer::new(&SecurityConfig::default());
/// let html = sanitizer.sanitize_html("<img src=x onerror=alert(1)>Hello").unwrap();
/// assert_eq!(html, r#"<img src="x">Hello"#);
/// ```
pub struct ContentSanitizer {
    enabled: bool,
    max_content_length: usize,
    html: SanitizerPipeline,
    markdown: MarkdownSanitizer,
}

impl ContentSanitizer {
    pub fn new(config: &SecurityConfig) -> Self {
        Self {
            enabled: config.enable_content_sanitization(),
            max_content_length: config.max_content_length(),
            html: SanitizerPipeline::html(),
            markdown: MarkdownSanitizer::default(),
        }
    }

    /// Sanitize an HTML fragment.
    ///
    /// Fails with [`ChatGuardError::ContentTooLong`] before any parsing when
    /// the content exceeds the configured limit. With sanitization disabled
    /// the content is returned unchanged.
    pub fn sanitize_html(&self, content: &str) -> Result<String> {
        self.check_length(content)?;
        if !self.enabled {
            return Ok(content.to_string());
        }

        let mut current = self.html.sanitize(content);
        for _ in 1..MAX_HTML_PASSES {
            let next = self.html.sanitize(&current);
            if next == current {
                break;
            }
            current = next;
        }
        Ok(current)
    }

    /// Sanitize markdown that may embed inline HTML.
    pub fn sanitize_markdown(&self, content: &str) -> Result<String> {
        self.check_length(content)?;
        if !self.enabled {
            return Ok(content.to_string());
        }
        Ok(self.markdown.sanitize(content))
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn check_length(&self, content: &str) -> Result<()> {
        let len = content.chars().count();
        if len > self.max_content_length {
            return Err(ChatGuardError::ContentTooLong {
                len,
                max: self.max_content_length,
            });
        }
        Ok(())
    }
}
