//! Last-chance cleanup over already-sanitized output.
//!
//! Catches constructs a tree sanitizer can let through in edge cases: stray
//! script tags, CSS `expression(...)`, `@import` rules and `data:` URIs that
//! are not raster images.

use std::sync::LazyLock;

use regex::{Captures, Regex};

use super::Sanitizer;

/// Upper bound on cleanup rounds; each round can only shrink the input.
const MAX_ROUNDS: usize = 8;

/// Constructs deleted outright, in this order: whole script blocks, then
/// stray script tags, CSS `expression(` and `@import` rules.
static REMOVED: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?is)<script\b[^>]*>.*?</script\s*>",
        r"(?i)</?script\b[^>]*>?",
        r"(?i)expression\s*\(",
        r#"(?i)@import\b[^;\n<>"']*;?"#,
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("invalid regex pattern"))
    .collect()
});

static DATA_URI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\bdata:\s*([a-z0-9.+\-]+/[a-z0-9.+\-]+)?[^\s"'<>]*"#)
        .expect("invalid regex pattern")
});

fn is_raster_image(mime: &str) -> bool {
    let mime = mime.to_ascii_lowercase();
    mime.starts_with("image/") && !mime.contains("svg")
}

fn round(input: &str) -> String {
    let cleaned = REMOVED
        .iter()
        .fold(input.to_string(), |acc, re| re.replace_all(&acc, "").into_owned());
    DATA_URI
        .replace_all(&cleaned, |caps: &Captures<'_>| match caps.get(1) {
            Some(mime) if is_raster_image(mime.as_str()) => caps[0].to_string(),
            _ => String::new(),
        })
        .into_owned()
}

/// Regex pass removing residual executable constructs, repeated until the
/// output stops changing so removals cannot splice a new match together.
///
/// ```
/// use chat_guard::sanitizer::{ResidualSanitizer, Sanitizer};
///
/// assert_eq!(ResidualSanitizer.sanitize("x<scr<script>ipt>y"), "xy");
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct ResidualSanitizer;

impl Sanitizer for ResidualSanitizer {
    fn sanitize(&self, html: &str) -> String {
        let mut current = html.to_string();
        for _ in 0..MAX_ROUNDS {
            let next = round(&current);
            if next == current {
                break;
            }
            current = next;
        }
        current
    }
}
