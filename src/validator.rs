//! First gate for raw user keystrokes.
//!
//! The validator rejects oversized or blank input, normalizes what it keeps
//! and flags known XSS signatures. Flagging is informational: sanitization
//! downstream is what actually neutralizes markup.

use std::fmt;
use std::sync::LazyLock;

use regex::{Regex, RegexSet};

use crate::config::SecurityConfig;

/// Names of the signatures in [`XSS_SIGNATURES`], index for index.
const XSS_SIGNATURE_NAMES: &[&str] = &[
    "script tag",
    "javascript: URL",
    "vbscript: URL",
    "inline event handler",
    "iframe tag",
    "data:text/html URL",
];

static XSS_SIGNATURES: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"(?i)<\s*script",
        r"(?i)javascript\s*:",
        r"(?i)vbscript\s*:",
        r"(?i)\bon[a-z]+\s*=",
        r"(?i)<\s*iframe",
        r"(?i)data\s*:\s*text/html",
    ])
    .expect("invalid XSS signature pattern")
});

static EXCESS_BLANK_LINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("invalid regex pattern"));

/// Why input was rejected or flagged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationIssue {
    TooLong { len: usize, max: usize },
    Empty,
    /// A known XSS signature was found; the input is still sanitized and kept.
    SuspiciousPattern(&'static str),
}

impl ValidationIssue {
    /// `true` for issues that stop the input from entering the pipeline.
    pub fn is_blocking(&self) -> bool {
        !matches!(self, ValidationIssue::SuspiciousPattern(_))
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationIssue::TooLong { len, max } => {
                write!(f, "Content too long ({len} characters, max {max})")
            }
            ValidationIssue::Empty => write!(f, "Content is empty"),
            ValidationIssue::SuspiciousPattern(name) => {
                write!(f, "Potentially dangerous content detected: {name}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationOutcome {
    pub is_valid: bool,
    /// Normalized input; `None` when a blocking issue short-circuited.
    pub sanitized_input: Option<String>,
    pub errors: Vec<ValidationIssue>,
}

impl ValidationOutcome {
    /// `true` if any issue prevents the input from being used.
    pub fn is_blocked(&self) -> bool {
        self.errors.iter().any(ValidationIssue::is_blocking)
    }
}

#[derive(Debug, Clone)]
pub struct InputValidator {
    max_content_length: usize,
    detect_xss: bool,
}

impl InputValidator {
    pub fn new(config: &SecurityConfig) -> Self {
        Self {
            max_content_length: config.max_content_length(),
            detect_xss: config.enable_xss_protection(),
        }
    }

    /// Validate and normalize a raw input string.
    ///
    /// ```
    /// use chat_guard::{InputValidator, SecurityConfig, ValidationIssue};
    ///
    /// let validator = InputValidator::new(&SecurityConfig::default());
    /// let outcome = validator.validate("  hello\u{0}  ");
    /// assert!(outcome.is_valid);
    /// assert_eq!(outcome.sanitized_input.as_deref(), Some("hello"));
    ///
    /// let outcome = validator.validate("   ");
    /// assert_eq!(outcome.errors, [ValidationIssue::Empty]);
    /// ```
    pub fn validate(&self, input: &str) -> ValidationOutcome {
        let len = input.chars().count();
        if len > self.max_content_length {
            return ValidationOutcome {
                is_valid: false,
                sanitized_input: None,
                errors: vec![ValidationIssue::TooLong {
                    len,
                    max: self.max_content_length,
                }],
            };
        }

        let normalized = normalize(input);
        if normalized.is_empty() {
            return ValidationOutcome {
                is_valid: false,
                sanitized_input: None,
                errors: vec![ValidationIssue::Empty],
            };
        }

        let errors: Vec<ValidationIssue> = if self.detect_xss {
            detect_xss(&normalized)
                .into_iter()
                .map(ValidationIssue::SuspiciousPattern)
                .collect()
        } else {
            Vec::new()
        };

        ValidationOutcome {
            is_valid: errors.is_empty(),
            sanitized_input: Some(normalized),
            errors,
        }
    }
}

/// Names of the XSS signatures found in `input`.
pub fn detect_xss(input: &str) -> Vec<&'static str> {
    XSS_SIGNATURES
        .matches(input)
        .into_iter()
        .map(|i| XSS_SIGNATURE_NAMES[i])
        .collect()
}

/// Normalize line endings, strip null bytes and C0/C1 control characters
/// (newline and tab survive), collapse runs of blank lines and trim.
pub fn normalize(input: &str) -> String {
    let unified = input.replace("\r\n", "\n").replace('\r', "\n");
    let stripped: String = unified
        .chars()
        .filter(|c| *c == '\n' || *c == '\t' || !c.is_control())
        .collect();
    EXCESS_BLANK_LINES
        .replace_all(stripped.trim(), "\n\n")
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator(max: usize) -> InputValidator {
        InputValidator::new(
            &SecurityConfig::builder()
                .max_content_length(max)
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn too_long_short_circuits() {
        let outcome = validator(10).validate(&"a".repeat(11));
        assert!(!outcome.is_valid);
        assert!(outcome.sanitized_input.is_none());
        assert_eq!(outcome.errors, [ValidationIssue::TooLong { len: 11, max: 10 }]);
        assert!(outcome.is_blocked());
    }

    #[test]
    fn length_counts_characters_not_bytes() {
        let outcome = validator(5).validate("éééé");
        assert!(outcome.is_valid);
    }

    #[test]
    fn blank_input_is_empty() {
        for input in ["", "   ", "\n\t \n", "\u{0}\u{7}"] {
            let outcome = validator(100).validate(input);
            assert_eq!(outcome.errors, [ValidationIssue::Empty], "input {input:?}");
            assert!(outcome.is_blocked());
        }
    }

    #[test]
    fn strips_control_characters_but_keeps_newlines_and_tabs() {
        let outcome = validator(100).validate("a\u{0}b\u{1b}[31mc\u{85}d\n\te\r\nf");
        assert_eq!(outcome.sanitized_input.as_deref(), Some("ab[31mcd\n\te\nf"));
    }

    #[test]
    fn collapses_blank_line_runs() {
        let outcome = validator(100).validate("one\n\n\n\n\ntwo");
        assert_eq!(outcome.sanitized_input.as_deref(), Some("one\n\ntwo"));
    }

    #[test]
    fn xss_signatures_flag_but_do_not_block() {
        let outcome = validator(1000).validate("<img src=x onerror=alert(1)>Hello");
        assert!(!outcome.is_valid);
        assert!(!outcome.is_blocked());
        assert_eq!(
            outcome.errors,
            [ValidationIssue::SuspiciousPattern("inline event handler")]
        );
        assert_eq!(
            outcome.sanitized_input.as_deref(),
            Some("<img src=x onerror=alert(1)>Hello")
        );
    }

    #[test]
    fn detects_each_signature() {
        let cases = [
            ("<script>x</script>", "script tag"),
            ("JavaScript:alert(1)", "javascript: URL"),
            ("vbscript:msgbox", "vbscript: URL"),
            ("<div onclick = 'x'>", "inline event handler"),
            ("< iframe src=x>", "iframe tag"),
            ("data:text/html;base64,PHNjcmlwdD4=", "data:text/html URL"),
        ];
        for (input, expected) in cases {
            assert!(detect_xss(input).contains(&expected), "{input} -> {expected}");
        }
    }

    #[test]
    fn plain_text_has_no_signatures() {
        assert!(detect_xss("Comment structurer une équipe commerciale ?").is_empty());
        assert!(detect_xss("the action on the list = done").is_empty());
    }

    #[test]
    fn detection_can_be_disabled() {
        let validator = InputValidator::new(
            &SecurityConfig::builder().xss_protection(false).build().unwrap(),
        );
        let outcome = validator.validate("<script>alert(1)</script>");
        assert!(outcome.is_valid);
        assert!(outcome.errors.is_empty());
    }
}
