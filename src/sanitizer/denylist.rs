//! Deny-list pass: explicitly block known-dangerous elements and attributes.

use std::collections::HashSet;

use ego_tree::NodeId;
use scraper::{Html, Selector};

use super::Sanitizer;
use super::tree::{Disposition, serialize_fragment};

/// Elements that are always removed, content included, whatever the
/// allow-list says.
pub const DENIED_TAGS: &[&str] = &[
    "script", "object", "embed", "link", "style", "meta", "form", "input", "button", "textarea",
    "select", "iframe", "frame", "frameset", "applet",
];

/// Sanitizer that removes every element matched by its CSS selectors and
/// strips event-handler and `style` attributes from everything else.
///
/// It runs after the allow-list so that a widened allow-list can never let a
/// denied construct through.
///
/// # Example
///
/// ```
/// use chat_guard::sanitizer::{DenyListSanitizer, Sanitizer};
///
/// let sanitizer = DenyListSanitizer::default();
/// let html = r#"<p onclick="steal()">Hi</p><form><input name="pwd"></form>"#;
/// assert_eq!(sanitizer.sanitize(html), "<p>Hi</p>");
/// ```
pub struct DenyListSanitizer {
    selectors: Vec<String>,
}

impl DenyListSanitizer {
    /// Create a deny-list from CSS selectors. Invalid selectors are skipped
    /// with a warning.
    pub fn new<I, S>(selectors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            selectors: selectors.into_iter().map(Into::into).collect(),
        }
    }

    fn denied_nodes(&self, document: &Html) -> HashSet<NodeId> {
        let mut denied = HashSet::new();
        for selector_str in &self.selectors {
            let Ok(selector) = Selector::parse(selector_str) else {
                tracing::warn!("Invalid CSS selector: {selector_str}");
                continue;
            };
            denied.extend(document.select(&selector).map(|el| el.id()));
        }
        denied
    }
}

impl Default for DenyListSanitizer {
    fn default() -> Self {
        Self::new(DENIED_TAGS.iter().copied())
    }
}

pub(crate) fn is_denied_attr(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    name.starts_with("on") || name == "style" || name == "formaction" || name == "srcdoc"
}

impl Sanitizer for DenyListSanitizer {
    fn sanitize(&self, html: &str) -> String {
        let document = Html::parse_fragment(html);
        let denied = self.denied_nodes(&document);

        serialize_fragment(&document, |node, el| {
            if denied.contains(&node.id()) {
                return Disposition::Remove;
            }
            let mut attrs: Vec<(String, String)> = el
                .attrs()
                .filter(|(name, _)| !is_denied_attr(name))
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect();
            attrs.sort();
            Disposition::Keep(attrs)
        })
    }
}
