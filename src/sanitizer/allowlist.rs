//! Allow-list sanitizer: only known-safe tags and attributes survive.

use std::sync::LazyLock;

use ego_tree::NodeRef;
use regex::Regex;
use scraper::Html;
use scraper::node::{Element, Node};

use super::Sanitizer;
use super::tree::{Disposition, serialize_fragment};

/// Tags emitted as-is (with filtered attributes).
pub const ALLOWED_TAGS: &[&str] = &[
    // text formatting
    "p", "br", "strong", "b", "em", "i", "u", "s", "del", "ins", "mark", "small", "sub", "sup",
    "abbr", "cite", "q",
    // headings
    "h1", "h2", "h3", "h4", "h5", "h6",
    // lists
    "ul", "ol", "li", "dl", "dt", "dd",
    // code
    "code", "pre", "kbd", "samp",
    // tables
    "table", "thead", "tbody", "tfoot", "tr", "th", "td", "caption", "colgroup", "col",
    // quotes and rules
    "blockquote", "hr",
    // links and images
    "a", "img",
    // containers
    "div", "span",
];

/// Tags removed together with their content. Everything else that is not
/// allowed is unwrapped so its text stays visible.
///
/// Forms go whole: a fake login form reads as a real one even without its
/// controls.
pub const REMOVED_WITH_CONTENT: &[&str] = &[
    "script", "style", "iframe", "frame", "frameset", "object", "embed", "applet", "noscript",
    "noembed", "noframes", "template", "textarea", "select", "option", "title", "xmp",
    "plaintext", "svg", "math", "head", "form", "button",
];

const ALLOWED_ATTRS: &[&str] = &[
    "class", "id", "colspan", "rowspan", "href", "target", "rel", "alt", "title", "role",
];

const ALLOWED_TARGETS: &[&str] = &["_blank", "_self", "_parent", "_top"];

static SAFE_URI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:(?:https?|mailto|tel):|[^a-z]|[a-z+.\-]+(?:[^a-z+.\-:]|$))")
        .expect("invalid regex pattern")
});

static DATA_IMAGE_URI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^data:image/(?:png|gif|jpe?g|webp|bmp|avif)[;,]")
        .expect("invalid regex pattern")
});

/// `true` if `value` uses `http(s)`, `mailto`, `tel` or no scheme at all.
///
/// Whitespace and control characters are ignored when checking, the same
/// way browsers ignore them when resolving a link.
///
/// ```
/// use chat_guard::sanitizer::is_safe_uri;
///
/// assert!(is_safe_uri("https://example.com"));
/// assert!(is_safe_uri("/contact"));
/// assert!(is_safe_uri("#top"));
/// assert!(!is_safe_uri("javascript:alert(1)"));
/// assert!(!is_safe_uri(" java\tscript:alert(1)"));
/// ```
pub fn is_safe_uri(value: &str) -> bool {
    let compact: String = value
        .chars()
        .filter(|c| !c.is_whitespace() && !c.is_control())
        .collect();
    SAFE_URI.is_match(&compact)
}

fn is_custom_attr_name(name: &str, prefix: &str) -> bool {
    name.strip_prefix(prefix).is_some_and(|rest| {
        !rest.is_empty()
            && rest
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.'))
    })
}

fn is_allowed_attr(tag: &str, name: &str) -> bool {
    if name.starts_with("on") || name == "style" {
        return false;
    }
    if is_custom_attr_name(name, "data-") || is_custom_attr_name(name, "aria-") {
        return true;
    }
    if name == "src" {
        return tag == "img";
    }
    ALLOWED_ATTRS.contains(&name)
}

/// Filter the attributes of a `tag` element down to the allowed set.
///
/// URL-bearing attributes must pass [`is_safe_uri`] (images may also use
/// raster `data:image/*` URIs), anchors with a `target` get
/// `rel="noopener noreferrer"`, and the result is sorted by name so output
/// is deterministic.
pub(crate) fn filter_attributes<'a>(
    tag: &str,
    attrs: impl Iterator<Item = (&'a str, &'a str)>,
) -> Vec<(String, String)> {
    let mut kept: Vec<(String, String)> = Vec::new();

    for (name, value) in attrs {
        let name = name.to_ascii_lowercase();
        if !is_allowed_attr(tag, &name) {
            continue;
        }
        let ok = match name.as_str() {
            "href" => is_safe_uri(value),
            "src" => is_safe_uri(value) || DATA_IMAGE_URI.is_match(value.trim()),
            "target" => ALLOWED_TARGETS.contains(&value.trim().to_ascii_lowercase().as_str()),
            _ => true,
        };
        if ok {
            kept.push((name, value.to_string()));
        }
    }

    if tag == "a" && kept.iter().any(|(name, _)| name == "target") {
        kept.retain(|(name, _)| name != "rel");
        kept.push(("rel".to_string(), "noopener noreferrer".to_string()));
    }

    kept.sort_by(|a, b| a.0.cmp(&b.0));
    kept.dedup_by(|a, b| a.0 == b.0);
    kept
}

pub(crate) fn disposition(_: NodeRef<'_, Node>, el: &Element) -> Disposition {
    let tag = el.name();
    if REMOVED_WITH_CONTENT.contains(&tag) {
        Disposition::Remove
    } else if ALLOWED_TAGS.contains(&tag) {
        Disposition::Keep(filter_attributes(tag, el.attrs()))
    } else {
        Disposition::Unwrap
    }
}

/// Sanitizer that rebuilds the fragment from allowed tags and attributes
/// only.
///
/// Disallowed elements are unwrapped (their text stays), except for
/// script-like containers in [`REMOVED_WITH_CONTENT`], which vanish whole.
///
/// ```
/// use chat_guard::sanitizer::{AllowListSanitizer, Sanitizer};
///
/// let out = AllowListSanitizer.sanitize(r#"<p onclick="x()">Hi <blink>there</blink></p>"#);
/// assert_eq!(out, "<p>Hi there</p>");
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowListSanitizer;

impl Sanitizer for AllowListSanitizer {
    fn sanitize(&self, html: &str) -> String {
        let document = Html::parse_fragment(html);
        serialize_fragment(&document, disposition)
    }
}
