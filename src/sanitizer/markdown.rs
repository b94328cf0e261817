//! Markdown variant: markdown syntax is kept as text, embedded HTML goes
//! through the same tag and attribute policy as HTML content.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use scraper::Html;

use super::allowlist::{ALLOWED_TAGS, REMOVED_WITH_CONTENT, filter_attributes, is_safe_uri};
use super::residual::ResidualSanitizer;
use super::tree::escape_attr;
use super::Sanitizer;

const MAX_ROUNDS: usize = 8;

/// One regex per container whose content must disappear with it. The regex
/// crate has no back-references, so the closing tag is spelled out.
static DANGEROUS_BLOCKS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    REMOVED_WITH_CONTENT
        .iter()
        .map(|tag| {
            Regex::new(&format!(r"(?is)<{tag}\b[^>]*>.*?</{tag}\s*>"))
                .expect("invalid regex pattern")
        })
        .collect()
});

static COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<!--.*?(?:-->|$)").expect("invalid regex pattern"));

static AUTOLINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<([a-zA-Z][a-zA-Z0-9+.\-]*:[^\s<>]*)>").expect("invalid regex pattern")
});

static TAG_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<(/?)([a-zA-Z][a-zA-Z0-9-]*)((?:[\s/][^<>]*)?)>").expect("invalid regex pattern")
});

static INLINE_LINK_TARGET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\]\(\s*)(<[^>\n]*>|(?:[^\s()]|\([^\s()]*\))+)").expect("invalid regex pattern")
});

static REFERENCE_DEFINITION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^( {0,3}\[[^\]\n]+\]:[ \t]*)(<[^>\n]*>|\S+)").expect("invalid regex pattern")
});

/// Any `<` that a renderer could read as the start of markup: an autolink,
/// a complete tag, or the opener of a tag that never closes.
static OPENER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("{}|{}|<[a-zA-Z/!?]", AUTOLINK.as_str(), TAG_TOKEN.as_str()))
        .expect("invalid regex pattern")
});

static BACKSLASH_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\([!-/:-@\[-`{-~])").expect("invalid regex pattern"));

/// The destination a renderer would link to: angle brackets stripped,
/// backslash escapes removed and character references decoded.
fn decode_link_target(target: &str) -> String {
    let target = target
        .strip_prefix('<')
        .and_then(|t| t.strip_suffix('>'))
        .unwrap_or(target);
    let unescaped = BACKSLASH_ESCAPE.replace_all(target, "$1");
    let fragment = Html::parse_fragment(&unescaped.replace('<', "&lt;"));
    fragment.root_element().text().collect()
}

fn link_target_is_safe(target: &str) -> bool {
    is_safe_uri(&decode_link_target(target))
}

/// Keep an opener only if it is a safe autolink or a tag already in the
/// exact form [`rebuild_tag`] emits; anything else is escaped to text.
fn settle_opener(caps: &Captures<'_>) -> String {
    let token = &caps[0];
    let intact = if let Some(link) = AUTOLINK.captures(token) {
        is_safe_uri(&link[1])
    } else if let Some(tag) = TAG_TOKEN.captures(token) {
        rebuild_tag(&tag) == token
    } else {
        false
    };
    if intact {
        token.to_string()
    } else {
        format!("&lt;{}", &token[1..])
    }
}

fn rebuild_tag(caps: &Captures<'_>) -> String {
    let closing = !caps[1].is_empty();
    let name = caps[2].to_ascii_lowercase();
    if !ALLOWED_TAGS.contains(&name.as_str()) {
        return String::new();
    }
    if closing {
        return format!("</{name}>");
    }

    // Let the HTML parser decode entities and quoting, then re-apply the
    // attribute policy to what it saw.
    let parsed = Html::parse_fragment(&format!("<span{}>", &caps[3]));
    let attrs = parsed
        .root_element()
        .children()
        .find_map(|node| node.value().as_element().cloned())
        .map(|el| filter_attributes(&name, el.attrs()))
        .unwrap_or_default();

    let mut out = format!("<{name}");
    for (key, value) in &attrs {
        out.push(' ');
        out.push_str(key);
        out.push_str("=\"");
        escape_attr(value, &mut out);
        out.push('"');
    }
    out.push('>');
    out
}

fn round(input: &str) -> String {
    let mut text = DANGEROUS_BLOCKS
        .iter()
        .fold(input.to_string(), |acc, re| re.replace_all(&acc, "").into_owned());

    text = COMMENT.replace_all(&text, "").into_owned();

    text = AUTOLINK
        .replace_all(&text, |caps: &Captures<'_>| {
            if is_safe_uri(&caps[1]) {
                caps[0].to_string()
            } else {
                String::new()
            }
        })
        .into_owned();

    text = TAG_TOKEN.replace_all(&text, rebuild_tag).into_owned();

    text = INLINE_LINK_TARGET
        .replace_all(&text, |caps: &Captures<'_>| {
            if link_target_is_safe(&caps[2]) {
                caps[0].to_string()
            } else {
                format!("{}#", &caps[1])
            }
        })
        .into_owned();

    REFERENCE_DEFINITION
        .replace_all(&text, |caps: &Captures<'_>| {
            if link_target_is_safe(&caps[2]) {
                caps[0].to_string()
            } else {
                format!("{}#", &caps[1])
            }
        })
        .into_owned()
}

/// Sanitizer for markdown text that may embed inline HTML.
///
/// Markdown syntax passes through untouched. Dangerous containers are
/// removed with their content, every other tag is rebuilt from the HTML
/// allow-list (or dropped, keeping its text), and link targets that would
/// execute script once decoded are replaced by `#`. A `<` that still opens
/// markup the rebuild did not produce, such as a tag that is never closed,
/// is escaped to `&lt;`.
///
/// ```
/// use chat_guard::sanitizer::{MarkdownSanitizer, Sanitizer};
///
/// let md = MarkdownSanitizer::default();
/// assert_eq!(
///     md.sanitize("**Bold** [clic](javascript:alert(1)) <b onclick=\"x()\">b</b>"),
///     "**Bold** [clic](#) <b>b</b>"
/// );
/// ```
#[derive(Default)]
pub struct MarkdownSanitizer {
    residual: ResidualSanitizer,
}

impl Sanitizer for MarkdownSanitizer {
    fn sanitize(&self, markdown: &str) -> String {
        let mut current = markdown.to_string();
        for _ in 0..MAX_ROUNDS {
            let next = round(&current);
            if next == current {
                break;
            }
            current = next;
        }
        let cleaned = self.residual.sanitize(&current);
        OPENER.replace_all(&cleaned, settle_opener).into_owned()
    }
}
