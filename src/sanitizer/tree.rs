//! Re-serialization of a parsed HTML fragment under an element policy.

use ego_tree::NodeRef;
use scraper::Html;
use scraper::node::{Element, Node};

/// HTML5 void elements that must not have a closing tag.
const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];

/// What to do with an element while serializing.
pub(crate) enum Disposition {
    /// Emit the element with exactly these attributes, in this order.
    Keep(Vec<(String, String)>),
    /// Drop the element's tags but serialize its children.
    Unwrap,
    /// Drop the element and everything inside it.
    Remove,
}

/// Serialize the content of a fragment parsed with [`Html::parse_fragment`].
///
/// Text is escaped, comments, doctypes and processing instructions are
/// dropped, and each element is handled according to `decide`.
pub(crate) fn serialize_fragment<F>(document: &Html, decide: F) -> String
where
    F: Fn(NodeRef<'_, Node>, &Element) -> Disposition,
{
    let mut out = String::new();
    for child in document.root_element().children() {
        serialize_node(child, &decide, &mut out);
    }
    out
}

/// Parse `html` and write it back out unfiltered, with attributes sorted.
///
/// Two fragments with the same canonical form render the same, so this is
/// what sanitizer output is compared against to tell whether anything was
/// really removed.
pub(crate) fn canonical_html(html: &str) -> String {
    serialize_fragment(&Html::parse_fragment(html), keep_all)
}

fn keep_all(_: NodeRef<'_, Node>, el: &Element) -> Disposition {
    let mut attrs: Vec<(String, String)> = el
        .attrs()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    attrs.sort();
    Disposition::Keep(attrs)
}

fn serialize_node<F>(node: NodeRef<'_, Node>, decide: &F, out: &mut String)
where
    F: Fn(NodeRef<'_, Node>, &Element) -> Disposition,
{
    match node.value() {
        Node::Document | Node::Fragment => {
            for child in node.children() {
                serialize_node(child, decide, out);
            }
        }
        Node::Element(el) => match decide(node, el) {
            Disposition::Remove => {}
            Disposition::Unwrap => {
                for child in node.children() {
                    serialize_node(child, decide, out);
                }
            }
            Disposition::Keep(attrs) => {
                let tag = el.name();
                out.push('<');
                out.push_str(tag);
                for (k, v) in &attrs {
                    out.push(' ');
                    out.push_str(k);
                    out.push_str("=\"");
                    escape_attr(v, out);
                    out.push('"');
                }
                out.push('>');

                if VOID_ELEMENTS.contains(&tag) {
                    return;
                }

                // The parser swallows one newline right after <pre>.
                if tag == "pre"
                    && node
                        .first_child()
                        .and_then(|c| c.value().as_text().map(|t| t.starts_with('\n')))
                        .unwrap_or(false)
                {
                    out.push('\n');
                }

                for child in node.children() {
                    serialize_node(child, decide, out);
                }

                out.push_str("</");
                out.push_str(tag);
                out.push('>');
            }
        },
        Node::Text(text) => escape_text(text, out),
        _ => {}
    }
}

pub(crate) fn escape_text(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\u{a0}' => out.push_str("&nbsp;"),
            _ => out.push(c),
        }
    }
}

pub(crate) fn escape_attr(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\u{a0}' => out.push_str("&nbsp;"),
            _ => out.push(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_wrapper_is_not_emitted() {
        let doc = Html::parse_fragment("<p>Hello</p>");
        assert_eq!(serialize_fragment(&doc, keep_all), "<p>Hello</p>");
    }

    #[test]
    fn text_is_re_escaped() {
        let doc = Html::parse_fragment("<p>&lt;script&gt; &amp; co</p>");
        assert_eq!(
            serialize_fragment(&doc, keep_all),
            "<p>&lt;script&gt; &amp; co</p>"
        );
    }

    #[test]
    fn attribute_quotes_are_escaped() {
        let doc = Html::parse_fragment(r#"<span title='say "hi"'>x</span>"#);
        assert_eq!(
            serialize_fragment(&doc, keep_all),
            r#"<span title="say &quot;hi&quot;">x</span>"#
        );
    }

    #[test]
    fn void_elements_have_no_closing_tag() {
        let doc = Html::parse_fragment("a<br>b<hr>");
        assert_eq!(serialize_fragment(&doc, keep_all), "a<br>b<hr>");
    }

    #[test]
    fn comments_are_dropped() {
        let doc = Html::parse_fragment("<p>a<!-- hidden -->b</p>");
        assert_eq!(serialize_fragment(&doc, keep_all), "<p>ab</p>");
    }

    #[test]
    fn unwrap_and_remove() {
        let doc = Html::parse_fragment("<div><b>keep</b><i>gone</i></div>");
        let out = serialize_fragment(&doc, |_, el| match el.name() {
            "div" => Disposition::Unwrap,
            "i" => Disposition::Remove,
            _ => Disposition::Keep(Vec::new()),
        });
        assert_eq!(out, "<b>keep</b>");
    }

    #[test]
    fn pre_leading_newline_survives_a_round_trip() {
        let doc = Html::parse_fragment("<pre>\n\ncode</pre>");
        let once = serialize_fragment(&doc, keep_all);
        let twice = serialize_fragment(&Html::parse_fragment(&once), keep_all);
        assert_eq!(once, twice);
    }

    #[test]
    fn canonical_form_normalises_escaping_and_attribute_order() {
        assert_eq!(canonical_html("Tom & Jerry"), "Tom &amp; Jerry");
        assert_eq!(
            canonical_html("<a title='t' href=\"/x\">x</a>"),
            r#"<a href="/x" title="t">x</a>"#
        );
        assert_eq!(canonical_html("<B>gras</b><br/>"), "<b>gras</b><br>");
    }

    #[test]
    fn canonical_form_keeps_dangerous_markup() {
        assert_eq!(
            canonical_html("<img src=x onerror=alert(1)>"),
            r#"<img onerror="alert(1)" src="x">"#
        );
        assert_eq!(canonical_html("<div onmouseover=alert(1)"), "");
    }
}
