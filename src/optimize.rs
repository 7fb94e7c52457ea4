use std::sync::OnceLock;

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use regex::Regex;
use tracing::warn;

use crate::settings::Settings;

const XML_DECL: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;

/// Attributes whose bare numeric values are rounded alongside path data.
const ROUND_ATTRS: &[&str] = &[
    "x", "y", "x1", "y1", "x2", "y2", "cx", "cy", "r", "rx", "ry", "width", "height",
];

fn number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)-?\d+\.?\d*(?:e[+-]?\d+)?").expect("valid number regex"))
}

fn comment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<!--.*?-->").expect("valid comment regex"))
}

fn whitespace_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("valid whitespace regex"))
}

// ── Element tree ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
struct Element {
    name: String,
    attrs: Vec<(String, String)>,
    children: Vec<Node>,
}

impl Element {
    fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn set_attr(&mut self, key: &str, value: String) {
        if let Some(slot) = self.attrs.iter_mut().find(|(k, _)| k == key) {
            slot.1 = value;
        } else {
            self.attrs.push((key.to_string(), value));
        }
    }
}

/// Parse an SVG document into an element tree. Whitespace-only text is
/// dropped so sibling walks see elements the way the transforms expect.
/// Returns `None` on malformed input.
fn parse_tree(svg: &str) -> Option<Element> {
    let mut reader = Reader::from_str(svg);
    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                stack.push(element_from(&start)?);
            }
            Ok(Event::Empty(start)) => {
                let el = element_from(&start)?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(Node::Element(el)),
                    None if root.is_none() => root = Some(el),
                    None => return None,
                }
            }
            Ok(Event::End(_)) => {
                let el = stack.pop()?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(Node::Element(el)),
                    None if root.is_none() => root = Some(el),
                    None => return None,
                }
            }
            Ok(Event::Text(text)) => {
                let text = text.decode().ok()?.into_owned();
                if !text.trim().is_empty() {
                    stack.last_mut()?.children.push(Node::Text(text));
                }
            }
            Ok(Event::CData(data)) => {
                let text = String::from_utf8(data.into_inner().into_owned()).ok()?;
                stack.last_mut()?.children.push(Node::Text(text));
            }
            Ok(Event::Eof) => break,
            // Declarations, comments, PIs and the like carry nothing the
            // transforms need.
            Ok(_) => {}
            Err(_) => return None,
        }
    }

    if !stack.is_empty() {
        return None;
    }
    root
}

fn element_from(start: &BytesStart) -> Option<Element> {
    let name = String::from_utf8(start.name().as_ref().to_vec()).ok()?;
    let mut attrs = Vec::new();
    for attr in start.attributes() {
        let attr = attr.ok()?;
        let key = String::from_utf8(attr.key.as_ref().to_vec()).ok()?;
        let value = attr.unescape_value().ok()?.into_owned();
        attrs.push((key, value));
    }
    Some(Element {
        name,
        attrs,
        children: Vec::new(),
    })
}

fn serialize_body(root: &Element) -> String {
    let mut writer = Writer::new(Vec::new());
    write_element(&mut writer, root);
    String::from_utf8(writer.into_inner()).unwrap_or_default()
}

fn write_element(writer: &mut Writer<Vec<u8>>, el: &Element) {
    let mut start = BytesStart::new(el.name.as_str());
    for (k, v) in &el.attrs {
        start.push_attribute((k.as_str(), v.as_str()));
    }
    if el.children.is_empty() {
        let _ = writer.write_event(Event::Empty(start));
        return;
    }
    let _ = writer.write_event(Event::Start(start));
    for child in &el.children {
        match child {
            Node::Element(e) => write_element(writer, e),
            Node::Text(t) => {
                let _ = writer.write_event(Event::Text(BytesText::new(t)));
            }
        }
    }
    let _ = writer.write_event(Event::End(BytesEnd::new(el.name.as_str())));
}

// ── Entry point ───────────────────────────────────────────────────────────

/// Optimize an assembled SVG document.
///
/// Comment stripping and minification are string passes; the remaining
/// transforms operate on the parsed tree. When the document does not
/// parse, the tree transforms are skipped and only minification applies.
pub fn optimize_svg(svg: &str, settings: &Settings) -> String {
    if svg.is_empty() {
        return svg.to_string();
    }

    let mut svg = svg.to_string();
    if settings.remove_comments {
        svg = comment_re().replace_all(&svg, "").into_owned();
    }

    let Some(mut root) = parse_tree(&svg) else {
        warn!("SVG failed to parse, skipping tree optimizations");
        if settings.minify {
            return minify(&svg);
        }
        return svg;
    };

    if settings.round_coords {
        round_coordinates(&mut root);
    }
    if settings.collapse_groups {
        collapse_groups(&mut root);
    }
    if settings.merge_paths {
        merge_paths(&mut root);
    }
    if settings.optimize_viewbox {
        ensure_viewbox(&mut root);
    }

    let out = format!("{XML_DECL}\n{}", serialize_body(&root));
    if settings.minify {
        minify(&out)
    } else {
        out
    }
}

// ── Transforms ────────────────────────────────────────────────────────────

/// Round to two decimals and strip trailing zeros (and a trailing dot).
fn trim_number(value: f64) -> String {
    let s = format!("{value:.2}");
    let s = s.trim_end_matches('0').trim_end_matches('.');
    s.to_string()
}

fn round_numbers_in(text: &str) -> String {
    number_re()
        .replace_all(text, |caps: &regex::Captures<'_>| {
            match caps[0].parse::<f64>() {
                Ok(v) => trim_number(v),
                Err(_) => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Round path data and the bare numeric attributes everywhere in the tree.
fn round_coordinates(el: &mut Element) {
    for (key, value) in el.attrs.iter_mut() {
        if key == "d" {
            *value = round_numbers_in(value);
        } else if ROUND_ATTRS.contains(&key.as_str()) {
            if let Ok(v) = value.parse::<f64>() {
                *value = trim_number(v);
            }
        }
    }
    for child in &mut el.children {
        if let Node::Element(e) = child {
            round_coordinates(e);
        }
    }
}

/// Collapse `<g>` elements that carry no attributes besides `id`: empty
/// groups are deleted, populated ones are spliced into their parent.
/// Iterates to a fixed point.
fn collapse_groups(root: &mut Element) {
    while collapse_pass(root) {}
}

fn collapse_pass(el: &mut Element) -> bool {
    let mut changed = false;
    let mut i = 0;
    while i < el.children.len() {
        let collapsible = matches!(
            &el.children[i],
            Node::Element(g) if g.name == "g" && g.attrs.iter().all(|(k, _)| k == "id")
        );
        if collapsible {
            let Node::Element(group) = el.children.remove(i) else {
                unreachable!("checked above");
            };
            el.children.splice(i..i, group.children);
            changed = true;
            // Re-examine position i: the splice may expose another group.
        } else {
            if let Node::Element(child) = &mut el.children[i] {
                changed |= collapse_pass(child);
            }
            i += 1;
        }
    }
    changed
}

/// Merge consecutive `<path>` siblings sharing `fill` and `fill-rule` by
/// concatenating their path data; the same position is re-checked after
/// each merge.
fn merge_paths(el: &mut Element) {
    let mut i = 0;
    while i + 1 < el.children.len() {
        let mergeable = match (&el.children[i], &el.children[i + 1]) {
            (Node::Element(a), Node::Element(b)) if a.name == "path" && b.name == "path" => {
                let fill = a.attr("fill").unwrap_or("");
                !fill.is_empty()
                    && fill == b.attr("fill").unwrap_or("")
                    && a.attr("fill-rule").unwrap_or("") == b.attr("fill-rule").unwrap_or("")
            }
            _ => false,
        };
        if mergeable {
            let Node::Element(second) = el.children.remove(i + 1) else {
                unreachable!("checked above");
            };
            let d_second = second.attr("d").unwrap_or("").to_string();
            if let Node::Element(first) = &mut el.children[i] {
                let merged = format!("{} {}", first.attr("d").unwrap_or(""), d_second);
                first.set_attr("d", merged.trim().to_string());
            }
        } else {
            i += 1;
        }
    }
    for child in &mut el.children {
        if let Node::Element(e) = child {
            merge_paths(e);
        }
    }
}

/// Synthesize a `viewBox` on the root when only `width`/`height` exist.
fn ensure_viewbox(root: &mut Element) {
    if root.attr("viewBox").is_some() {
        return;
    }
    let (Some(w), Some(h)) = (root.attr("width"), root.attr("height")) else {
        return;
    };
    let (Ok(w), Ok(h)) = (w.parse::<f64>(), h.parse::<f64>()) else {
        return;
    };
    root.set_attr("viewBox", format!("0 0 {} {}", trim_number(w), trim_number(h)));
}

/// Collapse all whitespace to single spaces and remove it next to `<`,
/// `>`, and `=`.
fn minify(svg: &str) -> String {
    static GT: OnceLock<Regex> = OnceLock::new();
    static LT: OnceLock<Regex> = OnceLock::new();
    static EQ: OnceLock<Regex> = OnceLock::new();
    let gt = GT.get_or_init(|| Regex::new(r"\s*>\s*").expect("valid regex"));
    let lt = LT.get_or_init(|| Regex::new(r"\s*<\s*").expect("valid regex"));
    let eq = EQ.get_or_init(|| Regex::new(r"\s*=\s*").expect("valid regex"));

    let s = svg.replace(['\n', '\r', '\t'], " ");
    let s = whitespace_re().replace_all(&s, " ");
    let s = gt.replace_all(&s, ">");
    let s = lt.replace_all(&s, "<");
    let s = eq.replace_all(&s, "=");
    s.trim().to_string()
}
