//! Splitting answer text into plain runs and link markup.
//!
//! Both HTML anchors and markdown links are recognised.  Rendering always
//! emits the canonical HTML anchor form, so parse/render is stable on its
//! own output.

use once_cell::sync::Lazy;
use regex::Regex;

static LINK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<a\b([^>]*)>(.*?)</a\s*>|\[([^\]\n]*)\]\(([^)\s]*)\)"#).unwrap()
});
static HREF_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\bhref\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>"']+))"#).unwrap()
});
static ABSOLUTE_URL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^https?://[^\s/]+").unwrap());

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Link {
    pub label: String,
    pub target: String,
}

impl Link {
    pub fn new(label: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            target: target.into(),
        }
    }

    pub fn render(&self) -> String {
        format!(
            r#"<a href="{}" target="_blank" rel="noopener">{}</a>"#,
            self.target.trim().replace('"', "%22"),
            self.label
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    Link(Link),
}

/// Split `text` into alternating plain runs and links, in order.
pub fn parse(text: &str) -> Vec<Segment> {
    let mut out = Vec::new();
    let mut last = 0;
    for caps in LINK_RE.captures_iter(text) {
        let whole = match caps.get(0) {
            Some(m) => m,
            None => continue,
        };
        if whole.start() > last {
            out.push(Segment::Text(text[last..whole.start()].to_string()));
        }
        let link = if let Some(label) = caps.get(2) {
            let attrs = caps.get(1).map(|m| m.as_str()).unwrap_or("");
            let target = HREF_RE
                .captures(attrs)
                .and_then(|h| h.get(1).or_else(|| h.get(2)).or_else(|| h.get(3)))
                .map(|m| m.as_str())
                .unwrap_or("");
            Link::new(label.as_str(), target)
        } else {
            let label = caps.get(3).map(|m| m.as_str()).unwrap_or("");
            let target = caps.get(4).map(|m| m.as_str()).unwrap_or("");
            Link::new(label, target)
        };
        out.push(Segment::Link(link));
        last = whole.end();
    }
    if last < text.len() {
        out.push(Segment::Text(text[last..].to_string()));
    }
    out
}

pub fn render(segments: &[Segment]) -> String {
    let mut out = String::new();
    for seg in segments {
        match seg {
            Segment::Text(t) => out.push_str(t),
            Segment::Link(link) => out.push_str(&link.render()),
        }
    }
    out
}

/// Parse, rewrite every segment with `f`, render.
pub fn rewrite<F>(text: &str, mut f: F) -> String
where
    F: FnMut(Segment) -> Vec<Segment>,
{
    let segments: Vec<Segment> = parse(text).into_iter().flat_map(|s| f(s)).collect();
    render(&segments)
}

pub fn is_absolute_url(target: &str) -> bool {
    ABSOLUTE_URL_RE.is_match(target.trim())
}

/// Compare link targets ignoring case, surrounding whitespace and a
/// trailing slash.
pub fn same_target(a: &str, b: &str) -> bool {
    let norm = |s: &str| s.trim().trim_end_matches('/').to_ascii_lowercase();
    norm(a) == norm(b)
}
