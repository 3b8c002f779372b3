use memchr::memmem;
use once_cell::sync::Lazy;
use regex::Regex;

use super::markup::{self, Link, Segment};
use super::{LinkConfig, LinkContext, Stage};

static BARE_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)https?://[^\s<>"'()\[\]]+"#).unwrap());

const TRAILING_PUNCTUATION: &[char] = &['.', ',', ';', ':', '!', '?'];

/// Wraps bare `http(s)://` URLs found outside link markup in a link whose
/// label is guessed from the URL itself.
pub struct RawUrlStage;

impl Stage for RawUrlStage {
    fn name(&self) -> &'static str {
        "raw_urls"
    }

    fn apply(&self, text: String, ctx: &LinkContext<'_>) -> String {
        let lower = text.to_ascii_lowercase();
        if memmem::find(lower.as_bytes(), b"http").is_none() {
            return text;
        }
        markup::rewrite(&text, |seg| match seg {
            Segment::Text(t) => link_bare_urls(&t, ctx.cfg),
            link => vec![link],
        })
    }
}

pub(crate) fn link_bare_urls(text: &str, cfg: &LinkConfig) -> Vec<Segment> {
    let mut out = Vec::new();
    let mut last = 0;
    for m in BARE_URL_RE.find_iter(text) {
        let url = m.as_str().trim_end_matches(TRAILING_PUNCTUATION);
        if !markup::is_absolute_url(url) {
            continue;
        }
        if m.start() > last {
            out.push(Segment::Text(text[last..m.start()].to_string()));
        }
        out.push(Segment::Link(Link::new(label_for(url, cfg), url)));
        last = m.start() + url.len();
    }
    if last < text.len() {
        out.push(Segment::Text(text[last..].to_string()));
    }
    out
}

/// Plain-text replacement for a demoted link.  A URL inside the label is
/// linked straight away so no bare URL survives the stage that demoted it.
pub(crate) fn demote(label: &str, cfg: &LinkConfig) -> Vec<Segment> {
    if memmem::find(label.to_ascii_lowercase().as_bytes(), b"http").is_none() {
        return vec![Segment::Text(label.to_string())];
    }
    link_bare_urls(label, cfg)
}

/// Visible text for a bare URL, sniffed from the URL.
pub fn label_for(url: &str, cfg: &LinkConfig) -> String {
    let lower = url.to_lowercase();
    let host = cfg.site_host().to_lowercase();
    if lower.contains("rfq-form") {
        cfg.quote_label().to_string()
    } else if lower.contains("datasheet") || lower.contains(".pdf") {
        cfg.datasheet_label().to_string()
    } else if !host.is_empty() && lower.contains(&host) {
        "product page".to_string()
    } else {
        "here".to_string()
    }
}
