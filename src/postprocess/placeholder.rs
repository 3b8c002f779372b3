use memchr::memmem;
use regex::Regex;

use super::markup::{self, Segment};
use super::raw_urls::demote;
use super::{LinkConfig, LinkContext, Stage};

/// Substitutes the datasheet placeholder token with the datasheet URL when
/// one is known.  Without a URL, links to the token are unwrapped to their
/// label and bare tokens are dropped, so entity linking sees the final text.
pub struct PlaceholderStage;

impl Stage for PlaceholderStage {
    fn name(&self) -> &'static str {
        "placeholder"
    }

    fn apply(&self, text: String, ctx: &LinkContext<'_>) -> String {
        let token = ctx.cfg.datasheet_placeholder.as_str();
        if token.is_empty() || memmem::find(text.as_bytes(), token.as_bytes()).is_none() {
            return text;
        }
        match &ctx.datasheet_url {
            Some(url) => text.replace(token, url),
            None => drop_placeholder(&text, token, ctx.cfg),
        }
    }
}

fn drop_placeholder(text: &str, token: &str, cfg: &LinkConfig) -> String {
    let bare = match Regex::new(&format!(r"[ \t]?{}", regex::escape(token))) {
        Ok(re) => re,
        Err(_) => return text.to_string(),
    };
    markup::rewrite(text, |seg| match seg {
        Segment::Link(link) if link.target.trim() == token => {
            tracing::debug!("no datasheet url, unwrapping placeholder link");
            demote(bare.replace_all(&link.label, "").trim(), cfg)
        }
        Segment::Text(t) => vec![Segment::Text(bare.replace_all(&t, "").into_owned())],
        other => vec![other],
    })
}
