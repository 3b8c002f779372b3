use super::markup::{self, Segment};
use super::raw_urls::demote;
use super::repair::is_malformed;
use super::{LinkContext, Stage};

/// Final sweep: unwraps links with empty or unusable targets that earlier
/// stages let through.
pub struct CleanupStage;

impl Stage for CleanupStage {
    fn name(&self) -> &'static str {
        "cleanup"
    }

    fn apply(&self, text: String, ctx: &LinkContext<'_>) -> String {
        markup::rewrite(&text, |seg| match seg {
            Segment::Link(link)
                if link.target.trim().is_empty() || is_malformed(&link, ctx.cfg, false) =>
            {
                demote(&link.label, ctx.cfg)
            }
            other => vec![other],
        })
    }
}
