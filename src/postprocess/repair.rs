use super::markup::{self, Link, Segment};
use super::raw_urls::demote;
use super::{LinkConfig, LinkContext, Stage};

/// Demotes link markup that must not survive to plain text, keeping the
/// visible label.  The datasheet placeholder is tolerated as a target here
/// because the next stage substitutes it.
pub struct RepairStage;

impl Stage for RepairStage {
    fn name(&self) -> &'static str {
        "repair"
    }

    fn apply(&self, text: String, ctx: &LinkContext<'_>) -> String {
        markup::rewrite(&text, |seg| match seg {
            Segment::Link(link) if is_malformed(&link, ctx.cfg, true) => {
                tracing::debug!(target_url = %link.target, "demoting malformed link");
                demote(&link.label, ctx.cfg)
            }
            other => vec![other],
        })
    }
}

/// A link is malformed when its label is disallowed or its target is not a
/// fully-qualified http(s) URL.
pub(crate) fn is_malformed(link: &Link, cfg: &LinkConfig, allow_placeholder: bool) -> bool {
    if cfg.label_is_disallowed(&link.label) {
        return true;
    }
    let target = link.target.trim();
    let placeholder = cfg.datasheet_placeholder.as_str();
    if allow_placeholder && !placeholder.is_empty() && target == placeholder {
        return false;
    }
    !markup::is_absolute_url(target)
}
