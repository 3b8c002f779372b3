use regex::RegexBuilder;

use super::markup::{self, Segment};
use super::{LinkContext, PhraseSubstitution, Stage};

/// Applies the configured phrase substitutions to plain text.  Link labels
/// are left as written.  Runs before entity linking so that an entity name
/// introduced by a substitution is linked like any other mention.
pub struct PhraseStage;

impl Stage for PhraseStage {
    fn name(&self) -> &'static str {
        "phrases"
    }

    fn apply(&self, text: String, ctx: &LinkContext<'_>) -> String {
        let substitutions = compile(&ctx.cfg.phrase_substitutions);
        if substitutions.is_empty() {
            return text;
        }
        markup::rewrite(&text, |seg| match seg {
            Segment::Text(mut t) => {
                for (re, to) in &substitutions {
                    t = re.replace_all(&t, regex::NoExpand(to)).into_owned();
                }
                vec![Segment::Text(t)]
            }
            link => vec![link],
        })
    }
}

fn compile(subs: &[PhraseSubstitution]) -> Vec<(regex::Regex, &str)> {
    subs.iter()
        .filter(|s| !s.from.trim().is_empty())
        .filter_map(|s| {
            RegexBuilder::new(&regex::escape(&s.from))
                .case_insensitive(true)
                .build()
                .ok()
                .map(|re| (re, s.to.as_str()))
        })
        .collect()
}
