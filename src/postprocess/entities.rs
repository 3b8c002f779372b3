use regex::{Regex, RegexBuilder};

use super::markup::{self, Link, Segment};
use super::raw_urls::demote;
use super::{Entity, EntityKind, LinkConfig, LinkContext, Stage};

/// Links the first mention of each entity (quote form, datasheet, current
/// product) and leaves every later mention as plain text.  An existing link
/// to the entity and a plain-text mention both count as a mention.
pub struct EntityLinkStage;

impl Stage for EntityLinkStage {
    fn name(&self) -> &'static str {
        "entities"
    }

    fn apply(&self, text: String, ctx: &LinkContext<'_>) -> String {
        let entities = ctx.entities();
        let mentions = match mention_regex(&entities) {
            Some(re) => re,
            None => return text,
        };
        let mut dedup = Dedup {
            cfg: ctx.cfg,
            mentions: &mentions,
            entities: &entities,
            linked: vec![false; entities.len()],
        };
        markup::rewrite(&text, |seg| dedup.segment(seg))
    }
}

/// Per-answer state: which entities already have their one link.
struct Dedup<'a> {
    cfg: &'a LinkConfig,
    mentions: &'a Regex,
    entities: &'a [Entity],
    linked: Vec<bool>,
}

impl Dedup<'_> {
    fn segment(&mut self, seg: Segment) -> Vec<Segment> {
        match seg {
            Segment::Link(link) => {
                let hit = self
                    .entities
                    .iter()
                    .position(|e| markup::same_target(&link.target, &e.url));
                match hit {
                    Some(idx) if self.linked[idx] => demote(&link.label, self.cfg)
                        .into_iter()
                        .flat_map(|s| self.segment(s))
                        .collect(),
                    Some(idx) => {
                        self.linked[idx] = true;
                        let url = self.entities[idx].url.clone();
                        vec![Segment::Link(Link::new(link.label, url))]
                    }
                    None => vec![Segment::Link(link)],
                }
            }
            Segment::Text(t) => self.link_mentions(&t),
        }
    }

    fn link_mentions(&mut self, text: &str) -> Vec<Segment> {
        let (mentions, entities) = (self.mentions, self.entities);
        let mut out = Vec::new();
        let mut last = 0;
        for caps in mentions.captures_iter(text) {
            let found = (0..entities.len())
                .find_map(|idx| caps.name(&group_name(idx)).map(|m| (idx, m)));
            let (idx, m) = match found {
                Some(hit) => hit,
                None => continue,
            };
            let entity = &entities[idx];
            let is_bare_url = markup::same_target(m.as_str(), &entity.url);
            if !is_bare_url && !standalone(text, m.start(), m.end()) {
                continue;
            }
            let replacement = if !self.linked[idx] {
                self.linked[idx] = true;
                let label = if is_bare_url { entity.label.as_str() } else { m.as_str() };
                Segment::Link(Link::new(label, entity.url.clone()))
            } else if is_bare_url {
                // Left bare, the URL would be linked again on the next pass.
                Segment::Text(entity.label.clone())
            } else {
                continue;
            };
            if m.start() > last {
                out.push(Segment::Text(text[last..m.start()].to_string()));
            }
            out.push(replacement);
            last = m.end();
        }
        if last < text.len() {
            out.push(Segment::Text(text[last..].to_string()));
        }
        out
    }
}

/// Model numbers are runs of letters, digits and hyphens, so a name glued to
/// any of those is part of a longer token (`HLG-240H` inside `HLG-240H-48A`).
fn standalone(text: &str, start: usize, end: usize) -> bool {
    let glued = |c: char| c.is_ascii_alphanumeric() || c == '-';
    !text[..start].chars().next_back().is_some_and(glued)
        && !text[end..].chars().next().is_some_and(glued)
}

fn group_name(idx: usize) -> String {
    format!("e{}", idx)
}

/// One alternation group per entity.  The datasheet's bare URL is listed
/// before its names so a name inside the URL never wins.
fn mention_regex(entities: &[Entity]) -> Option<Regex> {
    let mut groups = Vec::new();
    for (idx, entity) in entities.iter().enumerate() {
        let mut alts = Vec::new();
        if entity.kind == EntityKind::Datasheet {
            alts.push(regex::escape(&entity.url));
        }
        for name in &entity.names {
            let name = name.trim();
            if !name.is_empty() {
                alts.push(format!(r"\b{}\b", regex::escape(name)));
            }
        }
        if !alts.is_empty() {
            groups.push(format!("(?P<{}>{})", group_name(idx), alts.join("|")));
        }
    }
    if groups.is_empty() {
        return None;
    }
    match RegexBuilder::new(&groups.join("|")).case_insensitive(true).build() {
        Ok(re) => Some(re),
        Err(err) => {
            tracing::warn!(
                error = %err,
                "entity mention pattern rejected, skipping entity linking"
            );
            None
        }
    }
}
