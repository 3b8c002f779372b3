//! Rewriting of raw model answers before display.
//!
//! Each stage is a pure text transformation.  Stages run in a fixed order
//! and the order matters: bare URLs must be linked before malformed links
//! are repaired, and every stage that can add or remove a mention (link
//! repair, placeholder handling, phrase substitution) runs before entity
//! deduplication.  Running the whole pipeline on its own output changes
//! nothing.

use std::sync::Arc;

use serde::Deserialize;

pub mod cleanup;
pub mod entities;
pub mod markup;
pub mod phrases;
pub mod placeholder;
pub mod raw_urls;
pub mod repair;

use self::cleanup::CleanupStage;
use self::entities::EntityLinkStage;
use self::phrases::PhraseStage;
use self::placeholder::PlaceholderStage;
use self::raw_urls::RawUrlStage;
use self::repair::RepairStage;

/// A case-insensitive literal phrase replacement applied to plain text.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct PhraseSubstitution {
    pub from: String,
    pub to: String,
}

/// Link rewriting settings loaded from the pipeline configuration file.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LinkConfig {
    /// Scheme and host of the shop, without a trailing slash.
    pub site_base_url: String,
    pub quote_path: String,
    /// Product page path; `{slug}` is replaced by the model-number slug.
    pub product_path_template: String,
    /// Token the model writes where the datasheet link belongs.
    pub datasheet_placeholder: String,
    /// Link labels that are never allowed to stay linked (lower case).
    pub disallowed_labels: Vec<String>,
    /// Names under which the quote form is mentioned. The first is its label.
    pub quote_names: Vec<String>,
    pub datasheet_names: Vec<String>,
    pub phrase_substitutions: Vec<PhraseSubstitution>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            site_base_url: "https://shop.example.com".into(),
            quote_path: "/rfq-form.html".into(),
            product_path_template: "/products/{slug}.html".into(),
            datasheet_placeholder: "DATASHEET_URL".into(),
            disallowed_labels: vec![
                "link".into(),
                "manufacturer".into(),
                "manufacturer website".into(),
                "mean well".into(),
                "meanwell".into(),
            ],
            quote_names: vec!["RFQ Form".into(), "request a quote".into()],
            datasheet_names: vec!["datasheet".into()],
            phrase_substitutions: vec![
                PhraseSubstitution {
                    from: "contact the manufacturer".into(),
                    to: "contact our sales team".into(),
                },
                PhraseSubstitution {
                    from: "check the manufacturer's website".into(),
                    to: "see the datasheet".into(),
                },
            ],
        }
    }
}

impl LinkConfig {
    pub fn site_host(&self) -> &str {
        let without_scheme = self
            .site_base_url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.site_base_url);
        without_scheme.split('/').next().unwrap_or("")
    }

    pub fn quote_url(&self) -> String {
        format!("{}{}", self.base(), self.quote_path)
    }

    pub fn quote_label(&self) -> &str {
        self.quote_names.first().map(String::as_str).unwrap_or("RFQ Form")
    }

    pub fn datasheet_label(&self) -> &str {
        self.datasheet_names
            .first()
            .map(String::as_str)
            .unwrap_or("datasheet")
    }

    pub fn product_url(&self, model: &str) -> String {
        let path = self.product_path_template.replace("{slug}", &slugify(model));
        format!("{}{}", self.base(), path)
    }

    pub fn label_is_disallowed(&self, label: &str) -> bool {
        let label = label.trim().to_lowercase();
        self.disallowed_labels.iter().any(|d| d.to_lowercase() == label)
    }

    fn base(&self) -> &str {
        self.site_base_url.trim_end_matches('/')
    }
}

/// Leading alphanumeric/hyphen run of a product title, e.g. `LDD-700H`.
pub fn model_number(product_title: &str) -> Option<String> {
    let run: String = product_title
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect();
    let run = run.trim_matches('-');
    if run.is_empty() {
        None
    } else {
        Some(run.to_string())
    }
}

fn slugify(model: &str) -> String {
    let mut slug = String::with_capacity(model.len());
    for c in model.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_matches('-').to_string()
}

/// Make a scraped URL absolute against the shop's base URL.  Anything that
/// is neither absolute nor root-relative is discarded.
pub fn resolve_url(raw: &str, cfg: &LinkConfig) -> Option<String> {
    let raw = raw.trim();
    if markup::is_absolute_url(raw) {
        return Some(raw.to_string());
    }
    if let Some(rest) = raw.strip_prefix("//") {
        return Some(format!("https://{}", rest));
    }
    if raw.starts_with('/') {
        return Some(format!("{}{}", cfg.base(), raw));
    }
    None
}

/// A linkable entity that may be hyperlinked at most once per answer.
#[derive(Clone, Debug)]
pub struct Entity {
    pub kind: EntityKind,
    pub names: Vec<String>,
    pub url: String,
    /// Visible text used when the entity's bare URL is linked.
    pub label: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntityKind {
    Quote,
    Datasheet,
    Product,
}

/// Per-answer inputs shared by all stages.
#[derive(Clone, Debug)]
pub struct LinkContext<'a> {
    pub cfg: &'a LinkConfig,
    pub datasheet_url: Option<String>,
    pub model_number: Option<String>,
}

impl<'a> LinkContext<'a> {
    pub fn new(
        cfg: &'a LinkConfig,
        datasheet_url: Option<&str>,
        product_title: Option<&str>,
    ) -> Self {
        Self {
            cfg,
            datasheet_url: datasheet_url.and_then(|u| resolve_url(u, cfg)),
            model_number: product_title.and_then(model_number),
        }
    }

    /// Entities for this answer, quote form first.
    pub fn entities(&self) -> Vec<Entity> {
        let mut out = vec![Entity {
            kind: EntityKind::Quote,
            names: self.cfg.quote_names.clone(),
            url: self.cfg.quote_url(),
            label: self.cfg.quote_label().to_string(),
        }];
        if let Some(url) = &self.datasheet_url {
            out.push(Entity {
                kind: EntityKind::Datasheet,
                names: self.cfg.datasheet_names.clone(),
                url: url.clone(),
                label: self.cfg.datasheet_label().to_string(),
            });
        }
        if let Some(model) = &self.model_number {
            out.push(Entity {
                kind: EntityKind::Product,
                names: vec![model.clone()],
                url: self.cfg.product_url(model),
                label: model.clone(),
            });
        }
        out
    }
}

/// One step of the answer rewrite.
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;
    fn apply(&self, text: String, ctx: &LinkContext<'_>) -> String;
}

/// Runs the rewrite stages in their fixed order.
#[derive(Clone)]
pub struct PostProcessor {
    cfg: Arc<LinkConfig>,
    stages: Vec<Arc<dyn Stage>>,
}

impl PostProcessor {
    pub fn new(cfg: LinkConfig) -> Self {
        let stages: Vec<Arc<dyn Stage>> = vec![
            Arc::new(RawUrlStage),
            Arc::new(RepairStage),
            Arc::new(PlaceholderStage),
            Arc::new(PhraseStage),
            Arc::new(EntityLinkStage),
            Arc::new(CleanupStage),
        ];
        Self {
            cfg: Arc::new(cfg),
            stages,
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.cfg
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn process(
        &self,
        raw: &str,
        datasheet_url: Option<&str>,
        product_title: Option<&str>,
    ) -> String {
        let ctx = LinkContext::new(&self.cfg, datasheet_url, product_title);
        let mut text = raw.to_string();
        for stage in &self.stages {
            text = stage.apply(text, &ctx);
            tracing::trace!(stage = stage.name(), len = text.len(), "answer stage applied");
        }
        text.trim().to_string()
    }
}
