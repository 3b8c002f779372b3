//! Prompt assembly for the model call.

use serde::Deserialize;

use crate::postprocess::LinkConfig;
use crate::util::truncate_chars;
use crate::AskRequest;

const TRUNCATION_MARKER: &str = "... [truncated]";

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PromptConfig {
    pub spec_max_chars: usize,
    pub datasheet_max_chars: usize,
    /// Optional blocks shorter than this (after trimming) are treated as absent.
    pub min_optional_chars: usize,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            spec_max_chars: 4000,
            datasheet_max_chars: 6000,
            min_optional_chars: 10,
        }
    }
}

/// The fields of a validated request the prompt is built from.
#[derive(Clone, Copy, Debug)]
pub struct PromptInput<'a> {
    pub question: &'a str,
    pub product_title: &'a str,
    pub product_specs: &'a str,
    pub similar_products: Option<&'a str>,
    pub accessories: Option<&'a str>,
}

impl<'a> PromptInput<'a> {
    pub fn from_request(req: &'a AskRequest) -> Self {
        Self {
            question: req.question.as_deref().unwrap_or("").trim(),
            product_title: req.product_title.as_deref().unwrap_or("").trim(),
            product_specs: req.product_specs.as_deref().unwrap_or("").trim(),
            similar_products: req.similar_products.as_deref(),
            accessories: req.accessories.as_deref(),
        }
    }
}

pub struct PromptAssembler {
    cfg: PromptConfig,
}

impl PromptAssembler {
    pub fn new(cfg: PromptConfig) -> Self {
        Self { cfg }
    }

    /// Build the user message.  Specifications and datasheet text are
    /// truncated against their own budgets.
    pub fn assemble(&self, input: &PromptInput<'_>, datasheet: &str) -> String {
        let mut out = String::new();
        out.push_str("Product: ");
        out.push_str(input.product_title);
        out.push_str("\n\nSpecifications:\n");
        push_budgeted(&mut out, input.product_specs, self.cfg.spec_max_chars);

        let datasheet = datasheet.trim();
        if !datasheet.is_empty() {
            out.push_str("\n\nDatasheet information:\n");
            push_budgeted(&mut out, datasheet, self.cfg.datasheet_max_chars);
        }
        if let Some(similar) = self.non_trivial(input.similar_products) {
            out.push_str("\n\nSimilar products:\n");
            out.push_str(similar);
        }
        if let Some(accessories) = self.non_trivial(input.accessories) {
            out.push_str("\n\nAccessories:\n");
            out.push_str(accessories);
        }
        out.push_str("\n\nQuestion: ");
        out.push_str(input.question);
        out
    }

    fn non_trivial<'a>(&self, field: Option<&'a str>) -> Option<&'a str> {
        field
            .map(str::trim)
            .filter(|s| s.chars().count() >= self.cfg.min_optional_chars)
    }
}

fn push_budgeted(out: &mut String, text: &str, max_chars: usize) {
    let (head, cut) = truncate_chars(text, max_chars);
    out.push_str(head);
    if cut {
        out.push_str(TRUNCATION_MARKER);
    }
}

/// Standing instructions sent as the system message.
pub fn system_instruction(links: &LinkConfig) -> String {
    format!(
        "You are a technical sales assistant answering questions about one product using only the \
         specifications, datasheet extract and product lists provided. Be concise and factual. \
         If the information is not provided, say so and suggest requesting a quote rather than guessing. \
         When referring to the datasheet, write the token {placeholder} where its link belongs. \
         Mention the {quote} when pricing, lead times or availability come up. \
         Do not invent links, do not link to other websites and do not name other manufacturers.",
        placeholder = links.datasheet_placeholder,
        quote = links.quote_names.first().map(String::as_str).unwrap_or("RFQ Form"),
    )
}
