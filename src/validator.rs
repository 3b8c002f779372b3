//! Question screening performed before any expensive work.
//!
//! A question is rejected when it carries markup or script characters,
//! script/data URI schemes, or phrasing that tries to override the
//! assistant's instructions or persona.  Matching is case-insensitive.

use once_cell::sync::Lazy;
use regex::Regex;

/// Fixed client-facing message for a rejected question.
pub const INVALID_INPUT_MESSAGE: &str = "invalid input detected";

static MARKUP_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[<>{}]").unwrap());
static SCHEME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:javascript|data|vbscript)\s*:").unwrap());
static OVERRIDE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:ignore|forget|disregard|override|bypass)\b(?:\s+\w+){0,3}?\s+(?:previous|prior|above|earlier|all|your|the)\s+(?:\w+\s+)?(?:instructions?|prompts?|rules|directions|context)\b",
    )
    .unwrap()
});
static PERSONA_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:act\s+as|you\s+are\s+now|pretend\s+(?:to\s+be|you\s+are)|role-?\s?play)\b")
        .unwrap()
});

/// Stateless screen over incoming questions.
#[derive(Clone, Copy, Debug, Default)]
pub struct InputValidator;

impl InputValidator {
    /// Returns true when the question may proceed down the pipeline.
    pub fn validate(&self, question: &str) -> bool {
        self.rejection(question).is_none()
    }

    /// Name of the first rule the question trips, if any.  Used for logging
    /// only; never echoed to the client.
    pub fn rejection(&self, question: &str) -> Option<&'static str> {
        if MARKUP_RE.is_match(question) {
            return Some("markup");
        }
        if SCHEME_RE.is_match(question) {
            return Some("uri_scheme");
        }
        if OVERRIDE_RE.is_match(question) {
            return Some("instruction_override");
        }
        if PERSONA_RE.is_match(question) {
            return Some("persona");
        }
        None
    }
}
