//! Datasheet text extraction.
//!
//! A datasheet is supplementary context: every failure here degrades to an
//! empty string at the public boundary (`DatasheetExtractor::extract`) while
//! `try_extract` keeps the failure visible for logging and tests.
//!
//! The datasheet URL comes from the client, so fetches are limited to the
//! configured hosts (when any are listed) and to a maximum body size.
//!
//! Section extraction is table driven.  Each `SectionRule` names a section,
//! the keywords that mark where it starts and how many characters to keep
//! from that point.  Table order is priority order in the combined output.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::cache::ContentCache;
use crate::util::{char_window, find_first_keyword, normalize_whitespace, truncate_chars};

/// A named section located by keyword search.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SectionRule {
    pub name: String,
    pub keywords: Vec<String>,
    pub max_length: usize,
}

impl SectionRule {
    fn new(name: &str, keywords: &[&str], max_length: usize) -> Self {
        Self {
            name: name.to_owned(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            max_length,
        }
    }
}

/// Default section table, most technically salient first.
pub fn default_sections() -> Vec<SectionRule> {
    vec![
        SectionRule::new(
            "electrical",
            &[
                "electrical specification",
                "electrical characteristics",
                "specification",
                "output voltage",
                "rated current",
            ],
            1500,
        ),
        SectionRule::new(
            "voltageAdjust",
            &["voltage adj", "voltage adjustment", "adjustable output", "vo adj"],
            600,
        ),
        SectionRule::new(
            "constantCurrent",
            &["constant current", "cc region", "constant current region"],
            600,
        ),
        SectionRule::new(
            "dimming",
            &["dimming operation", "dimming", "0-10vdc", "pwm signal", "3 in 1 dimming"],
            800,
        ),
        SectionRule::new(
            "mechanical",
            &["mechanical specification", "mechanical drawing", "dimension", "case no"],
            800,
        ),
    ]
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExtractionConfig {
    pub sections: Vec<SectionRule>,
    /// Budget for the combined section text.
    pub max_combined_chars: usize,
    /// Prefix of the raw text used when no section is found.
    pub fallback_prefix_chars: usize,
    /// Hosts datasheets may be fetched from; subdomains included.  Empty
    /// allows any host.
    pub datasheet_hosts: Vec<String>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            sections: default_sections(),
            max_combined_chars: 6000,
            fallback_prefix_chars: 3000,
            datasheet_hosts: Vec::new(),
        }
    }
}

impl ExtractionConfig {
    /// Check `url` against `datasheet_hosts`.
    pub fn check_host(&self, url: &str) -> Result<(), ExtractionFailure> {
        if self.datasheet_hosts.is_empty() {
            return Ok(());
        }
        let host = reqwest::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
            .ok_or_else(|| ExtractionFailure::HostNotAllowed(url.to_string()))?;
        let allowed = self.datasheet_hosts.iter().any(|entry| {
            let entry = entry.trim().trim_start_matches('.').to_ascii_lowercase();
            !entry.is_empty()
                && (host == entry
                    || host
                        .strip_suffix(entry.as_str())
                        .is_some_and(|rest| rest.ends_with('.')))
        });
        if allowed {
            Ok(())
        } else {
            Err(ExtractionFailure::HostNotAllowed(host))
        }
    }
}

/// Why a datasheet produced no text.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExtractionFailure {
    #[error("datasheet fetch failed: {0}")]
    Fetch(String),
    #[error("datasheet fetch returned status {0}")]
    Status(u16),
    #[error("datasheet fetch timed out")]
    Timeout,
    #[error("datasheet host {0} is not allowed")]
    HostNotAllowed(String),
    #[error("datasheet exceeds {0} bytes")]
    TooLarge(usize),
    #[error("datasheet decoding failed: {0}")]
    Decode(String),
    #[error("no datasheet decoder available in this build")]
    DecoderUnavailable,
    #[error("datasheet contained no text")]
    Empty,
}

impl ExtractionFailure {
    /// Short machine-readable kind for structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Fetch(_) => "fetch",
            Self::Status(_) => "status",
            Self::Timeout => "timeout",
            Self::HostNotAllowed(_) => "host_not_allowed",
            Self::TooLarge(_) => "too_large",
            Self::Decode(_) => "decode",
            Self::DecoderUnavailable => "decoder_unavailable",
            Self::Empty => "empty",
        }
    }
}

/// Retrieves the raw bytes of a document.
#[async_trait::async_trait]
pub trait DocumentFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, ExtractionFailure>;
}

/// Turns raw document bytes into plain text.  Runs on the blocking pool.
pub trait TextDecoder: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<String, ExtractionFailure>;
}

/// Fetches documents over HTTP with an explicit timeout and body cap.
pub struct HttpFetcher {
    client: reqwest::Client,
    max_bytes: usize,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, max_bytes: usize) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, max_bytes })
    }
}

#[async_trait::async_trait]
impl DocumentFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, ExtractionFailure> {
        let map_err = |err: reqwest::Error| {
            if err.is_timeout() {
                ExtractionFailure::Timeout
            } else {
                ExtractionFailure::Fetch(err.to_string())
            }
        };
        let mut resp = self.client.get(url).send().await.map_err(map_err)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ExtractionFailure::Status(status.as_u16()));
        }
        if resp.content_length().is_some_and(|len| len > self.max_bytes as u64) {
            return Err(ExtractionFailure::TooLarge(self.max_bytes));
        }
        let mut body = Vec::new();
        while let Some(chunk) = resp.chunk().await.map_err(map_err)? {
            if body.len().saturating_add(chunk.len()) > self.max_bytes {
                return Err(ExtractionFailure::TooLarge(self.max_bytes));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

/// PDF decoder backed by `pdf-extract` when the `pdf` feature is enabled.
#[derive(Default)]
pub struct PdfDecoder;

impl TextDecoder for PdfDecoder {
    #[cfg(feature = "pdf")]
    fn decode(&self, bytes: &[u8]) -> Result<String, ExtractionFailure> {
        if !bytes.starts_with(b"%PDF-") {
            return Err(ExtractionFailure::Decode("not a PDF document".into()));
        }
        pdf_extract::extract_text_from_mem(bytes)
            .map_err(|e| ExtractionFailure::Decode(e.to_string()))
    }

    #[cfg(not(feature = "pdf"))]
    fn decode(&self, _bytes: &[u8]) -> Result<String, ExtractionFailure> {
        Err(ExtractionFailure::DecoderUnavailable)
    }
}

/// Locate each configured section in `text` and join the hits in table
/// order.  Falls back to a prefix of the text when nothing matches.
pub fn extract_sections(text: &str, cfg: &ExtractionConfig) -> String {
    let mut parts: Vec<String> = Vec::new();
    for rule in &cfg.sections {
        if let Some(start) = find_first_keyword(text, &rule.keywords) {
            let window = char_window(text, start, rule.max_length).trim();
            if !window.is_empty() {
                parts.push(format!("[{}] {}", rule.name, window));
            }
        }
    }
    let combined = if parts.is_empty() {
        tracing::debug!("no datasheet sections matched, using raw prefix");
        truncate_chars(text, cfg.fallback_prefix_chars).0.trim().to_string()
    } else {
        parts.join("\n\n")
    };
    truncate_chars(&combined, cfg.max_combined_chars).0.to_string()
}

pub struct DatasheetExtractor {
    fetcher: Arc<dyn DocumentFetcher>,
    decoder: Arc<dyn TextDecoder>,
    cache: Arc<ContentCache>,
    cfg: ExtractionConfig,
}

impl DatasheetExtractor {
    pub fn new(
        fetcher: Arc<dyn DocumentFetcher>,
        decoder: Arc<dyn TextDecoder>,
        cache: Arc<ContentCache>,
        cfg: ExtractionConfig,
    ) -> Self {
        Self {
            fetcher,
            decoder,
            cache,
            cfg,
        }
    }

    pub fn cache(&self) -> &Arc<ContentCache> {
        &self.cache
    }

    /// Extracted text for `url`.  Failures are logged and reported as
    /// `Unavailable`, whose text is empty.
    pub async fn extract(&self, url: &str) -> DatasheetText {
        match self.try_extract(url).await {
            Ok(Extraction {
                text,
                cache_hit: true,
            }) => DatasheetText::Cached(text),
            Ok(extraction) => DatasheetText::Fetched(extraction.text),
            Err(err) => {
                tracing::warn!(
                    url = %url,
                    kind = err.kind(),
                    error = %err,
                    "datasheet unavailable, continuing without it"
                );
                DatasheetText::Unavailable(err)
            }
        }
    }

    pub async fn try_extract(&self, url: &str) -> Result<Extraction, ExtractionFailure> {
        self.cfg.check_host(url)?;
        if let Some(text) = self.cache.get(url) {
            tracing::debug!(url = %url, "datasheet cache hit");
            return Ok(Extraction {
                text,
                cache_hit: true,
            });
        }

        let bytes = self.fetcher.fetch(url).await?;
        let decoder = self.decoder.clone();
        // A panicking decoder surfaces as a JoinError rather than unwinding here.
        let raw = tokio::task::spawn_blocking(move || decoder.decode(&bytes))
            .await
            .map_err(|e| ExtractionFailure::Decode(format!("decoder aborted: {e}")))??;

        let normalized = normalize_whitespace(&raw);
        if normalized.is_empty() {
            return Err(ExtractionFailure::Empty);
        }
        let text = extract_sections(&normalized, &self.cfg);
        tracing::debug!(
            url = %url,
            raw_chars = normalized.len(),
            extracted_chars = text.len(),
            "datasheet extracted"
        );
        self.cache.set(url, text.clone());
        Ok(Extraction {
            text,
            cache_hit: false,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Extraction {
    pub text: String,
    pub cache_hit: bool,
}

/// What `DatasheetExtractor::extract` produced for one request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DatasheetText {
    Cached(String),
    Fetched(String),
    Unavailable(ExtractionFailure),
}

impl DatasheetText {
    pub fn into_text(self) -> String {
        match self {
            Self::Cached(text) | Self::Fetched(text) => text,
            Self::Unavailable(_) => String::new(),
        }
    }
}
