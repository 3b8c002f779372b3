use std::env;
use std::fs;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::datasheet::ExtractionConfig;
use crate::model::{ModelSettings, DEFAULT_MODEL_URL};
use crate::postprocess::LinkConfig;
use crate::prompt::PromptConfig;
use crate::rate_limit::RateLimitSettings;

const DEFAULT_APOLOGY: &str =
    "Sorry, I couldn't answer that right now. Please try again in a moment.";
const DEFAULT_CONTACT: &str =
    "For immediate help, email sales@shop.example.com or use our RFQ Form.";
pub const DEFAULT_DEBUG_SENTINEL: &str = "__specqa_status__";

/// Pipeline settings loaded from the optional `SPECQA_CONFIG` JSON file.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineConfig {
    #[serde(flatten)]
    pub extraction: ExtractionConfig,
    pub prompt: PromptConfig,
    pub links: LinkConfig,
    pub apology_message: String,
    pub contact_message: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            extraction: ExtractionConfig::default(),
            prompt: PromptConfig::default(),
            links: LinkConfig::default(),
            apology_message: DEFAULT_APOLOGY.to_owned(),
            contact_message: DEFAULT_CONTACT.to_owned(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub ttl: Duration,
    pub max_entries: usize,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub pipeline: PipelineConfig,
    pub model: ModelSettings,
    pub rate_limit: RateLimitSettings,
    pub cache: CacheSettings,
    pub fetch_timeout: Duration,
    /// Largest datasheet body read before the fetch is abandoned.
    pub max_datasheet_bytes: usize,
    pub max_question_chars: usize,
    pub max_request_bytes: Option<usize>,
    /// `None` allows any origin.
    pub allowed_origins: Option<Vec<String>>,
    pub debug_sentinel: Option<String>,
    pub expose_errors: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            model: ModelSettings::default(),
            rate_limit: RateLimitSettings::default(),
            cache: CacheSettings {
                ttl: Duration::from_secs(7 * 24 * 60 * 60),
                max_entries: 100,
            },
            fetch_timeout: Duration::from_secs(10),
            max_datasheet_bytes: 20 * 1024 * 1024,
            max_question_chars: 500,
            max_request_bytes: None,
            allowed_origins: None,
            debug_sentinel: Some(DEFAULT_DEBUG_SENTINEL.to_owned()),
            expose_errors: false,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let pipeline = if let Ok(path) = env::var("SPECQA_CONFIG") {
            let content = fs::read_to_string(&path).with_context(|| {
                format!("Failed to read SPECQA_CONFIG '{}': file unreadable", path)
            })?;
            serde_json::from_str::<PipelineConfig>(&content).with_context(|| {
                format!(
                    "Failed to parse SPECQA_CONFIG '{}': invalid JSON configuration",
                    path
                )
            })?
        } else {
            PipelineConfig::default()
        };

        let model = ModelSettings {
            api_key: env::var("ANTHROPIC_API_KEY")
                .ok()
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty()),
            model: env::var("SPECQA_MODEL")
                .ok()
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty())
                .unwrap_or(defaults.model.model),
            url: env::var("SPECQA_MODEL_URL")
                .ok()
                .filter(|u| !u.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_MODEL_URL.to_owned()),
            max_tokens: parse_optional_u32("SPECQA_MAX_TOKENS")?
                .unwrap_or(defaults.model.max_tokens),
            temperature: parse_optional_f32("SPECQA_TEMPERATURE")?
                .unwrap_or(defaults.model.temperature),
            timeout: parse_optional_u64("SPECQA_MODEL_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.model.timeout),
        };

        let rate_limit = RateLimitSettings {
            per_minute: parse_optional_u32("SPECQA_RATE_PER_MINUTE")?
                .unwrap_or(defaults.rate_limit.per_minute),
            per_day: parse_optional_u32("SPECQA_RATE_PER_DAY")?
                .unwrap_or(defaults.rate_limit.per_day),
            max_clients: parse_optional_usize("SPECQA_RATE_MAX_CLIENTS")?
                .unwrap_or(defaults.rate_limit.max_clients),
            ..defaults.rate_limit
        };

        let cache = CacheSettings {
            ttl: parse_optional_u64("SPECQA_CACHE_TTL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.cache.ttl),
            max_entries: parse_optional_usize("SPECQA_CACHE_MAX_ENTRIES")?
                .unwrap_or(defaults.cache.max_entries),
        };

        let fetch_timeout = parse_optional_u64("SPECQA_FETCH_TIMEOUT_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.fetch_timeout);
        let max_datasheet_bytes = parse_optional_usize("SPECQA_MAX_DATASHEET_BYTES")?
            .unwrap_or(defaults.max_datasheet_bytes);
        let max_question_chars = parse_optional_usize("SPECQA_MAX_QUESTION_CHARS")?
            .unwrap_or(defaults.max_question_chars);
        let max_request_bytes = parse_optional_usize("SPECQA_MAX_REQUEST_BYTES")?;

        let allowed_origins = env::var("SPECQA_ALLOWED_ORIGINS")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim())
                    .filter(|s| !s.is_empty() && *s != "*")
                    .map(|s| s.to_string())
                    .collect::<Vec<_>>()
            })
            .filter(|list: &Vec<String>| !list.is_empty());

        let debug_sentinel = match env::var("SPECQA_DEBUG_SENTINEL") {
            Ok(value) if value.trim().is_empty() => None,
            Ok(value) => Some(value.trim().to_string()),
            Err(_) => defaults.debug_sentinel,
        };
        let expose_errors = parse_bool_env("SPECQA_EXPOSE_ERRORS")?.unwrap_or(false);

        if cache.max_entries == 0 {
            return Err(anyhow!("SPECQA_CACHE_MAX_ENTRIES must be at least 1"));
        }
        if max_datasheet_bytes == 0 {
            return Err(anyhow!("SPECQA_MAX_DATASHEET_BYTES must be at least 1"));
        }

        Ok(Self {
            pipeline,
            model,
            rate_limit,
            cache,
            fetch_timeout,
            max_datasheet_bytes,
            max_question_chars,
            max_request_bytes,
            allowed_origins,
            debug_sentinel,
            expose_errors,
        })
    }
}

fn parse_optional_u64(var: &str) -> Result<Option<u64>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a positive integer", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_optional_u32(var: &str) -> Result<Option<u32>> {
    parse_optional_u64(var)?
        .map(|v| u32::try_from(v).map_err(|_| anyhow!("{} must be at most {}", var, u32::MAX)))
        .transpose()
}

fn parse_optional_usize(var: &str) -> Result<Option<usize>> {
    parse_optional_u64(var)?
        .map(|v| usize::try_from(v).map_err(|_| anyhow!("{} must be at most {}", var, usize::MAX)))
        .transpose()
}

fn parse_optional_f32(var: &str) -> Result<Option<f32>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<f32>()
            .ok()
            .filter(|v| v.is_finite() && *v >= 0.0)
            .map(Some)
            .ok_or_else(|| anyhow!("{} must be a non-negative number", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool_env(var: &str) -> Result<Option<bool>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value)
            .map(Some)
            .ok_or_else(|| anyhow!("{} must be a boolean (true/false/1/0)", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
