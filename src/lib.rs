//! Core library for specqa.  This module wires together the request
//! pipeline (validation, rate limiting, datasheet extraction, prompt
//! assembly, model call and answer post-processing), the request/response
//! structures and the HTTP handlers.

pub mod cache;
mod config;
pub mod datasheet;
pub mod model;
pub mod postprocess;
pub mod prompt;
pub mod rate_limit;
pub mod util;
pub mod validator;

pub use config::{AppConfig, CacheSettings, PipelineConfig};

use axum::extract::{
    rejection::{BytesRejection, FailedToBufferBody, JsonRejection},
    ConnectInfo, DefaultBodyLimit, State,
};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Instant;
use thiserror::Error;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::cache::ContentCache;
use crate::datasheet::{
    DatasheetExtractor, DatasheetText, DocumentFetcher, HttpFetcher, PdfDecoder, TextDecoder,
};
use crate::model::{AnthropicInvoker, ModelInvoker};
use crate::postprocess::{resolve_url, PostProcessor};
use crate::prompt::{system_instruction, PromptAssembler, PromptInput};
use crate::rate_limit::RateLimiter;
use crate::validator::{InputValidator, INVALID_INPUT_MESSAGE};

/// Body of `POST /ask`.  Every field is optional at the parsing layer so the
/// diagnostic sentinel and the required-field check can report precisely.
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AskRequest {
    pub question: Option<String>,
    pub product_specs: Option<String>,
    pub product_title: Option<String>,
    pub datasheet_url: Option<String>,
    pub similar_products: Option<String>,
    pub accessories: Option<String>,
}

impl AskRequest {
    /// Names of required fields that are absent or blank (empty if valid).
    fn missing_required_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        for (name, value) in [
            ("question", &self.question),
            ("productSpecs", &self.product_specs),
            ("productTitle", &self.product_title),
        ] {
            if value.as_deref().map(str::trim).filter(|s| !s.is_empty()).is_none() {
                missing.push(name);
            }
        }
        missing
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AskResponse {
    pub answer: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
    /// Upstream error text, only present when error exposure is enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<String>,
}

/// Every way `/ask` can fail in front of the client.
#[derive(Debug, Error)]
pub enum AskError {
    #[error("Missing required fields: {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),
    #[error("Question exceeds {0} characters")]
    QuestionTooLong(usize),
    #[error("{}", INVALID_INPUT_MESSAGE)]
    InvalidInput,
    #[error("Invalid request body")]
    InvalidBody(String),
    #[error("Request too large")]
    PayloadTooLarge(Option<usize>),
    #[error("Too many requests, please try again later")]
    RateLimited,
    #[error("Method not allowed")]
    MethodNotAllowed,
    #[error("{apology}")]
    Upstream {
        apology: String,
        contact: String,
        debug: Option<String>,
    },
}

impl AskError {
    pub fn status(&self) -> StatusCode {
        match self {
            AskError::MissingFields(_)
            | AskError::QuestionTooLong(_)
            | AskError::InvalidInput
            | AskError::InvalidBody(_) => StatusCode::BAD_REQUEST,
            AskError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            AskError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AskError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            AskError::Upstream { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AskError {
    fn into_response(self) -> Response {
        let status = self.status();
        let allow = matches!(self, AskError::MethodNotAllowed);
        let body = match self {
            AskError::Upstream {
                apology,
                contact,
                debug,
            } => ErrorResponse {
                error: apology,
                contact: Some(contact),
                debug,
            },
            other => ErrorResponse {
                error: other.to_string(),
                contact: None,
                debug: None,
            },
        };
        let mut resp = (status, Json(body)).into_response();
        if allow {
            resp.headers_mut()
                .insert(header::ALLOW, HeaderValue::from_static("POST, OPTIONS"));
        }
        resp
    }
}

/// Process-wide counters exposed on `/metrics`.
#[derive(Default)]
pub struct Metrics {
    pub requests_total: AtomicU64,
    pub answers_total: AtomicU64,
    pub rejected_invalid_total: AtomicU64,
    pub rejected_rate_limited_total: AtomicU64,
    pub upstream_failures_total: AtomicU64,
    pub datasheet_cache_hits_total: AtomicU64,
    pub datasheet_cache_misses_total: AtomicU64,
    pub datasheet_failures_total: AtomicU64,
    pub latency_sum_ms: AtomicU64,
    pub latency_count: AtomicU64,
    pub latency_counts: Vec<AtomicU64>,
}

/// Upper bounds (ms) of the answer latency histogram.
pub const LATENCY_BUCKETS_MS: &[u64] = &[50, 100, 250, 500, 1000, 2500, 5000, 10000, 30000];

impl Metrics {
    pub fn new() -> Self {
        Self {
            latency_counts: LATENCY_BUCKETS_MS.iter().map(|_| AtomicU64::new(0)).collect(),
            ..Self::default()
        }
    }

    fn record_error(&self, err: &AskError) {
        let counter = match err {
            AskError::RateLimited => &self.rejected_rate_limited_total,
            AskError::Upstream { .. } => &self.upstream_failures_total,
            AskError::MethodNotAllowed => return,
            _ => &self.rejected_invalid_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn observe_latency(&self, ms: u64) {
        self.latency_sum_ms.fetch_add(ms, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);
        // first bucket >= value
        if let Some(idx) = LATENCY_BUCKETS_MS.iter().position(|ub| ms <= *ub) {
            self.latency_counts[idx].fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Internal application state shared across handlers.  Every pipeline
/// service is constructed once and injected here.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub validator: InputValidator,
    pub rate_limiter: Arc<RateLimiter>,
    pub extractor: Arc<DatasheetExtractor>,
    /// Reserved namespace for product-page text; reported by the sentinel.
    pub page_cache: Arc<ContentCache>,
    pub assembler: Arc<PromptAssembler>,
    pub system_prompt: Arc<str>,
    pub invoker: Arc<dyn ModelInvoker>,
    pub postprocessor: PostProcessor,
    pub metrics: Arc<Metrics>,
    pub started_at: DateTime<Utc>,
    pub process_start_instant: Instant,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        invoker: Arc<dyn ModelInvoker>,
        fetcher: Arc<dyn DocumentFetcher>,
        decoder: Arc<dyn TextDecoder>,
    ) -> Self {
        let datasheet_cache = Arc::new(ContentCache::new(
            "datasheet",
            config.cache.ttl,
            config.cache.max_entries,
        ));
        let page_cache = Arc::new(ContentCache::new(
            "page",
            config.cache.ttl,
            config.cache.max_entries,
        ));
        let extractor = DatasheetExtractor::new(
            fetcher,
            decoder,
            datasheet_cache,
            config.pipeline.extraction.clone(),
        );
        let system_prompt: Arc<str> = system_instruction(&config.pipeline.links).into();
        Self {
            validator: InputValidator,
            rate_limiter: Arc::new(RateLimiter::new(config.rate_limit.clone())),
            extractor: Arc::new(extractor),
            page_cache,
            assembler: Arc::new(PromptAssembler::new(config.pipeline.prompt.clone())),
            system_prompt,
            invoker,
            postprocessor: PostProcessor::new(config.pipeline.links.clone()),
            metrics: Arc::new(Metrics::new()),
            started_at: Utc::now(),
            process_start_instant: Instant::now(),
            config: Arc::new(config),
        }
    }
}

/// Build state from environment variables (see [`AppConfig::from_env`]),
/// wiring the HTTP datasheet fetcher, the PDF decoder and the Anthropic
/// model client.
pub async fn build_state_from_env() -> Result<AppState, Box<dyn std::error::Error>> {
    let config = AppConfig::from_env().map_err(|e| -> Box<dyn std::error::Error> { e.into() })?;
    if config.model.api_key.is_none() {
        tracing::warn!("ANTHROPIC_API_KEY not set; model calls will be rejected upstream");
    }
    if !cfg!(feature = "pdf") {
        tracing::warn!("built without the pdf feature; datasheets will be skipped");
    }
    let fetcher = HttpFetcher::new(config.fetch_timeout, config.max_datasheet_bytes)?;
    let invoker = AnthropicInvoker::new(config.model.clone())?;
    tracing::info!(
        model = %config.model.model,
        per_minute = config.rate_limit.per_minute,
        per_day = config.rate_limit.per_day,
        cache_max_entries = config.cache.max_entries,
        "configuration loaded"
    );
    Ok(AppState::new(
        config,
        Arc::new(invoker),
        Arc::new(fetcher),
        Arc::new(PdfDecoder),
    ))
}

/// Build the Axum router and attach handlers.
pub fn app(state: AppState) -> Router {
    let max_request_bytes = state.config.max_request_bytes;
    let cors = cors_layer(state.config.allowed_origins.as_deref());

    let router = Router::new()
        .route(
            "/ask",
            post(ask_handler)
                .options(preflight_handler)
                .fallback(method_not_allowed_handler),
        )
        .route("/healthz", get(healthz_handler))
        .route("/metrics", get(metrics_handler));

    let router = if let Some(limit) = max_request_bytes {
        router.layer(DefaultBodyLimit::max(limit))
    } else {
        router
    };

    router.layer(cors).with_state(state)
}

fn cors_layer(allowed_origins: Option<&[String]>) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);
    match allowed_origins {
        None => layer.allow_origin(Any),
        Some(origins) => {
            let values: Vec<HeaderValue> = origins
                .iter()
                .filter_map(|o| match HeaderValue::from_str(o) {
                    Ok(v) => Some(v),
                    Err(_) => {
                        tracing::warn!(origin = %o, "ignoring unparsable CORS origin");
                        None
                    }
                })
                .collect();
            layer.allow_origin(AllowOrigin::list(values))
        }
    }
}

/// Client identity: first `X-Forwarded-For` hop, then `X-Real-IP`, then
/// the peer address.
fn client_id(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    header_value("x-forwarded-for")
        .or_else(|| header_value("x-real-ip"))
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

async fn preflight_handler() -> StatusCode {
    StatusCode::OK
}

async fn method_not_allowed_handler() -> AskError {
    AskError::MethodNotAllowed
}

/// Handler for `POST /ask`.
async fn ask_handler(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    payload: Result<Json<AskRequest>, JsonRejection>,
) -> Result<Response, AskError> {
    state.metrics.requests_total.fetch_add(1, Ordering::Relaxed);
    let client = client_id(&headers, peer.map(|ConnectInfo(addr)| addr));
    let start = Instant::now();

    let result = answer(&state, &client, payload).await;
    match &result {
        Ok(_) => {
            let ms = start.elapsed().as_millis() as u64;
            state.metrics.observe_latency(ms);
        }
        Err(err) => {
            state.metrics.record_error(err);
            tracing::info!(
                client = %client,
                status = err.status().as_u16(),
                reason = %err,
                "ask rejected"
            );
        }
    }
    result
}

async fn answer(
    state: &AppState,
    client: &str,
    payload: Result<Json<AskRequest>, JsonRejection>,
) -> Result<Response, AskError> {
    let req = payload
        .map(|Json(inner)| inner)
        .map_err(|rejection| json_rejection(state, rejection))?;

    if let (Some(sentinel), Some(question)) = (&state.config.debug_sentinel, &req.question) {
        if question == sentinel {
            tracing::info!(client = %client, "diagnostic sentinel requested");
            return Ok((StatusCode::OK, Json(diagnostics(state))).into_response());
        }
    }

    let missing = req.missing_required_fields();
    if !missing.is_empty() {
        return Err(AskError::MissingFields(missing));
    }
    let input = PromptInput::from_request(&req);
    let question_chars = input.question.chars().count();
    if question_chars > state.config.max_question_chars {
        return Err(AskError::QuestionTooLong(state.config.max_question_chars));
    }
    if let Some(rule) = state.validator.rejection(input.question) {
        tracing::warn!(client = %client, rule, "question rejected by input validator");
        return Err(AskError::InvalidInput);
    }
    if state.rate_limiter.is_limited(client, Instant::now()) {
        tracing::warn!(client = %client, "rate limit exceeded");
        return Err(AskError::RateLimited);
    }

    tracing::info!(client = %client, question_chars, "answering question");

    let links = state.postprocessor.config();
    let datasheet_url = req
        .datasheet_url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .and_then(|raw| {
            let resolved = resolve_url(raw, links);
            if resolved.is_none() {
                tracing::debug!(url = %raw, "ignoring unresolvable datasheet url");
            }
            resolved
        });
    let datasheet = match datasheet_url.as_deref() {
        Some(url) => datasheet_text(state, url).await,
        None => String::new(),
    };

    let prompt = state.assembler.assemble(&input, &datasheet);
    let raw = state
        .invoker
        .complete(&state.system_prompt, &prompt)
        .await
        .map_err(|err| {
            tracing::error!(
                client = %client,
                model = state.invoker.model_id(),
                error = %err,
                "model call failed"
            );
            AskError::Upstream {
                apology: state.config.pipeline.apology_message.clone(),
                contact: state.config.pipeline.contact_message.clone(),
                debug: state.config.expose_errors.then(|| err.to_string()),
            }
        })?;

    let answer = state
        .postprocessor
        .process(&raw, datasheet_url.as_deref(), Some(input.product_title));
    state.metrics.answers_total.fetch_add(1, Ordering::Relaxed);
    tracing::info!(
        client = %client,
        datasheet_chars = datasheet.len(),
        answer_chars = answer.len(),
        "answer ready"
    );
    Ok((StatusCode::OK, Json(AskResponse { answer })).into_response())
}

/// Datasheet text for the prompt.  Failures degrade to an empty string.
async fn datasheet_text(state: &AppState, url: &str) -> String {
    let outcome = state.extractor.extract(url).await;
    let m = &state.metrics;
    match &outcome {
        DatasheetText::Cached(_) => {
            m.datasheet_cache_hits_total.fetch_add(1, Ordering::Relaxed);
        }
        DatasheetText::Fetched(_) => {
            m.datasheet_cache_misses_total.fetch_add(1, Ordering::Relaxed);
        }
        DatasheetText::Unavailable(_) => {
            m.datasheet_cache_misses_total.fetch_add(1, Ordering::Relaxed);
            m.datasheet_failures_total.fetch_add(1, Ordering::Relaxed);
        }
    }
    outcome.into_text()
}

fn json_rejection(state: &AppState, rejection: JsonRejection) -> AskError {
    match rejection {
        JsonRejection::BytesRejection(BytesRejection::FailedToBufferBody(
            FailedToBufferBody::LengthLimitError(_),
        )) => {
            tracing::warn!(
                limit = ?state.config.max_request_bytes,
                "request body exceeded configured limit"
            );
            AskError::PayloadTooLarge(state.config.max_request_bytes)
        }
        other => {
            tracing::debug!(error = %other, "unparsable request body");
            AskError::InvalidBody(other.body_text())
        }
    }
}

fn diagnostics(state: &AppState) -> serde_json::Value {
    let cfg = &state.config;
    let section_names: Vec<&str> = cfg
        .pipeline
        .extraction
        .sections
        .iter()
        .map(|s| s.name.as_str())
        .collect();
    serde_json::json!({
        "model": state.invoker.model_id(),
        "version": env!("CARGO_PKG_VERSION"),
        "startedAt": state.started_at.to_rfc3339(),
        "cacheSize": state.extractor.cache().len(),
        "pageCacheSize": state.page_cache.len(),
        "rateLimitClients": state.rate_limiter.len(),
        "config": {
            "ratePerMinute": cfg.rate_limit.per_minute,
            "ratePerDay": cfg.rate_limit.per_day,
            "cacheTtlSecs": cfg.cache.ttl.as_secs(),
            "cacheMaxEntries": cfg.cache.max_entries,
            "maxQuestionChars": cfg.max_question_chars,
            "maxTokens": cfg.model.max_tokens,
            "temperature": cfg.model.temperature,
            "sections": section_names,
            "stages": state.postprocessor.stage_names(),
            "siteBaseUrl": cfg.pipeline.links.site_base_url,
        },
    })
}

/// Simple health endpoint for container readiness / liveness checks.
async fn healthz_handler(State(state): State<AppState>) -> Response {
    let json = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "model": state.invoker.model_id(),
    });
    (StatusCode::OK, Json(json)).into_response()
}

/// Prometheus-style metrics exposition.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    use std::fmt::Write as _;
    let m = &state.metrics;
    let mut buf = String::new();

    let counters: [(&str, &str, u64); 5] = [
        (
            "specqa_requests_total",
            "Total ask requests received",
            m.requests_total.load(Ordering::Relaxed),
        ),
        (
            "specqa_answers_total",
            "Answers returned to clients",
            m.answers_total.load(Ordering::Relaxed),
        ),
        (
            "specqa_upstream_failures_total",
            "Model calls that failed",
            m.upstream_failures_total.load(Ordering::Relaxed),
        ),
        (
            "specqa_datasheet_failures_total",
            "Datasheet extractions that degraded to empty text",
            m.datasheet_failures_total.load(Ordering::Relaxed),
        ),
        (
            "specqa_rate_limit_clients",
            "Clients currently tracked by the rate limiter",
            state.rate_limiter.len() as u64,
        ),
    ];
    for (name, help, value) in counters {
        let kind = if name.ends_with("_total") { "counter" } else { "gauge" };
        writeln!(&mut buf, "# HELP {} {}", name, help).ok();
        writeln!(&mut buf, "# TYPE {} {}", name, kind).ok();
        writeln!(&mut buf, "{} {}", name, value).ok();
    }

    writeln!(
        &mut buf,
        "# HELP specqa_rejections_total Requests rejected before the model call\n# TYPE specqa_rejections_total counter"
    )
    .ok();
    writeln!(
        &mut buf,
        "specqa_rejections_total{{cause=\"invalid\"}} {}",
        m.rejected_invalid_total.load(Ordering::Relaxed)
    )
    .ok();
    writeln!(
        &mut buf,
        "specqa_rejections_total{{cause=\"rate_limited\"}} {}",
        m.rejected_rate_limited_total.load(Ordering::Relaxed)
    )
    .ok();

    writeln!(
        &mut buf,
        "# HELP specqa_datasheet_cache_total Datasheet cache lookups\n# TYPE specqa_datasheet_cache_total counter"
    )
    .ok();
    writeln!(
        &mut buf,
        "specqa_datasheet_cache_total{{result=\"hit\"}} {}",
        m.datasheet_cache_hits_total.load(Ordering::Relaxed)
    )
    .ok();
    writeln!(
        &mut buf,
        "specqa_datasheet_cache_total{{result=\"miss\"}} {}",
        m.datasheet_cache_misses_total.load(Ordering::Relaxed)
    )
    .ok();

    writeln!(
        &mut buf,
        "# HELP specqa_answer_latency_ms Answer latency histogram milliseconds\n# TYPE specqa_answer_latency_ms histogram"
    )
    .ok();
    let mut cumulative: u64 = 0;
    for (i, ub) in LATENCY_BUCKETS_MS.iter().enumerate() {
        cumulative += m.latency_counts[i].load(Ordering::Relaxed);
        writeln!(
            &mut buf,
            "specqa_answer_latency_ms_bucket{{le=\"{}\"}} {}",
            ub, cumulative
        )
        .ok();
    }
    let count = m.latency_count.load(Ordering::Relaxed);
    writeln!(&mut buf, "specqa_answer_latency_ms_bucket{{le=\"+Inf\"}} {}", count).ok();
    writeln!(
        &mut buf,
        "specqa_answer_latency_ms_sum {}",
        m.latency_sum_ms.load(Ordering::Relaxed)
    )
    .ok();
    writeln!(&mut buf, "specqa_answer_latency_ms_count {}", count).ok();

    writeln!(
        &mut buf,
        "# HELP specqa_build_info Build information\n# TYPE specqa_build_info gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "specqa_build_info{{version=\"{}\",model=\"{}\"}} 1",
        env!("CARGO_PKG_VERSION"),
        state.invoker.model_id()
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP specqa_process_start_time_seconds Process start time (Unix epoch seconds)\n# TYPE specqa_process_start_time_seconds gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "specqa_process_start_time_seconds {}",
        state.started_at.timestamp()
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP specqa_process_uptime_seconds Process uptime seconds\n# TYPE specqa_process_uptime_seconds gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "specqa_process_uptime_seconds {}",
        state.process_start_instant.elapsed().as_secs_f64()
    )
    .ok();

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        buf,
    )
        .into_response()
}
