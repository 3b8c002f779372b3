#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use specqa::datasheet::{DocumentFetcher, ExtractionFailure, TextDecoder};
use specqa::model::{ModelError, ModelInvoker};
use specqa::{app, AppConfig, AppState};
use tokio::net::TcpListener;

/// Tracks environment variable mutations and restores originals on drop.
pub struct EnvGuard {
    originals: HashMap<String, Option<String>>,
}

impl EnvGuard {
    pub fn new() -> Self {
        Self {
            originals: HashMap::new(),
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.capture(key);
        std::env::set_var(key, value);
    }

    pub fn set_many(&mut self, entries: &[(&str, &str)]) {
        for (key, value) in entries {
            self.set(key, value);
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.capture(key);
        std::env::remove_var(key);
    }

    fn capture(&mut self, key: &str) {
        if self.originals.contains_key(key) {
            return;
        }
        let original = std::env::var(key).ok();
        self.originals.insert(key.to_string(), original);
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, original) in self.originals.drain() {
            match original {
                Some(value) => std::env::set_var(&key, value),
                None => std::env::remove_var(&key),
            }
        }
    }
}

/// Model stand-in that replays one fixed outcome and records prompts.
pub struct ScriptedInvoker {
    reply: Result<String, String>,
    pub calls: AtomicUsize,
    pub last_prompt: Mutex<Option<String>>,
}

impl ScriptedInvoker {
    pub fn answering(text: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Ok(text.to_string()),
            calls: AtomicUsize::new(0),
            last_prompt: Mutex::new(None),
        })
    }

    pub fn failing(message: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Err(message.to_string()),
            calls: AtomicUsize::new(0),
            last_prompt: Mutex::new(None),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_prompt(&self) -> String {
        self.last_prompt.lock().unwrap().clone().unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl ModelInvoker for ScriptedInvoker {
    fn model_id(&self) -> &str {
        "scripted-model"
    }

    async fn complete(&self, _system: &str, user: &str) -> Result<String, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_prompt.lock().unwrap() = Some(user.to_string());
        self.reply.clone().map_err(ModelError::Transport)
    }
}

/// Serves a fixed document, or fails every fetch when none is set.
pub struct StaticFetcher {
    body: Option<Vec<u8>>,
    pub calls: AtomicUsize,
}

impl StaticFetcher {
    pub fn serving(text: &str) -> Arc<Self> {
        Arc::new(Self {
            body: Some(text.as_bytes().to_vec()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn unreachable() -> Arc<Self> {
        Arc::new(Self {
            body: None,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl DocumentFetcher for StaticFetcher {
    async fn fetch(&self, _url: &str) -> Result<Vec<u8>, ExtractionFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.body
            .clone()
            .ok_or_else(|| ExtractionFailure::Fetch("connection refused".into()))
    }
}

/// Treats document bytes as UTF-8 text.
pub struct Utf8Decoder;

impl TextDecoder for Utf8Decoder {
    fn decode(&self, bytes: &[u8]) -> Result<String, ExtractionFailure> {
        String::from_utf8(bytes.to_vec()).map_err(|e| ExtractionFailure::Decode(e.to_string()))
    }
}

/// Decoder that reports the decoding capability as missing.
pub struct MissingDecoder;

impl TextDecoder for MissingDecoder {
    fn decode(&self, _bytes: &[u8]) -> Result<String, ExtractionFailure> {
        Err(ExtractionFailure::DecoderUnavailable)
    }
}

pub fn state_with(
    config: AppConfig,
    invoker: Arc<dyn ModelInvoker>,
    fetcher: Arc<dyn DocumentFetcher>,
    decoder: Arc<dyn TextDecoder>,
) -> AppState {
    AppState::new(config, invoker, fetcher, decoder)
}

/// Serve `state` on an ephemeral port; returns the base URL.
pub async fn spawn_app(state: AppState) -> (String, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = app(state);
    let handle = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    (format!("http://{}", addr), handle)
}

pub fn ask_body(question: &str) -> serde_json::Value {
    serde_json::json!({
        "question": question,
        "productTitle": "LDD-700H LED driver",
        "productSpecs": "Output current: 700mA\nInput voltage: 9-56VDC",
    })
}
