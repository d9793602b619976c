//! LLM transport: the [`LlmClient`] trait and its implementations.
//!
//! The engine treats the model as a capability: hand it an ordered message
//! list, get text back. [`OllamaClient`] talks to Ollama's `/api/chat`
//! endpoint; [`MockClient`] returns canned responses and counts calls so
//! the retry and caching machinery can be tested deterministically.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};

use crate::error::{EngineError, Result};

/// The role of a chat message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions.
    System,
    /// User input (prompts and correction messages).
    User,
    /// Model response.
    Assistant,
}

/// A single message in a chat conversation.
///
/// Field order is part of the cache contract: the content hash is computed
/// over the canonical serialization of these messages, so the derive's
/// fixed field order keeps hashes stable across processes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    /// The role of the message author.
    pub role: Role,
    /// The message content.
    pub content: String,
}

impl ChatMessage {
    /// Convenience constructor for a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// Convenience constructor for an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Sampling configuration for model calls.
///
/// Each distinct `(temperature, max_tokens)` pair also selects its own
/// response cache store, so two configurations never share cached text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationConfig {
    /// Temperature (0.0 = deterministic). Dataset synthesis defaults to 0.0
    /// so that caching doubles as reproducibility.
    pub temperature: f64,

    /// Maximum tokens to generate.
    pub max_tokens: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            max_tokens: 2048,
        }
    }
}

impl GenerationConfig {
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// A normalized chat request — provider-agnostic.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    /// Model identifier (e.g. `"llama3.2:3b"`).
    pub model: String,
    /// Optional system prompt.
    pub system: Option<String>,
    /// Ordered conversation: history turns plus the current user prompt.
    pub messages: Vec<ChatMessage>,
    /// Sampling configuration.
    pub config: GenerationConfig,
}

/// Abstraction over LLM providers.
///
/// Implementors translate [`ChatRequest`] into the provider's HTTP API and
/// return the generated text. The trait is object-safe and used as
/// `Arc<dyn LlmClient>`. Rate limiting (429) and server errors should be
/// surfaced as [`EngineError::Http`] so the caller's backoff can see them.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Execute one blocking chat completion.
    async fn complete(&self, request: &ChatRequest) -> Result<String>;

    /// Human-readable name for logging and diagnostics.
    fn name(&self) -> &'static str;
}

/// Client for Ollama's `/api/chat` endpoint.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    http: Client,
    base_url: String,
}

impl OllamaClient {
    /// Create a client for the given base URL (e.g. `http://localhost:11434`).
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .expect("failed to build HTTP client");
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    /// Use a pre-built reqwest client (custom timeout, proxy, etc.).
    pub fn with_http(mut self, http: Client) -> Self {
        self.http = http;
        self
    }

    fn build_body(request: &ChatRequest) -> Value {
        let mut messages = Vec::new();
        if let Some(ref sys) = request.system {
            if !sys.is_empty() {
                messages.push(json!({"role": "system", "content": sys}));
            }
        }
        for msg in &request.messages {
            messages.push(json!({
                "role": match msg.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                },
                "content": msg.content,
            }));
        }
        json!({
            "model": request.model,
            "messages": messages,
            "stream": false,
            "options": {
                "temperature": request.config.temperature,
                "num_predict": request.config.max_tokens,
            },
        })
    }

    fn parse_retry_after(value: &str) -> Option<Duration> {
        value.trim().parse::<u64>().ok().map(Duration::from_secs)
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn complete(&self, request: &ChatRequest) -> Result<String> {
        let url = format!("{}/api/chat", self.base_url.trim_end_matches('/'));
        let body = Self::build_body(request);

        // Transport failures map to `EngineError::Request`, which the
        // backoff layer treats as retryable.
        let resp = self.http.post(&url).json(&body).send().await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(Self::parse_retry_after);
            let body = resp.text().await.unwrap_or_default();
            return Err(EngineError::Http {
                status,
                body,
                retry_after,
            });
        }

        let json_resp: Value = resp.json().await?;
        Ok(json_resp
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string())
    }

    fn name(&self) -> &'static str {
        "ollama"
    }
}

/// A test client that returns canned responses in order.
///
/// Cycles back to the beginning when all responses have been consumed.
/// Carries a call counter so tests can assert the engine issued exactly
/// the expected number of outbound calls (cache hits do not count).
#[derive(Debug)]
pub struct MockClient {
    responses: Vec<String>,
    index: AtomicUsize,
    calls: AtomicUsize,
}

impl MockClient {
    /// Create a mock with the given canned responses.
    pub fn new(responses: Vec<String>) -> Self {
        assert!(
            !responses.is_empty(),
            "MockClient requires at least one response"
        );
        Self {
            responses,
            index: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    /// Create a mock that always returns the same response.
    pub fn fixed(response: impl Into<String>) -> Self {
        Self::new(vec![response.into()])
    }

    /// Number of completions served so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl LlmClient for MockClient {
    async fn complete(&self, _request: &ChatRequest) -> Result<String> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let idx = self.index.fetch_add(1, Ordering::Relaxed) % self.responses.len();
        Ok(self.responses[idx].clone())
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
