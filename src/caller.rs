//! The caller: cache-fronted, retry-wrapped access to the model.
//!
//! Every model exchange in the engine goes through [`Caller::call`]:
//! flatten history into messages, hash the content, consult the cache,
//! and only on a miss go over the wire (with transport backoff) and
//! persist the response before returning. Modules and pipelines never
//! talk to an [`LlmClient`] directly.

use std::sync::Arc;

use serde_json::json;

use crate::audit::{ArtifactScope, AuditSink};
use crate::backoff::{with_backoff, BackoffConfig};
use crate::cache::{content_hash, CacheKey, ResponseCache};
use crate::client::{ChatRequest, GenerationConfig, LlmClient};
use crate::error::Result;
use crate::history::History;

/// Result of one logical call: the response text and whether it was
/// served from cache (a cache hit costs no outbound request).
#[derive(Debug, Clone, PartialEq)]
pub struct CallOutcome {
    /// The raw response text.
    pub text: String,
    /// True when the response came from the persistent cache.
    pub cached: bool,
}

/// Cache-fronted model access, cheap to clone and share.
#[derive(Clone)]
pub struct Caller {
    client: Arc<dyn LlmClient>,
    model: String,
    config: GenerationConfig,
    cache: Arc<ResponseCache>,
    backoff: BackoffConfig,
    audit: Option<AuditSink>,
}

impl Caller {
    /// Caller over `client` for `model`, persisting into `cache`.
    /// Defaults: deterministic sampling, standard backoff, no audit.
    pub fn new(
        client: Arc<dyn LlmClient>,
        model: impl Into<String>,
        cache: Arc<ResponseCache>,
    ) -> Self {
        Self {
            client,
            model: model.into(),
            config: GenerationConfig::default(),
            cache,
            backoff: BackoffConfig::standard(),
            audit: None,
        }
    }

    /// Replace the sampling configuration.
    ///
    /// The caller does not re-derive its cache store from the new
    /// configuration; obtain the store from a
    /// [`CacheRegistry`](crate::cache::CacheRegistry) for the same
    /// configuration to keep the store-per-configuration invariant.
    pub fn with_config(mut self, config: GenerationConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the transport backoff policy.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Attach an audit sink; every exchange (cached or not) is recorded.
    pub fn with_audit(mut self, audit: AuditSink) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Model identifier this caller targets.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Current sampling configuration.
    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    /// The backing response cache.
    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    /// Execute one exchange: `history` turns plus `prompt` as the final
    /// user message. Cache hit short-circuits the transport entirely; a
    /// miss calls the model and persists the response before returning,
    /// so an identical future call can never trigger a duplicate request.
    pub async fn call(
        &self,
        system: Option<&str>,
        prompt: &str,
        history: &History,
        scope: Option<&ArtifactScope>,
    ) -> Result<CallOutcome> {
        let messages = history.to_messages(prompt);
        let query_hash = content_hash(system, &messages);
        let key = CacheKey {
            query_hash: query_hash.clone(),
            model: self.model.clone(),
        };

        if let Some(text) = self.cache.get(&key)? {
            tracing::debug!(model = %self.model, hash = %query_hash, "cache hit");
            self.record(scope, prompt, &text, true, &query_hash);
            return Ok(CallOutcome { text, cached: true });
        }

        let request = ChatRequest {
            model: self.model.clone(),
            system: system.map(str::to_string),
            messages,
            config: self.config.clone(),
        };
        tracing::debug!(
            model = %self.model,
            client = self.client.name(),
            hash = %query_hash,
            history_turns = history.len(),
            "cache miss, calling model"
        );
        let text = with_backoff(&self.client, &request, &self.backoff).await?;

        // The write must land before we return: losing it would mean a
        // duplicate outbound call for the same content later.
        self.cache.put(&key, &text, &serde_json::to_value(&request)?)?;
        self.record(scope, prompt, &text, false, &query_hash);
        Ok(CallOutcome {
            text,
            cached: false,
        })
    }

    fn record(
        &self,
        scope: Option<&ArtifactScope>,
        prompt: &str,
        response: &str,
        cached: bool,
        query_hash: &str,
    ) {
        if let (Some(sink), Some(scope)) = (&self.audit, scope) {
            sink.record(
                scope,
                &json!({
                    "model": self.model,
                    "query_hash": query_hash,
                    "prompt": prompt,
                    "response": response,
                    "cached": cached,
                }),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockClient;
    use tempfile::tempdir;

    fn caller_with(mock: Arc<MockClient>, dir: &std::path::Path) -> Caller {
        let cache = Arc::new(ResponseCache::open(dir.join("c.db")).unwrap());
        Caller::new(mock, "test-model", cache).with_backoff(BackoffConfig::none())
    }

    #[tokio::test]
    async fn test_identical_calls_hit_cache() {
        let dir = tempdir().unwrap();
        let mock = Arc::new(MockClient::fixed("the answer"));
        let caller = caller_with(Arc::clone(&mock), dir.path());
        let history = History::new();

        let first = caller.call(None, "question?", &history, None).await.unwrap();
        assert_eq!(first.text, "the answer");
        assert!(!first.cached);

        let second = caller.call(None, "question?", &history, None).await.unwrap();
        assert_eq!(second.text, "the answer");
        assert!(second.cached);
        // Exactly one outbound request.
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_different_content_misses() {
        let dir = tempdir().unwrap();
        let mock = Arc::new(MockClient::fixed("r"));
        let caller = caller_with(Arc::clone(&mock), dir.path());
        let history = History::new();

        caller.call(None, "a", &history, None).await.unwrap();
        caller.call(None, "b", &history, None).await.unwrap();
        caller.call(Some("sys"), "a", &history, None).await.unwrap();
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn test_history_is_part_of_the_key() {
        let dir = tempdir().unwrap();
        let mock = Arc::new(MockClient::fixed("r"));
        let caller = caller_with(Arc::clone(&mock), dir.path());

        let empty = History::new();
        let mut longer = History::new();
        longer.push("earlier", "reply");

        caller.call(None, "same", &empty, None).await.unwrap();
        caller.call(None, "same", &longer, None).await.unwrap();
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn test_cache_survives_caller_recreation() {
        let dir = tempdir().unwrap();
        let history = History::new();
        {
            let mock = Arc::new(MockClient::fixed("persisted"));
            let caller = caller_with(mock, dir.path());
            caller.call(None, "q", &history, None).await.unwrap();
        }
        let mock = Arc::new(MockClient::fixed("should not be called"));
        let caller = caller_with(Arc::clone(&mock), dir.path());
        let outcome = caller.call(None, "q", &history, None).await.unwrap();
        assert_eq!(outcome.text, "persisted");
        assert!(outcome.cached);
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn test_audit_records_hits_and_misses() {
        let dir = tempdir().unwrap();
        let mock = Arc::new(MockClient::fixed("r"));
        let caller = caller_with(mock, dir.path())
            .with_audit(AuditSink::new(dir.path().join("artifacts")));
        let scope = ArtifactScope::new("probe", 1);
        let history = History::new();

        caller.call(None, "q", &history, Some(&scope)).await.unwrap();
        caller.call(None, "q", &history, Some(&scope)).await.unwrap();

        let content =
            std::fs::read_to_string(dir.path().join("artifacts/probe_v1.json")).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["cached"], false);
        assert_eq!(lines[1]["cached"], true);
    }
}
