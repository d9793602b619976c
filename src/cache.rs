//! Persistent response cache keyed by message-content hash and model.
//!
//! One SQLite store per `(temperature, max_tokens)` configuration, obtained
//! through a [`CacheRegistry`] so repeated construction for the same
//! configuration is idempotent. Writes are autocommitted immediately: a
//! crash after a successful model call never loses the cached response and
//! never causes a duplicate outbound call on the next run.
//!
//! Entries are never invalidated or expired. The hash covers only the
//! rendered message content (plus model identity via the key), not the
//! instruction version that produced it — deliberate, so re-runs replay
//! identical results byte for byte.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::client::{ChatMessage, GenerationConfig};
use crate::error::{EngineError, Result};

/// Cache key: content hash of the full message sequence plus model identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// SHA-256 hex digest of the canonicalized request messages.
    pub query_hash: String,
    /// Model identifier the response came from.
    pub model: String,
}

/// Recursively sort object keys so the hash is independent of map
/// insertion order anywhere in the request.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted: Vec<(&String, &Value)> = map.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = Map::new();
            for (k, v) in sorted {
                out.insert(k.clone(), canonicalize(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// SHA-256 hex digest of a JSON value's canonical compact serialization.
pub fn hash_value(value: &Value) -> String {
    let canonical = canonicalize(value);
    let bytes = serde_json::to_vec(&canonical).expect("canonical JSON serializes");
    let digest = Sha256::digest(&bytes);
    let mut hex = String::with_capacity(64);
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

/// Content hash over an ordered message sequence plus optional system
/// prompt. A pure function of message content: identical sequences always
/// hash identically, regardless of process, locale, or how the underlying
/// maps were populated.
pub fn content_hash(system: Option<&str>, messages: &[ChatMessage]) -> String {
    hash_value(&json!({
        "system": system,
        "messages": messages,
    }))
}

/// Durable key-value store for raw model responses.
///
/// Table layout: `responses(query_hash, model, raw_request_json,
/// response_text)` with `(query_hash, model)` as primary key. The original
/// serialized request is kept alongside the response for audit.
///
/// Safe for concurrent use across pipeline executions; duplicate-key
/// writes are last-write-wins, which is harmless since writes for a given
/// key are idempotent.
pub struct ResponseCache {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl ResponseCache {
    /// Open or create a cache store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path.as_ref())?;
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS responses (
                query_hash TEXT NOT NULL,
                model TEXT NOT NULL,
                raw_request_json TEXT NOT NULL,
                response_text TEXT NOT NULL,
                PRIMARY KEY (query_hash, model)
            )
            "#,
            [],
        )?;
        tracing::debug!(path = %path.as_ref().display(), "response cache opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Path of the backing store.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| EngineError::Other(format!("cache lock poisoned: {e}")))
    }

    /// Whether a response is stored for this key.
    pub fn has(&self, key: &CacheKey) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Fetch the cached response text, if any.
    pub fn get(&self, key: &CacheKey) -> Result<Option<String>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT response_text FROM responses WHERE query_hash = ?1 AND model = ?2",
                params![key.query_hash, key.model],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(row)
    }

    /// Store a response. Overwrites any existing row for the key (explicit
    /// re-insert is the only way an entry ever changes). The write commits
    /// before this returns.
    pub fn put(&self, key: &CacheKey, response_text: &str, raw_request: &Value) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO responses (query_hash, model, raw_request_json, response_text)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                key.query_hash,
                key.model,
                raw_request.to_string(),
                response_text
            ],
        )?;
        Ok(())
    }

    /// Number of stored responses.
    pub fn len(&self) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM responses", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Whether the store holds no responses.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// Registry handing out one shared [`ResponseCache`] per sampling
/// configuration.
///
/// Owned by the top-level orchestrator and passed down explicitly — there
/// is no process-global state. Store files are named deterministically
/// from the configuration, so a registry re-created over the same
/// directory finds the same stores.
pub struct CacheRegistry {
    dir: PathBuf,
    stores: Mutex<HashMap<(i64, u32), Arc<ResponseCache>>>,
}

impl CacheRegistry {
    /// Create a registry rooted at `dir` (created on first store open).
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            stores: Mutex::new(HashMap::new()),
        }
    }

    /// Store file name for a configuration. Temperature is fixed to
    /// millikelvin-style integer precision so 0.7 and 0.70 share a store.
    fn store_name(config: &GenerationConfig) -> String {
        let milli = (config.temperature * 1000.0).round() as i64;
        format!("responses_t{milli}_n{}.db", config.max_tokens)
    }

    /// Get (opening if needed) the shared store for this configuration.
    /// Idempotent: repeated calls with equal configurations return the
    /// same `Arc`.
    pub fn for_config(&self, config: &GenerationConfig) -> Result<Arc<ResponseCache>> {
        let key = (
            (config.temperature * 1000.0).round() as i64,
            config.max_tokens,
        );
        let mut stores = self
            .stores
            .lock()
            .map_err(|e| EngineError::Other(format!("registry lock poisoned: {e}")))?;
        if let Some(existing) = stores.get(&key) {
            return Ok(Arc::clone(existing));
        }
        let path = self.dir.join(Self::store_name(config));
        let store = Arc::new(ResponseCache::open(path)?);
        stores.insert(key, Arc::clone(&store));
        Ok(store)
    }
}
