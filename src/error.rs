use std::time::Duration;
use thiserror::Error;

use crate::parser::ParseError;

/// Errors produced by the engine and its components.
///
/// Recoverable conditions — a response that fails to parse or a critique
/// that rejects it — are *values* ([`ParseError`], [`CritiqueResult`])
/// consumed by the module retry loop, not variants here. An `EngineError`
/// means the engine could not or will not recover.
///
/// [`CritiqueResult`]: crate::critique::CritiqueResult
#[derive(Error, Debug)]
pub enum EngineError {
    /// Low-level HTTP transport failure (connection refused, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// JSON serialization failed at the serde level.
    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    /// The cache storage layer failed. Never silently recovered: retrying
    /// the model on a failed cache write risks paying twice for the same call.
    #[error("cache storage failed: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Filesystem failure (cache directory creation, audit artifacts).
    #[error("I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// A placeholder survived rendering. Always fatal, never retried — a
    /// prompt with a literal `{{KEY}}` in it silently corrupts the model's
    /// instructions, and the bug is in the caller, not the model.
    #[error("unresolved placeholder {placeholder} in template '{template}'")]
    Template {
        /// Name of the template that failed to render.
        template: String,
        /// The leftover placeholder text, e.g. `{{TOPIC}}`.
        placeholder: String,
    },

    /// The response never became parseable within the correction budget.
    /// This is the fatal form of [`ParseError`]; inside the budget, parse
    /// failures are fed back to the model instead of raised.
    #[error("response for '{name}' still unparseable after {rounds} correction round(s): {source}")]
    Parse {
        /// Name of the module whose response failed.
        name: String,
        /// Correction rounds consumed before giving up.
        rounds: u32,
        /// The final parse failure.
        source: ParseError,
    },

    /// Critiques remained unsatisfied after the correction budget was spent
    /// and the module did not opt into tolerating failure. Signals that the
    /// generated record cannot be trusted.
    #[error("module '{module}' has no recovery strategy: {failing} critique(s) still failing after {rounds} round(s)")]
    NoRecovery {
        /// Name of the failing module.
        module: String,
        /// Correction rounds consumed.
        rounds: u32,
        /// Number of critiques still reporting invalid.
        failing: usize,
    },

    /// HTTP error with status code, response body, and optional Retry-After
    /// hint. 429/5xx statuses are retried with backoff inside the caller;
    /// this surfaces only when that budget is exhausted or the status is
    /// not retryable.
    #[error("HTTP {status}: {body}")]
    Http {
        /// HTTP status code (e.g. 429, 500, 503).
        status: u16,
        /// Response body text.
        body: String,
        /// Parsed `Retry-After` header value, if present.
        retry_after: Option<Duration>,
    },

    /// Conversation history lost turns between pipeline steps. History may
    /// only grow during a logical call; shrinkage means a step discarded
    /// turns the model needs to see for self-correction.
    #[error("conversation history shrank from {before} to {after} turn(s) across step '{step}'")]
    HistoryShrank {
        /// Name of the offending pipeline step.
        step: String,
        /// Turn count before the step ran.
        before: usize,
        /// Turn count after the step ran.
        after: usize,
    },

    /// Invalid configuration detected at build time.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Other(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
