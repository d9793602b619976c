//! Retry with exponential backoff for transient transport failures.
//!
//! This layer is strictly about the wire: HTTP 429/5xx and connection
//! errors. Semantic failures (bad XML, failed critiques) are handled by
//! the module's correction loop, never here.

use std::sync::Arc;
use std::time::Duration;

use crate::client::{ChatRequest, LlmClient};
use crate::error::{EngineError, Result};

/// Jitter strategy applied to computed delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitterStrategy {
    /// No jitter; use the exact exponential delay.
    None,
    /// Random delay in `[0, computed]`.
    Full,
    /// Half fixed, half random: `computed/2 + rand(0, computed/2)`.
    Equal,
    /// Decorrelated: `rand(initial, prev * 3)`, capped at max.
    Decorrelated,
}

/// Configuration for transport-level retry.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Maximum retry attempts after the initial call.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Multiplier applied per attempt.
    pub multiplier: f64,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Jitter strategy.
    pub jitter: JitterStrategy,
    /// HTTP status codes considered transient.
    pub retryable_statuses: Vec<u16>,
    /// Honor a server-provided `Retry-After` over the computed delay.
    pub respect_retry_after: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::standard()
    }
}

impl BackoffConfig {
    /// Reasonable defaults: 3 retries, 1s initial, doubling, equal jitter.
    pub fn standard() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: JitterStrategy::Equal,
            retryable_statuses: vec![429, 500, 502, 503, 504],
            respect_retry_after: true,
        }
    }

    /// No retries at all; every transport failure is immediately fatal.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::standard()
        }
    }

    /// Whether this error is worth retrying.
    fn is_retryable(&self, error: &EngineError) -> bool {
        match error {
            EngineError::Http { status, .. } => self.retryable_statuses.contains(status),
            EngineError::Request(_) => true,
            _ => false,
        }
    }

    /// Delay before retry number `attempt` (0-based), including jitter.
    /// `prev_delay` feeds the decorrelated strategy.
    fn delay_for_attempt(&self, attempt: u32, prev_delay: Duration) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        let seconds = match self.jitter {
            JitterStrategy::None => capped,
            JitterStrategy::Full => fastrand::f64() * capped,
            JitterStrategy::Equal => capped / 2.0 + fastrand::f64() * (capped / 2.0),
            JitterStrategy::Decorrelated => {
                let low = self.initial_delay.as_secs_f64();
                let high = (prev_delay.as_secs_f64() * 3.0).max(low);
                (low + fastrand::f64() * (high - low)).min(self.max_delay.as_secs_f64())
            }
        };
        Duration::from_secs_f64(seconds)
    }
}

/// Execute `request` against `client`, retrying transient failures per
/// `config`. Returns the first success or the last error once retries are
/// exhausted.
pub async fn with_backoff(
    client: &Arc<dyn LlmClient>,
    request: &ChatRequest,
    config: &BackoffConfig,
) -> Result<String> {
    let mut prev_delay = config.initial_delay;
    let mut attempt = 0u32;
    loop {
        match client.complete(request).await {
            Ok(text) => return Ok(text),
            Err(error) => {
                if attempt >= config.max_retries || !config.is_retryable(&error) {
                    return Err(error);
                }
                let mut delay = config.delay_for_attempt(attempt, prev_delay);
                if config.respect_retry_after {
                    if let EngineError::Http {
                        retry_after: Some(hint),
                        ..
                    } = &error
                    {
                        delay = (*hint).min(config.max_delay);
                    }
                }
                tracing::warn!(
                    client = client.name(),
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    %error,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                prev_delay = delay;
                attempt += 1;
            }
        }
    }
}
