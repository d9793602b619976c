//! Domain critiques: programmatic validators over parsed values.
//!
//! A critique inspects the working value set after a successful parse and
//! either passes or returns a correction message for the model. Failures
//! are ordinary values, not errors: the module's loop decides whether to
//! re-prompt or give up based on its correction budget.

use std::sync::atomic::{AtomicU32, Ordering};

use serde_json::Value;

use crate::values::ValueSet;

/// Outcome of one critique evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct CritiqueResult {
    /// Name of the critique that produced this result.
    pub name: String,
    /// Whether the values passed.
    pub is_valid: bool,
    /// Structured details of what failed, for audit output.
    pub errors: Vec<Value>,
    /// The correction message to re-prompt with. Empty when valid.
    pub correction: String,
}

impl CritiqueResult {
    /// A passing result.
    pub fn valid(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_valid: true,
            errors: Vec::new(),
            correction: String::new(),
        }
    }

    /// A failing result with a correction message. `errors` is non-empty
    /// exactly when a result is invalid, so a default record is derived
    /// from the correction; replace it with [`Self::with_errors`] when
    /// richer detail is available.
    pub fn invalid(name: impl Into<String>, correction: impl Into<String>) -> Self {
        let correction = correction.into();
        Self {
            name: name.into(),
            is_valid: false,
            errors: vec![serde_json::json!({ "message": correction })],
            correction,
        }
    }

    /// Replace the structured error details.
    pub fn with_errors(mut self, errors: Vec<Value>) -> Self {
        self.errors = errors;
        self
    }
}

/// A validator over the working value set.
///
/// Critiques run in declaration order after every successful parse; the
/// corrections of all failing critiques are combined into one re-prompt.
pub trait Critique: Send + Sync {
    /// Stable name for logging and audit records.
    fn name(&self) -> &str;

    /// Evaluate the current values.
    fn evaluate(&self, values: &ValueSet) -> CritiqueResult;
}

/// Adapter turning a closure into a [`Critique`].
pub struct FnCritique<F> {
    name: String,
    check: F,
}

impl<F> FnCritique<F>
where
    F: Fn(&ValueSet) -> Option<String> + Send + Sync,
{
    /// Wrap a closure. `check` returns `None` to pass, or
    /// `Some(correction)` to fail.
    pub fn new(name: impl Into<String>, check: F) -> Self {
        Self {
            name: name.into(),
            check,
        }
    }
}

impl<F> Critique for FnCritique<F>
where
    F: Fn(&ValueSet) -> Option<String> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, values: &ValueSet) -> CritiqueResult {
        match (self.check)(values) {
            None => CritiqueResult::valid(&self.name),
            Some(correction) => CritiqueResult::invalid(&self.name, correction),
        }
    }
}

/// A critique wrapper that gives up after a number of failures.
///
/// Some properties are desirable but not worth burning the whole
/// correction budget on. After `tolerance` failing evaluations the inner
/// critique is bypassed and the result reports valid, so the loop can
/// move on with a best-effort value.
pub struct RelaxingCritique<C> {
    inner: C,
    tolerance: u32,
    failures: AtomicU32,
}

impl<C: Critique> RelaxingCritique<C> {
    /// Relax `inner` after `tolerance` failing evaluations.
    pub fn new(inner: C, tolerance: u32) -> Self {
        Self {
            inner,
            tolerance,
            failures: AtomicU32::new(0),
        }
    }
}

impl<C: Critique> Critique for RelaxingCritique<C> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn evaluate(&self, values: &ValueSet) -> CritiqueResult {
        if self.failures.load(Ordering::Relaxed) >= self.tolerance {
            tracing::debug!(critique = self.inner.name(), "relaxed after repeated failures");
            return CritiqueResult::valid(self.inner.name());
        }
        let result = self.inner.evaluate(values);
        if !result.is_valid {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        result
    }
}

/// Combine the corrections of all failing results into one re-prompt
/// message, numbered when there is more than one issue.
pub fn combine_corrections(failing: &[CritiqueResult]) -> String {
    let corrections: Vec<&str> = failing
        .iter()
        .filter(|r| !r.is_valid && !r.correction.is_empty())
        .map(|r| r.correction.as_str())
        .collect();
    match corrections.len() {
        0 => String::new(),
        1 => corrections[0].to_string(),
        _ => {
            let mut combined =
                String::from("Your previous response had the following problems:\n");
            for (i, correction) in corrections.iter().enumerate() {
                combined.push_str(&format!("{}. {}\n", i + 1, correction));
            }
            combined.push_str("Please revise your response to address all of them.");
            combined
        }
    }
}
