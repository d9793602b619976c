//! Fan-out parser: every spec against one raw response.

use serde_json::{Map, Value};

use super::error::ParseError;
use super::spec::ResultSpec;

/// Applies a set of [`ResultSpec`]s to a single raw response and collects
/// the extracted values into one map. All-or-nothing: the first spec that
/// fails fails the whole parse, so a module never publishes a partial
/// record set.
#[derive(Debug, Clone, Default)]
pub struct PromptParser {
    specs: Vec<ResultSpec>,
}

impl PromptParser {
    /// Empty parser; add specs with [`Self::with_spec`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Parser over a ready-made spec list.
    pub fn from_specs(specs: Vec<ResultSpec>) -> Self {
        Self { specs }
    }

    /// Add one extraction spec.
    pub fn with_spec(mut self, spec: ResultSpec) -> Self {
        self.specs.push(spec);
        self
    }

    /// Whether any specs are registered.
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Run every spec against `raw`. On success the map holds each spec's
    /// value under its name, plus a `<name>_verification` entry for every
    /// spec that carries a verifier.
    pub fn parse_all(&self, raw: &str) -> Result<Map<String, Value>, ParseError> {
        let mut out = Map::new();
        for spec in &self.specs {
            let value = spec.parse(raw)?;
            if let Some(summary) = spec.run_verifier(&value) {
                out.insert(
                    format!("{}_verification", spec.name()),
                    Value::String(summary),
                );
            }
            out.insert(spec.name().to_string(), value);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multiple_specs_one_response() {
        let parser = PromptParser::new()
            .with_spec(ResultSpec::new("headline", ".//headline"))
            .with_spec(ResultSpec::new("body", ".//body"));
        let raw = "<result><headline>Storm</headline><body>It rained.</body></result>";
        let values = parser.parse_all(raw).unwrap();
        assert_eq!(values["headline"], "Storm");
        assert_eq!(values["body"], "It rained.");
    }

    #[test]
    fn test_one_failing_spec_fails_all() {
        let parser = PromptParser::new()
            .with_spec(ResultSpec::new("headline", ".//headline"))
            .with_spec(ResultSpec::new("body", ".//body"));
        let raw = "<result><headline>Storm</headline></result>";
        let err = parser.parse_all(raw).unwrap_err();
        assert_eq!(err, ParseError::NotSingle { name: "body".into(), count: 0 });
    }

    #[test]
    fn test_verifier_entry_added() {
        let parser = PromptParser::new().with_spec(
            ResultSpec::new("headline", ".//headline")
                .verify(|v: &serde_json::Value| format!("ok: {}", v.as_str().unwrap_or(""))),
        );
        let values = parser
            .parse_all("<result><headline>Storm</headline></result>")
            .unwrap();
        assert_eq!(values["headline_verification"], "ok: Storm");
    }
}
