//! Extraction specs: declarative descriptions of what to pull out of a
//! model response and how strictly to validate it.

use std::sync::Arc;

use serde_json::{Map, Value};

use super::error::ParseError;
use super::locator::Locator;
use super::xml::{extract_root_span, parse_xml, strip_speaker_prefix, strip_tag_blocks, XmlNode};

/// Advisory post-extraction check. Verifiers never fail a parse; their
/// summary is attached to the parsed values so downstream critiques (or a
/// human reading the dataset) can act on it.
pub trait Verifier: Send + Sync {
    /// Inspect the extracted value and return a short summary line.
    fn check(&self, value: &Value) -> String;
}

impl<F> Verifier for F
where
    F: Fn(&Value) -> String + Send + Sync,
{
    fn check(&self, value: &Value) -> String {
        self(value)
    }
}

/// Declarative spec for one named extraction from a raw response.
///
/// Built with the fluent methods below; the defaults describe the common
/// case (single text record wrapped in `<result>`, reasoning scratch in
/// `<scratch>` stripped first).
#[derive(Clone)]
pub struct ResultSpec {
    name: String,
    locators: Vec<Locator>,
    result_node: String,
    remove_node: String,
    to_single: bool,
    is_object: bool,
    allow_empty_list: bool,
    required_fields: Vec<String>,
    verifier: Option<Arc<dyn Verifier>>,
}

impl std::fmt::Debug for ResultSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultSpec")
            .field("name", &self.name)
            .field("locators", &self.locators)
            .field("result_node", &self.result_node)
            .field("remove_node", &self.remove_node)
            .field("to_single", &self.to_single)
            .field("is_object", &self.is_object)
            .field("allow_empty_list", &self.allow_empty_list)
            .field("required_fields", &self.required_fields)
            .field("has_verifier", &self.verifier.is_some())
            .finish()
    }
}

impl ResultSpec {
    /// New spec extracting values under key `name`, selecting nodes with
    /// the given primary locator.
    pub fn new(name: impl Into<String>, locator: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            locators: vec![Locator::new(locator)],
            result_node: "result".into(),
            remove_node: "scratch".into(),
            to_single: true,
            is_object: false,
            allow_empty_list: false,
            required_fields: Vec::new(),
            verifier: None,
        }
    }

    /// Name this spec publishes its value under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a fallback locator, tried alongside the primary. The locator
    /// yielding the most records wins; earlier-declared locators win ties.
    pub fn fallback_locator(mut self, locator: impl Into<String>) -> Self {
        self.locators.push(Locator::new(locator));
        self
    }

    /// Override the root wrapper tag (default `result`).
    pub fn result_node(mut self, node: impl Into<String>) -> Self {
        self.result_node = node.into();
        self
    }

    /// Override the scratch tag stripped before parsing (default `scratch`).
    pub fn remove_node(mut self, node: impl Into<String>) -> Self {
        self.remove_node = node.into();
        self
    }

    /// Extract a list of records instead of exactly one.
    pub fn as_list(mut self) -> Self {
        self.to_single = false;
        self
    }

    /// Permit the list to be empty (only meaningful with [`Self::as_list`]).
    pub fn allow_empty(mut self) -> Self {
        self.allow_empty_list = true;
        self
    }

    /// Extract each record as an object of its immediate children's text
    /// instead of the node's own text. Matched nodes with no child
    /// elements are dropped (a bare wrapper is noise, not a record).
    pub fn as_object(mut self) -> Self {
        self.is_object = true;
        self
    }

    /// Require these fields on every object record.
    pub fn require_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Attach an advisory verifier.
    pub fn verify(mut self, verifier: impl Verifier + 'static) -> Self {
        self.verifier = Some(Arc::new(verifier));
        self
    }

    /// Run the attached verifier, if any, against an extracted value.
    pub fn run_verifier(&self, value: &Value) -> Option<String> {
        self.verifier.as_ref().map(|v| v.check(value))
    }

    /// Extract this spec's value from a raw model response.
    pub fn parse(&self, raw: &str) -> Result<Value, ParseError> {
        // Carve the parseable region: drop chat artifacts and scratch
        // regions, then isolate the declared root wrapper.
        let text = strip_speaker_prefix(raw);
        let text = strip_tag_blocks(text, &self.remove_node);
        let span = extract_root_span(&text, &self.result_node).ok_or_else(|| {
            ParseError::MissingRootNode {
                node: self.result_node.clone(),
            }
        })?;

        let root = parse_xml(span)?;
        let matched = self.select(&root);
        let records = self.build_records(matched)?;

        if self.to_single {
            match records.len() {
                1 => Ok(records.into_iter().next().unwrap_or(Value::Null)),
                count => Err(ParseError::NotSingle {
                    name: self.name.clone(),
                    count,
                }),
            }
        } else if records.is_empty() && !self.allow_empty_list {
            Err(ParseError::EmptyResult {
                name: self.name.clone(),
            })
        } else {
            Ok(Value::Array(records))
        }
    }

    /// Try every locator; keep the match set of the one that found the
    /// most records. Ties go to the earliest-declared locator, so the
    /// primary wins whenever a fallback merely equals it.
    fn select<'a>(&self, root: &'a XmlNode) -> Vec<&'a XmlNode> {
        let mut best: Vec<&XmlNode> = Vec::new();
        for locator in &self.locators {
            let found = locator.matches(root);
            if found.len() > best.len() {
                best = found;
            }
        }
        best
    }

    fn build_records(&self, matched: Vec<&XmlNode>) -> Result<Vec<Value>, ParseError> {
        let mut records = Vec::with_capacity(matched.len());
        for node in matched {
            if self.is_object {
                if node.children.is_empty() {
                    continue;
                }
                let mut record = Map::new();
                for child in &node.children {
                    record.insert(child.name.clone(), Value::String(child.text.clone()));
                }
                let missing: Vec<String> = self
                    .required_fields
                    .iter()
                    .filter(|f| !record.contains_key(*f))
                    .cloned()
                    .collect();
                if !missing.is_empty() {
                    return Err(ParseError::MissingFields {
                        locator: self
                            .locators
                            .first()
                            .map(|l| l.as_str().to_string())
                            .unwrap_or_default(),
                        fields: missing,
                    });
                }
                records.push(Value::Object(record));
            } else {
                records.push(Value::String(node.text.clone()));
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_text_extraction() {
        let spec = ResultSpec::new("headline", ".//headline");
        let value = spec
            .parse("Sure! Here you go:\n<result><headline>Storm warning</headline></result>")
            .unwrap();
        assert_eq!(value, Value::String("Storm warning".into()));
    }

    #[test]
    fn test_scratch_region_is_ignored() {
        let spec = ResultSpec::new("headline", ".//headline");
        let raw = "<scratch>I could say <headline>draft</headline> but no</scratch>\
                   <result><headline>final</headline></result>";
        assert_eq!(spec.parse(raw).unwrap(), Value::String("final".into()));
    }

    #[test]
    fn test_missing_root_node() {
        let spec = ResultSpec::new("headline", ".//headline");
        let err = spec.parse("<headline>no wrapper</headline>").unwrap_err();
        assert_eq!(
            err,
            ParseError::MissingRootNode {
                node: "result".into()
            }
        );
    }

    #[test]
    fn test_single_rejects_multiple_matches() {
        let spec = ResultSpec::new("headline", ".//headline");
        let raw = "<result><headline>a</headline><headline>b</headline></result>";
        let err = spec.parse(raw).unwrap_err();
        assert_eq!(
            err,
            ParseError::NotSingle {
                name: "headline".into(),
                count: 2
            }
        );
    }

    #[test]
    fn test_list_extraction_as_objects() {
        let spec = ResultSpec::new("turns", ".//turn")
            .as_list()
            .as_object()
            .require_fields(["speaker", "line"]);
        let raw = "<result>\
                     <turn><speaker>Mira</speaker><line>Hello</line></turn>\
                     <turn><speaker>Joss</speaker><line>Hi</line></turn>\
                   </result>";
        let value = spec.parse(raw).unwrap();
        let items = value.as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["speaker"], "Mira");
        assert_eq!(items[1]["line"], "Hi");
    }

    #[test]
    fn test_required_fields_enforced() {
        let spec = ResultSpec::new("turns", ".//turn")
            .as_list()
            .as_object()
            .require_fields(["speaker", "line"]);
        let raw = "<result><turn><speaker>Mira</speaker></turn></result>";
        match spec.parse(raw).unwrap_err() {
            ParseError::MissingFields { fields, .. } => {
                assert_eq!(fields, vec!["line".to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_empty_list_rejected_unless_allowed() {
        let strict = ResultSpec::new("turns", ".//turn").as_list();
        let raw = "<result><notes>nothing here</notes></result>";
        assert_eq!(
            strict.parse(raw).unwrap_err(),
            ParseError::EmptyResult {
                name: "turns".into()
            }
        );

        let lenient = ResultSpec::new("turns", ".//turn").as_list().allow_empty();
        assert_eq!(lenient.parse(raw).unwrap(), Value::Array(vec![]));
    }

    #[test]
    fn test_fallback_locator_most_matches_wins() {
        let spec = ResultSpec::new("lines", ".//line")
            .fallback_locator(".//utterance")
            .as_list();
        // Model used the wrong tag name; the fallback finds more records.
        let raw = "<result>\
                     <utterance>one</utterance>\
                     <utterance>two</utterance>\
                   </result>";
        let value = spec.parse(raw).unwrap();
        assert_eq!(value.as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_tie_goes_to_primary_locator() {
        let spec = ResultSpec::new("pick", ".//first")
            .fallback_locator(".//second")
            .as_list();
        let raw = "<result><first>p</first><second>f</second></result>";
        let value = spec.parse(raw).unwrap();
        assert_eq!(value, serde_json::json!(["p"]));
    }

    #[test]
    fn test_childless_object_match_dropped() {
        let spec = ResultSpec::new("turns", ".//turn")
            .as_list()
            .as_object()
            .allow_empty();
        let raw = "<result><turn>bare text only</turn></result>";
        assert_eq!(spec.parse(raw).unwrap(), Value::Array(vec![]));
    }

    #[test]
    fn test_custom_result_and_remove_nodes() {
        let spec = ResultSpec::new("story", ".//story")
            .result_node("output")
            .remove_node("thinking");
        let raw = "<thinking>hmm</thinking><output><story>Once upon</story></output>";
        assert_eq!(spec.parse(raw).unwrap(), Value::String("Once upon".into()));
    }

    #[test]
    fn test_verifier_summary() {
        let spec = ResultSpec::new("headline", ".//headline").verify(|value: &Value| {
            let len = value.as_str().map(str::len).unwrap_or(0);
            format!("headline length: {len}")
        });
        let value = spec
            .parse("<result><headline>abcde</headline></result>")
            .unwrap();
        assert_eq!(
            spec.run_verifier(&value).as_deref(),
            Some("headline length: 5")
        );
    }

    #[test]
    fn test_malformed_xml_surfaces() {
        let spec = ResultSpec::new("headline", ".//headline");
        let raw = "<result><headline>a & b</headline></result>";
        let err = spec.parse(raw).unwrap_err();
        assert!(err.is_escaping_related());
    }
}
