//! Error type for structured output parsing.

/// A structural failure while decoding model output.
///
/// Inside a module's correction budget this is a retryable value: the
/// message is fed back to the model as a format correction. Only when the
/// budget is exhausted does it harden into
/// [`EngineError::Parse`](crate::error::EngineError::Parse).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    /// The declared root node was absent from the response.
    #[error("missing root node <{node}> in response")]
    MissingRootNode {
        /// The expected root tag name.
        node: String,
    },

    /// The residual text was not well-formed XML.
    #[error("malformed XML: {reason}")]
    Malformed {
        /// What the parser choked on.
        reason: String,
    },

    /// An extracted record lacked one or more required fields.
    #[error("record from locator '{locator}' is missing required field(s) {fields:?}")]
    MissingFields {
        /// The locator that produced the incomplete record.
        locator: String,
        /// The missing field names.
        fields: Vec<String>,
    },

    /// A single result was required but the locator matched a different count.
    #[error("expected exactly one result for '{name}', got {count}")]
    NotSingle {
        /// Parser spec name.
        name: String,
        /// How many records were actually extracted.
        count: usize,
    },

    /// No records were extracted and the spec does not allow an empty list.
    #[error("no results extracted for '{name}'")]
    EmptyResult {
        /// Parser spec name.
        name: String,
    },
}

impl ParseError {
    /// Whether the failure looks like an XML escaping problem (stray `&`,
    /// broken entity, `<` inside text). Correction prompts for these get an
    /// extra hint about entity encoding, since the model usually just
    /// forgot to escape a character rather than botching the structure.
    pub fn is_escaping_related(&self) -> bool {
        match self {
            ParseError::Malformed { reason } => {
                reason.contains("entity") || reason.contains('&') || reason.contains("mismatched")
            }
            _ => false,
        }
    }
}
