//! Prompt templates with `{{KEY}}` placeholder substitution.
//!
//! Templates are constructed once at pipeline-build time and immutable
//! after. Rendering is strict by default: any placeholder left standing
//! after substitution is a [`EngineError::Template`], because a literal
//! `{{KEY}}` shipped to the model silently corrupts the prompt and is a
//! hard bug class to spot downstream.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{EngineError, Result};

/// What shape of output the template instructs the model to produce.
/// Recorded in audit artifacts; does not affect rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnKind {
    /// Free text, no structural contract.
    Text,
    /// A single XML root node carved out by a parser spec.
    Xml,
}

/// An immutable instruction string with `{{UPPER_SNAKE_KEY}}` placeholders.
///
/// # Example
///
/// ```
/// use std::collections::HashMap;
/// use fabula::template::{PromptTemplate, ReturnKind};
///
/// let t = PromptTemplate::new("headline", "Describe {{TOPIC}}.", ReturnKind::Xml);
/// let mut vars = HashMap::new();
/// vars.insert("TOPIC".to_string(), "weather".to_string());
/// assert_eq!(t.render(&vars, false).unwrap(), "Describe weather.");
/// ```
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    name: String,
    instructions: String,
    return_kind: ReturnKind,
}

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{[A-Za-z0-9_]+\}\}").expect("placeholder regex compiles"))
}

impl PromptTemplate {
    /// Create a template. `name` identifies it in errors and audit artifacts.
    pub fn new(
        name: impl Into<String>,
        instructions: impl Into<String>,
        return_kind: ReturnKind,
    ) -> Self {
        Self {
            name: name.into(),
            instructions: instructions.into(),
            return_kind,
        }
    }

    /// Template name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The raw instruction text, placeholders intact.
    pub fn instructions(&self) -> &str {
        &self.instructions
    }

    /// Declared output shape.
    pub fn return_kind(&self) -> ReturnKind {
        self.return_kind
    }

    /// Substitute every `{{KEY}}` occurrence from `vars` (case-sensitive),
    /// then scan for leftovers.
    ///
    /// `allow_unresolved` tolerates surviving placeholders — used for
    /// multi-stage rendering where a later pass fills the rest. With it
    /// false (the default posture), a leftover placeholder is fatal.
    pub fn render(&self, vars: &HashMap<String, String>, allow_unresolved: bool) -> Result<String> {
        let mut rendered = self.instructions.clone();
        for (key, value) in vars {
            let placeholder = format!("{{{{{}}}}}", key);
            rendered = rendered.replace(&placeholder, value);
        }

        if !allow_unresolved {
            if let Some(m) = placeholder_re().find(&rendered) {
                return Err(EngineError::Template {
                    template: self.name.clone(),
                    placeholder: m.as_str().to_string(),
                });
            }
        }

        Ok(rendered)
    }
}
