//! Generation modules: one templated prompt, its parser, its critiques,
//! and the self-correction loop that ties them together.
//!
//! A module owns everything needed to produce one validated record slice:
//! render the prompt from the working values, call the model through the
//! caller, parse the response, run critiques, and on failure feed the
//! correction back as a follow-up turn. Format problems (unparseable
//! responses) and domain problems (failing critiques) share one
//! correction budget; format corrections naturally come first because a
//! response that does not parse never reaches the critiques.

use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::audit::ArtifactScope;
use crate::caller::Caller;
use crate::critique::{combine_corrections, Critique, CritiqueResult};
use crate::error::{EngineError, Result};
use crate::history::History;
use crate::parser::{ParseError, PromptParser};
use crate::template::PromptTemplate;
use crate::values::{ValueSet, IS_VALID_KEY};

/// Key under which a tolerated failure records its outstanding issues.
pub const VALIDITY_ISSUES_KEY: &str = "validity_issues";

type Hook = Arc<dyn Fn(&mut ValueSet) -> Result<()> + Send + Sync>;

/// A single generation step: prompt, parser, critiques, correction loop.
///
/// Built with [`ModuleBuilder`]; immutable and shareable afterwards.
pub struct Module {
    name: String,
    template: PromptTemplate,
    system: Option<String>,
    parser: PromptParser,
    critiques: Vec<Box<dyn Critique>>,
    max_critiques: u32,
    correction: bool,
    tolerate_failure: bool,
    pre_hook: Option<Hook>,
    post_hook: Option<Hook>,
    reads: Vec<String>,
    writes: Vec<String>,
    instruction_version: u32,
    tag_keys: Vec<String>,
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Module`].
pub struct ModuleBuilder {
    name: String,
    template: PromptTemplate,
    system: Option<String>,
    parser: PromptParser,
    critiques: Vec<Box<dyn Critique>>,
    max_critiques: u32,
    correction: bool,
    tolerate_failure: bool,
    pre_hook: Option<Hook>,
    post_hook: Option<Hook>,
    reads: Vec<String>,
    writes: Vec<String>,
    instruction_version: u32,
    tag_keys: Vec<String>,
}

impl ModuleBuilder {
    /// Start a module named `name` around `template`.
    pub fn new(name: impl Into<String>, template: PromptTemplate) -> Self {
        Self {
            name: name.into(),
            template,
            system: None,
            parser: PromptParser::new(),
            critiques: Vec::new(),
            max_critiques: 3,
            correction: false,
            tolerate_failure: false,
            pre_hook: None,
            post_hook: None,
            reads: Vec::new(),
            writes: Vec::new(),
            instruction_version: 1,
            tag_keys: Vec::new(),
        }
    }

    /// System prompt sent with every call.
    pub fn system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Parser applied to every response.
    pub fn parser(mut self, parser: PromptParser) -> Self {
        self.parser = parser;
        self
    }

    /// Append a domain critique. Critiques run in the order added.
    pub fn critique(mut self, critique: impl Critique + 'static) -> Self {
        self.critiques.push(Box::new(critique));
        self
    }

    /// Correction budget: maximum re-prompts after the initial call
    /// (default 3). Zero means one shot, no corrections.
    pub fn max_critiques(mut self, max: u32) -> Self {
        self.max_critiques = max;
        self
    }

    /// Make this a correction module: if the incoming values already pass
    /// every critique, return them untouched without calling the model.
    pub fn as_correction(mut self) -> Self {
        self.correction = true;
        self
    }

    /// On budget exhaustion, mark the record invalid and return it
    /// instead of failing the pipeline.
    pub fn tolerate_failure(mut self) -> Self {
        self.tolerate_failure = true;
        self
    }

    /// Hook run on the working values before rendering the prompt.
    pub fn pre_hook(
        mut self,
        hook: impl Fn(&mut ValueSet) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.pre_hook = Some(Arc::new(hook));
        self
    }

    /// Hook run on the working values after a valid result is merged.
    pub fn post_hook(
        mut self,
        hook: impl Fn(&mut ValueSet) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.post_hook = Some(Arc::new(hook));
        self
    }

    /// Declare the value keys this module reads (for pipeline validation).
    pub fn reads<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reads = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Declare the value keys this module writes (for pipeline validation).
    pub fn writes<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.writes = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Instruction version, recorded in artifact file names. Bump when
    /// the prompt text changes.
    pub fn instruction_version(mut self, version: u32) -> Self {
        self.instruction_version = version;
        self
    }

    /// Value keys whose (string) values are appended as artifact tags.
    pub fn tag_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tag_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Finish the module.
    pub fn build(self) -> Result<Module> {
        if self.correction && self.critiques.is_empty() {
            return Err(EngineError::InvalidConfig(format!(
                "correction module '{}' needs at least one critique to decide \
                 whether the incoming values are already acceptable",
                self.name
            )));
        }
        Ok(Module {
            name: self.name,
            template: self.template,
            system: self.system,
            parser: self.parser,
            critiques: self.critiques,
            max_critiques: self.max_critiques,
            correction: self.correction,
            tolerate_failure: self.tolerate_failure,
            pre_hook: self.pre_hook,
            post_hook: self.post_hook,
            reads: self.reads,
            writes: self.writes,
            instruction_version: self.instruction_version,
            tag_keys: self.tag_keys,
        })
    }
}

/// How one correction loop ended.
struct LoopOutcome {
    valid: bool,
    parsed: Option<Map<String, Value>>,
    issues: Vec<CritiqueResult>,
    rounds: u32,
    parse_failure: Option<ParseError>,
}

impl Module {
    /// Module name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared read keys.
    pub fn reads(&self) -> &[String] {
        &self.reads
    }

    /// Declared write keys.
    pub fn writes(&self) -> &[String] {
        &self.writes
    }

    /// Execute the module once.
    ///
    /// Clones the incoming values, runs the correction loop, and returns
    /// the merged result with [`IS_VALID_KEY`] set. `history` accumulates
    /// every exchange, including correction turns, and only ever grows.
    pub async fn call(
        &self,
        caller: &Caller,
        values: &ValueSet,
        history: &mut History,
    ) -> Result<ValueSet> {
        let mut working = values.clone();
        if let Some(hook) = &self.pre_hook {
            hook(&mut working)?;
        }

        // A correction module leaves already-acceptable values untouched.
        if self.correction && self.failing_critiques(&working).is_empty() {
            tracing::debug!(module = %self.name, "values already valid, skipping call");
            return Ok(working);
        }

        let prompt = self.template.render(&working.template_vars(), false)?;
        let scope = self.artifact_scope(&working);
        let outcome = self
            .run_loop(caller, prompt, &working, history, &scope)
            .await?;

        if outcome.valid {
            if let Some(parsed) = outcome.parsed {
                working.merge(parsed);
            }
            working.insert(IS_VALID_KEY, true);
            if let Some(hook) = &self.post_hook {
                hook(&mut working)?;
            }
            tracing::info!(module = %self.name, rounds = outcome.rounds, "module succeeded");
            return Ok(working);
        }

        // Budget exhausted.
        if self.tolerate_failure {
            if let Some(parsed) = outcome.parsed {
                working.merge(parsed);
            }
            working.insert(IS_VALID_KEY, false);
            let issues: Vec<Value> = outcome
                .issues
                .iter()
                .map(|r| json!({"critique": r.name, "correction": r.correction}))
                .collect();
            working.insert(VALIDITY_ISSUES_KEY, Value::Array(issues));
            tracing::warn!(
                module = %self.name,
                rounds = outcome.rounds,
                "budget exhausted, returning invalid record"
            );
            return Ok(working);
        }

        match outcome.parse_failure {
            Some(source) => Err(EngineError::Parse {
                name: self.name.clone(),
                rounds: outcome.rounds,
                source,
            }),
            None => Err(EngineError::NoRecovery {
                module: self.name.clone(),
                rounds: outcome.rounds,
                failing: outcome.issues.len(),
            }),
        }
    }

    /// The correction loop. Each iteration is one model exchange; after a
    /// failure the correction message becomes the next prompt, with the
    /// full history (flawed attempts included) replayed so the model can
    /// repair rather than regenerate. Total exchanges are bounded by
    /// `1 + max_critiques`.
    async fn run_loop(
        &self,
        caller: &Caller,
        first_prompt: String,
        base: &ValueSet,
        history: &mut History,
        scope: &ArtifactScope,
    ) -> Result<LoopOutcome> {
        let mut prompt = first_prompt;
        let mut rounds = 0u32;
        loop {
            let outcome = caller
                .call(self.system.as_deref(), &prompt, history, Some(scope))
                .await?;
            history.push(prompt.clone(), outcome.text.clone());

            match self.parser.parse_all(&outcome.text) {
                Err(err) => {
                    tracing::debug!(module = %self.name, rounds, %err, "parse failed");
                    if rounds >= self.max_critiques {
                        return Ok(LoopOutcome {
                            valid: false,
                            parsed: None,
                            issues: Vec::new(),
                            rounds,
                            parse_failure: Some(err),
                        });
                    }
                    rounds += 1;
                    prompt = format_correction(&err);
                }
                Ok(parsed) => {
                    let mut candidate = base.clone();
                    candidate.merge(parsed.clone());
                    let failing = self.failing_critiques(&candidate);
                    if failing.is_empty() {
                        return Ok(LoopOutcome {
                            valid: true,
                            parsed: Some(parsed),
                            issues: Vec::new(),
                            rounds,
                            parse_failure: None,
                        });
                    }
                    tracing::debug!(
                        module = %self.name,
                        rounds,
                        failing = failing.len(),
                        "critiques rejected response"
                    );
                    if rounds >= self.max_critiques {
                        return Ok(LoopOutcome {
                            valid: false,
                            parsed: Some(parsed),
                            issues: failing,
                            rounds,
                            parse_failure: None,
                        });
                    }
                    rounds += 1;
                    prompt = combine_corrections(&failing);
                }
            }
        }
    }

    fn failing_critiques(&self, values: &ValueSet) -> Vec<CritiqueResult> {
        self.critiques
            .iter()
            .map(|c| c.evaluate(values))
            .filter(|r| !r.is_valid)
            .collect()
    }

    fn artifact_scope(&self, values: &ValueSet) -> ArtifactScope {
        let mut scope = ArtifactScope::new(&self.name, self.instruction_version);
        for key in &self.tag_keys {
            if let Some(tag) = values.get_str(key) {
                scope = scope.with_tag(tag);
            }
        }
        scope
    }
}

/// The re-prompt sent after a format failure. Escaping-related failures
/// get an extra hint, since the usual culprit is an unescaped `&` or `<`
/// rather than a structural misunderstanding.
fn format_correction(err: &ParseError) -> String {
    let mut message = format!(
        "Your previous response was invalid: {err}. \
         Please try again with the correct format."
    );
    if err.is_escaping_related() {
        message.push_str(
            " Remember to escape special characters inside text content: \
             use &amp; for '&' and &lt; for '<'.",
        );
    }
    message
}
