//! Linear pipelines: modules composed into a dataset-generation run.
//!
//! A pipeline threads one working [`ValueSet`] through its steps in
//! order. Steps are values implementing [`PipelineStep`] (composition,
//! not inheritance): a [`Module`] is the common case, but anything that
//! can transform values against a caller slots in. Declared reads and
//! writes are checked once at build time so a step can never ask for a
//! key no earlier step provides.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use crate::audit::AuditSink;
use crate::caller::Caller;
use crate::error::{EngineError, Result};
use crate::history::History;
use crate::module::Module;
use crate::values::ValueSet;

/// Boxed future used by object-safe async trait methods.
pub type BoxFut<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One pipeline step.
pub trait PipelineStep: Send + Sync {
    /// Step name, used in errors and logs.
    fn name(&self) -> &str;

    /// Value keys this step requires. Checked at pipeline build time.
    fn reads(&self) -> &[String] {
        &[]
    }

    /// Value keys this step provides to later steps.
    fn writes(&self) -> &[String] {
        &[]
    }

    /// Run the step: consume the current values, return the next ones.
    /// `history` must not shrink; the pipeline checks after every step.
    fn call<'a>(
        &'a self,
        caller: &'a Caller,
        values: &'a ValueSet,
        history: &'a mut History,
    ) -> BoxFut<'a, Result<ValueSet>>;
}

impl PipelineStep for Module {
    fn name(&self) -> &str {
        Module::name(self)
    }

    fn reads(&self) -> &[String] {
        Module::reads(self)
    }

    fn writes(&self) -> &[String] {
        Module::writes(self)
    }

    fn call<'a>(
        &'a self,
        caller: &'a Caller,
        values: &'a ValueSet,
        history: &'a mut History,
    ) -> BoxFut<'a, Result<ValueSet>> {
        Box::pin(Module::call(self, caller, values, history))
    }
}

/// An ordered sequence of steps over one shared value set.
pub struct Pipeline {
    name: String,
    steps: Vec<Box<dyn PipelineStep>>,
    share_history: bool,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Pipeline`].
pub struct PipelineBuilder {
    name: String,
    steps: Vec<Box<dyn PipelineStep>>,
    share_history: bool,
    initial_keys: Vec<String>,
}

impl PipelineBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            share_history: true,
            initial_keys: Vec::new(),
        }
    }

    /// Keys guaranteed present in the initial values, for read checking.
    pub fn initial_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.initial_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Append a step.
    pub fn step(mut self, step: impl PipelineStep + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    /// Give every step a fresh, empty history instead of one shared
    /// conversation. Default is shared: later modules see earlier
    /// exchanges, which keeps long generations coherent.
    pub fn isolated_history(mut self) -> Self {
        self.share_history = false;
        self
    }

    /// Finish the pipeline, checking every step's declared reads against
    /// the keys available at its position.
    pub fn build(self) -> Result<Pipeline> {
        let mut available: Vec<String> = self.initial_keys;
        for step in &self.steps {
            for key in step.reads() {
                if !available.iter().any(|k| k == key) {
                    return Err(EngineError::InvalidConfig(format!(
                        "step '{}' in pipeline '{}' reads key '{}' which no \
                         earlier step writes and the initial values do not declare",
                        step.name(),
                        self.name,
                        key
                    )));
                }
            }
            available.extend(step.writes().iter().cloned());
        }
        Ok(Pipeline {
            name: self.name,
            steps: self.steps,
            share_history: self.share_history,
        })
    }
}

impl Pipeline {
    /// Start building a pipeline.
    pub fn builder(name: impl Into<String>) -> PipelineBuilder {
        PipelineBuilder::new(name)
    }

    /// Pipeline name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the pipeline has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every step in order over `initial`, returning the final values.
    ///
    /// With `output_dir` set, audit artifacts for every model exchange are
    /// written beneath it. After each step the pipeline asserts the
    /// conversation history did not shrink; a step that drops turns is a
    /// bug worth failing the whole run for, because later self-correction
    /// depends on the model seeing its earlier output.
    pub async fn execute(
        &self,
        caller: &Caller,
        output_dir: Option<&Path>,
        initial: ValueSet,
    ) -> Result<ValueSet> {
        let caller = match output_dir {
            Some(dir) => caller.clone().with_audit(AuditSink::new(dir)),
            None => caller.clone(),
        };

        tracing::info!(pipeline = %self.name, steps = self.steps.len(), "pipeline starting");
        let mut values = initial;
        let mut shared = History::new();
        for step in &self.steps {
            let mut isolated = History::new();
            let history = if self.share_history {
                &mut shared
            } else {
                &mut isolated
            };
            let before = history.len();
            tracing::debug!(pipeline = %self.name, step = step.name(), "step starting");
            values = step.call(&caller, &values, history).await?;
            let after = history.len();
            if after < before {
                return Err(EngineError::HistoryShrank {
                    step: step.name().to_string(),
                    before,
                    after,
                });
            }
        }
        tracing::info!(pipeline = %self.name, "pipeline finished");
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffConfig;
    use crate::cache::ResponseCache;
    use crate::client::MockClient;
    use crate::module::ModuleBuilder;
    use crate::parser::{PromptParser, ResultSpec};
    use crate::template::{PromptTemplate, ReturnKind};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn caller_for(mock: Arc<MockClient>, dir: &std::path::Path) -> Caller {
        let cache = Arc::new(ResponseCache::open(dir.join("c.db")).unwrap());
        Caller::new(mock, "test-model", cache).with_backoff(BackoffConfig::none())
    }

    fn headline_module() -> Module {
        ModuleBuilder::new(
            "headline",
            PromptTemplate::new("headline", "Headline about {{TOPIC}}.", ReturnKind::Xml),
        )
        .parser(PromptParser::new().with_spec(ResultSpec::new("headline", ".//headline")))
        .reads(["topic"])
        .writes(["headline"])
        .build()
        .unwrap()
    }

    fn body_module() -> Module {
        ModuleBuilder::new(
            "body",
            PromptTemplate::new("body", "Expand '{{HEADLINE}}' into a story.", ReturnKind::Xml),
        )
        .parser(PromptParser::new().with_spec(ResultSpec::new("body", ".//body")))
        .reads(["headline"])
        .writes(["body"])
        .build()
        .unwrap()
    }

    const HEADLINE: &str = "<result><headline>Storm rolls in</headline></result>";
    const BODY: &str = "<result><body>It rained for days.</body></result>";

    #[tokio::test]
    async fn test_two_step_chain_threads_values() {
        let dir = tempdir().unwrap();
        let mock = Arc::new(MockClient::new(vec![HEADLINE.into(), BODY.into()]));
        let caller = caller_for(Arc::clone(&mock), dir.path());
        let pipeline = Pipeline::builder("story")
            .initial_keys(["topic"])
            .step(headline_module())
            .step(body_module())
            .build()
            .unwrap();

        let initial = ValueSet::new().with("topic", "weather");
        let out = pipeline.execute(&caller, None, initial).await.unwrap();

        assert_eq!(out.get_str("headline"), Some("Storm rolls in"));
        assert_eq!(out.get_str("body"), Some("It rained for days."));
        assert!(out.is_valid());
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn test_rerun_is_fully_cached() {
        let dir = tempdir().unwrap();
        let mock = Arc::new(MockClient::new(vec![HEADLINE.into(), BODY.into()]));
        let caller = caller_for(Arc::clone(&mock), dir.path());
        let pipeline = Pipeline::builder("story")
            .initial_keys(["topic"])
            .step(headline_module())
            .step(body_module())
            .build()
            .unwrap();

        let initial = ValueSet::new().with("topic", "weather");
        let first = pipeline
            .execute(&caller, None, initial.clone())
            .await
            .unwrap();
        let second = pipeline.execute(&caller, None, initial).await.unwrap();

        assert_eq!(first, second);
        // The re-run was served entirely from cache.
        assert_eq!(mock.call_count(), 2);
        assert_eq!(caller.cache().len().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_single_module_rerun_leaves_one_cache_entry() {
        let dir = tempdir().unwrap();
        let mock = Arc::new(MockClient::fixed(HEADLINE));
        let caller = caller_for(Arc::clone(&mock), dir.path());
        let pipeline = Pipeline::builder("story")
            .initial_keys(["topic"])
            .step(headline_module())
            .build()
            .unwrap();

        let initial = ValueSet::new().with("topic", "weather");
        let first = pipeline
            .execute(&caller, None, initial.clone())
            .await
            .unwrap();
        let second = pipeline.execute(&caller, None, initial).await.unwrap();

        assert_eq!(first.get_str("headline"), Some("Storm rolls in"));
        assert_eq!(first, second);
        assert_eq!(mock.call_count(), 1);
        assert_eq!(caller.cache().len().unwrap(), 1);
    }

    #[test]
    fn test_build_rejects_unsatisfied_reads() {
        let err = Pipeline::builder("story")
            // No initial keys: the first module's `topic` read is unmet.
            .step(headline_module())
            .build()
            .unwrap_err();
        match err {
            EngineError::InvalidConfig(msg) => {
                assert!(msg.contains("topic"));
                assert!(msg.contains("headline"));
            }
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
    }

    #[test]
    fn test_build_accepts_reads_satisfied_by_earlier_writes() {
        let pipeline = Pipeline::builder("story")
            .initial_keys(["topic"])
            .step(headline_module())
            .step(body_module())
            .build()
            .unwrap();
        assert_eq!(pipeline.len(), 2);
    }

    struct HistoryProbe;

    impl PipelineStep for HistoryProbe {
        fn name(&self) -> &str {
            "probe"
        }

        fn call<'a>(
            &'a self,
            _caller: &'a Caller,
            values: &'a ValueSet,
            history: &'a mut History,
        ) -> BoxFut<'a, Result<ValueSet>> {
            Box::pin(async move {
                let mut out = values.clone();
                out.insert("observed_turns", history.len() as i64);
                Ok(out)
            })
        }
    }

    #[tokio::test]
    async fn test_shared_history_flows_between_steps() {
        let dir = tempdir().unwrap();
        let mock = Arc::new(MockClient::fixed(HEADLINE));
        let caller = caller_for(mock, dir.path());
        let pipeline = Pipeline::builder("p")
            .initial_keys(["topic"])
            .step(headline_module())
            .step(HistoryProbe)
            .build()
            .unwrap();

        let out = pipeline
            .execute(&caller, None, ValueSet::new().with("topic", "weather"))
            .await
            .unwrap();
        assert_eq!(out.get("observed_turns"), Some(&serde_json::json!(1)));
    }

    #[tokio::test]
    async fn test_isolated_history_starts_fresh_per_step() {
        let dir = tempdir().unwrap();
        let mock = Arc::new(MockClient::fixed(HEADLINE));
        let caller = caller_for(mock, dir.path());
        let pipeline = Pipeline::builder("p")
            .initial_keys(["topic"])
            .step(headline_module())
            .step(HistoryProbe)
            .isolated_history()
            .build()
            .unwrap();

        let out = pipeline
            .execute(&caller, None, ValueSet::new().with("topic", "weather"))
            .await
            .unwrap();
        assert_eq!(out.get("observed_turns"), Some(&serde_json::json!(0)));
    }

    struct TurnDropper;

    impl PipelineStep for TurnDropper {
        fn name(&self) -> &str {
            "dropper"
        }

        fn call<'a>(
            &'a self,
            _caller: &'a Caller,
            values: &'a ValueSet,
            history: &'a mut History,
        ) -> BoxFut<'a, Result<ValueSet>> {
            Box::pin(async move {
                history.pop();
                Ok(values.clone())
            })
        }
    }

    #[tokio::test]
    async fn test_shrinking_history_fails_the_run() {
        let dir = tempdir().unwrap();
        let mock = Arc::new(MockClient::fixed(HEADLINE));
        let caller = caller_for(mock, dir.path());
        let pipeline = Pipeline::builder("p")
            .initial_keys(["topic"])
            .step(headline_module())
            .step(TurnDropper)
            .build()
            .unwrap();

        let err = pipeline
            .execute(&caller, None, ValueSet::new().with("topic", "weather"))
            .await
            .unwrap_err();
        match err {
            EngineError::HistoryShrank {
                step,
                before,
                after,
            } => {
                assert_eq!(step, "dropper");
                assert_eq!(before, 1);
                assert_eq!(after, 0);
            }
            other => panic!("expected HistoryShrank, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_output_dir_writes_artifacts() {
        let dir = tempdir().unwrap();
        let artifacts = dir.path().join("artifacts");
        let mock = Arc::new(MockClient::fixed(HEADLINE));
        let caller = caller_for(mock, dir.path());
        let pipeline = Pipeline::builder("p")
            .initial_keys(["topic"])
            .step(headline_module())
            .build()
            .unwrap();

        pipeline
            .execute(
                &caller,
                Some(&artifacts),
                ValueSet::new().with("topic", "weather"),
            )
            .await
            .unwrap();
        assert!(artifacts.join("headline_v1.json").exists());
    }
}
