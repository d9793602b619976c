//! Fabula: an LLM prompt-execution engine for synthetic narrative
//! datasets.
//!
//! The engine turns templated prompts into validated structured records:
//! render a [`PromptTemplate`] from the working [`ValueSet`], call the
//! model through a cache-fronted [`Caller`], carve structured XML out of
//! the response with a [`PromptParser`], run [`Critique`]s over the
//! parsed values, and on any failure re-prompt with a correction and the
//! full conversation so the model repairs its own output. [`Module`]s
//! bundle one such loop; a [`Pipeline`] chains modules over one shared
//! value set.
//!
//! Every model call is cached in SQLite keyed by content hash and model,
//! so re-running a pipeline replays identical results without touching
//! the network.
//!
//! # Quick start
//!
//! ```
//! use std::sync::Arc;
//! use fabula::{
//!     Caller, MockClient, ModuleBuilder, Pipeline, PromptParser,
//!     PromptTemplate, ResponseCache, ResultSpec, ReturnKind, ValueSet,
//! };
//!
//! # async fn run() -> fabula::Result<()> {
//! let client = Arc::new(MockClient::fixed(
//!     "<result><headline>Storm rolls in</headline></result>",
//! ));
//! let cache = Arc::new(ResponseCache::open("cache/responses.db")?);
//! let caller = Caller::new(client, "llama3.2", cache);
//!
//! let module = ModuleBuilder::new(
//!     "headline",
//!     PromptTemplate::new("headline", "Write a headline about {{TOPIC}}.", ReturnKind::Xml),
//! )
//! .parser(PromptParser::new().with_spec(ResultSpec::new("headline", ".//headline")))
//! .reads(["topic"])
//! .writes(["headline"])
//! .build()?;
//!
//! let pipeline = Pipeline::builder("demo")
//!     .initial_keys(["topic"])
//!     .step(module)
//!     .build()?;
//!
//! let out = pipeline
//!     .execute(&caller, None, ValueSet::new().with("topic", "weather"))
//!     .await?;
//! assert_eq!(out.get_str("headline"), Some("Storm rolls in"));
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod backoff;
pub mod cache;
pub mod caller;
pub mod client;
pub mod critique;
pub mod error;
pub mod history;
pub mod module;
pub mod parser;
pub mod pipeline;
pub mod template;
pub mod values;

pub use audit::{ArtifactScope, AuditSink};
pub use backoff::{with_backoff, BackoffConfig, JitterStrategy};
pub use cache::{content_hash, CacheKey, CacheRegistry, ResponseCache};
pub use caller::{CallOutcome, Caller};
pub use client::{
    ChatMessage, ChatRequest, GenerationConfig, LlmClient, MockClient, OllamaClient, Role,
};
pub use critique::{combine_corrections, Critique, CritiqueResult, FnCritique, RelaxingCritique};
pub use error::{EngineError, Result};
pub use history::{History, Turn};
pub use module::{Module, ModuleBuilder, VALIDITY_ISSUES_KEY};
pub use parser::{
    scan_citations, strip_citations, Citation, Locator, ParseError, PromptParser, ResultSpec,
    Verifier, XmlNode,
};
pub use pipeline::{BoxFut, Pipeline, PipelineBuilder, PipelineStep};
pub use template::{PromptTemplate, ReturnKind};
pub use values::{ValueSet, IS_VALID_KEY};
