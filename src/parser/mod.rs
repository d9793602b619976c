//! Structured output parsing: carving, strict XML, locators, and
//! declarative extraction specs.

pub mod citations;
pub mod error;
pub mod locator;
pub mod prompt;
pub mod spec;
pub mod xml;

pub use citations::{scan_citations, strip_citations, Citation};
pub use error::ParseError;
pub use locator::Locator;
pub use prompt::PromptParser;
pub use spec::{ResultSpec, Verifier};
pub use xml::{parse_xml, XmlNode};
