//! Inline citation scanning.
//!
//! Generated narrative text may carry inline citations of the form
//! `{quoted phrase|FACT-1, FACT-2}`: a phrase tied to the source fact IDs
//! it was derived from. The scanner pulls these out so critiques can check
//! that every cited ID exists and that claims are grounded.

use std::sync::OnceLock;

use regex::Regex;

/// One inline citation: the cited phrase and the fact IDs it references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Citation {
    /// The phrase being attributed.
    pub phrase: String,
    /// Referenced fact IDs, e.g. `["FACT-1", "FACT-2"]`.
    pub ids: Vec<String>,
}

fn citation_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{([^{}|]+)\|([A-Z_]+-\d+(?:\s*,\s*[A-Z_]+-\d+)*)\}")
            .expect("citation regex is valid")
    })
}

/// Scan `text` for inline citations, in order of appearance. Malformed
/// citation-like spans are simply not matched; the scanner never fails.
pub fn scan_citations(text: &str) -> Vec<Citation> {
    citation_regex()
        .captures_iter(text)
        .map(|caps| Citation {
            phrase: caps[1].trim().to_string(),
            ids: caps[2].split(',').map(|id| id.trim().to_string()).collect(),
        })
        .collect()
}

/// Strip citation markup, leaving just the phrases, so cited text reads
/// naturally once validation is done.
pub fn strip_citations(text: &str) -> String {
    citation_regex().replace_all(text, "$1").into_owned()
}
