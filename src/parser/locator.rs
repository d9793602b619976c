//! Result locators: tiny path expressions over the parsed element tree.
//!
//! Two forms are supported, matching what extraction prompts actually ask
//! for: `.//tag` finds every descendant with that tag at any depth, and
//! `a/b/c` walks a child path relative to the root. Matches are always
//! returned in document order so downstream record numbering is stable.

use super::xml::XmlNode;

#[derive(Debug, Clone, PartialEq)]
enum Pattern {
    /// `.//tag` — any-depth descendant search.
    Descendant(String),
    /// `a/b/c` — child path relative to (and excluding) the root.
    Path(Vec<String>),
}

/// A compiled locator expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Locator {
    raw: String,
    pattern: Pattern,
}

impl Locator {
    /// Compile a locator. Parsing is infallible: anything that is not a
    /// `.//tag` descendant form is treated as a child path.
    pub fn new(expr: impl Into<String>) -> Self {
        let raw = expr.into();
        let pattern = if let Some(tag) = raw.strip_prefix(".//") {
            Pattern::Descendant(tag.to_string())
        } else {
            Pattern::Path(
                raw.split('/')
                    .filter(|seg| !seg.is_empty() && *seg != ".")
                    .map(str::to_string)
                    .collect(),
            )
        };
        Self { raw, pattern }
    }

    /// The original expression text, for diagnostics.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// All nodes under `root` the locator selects, in document order.
    pub fn matches<'a>(&self, root: &'a XmlNode) -> Vec<&'a XmlNode> {
        match &self.pattern {
            Pattern::Descendant(tag) => {
                let mut found = Vec::new();
                root.descendants(tag, &mut found);
                found
            }
            Pattern::Path(segments) => {
                let mut current = vec![root];
                for segment in segments {
                    let mut next = Vec::new();
                    for node in current {
                        for child in &node.children {
                            if child.name == *segment {
                                next.push(child);
                            }
                        }
                    }
                    current = next;
                }
                // An empty path would select the root itself; locators
                // always name at least one step, so guard anyway.
                if segments.is_empty() {
                    Vec::new()
                } else {
                    current
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::xml::parse_xml;

    fn tree() -> XmlNode {
        parse_xml(
            "<result>\
               <item><name>a</name></item>\
               <group><item><name>b</name></item></group>\
               <item><name>c</name></item>\
             </result>",
        )
        .unwrap()
    }

    #[test]
    fn test_descendant_form_matches_any_depth() {
        let root = tree();
        let locator = Locator::new(".//item");
        let names: Vec<&str> = locator
            .matches(&root)
            .iter()
            .map(|n| n.child("name").unwrap().text.as_str())
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_path_form_matches_direct_children_only() {
        let root = tree();
        let locator = Locator::new("item");
        assert_eq!(locator.matches(&root).len(), 2);

        let nested = Locator::new("group/item/name");
        let found = nested.matches(&root);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].text, "b");
    }

    #[test]
    fn test_no_matches_is_empty() {
        let root = tree();
        assert!(Locator::new(".//missing").matches(&root).is_empty());
        assert!(Locator::new("group/missing").matches(&root).is_empty());
    }

    #[test]
    fn test_as_str_preserves_expression() {
        assert_eq!(Locator::new(".//turn").as_str(), ".//turn");
    }
}
