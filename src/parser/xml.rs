//! Lightweight XML machinery for model output.
//!
//! Model-emitted XML is untrusted and frequently sloppy, so this module
//! splits the work in two: forgiving *carving* helpers that isolate the
//! region worth parsing ([`strip_tag_blocks`], [`extract_root_span`],
//! [`strip_speaker_prefix`]), and a strict minimal element-tree parser
//! ([`parse_xml`]) that rejects unbalanced tags and broken entities so a
//! malformed response becomes a correction prompt instead of a half-read
//! record. No external XML crate; the grammar subset the prompts ask for
//! (elements, text, entities) does not need one.

use super::error::ParseError;

/// One parsed element: tag name, child elements, and directly contained
/// text (entity-decoded, trimmed). Attributes are tolerated and discarded.
#[derive(Debug, Clone, PartialEq)]
pub struct XmlNode {
    /// Tag name.
    pub name: String,
    /// Child elements in document order.
    pub children: Vec<XmlNode>,
    /// Concatenated direct text content, entities decoded, trimmed.
    pub text: String,
}

impl XmlNode {
    /// First child with the given tag name.
    pub fn child(&self, name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.name == name)
    }

    /// All descendants (any depth, excluding self) with the given tag
    /// name, in document order.
    pub fn descendants<'a>(&'a self, name: &str, out: &mut Vec<&'a XmlNode>) {
        for child in &self.children {
            if child.name == name {
                out.push(child);
            }
            child.descendants(name, out);
        }
    }
}

fn malformed(reason: impl Into<String>) -> ParseError {
    ParseError::Malformed {
        reason: reason.into(),
    }
}

/// Decode XML/HTML entities in a text fragment. A stray `&` that does not
/// begin a recognized entity is an error: it is the single most common
/// escaping mistake models make, and letting it through would corrupt
/// downstream text.
pub fn unescape(text: &str) -> Result<String, ParseError> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let entity_zone = &rest[amp..];
        let Some(semi) = entity_zone.find(';').filter(|&i| i <= 12) else {
            return Err(malformed(format!(
                "invalid entity near '{}': use &amp; for a literal '&'",
                snippet(entity_zone)
            )));
        };
        let entity = &entity_zone[1..semi];
        match entity {
            "amp" => out.push('&'),
            "lt" => out.push('<'),
            "gt" => out.push('>'),
            "quot" => out.push('"'),
            "apos" => out.push('\''),
            _ if entity.starts_with("#x") || entity.starts_with("#X") => {
                let code = u32::from_str_radix(&entity[2..], 16)
                    .ok()
                    .and_then(char::from_u32)
                    .ok_or_else(|| malformed(format!("invalid numeric entity '&{entity};'")))?;
                out.push(code);
            }
            _ if entity.starts_with('#') => {
                let code = entity[1..]
                    .parse::<u32>()
                    .ok()
                    .and_then(char::from_u32)
                    .ok_or_else(|| malformed(format!("invalid numeric entity '&{entity};'")))?;
                out.push(code);
            }
            _ => {
                return Err(malformed(format!(
                    "unknown entity '&{entity};': use &amp; for a literal '&'"
                )))
            }
        }
        rest = &entity_zone[semi + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn snippet(s: &str) -> String {
    let end = s
        .char_indices()
        .nth(20)
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    s[..end].to_string()
}

/// Remove every complete `<tag>...</tag>` block, innermost first.
///
/// Used to discard scratch/reasoning regions the model was told to use
/// but which must never be parsed as data. An unclosed block is left in
/// place; the strict parse will reject it and trigger a correction.
pub fn strip_tag_blocks(text: &str, tag: &str) -> String {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let mut result = text.to_string();
    loop {
        // Innermost pair: the open tag closest before the first close tag.
        let Some(close_at) = result.find(&close) else {
            break;
        };
        let Some(open_at) = result[..close_at].rfind(&open) else {
            break;
        };
        result.replace_range(open_at..close_at + close.len(), "");
    }
    result
}

/// Extract the first longest balanced `<node>...</node>` span: from the
/// first open tag to the last close tag. Taking the widest span tolerates
/// duplicated or malformed wrapper tags inside the response.
pub fn extract_root_span<'a>(text: &'a str, node: &str) -> Option<&'a str> {
    let open = format!("<{node}>");
    let close = format!("</{node}>");
    let start = text.find(&open)?;
    let close_at = text.rfind(&close)?;
    if close_at < start {
        return None;
    }
    Some(&text[start..close_at + close.len()])
}

/// Strip a leading speaker marker ("Bot:", "Assistant:") left behind by
/// chat-formatted prompting.
pub fn strip_speaker_prefix(text: &str) -> &str {
    let trimmed = text.trim_start();
    for marker in ["Bot:", "Assistant:"] {
        if let Some(rest) = trimmed.strip_prefix(marker) {
            return rest.trim_start();
        }
    }
    trimmed
}

/// Parse a complete XML document (one root element, optionally surrounded
/// by whitespace/comments/declarations) into an [`XmlNode`] tree.
pub fn parse_xml(input: &str) -> Result<XmlNode, ParseError> {
    let mut parser = Parser { input, pos: 0 };
    parser.skip_misc()?;
    let root = parser.parse_element()?;
    parser.skip_misc()?;
    if parser.pos < parser.input.len() {
        return Err(malformed(format!(
            "trailing content after root element: '{}'",
            snippet(&parser.input[parser.pos..])
        )));
    }
    Ok(root)
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    /// Skip whitespace, comments, and `<?...?>` declarations.
    fn skip_misc(&mut self) -> Result<(), ParseError> {
        loop {
            let rest = self.rest();
            let trimmed = rest.trim_start();
            self.pos += rest.len() - trimmed.len();
            if trimmed.starts_with("<!--") {
                self.skip_comment()?;
            } else if trimmed.starts_with("<?") {
                let end = trimmed
                    .find("?>")
                    .ok_or_else(|| malformed("unterminated processing instruction"))?;
                self.pos += end + 2;
            } else {
                return Ok(());
            }
        }
    }

    fn skip_comment(&mut self) -> Result<(), ParseError> {
        let end = self
            .rest()
            .find("-->")
            .ok_or_else(|| malformed("unterminated comment"))?;
        self.pos += end + 3;
        Ok(())
    }

    fn read_name(&mut self) -> Result<String, ParseError> {
        let rest = self.rest();
        let end = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':')))
            .unwrap_or(rest.len());
        if end == 0 {
            return Err(malformed(format!(
                "expected tag name near '{}'",
                snippet(rest)
            )));
        }
        self.pos += end;
        Ok(rest[..end].to_string())
    }

    /// Skip past attributes to the closing `>`. Returns true for a
    /// self-closing `/>` tag.
    fn skip_to_tag_end(&mut self, name: &str) -> Result<bool, ParseError> {
        let bytes = self.input.as_bytes();
        let mut quote: Option<u8> = None;
        while self.pos < bytes.len() {
            let b = bytes[self.pos];
            match quote {
                Some(q) => {
                    if b == q {
                        quote = None;
                    }
                }
                None => match b {
                    b'"' | b'\'' => quote = Some(b),
                    b'>' => {
                        let self_closing = self.pos > 0 && bytes[self.pos - 1] == b'/';
                        self.pos += 1;
                        return Ok(self_closing);
                    }
                    _ => {}
                },
            }
            self.pos += 1;
        }
        Err(malformed(format!("unclosed tag <{name}>")))
    }

    fn parse_element(&mut self) -> Result<XmlNode, ParseError> {
        if !self.rest().starts_with('<') {
            return Err(malformed(format!(
                "expected '<' near '{}'",
                snippet(self.rest())
            )));
        }
        self.pos += 1;
        let name = self.read_name()?;
        let self_closing = self.skip_to_tag_end(&name)?;

        let mut node = XmlNode {
            name: name.clone(),
            children: Vec::new(),
            text: String::new(),
        };
        if self_closing {
            return Ok(node);
        }

        let mut text_acc = String::new();
        loop {
            let rest = self.rest();
            let Some(lt) = rest.find('<') else {
                return Err(malformed(format!("unclosed element <{name}>")));
            };
            text_acc.push_str(&unescape(&rest[..lt])?);
            self.pos += lt;

            let rest = self.rest();
            if rest.starts_with("</") {
                self.pos += 2;
                let close = self.read_name()?;
                let after = self.rest().trim_start();
                self.pos += self.rest().len() - after.len();
                if !self.rest().starts_with('>') {
                    return Err(malformed(format!("malformed closing tag </{close}")));
                }
                self.pos += 1;
                if close != name {
                    return Err(malformed(format!(
                        "mismatched closing tag </{close}> for <{name}>"
                    )));
                }
                node.text = text_acc.trim().to_string();
                return Ok(node);
            } else if rest.starts_with("<!--") {
                self.skip_comment()?;
            } else if rest.starts_with("<![CDATA[") {
                let inner = &rest["<![CDATA[".len()..];
                let end = inner
                    .find("]]>")
                    .ok_or_else(|| malformed("unterminated CDATA section"))?;
                text_acc.push_str(&inner[..end]);
                self.pos += "<![CDATA[".len() + end + 3;
            } else {
                node.children.push(self.parse_element()?);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_element() {
        let node = parse_xml("<result><headline>Hi</headline></result>").unwrap();
        assert_eq!(node.name, "result");
        assert_eq!(node.children.len(), 1);
        assert_eq!(node.children[0].name, "headline");
        assert_eq!(node.children[0].text, "Hi");
    }

    #[test]
    fn parse_nested_and_siblings() {
        let node =
            parse_xml("<a><b><c>deep</c></b><b><c>again</c></b></a>").unwrap();
        assert_eq!(node.children.len(), 2);
        assert_eq!(node.children[1].child("c").unwrap().text, "again");
    }

    #[test]
    fn parse_decodes_entities() {
        let node = parse_xml("<t>Smith &amp; Jones &lt;3</t>").unwrap();
        assert_eq!(node.text, "Smith & Jones <3");
    }

    #[test]
    fn parse_numeric_entities() {
        let node = parse_xml("<t>&#65;&#x42;</t>").unwrap();
        assert_eq!(node.text, "AB");
    }

    #[test]
    fn parse_ignores_attributes() {
        let node = parse_xml(r#"<item id="3" kind='x'>text</item>"#).unwrap();
        assert_eq!(node.name, "item");
        assert_eq!(node.text, "text");
    }

    #[test]
    fn parse_self_closing() {
        let node = parse_xml("<a><br/>after</a>").unwrap();
        assert_eq!(node.children[0].name, "br");
        assert_eq!(node.text, "after");
    }

    #[test]
    fn parse_skips_comments_and_cdata() {
        let node = parse_xml("<!-- lead --><a><!-- mid --><![CDATA[x & y]]></a>").unwrap();
        assert_eq!(node.text, "x & y");
    }

    #[test]
    fn parse_unclosed_tag_fails() {
        let err = parse_xml("<result><headline>Hi</result>").unwrap_err();
        assert!(matches!(err, ParseError::Malformed { .. }));
    }

    #[test]
    fn parse_mismatched_close_fails() {
        let err = parse_xml("<a><b>x</c></a>").unwrap_err();
        assert!(err.to_string().contains("mismatched"));
    }

    #[test]
    fn parse_stray_ampersand_is_escaping_related() {
        let err = parse_xml("<t>Barnes & Noble</t>").unwrap_err();
        assert!(err.is_escaping_related());
    }

    #[test]
    fn parse_trailing_content_fails() {
        let err = parse_xml("<a>x</a> and more <b>").unwrap_err();
        assert!(err.to_string().contains("trailing"));
    }

    #[test]
    fn test_strip_tag_blocks_nested_innermost() {
        let text = "<scratch>outer <scratch>inner</scratch> rest</scratch><a>keep</a>";
        assert_eq!(strip_tag_blocks(text, "scratch"), "<a>keep</a>");
    }

    #[test]
    fn test_strip_tag_blocks_multiple() {
        let text = "a<s>1</s>b<s>2</s>c";
        assert_eq!(strip_tag_blocks(text, "s"), "abc");
    }

    #[test]
    fn test_strip_tag_blocks_unclosed_left_alone() {
        let text = "a<s>unclosed";
        assert_eq!(strip_tag_blocks(text, "s"), "a<s>unclosed");
    }

    #[test]
    fn test_extract_root_span_basic() {
        let text = "preamble <result><x>1</x></result> postamble";
        assert_eq!(
            extract_root_span(text, "result"),
            Some("<result><x>1</x></result>")
        );
    }

    #[test]
    fn test_extract_root_span_takes_widest() {
        // Duplicated wrapper tags: first open to last close.
        let text = "<result>a</result> junk <result>b</result>";
        assert_eq!(
            extract_root_span(text, "result"),
            Some("<result>a</result> junk <result>b</result>")
        );
    }

    #[test]
    fn test_extract_root_span_missing() {
        assert_eq!(extract_root_span("no wrapper here", "result"), None);
        assert_eq!(extract_root_span("</result> before <result>", "result"), None);
    }

    #[test]
    fn test_strip_speaker_prefix() {
        assert_eq!(strip_speaker_prefix("Bot: <a>x</a>"), "<a>x</a>");
        assert_eq!(strip_speaker_prefix("  Assistant: hi"), "hi");
        assert_eq!(strip_speaker_prefix("plain"), "plain");
    }

    #[test]
    fn test_descendants_document_order() {
        let node = parse_xml("<r><q>1</q><grp><q>2</q></grp><q>3</q></r>").unwrap();
        let mut found = Vec::new();
        node.descendants("q", &mut found);
        let texts: Vec<&str> = found.iter().map(|n| n.text.as_str()).collect();
        assert_eq!(texts, vec!["1", "2", "3"]);
    }
}
