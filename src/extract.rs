//! Structured-Output Extractor
//!
//! Parses tag-delimited LLM output. The grammar is deliberately small:
//!
//! ```text
//! match   := OPEN content CLOSE
//! OPEN    := "<" name ">"          | "```" lang
//! CLOSE   := "</" name ">"         | "```"
//! content := shortest run of any characters (newlines included)
//! ```
//!
//! Matches never overlap and are yielded in document order. Every call to
//! [`extract`] re-scans the input; the iterator it returns is finite and is
//! not restartable.

use lazy_static::lazy_static;
use regex::{CaptureMatches, Regex};
use std::collections::HashMap;
use std::fmt;
use std::ops::Range;
use std::sync::Mutex;
use thiserror::Error;

lazy_static! {
    static ref TAG_NAME: Regex = Regex::new(r"^[A-Za-z][A-Za-z0-9_\-]*$").unwrap();
    static ref PATTERN_CACHE: Mutex<HashMap<OutputTag, Regex>> = Mutex::new(HashMap::new());
}

/// Delimiter pair the pipeline expects around a piece of model output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputTag {
    /// `<name>...</name>`
    Xml(&'static str),
    /// ```` ```lang ... ``` ````
    Fence(&'static str),
}

impl OutputTag {
    pub fn open_marker(&self) -> String {
        match self {
            OutputTag::Xml(name) => format!("<{}>", name),
            OutputTag::Fence(lang) => format!("```{}", lang),
        }
    }

    pub fn close_marker(&self) -> String {
        match self {
            OutputTag::Xml(name) => format!("</{}>", name),
            OutputTag::Fence(_) => "```".to_string(),
        }
    }

    fn pattern(&self) -> Regex {
        let mut cache = PATTERN_CACHE.lock().unwrap_or_else(|p| p.into_inner());
        cache
            .entry(*self)
            .or_insert_with(|| {
                // A fence language must end at a word boundary: ```sql is not ```sqlite
                let boundary = match self {
                    OutputTag::Fence(lang) if lang.ends_with(|c: char| c.is_alphanumeric()) => r"\b",
                    _ => "",
                };
                let source = format!(
                    r"(?s){}{}(.*?){}",
                    regex::escape(&self.open_marker()),
                    boundary,
                    regex::escape(&self.close_marker())
                );
                // Markers are escaped, so the pattern is always valid
                Regex::new(&source).unwrap()
            })
            .clone()
    }
}

impl fmt::Display for OutputTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}...{}", self.open_marker(), self.close_marker())
    }
}

/// One extracted occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagMatch<'a> {
    /// Inner content, surrounding whitespace trimmed
    pub content: &'a str,
    /// Byte span of the whole match, markers included
    pub span: Range<usize>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("expected {tag} in model output but found none")]
pub struct ExtractionError {
    pub tag: String,
    pub raw_output: String,
}

/// Lazy iterator over the occurrences of one tag.
pub struct TagMatches<'r, 'a> {
    inner: CaptureMatches<'r, 'a>,
}

impl<'r, 'a> Iterator for TagMatches<'r, 'a> {
    type Item = TagMatch<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let caps = self.inner.next()?;
        let whole = caps.get(0)?;
        let inner = caps.get(1)?;
        Some(TagMatch {
            content: inner.as_str().trim(),
            span: whole.start()..whole.end(),
        })
    }
}

/// Owns the compiled pattern so the iterator can borrow it.
pub struct Extractor {
    tag: OutputTag,
    pattern: Regex,
}

impl Extractor {
    pub fn new(tag: OutputTag) -> Self {
        Self {
            tag,
            pattern: tag.pattern(),
        }
    }

    pub fn tag(&self) -> OutputTag {
        self.tag
    }

    /// All non-overlapping occurrences, in document order.
    pub fn matches<'r, 'a>(&'r self, text: &'a str) -> TagMatches<'r, 'a> {
        TagMatches {
            inner: self.pattern.captures_iter(text),
        }
    }

    /// Last non-empty occurrence, or an [`ExtractionError`].
    pub fn require_last<'a>(&self, text: &'a str) -> Result<TagMatch<'a>, ExtractionError> {
        self.matches(text)
            .filter(|m| !m.content.is_empty())
            .last()
            .ok_or_else(|| self.missing(text))
    }

    /// First non-empty occurrence, or an [`ExtractionError`].
    pub fn require_first<'a>(&self, text: &'a str) -> Result<TagMatch<'a>, ExtractionError> {
        self.matches(text)
            .find(|m| !m.content.is_empty())
            .ok_or_else(|| self.missing(text))
    }

    fn missing(&self, text: &str) -> ExtractionError {
        ExtractionError {
            tag: self.tag.to_string(),
            raw_output: text.to_string(),
        }
    }
}

/// Collects the contents of every `<name>...</name>` in `text`.
///
/// Returns an empty vector when the tag is absent; callers that need a value
/// use [`Extractor::require_last`] instead of indexing.
pub fn extract(text: &str, name: &'static str) -> Vec<String> {
    Extractor::new(OutputTag::Xml(name))
        .matches(text)
        .map(|m| m.content.to_string())
        .collect()
}

/// Body of the last well-formed ```` ```sql ```` block.
pub fn last_sql_block(text: &str) -> Result<String, ExtractionError> {
    Extractor::new(OutputTag::Fence("sql"))
        .require_last(text)
        .map(|m| m.content.to_string())
}

/// Whether a tag name is usable in the grammar above.
pub fn is_valid_tag_name(name: &str) -> bool {
    TAG_NAME.is_match(name)
}

/// Splits a sub-question list.
///
/// Accepts either one question per line (optionally bulleted or numbered) or
/// the `questions = ["a", "b"]` form the classification examples use.
pub fn parse_sub_questions(block: &str) -> Vec<String> {
    lazy_static! {
        static ref QUOTED: Regex = Regex::new(r#""([^"]+)""#).unwrap();
        static ref BULLET: Regex = Regex::new(r"^\s*(?:[-*]|\d+[.)])\s*").unwrap();
    }

    if block.contains('[') && block.contains('"') {
        return QUOTED
            .captures_iter(block)
            .filter_map(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
            .filter(|q| !q.is_empty())
            .collect();
    }

    block
        .lines()
        .map(|line| BULLET.replace(line, "").trim().to_string())
        .filter(|q| !q.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_returns_all_in_document_order() {
        let text = "a <links>first</links> b <links> second </links> c";
        assert_eq!(extract(text, "links"), vec!["first", "second"]);
    }

    #[test]
    fn test_extract_is_non_greedy() {
        let text = "<label>EASY</label> noise <label>NESTED</label>";
        let extractor = Extractor::new(OutputTag::Xml("label"));
        let spans: Vec<_> = extractor.matches(text).map(|m| m.span).collect();
        assert_eq!(spans.len(), 2);
        assert!(spans[0].end <= spans[1].start);
    }

    #[test]
    fn test_missing_tag_is_an_error() {
        let extractor = Extractor::new(OutputTag::Xml("links"));
        let err = extractor.require_last("the model ignored the format").unwrap_err();
        assert_eq!(err.tag, "<links>...</links>");
        assert!(extract("nothing here", "links").is_empty());
    }

    #[test]
    fn test_empty_tag_counts_as_missing() {
        let extractor = Extractor::new(OutputTag::Xml("links"));
        assert!(extractor.require_last("<links>   </links>").is_err());
    }

    #[test]
    fn test_last_sql_block_wins() {
        let text = "draft:\n```sql\nSELECT 1\n```\nbetter:\n```sql\nSELECT 2\n```\nfinal:\n```sql\nSELECT COUNT(*) FROM customers\n```";
        assert_eq!(last_sql_block(text).unwrap(), "SELECT COUNT(*) FROM customers");
    }

    #[test]
    fn test_single_sql_block() {
        let text = "SQL: ```sql SELECT name FROM singer```";
        assert_eq!(last_sql_block(text).unwrap(), "SELECT name FROM singer");
    }

    #[test]
    fn test_fence_language_is_matched_whole() {
        assert!(last_sql_block("```sqlite\nSELECT 1\n```").is_err());
        let text = "```sqlite\nSELECT 1\n```\nAs plain SQL:\n```sql\nSELECT 2\n```";
        assert_eq!(last_sql_block(text).unwrap(), "SELECT 2");
        assert_eq!(last_sql_block("SQL: ```sql\nSELECT 3\n```").unwrap(), "SELECT 3");
    }

    #[test]
    fn test_unterminated_fence_is_not_a_block() {
        assert!(last_sql_block("```sql\nSELECT 1").is_err());
    }

    #[test]
    fn test_multiline_content() {
        let text = "<links>\n[customers.customer_id,\n orders.total]\n</links>";
        assert_eq!(
            extract(text, "links"),
            vec!["[customers.customer_id,\n orders.total]"]
        );
    }

    #[test]
    fn test_parse_sub_questions_bracket_form() {
        let block = r#"questions = ["What is the average age?", "Which singers are older?"]"#;
        assert_eq!(
            parse_sub_questions(block),
            vec!["What is the average age?", "Which singers are older?"]
        );
    }

    #[test]
    fn test_parse_sub_questions_lines() {
        let block = "1. Which stadiums hosted concerts in 2014?\n- How many stadiums are there?\n";
        assert_eq!(
            parse_sub_questions(block),
            vec![
                "Which stadiums hosted concerts in 2014?",
                "How many stadiums are there?"
            ]
        );
    }

    #[test]
    fn test_tag_name_validation() {
        assert!(is_valid_tag_name("sub_questions"));
        assert!(!is_valid_tag_name("1abc"));
        assert!(!is_valid_tag_name("a b"));
    }
}
