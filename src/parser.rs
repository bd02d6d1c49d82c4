//! Result parser.
//!
//! Model responses are free-form text that usually, but not always, is a
//! bare JSON document. [`parse`] tries an ordered list of extraction
//! strategies and returns the first candidate that decodes:
//!
//! | # | Strategy | Example input |
//! |---|----------|---------------|
//! | 1 | [`Strategy::Direct`] | `{"x":1}` |
//! | 2 | [`Strategy::Fenced`] | ```` Here you go: ```json {"x":1} ``` ```` |
//! | 3 | [`Strategy::Embedded`] | `The result is {"x":1}, as requested.` |
//! | 4 | [`Strategy::Line`] | one line of a multi-line answer is `{"x":1}` |
//! | 5 | [`Strategy::Segments`] | odd segments between triple backticks |
//!
//! No strategy panics on malformed input; a failed candidate is skipped.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::error::{Error, Result};

/// Which extraction strategy produced the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Direct,
    Fenced,
    Embedded,
    Line,
    Segments,
}

/// Parse a model response into JSON.
pub fn parse(raw_text: &str) -> Result<Value> {
    parse_with_strategy(raw_text).map(|(value, _)| value)
}

/// Like [`parse`], also reporting the strategy that succeeded.
pub fn parse_with_strategy(raw_text: &str) -> Result<(Value, Strategy)> {
    let text = raw_text.trim();
    if text.is_empty() {
        return Err(Error::UnparseableResponse("response is empty".into()));
    }

    let strategies: [(Strategy, fn(&str) -> Option<Value>); 5] = [
        (Strategy::Direct, direct),
        (Strategy::Fenced, fenced),
        (Strategy::Embedded, embedded),
        (Strategy::Line, line_by_line),
        (Strategy::Segments, segments),
    ];

    for (strategy, attempt) in strategies {
        if let Some(value) = attempt(text) {
            return Ok((value, strategy));
        }
    }

    Err(Error::UnparseableResponse(format!(
        "no JSON found in response starting with '{}'",
        text.chars().take(120).collect::<String>()
    )))
}

fn try_json(candidate: &str) -> Option<Value> {
    let candidate = candidate.trim();
    if candidate.is_empty() {
        return None;
    }
    serde_json::from_str(candidate).ok()
}

fn try_structured(candidate: &str) -> Option<Value> {
    try_json(candidate).filter(|v| v.is_object() || v.is_array())
}

fn direct(text: &str) -> Option<Value> {
    try_json(text)
}

fn fence_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)```[ \t]*(?:json|JSON)?[ \t]*\r?\n?(.*?)```").expect("valid fence regex")
    })
}

fn fenced(text: &str) -> Option<Value> {
    fence_regex()
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .find_map(|m| try_structured(m.as_str()))
}

fn greedy_regexes() -> &'static [Regex; 2] {
    static RE: OnceLock<[Regex; 2]> = OnceLock::new();
    RE.get_or_init(|| {
        [
            Regex::new(r"(?s)\{.*\}").expect("valid object regex"),
            Regex::new(r"(?s)\[.*\]").expect("valid array regex"),
        ]
    })
}

/// Outermost object or array substrings: first the widest greedy match,
/// then every balanced span in order of appearance.
fn embedded(text: &str) -> Option<Value> {
    for re in greedy_regexes() {
        if let Some(value) = re.find(text).and_then(|m| try_structured(m.as_str())) {
            return Some(value);
        }
    }
    balanced_spans(text)
        .into_iter()
        .find_map(|(start, end)| try_structured(&text[start..end]))
}

/// Byte ranges of balanced `{...}` / `[...]` spans, ignoring brackets that
/// appear inside string literals.
fn balanced_spans(text: &str) -> Vec<(usize, usize)> {
    let bytes = text.as_bytes();
    let mut spans = Vec::new();

    for (start, &b) in bytes.iter().enumerate() {
        if b != b'{' && b != b'[' {
            continue;
        }
        let mut stack: Vec<u8> = Vec::new();
        let mut in_string = false;
        let mut escaped = false;

        for (offset, &c) in bytes[start..].iter().enumerate() {
            if in_string {
                if escaped {
                    escaped = false;
                } else if c == b'\\' {
                    escaped = true;
                } else if c == b'"' {
                    in_string = false;
                }
                continue;
            }
            match c {
                b'"' => in_string = true,
                b'{' => stack.push(b'}'),
                b'[' => stack.push(b']'),
                b'}' | b']' => {
                    if stack.pop() != Some(c) {
                        break;
                    }
                    if stack.is_empty() {
                        spans.push((start, start + offset + 1));
                        break;
                    }
                }
                _ => {}
            }
        }
    }
    spans
}

fn line_by_line(text: &str) -> Option<Value> {
    text.lines().map(str::trim).find_map(|line| {
        let looks_complete = (line.starts_with('{') && line.ends_with('}'))
            || (line.starts_with('[') && line.ends_with(']'));
        if looks_complete {
            try_structured(line)
        } else {
            None
        }
    })
}

fn segments(text: &str) -> Option<Value> {
    text.split("```")
        .skip(1)
        .step_by(2)
        .find_map(|segment| try_structured(strip_language_tag(segment)))
}

fn strip_language_tag(segment: &str) -> &str {
    let trimmed = segment.trim_start();
    let first_line_end = trimmed.find('\n').unwrap_or(trimmed.len());
    let first_line = trimmed[..first_line_end].trim();
    let is_tag = !first_line.is_empty()
        && first_line
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if is_tag {
        &trimmed[first_line_end..]
    } else {
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_direct_json() {
        let (value, strategy) = parse_with_strategy("{\"x\":1}").unwrap();
        assert_eq!(value, json!({"x": 1}));
        assert_eq!(strategy, Strategy::Direct);
    }

    #[test]
    fn test_fenced_with_preamble() {
        let (value, strategy) =
            parse_with_strategy("Here is the result:\n```json\n{\"x\":1}\n```").unwrap();
        assert_eq!(value, json!({"x": 1}));
        assert_eq!(strategy, Strategy::Fenced);
    }

    #[test]
    fn test_fenced_array_without_tag() {
        let value = parse("Items:\n```\n[1, 2]\n```\nDone.").unwrap();
        assert_eq!(value, json!([1, 2]));
    }

    #[test]
    fn test_second_fence_wins_when_first_is_not_json() {
        let text = "```python\nprint('hi')\n```\nand\n```json\n{\"ok\": true}\n```";
        assert_eq!(parse(text).unwrap(), json!({"ok": true}));
    }

    #[test]
    fn test_embedded_object_in_prose() {
        let (value, strategy) =
            parse_with_strategy("Sure! The data is {\"dispensas\": []} as requested.").unwrap();
        assert_eq!(value, json!({"dispensas": []}));
        assert_eq!(strategy, Strategy::Embedded);
    }

    #[test]
    fn test_balanced_scan_with_braces_in_strings() {
        // The greedy span covers both objects and fails; the balanced scan
        // must skip the brace inside the string literal.
        let text = "first {\"a\": \"x}y\"} then {\"b\": 2}";
        assert_eq!(parse(text).unwrap(), json!({"a": "x}y"}));
    }

    #[test]
    fn test_line_strategy() {
        let spans = balanced_spans("no brackets");
        assert!(spans.is_empty());
        assert_eq!(line_by_line("intro\n  {\"k\": 1}  \noutro"), Some(json!({"k": 1})));
    }

    #[test]
    fn test_segments_strip_language_tag() {
        assert_eq!(
            segments("a ```JSON5\n{\"k\": [1]}\n``` b"),
            Some(json!({"k": [1]}))
        );
    }

    #[test]
    fn test_no_json_is_unparseable() {
        let err = parse("no json here").unwrap_err();
        assert!(matches!(err, Error::UnparseableResponse(_)));
    }

    #[test]
    fn test_empty_is_unparseable() {
        assert!(matches!(parse("   "), Err(Error::UnparseableResponse(_))));
    }

    #[test]
    fn test_unbalanced_input_does_not_panic() {
        for text in ["{", "}{", "[[[", "```", "```json\n{", "\"{\\\"", "{\"a\": [}"] {
            assert!(parse(text).is_err(), "{text}");
        }
    }
}
