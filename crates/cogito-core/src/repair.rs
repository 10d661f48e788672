//! Turns raw model output into a JSON object.
//!
//! Model replies are untrusted text: prose around the JSON, markdown fences,
//! single quotes, bare keys, trailing commas, stray escapes. Repair runs in
//! order of increasing permissiveness:
//!
//! 1. structured payloads pass through untouched
//! 2. [`CLEANING_STEPS`] normalize the whole text
//! 3. strict parse of the cleaned text
//! 4. brace-matched candidates, longest first
//! 5. [`CANDIDATE_REPAIRS`] applied to each candidate, then strict parse
//!
//! The first candidate that parses into a non-empty object wins. Every step
//! is a pure `&str -> String` function, so identical input always yields the
//! identical result. Scanning is string-aware: braces, fences and whitespace
//! inside double-quoted literals are left alone.

use serde_json::Value;
use tracing::debug;

use crate::error::{CogitoError, CogitoResult};

/// A named, total text transformation.
#[derive(Clone, Copy)]
pub struct TextStep {
    pub name: &'static str,
    pub apply: fn(&str) -> String,
}

/// Whole-text cleanup, applied in order before the first parse attempt.
pub const CLEANING_STEPS: &[TextStep] = &[
    TextStep {
        name: "strip_code_fences",
        apply: strip_code_fences,
    },
    TextStep {
        name: "strip_backticks",
        apply: strip_backticks,
    },
    TextStep {
        name: "strip_markup_tags",
        apply: strip_markup_tags,
    },
    TextStep {
        name: "normalize_control_chars",
        apply: normalize_control_chars,
    },
    TextStep {
        name: "collapse_whitespace",
        apply: collapse_whitespace,
    },
];

/// Syntactic fixes, applied in order to each extracted candidate.
pub const CANDIDATE_REPAIRS: &[TextStep] = &[
    TextStep {
        name: "unescape_embedded_json",
        apply: unescape_embedded_json,
    },
    TextStep {
        name: "single_to_double_quotes",
        apply: single_to_double_quotes,
    },
    TextStep {
        name: "quote_bare_keys",
        apply: quote_bare_keys,
    },
    TextStep {
        name: "strip_trailing_commas",
        apply: strip_trailing_commas,
    },
    TextStep {
        name: "drop_invalid_escapes",
        apply: drop_invalid_escapes,
    },
];

/// Repair a payload that may already be structured.
pub fn repair_payload(payload: Value) -> CogitoResult<Value> {
    match payload {
        Value::Object(map) if !map.is_empty() => Ok(Value::Object(map)),
        Value::String(text) => repair(&text),
        other => Err(CogitoError::unparsable(&other.to_string())),
    }
}

/// Extract a non-empty JSON object from raw text.
pub fn repair(raw: &str) -> CogitoResult<Value> {
    let cleaned = clean(raw);

    if let Some(value) = parse_object(&cleaned) {
        debug!("repair: cleaned text parsed directly");
        return Ok(value);
    }

    let candidates = extract_candidates(&cleaned);
    debug!(count = candidates.len(), "repair: brace-matched candidates");

    for (index, candidate) in candidates.iter().enumerate() {
        let fixed = apply_steps(candidate, CANDIDATE_REPAIRS);
        if let Some(value) = parse_object(&fixed) {
            debug!(index, len = candidate.len(), "repair: candidate accepted");
            return Ok(value);
        }
    }

    Err(CogitoError::unparsable(raw))
}

/// Run every cleaning step over `raw`.
pub fn clean(raw: &str) -> String {
    apply_steps(raw, CLEANING_STEPS).trim().to_string()
}

fn apply_steps(text: &str, steps: &[TextStep]) -> String {
    steps
        .iter()
        .fold(text.to_string(), |acc, step| (step.apply)(&acc))
}

fn parse_object(text: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) if !map.is_empty() => Some(Value::Object(map)),
        _ => None,
    }
}

/// Every maximal balanced `{...}` block, longest first. Ties keep their
/// order of appearance.
///
/// An opener that never closes (a stray brace in prose, a truncated draft)
/// is skipped and the scan resumes at the next character, so later blocks
/// are still found.
pub fn extract_candidates(text: &str) -> Vec<&str> {
    let mut candidates = Vec::new();
    let mut from = 0usize;

    while let Some(offset) = text[from..].find('{') {
        let start = from + offset;
        match block_len(&text[start..]) {
            Some(len) => {
                candidates.push(&text[start..start + len]);
                from = start + len;
            }
            None => from = start + 1,
        }
    }

    // sort_by is stable, so equal lengths keep scan order.
    candidates.sort_by(|a, b| b.len().cmp(&a.len()));
    candidates
}

/// Byte length of the balanced block opening at the start of `text`, or
/// `None` when it never closes.
///
/// Inside the block, `"` and `'` delimit string literals whose braces do not
/// count toward depth. A `'` only opens a literal where a value or key may
/// start and only closes one where a value may end, so apostrophes inside
/// words are plain characters.
fn block_len(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut prev = '{';

    for (i, c) in text.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        if c == '\\' {
            escaped = true;
            continue;
        }

        match quote {
            Some('\'') if c == '\'' && ends_value_str(&text[i + 1..]) => quote = None,
            Some('"') if c == '"' => quote = None,
            Some(_) => {}
            None => match c {
                '"' => quote = Some(c),
                '\'' if starts_value(prev) => quote = Some(c),
                '{' => depth += 1,
                '}' => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        return Some(i + 1);
                    }
                }
                _ => {}
            },
        }
        if quote.is_none() && !c.is_whitespace() {
            prev = c;
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Segmentation: plain text vs double-quoted literals
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Segment<'a> {
    Plain(&'a str),
    Quoted(&'a str),
}

/// Split `text` into plain runs and terminated double-quoted literals
/// (quotes included). An unterminated quote leaves the rest plain.
fn segments(text: &str) -> Vec<Segment<'_>> {
    let mut out = Vec::new();
    let mut plain_start = 0;
    let bytes = text.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'"' {
            i += 1;
            continue;
        }
        let Some(end) = closing_quote(bytes, i) else {
            break;
        };
        if plain_start < i {
            out.push(Segment::Plain(&text[plain_start..i]));
        }
        out.push(Segment::Quoted(&text[i..=end]));
        plain_start = end + 1;
        i = end + 1;
    }

    if plain_start < text.len() {
        out.push(Segment::Plain(&text[plain_start..]));
    }
    out
}

fn closing_quote(bytes: &[u8], open: usize) -> Option<usize> {
    let mut k = open + 1;
    while k < bytes.len() {
        match bytes[k] {
            b'\\' => k += 2,
            b'"' => return Some(k),
            _ => k += 1,
        }
    }
    None
}

fn map_segments(
    text: &str,
    plain: impl Fn(&str) -> String,
    quoted: impl Fn(&str) -> String,
) -> String {
    let mut out = String::with_capacity(text.len());
    for segment in segments(text) {
        match segment {
            Segment::Plain(s) => out.push_str(&plain(s)),
            Segment::Quoted(s) => out.push_str(&quoted(s)),
        }
    }
    out
}

fn map_plain(text: &str, plain: impl Fn(&str) -> String) -> String {
    map_segments(text, plain, str::to_string)
}

// ---------------------------------------------------------------------------
// Cleaning steps
// ---------------------------------------------------------------------------

/// Drop ``` fence markers and the language tag right after an opening one.
fn strip_code_fences(text: &str) -> String {
    map_plain(text, |s| {
        let mut out = String::with_capacity(s.len());
        let mut rest = s;
        while let Some(pos) = rest.find("```") {
            out.push_str(&rest[..pos]);
            rest = &rest[pos + 3..];
            let tag_len = rest
                .find(|c: char| !c.is_ascii_alphanumeric())
                .unwrap_or(rest.len());
            rest = &rest[tag_len..];
        }
        out.push_str(rest);
        out
    })
}

fn strip_backticks(text: &str) -> String {
    map_plain(text, |s| s.replace('`', ""))
}

/// Remove `<tag ...>` and `</tag>` markup. A `<` not followed by a tag name
/// is kept.
fn strip_markup_tags(text: &str) -> String {
    map_plain(text, |s| {
        let mut out = String::with_capacity(s.len());
        let mut rest = s;
        while let Some(pos) = rest.find('<') {
            out.push_str(&rest[..pos]);
            let after = &rest[pos + 1..];
            match tag_len(after) {
                Some(len) => rest = &after[len..],
                None => {
                    out.push('<');
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        out
    })
}

/// Length of `tag>` (through the closing `>`) if `after` starts a tag.
fn tag_len(after: &str) -> Option<usize> {
    let name_start = usize::from(after.starts_with('/'));
    let first = after[name_start..].chars().next()?;
    if !first.is_ascii_alphabetic() {
        return None;
    }
    for (i, c) in after.char_indices() {
        match c {
            '>' => return Some(i + 1),
            '<' | '{' | '}' | '\n' => return None,
            _ => {}
        }
    }
    None
}

/// Escape raw control characters inside literals; drop them elsewhere,
/// keeping ordinary whitespace.
fn normalize_control_chars(text: &str) -> String {
    map_segments(
        text,
        |s| {
            s.chars()
                .filter(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t'))
                .collect()
        },
        |s| {
            let mut out = String::with_capacity(s.len());
            for c in s.chars() {
                match c {
                    '\n' => out.push_str("\\n"),
                    '\r' => out.push_str("\\r"),
                    '\t' => out.push_str("\\t"),
                    c if c.is_control() => {}
                    c => out.push(c),
                }
            }
            out
        },
    )
}

fn collapse_whitespace(text: &str) -> String {
    map_plain(text, |s| {
        let mut out = String::with_capacity(s.len());
        let mut in_space = false;
        for c in s.chars() {
            if c.is_whitespace() {
                if !in_space {
                    out.push(' ');
                }
                in_space = true;
            } else {
                out.push(c);
                in_space = false;
            }
        }
        out
    })
}

// ---------------------------------------------------------------------------
// Candidate repairs
// ---------------------------------------------------------------------------

/// A candidate whose every `"` is escaped is JSON that was string-encoded
/// once; remove one level of escaping.
fn unescape_embedded_json(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut saw_escaped = false;
    for (i, &b) in bytes.iter().enumerate() {
        if b == b'"' {
            if i > 0 && bytes[i - 1] == b'\\' {
                saw_escaped = true;
            } else {
                return text.to_string();
            }
        }
    }
    if !saw_escaped {
        return text.to_string();
    }

    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(&next) = chars.peek() {
                if next == '"' || next == '\\' {
                    out.push(next);
                    chars.next();
                    continue;
                }
            }
        }
        out.push(c);
    }
    out
}

/// Rewrite `'...'` literals as `"..."`. A `'` only closes a literal when the
/// next non-space character ends a value (`,` `}` `]` `:`) or the text ends,
/// so apostrophes inside words survive.
fn single_to_double_quotes(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '"' => {
                let end = closing_double(&chars, i);
                out.extend(&chars[i..=end]);
                i = end + 1;
            }
            '\'' if !opens_value(&chars, i) => {
                out.push('\'');
                i += 1;
            }
            '\'' => match closing_single(&chars, i) {
                Some(end) => {
                    out.push('"');
                    let mut k = i + 1;
                    while k < end {
                        let c = chars[k];
                        if c == '\\' && k + 1 < end {
                            if chars[k + 1] == '\'' {
                                out.push('\'');
                            } else {
                                out.push(c);
                                out.push(chars[k + 1]);
                            }
                            k += 2;
                            continue;
                        }
                        if c == '"' {
                            out.push_str("\\\"");
                        } else {
                            out.push(c);
                        }
                        k += 1;
                    }
                    out.push('"');
                    i = end + 1;
                }
                None => {
                    out.push('\'');
                    i += 1;
                }
            },
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

fn closing_double(chars: &[char], open: usize) -> usize {
    let mut k = open + 1;
    while k < chars.len() {
        match chars[k] {
            '\\' => k += 2,
            '"' => return k,
            _ => k += 1,
        }
    }
    chars.len() - 1
}

fn closing_single(chars: &[char], open: usize) -> Option<usize> {
    let mut k = open + 1;
    while k < chars.len() {
        match chars[k] {
            '\\' => k += 2,
            '\'' if ends_value(chars, k + 1) => return Some(k),
            _ => k += 1,
        }
    }
    None
}

fn ends_value(chars: &[char], from: usize) -> bool {
    match chars[from.min(chars.len())..]
        .iter()
        .find(|c| !c.is_whitespace())
    {
        None => true,
        Some(c) => matches!(c, ',' | '}' | ']' | ':'),
    }
}

fn opens_value(chars: &[char], at: usize) -> bool {
    chars[..at]
        .iter()
        .rev()
        .find(|c| !c.is_whitespace())
        .map_or(true, |&c| starts_value(c))
}

fn starts_value(prev: char) -> bool {
    matches!(prev, '{' | ',' | ':' | '[')
}

fn ends_value_str(rest: &str) -> bool {
    match rest.chars().find(|c| !c.is_whitespace()) {
        None => true,
        Some(c) => matches!(c, ',' | '}' | ']' | ':'),
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// `{key: 1, other_key: 2}` becomes `{"key": 1, "other_key": 2}`.
fn quote_bare_keys(text: &str) -> String {
    map_plain(text, |s| {
        let chars: Vec<char> = s.chars().collect();
        let mut out = String::with_capacity(s.len() + 8);
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            out.push(c);
            i += 1;
            if c != '{' && c != ',' {
                continue;
            }
            let ws_end = skip_ws(&chars, i);
            let mut ident_end = ws_end;
            while ident_end < chars.len() && is_ident_char(chars[ident_end]) {
                ident_end += 1;
            }
            if ident_end == ws_end {
                continue;
            }
            let colon = skip_ws(&chars, ident_end);
            if colon < chars.len() && chars[colon] == ':' {
                out.extend(&chars[i..ws_end]);
                out.push('"');
                out.extend(&chars[ws_end..ident_end]);
                out.push('"');
                i = ident_end;
            }
        }
        out
    })
}

fn skip_ws(chars: &[char], mut i: usize) -> usize {
    while i < chars.len() && chars[i].is_whitespace() {
        i += 1;
    }
    i
}

fn strip_trailing_commas(text: &str) -> String {
    map_plain(text, |s| {
        let chars: Vec<char> = s.chars().collect();
        let mut out = String::with_capacity(s.len());
        for (i, &c) in chars.iter().enumerate() {
            if c == ',' {
                let next = skip_ws(&chars, i + 1);
                if next < chars.len() && matches!(chars[next], '}' | ']') {
                    continue;
                }
            }
            out.push(c);
        }
        out
    })
}

/// Inside literals, drop the backslash of any escape JSON does not define.
fn drop_invalid_escapes(text: &str) -> String {
    map_segments(text, str::to_string, |s| {
        let chars: Vec<char> = s.chars().collect();
        let mut out = String::with_capacity(s.len());
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            if c != '\\' || i + 1 >= chars.len() {
                out.push(c);
                i += 1;
                continue;
            }
            let next = chars[i + 1];
            let valid = match next {
                '"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't' => true,
                'u' => chars
                    .get(i + 2..i + 6)
                    .is_some_and(|hex| hex.iter().all(char::is_ascii_hexdigit)),
                _ => false,
            };
            if valid {
                out.push(c);
            }
            out.push(next);
            i += 2;
        }
        out
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_structured_payload_passes_through() {
        let obj = json!({"decision": "wait", "thought": "x", "explanation": "y"});
        assert_eq!(repair_payload(obj.clone()).unwrap(), obj);
    }

    #[test]
    fn test_string_payload_is_repaired() {
        let payload = Value::String(r#"{"insight": "walls"}"#.into());
        assert_eq!(repair_payload(payload).unwrap(), json!({"insight": "walls"}));
    }

    #[test]
    fn test_strict_json_is_returned_exactly() {
        let raw = r#"{"decision":"move","thought":"x","explanation":"y","n":[1,2,{"a":null}]}"#;
        let expected: Value = serde_json::from_str(raw).unwrap();
        assert_eq!(repair(raw).unwrap(), expected);
    }

    #[test]
    fn test_fenced_json_with_prose() {
        let raw = "Here's my answer:\n```json\n{\"decision\":\"move\",\"thought\":\"x\",\"explanation\":\"y\"}\n```";
        assert_eq!(
            repair(raw).unwrap(),
            json!({"decision": "move", "thought": "x", "explanation": "y"})
        );
    }

    #[test]
    fn test_round_trip_preserves_string_contents() {
        let original = json!({
            "thought": "a  spaced <b>bold</b> `tick` ```fence``` {brace}",
            "insight": "line\nbreak",
            "selfAwarenessChange": -1.5,
            "learningFocus": "it's \"quoted\""
        });
        let raw = format!(
            "Sure, here you go.\n\n```json\n{}\n```\nHope that helps!",
            serde_json::to_string(&original).unwrap()
        );
        assert_eq!(repair(&raw).unwrap(), original);
    }

    #[test]
    fn test_single_quotes_and_trailing_comma() {
        let raw = "{'decision': 'take', 'thought': 'z', 'explanation': 'w',}";
        assert_eq!(
            repair(raw).unwrap(),
            json!({"decision": "take", "thought": "z", "explanation": "w"})
        );
    }

    #[test]
    fn test_apostrophe_inside_single_quoted_value() {
        let raw = "{'thought': 'it's dark here', 'insight': 'ok'}";
        assert_eq!(
            repair(raw).unwrap(),
            json!({"thought": "it's dark here", "insight": "ok"})
        );
    }

    #[test]
    fn test_bare_keys() {
        let raw = "{decision: \"wait\", thought: \"x\", explanation: \"y\"}";
        assert_eq!(
            repair(raw).unwrap(),
            json!({"decision": "wait", "thought": "x", "explanation": "y"})
        );
    }

    #[test]
    fn test_escaped_embedded_json() {
        let raw = r#"The result is {\"decision\":\"escape\",\"thought\":\"now\",\"explanation\":\"go\"}"#;
        assert_eq!(
            repair(raw).unwrap(),
            json!({"decision": "escape", "thought": "now", "explanation": "go"})
        );
    }

    #[test]
    fn test_invalid_escape_dropped() {
        let raw = r#"{"thought": "a \q b"}"#;
        assert_eq!(repair(raw).unwrap(), json!({"thought": "a q b"}));
    }

    #[test]
    fn test_no_json_is_unparsable() {
        let err = repair("I cannot comply with that request.").unwrap_err();
        match err {
            CogitoError::UnparsableResponse { length, preview } => {
                assert_eq!(length, 34);
                assert_eq!(preview, "I cannot comply with that request.");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_empty_object_is_rejected() {
        assert!(repair("{}").is_err());
        assert!(repair("[1, 2, 3]").is_err());
    }

    #[test]
    fn test_braces_inside_strings_do_not_split_candidates() {
        let raw = r#"Answer: {"thought": "a{b", "insight": "c}d"} done"#;
        assert_eq!(
            repair(raw).unwrap(),
            json!({"thought": "a{b", "insight": "c}d"})
        );
    }

    #[test]
    fn test_candidates_sorted_longest_first() {
        let text = r#"{"a":1} and {"bb":22} and {"c":3}"#;
        assert_eq!(
            extract_candidates(text),
            vec![r#"{"bb":22}"#, r#"{"a":1}"#, r#"{"c":3}"#]
        );
    }

    #[test]
    fn test_longest_valid_candidate_wins() {
        let raw = r#"draft {"thought": "short"} final {"thought": "longer answer", "insight": "x"}"#;
        assert_eq!(
            repair(raw).unwrap(),
            json!({"thought": "longer answer", "insight": "x"})
        );
    }

    #[test]
    fn test_unbalanced_candidate_skipped() {
        let raw = r#"{"thought": "a", "insight": "b"} then {"broken": "#;
        assert_eq!(repair(raw).unwrap(), json!({"thought": "a", "insight": "b"}));
    }

    #[test]
    fn test_stray_brace_in_prose_does_not_hide_object() {
        let raw = r#"Sure :-{ here it is: {"decision":"move","thought":"x","explanation":"y"}"#;
        assert_eq!(
            repair(raw).unwrap(),
            json!({"decision": "move", "thought": "x", "explanation": "y"})
        );
    }

    #[test]
    fn test_truncated_draft_before_answer() {
        let raw = "Draft: {\"decision\": \"wa\nFinal:\n```json\n{\"decision\": \"wait\", \"thought\": \"listen\", \"explanation\": \"guard nearby\"}\n```";
        assert_eq!(
            repair(raw).unwrap(),
            json!({"decision": "wait", "thought": "listen", "explanation": "guard nearby"})
        );
    }

    #[test]
    fn test_unmatched_opener_skipped_by_scanner() {
        let text = r#"a { b {"x":1} c {"yy":2}"#;
        assert_eq!(extract_candidates(text), vec![r#"{"yy":2}"#, r#"{"x":1}"#]);
    }

    #[test]
    fn test_cleaning_keeps_literal_contents() {
        let cleaned = clean("```json\n{\"a\":  \"x  <i>y</i>\"}\n```");
        assert_eq!(cleaned, "{\"a\": \"x  <i>y</i>\"}");
    }

    #[test]
    fn test_markup_tags_removed_outside_literals() {
        assert_eq!(strip_markup_tags("<json>{\"a\":1}</json>"), "{\"a\":1}");
        assert_eq!(strip_markup_tags("1 < 2"), "1 < 2");
    }

    #[test]
    fn test_repairs_are_identity_on_valid_json() {
        let valid = r#"{"a": "it's", "b": [1, 2], "c": {"d": "x\ny"}}"#;
        for step in CANDIDATE_REPAIRS {
            assert_eq!((step.apply)(valid), valid, "step {} changed valid JSON", step.name);
        }
    }

    #[test]
    fn test_repair_is_deterministic() {
        let raw = "noise {'thought': 'a',} more {thought: 'b', insight: 'c'}";
        assert_eq!(repair(raw).unwrap(), repair(raw).unwrap());
    }
}
