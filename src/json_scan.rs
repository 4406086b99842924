//! Balanced-bracket scanning for JSON embedded in model output.
//!
//! String literals are tracked so braces inside quoted text do not count.
//! All delimiters are ASCII, so byte offsets returned here are always on
//! char boundaries.

use serde::de::DeserializeOwned;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scan {
    /// Byte offset one past the closing bracket
    Complete(usize),
    /// Input ended before the span closed
    Incomplete,
    /// The span cannot be JSON: mismatched closer or a raw newline inside a string
    Malformed,
}

/// Scan the span opening at `start`, which must index `{` or `[`.
pub fn scan_span(text: &str, start: usize) -> Scan {
    let bytes = text.as_bytes();
    if !matches!(bytes.get(start), Some(b'{') | Some(b'[')) {
        return Scan::Malformed;
    }

    let mut closers: Vec<u8> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            } else if b == b'\n' {
                return Scan::Malformed;
            }
            continue;
        }

        match b {
            b'"' => in_string = true,
            b'{' => closers.push(b'}'),
            b'[' => closers.push(b']'),
            b'}' | b']' => {
                if closers.pop() != Some(b) {
                    return Scan::Malformed;
                }
                if closers.is_empty() {
                    return Scan::Complete(start + offset + 1);
                }
            }
            _ => {}
        }
    }

    Scan::Incomplete
}

/// Offsets of every `{` or `[` in `text`
pub fn openers(text: &str) -> impl Iterator<Item = usize> + '_ {
    text.match_indices(|c: char| c == '{' || c == '[').map(|(i, _)| i)
}

/// First balanced span that deserializes as `T`, scanning left to right.
pub fn find_json<T: DeserializeOwned>(text: &str) -> Option<T> {
    openers(text).find_map(|start| match scan_span(text, start) {
        Scan::Complete(end) => serde_json::from_str(&text[start..end]).ok(),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_scan_complete_object() {
        let text = r#"noise {"a": {"b": [1, 2]}} tail"#;
        let start = text.find('{').unwrap();
        assert_eq!(scan_span(text, start), Scan::Complete(text.find(" tail").unwrap()));
    }

    #[test]
    fn test_braces_inside_strings_are_ignored() {
        let text = r#"{"content": "a } tricky { \" quote"}"#;
        assert_eq!(scan_span(text, 0), Scan::Complete(text.len()));
    }

    #[test]
    fn test_incomplete_and_malformed() {
        assert_eq!(scan_span(r#"{"agent": "Poet", "con"#, 0), Scan::Incomplete);
        assert_eq!(scan_span("{\"agent\": \"Po\n", 0), Scan::Malformed);
        assert_eq!(scan_span("{]", 0), Scan::Malformed);
        assert_eq!(scan_span("abc", 0), Scan::Malformed);
    }

    #[test]
    fn test_find_json_skips_invalid_spans() {
        let text = "Here you go: {not json} and then {\"title\": \"Map\"} done";
        let value: Value = find_json(text).unwrap();
        assert_eq!(value["title"], "Map");
    }

    #[test]
    fn test_find_json_array() {
        let text = "Suggestions:\n[\"one\", \"two\"]\nHope that helps";
        let list: Vec<String> = find_json(text).unwrap();
        assert_eq!(list, vec!["one", "two"]);
    }

    #[test]
    fn test_find_json_multibyte_text() {
        let text = "— ابو says {\"reply\": \"ṣabr\"} ✓";
        let value: Value = find_json(text).unwrap();
        assert_eq!(value["reply"], "ṣabr");
    }
}
