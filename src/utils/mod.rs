//! Small shared utilities used throughout the crate.

pub mod truncate;

pub use truncate::{approx_token_count, truncate_text, TruncationPolicy};

/// Depth-counting extraction of the first balanced `{ ... }` span in `text`.
///
/// This is the "robust extractor" the Supervisor (and every other component that
/// has to parse LLM-generated JSON) relies on: strip code-fence markers, scan for
/// the first `{`, then walk forward counting brace depth while ignoring braces that
/// appear inside string literals, until depth returns to zero. A naive
/// `find('{')`/`rfind('}')` pair mis-extracts whenever the model appends trailing
/// prose that itself contains braces.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let stripped = strip_code_fence(text);
    let bytes = stripped.as_bytes();
    let start = stripped.find('{')?;

    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        let c = b as char;
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&stripped[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        let rest = rest.trim_start_matches('\n');
        if let Some(end) = rest.rfind("```") {
            return rest[..end].trim();
        }
        return rest.trim();
    }
    trimmed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_plain_object() {
        let text = r#"{"a": 1, "b": {"c": 2}}"#;
        assert_eq!(extract_json_object(text), Some(text));
    }

    #[test]
    fn extracts_with_trailing_prose() {
        let text = r#"Sure, here is the plan: {"a": 1} Hope that helps! {not json}"#;
        assert_eq!(extract_json_object(text), Some(r#"{"a": 1}"#));
    }

    #[test]
    fn handles_code_fence() {
        let text = "```json\n{\"a\": 1}\n```";
        assert_eq!(extract_json_object(text), Some(r#"{"a": 1}"#));
    }

    #[test]
    fn ignores_braces_in_strings() {
        let text = r#"{"a": "contains } brace", "b": 2}"#;
        assert_eq!(extract_json_object(text), Some(text));
    }

    #[test]
    fn returns_none_when_unbalanced() {
        assert_eq!(extract_json_object("no json here"), None);
    }
}
