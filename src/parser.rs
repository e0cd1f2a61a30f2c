//! Best-effort extraction of a SQL statement and a final answer from
//! unstructured agent text.
//!
//! Two entry points mirror the agent's double-path contract:
//! [`parse_agent_output`] for the success path and [`parse_agent_error`]
//! for a caught agent error, where the answer is truncated to the first
//! line after the marker because exception messages tend to continue with
//! trace noise. Neither ever fails: the worst case is an empty `sql` and
//! the whole trimmed text as `result`.

use std::sync::OnceLock;

use regex::Regex;

/// Extraction outcome. Both fields may be empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedResponse {
    pub sql: String,
    pub result: String,
}

fn sql_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)(SELECT|UPDATE|INSERT|DELETE)[^;\n]*").expect("valid statement pattern")
    })
}

/// First case-insensitive statement starting with SELECT/UPDATE/INSERT/
/// DELETE, up to the next terminator or line break. Empty when absent.
pub fn extract_sql(text: &str) -> String {
    sql_pattern()
        .find(text)
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default()
}

/// Parse a successful agent reply.
pub fn parse_agent_output(output: &str) -> ParsedResponse {
    ParsedResponse {
        sql: extract_sql(output),
        result: extract_answer(output, false),
    }
}

/// Parse a caught agent error message (first line after the marker only).
pub fn parse_agent_error(message: &str) -> ParsedResponse {
    ParsedResponse {
        sql: extract_sql(message),
        result: extract_answer(message, true),
    }
}

fn after_last_marker<'a>(text: &'a str, marker: &str) -> Option<&'a str> {
    text.rfind(marker).map(|i| &text[i + marker.len()..])
}

fn extract_answer(text: &str, first_line_only: bool) -> String {
    let tail = after_last_marker(text, "Final Answer:")
        .or_else(|| after_last_marker(text, "Answer:"));

    match tail {
        Some(rest) => {
            let trimmed = rest.trim();
            if first_line_only {
                trimmed.lines().next().unwrap_or("").trim().to_string()
            } else {
                trimmed.to_string()
            }
        }
        None => text.trim().to_string(),
    }
}
