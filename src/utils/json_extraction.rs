//! Low-level JSON scanning helpers for provider responses.
//!
//! These functions never decode anything themselves beyond validation; they
//! locate candidate JSON text inside a response that may be wrapped in
//! markdown fences, preceded by reasoning prose, or polluted with control
//! characters. The response parser composes them into its strategy chain and
//! the truncation detector uses [`analyze_json_structure`] for its structural
//! checks.
//!
//! All helpers are string-literal aware: braces inside `"..."` (including
//! escaped quotes) are not counted.

use regex::Regex;
use std::sync::OnceLock;

/// Analysis result for JSON structure
#[derive(Debug, Clone, PartialEq)]
pub struct JsonStructureAnalysis {
    /// Number of unclosed braces ('{' without matching '}')
    pub unclosed_braces: usize,
    /// Number of unclosed brackets ('[' without matching ']')
    pub unclosed_brackets: usize,
    /// Whether we ended inside a string literal
    pub in_string: bool,
    /// The position where JSON-like content starts (first '{' or '[')
    pub json_start: Option<usize>,
}

impl JsonStructureAnalysis {
    /// More openers than closers of either kind.
    pub fn is_unbalanced(&self) -> bool {
        self.unclosed_braces > 0 || self.unclosed_brackets > 0
    }
}

/// Scans `s` tracking brace/bracket depth and string state.
///
/// Depths never go below zero in the result: surplus closers (common in
/// prose like "see (a) }") are not evidence of truncation.
pub fn analyze_json_structure(s: &str) -> JsonStructureAnalysis {
    let mut brace_depth: isize = 0;
    let mut bracket_depth: isize = 0;
    let mut in_string = false;
    let mut escape_next = false;
    let mut json_start: Option<usize> = None;

    for (i, c) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }

        match c {
            '\\' if in_string => {
                escape_next = true;
            }
            // Quotes only open a string once structure has started, so that
            // apostrophes and quotes in leading prose are ignored.
            '"' if json_start.is_some() => {
                in_string = !in_string;
            }
            '{' if !in_string => {
                if json_start.is_none() {
                    json_start = Some(i);
                }
                brace_depth += 1;
            }
            '}' if !in_string => {
                brace_depth -= 1;
            }
            '[' if !in_string => {
                if json_start.is_none() {
                    json_start = Some(i);
                }
                bracket_depth += 1;
            }
            ']' if !in_string => {
                bracket_depth -= 1;
            }
            _ => {}
        }
    }

    JsonStructureAnalysis {
        unclosed_braces: brace_depth.max(0) as usize,
        unclosed_brackets: bracket_depth.max(0) as usize,
        in_string,
        json_start,
    }
}

/// Finds the index of the '}' matching the '{' at the start of `s`.
pub fn find_matching_brace(s: &str) -> Option<usize> {
    find_matching(s, '{', '}')
}

/// Finds the index of the ']' matching the '[' at the start of `s`.
pub fn find_matching_bracket(s: &str) -> Option<usize> {
    find_matching(s, '[', ']')
}

fn find_matching(s: &str, open: char, close: char) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }

        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            c if c == open && !in_string => depth += 1,
            c if c == close && !in_string => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }

    None
}

fn fence_regex() -> Option<&'static Regex> {
    static FENCE: OnceLock<Option<Regex>> = OnceLock::new();
    FENCE
        .get_or_init(|| {
            Regex::new(r"```[A-Za-z0-9_+-]*[ \t]*\r?\n?([\s\S]*?)\r?\n?[ \t]*```").ok()
        })
        .as_ref()
}

/// Returns the body of the first fenced code block (```` ```json ````,
/// ```` ``` ```` or any language tag), trimmed.
///
/// An opening fence with no closing fence (the tail of the response was cut
/// off) yields everything after the opening fence line.
pub fn strip_code_fences(content: &str) -> Option<String> {
    if let Some(caps) = fence_regex().and_then(|re| re.captures(content)) {
        return caps.get(1).map(|m| m.as_str().trim().to_string());
    }

    let start = content.find("```")?;
    let after = &content[start + 3..];
    let body_start = after.find('\n').map(|i| i + 1).unwrap_or(after.len());
    let body = after[body_start..].trim();
    if body.is_empty() {
        None
    } else {
        Some(body.to_string())
    }
}

/// Removes characters no JSON decoder accepts unescaped.
///
/// Outside string literals, control characters other than ordinary whitespace
/// are dropped along with byte-order marks and zero-width characters. Inside
/// string literals, raw newlines and tabs are re-escaped so that a model that
/// emitted multi-line strings still decodes.
pub fn sanitize_control_chars(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut in_string = false;
    let mut escape_next = false;

    for c in content.chars() {
        if matches!(c, '\u{feff}' | '\u{200b}' | '\u{200c}' | '\u{200d}') {
            continue;
        }

        if escape_next {
            escape_next = false;
            if !c.is_control() {
                out.push(c);
            }
            continue;
        }

        match c {
            '\\' if in_string => {
                escape_next = true;
                out.push(c);
            }
            '"' => {
                in_string = !in_string;
                out.push(c);
            }
            '\n' if in_string => out.push_str("\\n"),
            '\r' if in_string => out.push_str("\\r"),
            '\t' if in_string => out.push_str("\\t"),
            '\n' | '\r' | '\t' | ' ' => out.push(c),
            c if c.is_control() => {}
            c => out.push(c),
        }
    }

    out
}

/// Returns the largest balanced `{...}` span of `content` that decodes as
/// JSON, preferring later spans on ties.
///
/// Models that think before answering often emit small example objects in
/// their prose; the real payload is usually the largest object and sits
/// towards the end of the response.
pub fn extract_balanced_object(content: &str) -> Option<String> {
    let mut best: Option<(usize, &str)> = None;
    // Objects nested in an accepted span are strictly shorter than it.
    let mut accepted_until = 0;

    for (start, _) in content.char_indices().filter(|(_, c)| *c == '{') {
        if start < accepted_until {
            continue;
        }
        let substr = &content[start..];
        let Some(end) = find_matching_brace(substr) else {
            continue;
        };
        let candidate = &substr[..=end];
        if serde_json::from_str::<serde_json::Value>(candidate).is_err() {
            continue;
        }
        accepted_until = start + candidate.len();
        let better = match best {
            None => true,
            Some((_, current)) => candidate.len() >= current.len(),
        };
        if better {
            best = Some((start, candidate));
        }
    }

    best.map(|(_, json)| json.to_string())
}
