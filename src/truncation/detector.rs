//! Heuristics for spotting responses that were cut off mid-output.

use serde::{Deserialize, Serialize};

use crate::utils::json_extraction::analyze_json_structure;

/// Why a response was classified as truncated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TruncationReason {
    /// Not truncated.
    None,
    /// More `{`/`[` than matching closers.
    UnbalancedDelimiters,
    /// The response ends inside a string literal.
    UnterminatedString,
    /// The text stops without closing punctuation or structure.
    AbruptEnding,
    /// The provider reported it stopped at the output limit.
    ProviderLengthLimit,
}

impl TruncationReason {
    /// Structural reasons escalate even when the parser succeeded.
    pub fn is_structural(self) -> bool {
        matches!(
            self,
            TruncationReason::UnbalancedDelimiters | TruncationReason::UnterminatedString
        )
    }
}

/// Detector output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruncationVerdict {
    pub truncated: bool,
    pub reason: TruncationReason,
}

impl TruncationVerdict {
    fn complete() -> Self {
        Self {
            truncated: false,
            reason: TruncationReason::None,
        }
    }

    fn cut(reason: TruncationReason) -> Self {
        Self {
            truncated: true,
            reason,
        }
    }
}

/// Decides whether `raw` was cut off.
///
/// A successful parse suppresses the non-structural heuristics: a model may
/// legitimately end a complete JSON object without trailing punctuation.
pub fn is_truncated(raw: &str, parse_succeeded: bool) -> TruncationVerdict {
    detect(raw, parse_succeeded, None)
}

/// [`is_truncated`] with the provider's finish reason taken into account.
pub fn detect(raw: &str, parse_succeeded: bool, finish_reason: Option<&str>) -> TruncationVerdict {
    let length_limited = matches!(finish_reason, Some("length") | Some("max_tokens"));
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        // Reasoning models often spend the whole budget before emitting text.
        if length_limited {
            return TruncationVerdict::cut(TruncationReason::ProviderLengthLimit);
        }
        return TruncationVerdict::complete();
    }

    let analysis = analyze_json_structure(trimmed);
    if analysis.in_string {
        return TruncationVerdict::cut(TruncationReason::UnterminatedString);
    }
    if analysis.is_unbalanced() {
        return TruncationVerdict::cut(TruncationReason::UnbalancedDelimiters);
    }

    if parse_succeeded {
        return TruncationVerdict::complete();
    }

    if length_limited {
        return TruncationVerdict::cut(TruncationReason::ProviderLengthLimit);
    }

    if has_unclosed_fence(trimmed) || ends_abruptly(trimmed) {
        return TruncationVerdict::cut(TruncationReason::AbruptEnding);
    }

    TruncationVerdict::complete()
}

fn has_unclosed_fence(s: &str) -> bool {
    s.matches("```").count() % 2 == 1
}

fn ends_abruptly(s: &str) -> bool {
    match s.chars().last() {
        Some(c) => !matches!(
            c,
            '.' | '!' | '?' | '}' | ']' | ')' | '"' | '\'' | '`' | '*' | '>' | '…' | '。'
        ),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncated_mid_structure() {
        let verdict = is_truncated(r#"{"score": 8"#, false);
        assert!(verdict.truncated);
        assert_eq!(verdict.reason, TruncationReason::UnbalancedDelimiters);
    }

    #[test]
    fn test_unterminated_string() {
        let verdict = is_truncated(r#"{"reasoning": "the framework implies"#, false);
        assert!(verdict.truncated);
        assert_eq!(verdict.reason, TruncationReason::UnterminatedString);
    }

    #[test]
    fn test_complete_json_is_not_truncated() {
        let verdict = is_truncated(r#"{"score": 80}"#, true);
        assert!(!verdict.truncated);
        assert_eq!(verdict.reason, TruncationReason::None);
    }

    #[test]
    fn test_abrupt_prose_ending() {
        let verdict = is_truncated("The decision follows from the fact that the", false);
        assert!(verdict.truncated);
        assert_eq!(verdict.reason, TruncationReason::AbruptEnding);
    }

    #[test]
    fn test_prose_with_terminal_punctuation_is_complete() {
        let verdict = is_truncated("I am unable to answer in JSON.", false);
        assert!(!verdict.truncated);
    }

    #[test]
    fn test_unclosed_fence_is_abrupt() {
        let verdict = is_truncated("```json\n{\"score\": 80}", false);
        assert!(verdict.truncated);
        assert_eq!(verdict.reason, TruncationReason::AbruptEnding);
    }

    #[test]
    fn test_successful_parse_suppresses_soft_heuristics() {
        // Trailing prose without punctuation after a complete object.
        let raw = "{\"score\": 80}\nthat is my score";
        assert!(is_truncated(raw, false).truncated);
        assert!(!is_truncated(raw, true).truncated);
    }

    #[test]
    fn test_structural_check_fires_despite_successful_parse() {
        // Parser may have extracted the first object, but a second one was cut.
        let raw = r#"{"score": 80} {"score": 9"#;
        let verdict = is_truncated(raw, true);
        assert!(verdict.truncated);
        assert!(verdict.reason.is_structural());
    }

    #[test]
    fn test_provider_length_limit() {
        let verdict = detect("I am unable to answer.", false, Some("length"));
        assert!(verdict.truncated);
        assert_eq!(verdict.reason, TruncationReason::ProviderLengthLimit);

        let verdict = detect(r#"{"score": 80}"#, true, Some("length"));
        assert!(!verdict.truncated);
    }

    #[test]
    fn test_empty_is_not_truncated() {
        assert!(!is_truncated("  ", false).truncated);
        assert!(!detect("", false, Some("stop")).truncated);
    }

    #[test]
    fn test_empty_output_at_length_limit_is_truncated() {
        let verdict = detect("", false, Some("length"));
        assert!(verdict.truncated);
        assert_eq!(verdict.reason, TruncationReason::ProviderLengthLimit);

        let verdict = detect(" \n", false, Some("max_tokens"));
        assert!(verdict.truncated);
    }
}
