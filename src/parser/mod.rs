//! Multi-strategy response parser.
//!
//! Turns a raw provider response into a structured payload plus a
//! [`ParseStatus`]. The parser never fails: malformed input degrades the
//! status instead of raising an error, so the caller always has something to
//! persist next to the raw text.
//!
//! # Strategies
//!
//! Applied in order, first success wins:
//! 1. Direct decode of the trimmed response
//! 2. Decode the body of the first fenced code block
//! 3. Decode after removing stray control characters
//! 4. Decode the largest balanced `{...}` span
//!
//! When every strategy fails the result is [`ParsedPayload::Unparsed`]: a
//! placeholder object with each required field filled in where a
//! `"field": value` pair can still be recovered from the raw text (`null`
//! otherwise), status [`ParseStatus::NeedsManualReview`].
//!
//! Parsing is a pure function of `(raw, shape)`.
//!
//! # Example
//!
//! ```
//! use trial_forge::parser::{parse_response, ExpectedShape, ParseStrategy};
//! use trial_forge::types::{ParseStatus, Stage};
//!
//! let shape = ExpectedShape::for_stage(Stage::Evaluation);
//! let result = parse_response("```json\n{\"score\": 80}\n```", &shape);
//! assert_eq!(result.status, ParseStatus::Success);
//! assert_eq!(result.strategy, Some(ParseStrategy::FenceStripped));
//! assert_eq!(result.to_value()["score"], 80);
//! ```

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::{ParseStatus, Stage};
use crate::utils::json_extraction::{
    extract_balanced_object, sanitize_control_chars, strip_code_fences,
};

/// Marker key set on placeholder objects produced for unparseable responses.
pub const MANUAL_REVIEW_KEY: &str = "_needs_manual_review";

/// The structure a stage expects back from the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedShape {
    /// Stage this shape belongs to.
    pub stage: Stage,
    /// Top-level object keys a complete response must carry.
    pub required_fields: Vec<String>,
}

impl ExpectedShape {
    /// Default shape for a stage.
    ///
    /// - context: `facts`
    /// - generation: `decision`, `reasoning`
    /// - evaluation: `score`
    pub fn for_stage(stage: Stage) -> Self {
        let fields: &[&str] = match stage {
            Stage::Context => &["facts"],
            Stage::Generation => &["decision", "reasoning"],
            Stage::Evaluation => &["score"],
        };
        Self {
            stage,
            required_fields: fields.iter().map(|f| f.to_string()).collect(),
        }
    }

    /// Replaces the required fields.
    pub fn with_required_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    fn missing_fields(&self, object: &Map<String, Value>) -> Vec<String> {
        self.required_fields
            .iter()
            .filter(|f| !object.contains_key(f.as_str()))
            .cloned()
            .collect()
    }
}

/// Which strategy recovered the structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseStrategy {
    Direct,
    FenceStripped,
    ControlCharsRemoved,
    BalancedExtraction,
}

/// Structured outcome of a parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParsedPayload {
    /// A decoded object carrying every required field.
    Structured(Value),
    /// A decoded object missing some required fields.
    Degraded {
        partial: Value,
        missing_fields: Vec<String>,
    },
    /// Nothing decoded; `placeholder` holds whatever fields were salvageable.
    Unparsed { placeholder: Value, raw: String },
}

/// Result of [`parse_response`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParseResult {
    pub payload: ParsedPayload,
    pub status: ParseStatus,
    pub strategy: Option<ParseStrategy>,
}

impl ParseResult {
    /// The decoded object, if any strategy succeeded.
    pub fn structured(&self) -> Option<&Value> {
        match &self.payload {
            ParsedPayload::Structured(v) => Some(v),
            ParsedPayload::Degraded { partial, .. } => Some(partial),
            ParsedPayload::Unparsed { .. } => None,
        }
    }

    /// Whether a strategy decoded the response at all.
    pub fn decoded(&self) -> bool {
        self.strategy.is_some()
    }

    /// The value persisted as `parsed_result`.
    pub fn to_value(&self) -> Value {
        match &self.payload {
            ParsedPayload::Structured(v) => v.clone(),
            ParsedPayload::Degraded { partial, .. } => partial.clone(),
            ParsedPayload::Unparsed { placeholder, .. } => placeholder.clone(),
        }
    }
}

/// Parses a raw provider response against the expected shape.
pub fn parse_response(raw: &str, shape: &ExpectedShape) -> ParseResult {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return ParseResult {
            payload: ParsedPayload::Unparsed {
                placeholder: placeholder(shape, raw),
                raw: raw.to_string(),
            },
            status: ParseStatus::Failed,
            strategy: None,
        };
    }

    for (strategy, candidate) in candidates(trimmed) {
        let Some(candidate) = candidate else {
            continue;
        };
        if let Some(object) = decode_object(&candidate) {
            return classify(object, shape, strategy);
        }
    }

    ParseResult {
        payload: ParsedPayload::Unparsed {
            placeholder: placeholder(shape, raw),
            raw: raw.to_string(),
        },
        status: ParseStatus::NeedsManualReview,
        strategy: None,
    }
}

/// Lazily produces each strategy's candidate text in order.
fn candidates(trimmed: &str) -> impl Iterator<Item = (ParseStrategy, Option<String>)> + '_ {
    let stripped = move || strip_code_fences(trimmed);
    let base = move || stripped().unwrap_or_else(|| trimmed.to_string());

    [
        ParseStrategy::Direct,
        ParseStrategy::FenceStripped,
        ParseStrategy::ControlCharsRemoved,
        ParseStrategy::BalancedExtraction,
    ]
    .into_iter()
    .map(move |strategy| {
        let candidate = match strategy {
            ParseStrategy::Direct => Some(trimmed.to_string()),
            ParseStrategy::FenceStripped => stripped(),
            ParseStrategy::ControlCharsRemoved => Some(sanitize_control_chars(&base())),
            ParseStrategy::BalancedExtraction => {
                extract_balanced_object(&sanitize_control_chars(&base()))
                    .or_else(|| extract_balanced_object(trimmed))
            }
        };
        (strategy, candidate)
    })
}

fn decode_object(candidate: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(candidate.trim()) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn classify(object: Map<String, Value>, shape: &ExpectedShape, strategy: ParseStrategy) -> ParseResult {
    let missing = shape.missing_fields(&object);
    if missing.is_empty() {
        ParseResult {
            payload: ParsedPayload::Structured(Value::Object(object)),
            status: ParseStatus::Success,
            strategy: Some(strategy),
        }
    } else {
        ParseResult {
            payload: ParsedPayload::Degraded {
                partial: Value::Object(object),
                missing_fields: missing,
            },
            status: ParseStatus::PartialSuccess,
            strategy: Some(strategy),
        }
    }
}

/// Builds the placeholder object for an unparseable response.
fn placeholder(shape: &ExpectedShape, raw: &str) -> Value {
    let mut object = Map::new();
    for field in &shape.required_fields {
        object.insert(field.clone(), salvage_field(raw, field).unwrap_or(Value::Null));
    }
    object.insert(MANUAL_REVIEW_KEY.to_string(), Value::Bool(true));
    Value::Object(object)
}

/// Recovers a scalar `"field": value` pair from text that does not decode.
fn salvage_field(raw: &str, field: &str) -> Option<Value> {
    let pattern = format!(
        r#""{}"\s*:\s*("(?:[^"\\]|\\.)*"|-?\d+(?:\.\d+)?(?:[eE][+-]?\d+)?|true|false|null)"#,
        regex::escape(field)
    );
    let re = Regex::new(&pattern).ok()?;
    let literal = re.captures(raw)?.get(1)?.as_str();
    serde_json::from_str(literal).ok()
}
