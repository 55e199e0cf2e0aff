//! Error types for trial-forge operations.
//!
//! The taxonomy follows how failures are recovered:
//! - Provider failures (`LlmError`) are classified into a [`ProviderErrorKind`]
//!   and retried with backoff inside a stage when transient
//! - Stage failures (`StageError`) mean a stage exhausted its retries; they mark
//!   the owning trial failed but never stop the run
//! - State failures (`StateError`) mean the registry, experiment state or run
//!   pointer cannot be trusted; they halt the whole run
//!
//! Parse failures are deliberately absent: the parser reports a status instead
//! of an error so that no response is ever discarded.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Stage;

/// Classification of a provider failure, used to pick a recovery path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// The provider rejected the call because of rate limits (HTTP 429).
    RateLimited,
    /// The call did not complete within the hard per-call timeout.
    Timeout,
    /// Overload, 5xx responses, dropped connections.
    Transient,
    /// Anything retrying will not fix (bad request, auth, unknown model).
    Permanent,
}

impl ProviderErrorKind {
    /// Whether the failure goes through the backoff-and-retry path.
    pub fn is_retryable(self) -> bool {
        !matches!(self, ProviderErrorKind::Permanent)
    }
}

impl std::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProviderErrorKind::RateLimited => "rate_limited",
            ProviderErrorKind::Timeout => "timeout",
            ProviderErrorKind::Transient => "transient",
            ProviderErrorKind::Permanent => "permanent",
        };
        f.write_str(s)
    }
}

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API key: set LLM_API_KEY or OPENROUTER_API_KEY")]
    MissingApiKey,

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Request timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("Failed to parse provider envelope: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Invalid model: {0}")]
    InvalidModel(String),

    /// Prompt plus requested output do not fit the model's context window.
    #[error("Context length exceeded: {0}")]
    ContextLengthExceeded(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("Provider returned no content for model '{model}'")]
    EmptyResponse { model: String },
}

impl LlmError {
    /// Classifies this error for the retry policy.
    pub fn kind(&self) -> ProviderErrorKind {
        match self {
            LlmError::RateLimited(_) => ProviderErrorKind::RateLimited,
            LlmError::Timeout { .. } => ProviderErrorKind::Timeout,
            LlmError::RequestFailed(_) | LlmError::ParseError(_) | LlmError::EmptyResponse { .. } => {
                ProviderErrorKind::Transient
            }
            LlmError::ApiError { code, .. } => match *code {
                429 => ProviderErrorKind::RateLimited,
                408 => ProviderErrorKind::Timeout,
                // 529 is the "overloaded" status some providers use
                c if c >= 500 => ProviderErrorKind::Transient,
                _ => ProviderErrorKind::Permanent,
            },
            LlmError::MissingApiKey
            | LlmError::InvalidModel(_)
            | LlmError::ContextLengthExceeded(_) => ProviderErrorKind::Permanent,
        }
    }
}

/// Why a stage gave up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageFailureReason {
    /// Every transport attempt failed with a retryable error.
    TransportExhausted {
        error_kind: ProviderErrorKind,
        attempts: u32,
        last_error: String,
    },
    /// The provider failed in a way retrying cannot fix.
    PermanentProvider { message: String },
    /// Output stayed truncated and unparseable at the budget ceiling.
    TruncationExhausted { budget: u32, escalations: u32 },
}

impl std::fmt::Display for StageFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageFailureReason::TransportExhausted {
                error_kind,
                attempts,
                last_error,
            } => write!(
                f,
                "{} after {} attempts: {}",
                error_kind, attempts, last_error
            ),
            StageFailureReason::PermanentProvider { message } => {
                write!(f, "permanent provider error: {}", message)
            }
            StageFailureReason::TruncationExhausted {
                budget,
                escalations,
            } => write!(
                f,
                "output still truncated at {} tokens after {} escalations",
                budget, escalations
            ),
        }
    }
}

/// A stage exhausted its retries. Attributed to the stage and model that failed.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{stage} stage failed for model '{model}': {reason}")]
pub struct StageError {
    pub stage: Stage,
    pub model: String,
    pub reason: StageFailureReason,
}

/// Errors touching the durable run state: registry, experiment state, pointer, lock.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Run '{0}' not found")]
    RunNotFound(String),

    #[error("No active run: the run pointer is empty and no run id was given")]
    NoActiveRun,

    #[error("Trial '{0}' not found in registry")]
    TrialNotFound(String),

    #[error("Invalid status transition for trial '{trial_id}': {from} -> {to}")]
    InvalidTransition {
        trial_id: String,
        from: String,
        to: String,
    },

    #[error("State file {path:?} is corrupt: {message}")]
    Corrupt { path: PathBuf, message: String },

    #[error("Run state is inconsistent: {0}")]
    Inconsistent(String),

    #[error("Run is locked by another operation ({path:?}); pass --force-unlock if that process is gone")]
    Locked { path: PathBuf },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
