//! Client for OpenAI-compatible `/chat/completions` endpoints.
//!
//! Works against OpenRouter (the default), LiteLLM proxies and any other
//! gateway speaking the same wire format. The client performs exactly one
//! HTTP request per `generate` call and classifies failures into
//! [`LlmError`] variants; retrying is the pipeline executor's job.

use std::env;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;
use crate::llm::router::ProviderRoute;
use crate::llm::request::{
    Choice, GenerationRequest, GenerationResponse, LlmProvider, Message, ResponseFormat, Usage,
};

/// Default API endpoint.
pub const DEFAULT_API_BASE: &str = "https://openrouter.ai/api/v1";

/// Default per-request HTTP timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 120;

/// Provider for OpenAI-compatible APIs.
pub struct OpenAiCompatProvider {
    client: Client,
    api_key: String,
    base_url: String,
    timeout_secs: u64,
}

impl OpenAiCompatProvider {
    /// Creates a provider for `base_url` with the default timeout.
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Result<Self, LlmError> {
        Self::with_timeout(api_key, base_url, Duration::from_secs(REQUEST_TIMEOUT_SECS))
    }

    /// Creates a provider whose HTTP client gives up after `timeout`.
    pub fn with_timeout(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::RequestFailed(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout_secs: timeout.as_secs(),
        })
    }

    /// Reads `LLM_API_BASE` (default OpenRouter) and `LLM_API_KEY`, falling
    /// back to `OPENROUTER_API_KEY`.
    pub fn from_env(timeout: Duration) -> Result<Self, LlmError> {
        let api_key = env::var("LLM_API_KEY")
            .or_else(|_| env::var("OPENROUTER_API_KEY"))
            .map_err(|_| LlmError::MissingApiKey)?;
        if api_key.trim().is_empty() {
            return Err(LlmError::MissingApiKey);
        }
        let base_url = env::var("LLM_API_BASE").unwrap_or_else(|_| DEFAULT_API_BASE.to_string());
        Self::with_timeout(api_key, base_url, timeout)
    }

    /// Provider for a configured route. The route's key variable wins over
    /// `default_key`; a route naming an unset variable is an error.
    pub fn for_route(
        route: &ProviderRoute,
        default_key: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        let api_key = match &route.api_key_env {
            Some(var) => env::var(var).map_err(|_| LlmError::MissingApiKey)?,
            None => default_key.ok_or(LlmError::MissingApiKey)?.to_string(),
        };
        if api_key.trim().is_empty() {
            return Err(LlmError::MissingApiKey);
        }
        Self::with_timeout(api_key, route.api_base.clone(), timeout)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// API key with the middle elided, for logs.
    pub fn api_key_masked(&self) -> String {
        let chars: Vec<char> = self.api_key.chars().collect();
        if chars.len() <= 8 {
            "*".repeat(chars.len())
        } else {
            let head: String = chars[..4].iter().collect();
            let tail: String = chars[chars.len() - 4..].iter().collect();
            format!("{}...{}", head, tail)
        }
    }

    fn map_send_error(&self, error: reqwest::Error) -> LlmError {
        if error.is_timeout() {
            LlmError::Timeout {
                seconds: self.timeout_secs,
            }
        } else {
            LlmError::RequestFailed(error.to_string())
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
        if request.model.is_empty() {
            return Err(LlmError::InvalidModel("empty model id".to_string()));
        }

        let api_request = ApiRequest {
            model: request.model.clone(),
            messages: request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            response_format: request.response_format,
        };
        let url = format!("{}/chat/completions", self.base_url);

        let http_response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("HTTP-Referer", "https://trial-forge.local")
            .header("X-Title", "trial-forge")
            .json(&api_request)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = http_response.status();
        if !status.is_success() {
            let status_code = status.as_u16();
            let error_text = http_response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            let message = serde_json::from_str::<ApiErrorResponse>(&error_text)
                .map(|e| e.error.message)
                .unwrap_or(error_text);
            return Err(classify_status(status_code, message));
        }

        let body = http_response
            .text()
            .await
            .map_err(|e| self.map_send_error(e))?;
        parse_api_response(&request.model, &body)
    }
}

/// Maps a non-success HTTP status to an error variant.
fn classify_status(status_code: u16, message: String) -> LlmError {
    let lower = message.to_lowercase();
    match status_code {
        429 => LlmError::RateLimited(message),
        400 | 413 if is_context_overflow(&lower) => LlmError::ContextLengthExceeded(message),
        404 if lower.contains("model") => LlmError::InvalidModel(message),
        _ => LlmError::ApiError {
            code: status_code,
            message,
        },
    }
}

/// Decodes a success body into a [`GenerationResponse`].
///
/// Some gateways answer 200 with an `error` object (upstream overload) or
/// with `content: null`; both are surfaced as errors so the caller can retry.
/// A null content cut off at the output limit is kept as empty text with its
/// finish reason, so the caller can raise the budget instead.
fn parse_api_response(model: &str, body: &str) -> Result<GenerationResponse, LlmError> {
    if let Ok(error_response) = serde_json::from_str::<ApiErrorResponse>(body) {
        let code = error_response
            .error
            .code
            .as_ref()
            .and_then(|c| c.as_u64())
            .and_then(|c| u16::try_from(c).ok())
            .unwrap_or(502);
        return Err(classify_status(code, error_response.error.message));
    }

    let api_response: ApiResponse = serde_json::from_str(body)
        .map_err(|e| LlmError::ParseError(format!("Failed to parse API response: {}", e)))?;

    let choices: Vec<Choice> = api_response
        .choices
        .into_iter()
        .filter_map(|choice| {
            let finish_reason = choice.finish_reason.unwrap_or_else(|| "stop".to_string());
            let content = match choice.message.content {
                Some(content) => content,
                None if is_length_limit(&finish_reason) => String::new(),
                None => return None,
            };
            Some(Choice {
                index: choice.index,
                message: Message {
                    role: choice.message.role,
                    content,
                },
                finish_reason,
            })
        })
        .collect();

    if choices.is_empty() {
        return Err(LlmError::EmptyResponse {
            model: model.to_string(),
        });
    }

    let usage = api_response.usage.unwrap_or_default();
    Ok(GenerationResponse {
        id: api_response.id.unwrap_or_default(),
        model: api_response.model.unwrap_or_else(|| model.to_string()),
        choices,
        usage: Usage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        },
    })
}

fn is_context_overflow(lower_message: &str) -> bool {
    ["context_length_exceeded", "context length", "context window", "maximum context"]
        .iter()
        .any(|needle| lower_message.contains(needle))
}

fn is_length_limit(finish_reason: &str) -> bool {
    matches!(finish_reason, "length" | "max_tokens")
}

#[derive(Debug, Clone, Serialize)]
struct ApiRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    id: Option<String>,
    model: Option<String>,
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    #[serde(default)]
    index: u32,
    message: ApiMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    role: String,
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
    /// Numeric on most gateways, a string on some.
    #[serde(default)]
    code: Option<serde_json::Value>,
}
