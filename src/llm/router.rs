//! Model-id based routing across providers.
//!
//! A single run can mix models served by different gateways. The router picks
//! the provider for a request by, in order:
//! 1. an exact model-id registration,
//! 2. the longest registered `vendor/` prefix,
//! 3. the default provider.
//!
//! With no match and no default the call fails with
//! [`LlmError::InvalidModel`], which is a permanent error.
//!
//! Routes are configured as [`ProviderRoute`] strings of the form
//! `PATTERN=BASE_URL[,KEY_ENV]`. A pattern ending in `/` is a prefix, any
//! other pattern an exact model id; `KEY_ENV` names the environment variable
//! holding that gateway's API key.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use super::request::{GenerationRequest, GenerationResponse, LlmProvider};
use crate::error::LlmError;

/// One configured gateway for a model-id pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderRoute {
    pub pattern: String,
    pub api_base: String,
    /// Environment variable with the API key; the default key when absent.
    pub api_key_env: Option<String>,
}

impl ProviderRoute {
    pub fn is_prefix(&self) -> bool {
        self.pattern.ends_with('/')
    }
}

impl std::str::FromStr for ProviderRoute {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (pattern, target) = s
            .split_once('=')
            .ok_or_else(|| format!("route '{}' must look like PATTERN=BASE_URL[,KEY_ENV]", s))?;
        let (api_base, api_key_env) = match target.split_once(',') {
            Some((base, env)) => (base.trim(), Some(env.trim())),
            None => (target.trim(), None),
        };
        let pattern = pattern.trim();
        if pattern.is_empty() || api_base.is_empty() {
            return Err(format!("route '{}' has an empty pattern or base URL", s));
        }
        if !(api_base.starts_with("http://") || api_base.starts_with("https://")) {
            return Err(format!("route '{}': base URL must be http(s)", s));
        }
        Ok(Self {
            pattern: pattern.to_string(),
            api_base: api_base.to_string(),
            api_key_env: api_key_env.filter(|e| !e.is_empty()).map(str::to_string),
        })
    }
}

/// Routes requests to providers by model id.
#[derive(Default, Clone)]
pub struct ModelRouter {
    exact: HashMap<String, Arc<dyn LlmProvider>>,
    prefixes: Vec<(String, Arc<dyn LlmProvider>)>,
    default: Option<Arc<dyn LlmProvider>>,
}

impl ModelRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Router sending every model to `provider`.
    pub fn single(provider: Arc<dyn LlmProvider>) -> Self {
        Self::new().with_default(provider)
    }

    pub fn with_default(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.default = Some(provider);
        self
    }

    /// Serves exactly `model` from `provider`.
    pub fn with_model(mut self, model: impl Into<String>, provider: Arc<dyn LlmProvider>) -> Self {
        self.exact.insert(model.into(), provider);
        self
    }

    /// Serves every model starting with `prefix` (e.g. `"anthropic/"`).
    pub fn with_prefix(mut self, prefix: impl Into<String>, provider: Arc<dyn LlmProvider>) -> Self {
        self.prefixes.push((prefix.into(), provider));
        // Longest prefix first.
        self.prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        self
    }

    /// Registers `provider` under `route`'s pattern.
    pub fn with_route(self, route: &ProviderRoute, provider: Arc<dyn LlmProvider>) -> Self {
        if route.is_prefix() {
            self.with_prefix(route.pattern.clone(), provider)
        } else {
            self.with_model(route.pattern.clone(), provider)
        }
    }

    /// Whether some provider would serve `model`.
    pub fn can_route(&self, model: &str) -> bool {
        self.resolve(model).is_ok()
    }

    pub fn resolve(&self, model: &str) -> Result<Arc<dyn LlmProvider>, LlmError> {
        if let Some(provider) = self.exact.get(model) {
            return Ok(Arc::clone(provider));
        }
        if let Some((_, provider)) = self
            .prefixes
            .iter()
            .find(|(prefix, _)| model.starts_with(prefix.as_str()))
        {
            return Ok(Arc::clone(provider));
        }
        self.default
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| LlmError::InvalidModel(format!("no provider serves '{}'", model)))
    }
}

impl std::fmt::Debug for ModelRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut exact: Vec<&String> = self.exact.keys().collect();
        exact.sort();
        f.debug_struct("ModelRouter")
            .field("exact", &exact)
            .field(
                "prefixes",
                &self.prefixes.iter().map(|(p, _)| p).collect::<Vec<_>>(),
            )
            .field("has_default", &self.default.is_some())
            .finish()
    }
}

#[async_trait]
impl LlmProvider for ModelRouter {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
        let provider = self.resolve(&request.model)?;
        provider.generate(request).await
    }
}
