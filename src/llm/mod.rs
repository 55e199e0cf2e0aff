//! Provider client contract and implementations.
//!
//! The engine talks to text-generation providers only through
//! [`LlmProvider`]: one request in, one response or one classified
//! [`LlmError`](crate::error::LlmError) out. Everything provider-specific
//! (authentication, wire format, response envelopes) stays behind it.
//!
//! ```ignore
//! use std::sync::Arc;
//! use trial_forge::llm::{ModelRouter, OpenAiCompatProvider};
//!
//! let gateway = Arc::new(OpenAiCompatProvider::from_env(timeout)?);
//! let router = ModelRouter::single(gateway);
//! ```

pub mod providers;
pub mod request;
pub mod router;

pub use providers::{OpenAiCompatProvider, DEFAULT_API_BASE};
pub use request::{
    Choice, GenerationRequest, GenerationResponse, LlmProvider, Message, ResponseFormat, Usage,
};
pub use router::{ModelRouter, ProviderRoute};
