//! Concrete provider implementations.

pub mod openai_compat;

pub use openai_compat::{OpenAiCompatProvider, DEFAULT_API_BASE};
