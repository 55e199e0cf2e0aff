//! Shared utility functions for trial-forge.
//!
//! This module provides the JSON scanning helpers shared by the response
//! parser and the truncation detector, plus the atomic file writes every
//! durable state file goes through.

pub mod atomic;
pub mod json_extraction;

pub use atomic::{atomic_write_bytes, atomic_write_json};
pub use json_extraction::{
    analyze_json_structure, extract_balanced_object, find_matching_brace, find_matching_bracket,
    sanitize_control_chars, strip_code_fences, JsonStructureAnalysis,
};
