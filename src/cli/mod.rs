//! Command-line interface for trial-forge.
//!
//! Provides commands to start, resume, extend and inspect runs.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
