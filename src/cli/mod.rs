//! Command-line interface for faas.
//!
//! Provides the worker and autoscaler processes and the submission commands.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
