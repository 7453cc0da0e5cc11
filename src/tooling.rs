//! Tooling & Integration Layer
//!
//! Command-line front end over the ingestion, processing and sorting pipelines.

pub mod cli;

pub use cli::{shutdown_on_ctrl_c, Cli, CliContext, Commands};
