//! Command-line interface for converge.
//!
//! Argument parsing lives in [`commands`]; rendering of plans, results and
//! state in text or JSON lives in [`OutputFormatter`].

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, StateCommands};
pub use output::OutputFormatter;
