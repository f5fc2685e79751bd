//! CLI module for the Terrace provisioner.
//!
//! This module provides the command-line interface for planning, applying
//! and destroying stacks.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, StateCommands};
pub use output::OutputFormatter;
