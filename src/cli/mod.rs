//! Command-line interface for quorum-consumer.
//!
//! Provides the `run` and `check` commands.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli, Commands, ConsumerArgs};
