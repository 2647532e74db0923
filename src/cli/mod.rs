//! CLI module for apiary - command-line interface and subcommands.

pub mod commands;

pub use commands::Cli;
