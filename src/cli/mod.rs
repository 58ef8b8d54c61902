//! CLI module for retrigger - command-line interface and subcommands.
//!
//! Provides the main entry point with subcommands for scanning, processing
//! and inspecting the retry queue.

pub mod commands;

pub use commands::Cli;
