//! Kindred CLI library
//!
//! Argument parsing, configuration loading, output rendering and the
//! subcommand handlers behind the `kindred` binary.

pub mod cli;
pub mod commands;
pub mod config;
pub mod output;
