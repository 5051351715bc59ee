//! Subcommand implementations.

pub mod config;
pub mod describe;
pub mod models;
