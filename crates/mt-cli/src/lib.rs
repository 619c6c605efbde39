//! Machine monitoring CLI library.
//!
//! This crate provides the CLI interface for the slot engine.

mod cli;
pub mod commands;
mod config;

pub use cli::{ApplyEvent, Cli, Commands};
pub use config::Config;
