//! # rlm-cli
//!
//! Command-line interface for the RLM execution scaffold.
//!
//! ## Commands
//!
//! - `rlm run` — Answer a query over a context file
//! - `rlm plan` — Print the chunk plan for a context file
//! - `rlm config` — Show the effective configuration
//! - `rlm doctor` — Validate the configuration
//! - `rlm version` — Show version and build info

pub mod commands;

pub use commands::Cli;
