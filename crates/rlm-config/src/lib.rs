//! # rlm-config
//!
//! Configuration for the RLM scaffold. Reads from `rlm.toml`, then applies
//! environment variable overrides, then validates.

pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::RlmConfig;
pub use schema::{ConfigWarning, WarningSeverity};
