//! # rlm-core
//!
//! Core types and the error taxonomy shared by every crate in the RLM workspace:
//! session ids, chunk descriptors, sub-call outcomes and conversation messages.

pub mod error;
pub mod message;
pub mod types;

pub use error::{Result, RlmError};
pub use message::{Message, Role};
pub use types::*;
