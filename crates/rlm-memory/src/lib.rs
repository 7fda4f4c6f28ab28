//! # rlm-memory
//!
//! Memory owned by a single engine session:
//!
//! - **Variable store**: named intermediate results written and read by the
//!   Controller's operations. One per engine, never shared with parent, child
//!   or sibling engines.
//! - **Transcript**: the Controller conversation, with compaction so long
//!   sessions stay inside the model's context window.

pub mod store;
pub mod transcript;

pub use store::{VariableStore, value_text};
pub use transcript::Transcript;
