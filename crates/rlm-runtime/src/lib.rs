//! # rlm-runtime
//!
//! The execution engine a Controller model drives to analyse a context far
//! larger than its own window.
//!
//! ## Architecture
//!
//! ```text
//!        ┌──────────────┐
//!        │  Controller  │  ← model writing repl operation blocks
//!        └──────┬───────┘
//!               │ operations
//!               ▼
//!        ┌──────────────┐
//!        │    Engine    │  ← context buffer + variable store + dispatcher
//!        └──────┬───────┘
//!               │ call_sub_llm / llm_batch
//!       ┌───────┼────────┐
//!       ▼       ▼        ▼
//!   ┌───────┐┌───────┐┌───────┐
//!   │ child ││ child ││ child │  ← depth + 1, own store, slice of the context
//!   └───┬───┘└───┬───┘└───┬───┘
//!       └────────┼────────┘
//!                ▼
//!         ┌─────────────┐
//!         │   Gateway   │  ← rate limits, in-flight limit, providers
//!         └─────────────┘
//! ```

pub mod chunking;
pub mod context;
pub(crate) mod dispatcher;
pub mod engine;
pub mod ops;
pub mod prompts;
pub mod registry;
pub mod runtime;
pub mod session;
pub mod trace;

pub use chunking::plan_chunks;
pub use context::ContextBuffer;
pub use dispatcher::BatchOutcome;
pub use engine::{Engine, EngineSettings};
pub use ops::{ContentRef, Operation, ParsedReply};
pub use registry::{SessionRecord, SessionRegistry};
pub use runtime::{RlmRuntime, SessionRequest};
pub use session::SessionOutput;
pub use trace::{Trace, TraceEvent, TraceOutcome};
