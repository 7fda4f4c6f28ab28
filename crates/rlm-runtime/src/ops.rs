//! The operation language the Controller writes.
//!
//! Operations appear in fenced blocks tagged `repl`, one JSON object per line
//! or a single JSON array:
//!
//! ~~~text
//! ```repl
//! {"op": "plan_chunks", "chunk_size": 10000, "into": "plan"}
//! {"op": "llm_batch", "instruction": "Find the code word", "plan": "plan", "into": "hits"}
//! ```
//! ~~~
//!
//! These are the only things generated code can reach. Outside blocks, a bare
//! `FINAL_VAR(name)` or `FINAL(answer)` is also accepted as the terminal answer.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::LazyLock;

use rlm_core::{Result, RlmError};

static REPL_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```repl[^\n]*\n(.*?)```").unwrap());
static FINAL_VAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"FINAL_VAR\(\s*([A-Za-z_][A-Za-z0-9_]*)\s*\)").unwrap());
static FINAL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)FINAL\((.*)\)").unwrap());

/// One engine operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case", deny_unknown_fields)]
pub enum Operation {
    ReadContext {
        start: i64,
        end: i64,
        #[serde(default)]
        into: Option<String>,
    },
    PlanChunks {
        chunk_size: i64,
        #[serde(default)]
        overlap: i64,
        #[serde(default)]
        into: Option<String>,
    },
    CallSubLlm {
        instruction: String,
        content: ContentRef,
        #[serde(default)]
        into: Option<String>,
    },
    LlmBatch {
        instruction: String,
        #[serde(default)]
        chunks: Option<Vec<ContentRef>>,
        /// Name of a variable holding chunk descriptors from `plan_chunks`.
        #[serde(default)]
        plan: Option<String>,
        #[serde(default)]
        into: Option<String>,
    },
    SetVar {
        name: String,
        value: Value,
    },
    GetVar {
        name: String,
        #[serde(default)]
        default: Value,
    },
    FinalVar {
        name: String,
    },
    Final {
        answer: Value,
    },
    Abort {
        reason: String,
    },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::ReadContext { .. } => "read_context",
            Operation::PlanChunks { .. } => "plan_chunks",
            Operation::CallSubLlm { .. } => "call_sub_llm",
            Operation::LlmBatch { .. } => "llm_batch",
            Operation::SetVar { .. } => "set_var",
            Operation::GetVar { .. } => "get_var",
            Operation::FinalVar { .. } => "final_var",
            Operation::Final { .. } => "final",
            Operation::Abort { .. } => "abort",
        }
    }
}

/// Where a sub-call's content comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContentRef {
    /// Literal text.
    Text(String),
    /// The value of a variable.
    Var { var: String },
    /// A slice of the engine's context. Chunk descriptors deserialize here too.
    Slice { start: i64, end: i64 },
}

/// A terminal answer given outside any block.
#[derive(Debug, Clone, PartialEq)]
pub enum FinalMarker {
    Var(String),
    Answer(String),
}

/// Everything actionable in one Controller reply.
#[derive(Debug, Default)]
pub struct ParsedReply {
    /// Each block's operations in order. A line that fails to parse is kept in
    /// place as an error so the operations before it still run.
    pub blocks: Vec<Vec<Result<Operation>>>,
    pub final_marker: Option<FinalMarker>,
}

impl ParsedReply {
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty() && self.final_marker.is_none()
    }

    pub fn operation_count(&self) -> usize {
        self.blocks.iter().map(Vec::len).sum()
    }
}

/// Extract operation blocks and any final marker from a Controller reply.
pub fn parse_reply(reply: &str) -> ParsedReply {
    let blocks = REPL_BLOCK
        .captures_iter(reply)
        .map(|caps| parse_block(&caps[1]))
        .collect();
    let outside = REPL_BLOCK.replace_all(reply, "");
    ParsedReply {
        blocks,
        final_marker: parse_final_marker(&outside),
    }
}

fn parse_final_marker(text: &str) -> Option<FinalMarker> {
    if let Some(caps) = FINAL_VAR.captures(text) {
        return Some(FinalMarker::Var(caps[1].to_string()));
    }
    FINAL
        .captures(text)
        .map(|caps| FinalMarker::Answer(caps[1].trim().to_string()))
}

/// Parse the body of one block: a JSON array of operations, or one operation per line.
pub fn parse_block(body: &str) -> Vec<Result<Operation>> {
    let trimmed = body.trim();
    if trimmed.starts_with('[') {
        return match serde_json::from_str::<Vec<Operation>>(trimmed) {
            Ok(ops) => ops.into_iter().map(Ok).collect(),
            Err(e) => vec![Err(RlmError::OperationParse(e.to_string()))],
        };
    }

    trimmed
        .lines()
        .enumerate()
        .map(|(i, line)| (i, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with("//") && !line.starts_with('#'))
        .map(|(i, line)| {
            serde_json::from_str::<Operation>(line)
                .map_err(|e| RlmError::OperationParse(format!("line {}: {e}", i + 1)))
        })
        .collect()
}
