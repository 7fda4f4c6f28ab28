//! Prompt text the engine builds itself. System prompts are configuration and
//! passed through untouched; these are only the defaults and the framing around
//! the context metadata, leaf sub-calls and execution reports.

use crate::context::ContextBuffer;

/// Used when no system prompt is configured.
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are the Controller of a recursive analysis session.
A large text context is loaded in an execution environment. You cannot see it directly;
you operate on it by writing operation blocks:

```repl
{"op": "read_context", "start": 0, "end": 2000}
```

Each line of a repl block is one JSON operation. Available operations:
- {"op": "read_context", "start": S, "end": E, "into": "var"?}  characters [S, E) of the context
- {"op": "plan_chunks", "chunk_size": N, "overlap": K?, "into": "var"?}  chunk descriptors {id, start, end}; no text
- {"op": "call_sub_llm", "instruction": "...", "content": C, "into": "var"?}  ask a sub-model about C
- {"op": "llm_batch", "instruction": "...", "chunks": [C, ...] | "plan": "var", "into": "var"?}  sub-calls in parallel, results in input order
- {"op": "set_var", "name": "var", "value": V}
- {"op": "get_var", "name": "var", "default": V?}
- {"op": "final_var", "name": "var"}  finish with the value of a variable
- {"op": "final", "answer": V}  finish with a literal answer
- {"op": "abort", "reason": "..."}  give up

Content C is a string (literal text), {"var": "name"} or {"start": S, "end": E} (a context slice).
Failed batch members come back as {"error": kind, "message": ...} in their position.
Results of each block are reported back to you. Finish with final_var or final."#;

/// How many characters of the context the metadata header previews.
pub const PREVIEW_CHARS: usize = 500;

/// The first user turn: context metadata followed by the query.
pub fn initial_message(context: &ContextBuffer, depth: u32, max_depth: u32, query: &str) -> String {
    let preview = context.preview(PREVIEW_CHARS);
    let ellipsis = if context.len() > PREVIEW_CHARS { "..." } else { "" };
    let recursion = if depth < max_depth {
        format!("Sub-calls are available (depth {depth} of max {max_depth}).")
    } else {
        format!("Sub-calls are NOT available (depth {depth} is the max depth {max_depth}).")
    };
    format!(
        "Context: {} characters.\nPreview:\n\"\"\"\n{preview}{ellipsis}\n\"\"\"\n{recursion}\n\nQuery: {query}",
        context.len()
    )
}

/// The prompt for a leaf sub-call: instruction plus content inline.
pub fn leaf_prompt(instruction: &str, content: &str) -> String {
    format!("{instruction}\n\n--- CONTENT ---\n{content}\n--- END CONTENT ---")
}

/// Sent when a reply contained nothing to execute.
pub const NO_OPERATIONS_NOTICE: &str = "No ```repl block found in your reply. Write operations in a ```repl block, or finish with {\"op\": \"final_var\", \"name\": ...}.";

/// Cut `text` to at most `max_chars` characters, noting how much was dropped.
pub fn truncate_output(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars).collect();
    format!("{kept}\n... [truncated {} of {total} chars]", total - max_chars)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_output() {
        assert_eq!(truncate_output("short", 10), "short");
        let cut = truncate_output(&"x".repeat(50), 10);
        assert!(cut.starts_with(&"x".repeat(10)));
        assert!(cut.ends_with("[truncated 40 of 50 chars]"));
    }

    #[test]
    fn test_initial_message_reports_depth() {
        let ctx = ContextBuffer::new("abc");
        let msg = initial_message(&ctx, 0, 1, "count");
        assert!(msg.starts_with("Context: 3 characters."));
        assert!(msg.contains("Sub-calls are available"));
        assert!(msg.ends_with("Query: count"));

        let msg = initial_message(&ctx, 1, 1, "count");
        assert!(msg.contains("Sub-calls are NOT available"));
    }
}
