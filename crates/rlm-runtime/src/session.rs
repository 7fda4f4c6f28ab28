//! The Controller loop: send the transcript, execute the operation blocks in
//! the reply, report back, until an answer or a terminal condition.

use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use rlm_core::{FailureKind, Message, Result, RlmError, SessionId, SessionState};
use rlm_memory::{Transcript, value_text};

use crate::engine::Engine;
use crate::ops::{ContentRef, FinalMarker, Operation, parse_reply};
use crate::prompts::{DEFAULT_SYSTEM_PROMPT, NO_OPERATIONS_NOTICE, initial_message, truncate_output};
use crate::registry::SessionRecord;
use crate::trace::TraceEvent;

/// Variable a literal `final` answer is stored under.
pub const FINAL_ANSWER_VAR: &str = "final_answer";

/// Result of a root session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionOutput {
    pub session_id: SessionId,
    pub state: SessionState,
    /// The terminal value, untruncated. `None` unless `Completed`.
    pub answer: Option<Value>,
    pub error: Option<String>,
    pub failure: Option<FailureKind>,
    /// Controller rounds used.
    pub iterations: u32,
    /// Every operation in the call tree, nested sessions included.
    pub trace: Vec<TraceEvent>,
    /// Every session in the call tree, root first, as it ended.
    pub sessions: Vec<SessionRecord>,
}

impl SessionOutput {
    pub fn is_completed(&self) -> bool {
        self.state == SessionState::Completed
    }

    /// The answer as text: strings verbatim, other values as JSON.
    pub fn answer_text(&self) -> Option<String> {
        self.answer.as_ref().map(value_text)
    }
}

pub(crate) enum Termination {
    Answer(Value),
    Failed(RlmError),
    Aborted(RlmError),
}

impl Termination {
    fn state(&self) -> SessionState {
        match self {
            Termination::Answer(_) => SessionState::Completed,
            Termination::Failed(_) => SessionState::Failed,
            Termination::Aborted(_) => SessionState::Aborted,
        }
    }
}

enum Step {
    Output(String),
    Finish(Value),
}

/// Run a root session to completion.
pub(crate) async fn run_root(
    engine: &mut Engine,
    query: &str,
    system_prompt: &str,
    deadline: Option<Instant>,
) -> SessionOutput {
    let model = engine.settings().model.clone();
    let (termination, iterations) = drive(engine, query, &model, system_prompt, deadline).await;
    let state = termination.state();
    engine.set_state(state);

    let (answer, error, failure) = match termination {
        Termination::Answer(value) => (Some(value), None, None),
        Termination::Failed(e) | Termination::Aborted(e) => {
            (None, Some(e.to_string()), Some(e.failure_kind()))
        }
    };
    info!(
        session_id = %engine.id(),
        state = ?state,
        iterations,
        trace_events = engine.trace().len(),
        "session finished"
    );
    SessionOutput {
        session_id: engine.id(),
        state,
        answer,
        error,
        failure,
        iterations,
        trace: engine.trace().events(),
        sessions: Vec::new(),
    }
}

/// Run a nested session for a sub-call and return its answer as text.
/// A session that ends without an answer returns the error that ended it.
pub(crate) async fn run_nested(mut engine: Engine, query: &str) -> Result<String> {
    let settings = engine.settings().clone();
    let system = settings
        .sub_system_prompt
        .as_deref()
        .unwrap_or(DEFAULT_SYSTEM_PROMPT);
    let (termination, iterations) = drive(&mut engine, query, &settings.sub_model, system, None).await;
    engine.set_state(termination.state());
    debug!(session_id = %engine.id(), depth = engine.depth(), iterations, "nested session finished");
    match termination {
        Termination::Answer(value) => Ok(value_text(&value)),
        Termination::Failed(e) | Termination::Aborted(e) => Err(e),
    }
}

async fn drive(
    engine: &mut Engine,
    query: &str,
    model: &str,
    system: &str,
    deadline: Option<Instant>,
) -> (Termination, u32) {
    let settings = engine.settings().clone();
    let cancel = engine.cancel_token().clone();
    let gateway = Arc::clone(engine.gateway());

    let mut transcript = Transcript::new(settings.controller_max_tokens);
    transcript.push(Message::user(initial_message(
        engine.context(),
        engine.depth(),
        engine.max_depth(),
        query,
    )));

    let mut iterations = 0u32;
    loop {
        if iterations >= settings.max_iterations {
            warn!(session_id = %engine.id(), iterations, "iteration cap reached without an answer");
            let e = RlmError::SafetyBreak(format!(
                "no answer after {iterations} iterations"
            ));
            return (Termination::Failed(e), iterations);
        }
        iterations += 1;

        let send = gateway.send_conversation(
            Some(system),
            transcript.messages(),
            model,
            settings.call_timeout,
        );
        let reply = match guarded(&cancel, deadline, send).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                warn!(session_id = %engine.id(), error = %e, "controller request failed");
                return (Termination::Failed(e), iterations);
            }
            Err(t) => return (t, iterations),
        };
        transcript.push(Message::assistant(reply.as_str()));

        let parsed = parse_reply(&reply);
        if parsed.is_empty() {
            debug!(session_id = %engine.id(), iteration = iterations, "reply had no operations");
            transcript.push(Message::user(NO_OPERATIONS_NOTICE));
            continue;
        }
        debug!(
            session_id = %engine.id(),
            iteration = iterations,
            blocks = parsed.blocks.len(),
            operations = parsed.operation_count(),
            "executing reply"
        );

        let mut report = Vec::new();
        for (b, block) in parsed.blocks.into_iter().enumerate() {
            for (i, op) in block.into_iter().enumerate() {
                let label = format!("[{}.{}]", b + 1, i + 1);
                let op = match op {
                    Ok(op) => op,
                    Err(e) => {
                        report.push(format!("{label} {}", error_line(&e)));
                        break;
                    }
                };
                let name = op.name();
                let step = match drained(&cancel, deadline, execute(engine, op)).await {
                    Ok(step) => step,
                    Err(t) => return (t, iterations),
                };
                match step {
                    Ok(Step::Output(text)) => {
                        report.push(format!(
                            "{label} {name}: {}",
                            truncate_output(&text, settings.output_max_chars)
                        ));
                    }
                    Ok(Step::Finish(value)) => return (Termination::Answer(value), iterations),
                    Err(e) => {
                        if let Some(t) = terminal(engine, name, &e) {
                            return (t(e), iterations);
                        }
                        report.push(format!("{label} {name}: {}", error_line(&e)));
                        break;
                    }
                }
                if cancel.is_cancelled() {
                    return (Termination::Aborted(RlmError::Aborted("session cancelled".into())), iterations);
                }
            }
        }

        match parsed.final_marker {
            Some(FinalMarker::Var(name)) => {
                return match engine.final_var(&name) {
                    Ok(value) => (Termination::Answer(value), iterations),
                    Err(e) => (Termination::Failed(e), iterations),
                };
            }
            Some(FinalMarker::Answer(text)) => {
                engine.set_var(FINAL_ANSWER_VAR, Value::String(text.clone()));
                return (Termination::Answer(Value::String(text)), iterations);
            }
            None => {}
        }

        if report.is_empty() {
            transcript.push(Message::user(NO_OPERATIONS_NOTICE));
        } else {
            transcript.push(Message::user(report.join("\n\n")));
        }
    }
}

/// Whether an operation error ends the session, and how.
fn terminal(engine: &Engine, op: &str, error: &RlmError) -> Option<fn(RlmError) -> Termination> {
    match error {
        RlmError::Aborted(_) if engine.cancel_token().is_cancelled() => Some(Termination::Aborted),
        RlmError::VariableNotFound(_) if op == "final_var" => Some(Termination::Failed),
        RlmError::SafetyBreak(_) if op == "abort" => Some(Termination::Failed),
        // Only this engine's own refusal; a child's failure is just a failed sub-call.
        RlmError::DepthExceeded { depth, .. } if *depth == engine.depth() => Some(Termination::Failed),
        _ => None,
    }
}

fn error_line(e: &RlmError) -> String {
    format!("error[{}]: {e}", e.failure_kind())
}

/// Await `fut` unless the session is cancelled or its deadline passes first.
async fn guarded<F: Future>(
    cancel: &CancellationToken,
    deadline: Option<Instant>,
    fut: F,
) -> std::result::Result<F::Output, Termination> {
    let expired = async {
        match deadline {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        _ = cancel.cancelled() => Err(Termination::Aborted(RlmError::Aborted("session cancelled".into()))),
        _ = expired => {
            cancel.cancel();
            Err(Termination::Aborted(RlmError::Aborted("session timeout".into())))
        }
        out = fut => Ok(out),
    }
}

/// Like [`guarded`], but an interrupted operation is not dropped: the token is
/// cancelled and the operation is awaited until its sub-calls have wound down
/// and recorded their outcomes.
async fn drained<F: Future>(
    cancel: &CancellationToken,
    deadline: Option<Instant>,
    fut: F,
) -> std::result::Result<F::Output, Termination> {
    tokio::pin!(fut);
    match guarded(cancel, deadline, fut.as_mut()).await {
        Ok(out) => Ok(out),
        Err(t) => {
            cancel.cancel();
            // Every wait inside a sub-call selects on the token first.
            let _ = fut.await;
            Err(t)
        }
    }
}

async fn execute(engine: &mut Engine, op: Operation) -> Result<Step> {
    match op {
        Operation::ReadContext { start, end, into } => {
            let (start, end) = engine.checked_range(start, end)?;
            let text = engine.read_context(start, end)?;
            Ok(store(engine, into, Value::String(text)))
        }
        Operation::PlanChunks {
            chunk_size,
            overlap,
            into,
        } => {
            let chunk_size = non_negative("chunk_size", chunk_size)?;
            let overlap = non_negative("overlap", overlap)?;
            let chunks = engine.plan_chunks(chunk_size, overlap)?;
            Ok(store(engine, into, serde_json::to_value(&chunks)?))
        }
        Operation::CallSubLlm {
            instruction,
            content,
            into,
        } => {
            let content = engine.resolve_content(&content)?;
            let answer = engine.call_sub_llm(&instruction, content).await?;
            Ok(store(engine, into, Value::String(answer)))
        }
        Operation::LlmBatch {
            instruction,
            chunks,
            plan,
            into,
        } => {
            let refs = match (chunks, plan) {
                (Some(chunks), None) => chunks,
                (None, Some(plan)) => plan_refs(engine, &plan)?,
                _ => {
                    return Err(RlmError::InvalidParameter(
                        "llm_batch takes exactly one of `chunks` or `plan`".into(),
                    ));
                }
            };
            let buffers = refs
                .iter()
                .map(|r| engine.resolve_content(r))
                .collect::<Result<Vec<_>>>()?;
            let outcome = engine.llm_batch(&instruction, buffers).await;
            Ok(store(engine, into, outcome.to_json()))
        }
        Operation::SetVar { name, value } => {
            engine.set_var(name.as_str(), value);
            Ok(Step::Output(format!("`{name}` set")))
        }
        Operation::GetVar { name, default } => Ok(Step::Output(value_text(&engine.get_var(&name, default)))),
        Operation::FinalVar { name } => Ok(Step::Finish(engine.final_var(&name)?)),
        Operation::Final { answer } => {
            engine.set_var(FINAL_ANSWER_VAR, answer.clone());
            Ok(Step::Finish(answer))
        }
        Operation::Abort { reason } => Err(RlmError::SafetyBreak(format!("controller aborted: {reason}"))),
    }
}

/// Store `value` when `into` is given and render it for the report.
fn store(engine: &mut Engine, into: Option<String>, value: Value) -> Step {
    let text = value_text(&value);
    match into {
        Some(name) => {
            engine.set_var(name.as_str(), value);
            Step::Output(format!("`{name}` = {text}"))
        }
        None => Step::Output(text),
    }
}

fn non_negative(field: &str, value: i64) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| RlmError::InvalidParameter(format!("{field} must not be negative, got {value}")))
}

/// Content references for the chunk descriptors stored in `plan`.
fn plan_refs(engine: &Engine, plan: &str) -> Result<Vec<ContentRef>> {
    let value = engine.get_var(plan, Value::Null);
    if value.is_null() {
        return Err(RlmError::InvalidParameter(format!(
            "plan variable `{plan}` is not set"
        )));
    }
    serde_json::from_value::<Vec<ContentRef>>(value).map_err(|e| {
        RlmError::InvalidParameter(format!(
            "plan variable `{plan}` does not hold chunk descriptors: {e}"
        ))
    })
}
