//! Sub-call dispatch: serial `call_sub_llm` and concurrent `llm_batch`.

use serde::Serialize;
use serde_json::{Value, json};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use rlm_core::{FailureKind, Result, RlmError, SessionId, SessionState, SubCallOutcome};

use crate::context::ContextBuffer;
use crate::engine::{Engine, Shared, preview};
use crate::prompts::leaf_prompt;
use crate::session;
use crate::trace::{EventGuard, Trace, TraceOutcome};

/// What a sub-call needs from its parent engine. Owned so batch members can
/// move it into spawned tasks.
#[derive(Clone)]
pub(crate) struct SubCallParent {
    pub(crate) shared: Arc<Shared>,
    pub(crate) id: SessionId,
    pub(crate) depth: u32,
    pub(crate) max_depth: u32,
    pub(crate) trace: Trace,
    pub(crate) cancel: CancellationToken,
    /// Set for batch members: fires when the batch deadline passes.
    pub(crate) deadline: Option<BatchDeadline>,
}

#[derive(Clone)]
pub(crate) struct BatchDeadline {
    token: CancellationToken,
    limit: Duration,
}

impl BatchDeadline {
    fn error(&self) -> RlmError {
        RlmError::BatchTimeout {
            timeout_ms: self.limit.as_millis() as u64,
        }
    }

    fn passed(&self) -> bool {
        self.token.is_cancelled()
    }
}

type SubCallFuture = Pin<Box<dyn Future<Output = (Option<SessionId>, Result<String>)> + Send>>;

/// Trace event and child registration of one sub-call. Whatever happens to
/// the future running the call, the event is recorded once and the child
/// reaches a terminal state.
struct SubCallRecord {
    event: Option<EventGuard>,
    shared: Arc<Shared>,
    child: Option<SessionId>,
}

impl SubCallRecord {
    fn attach(&mut self, child: SessionId) {
        if let Some(event) = self.event.as_mut() {
            event.set_child(child);
        }
        self.child = Some(child);
    }

    fn finish(mut self, result: &Result<String>) {
        if let Some(child) = self.child.take() {
            let state = match result {
                Ok(_) => SessionState::Completed,
                Err(RlmError::Aborted(_) | RlmError::BatchTimeout { .. }) => SessionState::Aborted,
                Err(_) => SessionState::Failed,
            };
            self.shared.registry.set_state(child, state);
        }
        if let Some(event) = self.event.take() {
            event.finish(TraceOutcome::from_result(result, |answer| {
                format!("{} chars", answer.chars().count())
            }));
        }
    }
}

impl Drop for SubCallRecord {
    fn drop(&mut self) {
        if let Some(child) = self.child.take() {
            self.shared.registry.set_state(child, SessionState::Aborted);
        }
    }
}

/// Run one sub-call and record it in the parent's trace.
///
/// Boxed because nested sessions dispatch sub-calls of their own
/// (dispatch_one → run_nested → Engine::call_sub_llm → dispatch_one).
pub(crate) fn dispatch_one(
    parent: SubCallParent,
    instruction: Arc<str>,
    content: ContextBuffer,
    batch_index: Option<usize>,
) -> SubCallFuture {
    Box::pin(async move {
        let mut args = json!({
            "instruction": preview(&instruction),
            "content_chars": content.len(),
        });
        if let Some(index) = batch_index {
            args["batch_index"] = json!(index);
        }
        let mut record = SubCallRecord {
            event: Some(parent.trace.guard("call_sub_llm", args)),
            shared: Arc::clone(&parent.shared),
            child: None,
        };

        let child = match Engine::nested(&parent, content, "sub_call") {
            Ok(child) => child,
            Err(e) => {
                debug!(parent = %parent.id, depth = parent.depth, "sub-call refused at max depth");
                let result = Err(e);
                record.finish(&result);
                return (None, result);
            }
        };
        let child_id = child.id();
        record.attach(child_id);
        let result = run_child(child, &parent, &instruction).await;
        record.finish(&result);
        (Some(child_id), result)
    })
}

async fn run_child(child: Engine, parent: &SubCallParent, instruction: &str) -> Result<String> {
    let settings = &parent.shared.settings;
    let call_timeout = settings.call_timeout;

    // Resolves to the error that interrupts the sub-call.
    let interrupted = async {
        let deadline = async {
            match parent.deadline {
                Some(ref deadline) => {
                    deadline.token.cancelled().await;
                    deadline.error()
                }
                None => std::future::pending().await,
            }
        };
        let timed_out = async {
            match call_timeout {
                Some(limit) => {
                    tokio::time::sleep(limit).await;
                    RlmError::BackendTimeout {
                        timeout_ms: limit.as_millis() as u64,
                    }
                }
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            biased;
            _ = parent.cancel.cancelled() => RlmError::Aborted("sub-call cancelled".into()),
            e = deadline => e,
            e = timed_out => e,
        }
    };

    if !child.can_recurse() {
        let prompt = leaf_prompt(instruction, child.context().as_str());
        let send = child.gateway().send(&prompt, &settings.sub_model, call_timeout);
        return tokio::select! {
            biased;
            e = interrupted => Err(e),
            result = send => result,
        };
    }

    // A nested session is wound down through its own token, not dropped, so
    // the sub-calls it has in flight settle their bookkeeping first.
    let child_cancel = child.cancel_token().clone();
    let nested = session::run_nested(child, instruction);
    tokio::pin!(nested);
    tokio::select! {
        biased;
        e = interrupted => {
            child_cancel.cancel();
            let _ = nested.await;
            Err(e)
        }
        result = &mut nested => result,
    }
}

/// Run `instruction` over each chunk, at most `max_concurrency` at a time.
///
/// When the deadline passes, members still running are cancelled through
/// their own select so each one records its event and child state before
/// the batch returns.
pub(crate) async fn dispatch_batch(
    parent: SubCallParent,
    instruction: Arc<str>,
    chunks: Vec<ContextBuffer>,
    max_concurrency: usize,
    batch_timeout: Option<Duration>,
) -> BatchOutcome {
    let total = chunks.len();
    if total == 0 {
        return BatchOutcome::default();
    }

    let deadline = batch_timeout.map(|limit| BatchDeadline {
        token: CancellationToken::new(),
        limit,
    });
    let semaphore = Arc::new(Semaphore::new(max_concurrency.max(1)));
    let mut join_set = JoinSet::new();
    for (index, chunk) in chunks.into_iter().enumerate() {
        let member = SubCallParent {
            deadline: deadline.clone(),
            ..parent.clone()
        };
        let instruction = Arc::clone(&instruction);
        let semaphore = Arc::clone(&semaphore);
        join_set.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return (index, SubCallOutcome::failure(FailureKind::Aborted, "batch closed"));
            };
            // Queued members that only get a permit after the deadline never start
            if let Some(ref deadline) = member.deadline
                && deadline.passed()
            {
                return (index, SubCallOutcome::from(Err::<String, _>(deadline.error())));
            }
            if member.cancel.is_cancelled() {
                return (index, SubCallOutcome::failure(FailureKind::Aborted, "sub-call cancelled"));
            }
            let (_, result) = dispatch_one(member, instruction, chunk, Some(index)).await;
            (index, SubCallOutcome::from(result))
        });
    }

    let mut slots: Vec<Option<SubCallOutcome>> = vec![None; total];
    match deadline {
        Some(ref deadline) => {
            let finished = tokio::time::timeout(deadline.limit, collect(&mut join_set, &mut slots)).await;
            if finished.is_err() {
                let pending = slots.iter().filter(|s| s.is_none()).count();
                warn!(parent = %parent.id, pending, total, "batch deadline passed, cancelling pending sub-calls");
                deadline.token.cancel();
                collect(&mut join_set, &mut slots).await;
            }
        }
        None => collect(&mut join_set, &mut slots).await,
    }

    let outcomes = slots
        .into_iter()
        .map(|slot| {
            slot.unwrap_or_else(|| SubCallOutcome::failure(FailureKind::Other, "sub-call task did not complete"))
        })
        .collect();
    BatchOutcome { outcomes }
}

async fn collect(join_set: &mut JoinSet<(usize, SubCallOutcome)>, slots: &mut [Option<SubCallOutcome>]) {
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok((index, outcome)) => slots[index] = Some(outcome),
            Err(e) => warn!(error = %e, "batch member task failed"),
        }
    }
}

/// Per-member results of an `llm_batch`, in input order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchOutcome {
    pub outcomes: Vec<SubCallOutcome>,
}

impl BatchOutcome {
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.len() - self.succeeded()
    }

    /// The outcomes as generated code sees them: answer strings, or failure
    /// marker objects in place.
    pub fn to_json(&self) -> Value {
        Value::Array(self.outcomes.iter().map(SubCallOutcome::to_json).collect())
    }

    /// All answers, or `BatchPartialFailure` carrying every outcome when any
    /// member failed.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.failed() > 0 {
            return Err(RlmError::BatchPartialFailure {
                outcomes: self.outcomes,
            });
        }
        Ok(self
            .outcomes
            .into_iter()
            .filter_map(|o| match o {
                SubCallOutcome::Success { value } => Some(value),
                SubCallOutcome::Failure { .. } => None,
            })
            .collect())
    }
}
