use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use rlm_config::RlmConfig;
use rlm_core::{ChunkDescriptor, Result, RlmError, SessionId, SessionState};
use rlm_llm::Gateway;
use rlm_memory::VariableStore;

use crate::context::ContextBuffer;
use crate::dispatcher::{self, BatchOutcome, SubCallParent};
use crate::ops::ContentRef;
use crate::registry::SessionRegistry;
use crate::trace::{Trace, TraceOutcome};

/// Limits and model choices shared by every engine in a call tree.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_depth: u32,
    /// Controller rounds before the safety break.
    pub max_iterations: u32,
    /// Sub-calls in flight per batch.
    pub max_concurrency: usize,
    pub call_timeout: Option<Duration>,
    pub batch_timeout: Option<Duration>,
    pub session_timeout: Option<Duration>,
    pub output_max_chars: usize,
    pub controller_max_tokens: usize,
    /// Model driving root sessions.
    pub model: String,
    /// Model for nested sessions and leaf sub-calls.
    pub sub_model: String,
    pub system_prompt: Option<String>,
    pub sub_system_prompt: Option<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&RlmConfig::default(), None)
    }
}

impl EngineSettings {
    /// Settings from a loaded config. `system_prompt` is the resolved Controller
    /// prompt (file or inline), see `ConfigLoader::system_prompt`.
    pub fn from_config(config: &RlmConfig, system_prompt: Option<String>) -> Self {
        let engine = &config.engine;
        Self {
            max_depth: engine.max_depth,
            max_iterations: engine.max_iterations,
            max_concurrency: engine.max_concurrency,
            call_timeout: engine.call_timeout(),
            batch_timeout: engine.batch_timeout(),
            session_timeout: engine.session_timeout(),
            output_max_chars: engine.output_max_chars,
            controller_max_tokens: engine.controller_max_tokens,
            model: config.backend.model.clone(),
            sub_model: config.backend.sub_model().to_string(),
            system_prompt: system_prompt.or_else(|| config.prompts.system_prompt.clone()),
            sub_system_prompt: config.prompts.sub_system_prompt.clone(),
        }
    }
}

/// State shared by every engine a runtime creates.
pub(crate) struct Shared {
    pub(crate) gateway: Arc<dyn Gateway>,
    pub(crate) settings: EngineSettings,
    pub(crate) registry: SessionRegistry,
}

/// One engine instance: a context, a private variable store and the operations
/// generated code may invoke on them.
///
/// Root engines start at depth 0. Every sub-call builds a child engine one level
/// deeper over its own content, with a fresh store and the same `max_depth`.
pub struct Engine {
    id: SessionId,
    parent: Option<SessionId>,
    depth: u32,
    max_depth: u32,
    context: ContextBuffer,
    store: VariableStore,
    shared: Arc<Shared>,
    trace: Trace,
    cancel: CancellationToken,
}

impl Engine {
    pub(crate) fn root(
        shared: Arc<Shared>,
        context: ContextBuffer,
        max_depth: u32,
        cancel: CancellationToken,
    ) -> Self {
        let id = shared.registry.register(None, 0, "root");
        info!(session_id = %id, context_chars = context.len(), max_depth, "created root engine");
        Self {
            id,
            parent: None,
            depth: 0,
            max_depth,
            context,
            store: VariableStore::new(),
            trace: Trace::new(id),
            shared,
            cancel,
        }
    }

    /// Build a nested engine under `parent`. Fails when the new depth would
    /// exceed `max_depth`.
    pub(crate) fn nested(parent: &SubCallParent, context: ContextBuffer, label: &str) -> Result<Self> {
        let depth = parent.depth + 1;
        if depth > parent.max_depth {
            return Err(RlmError::DepthExceeded {
                depth: parent.depth,
                max_depth: parent.max_depth,
            });
        }
        let id = parent.shared.registry.register(Some(parent.id), depth, label);
        debug!(session_id = %id, parent = %parent.id, depth, context_chars = context.len(), "created nested engine");
        Ok(Self {
            id,
            parent: Some(parent.id),
            depth,
            max_depth: parent.max_depth,
            context,
            store: VariableStore::new(),
            trace: parent.trace.child(id, depth),
            shared: Arc::clone(&parent.shared),
            cancel: parent.cancel.child_token(),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn parent(&self) -> Option<SessionId> {
        self.parent
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    /// Whether this engine may issue sub-calls.
    pub fn can_recurse(&self) -> bool {
        self.depth < self.max_depth
    }

    pub fn context(&self) -> &ContextBuffer {
        &self.context
    }

    pub fn store(&self) -> &VariableStore {
        &self.store
    }

    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.shared.settings
    }

    pub(crate) fn gateway(&self) -> &Arc<dyn Gateway> {
        &self.shared.gateway
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn state(&self) -> SessionState {
        self.shared
            .registry
            .get(self.id)
            .map(|r| r.state)
            .unwrap_or(SessionState::Running)
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        self.shared.registry.set_state(self.id, state);
    }

    // ── Context ────────────────────────────────────────────────

    pub fn read_context(&self, start: usize, end: usize) -> Result<String> {
        let pending = self.trace.begin("read_context", json!({"start": start, "end": end}));
        let result = self.context.read_context(start, end);
        self.trace.finish(
            pending,
            TraceOutcome::from_result(&result, |text| format!("{} chars", text.chars().count())),
        );
        result
    }

    pub fn plan_chunks(&self, chunk_size: usize, overlap: usize) -> Result<Vec<ChunkDescriptor>> {
        let pending = self
            .trace
            .begin("plan_chunks", json!({"chunk_size": chunk_size, "overlap": overlap}));
        let result = self.context.plan_chunks(chunk_size, overlap);
        self.trace.finish(
            pending,
            TraceOutcome::from_result(&result, |chunks| format!("{} chunks", chunks.len())),
        );
        result
    }

    /// Resolve a content reference against this engine's context and store.
    /// Slices share the context's text.
    pub fn resolve_content(&self, content: &ContentRef) -> Result<ContextBuffer> {
        match content {
            ContentRef::Text(text) => Ok(ContextBuffer::from(text.as_str())),
            ContentRef::Var { var } => match self.store.get_var(var, Value::Null) {
                Value::Null if !self.store.contains(var) => Err(RlmError::InvalidParameter(
                    format!("content variable `{var}` is not set"),
                )),
                value => Ok(ContextBuffer::from(rlm_memory::value_text(&value))),
            },
            ContentRef::Slice { start, end } => {
                let (start, end) = self.checked_range(*start, *end)?;
                self.context.slice(start, end)
            }
        }
    }

    /// Validate signed offsets from generated code.
    pub fn checked_range(&self, start: i64, end: i64) -> Result<(usize, usize)> {
        if start < 0 || end < 0 {
            return Err(RlmError::Range {
                start,
                end,
                len: self.context.len(),
            });
        }
        Ok((start as usize, end as usize))
    }

    // ── Memory ─────────────────────────────────────────────────

    pub fn set_var(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        let pending = self.trace.begin("set_var", json!({"name": name}));
        self.store.set_var(name, value);
        self.trace.finish(pending, TraceOutcome::ok("ok"));
    }

    pub fn get_var(&self, name: &str, default: Value) -> Value {
        let pending = self.trace.begin("get_var", json!({"name": name}));
        let found = self.store.contains(name);
        let value = self.store.get_var(name, default);
        self.trace.finish(
            pending,
            TraceOutcome::ok(if found { "found" } else { "default" }),
        );
        value
    }

    /// The stored value of `name`, untruncated.
    pub fn final_var(&self, name: &str) -> Result<Value> {
        let pending = self.trace.begin("final_var", json!({"name": name}));
        let result = self.store.final_var(name);
        self.trace.finish(
            pending,
            TraceOutcome::from_result(&result, |v| format!("{} chars", rlm_memory::value_text(v).len())),
        );
        result
    }

    // ── Sub-calls ──────────────────────────────────────────────

    pub(crate) fn sub_call_parent(&self) -> SubCallParent {
        SubCallParent {
            shared: Arc::clone(&self.shared),
            id: self.id,
            depth: self.depth,
            max_depth: self.max_depth,
            trace: self.trace.clone(),
            cancel: self.cancel.clone(),
            deadline: None,
        }
    }

    /// Run `instruction` over `content` in a nested engine and return its answer.
    ///
    /// Fails with `DepthExceeded` without contacting the backend when this
    /// engine is already at `max_depth`.
    pub async fn call_sub_llm(&self, instruction: &str, content: impl Into<ContextBuffer>) -> Result<String> {
        let (_, result) =
            dispatcher::dispatch_one(self.sub_call_parent(), Arc::from(instruction), content.into(), None).await;
        result
    }

    /// Run `instruction` over every chunk concurrently.
    ///
    /// The outcome always has one entry per chunk, in input order; failed
    /// members carry a failure marker and never affect their siblings.
    pub async fn llm_batch(&self, instruction: &str, chunks: Vec<ContextBuffer>) -> BatchOutcome {
        let members = chunks.len();
        let event = self
            .trace
            .guard("llm_batch", json!({"instruction": preview(instruction), "members": members}));
        let settings = &self.shared.settings;
        let outcome = dispatcher::dispatch_batch(
            self.sub_call_parent(),
            Arc::from(instruction),
            chunks,
            settings.max_concurrency,
            settings.batch_timeout,
        )
        .await;
        event.finish(TraceOutcome::ok(format!("{} of {} succeeded", outcome.succeeded(), members)));
        outcome
    }
}

/// Short form of an instruction for trace args.
pub(crate) fn preview(text: &str) -> String {
    const MAX: usize = 120;
    if text.chars().count() <= MAX {
        text.to_string()
    } else {
        let cut: String = text.chars().take(MAX).collect();
        format!("{cut}...")
    }
}
