use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use rlm_llm::Gateway;

use crate::context::ContextBuffer;
use crate::engine::{Engine, EngineSettings, Shared, preview};
use crate::prompts::DEFAULT_SYSTEM_PROMPT;
use crate::registry::SessionRegistry;
use crate::session::{self, SessionOutput};

/// A question about a context.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub context: ContextBuffer,
    pub query: String,
    /// Overrides the configured Controller prompt.
    pub system_prompt: Option<String>,
    /// Overrides the configured recursion limit.
    pub max_depth: Option<u32>,
}

impl SessionRequest {
    pub fn new(context: impl Into<ContextBuffer>, query: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            query: query.into(),
            system_prompt: None,
            max_depth: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = Some(max_depth);
        self
    }
}

/// Entry point: owns the gateway, settings and session registry, and runs
/// root sessions against them.
#[derive(Clone)]
pub struct RlmRuntime {
    shared: Arc<Shared>,
}

impl RlmRuntime {
    pub fn new(gateway: Arc<dyn Gateway>, settings: EngineSettings) -> Self {
        Self {
            shared: Arc::new(Shared {
                gateway,
                settings,
                registry: SessionRegistry::new(),
            }),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.shared.settings
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.shared.registry
    }

    /// A root engine over `context` for driving operations directly.
    pub fn engine(&self, context: impl Into<ContextBuffer>, max_depth: Option<u32>) -> Engine {
        self.engine_with_cancel(context.into(), max_depth, CancellationToken::new())
    }

    fn engine_with_cancel(&self, context: ContextBuffer, max_depth: Option<u32>, cancel: CancellationToken) -> Engine {
        let max_depth = max_depth.unwrap_or(self.shared.settings.max_depth);
        Engine::root(Arc::clone(&self.shared), context, max_depth, cancel)
    }

    /// Run a Controller session to a terminal state.
    pub async fn run(&self, request: SessionRequest) -> SessionOutput {
        self.run_with_cancel(request, CancellationToken::new()).await
    }

    /// Like [`run`](Self::run); cancelling `cancel` aborts the session and
    /// every sub-call under it.
    pub async fn run_with_cancel(&self, request: SessionRequest, cancel: CancellationToken) -> SessionOutput {
        let mut engine = self.engine_with_cancel(request.context, request.max_depth, cancel);
        let system = request
            .system_prompt
            .or_else(|| self.shared.settings.system_prompt.clone())
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());
        let deadline = self.shared.settings.session_timeout.map(|t| Instant::now() + t);

        info!(
            session_id = %engine.id(),
            model = %self.shared.settings.model,
            max_depth = engine.max_depth(),
            query = %preview(&request.query),
            "starting session"
        );
        let mut output = session::run_root(&mut engine, &request.query, &system, deadline).await;

        // The call tree travels with the output; the registry only tracks
        // sessions that are still running.
        output.sessions = self.shared.registry.subtree(output.session_id);
        let evicted = self.shared.registry.remove_tree(output.session_id);
        debug!(session_id = %output.session_id, evicted, "released session tree");
        output
    }
}
