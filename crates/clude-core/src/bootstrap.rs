//! Session assembly.
//!
//! Wires the standard services (HTTP LLM client, built-in tool registry,
//! registries under `.clude/`, audit and trace recorders) into a ready
//! orchestrator. The CLI and integration tests both go through here.

use std::sync::Arc;

use anyhow::Result;

use crate::agent::{EventBus, Orchestrator, OrchestratorServices, SessionConfig};
use crate::ai::client::{ChatBackend, LlmClient};
use crate::audit::{spawn_audit_recorder, spawn_trace_recorder, JsonlSink};
use crate::config::CoreConfig;
use crate::intent::{IntentRegistry, ProfileRouter};
use crate::paths;
use crate::prompts::{AssetLoader, ProfileRegistry};
use crate::tools::builtin::default_registry;

/// A fully wired session plus the recorder task handles.
pub struct Session {
    pub orchestrator: Orchestrator,
    pub recorders: Vec<tokio::task::JoinHandle<()>>,
}

/// Assemble a session over the standard HTTP backend.
pub fn build_session(config: CoreConfig, session_id: impl Into<String>) -> Result<Session> {
    let backend: Arc<dyn ChatBackend> = Arc::new(crate::ai::client::HttpBackend::new(
        config.llm_base_url.clone(),
        config.api_key.clone(),
    ));
    build_session_with_backend(config, session_id, backend)
}

/// Assemble a session over any backend (tests inject a scripted one).
pub fn build_session_with_backend(
    config: CoreConfig,
    session_id: impl Into<String>,
    backend: Arc<dyn ChatBackend>,
) -> Result<Session> {
    let workspace_root = config.workspace_root.clone();

    let bus = Arc::new(EventBus::new());
    let mut recorders = Vec::new();

    paths::ensure_logs_dir(&workspace_root)?;
    let audit_sink = Arc::new(JsonlSink::open(&paths::audit_log_path(&workspace_root))?);
    recorders.push(spawn_audit_recorder(&bus, audit_sink));
    let trace_sink = Arc::new(JsonlSink::open(&paths::trace_log_path(&workspace_root))?);
    recorders.push(spawn_trace_recorder(&bus, trace_sink));

    let services = OrchestratorServices {
        llm: Arc::new(LlmClient::new(backend, config.clone())),
        registry: Arc::new(default_registry()?),
        router: Arc::new(ProfileRouter::new(
            IntentRegistry::new(paths::intents_path(&workspace_root)),
            ProfileRegistry::new(paths::prompt_profiles_path(&workspace_root)),
        )),
        assets: Arc::new(AssetLoader::new(paths::prompts_dir(&workspace_root))),
        bus,
    };

    let orchestrator = Orchestrator::new(
        services,
        SessionConfig {
            session_id: session_id.into(),
            project_id: None,
            core: config,
        },
    );

    Ok(Session {
        orchestrator,
        recorders,
    })
}
