//! Centralized path utilities
//!
//! All well-known project paths in one place for consistency.

use std::path::{Path, PathBuf};

/// Name of the per-project dot directory.
pub const PROJECT_DIR_NAME: &str = ".clude";

/// Get the project config directory (`<workspace>/.clude`).
pub fn project_dir(workspace_root: &Path) -> PathBuf {
    workspace_root.join(PROJECT_DIR_NAME)
}

/// Get the registry directory (`<workspace>/.clude/registry`).
pub fn registry_dir(workspace_root: &Path) -> PathBuf {
    project_dir(workspace_root).join("registry")
}

/// Prompt profile registry file.
pub fn prompt_profiles_path(workspace_root: &Path) -> PathBuf {
    registry_dir(workspace_root).join("prompt_profiles.yaml")
}

/// Intent registry file.
pub fn intents_path(workspace_root: &Path) -> PathBuf {
    registry_dir(workspace_root).join("intents.yaml")
}

/// Prompt asset tree (`<workspace>/prompts`).
pub fn prompts_dir(workspace_root: &Path) -> PathBuf {
    workspace_root.join("prompts")
}

/// Version-pointer sidecar for prompt assets.
pub fn prompt_versions_path(workspace_root: &Path) -> PathBuf {
    prompts_dir(workspace_root).join("prompt_versions.json")
}

/// Get the logs directory (`<workspace>/.clude/logs`).
pub fn logs_dir(workspace_root: &Path) -> PathBuf {
    project_dir(workspace_root).join("logs")
}

/// Append-only audit log (digests only).
pub fn audit_log_path(workspace_root: &Path) -> PathBuf {
    logs_dir(workspace_root).join("audit.jsonl")
}

/// Append-only trace log (full per-turn replay data).
pub fn trace_log_path(workspace_root: &Path) -> PathBuf {
    logs_dir(workspace_root).join("trace.jsonl")
}

/// Ensure the logs directory exists, creating it if necessary.
pub fn ensure_logs_dir(workspace_root: &Path) -> std::io::Result<PathBuf> {
    let dir = logs_dir(workspace_root);
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
