//! Prompt profiles and their on-disk registry.
//!
//! A profile bundles the four system-prompt slots, the user template, and a
//! risk level. The registry file is hot-reloaded on mtime change; a missing
//! or malformed file falls back to the built-in default profile and never
//! crashes the turn.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::SystemTime;

use parking_lot::Mutex;
use serde::Deserialize;

use crate::tools::risk::RiskLevel;

use super::assets::{compose_system, render_template, AssetLoader};

/// Refs for the four system slots.
#[derive(Debug, Clone, Deserialize)]
pub struct SystemRefs {
    pub core: String,
    pub role: String,
    pub policy: String,
    pub context: String,
}

#[derive(Debug, Clone)]
pub struct PromptProfile {
    pub name: String,
    pub risk_level: RiskLevel,
    pub system_refs: SystemRefs,
    pub user_template_ref: String,
}

impl PromptProfile {
    /// The built-in fallback: embedded assets, medium risk.
    pub fn default_profile() -> Self {
        Self {
            name: "default".to_string(),
            risk_level: RiskLevel::Medium,
            system_refs: SystemRefs {
                core: "builtin:core".into(),
                role: "builtin:role".into(),
                policy: "builtin:policy".into(),
                context: "builtin:context".into(),
            },
            user_template_ref: "builtin:user".into(),
        }
    }

    /// Compose the system prompt: core + role + policy + context, variables
    /// substituted, front matter already stripped by the loader.
    pub fn compose_system_prompt(
        &self,
        loader: &AssetLoader,
        vars: &HashMap<String, String>,
    ) -> anyhow::Result<String> {
        let core = loader.load(&self.system_refs.core)?;
        let role = loader.load(&self.system_refs.role)?;
        let policy = loader.load(&self.system_refs.policy)?;
        let context = loader.load(&self.system_refs.context)?;
        let composed = compose_system(&core, &role, &policy, &context);
        Ok(render_template(&composed, vars))
    }

    /// Render the user template for this profile.
    pub fn render_user_prompt(
        &self,
        loader: &AssetLoader,
        vars: &HashMap<String, String>,
    ) -> anyhow::Result<String> {
        let template = loader.load(&self.user_template_ref)?;
        Ok(render_template(&template, vars))
    }
}

// ── On-disk registry ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    profiles: HashMap<String, ProfileEntry>,
}

#[derive(Debug, Deserialize)]
struct ProfileEntry {
    #[serde(default)]
    risk_level: RiskLevel,
    prompts: PromptsEntry,
}

#[derive(Debug, Deserialize)]
struct PromptsEntry {
    system: SystemRefs,
    user_prompt: String,
}

/// Registry with mtime-based hot reload.
pub struct ProfileRegistry {
    path: PathBuf,
    state: Mutex<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    loaded_at: Option<SystemTime>,
    profiles: HashMap<String, PromptProfile>,
}

impl ProfileRegistry {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Look up a profile by name. Unknown names and unreadable registries
    /// yield the built-in default.
    pub fn get(&self, name: &str) -> PromptProfile {
        self.reload_if_changed();
        self.state
            .lock()
            .profiles
            .get(name)
            .cloned()
            .unwrap_or_else(PromptProfile::default_profile)
    }

    pub fn profile_names(&self) -> Vec<String> {
        self.reload_if_changed();
        self.state.lock().profiles.keys().cloned().collect()
    }

    fn reload_if_changed(&self) {
        let mtime = std::fs::metadata(&self.path).and_then(|m| m.modified()).ok();
        let mut state = self.state.lock();

        match mtime {
            None => {
                // No registry file: built-in default only.
                state.profiles.clear();
                state.loaded_at = None;
            }
            Some(mtime) if state.loaded_at == Some(mtime) => {}
            Some(mtime) => {
                match std::fs::read_to_string(&self.path)
                    .map_err(|e| e.to_string())
                    .and_then(|raw| {
                        serde_yaml::from_str::<RegistryFile>(&raw).map_err(|e| e.to_string())
                    }) {
                    Ok(file) => {
                        state.profiles = file
                            .profiles
                            .into_iter()
                            .map(|(name, entry)| {
                                let profile = PromptProfile {
                                    name: name.clone(),
                                    risk_level: entry.risk_level,
                                    system_refs: entry.prompts.system,
                                    user_template_ref: entry.prompts.user_prompt,
                                };
                                (name, profile)
                            })
                            .collect();
                        state.loaded_at = Some(mtime);
                        tracing::info!(
                            profiles = state.profiles.len(),
                            path = %self.path.display(),
                            "prompt profile registry loaded"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(
                            path = %self.path.display(),
                            "malformed profile registry, using built-in default: {}",
                            e
                        );
                        state.profiles.clear();
                        // Remember the mtime so a broken file is not re-parsed
                        // on every call.
                        state.loaded_at = Some(mtime);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const REGISTRY_YAML: &str = r#"
profiles:
  coding:
    risk_level: MEDIUM
    prompts:
      system:
        core: builtin:core
        role: builtin:role
        policy: builtin:policy
        context: builtin:context
      user_prompt: builtin:user
  review:
    risk_level: HIGH
    prompts:
      system:
        core: builtin:core
        role: builtin:role
        policy: builtin:policy
        context: builtin:context
      user_prompt: builtin:user
"#;

    #[test]
    fn loads_profiles_from_yaml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("prompt_profiles.yaml");
        std::fs::write(&path, REGISTRY_YAML).unwrap();

        let registry = ProfileRegistry::new(path);
        let coding = registry.get("coding");
        assert_eq!(coding.risk_level, RiskLevel::Medium);
        let review = registry.get("review");
        assert_eq!(review.risk_level, RiskLevel::High);
    }

    #[test]
    fn unknown_profile_falls_back_to_default() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("prompt_profiles.yaml");
        std::fs::write(&path, REGISTRY_YAML).unwrap();

        let registry = ProfileRegistry::new(path);
        let profile = registry.get("nope");
        assert_eq!(profile.name, "default");
    }

    #[test]
    fn missing_registry_file_never_crashes() {
        let registry = ProfileRegistry::new(PathBuf::from("/nonexistent/registry.yaml"));
        let profile = registry.get("coding");
        assert_eq!(profile.name, "default");
    }

    #[test]
    fn malformed_registry_falls_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("prompt_profiles.yaml");
        std::fs::write(&path, "profiles: [not, a, map]").unwrap();

        let registry = ProfileRegistry::new(path);
        let profile = registry.get("coding");
        assert_eq!(profile.name, "default");
    }

    #[test]
    fn default_profile_composes_with_builtin_assets() {
        let loader = AssetLoader::new(PathBuf::from("/nonexistent"));
        let profile = PromptProfile::default_profile();
        let mut vars = HashMap::new();
        vars.insert("workspace_root".to_string(), "/ws".to_string());
        vars.insert("tools".to_string(), "- read_file".to_string());

        let prompt = profile.compose_system_prompt(&loader, &vars).unwrap();
        assert!(prompt.contains("Workspace root: /ws"));
        assert!(prompt.contains("- read_file"));
        assert!(prompt.contains("step_done"));
    }
}
