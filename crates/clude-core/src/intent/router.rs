//! Intent → prompt-profile routing.
//!
//! The intent registry maps intent labels to profile names, optionally
//! scoped per project id. Like the profile registry it hot-reloads on mtime
//! change and degrades to defaults instead of crashing.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::SystemTime;

use parking_lot::Mutex;
use serde::Deserialize;

use crate::prompts::{ProfileRegistry, PromptProfile};

use super::classifier::Intent;

#[derive(Debug, Default, Deserialize)]
struct IntentsFile {
    #[serde(default)]
    default: HashMap<String, String>,
    #[serde(default)]
    projects: HashMap<String, HashMap<String, String>>,
}

/// `.clude/registry/intents.yaml`, hot-reloaded.
pub struct IntentRegistry {
    path: PathBuf,
    state: Mutex<IntentState>,
}

#[derive(Default)]
struct IntentState {
    loaded_at: Option<SystemTime>,
    file: IntentsFile,
}

impl IntentRegistry {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            state: Mutex::new(IntentState::default()),
        }
    }

    /// Resolve an intent to a profile name. Project-scoped entries win over
    /// the default table; a miss resolves to "default".
    pub fn resolve(&self, intent: Intent, project_id: Option<&str>) -> String {
        self.reload_if_changed();
        let state = self.state.lock();
        let label = intent.as_label();

        if let Some(project_id) = project_id {
            if let Some(scoped) = state.file.projects.get(project_id) {
                if let Some(profile) = scoped.get(label) {
                    return profile.clone();
                }
            }
        }
        state
            .file
            .default
            .get(label)
            .cloned()
            .unwrap_or_else(|| "default".to_string())
    }

    fn reload_if_changed(&self) {
        let mtime = std::fs::metadata(&self.path).and_then(|m| m.modified()).ok();
        let mut state = self.state.lock();

        match mtime {
            None => {
                state.file = IntentsFile::default();
                state.loaded_at = None;
            }
            Some(mtime) if state.loaded_at == Some(mtime) => {}
            Some(mtime) => {
                match std::fs::read_to_string(&self.path)
                    .map_err(|e| e.to_string())
                    .and_then(|raw| {
                        serde_yaml::from_str::<IntentsFile>(&raw).map_err(|e| e.to_string())
                    }) {
                    Ok(file) => {
                        state.file = file;
                        state.loaded_at = Some(mtime);
                    }
                    Err(e) => {
                        tracing::warn!(
                            path = %self.path.display(),
                            "malformed intents registry, using defaults: {}",
                            e
                        );
                        state.file = IntentsFile::default();
                        state.loaded_at = Some(mtime);
                    }
                }
            }
        }
    }
}

/// Router combining the two registries.
pub struct ProfileRouter {
    intents: IntentRegistry,
    profiles: ProfileRegistry,
}

/// What the orchestrator needs to start a turn.
pub struct RoutedProfile {
    pub profile: PromptProfile,
    pub planning_enabled: bool,
}

impl ProfileRouter {
    pub fn new(intents: IntentRegistry, profiles: ProfileRegistry) -> Self {
        Self { intents, profiles }
    }

    pub fn select(&self, intent: Intent, project_id: Option<&str>) -> RoutedProfile {
        let profile_name = self.intents.resolve(intent, project_id);
        let profile = self.profiles.get(&profile_name);
        RoutedProfile {
            profile,
            planning_enabled: intent.planning_enabled(),
        }
    }
}
