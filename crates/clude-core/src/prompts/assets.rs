//! Prompt asset loading.
//!
//! Assets live under `prompts/` as plain text or simple-substitution
//! templates (`{{ var }}`). Optional YAML front matter is stripped before
//! anything reaches the model. Versioned filenames (`name_vX.Y.Z.ext`) are
//! resolved through the `prompt_versions.json` sidecar, so rollback is a
//! pointer flip rather than a code change. Loads go through an mtime-keyed
//! LRU, which doubles as hot reload.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

/// Optional front matter carried by prompt assets.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FrontMatter {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub layer: Option<String>,
    #[serde(default)]
    pub tools_expected: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
}

/// Split front matter from the body. The body is what the model sees.
pub fn strip_front_matter(text: &str) -> (Option<FrontMatter>, String) {
    let Some(rest) = text.strip_prefix("---") else {
        return (None, text.to_string());
    };
    let Some(end) = rest.find("\n---") else {
        return (None, text.to_string());
    };
    let yaml = &rest[..end];
    let body_start = end + "\n---".len();
    let body = rest[body_start..].trim_start_matches('\n').to_string();

    match serde_yaml::from_str::<FrontMatter>(yaml) {
        Ok(front) => (Some(front), body),
        Err(e) => {
            tracing::warn!("malformed prompt front matter ignored: {}", e);
            (None, body)
        }
    }
}

static VAR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").expect("valid regex"));

/// Substitute `{{ var }}` placeholders. Unknown variables are left intact so
/// a typo is visible rather than silently blanked.
pub fn render_template(template: &str, vars: &HashMap<String, String>) -> String {
    VAR_RE
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            vars.get(name)
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Version pointers: `{ ref -> { current, previous } }`.
#[derive(Debug, Clone, Deserialize)]
struct VersionPointer {
    current: String,
    #[serde(default)]
    #[allow(dead_code)]
    previous: Option<String>,
}

/// Built-in fallback assets, used when a profile references `builtin:*` or
/// when the on-disk registry is missing.
pub const BUILTIN_CORE: &str = "\
You are a careful code-engineering agent working inside a user's workspace.\n\
You accomplish tasks by calling tools and reporting results.\n\
\n\
Output protocol:\n\
- To call a tool, reply with exactly one JSON object: {\"tool\": \"<name>\", \"args\": {...}}\n\
- To signal that the current step is finished: {\"control\": \"step_done\"}\n\
- To request replanning: {\"control\": \"replan\", \"reason\": \"<why>\"}\n\
- Anything else is treated as plain prose addressed to the user.\n\
Never mix prose with a JSON object in the same reply.";

pub const BUILTIN_ROLE: &str = "\
Role: software engineer. Prefer reading before writing, small steps over\n\
large ones, and verifying results with the available tools.";

pub const BUILTIN_POLICY: &str = "\
Policy: stay inside the workspace root. Destructive commands are denied.\n\
Side-effecting tools may require user confirmation; a denial is final for\n\
that call. Report blockers instead of working around policy.";

pub const BUILTIN_CONTEXT: &str = "\
Workspace root: {{ workspace_root }}\n\
\n\
Available tools:\n\
{{ tools }}";

pub const BUILTIN_USER: &str = "{{ instruction }}";

fn builtin_asset(name: &str) -> Option<&'static str> {
    match name {
        "core" => Some(BUILTIN_CORE),
        "role" => Some(BUILTIN_ROLE),
        "policy" => Some(BUILTIN_POLICY),
        "context" => Some(BUILTIN_CONTEXT),
        "user" => Some(BUILTIN_USER),
        _ => None,
    }
}

/// Loader with an mtime-keyed LRU. A changed file gets a new key, so stale
/// entries age out instead of being served.
pub struct AssetLoader {
    prompts_dir: PathBuf,
    cache: moka::sync::Cache<(PathBuf, SystemTime), Arc<String>>,
}

impl AssetLoader {
    pub fn new(prompts_dir: PathBuf) -> Self {
        Self {
            prompts_dir,
            cache: moka::sync::Cache::builder().max_capacity(128).build(),
        }
    }

    /// Load an asset body by ref. `builtin:<slot>` refs resolve to embedded
    /// defaults; everything else is a path under `prompts/`, indirected
    /// through the version sidecar when an entry exists.
    pub fn load(&self, asset_ref: &str) -> Result<String> {
        if let Some(name) = asset_ref.strip_prefix("builtin:") {
            return builtin_asset(name)
                .map(String::from)
                .with_context(|| format!("unknown builtin prompt asset '{}'", name));
        }

        let relative = self.resolve_version(asset_ref);
        let path = self.prompts_dir.join(&relative);
        let mtime = std::fs::metadata(&path)
            .and_then(|m| m.modified())
            .with_context(|| format!("prompt asset not readable: {}", path.display()))?;

        let key = (path.clone(), mtime);
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached.as_ref().clone());
        }

        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading prompt asset {}", path.display()))?;
        let (_, body) = strip_front_matter(&raw);
        self.cache.insert(key, Arc::new(body.clone()));
        Ok(body)
    }

    /// Follow the sidecar pointer when one names this ref.
    fn resolve_version(&self, asset_ref: &str) -> String {
        let sidecar = self.prompts_dir.join("prompt_versions.json");
        let Ok(raw) = std::fs::read_to_string(&sidecar) else {
            return asset_ref.to_string();
        };
        match serde_json::from_str::<HashMap<String, VersionPointer>>(&raw) {
            Ok(pointers) => pointers
                .get(asset_ref)
                .map(|p| p.current.clone())
                .unwrap_or_else(|| asset_ref.to_string()),
            Err(e) => {
                tracing::warn!("malformed prompt_versions.json ignored: {}", e);
                asset_ref.to_string()
            }
        }
    }
}

/// Compose the four system slots in order.
pub fn compose_system(core: &str, role: &str, policy: &str, context: &str) -> String {
    [core, role, policy, context]
        .iter()
        .filter(|s| !s.is_empty())
        .cloned()
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn front_matter_is_stripped() {
        let text = "---\ntitle: Core prompt\nversion: 1.2.0\nlayer: core\n---\nYou are an agent.";
        let (front, body) = strip_front_matter(text);
        let front = front.unwrap();
        assert_eq!(front.title.as_deref(), Some("Core prompt"));
        assert_eq!(front.version.as_deref(), Some("1.2.0"));
        assert_eq!(body, "You are an agent.");
    }

    #[test]
    fn text_without_front_matter_passes_through() {
        let (front, body) = strip_front_matter("plain prompt text");
        assert!(front.is_none());
        assert_eq!(body, "plain prompt text");
    }

    #[test]
    fn template_substitution() {
        let mut vars = HashMap::new();
        vars.insert("name".to_string(), "clude".to_string());
        assert_eq!(render_template("hello {{ name }}!", &vars), "hello clude!");
        assert_eq!(render_template("hello {{name}}!", &vars), "hello clude!");
        // Unknown variables stay visible.
        assert_eq!(render_template("{{ missing }}", &vars), "{{ missing }}");
    }

    #[test]
    fn loads_and_caches_by_mtime() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("core.md");
        std::fs::write(&path, "---\ntitle: t\n---\nfirst body").unwrap();

        let loader = AssetLoader::new(dir.path().to_path_buf());
        assert_eq!(loader.load("core.md").unwrap(), "first body");
    }

    #[test]
    fn version_sidecar_redirects() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("core_v1.0.0.md"), "old").unwrap();
        std::fs::write(dir.path().join("core_v1.1.0.md"), "new").unwrap();
        std::fs::write(
            dir.path().join("prompt_versions.json"),
            r#"{"core.md": {"current": "core_v1.1.0.md", "previous": "core_v1.0.0.md"}}"#,
        )
        .unwrap();

        let loader = AssetLoader::new(dir.path().to_path_buf());
        assert_eq!(loader.load("core.md").unwrap(), "new");
    }

    #[test]
    fn builtin_refs_resolve_without_files() {
        let loader = AssetLoader::new(PathBuf::from("/nonexistent"));
        assert!(loader.load("builtin:core").unwrap().contains("tool"));
        assert!(loader.load("builtin:bogus").is_err());
    }

    #[test]
    fn compose_joins_nonempty_slots() {
        assert_eq!(compose_system("a", "b", "", "d"), "a\n\nb\n\nd");
    }
}
