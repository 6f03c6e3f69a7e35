//! Built-in workspace tools.
//!
//! Enough surface to run real code-engineering turns: file reads/writes,
//! directory listing, content search, and command execution. Each module
//! exposes a `spec()` that the default registry assembles at startup.

pub mod grep;
pub mod list_dir;
pub mod read_file;
pub mod run_cmd;
pub mod write_file;

use super::registry::ToolRegistry;

/// The standard registry: every built-in tool, visible and callable.
pub fn default_registry() -> anyhow::Result<ToolRegistry> {
    ToolRegistry::new(vec![
        read_file::spec(),
        write_file::spec(),
        list_dir::spec(),
        grep::spec(),
        run_cmd::spec(),
    ])
}
