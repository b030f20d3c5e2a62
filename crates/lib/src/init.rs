//! Initialize the configuration directory: create ~/.newbot, default config and workspace.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Seeded into `workspace/AGENTS.md` on first init.
pub const DEFAULT_AGENT_CTX: &str = "\
# Assistant

You are a voice and chat assistant reachable from several devices at once.
Each user message starts with a `Message channel id: <id>` line naming the device it came from.

- Answer in the language the user writes in. Keep replies short; they may be read aloud.
- Lines in `[audio transcript: ...]` blocks are speech recognized from the device microphone.
  `[label]: text` lines name the speaker when known.
- Use `search_memory` when the answer may depend on something the user told you before.
";

/// Create the config directory and default files if they do not exist.
/// - Writes `config.json` with `{}` if missing.
/// - Creates the `workspace` subdirectory and seeds `AGENTS.md` if missing.
pub fn init_config_dir(config_path: &Path) -> Result<PathBuf> {
    let config_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("creating config directory {}", config_dir.display()))?;

    if !config_path.exists() {
        std::fs::write(config_path, b"{}")
            .with_context(|| format!("writing default config to {}", config_path.display()))?;
        log::info!("created default config at {}", config_path.display());
    }

    let workspace = config_dir.join("workspace");
    if !workspace.exists() {
        std::fs::create_dir_all(&workspace)
            .with_context(|| format!("creating workspace directory {}", workspace.display()))?;
        log::info!("created workspace directory at {}", workspace.display());
    }
    let workspace_agents = workspace.join("AGENTS.md");
    if !workspace_agents.exists() {
        std::fs::write(&workspace_agents, DEFAULT_AGENT_CTX)
            .with_context(|| format!("writing default AGENTS.md to {}", workspace_agents.display()))?;
        log::info!("wrote default AGENTS.md to {}", workspace_agents.display());
    }

    Ok(config_dir.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_creates_layout_and_keeps_existing_files() {
        let dir = std::env::temp_dir().join(format!("newbot-init-{}", uuid::Uuid::new_v4()));
        let config_path = dir.join("config.json");
        let created = init_config_dir(&config_path).unwrap();
        assert_eq!(created, dir);
        assert_eq!(std::fs::read_to_string(&config_path).unwrap(), "{}");
        let agents = dir.join("workspace").join("AGENTS.md");
        assert_eq!(std::fs::read_to_string(&agents).unwrap(), DEFAULT_AGENT_CTX);

        std::fs::write(&config_path, r#"{"gateway":{"port":9000}}"#).unwrap();
        std::fs::write(&agents, "custom").unwrap();
        init_config_dir(&config_path).unwrap();
        assert_eq!(std::fs::read_to_string(&config_path).unwrap(), r#"{"gateway":{"port":9000}}"#);
        assert_eq!(std::fs::read_to_string(&agents).unwrap(), "custom");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
