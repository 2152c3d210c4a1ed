use std::path::{Path, PathBuf};

/// Well-known file locations under one workspace root.
///
/// The CLI reads its configuration from a `.claude` directory; the
/// gateway's own layered config lives under `.runnel`.
#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    root: PathBuf,
}

impl WorkspacePaths {
    /// Precedence: explicit flag, then `RUNNEL_WORKSPACE`, then cwd.
    pub fn resolve(explicit: Option<&str>) -> Self {
        let root = explicit
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .or_else(|| {
                std::env::var("RUNNEL_WORKSPACE")
                    .ok()
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty())
            })
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
        Self::at(root)
    }

    pub fn at(root: impl Into<PathBuf>) -> Self {
        let root: PathBuf = root.into();
        let root = if root.exists() {
            root.canonicalize().unwrap_or(root)
        } else {
            root
        };
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn claude_dir(&self) -> PathBuf {
        self.root.join(".claude")
    }

    pub fn agents_dir(&self) -> PathBuf {
        self.claude_dir().join("agents")
    }

    pub fn sessions_file(&self) -> PathBuf {
        self.claude_dir().join("sessions.json")
    }

    pub fn project_config_file(&self) -> PathBuf {
        self.root.join(".runnel").join("config.json")
    }

    /// Absolute config paths are kept as-is, relative ones are anchored
    /// at the workspace root.
    pub fn resolve_config_path(&self, configured: &str) -> PathBuf {
        let path = PathBuf::from(configured);
        if path.is_absolute() {
            path
        } else {
            self.root.join(path)
        }
    }

    /// The settings file handed to the CLI. With an agent name the
    /// per-agent `settings_<name>.json` sibling of the configured
    /// settings file is used, whether or not it exists yet; the CLI
    /// itself reports a missing file.
    pub fn settings_path(&self, configured: &str, agent: Option<&str>) -> PathBuf {
        let default = self.resolve_config_path(configured);
        let Some(agent) = agent else {
            return default;
        };
        let dir = default
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.claude_dir());
        dir.join(format!("settings_{agent}.json"))
    }

    pub fn agent_settings_file(&self, configured: &str, agent: &str) -> PathBuf {
        self.settings_path(configured, Some(agent))
    }

    pub fn agent_prompt_file(&self, agent: &str) -> PathBuf {
        self.agents_dir().join(format!("{agent}.md"))
    }
}

pub fn resolve_global_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("RUNNEL_GLOBAL_CONFIG") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    if let Some(config_dir) = dirs::config_dir() {
        return config_dir.join("runnel").join("config.json");
    }
    PathBuf::from(".runnel/global_config.json")
}

pub fn resolve_logs_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("RUNNEL_LOGS_DIR") {
        let trimmed = dir.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    if let Some(data_dir) = dirs::data_dir() {
        return data_dir.join("runnel").join("logs");
    }
    PathBuf::from(".runnel/logs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_path_uses_default_without_agent() {
        let paths = WorkspacePaths::at("/ws");
        assert_eq!(
            paths.settings_path(".claude/settings.json", None),
            PathBuf::from("/ws/.claude/settings.json")
        );
    }

    #[test]
    fn settings_path_switches_to_agent_sibling() {
        let paths = WorkspacePaths::at("/ws");
        assert_eq!(
            paths.settings_path(".claude/settings.json", Some("news")),
            PathBuf::from("/ws/.claude/settings_news.json")
        );
    }

    #[test]
    fn absolute_configured_paths_are_kept() {
        let paths = WorkspacePaths::at("/ws");
        assert_eq!(
            paths.resolve_config_path("/etc/claude/settings.json"),
            PathBuf::from("/etc/claude/settings.json")
        );
        assert_eq!(
            paths.settings_path("/etc/claude/settings.json", Some("news")),
            PathBuf::from("/etc/claude/settings_news.json")
        );
    }
}
