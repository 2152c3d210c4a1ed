use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

/// How the wrapped CLI is invoked.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub bin: String,
    pub core_args: Vec<String>,
    pub permission_args: Vec<String>,
    pub settings_path: String,
    pub mcp_config_path: String,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            bin: "claude".to_string(),
            core_args: vec![
                "-p".to_string(),
                "--output-format".to_string(),
                "json".to_string(),
            ],
            permission_args: vec!["--dangerously-skip-permissions".to_string()],
            settings_path: ".claude/settings.json".to_string(),
            mcp_config_path: ".mcp.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub cli: CliConfig,
    pub timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            cli: CliConfig::default(),
            // 5 minutes, matching the CLI's long-running tool calls.
            timeout_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    global: Value,
    project: Value,
    env: Value,
    cli: Value,
}

/// Layered JSON configuration: global < project < env < cli.
#[derive(Clone)]
pub struct ConfigStore {
    project_path: PathBuf,
    global_path: PathBuf,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn new(
        project_path: impl AsRef<Path>,
        cli_overrides: Option<Value>,
    ) -> anyhow::Result<Self> {
        let project_path = project_path.as_ref().to_path_buf();
        let global_path = crate::paths::resolve_global_config_path();

        let global = read_json_file(&global_path).await;
        let project = read_json_file(&project_path).await;

        let layers = ConfigLayers {
            global,
            project,
            env: env_layer(),
            cli: cli_overrides.unwrap_or_else(empty_object),
        };

        Ok(Self {
            project_path,
            global_path,
            layers: Arc::new(RwLock::new(layers)),
        })
    }

    /// In-memory store for tests and one-shot runs; nothing is read
    /// from or written to disk.
    pub fn ephemeral(cli_overrides: Option<Value>) -> Self {
        let layers = ConfigLayers {
            global: empty_object(),
            project: empty_object(),
            env: empty_object(),
            cli: cli_overrides.unwrap_or_else(empty_object),
        };
        Self {
            project_path: PathBuf::from(".runnel/config.json"),
            global_path: PathBuf::from(".runnel/global_config.json"),
            layers: Arc::new(RwLock::new(layers)),
        }
    }

    pub async fn get(&self) -> GatewayConfig {
        let merged = self.get_effective_value().await;
        serde_json::from_value(merged).unwrap_or_default()
    }

    pub async fn get_effective_value(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged = serde_json::to_value(GatewayConfig::default()).unwrap_or_default();
        deep_merge(&mut merged, &layers.global);
        deep_merge(&mut merged, &layers.project);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.cli);
        merged
    }

    pub async fn get_project_value(&self) -> Value {
        self.layers.read().await.project.clone()
    }

    pub async fn patch_project(&self, patch: Value) -> anyhow::Result<Value> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.project, &patch);
        }
        self.save_project().await?;
        Ok(self.get_effective_value().await)
    }

    pub async fn patch_global(&self, patch: Value) -> anyhow::Result<Value> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.global, &patch);
        }
        self.save_global().await?;
        Ok(self.get_effective_value().await)
    }

    async fn save_project(&self) -> anyhow::Result<()> {
        let snapshot = self.layers.read().await.project.clone();
        write_json_file(&self.project_path, &snapshot).await
    }

    async fn save_global(&self) -> anyhow::Result<()> {
        let snapshot = self.layers.read().await.global.clone();
        write_json_file(&self.global_path, &snapshot).await
    }
}

pub fn deep_merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                deep_merge(target.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn env_layer() -> Value {
    let mut root = empty_object();
    if let Ok(bin) = std::env::var("RUNNEL_CLI_BIN") {
        if !bin.trim().is_empty() {
            deep_merge(&mut root, &json!({ "cli": { "bin": bin.trim() } }));
        }
    }
    if let Ok(settings) = std::env::var("RUNNEL_SETTINGS") {
        if !settings.trim().is_empty() {
            deep_merge(&mut root, &json!({ "cli": { "settings_path": settings.trim() } }));
        }
    }
    if let Ok(mcp) = std::env::var("RUNNEL_MCP_CONFIG") {
        if !mcp.trim().is_empty() {
            deep_merge(&mut root, &json!({ "cli": { "mcp_config_path": mcp.trim() } }));
        }
    }
    if let Ok(timeout) = std::env::var("RUNNEL_TIMEOUT_MS") {
        if let Ok(ms) = timeout.trim().parse::<u64>() {
            deep_merge(&mut root, &json!({ "timeout_ms": ms }));
        }
    }
    root
}

async fn read_json_file(path: &Path) -> Value {
    let Ok(raw) = fs::read_to_string(path).await else {
        return empty_object();
    };
    serde_json::from_str::<Value>(&raw).unwrap_or_else(|_| empty_object())
}

pub(crate) async fn write_json_file(path: &Path, value: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let raw = serde_json::to_string_pretty(value)?;
    fs::write(path, raw).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_cli_template() {
        let config = GatewayConfig::default();
        assert_eq!(config.cli.bin, "claude");
        assert_eq!(config.cli.core_args, vec!["-p", "--output-format", "json"]);
        assert_eq!(
            config.cli.permission_args,
            vec!["--dangerously-skip-permissions"]
        );
        assert_eq!(config.cli.settings_path, ".claude/settings.json");
        assert_eq!(config.cli.mcp_config_path, ".mcp.json");
        assert_eq!(config.timeout_ms, 300_000);
    }

    #[test]
    fn deep_merge_replaces_scalars_and_merges_objects() {
        let mut target = json!({"cli": {"bin": "claude", "settings_path": "a.json"}, "timeout_ms": 1});
        deep_merge(
            &mut target,
            &json!({"cli": {"bin": "claude-next"}, "timeout_ms": 2}),
        );
        assert_eq!(target["cli"]["bin"], "claude-next");
        assert_eq!(target["cli"]["settings_path"], "a.json");
        assert_eq!(target["timeout_ms"], 2);
    }

    #[tokio::test]
    async fn cli_layer_wins_over_project_layer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let project = dir.path().join("config.json");
        tokio::fs::write(&project, r#"{"cli": {"bin": "from-project"}, "timeout_ms": 10}"#)
            .await
            .expect("write project config");
        let store = ConfigStore::new(&project, Some(json!({"cli": {"bin": "from-flag"}})))
            .await
            .expect("store");
        let config = store.get().await;
        assert_eq!(config.cli.bin, "from-flag");
        assert_eq!(config.timeout_ms, 10);
    }

    #[tokio::test]
    async fn patch_project_persists_and_remerges() {
        let dir = tempfile::tempdir().expect("tempdir");
        let project = dir.path().join("config.json");
        let store = ConfigStore::new(&project, None).await.expect("store");
        store
            .patch_project(json!({"timeout_ms": 1234}))
            .await
            .expect("patch");
        assert_eq!(store.get().await.timeout_ms, 1234);
        let raw = tokio::fs::read_to_string(&project).await.expect("read");
        assert!(raw.contains("1234"));
    }
}
