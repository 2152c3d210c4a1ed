use std::path::PathBuf;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;

use crate::config::{deep_merge, write_json_file};
use crate::paths::WorkspacePaths;

pub const DEFAULT_AGENT_MODEL: &str = "claude-3-5-sonnet-20241022";

/// Store error for "the thing you named does not exist". Front-ends
/// downcast to this to pick 404 / error-flagged tool results without
/// matching on message text.
#[derive(Debug)]
pub struct NotFound(pub String);

impl std::fmt::Display for NotFound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for NotFound {}

/// One agent = a Markdown system prompt in `.claude/agents/<name>.md`
/// plus a `.claude/settings_<name>.json` handed to the CLI.
#[derive(Clone)]
pub struct AgentStore {
    paths: WorkspacePaths,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAgent {
    pub name: String,
    pub prompt: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Existing settings file to copy `env` and the enabled MCP server
    /// list from. The requested model still wins.
    #[serde(default)]
    pub copy_env_from: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedAgent {
    pub name: String,
    pub prompt_path: String,
    pub settings_path: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mcp_servers: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_bytes: Option<u64>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub settings_missing: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteReport {
    pub name: String,
    pub deleted: Vec<String>,
    pub errors: Vec<String>,
}

impl AgentStore {
    pub fn new(paths: WorkspacePaths) -> Self {
        Self { paths }
    }

    fn prompt_file(&self, name: &str) -> PathBuf {
        self.paths.agent_prompt_file(name)
    }

    fn settings_file(&self, name: &str) -> PathBuf {
        self.paths.claude_dir().join(format!("settings_{name}.json"))
    }

    pub async fn create(&self, req: CreateAgent) -> anyhow::Result<CreatedAgent> {
        let name = validate_agent_name(&req.name)?;
        fs::create_dir_all(self.paths.agents_dir()).await?;

        let prompt_path = self.prompt_file(&name);
        fs::write(&prompt_path, &req.prompt)
            .await
            .with_context(|| format!("failed to write {}", prompt_path.display()))?;

        let mut env = Map::new();
        let mut servers: Vec<String> = Vec::new();
        if let Some(source) = req.copy_env_from.as_deref() {
            match self.read_settings_at(&self.paths.resolve_config_path(source)).await {
                Some(value) => {
                    if let Some(source_env) = value.get("env").and_then(Value::as_object) {
                        env = source_env.clone();
                    }
                    if let Some(source_servers) = value
                        .get("enabledMcpjsonServers")
                        .and_then(Value::as_array)
                    {
                        servers = source_servers
                            .iter()
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect();
                    }
                }
                None => {
                    tracing::warn!(source, agent = %name, "could not copy env from settings file");
                }
            }
        }
        let model = req
            .model
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_AGENT_MODEL.to_string());
        env.insert("ANTHROPIC_MODEL".to_string(), Value::String(model));

        let settings = json!({
            "env": env,
            "enableAllProjectMcpServers": false,
            "enabledMcpjsonServers": servers,
            "agent": name,
        });
        let settings_path = self.settings_file(&name);
        write_json_file(&settings_path, &settings).await?;

        Ok(CreatedAgent {
            name,
            prompt_path: prompt_path.display().to_string(),
            settings_path: settings_path.display().to_string(),
        })
    }

    pub async fn list(&self, details: bool) -> anyhow::Result<Vec<AgentRecord>> {
        let dir = self.paths.agents_dir();
        fs::create_dir_all(&dir).await?;
        let mut entries = fs::read_dir(&dir)
            .await
            .with_context(|| format!("failed to read {}", dir.display()))?;

        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let name = name.to_string();

            if !details {
                out.push(AgentRecord {
                    name,
                    model: None,
                    mcp_servers: None,
                    prompt_bytes: None,
                    settings_missing: false,
                });
                continue;
            }

            let settings = self.read_settings_at(&self.settings_file(&name)).await;
            let (model, mcp_servers, settings_missing) = match settings {
                Some(value) => {
                    let model = value
                        .get("env")
                        .and_then(|env| env.get("ANTHROPIC_MODEL"))
                        .and_then(Value::as_str)
                        .unwrap_or("settings-default")
                        .to_string();
                    let servers = value
                        .get("enabledMcpjsonServers")
                        .and_then(Value::as_array)
                        .map(|list| {
                            list.iter()
                                .filter_map(|v| v.as_str().map(str::to_string))
                                .collect::<Vec<_>>()
                        })
                        .unwrap_or_default();
                    (Some(model), Some(servers), false)
                }
                None => (None, None, true),
            };
            let prompt_bytes = fs::metadata(&path).await.ok().map(|m| m.len());

            out.push(AgentRecord {
                name,
                model,
                mcp_servers,
                prompt_bytes,
                settings_missing,
            });
        }

        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// Removes both agent files. A file that was already gone is fine;
    /// an agent with neither file is an error.
    pub async fn delete(&self, name: &str) -> anyhow::Result<DeleteReport> {
        let name = validate_agent_name(name)?;
        let mut deleted = Vec::new();
        let mut errors = Vec::new();

        for path in [self.prompt_file(&name), self.settings_file(&name)] {
            match fs::remove_file(&path).await {
                Ok(()) => deleted.push(path.display().to_string()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => errors.push(format!("{}: {err}", path.display())),
            }
        }

        if deleted.is_empty() && errors.is_empty() {
            return Err(NotFound(format!(
                "agent '{name}' not found (no prompt, no settings)"
            ))
            .into());
        }

        Ok(DeleteReport {
            name,
            deleted,
            errors,
        })
    }

    /// Deep-merges a JSON patch into the agent's settings file and
    /// returns the new settings.
    pub async fn update_config(&self, name: &str, patch: Value) -> anyhow::Result<Value> {
        let name = validate_agent_name(name)?;
        let path = self.settings_file(&name);
        let Some(mut settings) = self.read_settings_at(&path).await else {
            return Err(NotFound(format!("agent '{name}' has no settings file")).into());
        };
        deep_merge(&mut settings, &patch);
        write_json_file(&path, &settings).await?;
        Ok(settings)
    }

    /// Create or overwrite the Markdown prompt alone. Returns whether
    /// a prompt already existed.
    pub async fn write_prompt(&self, name: &str, content: &str) -> anyhow::Result<bool> {
        let name = validate_agent_name(name)?;
        fs::create_dir_all(self.paths.agents_dir()).await?;
        let path = self.prompt_file(&name);
        let existed = fs::metadata(&path).await.is_ok();
        fs::write(&path, content)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(existed)
    }

    /// Exact substring search and single replacement in the prompt.
    pub async fn edit_prompt(&self, name: &str, search: &str, replace: &str) -> anyhow::Result<()> {
        let name = validate_agent_name(name)?;
        let path = self.prompt_file(&name);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(NotFound(format!("prompt '{name}' not found")).into());
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()));
            }
        };
        if !content.contains(search) {
            return Err(NotFound(format!("search text not found in '{name}.md'")).into());
        }
        let updated = content.replacen(search, replace, 1);
        fs::write(&path, updated)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    pub async fn read_prompt(&self, name: &str) -> anyhow::Result<String> {
        let name = validate_agent_name(name)?;
        let path = self.prompt_file(&name);
        match fs::read_to_string(&path).await {
            Ok(content) => Ok(content),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(NotFound(format!("prompt '{name}' not found")).into())
            }
            Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    async fn read_settings_at(&self, path: &PathBuf) -> Option<Value> {
        let raw = fs::read_to_string(path).await.ok()?;
        serde_json::from_str::<Value>(&raw).ok()
    }
}

/// Agent names become file names; keep them to a safe charset.
pub fn validate_agent_name(raw: &str) -> anyhow::Result<String> {
    let name = raw.trim();
    if name.is_empty() {
        bail!("agent name must not be empty");
    }
    if name.starts_with('.') {
        bail!("agent name must not start with a dot");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        bail!("agent name may only contain letters, digits, '-' and '_'");
    }
    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> AgentStore {
        AgentStore::new(WorkspacePaths::at(dir.path()))
    }

    fn create_req(name: &str) -> CreateAgent {
        CreateAgent {
            name: name.to_string(),
            prompt: "You are a test agent.".to_string(),
            model: None,
            copy_env_from: None,
        }
    }

    #[tokio::test]
    async fn create_writes_prompt_and_settings() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        let created = store.create(create_req("news")).await.expect("create");
        assert_eq!(created.name, "news");

        let prompt = tokio::fs::read_to_string(&created.prompt_path)
            .await
            .expect("prompt");
        assert_eq!(prompt, "You are a test agent.");

        let settings: Value = serde_json::from_str(
            &tokio::fs::read_to_string(&created.settings_path)
                .await
                .expect("settings"),
        )
        .expect("json");
        assert_eq!(settings["env"]["ANTHROPIC_MODEL"], DEFAULT_AGENT_MODEL);
        assert_eq!(settings["agent"], "news");
        assert_eq!(settings["enableAllProjectMcpServers"], false);
    }

    #[tokio::test]
    async fn create_copies_env_from_existing_settings() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        let source = dir.path().join(".claude").join("settings_base.json");
        tokio::fs::create_dir_all(source.parent().expect("parent"))
            .await
            .expect("mkdir");
        tokio::fs::write(
            &source,
            r#"{"env":{"API_KEY":"k","ANTHROPIC_MODEL":"old"},"enabledMcpjsonServers":["news"]}"#,
        )
        .await
        .expect("write source");

        let created = store
            .create(CreateAgent {
                name: "finance".to_string(),
                prompt: "p".to_string(),
                model: Some("claude-x".to_string()),
                copy_env_from: Some(".claude/settings_base.json".to_string()),
            })
            .await
            .expect("create");

        let settings: Value = serde_json::from_str(
            &tokio::fs::read_to_string(&created.settings_path)
                .await
                .expect("settings"),
        )
        .expect("json");
        assert_eq!(settings["env"]["API_KEY"], "k");
        // requested model wins over the copied one
        assert_eq!(settings["env"]["ANTHROPIC_MODEL"], "claude-x");
        assert_eq!(settings["enabledMcpjsonServers"][0], "news");
    }

    #[tokio::test]
    async fn list_without_details_returns_sorted_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        store.create(create_req("zeta")).await.expect("create");
        store.create(create_req("alpha")).await.expect("create");

        let agents = store.list(false).await.expect("list");
        let names: Vec<&str> = agents.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        assert!(agents[0].model.is_none());
    }

    #[tokio::test]
    async fn list_with_details_reports_model_and_missing_settings() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        store.create(create_req("news")).await.expect("create");
        // orphan prompt without settings
        store.write_prompt("orphan", "p").await.expect("prompt");

        let agents = store.list(true).await.expect("list");
        let news = agents.iter().find(|a| a.name == "news").expect("news");
        assert_eq!(news.model.as_deref(), Some(DEFAULT_AGENT_MODEL));
        assert!(!news.settings_missing);
        assert!(news.prompt_bytes.is_some());

        let orphan = agents.iter().find(|a| a.name == "orphan").expect("orphan");
        assert!(orphan.settings_missing);
    }

    #[tokio::test]
    async fn delete_removes_both_files_and_rejects_unknown() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        store.create(create_req("news")).await.expect("create");

        let report = store.delete("news").await.expect("delete");
        assert_eq!(report.deleted.len(), 2);
        assert!(report.errors.is_empty());

        assert!(store.delete("news").await.is_err());
    }

    #[tokio::test]
    async fn update_config_merges_patch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        store.create(create_req("news")).await.expect("create");

        let updated = store
            .update_config(
                "news",
                json!({"env": {"ANTHROPIC_MODEL": "claude-y"}, "enabledMcpjsonServers": ["a"]}),
            )
            .await
            .expect("update");
        assert_eq!(updated["env"]["ANTHROPIC_MODEL"], "claude-y");
        assert_eq!(updated["agent"], "news");

        assert!(store.update_config("ghost", json!({})).await.is_err());
    }

    #[tokio::test]
    async fn edit_prompt_replaces_exact_match_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        store
            .write_prompt("news", "alpha beta alpha")
            .await
            .expect("prompt");

        store
            .edit_prompt("news", "alpha", "gamma")
            .await
            .expect("edit");
        assert_eq!(store.read_prompt("news").await.expect("read"), "gamma beta alpha");

        let err = store
            .edit_prompt("news", "missing text", "x")
            .await
            .expect_err("should fail");
        assert!(err.to_string().contains("search text not found"));

        let err = store
            .edit_prompt("ghost", "a", "b")
            .await
            .expect_err("should fail");
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn missing_agents_and_prompts_downcast_to_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        store.write_prompt("news", "alpha beta").await.expect("prompt");

        let err = store.delete("ghost").await.expect_err("should fail");
        assert!(err.downcast_ref::<NotFound>().is_some());

        let err = store
            .update_config("ghost", json!({}))
            .await
            .expect_err("should fail");
        assert!(err.downcast_ref::<NotFound>().is_some());

        let err = store
            .edit_prompt("news", "gamma", "delta")
            .await
            .expect_err("should fail");
        assert!(err.downcast_ref::<NotFound>().is_some());

        // validation failures are caller errors, not NotFound
        let err = store.delete("has space").await.expect_err("should fail");
        assert!(err.downcast_ref::<NotFound>().is_none());
    }

    #[test]
    fn agent_names_are_validated() {
        assert!(validate_agent_name("agent_finance").is_ok());
        assert!(validate_agent_name("  padded  ").is_ok());
        assert!(validate_agent_name("").is_err());
        assert!(validate_agent_name("../escape").is_err());
        assert!(validate_agent_name(".hidden").is_err());
        assert!(validate_agent_name("has space").is_err());
    }
}
