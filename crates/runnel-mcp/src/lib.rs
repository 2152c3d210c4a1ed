//! MCP server for the Runnel gateway.
//!
//! Exposes the runner and the agent store as tools over stdio so an
//! MCP-capable client can drive prompt runs and agent CRUD.

use std::sync::Arc;

use rmcp::{
    model::*,
    schemars::{self, JsonSchema},
    service::{RequestContext, RoleServer},
    ErrorData as McpError, ServerHandler,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use runnel_core::{AgentStore, CreateAgent, SessionStore};
use runnel_runner::Runner;
use runnel_types::RunRequest;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunAgentParams {
    /// The prompt to send to the assistant.
    pub prompt: String,
    /// Explicit session id to resume. Takes precedence over
    /// `auto_resume`.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Agent whose settings file and recorded session are used.
    #[serde(default)]
    pub agent_name: Option<String>,
    /// Resume the agent's last recorded session when no explicit
    /// session id was given.
    #[serde(default)]
    pub auto_resume: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CreateAgentParams {
    /// Agent name; becomes the prompt and settings file names.
    pub name: String,
    /// Markdown system prompt for the agent.
    pub prompt: String,
    /// Model id written into the agent's settings.
    #[serde(default)]
    pub model: Option<String>,
    /// Existing settings file to copy env and MCP server list from.
    #[serde(default)]
    pub copy_env_from: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ListAgentsParams {
    /// Include model, server list and prompt size per agent.
    #[serde(default)]
    pub details: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DeleteAgentParams {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct UpdateAgentConfigParams {
    pub name: String,
    /// New model id for the agent.
    #[serde(default)]
    pub model: Option<String>,
    /// Replacement list of enabled MCP servers.
    #[serde(default)]
    pub mcp_servers: Option<Vec<String>>,
    /// Environment variables merged into the settings `env` block.
    #[serde(default)]
    pub env: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CreatePromptParams {
    pub name: String,
    /// Markdown prompt content.
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EditPromptParams {
    pub name: String,
    /// Exact text to find in the prompt.
    pub search: String,
    /// Replacement for the first occurrence.
    pub replace: String,
}

/// The gateway as an MCP tool server.
#[derive(Clone)]
pub struct GatewayServer {
    runner: Runner,
    agents: AgentStore,
    sessions: SessionStore,
}

impl std::fmt::Debug for GatewayServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayServer").finish_non_exhaustive()
    }
}

impl GatewayServer {
    pub fn new(runner: Runner, agents: AgentStore, sessions: SessionStore) -> Self {
        Self {
            runner,
            agents,
            sessions,
        }
    }

    pub async fn run_agent(&self, params: RunAgentParams) -> Result<CallToolResult, McpError> {
        let mut req = RunRequest::new(params.prompt);
        req.session_id = params.session_id;
        req.agent_name = params.agent_name;
        req.auto_resume = params.auto_resume.unwrap_or(false);

        match self.runner.run(req).await {
            Ok(outcome) => {
                let mut contents = vec![Content::text(outcome.text)];
                if let Some(session_id) = outcome.session_id {
                    contents.push(Content::text(format!("SESSION_ID: {session_id}")));
                }
                Ok(CallToolResult::success(contents))
            }
            // run failures are returned to the model rather than
            // raised as protocol errors so it can retry or rephrase
            Err(err) => Ok(CallToolResult::error(vec![Content::text(
                err.to_string(),
            )])),
        }
    }

    pub async fn create_agent(
        &self,
        params: CreateAgentParams,
    ) -> Result<CallToolResult, McpError> {
        let created = self
            .agents
            .create(CreateAgent {
                name: params.name,
                prompt: params.prompt,
                model: params.model,
                copy_env_from: params.copy_env_from,
            })
            .await
            .map_err(store_error)?;
        Ok(CallToolResult::success(vec![Content::text(format!(
            "Created agent '{}' (prompt: {}, settings: {})",
            created.name, created.prompt_path, created.settings_path
        ))]))
    }

    pub async fn list_agents(&self, params: ListAgentsParams) -> Result<CallToolResult, McpError> {
        let agents = self
            .agents
            .list(params.details.unwrap_or(false))
            .await
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        if agents.is_empty() {
            return Ok(CallToolResult::success(vec![Content::text(
                "No agents defined.",
            )]));
        }
        let listing = serde_json::to_string_pretty(&agents)
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        Ok(CallToolResult::success(vec![Content::text(listing)]))
    }

    pub async fn delete_agent(
        &self,
        params: DeleteAgentParams,
    ) -> Result<CallToolResult, McpError> {
        match self.agents.delete(&params.name).await {
            Ok(report) => {
                if let Err(err) = self.sessions.forget(&report.name).await {
                    tracing::warn!(agent = %report.name, error = %err, "failed to drop recorded session");
                }
                let mut text = format!(
                    "Deleted agent '{}' ({} file(s) removed)",
                    report.name,
                    report.deleted.len()
                );
                if !report.errors.is_empty() {
                    text.push_str(&format!("; errors: {}", report.errors.join(", ")));
                }
                Ok(CallToolResult::success(vec![Content::text(text)]))
            }
            Err(err) => not_found_as_tool_error(err),
        }
    }

    pub async fn update_agent_config(
        &self,
        params: UpdateAgentConfigParams,
    ) -> Result<CallToolResult, McpError> {
        let mut env = params.env.unwrap_or_default();
        if let Some(model) = params.model.filter(|m| !m.trim().is_empty()) {
            env.insert("ANTHROPIC_MODEL".to_string(), Value::String(model));
        }
        let mut patch = Map::new();
        if !env.is_empty() {
            patch.insert("env".to_string(), Value::Object(env));
        }
        if let Some(servers) = params.mcp_servers {
            patch.insert("enabledMcpjsonServers".to_string(), json!(servers));
        }
        if patch.is_empty() {
            return Err(McpError::invalid_params(
                "nothing to update: pass model, mcp_servers or env",
                None,
            ));
        }

        match self
            .agents
            .update_config(&params.name, Value::Object(patch))
            .await
        {
            Ok(settings) => {
                let pretty = serde_json::to_string_pretty(&settings)
                    .map_err(|e| McpError::internal_error(e.to_string(), None))?;
                Ok(CallToolResult::success(vec![Content::text(format!(
                    "Updated settings for '{}':\n{pretty}",
                    params.name
                ))]))
            }
            Err(err) => not_found_as_tool_error(err),
        }
    }

    pub async fn create_prompt(
        &self,
        params: CreatePromptParams,
    ) -> Result<CallToolResult, McpError> {
        let existed = self
            .agents
            .write_prompt(&params.name, &params.content)
            .await
            .map_err(store_error)?;
        let verb = if existed { "Overwrote" } else { "Created" };
        Ok(CallToolResult::success(vec![Content::text(format!(
            "{verb} prompt '{}.md'",
            params.name
        ))]))
    }

    pub async fn edit_prompt(&self, params: EditPromptParams) -> Result<CallToolResult, McpError> {
        match self
            .agents
            .edit_prompt(&params.name, &params.search, &params.replace)
            .await
        {
            Ok(()) => Ok(CallToolResult::success(vec![Content::text(format!(
                "Edited prompt '{}.md'",
                params.name
            ))])),
            Err(err) => not_found_as_tool_error(err),
        }
    }

    fn tools(&self) -> Vec<Tool> {
        vec![
            tool::<RunAgentParams>(
                "run_agent",
                "Run Agent",
                "Run a prompt through the assistant CLI, optionally as a named agent \
                 and optionally resuming an earlier conversation. Returns the assistant's \
                 answer and, when available, the session id for later resumption.",
            ),
            tool::<CreateAgentParams>(
                "create_agent",
                "Create Agent",
                "Create a named agent: a Markdown system prompt plus a per-agent \
                 settings file. Optionally copy environment and MCP server list from \
                 an existing settings file.",
            ),
            tool::<ListAgentsParams>(
                "list_agents",
                "List Agents",
                "List defined agents. With details, include each agent's model, \
                 enabled MCP servers and prompt size.",
            ),
            tool::<DeleteAgentParams>(
                "delete_agent",
                "Delete Agent",
                "Delete an agent's prompt and settings files and forget its recorded \
                 session.",
            ),
            tool::<UpdateAgentConfigParams>(
                "update_agent_config",
                "Update Agent Config",
                "Patch an agent's settings file: model, enabled MCP servers, or \
                 environment variables.",
            ),
            tool::<CreatePromptParams>(
                "create_prompt",
                "Create Prompt",
                "Create or overwrite an agent's Markdown prompt file without touching \
                 its settings.",
            ),
            tool::<EditPromptParams>(
                "edit_prompt",
                "Edit Prompt",
                "Replace the first exact occurrence of a text in an agent's prompt \
                 file.",
            ),
        ]
    }
}

fn tool<P: JsonSchema>(name: &'static str, title: &str, description: &str) -> Tool {
    let schema = schemars::schema_for!(P);
    let schema_json = serde_json::to_value(schema).unwrap_or_default();
    let input_schema = match schema_json {
        Value::Object(map) => Arc::new(map),
        _ => Arc::new(Map::new()),
    };
    Tool {
        name: name.into(),
        title: Some(title.into()),
        description: Some(description.to_string().into()),
        input_schema,
        output_schema: None,
        annotations: None,
        icons: None,
        meta: None,
    }
}

fn parse_params<P: DeserializeOwned>(arguments: &Option<JsonObject>) -> Result<P, McpError> {
    let args = arguments.clone().unwrap_or_default();
    serde_json::from_value(Value::Object(args))
        .map_err(|e| McpError::invalid_params(format!("Invalid parameters: {e}"), None))
}

fn store_error(err: anyhow::Error) -> McpError {
    McpError::invalid_params(err.to_string(), None)
}

/// "not found" is a state the model can react to, so it comes back as
/// an error-flagged tool result instead of a protocol error.
fn not_found_as_tool_error(err: anyhow::Error) -> Result<CallToolResult, McpError> {
    if err.downcast_ref::<runnel_core::NotFound>().is_some() {
        Ok(CallToolResult::error(vec![Content::text(err.to_string())]))
    } else {
        Err(McpError::invalid_params(err.to_string(), None))
    }
}

impl ServerHandler for GatewayServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Runnel wraps a local AI assistant CLI. Use 'run_agent' to send a prompt \
                 (optionally as a named agent, optionally resuming a recorded session), and \
                 the agent tools to create, list, delete and reconfigure agents and their \
                 Markdown prompts."
                    .into(),
            ),
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        Ok(ListToolsResult {
            tools: self.tools(),
            next_cursor: None,
            meta: None,
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        match request.name.as_ref() {
            "run_agent" => self.run_agent(parse_params(&request.arguments)?).await,
            "create_agent" => self.create_agent(parse_params(&request.arguments)?).await,
            "list_agents" => self.list_agents(parse_params(&request.arguments)?).await,
            "delete_agent" => self.delete_agent(parse_params(&request.arguments)?).await,
            "update_agent_config" => {
                self.update_agent_config(parse_params(&request.arguments)?)
                    .await
            }
            "create_prompt" => self.create_prompt(parse_params(&request.arguments)?).await,
            "edit_prompt" => self.edit_prompt(parse_params(&request.arguments)?).await,
            _ => Err(McpError::invalid_params(
                format!("Unknown tool: {}", request.name),
                None,
            )),
        }
    }
}

/// Runs the server over stdio until the client disconnects.
pub async fn serve_stdio(server: GatewayServer) -> anyhow::Result<()> {
    use rmcp::ServiceExt;

    let service = server
        .serve(rmcp::transport::stdio())
        .await
        .inspect_err(|e| {
            tracing::error!("failed to start MCP service: {e}");
        })?;
    service.waiting().await?;
    Ok(())
}
