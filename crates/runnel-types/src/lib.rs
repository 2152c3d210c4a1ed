//! Wire types shared between the Runnel front-ends and the runner.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A request to execute one prompt against the wrapped CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub prompt: String,
    /// Explicit conversation to resume. Takes precedence over
    /// `auto_resume`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Agent whose settings file and recorded session are used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    /// Resume the agent's last recorded session when no explicit
    /// `session_id` was given.
    #[serde(default)]
    pub auto_resume: bool,
}

impl RunRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            session_id: None,
            agent_name: None,
            auto_resume: false,
        }
    }
}

/// The JSON envelope the CLI prints in `--output-format json` mode.
///
/// Only the fields the gateway acts on are named; everything else is
/// kept in `extra` so the envelope can be re-serialized losslessly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEnvelope {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ResultEnvelope {
    /// The text a caller should see: the `result` string when there is
    /// one, otherwise the whole envelope re-serialized.
    pub fn text(&self) -> String {
        match &self.result {
            Some(Value::String(s)) => s.clone(),
            _ => serde_json::to_string(self).unwrap_or_default(),
        }
    }
}

/// Outcome of a buffered run, as returned over HTTP and MCP.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// True when stdout was not a parseable envelope and `text` is the
    /// raw output.
    #[serde(default)]
    pub raw: bool,
}

/// An event published on the engine event bus and fanned out over SSE.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub properties: Value,
}

impl EngineEvent {
    pub fn new(event_type: impl Into<String>, properties: Value) -> Self {
        Self {
            event_type: event_type.into(),
            properties,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn run_request_defaults_optional_fields() {
        let req: RunRequest = serde_json::from_str(r#"{"prompt":"hi"}"#).expect("parse");
        assert_eq!(req.prompt, "hi");
        assert!(req.session_id.is_none());
        assert!(req.agent_name.is_none());
        assert!(!req.auto_resume);
    }

    #[test]
    fn run_request_accepts_camel_case_wire_names() {
        let req: RunRequest = serde_json::from_str(
            r#"{"prompt":"hi","sessionId":"s-1","agentName":"news","autoResume":true}"#,
        )
        .expect("parse");
        assert_eq!(req.session_id.as_deref(), Some("s-1"));
        assert_eq!(req.agent_name.as_deref(), Some("news"));
        assert!(req.auto_resume);
    }

    #[test]
    fn envelope_text_prefers_string_result() {
        let envelope: ResultEnvelope = serde_json::from_value(json!({
            "type": "result",
            "result": "done",
            "session_id": "abc",
        }))
        .expect("parse");
        assert_eq!(envelope.text(), "done");
        assert_eq!(envelope.session_id.as_deref(), Some("abc"));
    }

    #[test]
    fn envelope_text_falls_back_to_full_envelope() {
        let envelope: ResultEnvelope = serde_json::from_value(json!({
            "type": "result",
            "result": {"nested": true},
            "cost_usd": 0.01,
        }))
        .expect("parse");
        let text = envelope.text();
        assert!(text.contains("nested"));
        assert!(text.contains("cost_usd"));
    }

    #[test]
    fn envelope_rejects_non_object_output() {
        assert!(serde_json::from_str::<ResultEnvelope>("\"just a string\"").is_err());
        assert!(serde_json::from_str::<ResultEnvelope>("plain text").is_err());
    }
}
