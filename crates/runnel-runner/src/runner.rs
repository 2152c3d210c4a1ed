use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use runnel_core::{ConfigStore, EventBus, GatewayConfig, SessionStore, WorkspacePaths};
use runnel_observability::redact_text;
use runnel_types::{EngineEvent, ResultEnvelope, RunOutcome, RunRequest};
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

use crate::command::CliInvocation;

/// One unit of streamed output. The channel closing marks the end of
/// the run.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    Stdout(String),
    Error(String),
}

/// Spawns the assistant CLI, feeds it the prompt over stdin, and
/// turns its output into a [`RunOutcome`] or a chunk stream.
#[derive(Clone)]
pub struct Runner {
    config: ConfigStore,
    paths: WorkspacePaths,
    sessions: SessionStore,
    events: EventBus,
}

impl Runner {
    pub fn new(
        config: ConfigStore,
        paths: WorkspacePaths,
        sessions: SessionStore,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            paths,
            sessions,
            events,
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Buffered run: wait for exit, parse the JSON envelope, persist
    /// the returned session id against the agent name.
    pub async fn run(&self, req: RunRequest) -> anyhow::Result<RunOutcome> {
        if req.prompt.trim().is_empty() {
            bail!("prompt must not be empty");
        }
        let config = self.config.get().await;
        let session = self.resolve_session(&req).await;
        let invocation = CliInvocation::buffered(
            &config,
            &self.paths,
            req.agent_name.as_deref(),
            session.as_deref(),
        );

        let run_id = Uuid::new_v4().to_string();
        self.events.publish(EngineEvent::new(
            "run.started",
            json!({
                "runID": run_id,
                "agent": req.agent_name,
                "resumed": session,
                "mode": "buffered",
            }),
        ));
        let started = Instant::now();

        let result = self.execute_buffered(&config, &invocation, &req).await;
        match &result {
            Ok(outcome) => {
                self.events.publish(EngineEvent::new(
                    "run.finished",
                    json!({
                        "runID": run_id,
                        "agent": req.agent_name,
                        "sessionID": outcome.session_id,
                        "raw": outcome.raw,
                        "mode": "buffered",
                        "durationMs": started.elapsed().as_millis() as u64,
                    }),
                ));
            }
            Err(err) => {
                self.events.publish(EngineEvent::new(
                    "run.failed",
                    json!({
                        "runID": run_id,
                        "agent": req.agent_name,
                        "mode": "buffered",
                        "error": err.to_string(),
                        "durationMs": started.elapsed().as_millis() as u64,
                    }),
                ));
            }
        }
        result
    }

    async fn execute_buffered(
        &self,
        config: &GatewayConfig,
        invocation: &CliInvocation,
        req: &RunRequest,
    ) -> anyhow::Result<RunOutcome> {
        let mut child = invocation
            .command(&self.paths)
            .spawn()
            .with_context(|| format!("failed to spawn '{}'", invocation.program))?;
        let mut stdin = child.stdin.take().context("child stdin unavailable")?;
        let stdout = child.stdout.take().context("child stdout unavailable")?;
        let stderr = child.stderr.take().context("child stderr unavailable")?;

        stdin.write_all(req.prompt.as_bytes()).await?;
        stdin.shutdown().await?;
        drop(stdin);

        // Drain both pipes while waiting so a chatty child can't fill
        // a pipe buffer and stall.
        let stdout_task = tokio::spawn(read_all(stdout));
        let stderr_task = tokio::spawn(read_all(stderr));

        let budget = Duration::from_millis(config.timeout_ms);
        let status = match timeout(budget, child.wait()).await {
            Ok(status) => status.context("failed waiting for the CLI")?,
            Err(_) => {
                let _ = child.kill().await;
                let _ = child.wait().await;
                bail!("CLI run timed out after {} ms", config.timeout_ms);
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        let output = stdout.trim();

        if !status.success() {
            // stderr can echo prompt content, so only its fingerprint
            // reaches the logs.
            tracing::warn!(code = ?status.code(), stderr = %redact_text(&stderr), "CLI exited non-zero");
            if output.is_empty() {
                let detail = stderr.trim();
                if detail.is_empty() {
                    bail!("CLI failed with exit code {}", status.code().unwrap_or(-1));
                }
                bail!("{detail}");
            }
            // Some CLI error paths still print a usable envelope; fall
            // through to parsing.
        }

        match serde_json::from_str::<ResultEnvelope>(output) {
            Ok(envelope) => {
                if let (Some(agent), Some(session_id)) =
                    (req.agent_name.as_deref(), envelope.session_id.as_deref())
                {
                    // Recorded even when auto_resume was off on this
                    // run, so a later run can pick the conversation up.
                    if let Err(err) = self.sessions.record(agent, session_id).await {
                        tracing::warn!(agent, error = %err, "failed to persist session id");
                    }
                }
                Ok(RunOutcome {
                    text: envelope.text(),
                    session_id: envelope.session_id.clone(),
                    raw: false,
                })
            }
            Err(_) => {
                tracing::warn!("CLI output was not a JSON envelope, returning raw text");
                Ok(RunOutcome {
                    text: output.to_string(),
                    session_id: None,
                    raw: true,
                })
            }
        }
    }

    /// Streaming run: stdout chunks are forwarded as they arrive; the
    /// channel closes when the child exits. No envelope parse, no
    /// session persistence — the raw stream carries no session id.
    pub async fn run_streaming(&self, req: RunRequest) -> anyhow::Result<mpsc::Receiver<StreamChunk>> {
        if req.prompt.trim().is_empty() {
            bail!("prompt must not be empty");
        }
        let config = self.config.get().await;
        let session = self.resolve_session(&req).await;
        let invocation = CliInvocation::streaming(
            &config,
            &self.paths,
            req.agent_name.as_deref(),
            session.as_deref(),
        );

        let mut child = invocation
            .command(&self.paths)
            .spawn()
            .with_context(|| format!("failed to spawn '{}'", invocation.program))?;
        let mut stdin = child.stdin.take().context("child stdin unavailable")?;
        let mut stdout = child.stdout.take().context("child stdout unavailable")?;
        let stderr = child.stderr.take().context("child stderr unavailable")?;

        let run_id = Uuid::new_v4().to_string();
        self.events.publish(EngineEvent::new(
            "run.started",
            json!({
                "runID": run_id,
                "agent": req.agent_name,
                "resumed": session,
                "mode": "streaming",
            }),
        ));

        tokio::spawn(async move {
            let noise = read_all(stderr).await;
            if !noise.trim().is_empty() {
                tracing::warn!(stderr = %redact_text(&noise), "CLI stderr during streaming run");
            }
        });

        let (tx, rx) = mpsc::channel::<StreamChunk>(64);
        let events = self.events.clone();
        let prompt = req.prompt.clone();
        let timeout_ms = config.timeout_ms;
        let started = Instant::now();

        tokio::spawn(async move {
            if let Err(err) = stdin.write_all(prompt.as_bytes()).await {
                let _ = tx.send(StreamChunk::Error(err.to_string())).await;
            }
            let _ = stdin.shutdown().await;
            drop(stdin);

            let deadline = tokio::time::sleep(Duration::from_millis(timeout_ms));
            tokio::pin!(deadline);
            let mut buf = vec![0u8; 8192];
            let mut timed_out = false;
            loop {
                tokio::select! {
                    read = stdout.read(&mut buf) => match read {
                        Ok(0) => break,
                        Ok(n) => {
                            let chunk = String::from_utf8_lossy(&buf[..n]).to_string();
                            if tx.send(StreamChunk::Stdout(chunk)).await.is_err() {
                                // Receiver hung up; stop the child.
                                let _ = child.kill().await;
                                break;
                            }
                        }
                        Err(err) => {
                            let _ = tx.send(StreamChunk::Error(err.to_string())).await;
                            break;
                        }
                    },
                    _ = &mut deadline => {
                        timed_out = true;
                        let _ = child.kill().await;
                        let _ = tx
                            .send(StreamChunk::Error(format!(
                                "CLI run timed out after {timeout_ms} ms"
                            )))
                            .await;
                        break;
                    }
                }
            }
            let status = child.wait().await.ok();
            events.publish(EngineEvent::new(
                "run.finished",
                json!({
                    "runID": run_id,
                    "mode": "streaming",
                    "status": if timed_out { "timeout" } else { "ok" },
                    "exitCode": status.and_then(|s| s.code()),
                    "durationMs": started.elapsed().as_millis() as u64,
                }),
            ));
        });

        Ok(rx)
    }

    async fn resolve_session(&self, req: &RunRequest) -> Option<String> {
        if let Some(id) = &req.session_id {
            return Some(id.clone());
        }
        if !req.auto_resume {
            return None;
        }
        let agent = req.agent_name.as_deref()?;
        let last = self.sessions.last(agent).await?;
        tracing::info!(agent, session_id = %last, "auto-resuming last recorded session");
        Some(last)
    }
}

async fn read_all(mut reader: impl AsyncRead + Unpin) -> String {
    let mut out = Vec::new();
    let _ = reader.read_to_end(&mut out).await;
    String::from_utf8_lossy(&out).to_string()
}
