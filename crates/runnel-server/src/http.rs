use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};
use tokio_stream::StreamExt;
use tower_http::cors::{Any, CorsLayer};

use runnel_runner::StreamChunk;
use runnel_types::{EngineEvent, RunRequest};

use crate::{now_ms, AppState};

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "http server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}

pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/event", get(events))
        .route("/run", axum::routing::post(run))
        .route("/agent", axum::routing::post(create_agent).get(list_agents))
        .route("/agent/{name}", axum::routing::delete(delete_agent))
        .route("/agent/{name}/config", axum::routing::patch(update_agent_config))
        .route(
            "/agent/{name}/prompt",
            get(read_agent_prompt).put(write_agent_prompt),
        )
        .route(
            "/agent/{name}/prompt/edit",
            axum::routing::post(edit_agent_prompt),
        )
        .route("/session", get(list_sessions))
        .route(
            "/session/{agent}",
            get(get_session).delete(forget_session),
        )
        .route("/config", get(get_config).patch(patch_config))
        .layer(cors)
        .with_state(state)
}

type ApiError = (StatusCode, Json<Value>);
type ApiResult<T> = Result<T, ApiError>;

fn error_body(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

/// Store errors are either "the thing you named does not exist" (404)
/// or a caller error (400).
fn store_error(err: anyhow::Error) -> ApiError {
    let status = if err.downcast_ref::<runnel_core::NotFound>().is_some() {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::BAD_REQUEST
    };
    error_body(status, err.to_string())
}

fn run_error(err: anyhow::Error) -> ApiError {
    let message = err.to_string();
    let status = if message.contains("timed out") {
        StatusCode::GATEWAY_TIMEOUT
    } else if message.contains("prompt must not be empty") {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    error_body(status, message)
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "workspace": state.paths.root().display().to_string(),
        "uptimeMs": now_ms().saturating_sub(state.started_at_ms),
    }))
}

#[derive(Debug, Deserialize)]
struct RunInput {
    #[serde(flatten)]
    request: RunRequest,
    #[serde(default)]
    stream: bool,
    #[serde(default)]
    sse: bool,
}

async fn run(
    State(state): State<AppState>,
    Json(input): Json<RunInput>,
) -> Result<Response, ApiError> {
    if input.request.prompt.trim().is_empty() {
        return Err(error_body(
            StatusCode::BAD_REQUEST,
            "prompt must not be empty",
        ));
    }
    if input.sse {
        let rx = state
            .runner
            .run_streaming(input.request)
            .await
            .map_err(run_error)?;
        let live = ReceiverStream::new(rx).map(|chunk| {
            Ok::<_, Infallible>(match chunk {
                StreamChunk::Stdout(text) => Event::default().event("chunk").data(text),
                StreamChunk::Error(err) => Event::default().event("error").data(err),
            })
        });
        let done = tokio_stream::once(Ok(Event::default().event("done").data("")));
        return Ok(Sse::new(live.chain(done))
            .keep_alive(KeepAlive::new().interval(Duration::from_secs(10)))
            .into_response());
    }
    if input.stream {
        let rx = state
            .runner
            .run_streaming(input.request)
            .await
            .map_err(run_error)?;
        let body = ReceiverStream::new(rx).map(|chunk| {
            Ok::<_, Infallible>(match chunk {
                StreamChunk::Stdout(text) => Bytes::from(text),
                StreamChunk::Error(err) => Bytes::from(format!("\n[error] {err}\n")),
            })
        });
        return Ok((
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            Body::from_stream(body),
        )
            .into_response());
    }
    let outcome = state.runner.run(input.request).await.map_err(run_error)?;
    Ok(Json(outcome).into_response())
}

fn sse_stream(state: AppState) -> impl Stream<Item = Result<Event, Infallible>> {
    let rx = state.events.subscribe();
    let initial = tokio_stream::once(Ok(Event::default().data(
        serde_json::to_string(&EngineEvent::new(
            "server.connected",
            json!({ "timestampMs": now_ms() }),
        ))
        .unwrap_or_default(),
    )));
    let live = BroadcastStream::new(rx).filter_map(|msg| match msg {
        Ok(event) => {
            let payload = serde_json::to_string(&event).unwrap_or_default();
            Some(Ok(Event::default().data(payload)))
        }
        Err(_) => None,
    });
    initial.chain(live)
}

async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    Sse::new(sse_stream(state)).keep_alive(KeepAlive::new().interval(Duration::from_secs(10)))
}

async fn create_agent(
    State(state): State<AppState>,
    Json(req): Json<runnel_core::CreateAgent>,
) -> ApiResult<Json<Value>> {
    let created = state.agents.create(req).await.map_err(store_error)?;
    state.events.publish(EngineEvent::new(
        "agent.created",
        json!({ "agent": created.name }),
    ));
    Ok(Json(serde_json::to_value(created).unwrap_or_default()))
}

#[derive(Debug, Deserialize, Default)]
struct ListAgentsQuery {
    details: Option<bool>,
}

async fn list_agents(
    State(state): State<AppState>,
    Query(query): Query<ListAgentsQuery>,
) -> ApiResult<Json<Value>> {
    let agents = state
        .agents
        .list(query.details.unwrap_or(false))
        .await
        .map_err(|err| error_body(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    Ok(Json(json!({ "agents": agents })))
}

async fn delete_agent(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    let report = state.agents.delete(&name).await.map_err(store_error)?;
    // forget the recorded session too so a recreated agent starts fresh
    if let Err(err) = state.sessions.forget(&report.name).await {
        tracing::warn!(agent = %report.name, error = %err, "failed to drop recorded session");
    }
    state.events.publish(EngineEvent::new(
        "agent.deleted",
        json!({ "agent": report.name }),
    ));
    Ok(Json(serde_json::to_value(report).unwrap_or_default()))
}

async fn update_agent_config(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(patch): Json<Value>,
) -> ApiResult<Json<Value>> {
    let settings = state
        .agents
        .update_config(&name, patch)
        .await
        .map_err(store_error)?;
    Ok(Json(json!({ "agent": name, "settings": settings })))
}

async fn read_agent_prompt(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    let prompt = state.agents.read_prompt(&name).await.map_err(store_error)?;
    Ok(Json(json!({ "agent": name, "prompt": prompt })))
}

#[derive(Debug, Deserialize)]
struct WritePromptInput {
    prompt: String,
}

async fn write_agent_prompt(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(input): Json<WritePromptInput>,
) -> ApiResult<Json<Value>> {
    let existed = state
        .agents
        .write_prompt(&name, &input.prompt)
        .await
        .map_err(store_error)?;
    Ok(Json(json!({ "agent": name, "overwritten": existed })))
}

#[derive(Debug, Deserialize)]
struct EditPromptInput {
    search: String,
    replace: String,
}

async fn edit_agent_prompt(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(input): Json<EditPromptInput>,
) -> ApiResult<Json<Value>> {
    state
        .agents
        .edit_prompt(&name, &input.search, &input.replace)
        .await
        .map_err(store_error)?;
    Ok(Json(json!({ "agent": name, "edited": true })))
}

async fn list_sessions(State(state): State<AppState>) -> Json<Value> {
    let sessions = state.sessions.snapshot().await;
    Json(json!({ "sessions": sessions }))
}

async fn get_session(
    State(state): State<AppState>,
    Path(agent): Path<String>,
) -> ApiResult<Json<Value>> {
    match state.sessions.last(&agent).await {
        Some(session_id) => Ok(Json(json!({ "agent": agent, "sessionId": session_id }))),
        None => Err(error_body(
            StatusCode::NOT_FOUND,
            format!("no session recorded for agent '{agent}'"),
        )),
    }
}

async fn forget_session(
    State(state): State<AppState>,
    Path(agent): Path<String>,
) -> ApiResult<Json<Value>> {
    let removed = state
        .sessions
        .forget(&agent)
        .await
        .map_err(|err| error_body(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    if !removed {
        return Err(error_body(
            StatusCode::NOT_FOUND,
            format!("no session recorded for agent '{agent}'"),
        ));
    }
    Ok(Json(json!({ "agent": agent, "removed": true })))
}

async fn get_config(State(state): State<AppState>) -> Json<Value> {
    Json(state.config.get_effective_value().await)
}

async fn patch_config(
    State(state): State<AppState>,
    Json(patch): Json<Value>,
) -> ApiResult<Json<Value>> {
    let effective = state
        .config
        .patch_project(patch)
        .await
        .map_err(|err| error_body(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    Ok(Json(effective))
}
