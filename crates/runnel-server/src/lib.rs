use std::time::{SystemTime, UNIX_EPOCH};

use runnel_core::{AgentStore, ConfigStore, EventBus, SessionStore, WorkspacePaths};
use runnel_runner::Runner;

mod http;

pub use http::{app_router, serve};

/// Everything the HTTP handlers share. Cheap to clone; the stores are
/// all handle types.
#[derive(Clone)]
pub struct AppState {
    pub config: ConfigStore,
    pub paths: WorkspacePaths,
    pub agents: AgentStore,
    pub sessions: SessionStore,
    pub events: EventBus,
    pub runner: Runner,
    pub started_at_ms: u64,
}

impl AppState {
    pub fn new(config: ConfigStore, paths: WorkspacePaths) -> Self {
        let sessions = SessionStore::new(paths.sessions_file());
        let events = EventBus::new();
        let agents = AgentStore::new(paths.clone());
        let runner = Runner::new(
            config.clone(),
            paths.clone(),
            sessions.clone(),
            events.clone(),
        );
        Self {
            config,
            paths,
            agents,
            sessions,
            events,
            runner,
            started_at_ms: now_ms(),
        }
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
