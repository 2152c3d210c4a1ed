use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::fs;
use tokio::sync::Mutex;

/// The per-agent session map persisted at `.claude/sessions.json`.
///
/// Reads always go to disk so edits made between runs (by hand or by
/// another process) are picked up; a write lock serializes updaters so
/// concurrent runs cannot drop each other's entries.
#[derive(Clone)]
pub struct SessionStore {
    file: Arc<PathBuf>,
    write_lock: Arc<Mutex<()>>,
}

impl SessionStore {
    pub fn new(file: PathBuf) -> Self {
        Self {
            file: Arc::new(file),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Last recorded session id for an agent. Missing or unreadable
    /// state yields `None`, never an error.
    pub async fn last(&self, agent: &str) -> Option<String> {
        self.load().await.remove(agent)
    }

    pub async fn snapshot(&self) -> HashMap<String, String> {
        self.load().await
    }

    pub async fn record(&self, agent: &str, session_id: &str) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.file.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut sessions = self.load().await;
        sessions.insert(agent.to_string(), session_id.to_string());
        let raw = serde_json::to_string_pretty(&sessions)?;
        fs::write(self.file.as_path(), raw).await?;
        Ok(())
    }

    /// Drops the recorded session for an agent. Returns whether an
    /// entry existed.
    pub async fn forget(&self, agent: &str) -> anyhow::Result<bool> {
        let _guard = self.write_lock.lock().await;
        let mut sessions = self.load().await;
        let removed = sessions.remove(agent).is_some();
        if removed {
            let raw = serde_json::to_string_pretty(&sessions)?;
            fs::write(self.file.as_path(), raw).await?;
        }
        Ok(removed)
    }

    async fn load(&self) -> HashMap<String, String> {
        let Ok(raw) = fs::read_to_string(self.file.as_path()).await else {
            return HashMap::new();
        };
        serde_json::from_str::<HashMap<String, String>>(&raw).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> SessionStore {
        SessionStore::new(dir.path().join(".claude").join("sessions.json"))
    }

    #[tokio::test]
    async fn missing_file_yields_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        assert!(store.last("news").await.is_none());
        assert!(store.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn record_creates_parents_and_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        store.record("news", "sess-1").await.expect("record");
        store.record("finance", "sess-2").await.expect("record");
        assert_eq!(store.last("news").await.as_deref(), Some("sess-1"));
        assert_eq!(store.snapshot().await.len(), 2);
    }

    #[tokio::test]
    async fn record_overwrites_previous_entry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        store.record("news", "sess-1").await.expect("record");
        store.record("news", "sess-2").await.expect("record");
        assert_eq!(store.last("news").await.as_deref(), Some("sess-2"));
    }

    #[tokio::test]
    async fn corrupt_file_is_treated_as_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        let file = dir.path().join(".claude").join("sessions.json");
        tokio::fs::create_dir_all(file.parent().expect("parent"))
            .await
            .expect("mkdir");
        tokio::fs::write(&file, "{not json").await.expect("write");
        assert!(store.last("news").await.is_none());
        store.record("news", "sess-1").await.expect("record");
        assert_eq!(store.last("news").await.as_deref(), Some("sess-1"));
    }

    #[tokio::test]
    async fn forget_removes_only_the_named_agent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        store.record("news", "sess-1").await.expect("record");
        store.record("finance", "sess-2").await.expect("record");
        assert!(store.forget("news").await.expect("forget"));
        assert!(!store.forget("news").await.expect("forget again"));
        assert_eq!(store.last("finance").await.as_deref(), Some("sess-2"));
    }
}
