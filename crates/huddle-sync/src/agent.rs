//! # Sync Agent
//!
//! Owns the single active [`SyncSession`] for a signed-in profile and swaps
//! it when the user selects another channel.
//!
//! ## Agent Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        SyncAgent Architecture                           │
//! │                                                                         │
//! │  select_channel("random")                                               │
//! │        │                                                                │
//! │        ├── same channel, still open? ──► return current session         │
//! │        │                                                                │
//! │        ├── close previous session  (links cancelled, timers stopped)    │
//! │        │                                                                │
//! │        └── SyncSession::open ──► current = Some(session)                │
//! │                                                                         │
//! │  ┌────────────────┐   ┌────────────────┐   ┌────────────────────────┐   │
//! │  │ SnapshotStore  │   │  EventStream   │   │ SessionEventEmitter    │   │
//! │  │ (Memory/SQLite)│   │ (Memory/SQLite)│   │ state + error events   │   │
//! │  └────────────────┘   └────────────────┘   └────────────────────────┘   │
//! │                                                                         │
//! │  STATUS EVENTS (to the presentation layer):                             │
//! │  "session://state" - { channel: "general", state: "degraded" }          │
//! │  "session://error" - { message: "fetch failed", retryable: true }       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tracing::{error, info};

use huddle_db::{Database, DbConfig};

use crate::backend::{EventStream, SnapshotStore, SqliteBackend};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::session::{SessionState, SyncSession};

// =============================================================================
// Agent Status
// =============================================================================

/// Current agent status for external queries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentStatus {
    /// Channel selected last, if any.
    pub channel_id: Option<String>,

    /// State of the active session (Closed when there is none).
    pub state: SessionState,

    /// Error from the most recent failed selection.
    pub last_error: Option<String>,
}

// =============================================================================
// Event Emitter Trait
// =============================================================================

/// Receives session lifecycle events.
///
/// The desktop shell forwards these to its UI; tests record them.
pub trait SessionEventEmitter: Send + Sync {
    /// Emit a session state transition.
    fn emit_state(&self, channel_id: &str, state: SessionState);

    /// Emit an error event.
    fn emit_error(&self, channel_id: &str, message: &str, retryable: bool);
}

/// No-op emitter for testing or headless use.
pub struct NoOpEmitter;

impl SessionEventEmitter for NoOpEmitter {
    fn emit_state(&self, _channel_id: &str, _state: SessionState) {}
    fn emit_error(&self, _channel_id: &str, _message: &str, _retryable: bool) {}
}

// =============================================================================
// Sync Agent
// =============================================================================

/// Holds at most one open session at a time.
pub struct SyncAgent {
    config: Arc<SyncConfig>,
    profile_id: String,
    store: Arc<dyn SnapshotStore>,
    stream: Arc<dyn EventStream>,
    emitter: Arc<dyn SessionEventEmitter>,

    /// Serializes channel switches.
    switch_lock: AsyncMutex<()>,
    current: Mutex<Option<SyncSession>>,
    status: Arc<RwLock<AgentStatus>>,
}

impl SyncAgent {
    /// Creates an agent with a no-op emitter.
    pub fn new(
        config: SyncConfig,
        profile_id: impl Into<String>,
        store: Arc<dyn SnapshotStore>,
        stream: Arc<dyn EventStream>,
    ) -> Self {
        Self::with_emitter(config, profile_id, store, stream, Arc::new(NoOpEmitter))
    }

    /// Creates an agent with a custom event emitter.
    pub fn with_emitter(
        config: SyncConfig,
        profile_id: impl Into<String>,
        store: Arc<dyn SnapshotStore>,
        stream: Arc<dyn EventStream>,
        emitter: Arc<dyn SessionEventEmitter>,
    ) -> Self {
        SyncAgent {
            config: Arc::new(config),
            profile_id: profile_id.into(),
            store,
            stream,
            emitter,
            switch_lock: AsyncMutex::new(()),
            current: Mutex::new(None),
            status: Arc::new(RwLock::new(AgentStatus::default())),
        }
    }

    /// Creates an agent backed by the SQLite database named in `config`.
    pub async fn open_sqlite(config: SyncConfig, profile_id: impl Into<String>) -> SyncResult<Self> {
        config.validate()?;
        let path = config.store.resolved_database_path().ok_or_else(|| {
            SyncError::InvalidConfig("No database path could be determined".into())
        })?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SyncError::InvalidConfig(format!("Cannot create {}: {e}", parent.display()))
            })?;
        }

        info!(path = %path.display(), "Opening SQLite store");
        let db = Database::new(DbConfig::new(path)).await?;
        let backend = Arc::new(SqliteBackend::new(db).with_buffer(config.session.event_buffer));

        Ok(Self::new(config, profile_id, backend.clone(), backend))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn profile_id(&self) -> &str {
        &self.profile_id
    }

    fn current(&self) -> Option<SyncSession> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn replace_current(&self, session: Option<SyncSession>) -> Option<SyncSession> {
        let mut current = self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::replace(&mut *current, session)
    }

    /// The active session, if any.
    pub fn session(&self) -> Option<SyncSession> {
        self.current()
    }

    /// Makes `channel_id` the active channel.
    ///
    /// Re-selecting the open channel returns the existing session. Otherwise
    /// the previous session is fully closed before the new one opens.
    pub async fn select_channel(&self, channel_id: &str) -> SyncResult<SyncSession> {
        let _switching = self.switch_lock.lock().await;

        if let Some(session) = self.current() {
            if session.channel_id() == channel_id && session.state() != SessionState::Closed {
                return Ok(session);
            }
        }

        if let Some(previous) = self.replace_current(None) {
            info!(from = %previous.channel_id(), to = %channel_id, "Switching channel");
            previous.close().await;
        }

        {
            let mut status = self.status.write().await;
            status.channel_id = Some(channel_id.to_string());
            status.last_error = None;
        }

        match SyncSession::open(
            channel_id,
            self.profile_id.clone(),
            self.config.session.clone(),
            self.store.clone(),
            self.stream.clone(),
            self.emitter.clone(),
        )
        .await
        {
            Ok(session) => {
                self.replace_current(Some(session.clone()));
                Ok(session)
            }
            Err(e) => {
                error!(channel_id = %channel_id, error = %e, "Failed to open channel");
                self.status.write().await.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Closes the active session, if any.
    pub async fn clear_selection(&self) {
        let _switching = self.switch_lock.lock().await;
        if let Some(previous) = self.replace_current(None) {
            previous.close().await;
        }
        self.status.write().await.channel_id = None;
    }

    /// Returns the current agent status.
    pub async fn status(&self) -> AgentStatus {
        let mut status = self.status.read().await.clone();
        status.state = self
            .current()
            .map(|session| session.state())
            .unwrap_or_default();
        status
    }

    /// Closes everything. The agent can be reused afterwards.
    pub async fn shutdown(&self) {
        info!("Sync agent shutting down");
        self.clear_selection().await;
    }
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for creating a SyncAgent with custom configuration.
pub struct SyncAgentBuilder {
    config: SyncConfig,
    profile_id: Option<String>,
    store: Option<Arc<dyn SnapshotStore>>,
    stream: Option<Arc<dyn EventStream>>,
    emitter: Option<Arc<dyn SessionEventEmitter>>,
}

impl SyncAgentBuilder {
    pub fn new(config: SyncConfig) -> Self {
        SyncAgentBuilder {
            config,
            profile_id: None,
            store: None,
            stream: None,
            emitter: None,
        }
    }

    pub fn with_profile(mut self, profile_id: impl Into<String>) -> Self {
        self.profile_id = Some(profile_id.into());
        self
    }

    pub fn with_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_stream(mut self, stream: Arc<dyn EventStream>) -> Self {
        self.stream = Some(stream);
        self
    }

    /// Uses one backend for both snapshots and events.
    pub fn with_backend<B>(self, backend: Arc<B>) -> Self
    where
        B: SnapshotStore + EventStream + 'static,
    {
        self.with_store(backend.clone()).with_stream(backend)
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn SessionEventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    pub fn build(self) -> SyncResult<SyncAgent> {
        self.config.validate()?;

        let profile_id = self
            .profile_id
            .ok_or_else(|| SyncError::InvalidConfig("Profile required".into()))?;
        let store = self
            .store
            .ok_or_else(|| SyncError::InvalidConfig("Snapshot store required".into()))?;
        let stream = self
            .stream
            .ok_or_else(|| SyncError::InvalidConfig("Event stream required".into()))?;
        let emitter = self.emitter.unwrap_or_else(|| Arc::new(NoOpEmitter));

        Ok(SyncAgent::with_emitter(
            self.config,
            profile_id,
            store,
            stream,
            emitter,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::backend::MemoryBackend;
    use crate::testing::{eventually, settle};

    #[derive(Default)]
    struct RecordingEmitter {
        states: Mutex<Vec<(String, SessionState)>>,
        errors: Mutex<Vec<(String, bool)>>,
    }

    impl SessionEventEmitter for RecordingEmitter {
        fn emit_state(&self, channel_id: &str, state: SessionState) {
            self.states
                .lock()
                .unwrap()
                .push((channel_id.to_string(), state));
        }

        fn emit_error(&self, _channel_id: &str, message: &str, retryable: bool) {
            self.errors
                .lock()
                .unwrap()
                .push((message.to_string(), retryable));
        }
    }

    fn agent(backend: &MemoryBackend) -> SyncAgent {
        SyncAgentBuilder::new(SyncConfig::default())
            .with_profile("me")
            .with_backend(Arc::new(backend.clone()))
            .build()
            .unwrap()
    }

    #[test]
    fn test_agent_status_default() {
        let status = AgentStatus::default();
        assert_eq!(status.channel_id, None);
        assert_eq!(status.state, SessionState::Closed);
        assert!(status.last_error.is_none());
    }

    #[test]
    fn test_builder_requires_parts() {
        let backend = MemoryBackend::new();

        let err = SyncAgentBuilder::new(SyncConfig::default())
            .with_backend(Arc::new(backend.clone()))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, SyncError::InvalidConfig(_)));

        let err = SyncAgentBuilder::new(SyncConfig::default())
            .with_profile("me")
            .with_store(Arc::new(backend))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, SyncError::InvalidConfig(_)));
    }

    #[test]
    fn test_builder_validates_config() {
        let mut config = SyncConfig::default();
        config.session.snapshot_limit = 0;

        let result = SyncAgentBuilder::new(config)
            .with_profile("me")
            .with_backend(Arc::new(MemoryBackend::new()))
            .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_reselecting_same_channel_reuses_session() {
        let backend = MemoryBackend::new();
        let agent = agent(&backend);

        let first = agent.select_channel("general").await.unwrap();
        let second = agent.select_channel("general").await.unwrap();
        assert!(first.ptr_eq(&second));
        assert_eq!(backend.subscriber_count("general"), 3);
    }

    #[tokio::test]
    async fn test_switching_channel_closes_previous() {
        let backend = MemoryBackend::new();
        let agent = agent(&backend);

        let general = agent.select_channel("general").await.unwrap();
        general.start_typing().await.unwrap();

        let random = agent.select_channel("random").await.unwrap();
        assert_eq!(general.state(), SessionState::Closed);
        assert_eq!(random.state(), SessionState::Open);
        assert_eq!(backend.subscriber_count("general"), 0);
        assert_eq!(backend.subscriber_count("random"), 3);
        assert!(backend.typing_rows("general").is_empty());

        backend
            .insert_message(huddle_core::NewMessage::new("general", None, "late"))
            .await
            .unwrap();
        settle().await;
        assert!(general.view().is_empty());

        let status = agent.status().await;
        assert_eq!(status.channel_id.as_deref(), Some("random"));
        assert_eq!(status.state, SessionState::Open);
    }

    #[tokio::test]
    async fn test_failed_selection_is_reported() {
        let backend = MemoryBackend::new();
        let emitter = Arc::new(RecordingEmitter::default());
        let agent = SyncAgentBuilder::new(SyncConfig::default())
            .with_profile("me")
            .with_backend(Arc::new(backend.clone()))
            .with_emitter(emitter.clone())
            .build()
            .unwrap();

        backend.set_fail_subscribe(true);
        assert!(agent.select_channel("general").await.is_err());

        let status = agent.status().await;
        assert_eq!(status.state, SessionState::Closed);
        assert!(status.last_error.is_some());
        assert!(agent.session().is_none());

        let errors = emitter.errors.lock().unwrap().clone();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].1);

        backend.set_fail_subscribe(false);
        agent.select_channel("general").await.unwrap();
        assert!(agent.status().await.last_error.is_none());
    }

    #[tokio::test]
    async fn test_emitter_sees_state_transitions() {
        let backend = MemoryBackend::new();
        let emitter = Arc::new(RecordingEmitter::default());
        let agent = SyncAgentBuilder::new(SyncConfig::default())
            .with_profile("me")
            .with_backend(Arc::new(backend.clone()))
            .with_emitter(emitter.clone())
            .build()
            .unwrap();

        agent.select_channel("general").await.unwrap();
        backend.disconnect("general").await;
        eventually(|| {
            emitter
                .states
                .lock()
                .unwrap()
                .contains(&("general".to_string(), SessionState::Degraded))
        })
        .await;
        agent.shutdown().await;

        let states: Vec<SessionState> = emitter
            .states
            .lock()
            .unwrap()
            .iter()
            .map(|(_, state)| *state)
            .collect();
        assert_eq!(
            states,
            vec![
                SessionState::Opening,
                SessionState::Open,
                SessionState::Degraded,
                SessionState::Closed,
            ]
        );
    }

    #[tokio::test]
    async fn test_shutdown_clears_selection() {
        let backend = MemoryBackend::new();
        let agent = agent(&backend);

        agent.select_channel("general").await.unwrap();
        agent.shutdown().await;

        assert!(agent.session().is_none());
        assert_eq!(backend.subscriber_count("general"), 0);
        let status = agent.status().await;
        assert_eq!(status.channel_id, None);
        assert_eq!(status.state, SessionState::Closed);
    }

    #[tokio::test]
    async fn test_open_sqlite_round_trip() {
        let dir = std::env::temp_dir().join(format!("huddle-agent-{}", uuid::Uuid::new_v4()));
        let mut config = SyncConfig::default();
        config.store.database_path = Some(dir.join("huddle.db"));

        let agent = SyncAgent::open_sqlite(config, "me").await.unwrap();
        let session = agent.select_channel("general").await.unwrap();
        let sent = session.append("persisted").await.unwrap();
        assert!(session.view().iter().any(|m| m.id == sent.id));

        agent.shutdown().await;
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_open_sqlite_reports_unusable_directory_as_config_error() {
        let blocker = std::env::temp_dir().join(format!("huddle-file-{}", uuid::Uuid::new_v4()));
        std::fs::write(&blocker, b"not a directory").unwrap();
        let mut config = SyncConfig::default();
        config.store.database_path = Some(blocker.join("nested").join("huddle.db"));

        let err = SyncAgent::open_sqlite(config, "me").await.err().unwrap();
        assert!(matches!(err, SyncError::InvalidConfig(ref reason) if reason.contains("Cannot create")));
        assert!(err.is_config_error());

        let _ = std::fs::remove_file(blocker);
    }
}
