//! # Sync Session
//!
//! Everything the presentation layer needs for one open channel: the
//! message view, who is typing, and reactions, plus the writes against them.
//!
//! ## State Machine
//! ```text
//!            open()                 all links up
//!  Closed ──────────► Opening ─────────────────────► Open
//!    ▲                   │                           │  ▲
//!    │     any failure   │             link drops    │  │ link restored
//!    ├───────────────────┘                           ▼  │
//!    │                                            Degraded
//!    │                close()                        │
//!    └───────────────────────────────────────────────┘
//! ```
//!
//! ## Components
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  SyncSession                                                            │
//! │                                                                         │
//! │  messages:<ch>  ──► ReconciliationEngine ──► view()                     │
//! │                        │ ViewUpdate::Removed ──► TagAggregator::forget  │
//! │  reactions:<ch> ──► reaction pump ──► TagAggregator ──► reactions_for() │
//! │  typing:<ch>    ──► typing pump   ──► PresenceTracker ──► typing_actors()│
//! │                                                                         │
//! │  local typing timer: start_typing() re-arms, fires clear_typing()       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use ts_rs::TS;

use huddle_core::validation::validate_id;
use huddle_core::{GroupedReactions, Message, Table, TypingIndicator};

use crate::agent::SessionEventEmitter;
use crate::aggregator::TagAggregator;
use crate::backend::{EventStream, LinkState, SnapshotStore, StreamSignal, SubscriptionHandle, Topic};
use crate::change::ChangeEvent;
use crate::config::SessionSettings;
use crate::engine::{EngineOptions, ReconciliationEngine, ViewListener, ViewUpdate, WriteOutcome};
use crate::error::{SyncError, SyncResult};
use crate::presence::PresenceTracker;

// =============================================================================
// Session State
// =============================================================================

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Closed,
    Opening,
    Open,
    /// Open, but at least one link is down.
    Degraded,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Closed => write!(f, "closed"),
            SessionState::Opening => write!(f, "opening"),
            SessionState::Open => write!(f, "open"),
            SessionState::Degraded => write!(f, "degraded"),
        }
    }
}

// =============================================================================
// Health
// =============================================================================

/// Link bookkeeping and the published session state.
struct Health {
    channel_id: String,
    links: Mutex<HashMap<Table, LinkState>>,
    state_tx: watch::Sender<SessionState>,
    emitter: Arc<dyn SessionEventEmitter>,
}

impl Health {
    fn new(channel_id: String, emitter: Arc<dyn SessionEventEmitter>) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Closed);
        Health {
            channel_id,
            links: Mutex::new(HashMap::new()),
            state_tx,
            emitter,
        }
    }

    fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    fn any_link_down(&self) -> bool {
        self.links
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .any(|link| *link == LinkState::Disconnected)
    }

    /// Applies `next` atomically against the current state.
    fn update(&self, next: impl FnOnce(SessionState) -> Option<SessionState>) {
        let mut applied = None;
        self.state_tx.send_if_modified(|current| match next(*current) {
            Some(state) if state != *current => {
                *current = state;
                applied = Some(state);
                true
            }
            _ => false,
        });

        if let Some(state) = applied {
            info!(channel_id = %self.channel_id, state = %state, "Session state changed");
            self.emitter.emit_state(&self.channel_id, state);
        }
    }

    fn force(&self, state: SessionState) {
        self.update(|_| Some(state));
    }

    /// Opening → Open (or Degraded if a link already dropped).
    fn finish_opening(&self) {
        let target = if self.any_link_down() {
            SessionState::Degraded
        } else {
            SessionState::Open
        };
        self.update(|current| (current == SessionState::Opening).then_some(target));
    }

    fn set_link(&self, table: Table, link: LinkState) {
        let any_down = {
            let mut links = self
                .links
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            links.insert(table, link);
            links.values().any(|l| *l == LinkState::Disconnected)
        };
        let target = if any_down {
            SessionState::Degraded
        } else {
            SessionState::Open
        };
        self.update(|current| {
            matches!(current, SessionState::Open | SessionState::Degraded).then_some(target)
        });
    }

    fn report_error(&self, error: &SyncError) {
        self.emitter
            .emit_error(&self.channel_id, &error.to_string(), error.is_retryable());
    }
}

/// Routes engine callbacks into the session.
struct EngineBridge {
    aggregator: TagAggregator,
    health: Arc<Health>,
    /// Bumped whenever the engine installs a fresh snapshot.
    snapshots: Arc<watch::Sender<u64>>,
}

impl ViewListener for EngineBridge {
    fn on_view_update(&self, _channel_id: &str, update: &ViewUpdate) {
        match update {
            ViewUpdate::Removed(id) => self.aggregator.forget(id),
            ViewUpdate::Reset => self.snapshots.send_modify(|epoch| *epoch += 1),
            ViewUpdate::Upserted(_) => {}
        }
    }

    fn on_link_state(&self, _channel_id: &str, state: LinkState) {
        self.health.set_link(Table::Messages, state);
    }
}

// =============================================================================
// Session
// =============================================================================

/// Handle to an open channel. Clones share the session.
#[derive(Clone)]
pub struct SyncSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    parts: Parts,
    links: Mutex<SideLinks>,
}

/// The components pumps and timers work against.
#[derive(Clone)]
struct Parts {
    channel_id: String,
    profile_id: String,
    settings: SessionSettings,
    store: Arc<dyn SnapshotStore>,
    stream: Arc<dyn EventStream>,
    engine: ReconciliationEngine,
    aggregator: TagAggregator,
    presence: PresenceTracker,
    health: Arc<Health>,
    snapshots: Arc<watch::Sender<u64>>,
}

/// Reaction and typing subscriptions, their pumps, and the typing timer.
#[derive(Default)]
struct SideLinks {
    closed: bool,
    handles: Vec<SubscriptionHandle>,
    pumps: Vec<JoinHandle<()>>,
    typing_timer: Option<JoinHandle<()>>,
}

impl SideLinks {
    fn teardown(&mut self) {
        for handle in self.handles.drain(..) {
            handle.cancel();
        }
        for pump in self.pumps.drain(..) {
            pump.abort();
        }
    }
}

impl SyncSession {
    /// Opens a channel: message snapshot, reactions for it, typing stream.
    ///
    /// On any failure everything started so far is torn down and the error
    /// is returned; nothing is retried.
    pub async fn open(
        channel_id: impl Into<String>,
        profile_id: impl Into<String>,
        settings: SessionSettings,
        store: Arc<dyn SnapshotStore>,
        stream: Arc<dyn EventStream>,
        emitter: Arc<dyn SessionEventEmitter>,
    ) -> SyncResult<Self> {
        let channel_id = channel_id.into();
        let profile_id = profile_id.into();
        validate_id("channel_id", &channel_id)?;
        validate_id("profile_id", &profile_id)?;

        let health = Arc::new(Health::new(channel_id.clone(), emitter));
        health.force(SessionState::Opening);

        let aggregator = TagAggregator::new(channel_id.clone(), store.clone());
        let presence = PresenceTracker::start(settings.typing_ttl(), settings.typing_tick());
        let snapshots = Arc::new(watch::channel(0u64).0);
        let bridge = Arc::new(EngineBridge {
            aggregator: aggregator.clone(),
            health: health.clone(),
            snapshots: snapshots.clone(),
        });

        let options = EngineOptions::default()
            .filter(settings.filter())
            .snapshot_limit(settings.snapshot_limit)
            .sender(profile_id.clone());

        let engine = match ReconciliationEngine::open(
            channel_id.clone(),
            options,
            store.clone(),
            stream.clone(),
            bridge,
        )
        .await
        {
            Ok(engine) => engine,
            Err(e) => {
                presence.shutdown();
                aggregator.close();
                health.force(SessionState::Closed);
                health.report_error(&e);
                return Err(e);
            }
        };

        let parts = Parts {
            channel_id,
            profile_id,
            settings,
            store,
            stream,
            engine,
            aggregator,
            presence,
            health,
            snapshots,
        };

        let links = match start_side_links(&parts).await {
            Ok(links) => links,
            Err(e) => {
                parts.engine.close();
                parts.presence.shutdown();
                parts.aggregator.close();
                parts.health.force(SessionState::Closed);
                parts.health.report_error(&e);
                return Err(e);
            }
        };

        parts.health.finish_opening();
        info!(
            channel_id = %parts.channel_id,
            profile_id = %parts.profile_id,
            messages = parts.engine.len(),
            "Session opened"
        );

        Ok(SyncSession {
            inner: Arc::new(SessionInner {
                parts,
                links: Mutex::new(links),
            }),
        })
    }

    fn parts(&self) -> &Parts {
        &self.inner.parts
    }

    fn lock_links(&self) -> MutexGuard<'_, SideLinks> {
        self.inner
            .links
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_open(&self) -> SyncResult<()> {
        if self.lock_links().closed {
            return Err(SyncError::SessionClosed(self.parts().channel_id.clone()));
        }
        Ok(())
    }

    pub fn channel_id(&self) -> &str {
        &self.parts().channel_id
    }

    pub fn profile_id(&self) -> &str {
        &self.parts().profile_id
    }

    /// Returns true if both handles refer to the same session.
    pub fn ptr_eq(&self, other: &SyncSession) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn state(&self) -> SessionState {
        self.parts().health.state()
    }

    /// Watches state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.parts().health.state_tx.subscribe()
    }

    // =========================================================================
    // Presentation
    // =========================================================================

    /// Messages in display order.
    pub fn view(&self) -> Vec<Message> {
        self.parts().engine.view()
    }

    /// Other profiles currently typing here.
    pub fn typing_actors(&self) -> BTreeSet<String> {
        let parts = self.parts();
        parts
            .presence
            .active_actors(&parts.channel_id, Some(&parts.profile_id))
    }

    pub fn reactions_for(&self, message_id: &str) -> GroupedReactions {
        self.parts().aggregator.view(message_id)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    pub async fn append(&self, content: &str) -> SyncResult<Message> {
        self.ensure_open()?;
        self.parts().engine.append(content).await
    }

    pub async fn edit(&self, message_id: &str, content: &str) -> SyncResult<WriteOutcome> {
        self.ensure_open()?;
        self.parts().engine.edit(message_id, content).await
    }

    pub async fn remove(&self, message_id: &str) -> SyncResult<WriteOutcome> {
        self.ensure_open()?;
        self.parts().engine.remove(message_id).await
    }

    /// Flips this profile's `emoji` on a message. Returns the new presence.
    pub async fn toggle_reaction(&self, message_id: &str, emoji: &str) -> SyncResult<bool> {
        self.ensure_open()?;
        let parts = self.parts();
        parts
            .aggregator
            .toggle(message_id, &parts.profile_id, emoji)
            .await
    }

    /// Announces that this profile is typing.
    ///
    /// The row is cleared automatically one TTL after the last call.
    pub async fn start_typing(&self) -> SyncResult<()> {
        self.ensure_open()?;
        let parts = self.parts();

        parts
            .store
            .upsert_typing(&parts.channel_id, &parts.profile_id)
            .await
            .map_err(|e| e.into_write_error("start_typing"))?;

        let timer = {
            let store = parts.store.clone();
            let channel_id = parts.channel_id.clone();
            let profile_id = parts.profile_id.clone();
            let ttl = parts.settings.typing_ttl();
            tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                if let Err(e) = store.clear_typing(&channel_id, &profile_id).await {
                    debug!(channel_id = %channel_id, error = %e, "Typing auto-stop failed");
                }
            })
        };

        let mut links = self.lock_links();
        if links.closed {
            timer.abort();
            return Err(SyncError::SessionClosed(parts.channel_id.clone()));
        }
        if let Some(previous) = links.typing_timer.replace(timer) {
            previous.abort();
        }
        Ok(())
    }

    /// Clears this profile's typing row now.
    pub async fn stop_typing(&self) -> SyncResult<()> {
        self.ensure_open()?;
        if let Some(timer) = self.lock_links().typing_timer.take() {
            timer.abort();
        }

        let parts = self.parts();
        parts
            .store
            .clear_typing(&parts.channel_id, &parts.profile_id)
            .await
            .map_err(|e| e.into_write_error("stop_typing"))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Re-subscribes every link and reloads messages and reactions.
    pub async fn resync(&self) -> SyncResult<()> {
        self.ensure_open()?;
        let parts = self.parts();

        if let Err(e) = parts.engine.resync().await {
            parts.health.report_error(&e);
            return Err(e);
        }

        self.lock_links().teardown();
        parts.presence.clear(&parts.channel_id);

        let fresh = match start_side_links(parts).await {
            Ok(links) => links,
            Err(e) => {
                parts.health.set_link(Table::Reactions, LinkState::Disconnected);
                parts
                    .health
                    .set_link(Table::TypingIndicators, LinkState::Disconnected);
                parts.health.report_error(&e);
                return Err(e);
            }
        };

        let mut links = self.lock_links();
        if links.closed {
            let mut fresh = fresh;
            fresh.teardown();
            return Err(SyncError::SessionClosed(parts.channel_id.clone()));
        }
        links.handles = fresh.handles;
        links.pumps = fresh.pumps;
        Ok(())
    }

    /// Closes the session. Idempotent.
    ///
    /// All subscriptions, pumps and timers stop before the first await, so
    /// nothing mutates the session once this returns. The local typing row,
    /// if any, is then cleared best-effort.
    pub async fn close(&self) {
        let was_typing = {
            let mut links = self.lock_links();
            if links.closed {
                return;
            }
            links.closed = true;
            links.teardown();
            match links.typing_timer.take() {
                Some(timer) => {
                    let pending = !timer.is_finished();
                    timer.abort();
                    pending
                }
                None => false,
            }
        };

        let parts = self.parts();
        parts.engine.close();
        parts.aggregator.close();
        parts.presence.shutdown();
        parts.health.force(SessionState::Closed);
        info!(channel_id = %parts.channel_id, "Session closed");

        if was_typing {
            if let Err(e) = parts
                .store
                .clear_typing(&parts.channel_id, &parts.profile_id)
                .await
            {
                debug!(channel_id = %parts.channel_id, error = %e, "Failed to clear typing on close");
            }
        }
    }
}

impl std::fmt::Debug for SyncSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncSession")
            .field("channel_id", &self.channel_id())
            .field("profile_id", &self.profile_id())
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let links = self
            .links
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        links.closed = true;
        links.teardown();
        if let Some(timer) = links.typing_timer.take() {
            timer.abort();
        }
        self.parts.engine.close();
        self.parts.aggregator.close();
        self.parts.presence.shutdown();
    }
}

// =============================================================================
// Reaction + Typing Links
// =============================================================================

/// Subscribes to reactions and typing, loads reactions for the current view
/// and spawns both pumps.
async fn start_side_links(parts: &Parts) -> SyncResult<SideLinks> {
    let reactions = parts
        .stream
        .subscribe(&Topic::reactions(parts.channel_id.clone()))
        .await?;

    let rows = match parts
        .store
        .fetch_reactions(&parts.engine.message_ids())
        .await
    {
        Ok(rows) => rows,
        Err(e) => {
            reactions.handle().cancel();
            return Err(e);
        }
    };

    let typing = match parts
        .stream
        .subscribe(&Topic::typing(parts.channel_id.clone()))
        .await
    {
        Ok(typing) => typing,
        Err(e) => {
            reactions.handle().cancel();
            return Err(e);
        }
    };

    parts.aggregator.load(rows);
    parts.health.set_link(Table::Reactions, LinkState::Connected);
    parts
        .health
        .set_link(Table::TypingIndicators, LinkState::Connected);

    let (reaction_rx, reaction_handle) = reactions.into_parts();
    let (typing_rx, typing_handle) = typing.into_parts();

    Ok(SideLinks {
        closed: false,
        handles: vec![reaction_handle, typing_handle],
        pumps: vec![
            tokio::spawn(reaction_pump(
                parts.clone(),
                reaction_rx,
                parts.snapshots.subscribe(),
            )),
            tokio::spawn(typing_pump(parts.clone(), typing_rx)),
        ],
        typing_timer: None,
    })
}

/// Refetches reactions for the messages in view. Returns true on success.
async fn reload_reactions(parts: &Parts) -> bool {
    let ids = parts.engine.message_ids();
    match parts.store.fetch_reactions(&ids).await {
        Ok(rows) => {
            debug!(channel_id = %parts.channel_id, rows = rows.len(), "Reactions reloaded");
            parts.aggregator.load(rows);
            true
        }
        Err(e) => {
            warn!(channel_id = %parts.channel_id, error = %e, "Reaction reload failed");
            false
        }
    }
}

/// Applies reaction changes and reloads after every fresh message snapshot,
/// so reactions on messages that arrive through a resync are not missed.
async fn reaction_pump(
    parts: Parts,
    mut receiver: mpsc::Receiver<StreamSignal>,
    mut snapshots: watch::Receiver<u64>,
) {
    let mut stream_up = true;

    loop {
        tokio::select! {
            signal = receiver.recv() => {
                let Some(signal) = signal else {
                    break;
                };
                match signal {
                    StreamSignal::Change(notification) => {
                        if !parts.aggregator.apply(&notification) {
                            return;
                        }
                    }
                    StreamSignal::Disconnected { reason } => {
                        warn!(channel_id = %parts.channel_id, reason = %reason, "Reaction stream disconnected");
                        stream_up = false;
                        parts
                            .health
                            .set_link(Table::Reactions, LinkState::Disconnected);
                    }
                    StreamSignal::Reconnected => {
                        stream_up = true;
                        if reload_reactions(&parts).await {
                            parts.health.set_link(Table::Reactions, LinkState::Connected);
                        }
                    }
                }
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                if reload_reactions(&parts).await && stream_up {
                    parts.health.set_link(Table::Reactions, LinkState::Connected);
                }
            }
        }
    }

    if !parts.aggregator.is_closed() {
        warn!(channel_id = %parts.channel_id, "Reaction stream ended");
        parts
            .health
            .set_link(Table::Reactions, LinkState::Disconnected);
    }
}

async fn typing_pump(parts: Parts, mut receiver: mpsc::Receiver<StreamSignal>) {
    // typing row id → profile, for deletes that carry only the id
    let mut rows: HashMap<String, String> = HashMap::new();

    while let Some(signal) = receiver.recv().await {
        if parts.presence.is_shut_down() {
            return;
        }

        match signal {
            StreamSignal::Change(notification) => {
                if notification.table != Table::TypingIndicators {
                    continue;
                }
                match notification.decode::<TypingIndicator>() {
                    Ok(ChangeEvent::Inserted(row)) | Ok(ChangeEvent::Updated(row)) => {
                        if row.channel_id != parts.channel_id {
                            continue;
                        }
                        parts.presence.assert(&parts.channel_id, &row.profile_id);
                        rows.insert(row.id, row.profile_id);
                    }
                    Ok(ChangeEvent::Removed { id, old }) => {
                        let profile = rows.remove(&id).or(old.map(|row| row.profile_id));
                        if let Some(profile) = profile {
                            parts.presence.retract(&parts.channel_id, &profile);
                        }
                    }
                    Err(e) => {
                        warn!(channel_id = %parts.channel_id, error = %e, "Dropping malformed typing event");
                    }
                }
            }
            StreamSignal::Disconnected { reason } => {
                warn!(channel_id = %parts.channel_id, reason = %reason, "Typing stream disconnected");
                parts
                    .health
                    .set_link(Table::TypingIndicators, LinkState::Disconnected);
            }
            StreamSignal::Reconnected => {
                parts.presence.clear(&parts.channel_id);
                rows.clear();
                parts
                    .health
                    .set_link(Table::TypingIndicators, LinkState::Connected);
            }
        }
    }

    if !parts.presence.is_shut_down() {
        warn!(channel_id = %parts.channel_id, "Typing stream ended");
        parts
            .health
            .set_link(Table::TypingIndicators, LinkState::Disconnected);
    }
}
