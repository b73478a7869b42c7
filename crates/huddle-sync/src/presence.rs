//! # Presence Tracker
//!
//! Short-lived "actor is typing in channel" facts with a fixed TTL.
//!
//! ```text
//!   assert(ch, actor)   ──► expires_at = now + ttl   (refresh on repeat)
//!   retract(ch, actor)  ──► gone immediately
//!   active_actors(ch)   ──► { actor | expires_at > now } minus `excluding`
//!
//!   sweeper: interval(tick) ──► drop expired entries
//! ```
//!
//! Reads filter expired entries themselves; the sweeper only bounds memory,
//! so staleness never exceeds one tick even if it falls behind.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, trace};

/// Upper bound on the sweeper period.
pub const MAX_SWEEP_TICK: Duration = Duration::from_secs(1);

/// Per-channel TTL presence set. Clones share state.
#[derive(Clone)]
pub struct PresenceTracker {
    inner: Arc<PresenceInner>,
}

struct PresenceInner {
    ttl: Duration,
    state: Mutex<PresenceState>,
}

#[derive(Default)]
struct PresenceState {
    /// channel → actor → expires_at
    entries: HashMap<String, HashMap<String, Instant>>,
    sweeper: Option<JoinHandle<()>>,
    closed: bool,
}

impl PresenceInner {
    fn lock(&self) -> MutexGuard<'_, PresenceState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut state = self.lock();
        let mut removed = 0;
        state.entries.retain(|_, actors| {
            let before = actors.len();
            actors.retain(|_, expires_at| *expires_at > now);
            removed += before - actors.len();
            !actors.is_empty()
        });
        removed
    }
}

impl PresenceTracker {
    /// Creates a tracker and starts its sweeper on the current runtime.
    ///
    /// `tick` is clamped to the smaller of `ttl` and [`MAX_SWEEP_TICK`].
    pub fn start(ttl: Duration, tick: Duration) -> Self {
        let tracker = PresenceTracker {
            inner: Arc::new(PresenceInner {
                ttl,
                state: Mutex::new(PresenceState::default()),
            }),
        };

        let period = tick.min(ttl).min(MAX_SWEEP_TICK).max(Duration::from_millis(1));
        let sweeper = tokio::spawn(sweep_loop(Arc::downgrade(&tracker.inner), period));
        tracker.inner.lock().sweeper = Some(sweeper);

        tracker
    }

    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    /// Marks `actor` active in `channel_id` for one TTL from now.
    ///
    /// Returns the new expiry, or None once the tracker is shut down.
    pub fn assert(&self, channel_id: &str, actor: &str) -> Option<Instant> {
        let expires_at = Instant::now() + self.inner.ttl;
        let mut state = self.inner.lock();
        if state.closed {
            return None;
        }
        state
            .entries
            .entry(channel_id.to_string())
            .or_default()
            .insert(actor.to_string(), expires_at);
        trace!(channel_id = %channel_id, actor = %actor, "Presence asserted");
        Some(expires_at)
    }

    /// Removes `actor` from `channel_id`. Returns true if it was present.
    pub fn retract(&self, channel_id: &str, actor: &str) -> bool {
        let mut state = self.inner.lock();
        let Some(actors) = state.entries.get_mut(channel_id) else {
            return false;
        };
        let removed = actors.remove(actor).is_some();
        if actors.is_empty() {
            state.entries.remove(channel_id);
        }
        removed
    }

    /// Actors whose entry has not expired, minus `excluding`.
    pub fn active_actors(&self, channel_id: &str, excluding: Option<&str>) -> BTreeSet<String> {
        let now = Instant::now();
        let state = self.inner.lock();
        state
            .entries
            .get(channel_id)
            .map(|actors| {
                actors
                    .iter()
                    .filter(|(actor, expires_at)| {
                        **expires_at > now && Some(actor.as_str()) != excluding
                    })
                    .map(|(actor, _)| actor.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Forgets every actor in a channel.
    pub fn clear(&self, channel_id: &str) {
        self.inner.lock().entries.remove(channel_id);
    }

    /// Drops expired entries now. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        self.inner.sweep()
    }

    /// Entries held, expired or not.
    pub fn tracked_count(&self) -> usize {
        self.inner.lock().entries.values().map(HashMap::len).sum()
    }

    /// Stops the sweeper and clears all entries. Idempotent.
    pub fn shutdown(&self) {
        let mut state = self.inner.lock();
        state.closed = true;
        state.entries.clear();
        if let Some(sweeper) = state.sweeper.take() {
            sweeper.abort();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.lock().closed
    }
}

impl Drop for PresenceInner {
    fn drop(&mut self) {
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(sweeper) = state.sweeper.take() {
            sweeper.abort();
        }
    }
}

async fn sweep_loop(tracker: Weak<PresenceInner>, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(inner) = tracker.upgrade() else {
            return;
        };
        let removed = inner.sweep();
        if removed > 0 {
            debug!(removed = removed, "Swept expired presence entries");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> PresenceTracker {
        PresenceTracker::start(Duration::from_millis(3_000), Duration::from_millis(1_000))
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_exactly_at_ttl() {
        let presence = tracker();
        presence.assert("general", "bob");

        tokio::time::advance(Duration::from_millis(2_999)).await;
        assert!(presence.active_actors("general", None).contains("bob"));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(presence.active_actors("general", None).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reassert_refreshes() {
        let presence = tracker();
        presence.assert("general", "bob");

        tokio::time::advance(Duration::from_millis(2_000)).await;
        presence.assert("general", "bob");

        tokio::time::advance(Duration::from_millis(2_000)).await;
        assert!(presence.active_actors("general", None).contains("bob"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_excludes_self_and_other_channels() {
        let presence = tracker();
        presence.assert("general", "me");
        presence.assert("general", "bob");
        presence.assert("random", "carol");

        let active = presence.active_actors("general", Some("me"));
        assert_eq!(active.into_iter().collect::<Vec<_>>(), vec!["bob"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retract_is_immediate() {
        let presence = tracker();
        presence.assert("general", "bob");
        assert!(presence.retract("general", "bob"));
        assert!(!presence.retract("general", "bob"));
        assert!(presence.active_actors("general", None).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_drops_expired_entries() {
        let presence = tracker();
        presence.assert("general", "bob");
        presence.assert("general", "carol");
        assert_eq!(presence.tracked_count(), 2);

        tokio::time::sleep(Duration::from_millis(4_100)).await;
        assert_eq!(presence.tracked_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_rejects_new_assertions() {
        let presence = tracker();
        presence.assert("general", "bob");
        presence.shutdown();
        presence.shutdown();

        assert!(presence.is_shut_down());
        assert!(presence.assert("general", "bob").is_none());
        assert_eq!(presence.tracked_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_tick_is_clamped_to_one_second() {
        let presence =
            PresenceTracker::start(Duration::from_millis(10_000), Duration::from_secs(60));
        tokio::time::sleep(Duration::from_millis(500)).await;
        presence.assert("general", "bob");

        // Expired at 10.5 s. A 10 s period would not sweep again until 20 s.
        tokio::time::sleep(Duration::from_millis(11_000)).await;
        assert_eq!(presence.tracked_count(), 0);
    }
}
