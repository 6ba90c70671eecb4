//! Discovery engine: the concurrency fabric of the service.
//!
//! The engine tracks the live set of tenant users, runs one polling task per
//! user, merges every poller's output into a single processing pipeline with
//! natural backpressure, deduplicates emails by content fingerprint, and
//! shuts down with a bounded drain of in-flight storage work.
//!
//! # Task layout
//!
//! - **User tracker** ([`tracker`]): reconciles the provider's user list with
//!   the active-user map once a minute and emits membership events.
//! - **Membership maintainer** ([`tracker`]): drains membership events,
//!   starting and stopping pollers and pulsing the fan-in.
//! - **Per-user pollers** ([`poller`]): one task per active user, each with a
//!   deterministic staggered start and a bounded output channel.
//! - **Dynamic fan-in** ([`fanin`]): merges the active pollers' channels into
//!   one stream, rebuilt on every membership pulse.
//! - **Processor** ([`processor`]): consumes the merged stream, persisting
//!   and deduplicating each item on a short-lived storage worker.
//! - **Metrics reporter** ([`metrics`]): jittered periodic counter summary.
//!
//! # Shutdown
//!
//! All tasks observe one root [`CancellationToken`]. Shutdown cancels it and
//! then waits (bounded) for the [`TaskTracker`] of outstanding storage
//! workers; pollers and forwarders stop at their next suspension point, and
//! in-flight provider calls are not awaited.

pub mod fanin;
pub mod metrics;
pub mod poller;
pub mod processor;
pub mod tracker;

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use dashmap::DashMap;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::config::DiscoveryConfig;
use crate::models::{ProviderEmail, User};
use crate::provider::Provider;
use crate::store::Store;

use metrics::DiscoveryMetrics;
use poller::PollerContext;
use processor::Processor;
use tracker::UserTracker;

/// One discovered email paired with the user whose mailbox produced it.
#[derive(Debug, Clone)]
pub struct EmailWithUser {
    pub email: ProviderEmail,
    pub user_id: Uuid,
}

/// Membership change emitted by the user tracker after the initial pass.
#[derive(Debug, Clone, Copy)]
pub(crate) enum MembershipEvent {
    Add(Uuid),
    Remove(Uuid),
}

/// A running poller's registration in the active-user map.
pub(crate) struct PollerHandle {
    pub user: User,
    /// Child of the root token; cancelling stops just this poller.
    pub cancel: CancellationToken,
    /// The poller's output endpoint. The fan-in builder takes it for the
    /// lifetime of one merged stream and returns it on teardown.
    pub output: Mutex<Option<mpsc::Receiver<EmailWithUser>>>,
}

/// Active-user map plus the membership-change pulse.
///
/// Mutated by the tracker/maintainer, read by the fan-in builder and the
/// metrics reporter. Per-key operations are serialized by the map; no global
/// lock exists.
pub(crate) struct ActiveUsers {
    map: DashMap<Uuid, PollerHandle>,
    /// Pulse endpoint; capacity 1, so pending pulses coalesce.
    rebuild: mpsc::Sender<()>,
}

impl ActiveUsers {
    /// Build the map together with the pulse receiver the processor listens
    /// on for fan-in rebuilds.
    pub fn new() -> (Self, mpsc::Receiver<()>) {
        let (rebuild, pulses) = mpsc::channel(1);
        (
            Self {
                map: DashMap::new(),
                rebuild,
            },
            pulses,
        )
    }

    pub fn contains(&self, user_id: Uuid) -> bool {
        self.map.contains_key(&user_id)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn insert(&self, handle: PollerHandle) {
        self.map.insert(handle.user.id, handle);
    }

    /// Cancel and unregister a poller. Returns whether it was active.
    pub fn remove(&self, user_id: Uuid) -> bool {
        match self.map.remove(&user_id) {
            Some((_, handle)) => {
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Signal that membership changed and the fan-in should rebuild. At most
    /// one pulse is ever pending; later pulses coalesce, which is fine
    /// because the next rebuild snapshots the final state anyway.
    pub fn pulse(&self) {
        let _ = self.rebuild.try_send(());
    }

    /// Capture every currently-parked output endpoint for a fan-in build.
    pub fn take_outputs(&self) -> Vec<(Uuid, mpsc::Receiver<EmailWithUser>)> {
        let mut outputs = Vec::with_capacity(self.map.len());
        for entry in self.map.iter() {
            if let Some(rx) = entry.output.lock().expect("poller output lock").take() {
                outputs.push((*entry.key(), rx));
            }
        }
        outputs
    }

    /// Park an output endpoint again after a fan-in teardown. Dropped when
    /// the user was removed in the meantime.
    pub fn restore_output(&self, user_id: Uuid, rx: mpsc::Receiver<EmailWithUser>) {
        if let Some(handle) = self.map.get(&user_id) {
            *handle.output.lock().expect("poller output lock") = Some(rx);
        }
    }

    /// Address of an active user, for metrics display.
    pub fn email_of(&self, user_id: Uuid) -> Option<String> {
        self.map.get(&user_id).map(|h| h.user.email.clone())
    }
}

/// Lifecycle controller and owner of the engine's shared state.
pub struct DiscoveryService {
    store: Store,
    provider: Arc<dyn Provider>,
    config: DiscoveryConfig,
    users: Arc<ActiveUsers>,
    /// Pulse receiver, handed to the processing loop when `run` starts.
    pulses: Mutex<Option<mpsc::Receiver<()>>>,
    metrics: Arc<DiscoveryMetrics>,
    shutdown: CancellationToken,
    writers: TaskTracker,
}

impl DiscoveryService {
    pub fn new(pool: PgPool, provider: Arc<dyn Provider>, config: DiscoveryConfig) -> Self {
        let (users, pulses) = ActiveUsers::new();
        Self {
            store: Store::new(pool),
            provider,
            config,
            users: Arc::new(users),
            pulses: Mutex::new(Some(pulses)),
            metrics: Arc::new(DiscoveryMetrics::new()),
            shutdown: CancellationToken::new(),
            writers: TaskTracker::new(),
        }
    }

    pub fn metrics(&self) -> Arc<DiscoveryMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Number of users with a running poller.
    pub fn active_user_count(&self) -> usize {
        self.users.len()
    }

    /// Run the engine until the root token is cancelled. Spawns the tracker,
    /// membership maintainer, and metrics reporter, then drives the
    /// processing loop on the calling task.
    pub async fn run(&self) {
        let Some(mut pulses) = self.pulses.lock().expect("pulse receiver lock").take() else {
            log::error!("discovery service run() called more than once");
            return;
        };

        log::info!(
            "starting discovery service for tenant {}",
            self.config.tenant_id
        );

        let ctx = PollerContext {
            store: self.store.clone(),
            provider: Arc::clone(&self.provider),
            polling_interval: self.config.polling_interval,
            jitter_max: self.config.polling_jitter_max,
            channel_buffer: self.config.channel_buffer,
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel::<MembershipEvent>();

        tokio::spawn(tracker::run_membership_maintainer(
            Arc::clone(&self.users),
            ctx.clone(),
            self.shutdown.clone(),
            events_rx,
        ));

        let user_tracker = UserTracker::new(
            ctx.clone(),
            self.config.tenant_id,
            Arc::clone(&self.users),
            events_tx,
            self.config.user_rescan_interval,
            self.shutdown.clone(),
        );
        tokio::spawn(user_tracker.run());

        tokio::spawn(metrics::run_reporter(
            Arc::clone(&self.metrics),
            Arc::clone(&self.users),
            self.shutdown.clone(),
        ));

        let processor = Processor::new(
            self.store.clone(),
            Arc::clone(&self.metrics),
            self.shutdown.clone(),
            self.writers.clone(),
        );
        processor.run(&self.users, &mut pulses).await;
    }

    /// Cancel everything and wait up to `timeout` for outstanding storage
    /// workers to drain. Returns whether the drain completed in time.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        log::info!(
            "shutting down discovery service, waiting up to {:?} for storage workers",
            timeout
        );
        self.shutdown.cancel();

        let drained = await_writers(&self.writers, timeout).await;
        if drained {
            log::info!("all storage workers completed");
        } else {
            log::warn!(
                "shutdown timeout ({:?}) reached with storage workers still in flight",
                timeout
            );
        }
        drained
    }
}

/// Bounded wait for the storage-worker wait-group.
async fn await_writers(writers: &TaskTracker, timeout: Duration) -> bool {
    writers.close();
    tokio::time::timeout(timeout, writers.wait()).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_user(id: Uuid) -> User {
        User {
            id,
            email: format!("{}@example.com", id.simple()),
            last_email_check: None,
            last_email_received: None,
        }
    }

    fn handle_for(id: Uuid, rx: mpsc::Receiver<EmailWithUser>) -> PollerHandle {
        PollerHandle {
            user: test_user(id),
            cancel: CancellationToken::new(),
            output: Mutex::new(Some(rx)),
        }
    }

    #[test]
    fn test_remove_cancels_poller_token() {
        let (users, _pulses) = ActiveUsers::new();
        let id = Uuid::new_v4();
        let (_tx, rx) = mpsc::channel(1);
        let handle = handle_for(id, rx);
        let token = handle.cancel.clone();
        users.insert(handle);

        assert!(users.contains(id));
        assert!(!token.is_cancelled());
        assert!(users.remove(id));
        assert!(token.is_cancelled());
        assert!(!users.remove(id));
    }

    #[test]
    fn test_take_and_restore_outputs() {
        let (users, _pulses) = ActiveUsers::new();
        let id = Uuid::new_v4();
        let (_tx, rx) = mpsc::channel(1);
        users.insert(handle_for(id, rx));

        let outputs = users.take_outputs();
        assert_eq!(outputs.len(), 1);
        // Slot is empty until the endpoint is returned.
        assert!(users.take_outputs().is_empty());

        let (user_id, rx) = outputs.into_iter().next().unwrap();
        users.restore_output(user_id, rx);
        assert_eq!(users.take_outputs().len(), 1);
    }

    #[tokio::test]
    async fn test_pulses_are_retained_and_coalesced() {
        let (users, mut pulses) = ActiveUsers::new();
        users.pulse();
        users.pulse(); // coalesces with the first

        // The pending pulse completes an observer that subscribes later, and
        // exactly one pulse is pending.
        tokio::time::timeout(Duration::from_secs(1), pulses.recv())
            .await
            .expect("pulse should be pending")
            .expect("pulse channel open");
        assert!(pulses.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_await_writers_drains_fast_workers() {
        let writers = TaskTracker::new();
        for _ in 0..3 {
            writers.spawn(async {
                tokio::time::sleep(Duration::from_millis(20)).await;
            });
        }
        assert!(await_writers(&writers, Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_await_writers_times_out_on_slow_worker() {
        let writers = TaskTracker::new();
        writers.spawn(async {
            tokio::time::sleep(Duration::from_secs(30)).await;
        });
        assert!(!await_writers(&writers, Duration::from_millis(50)).await);
    }
}
