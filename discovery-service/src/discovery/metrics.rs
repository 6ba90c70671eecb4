//! Discovery counters and the periodic summary reporter.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::ActiveUsers;

const REPORT_BASE_INTERVAL_MS: i64 = 5_000;
/// The report cadence is jittered by up to this much in either direction so
/// the summary does not land in phase with the other periodic tasks' logs.
const REPORT_JITTER_MS: i64 = 1_000;
const TOP_USER_COUNT: usize = 3;

/// Process-lifetime counters. Per-user counts move only when a new unique
/// email is first stored; re-sightings and re-links never count.
pub struct DiscoveryMetrics {
    emails_discovered: AtomicI64,
    emails_to_queue: AtomicI64,
    per_user: DashMap<Uuid, AtomicI64>,
}

impl DiscoveryMetrics {
    pub fn new() -> Self {
        Self {
            emails_discovered: AtomicI64::new(0),
            emails_to_queue: AtomicI64::new(0),
            per_user: DashMap::new(),
        }
    }

    /// Count a first-time store of a unique email for `user_id`.
    pub fn record_discovered(&self, user_id: Uuid) {
        self.emails_discovered.fetch_add(1, Ordering::Relaxed);
        self.per_user
            .entry(user_id)
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Count a downstream hand-off.
    pub fn record_queued(&self) {
        self.emails_to_queue.fetch_add(1, Ordering::Relaxed);
    }

    pub fn emails_discovered(&self) -> i64 {
        self.emails_discovered.load(Ordering::Relaxed)
    }

    pub fn emails_to_queue(&self) -> i64 {
        self.emails_to_queue.load(Ordering::Relaxed)
    }

    pub fn discovered_for(&self, user_id: Uuid) -> i64 {
        self.per_user
            .get(&user_id)
            .map(|counter| counter.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// The `n` users with the highest discovered counts, descending.
    pub fn top_users(&self, n: usize) -> Vec<(Uuid, i64)> {
        let mut counts: Vec<(Uuid, i64)> = self
            .per_user
            .iter()
            .map(|entry| (*entry.key(), entry.load(Ordering::Relaxed)))
            .filter(|(_, count)| *count > 0)
            .collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1));
        counts.truncate(n);
        counts
    }
}

impl Default for DiscoveryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Emit a counter summary every ~5 s until cancelled.
pub(crate) async fn run_reporter(
    metrics: Arc<DiscoveryMetrics>,
    users: Arc<ActiveUsers>,
    shutdown: CancellationToken,
) {
    loop {
        let interval = {
            let mut rng = rand::thread_rng();
            let jitter = rng.gen_range(-REPORT_JITTER_MS..=REPORT_JITTER_MS);
            Duration::from_millis((REPORT_BASE_INTERVAL_MS + jitter) as u64)
        };

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(interval) => report(&metrics, &users),
        }
    }
}

fn report(metrics: &DiscoveryMetrics, users: &ActiveUsers) {
    log::info!(
        "metrics | discovered: {} | queued: {} | active users: {}",
        metrics.emails_discovered(),
        metrics.emails_to_queue(),
        users.len()
    );

    for (rank, (user_id, count)) in metrics.top_users(TOP_USER_COUNT).into_iter().enumerate() {
        // Users without an active poller are omitted from the breakdown.
        if let Some(email) = users.email_of(user_id) {
            log::info!("  {}. {:<50} {} emails", rank + 1, email, count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = DiscoveryMetrics::new();
        let user = Uuid::new_v4();

        metrics.record_discovered(user);
        metrics.record_discovered(user);
        metrics.record_queued();

        assert_eq!(metrics.emails_discovered(), 2);
        assert_eq!(metrics.emails_to_queue(), 1);
        assert_eq!(metrics.discovered_for(user), 2);
        assert_eq!(metrics.discovered_for(Uuid::new_v4()), 0);
    }

    #[test]
    fn test_top_users_sorted_and_truncated() {
        let metrics = DiscoveryMetrics::new();
        let busy = Uuid::new_v4();
        let medium = Uuid::new_v4();
        let quiet = Uuid::new_v4();
        let silent = Uuid::new_v4();

        for _ in 0..5 {
            metrics.record_discovered(busy);
        }
        for _ in 0..3 {
            metrics.record_discovered(medium);
        }
        metrics.record_discovered(quiet);
        let _ = silent;

        let top = metrics.top_users(3);
        assert_eq!(top, vec![(busy, 5), (medium, 3), (quiet, 1)]);

        let top_two = metrics.top_users(2);
        assert_eq!(top_two, vec![(busy, 5), (medium, 3)]);
    }
}
