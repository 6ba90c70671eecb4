//! Merged-stream consumer: persistence, deduplication, and the downstream
//! hand-off.
//!
//! The processor loop never does storage work itself. Each accepted item is
//! moved onto a short-lived worker registered with the storage wait-group,
//! and the loop immediately returns to the merged stream, so store latency
//! does not stall the fan-in beyond channel depth. The wait-group exists
//! solely so shutdown can drain in-flight writes.
//!
//! # Identity reconciliation
//!
//! An email has two identities: the provider's `message_id` (used as the
//! primary key when possible) and the SHA-256 `fingerprint` of its body
//! (unique on its own). The store step looks up by fingerprint first, then
//! inserts, and treats either conflict as "seen before": an id conflict
//! refreshes `received_at`, a fingerprint conflict adopts the winner's id.
//! The store's uniqueness constraints serialize concurrent inserters.

use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::error::DiscoveryError;
use crate::models::ProviderEmail;
use crate::store::{is_fingerprint_conflict, EmailInsert, Store};

use super::fanin::FanIn;
use super::metrics::DiscoveryMetrics;
use super::{ActiveUsers, EmailWithUser};

/// Hex-encoded SHA-256 of an email body: the content identity an email keeps
/// across users and re-deliveries.
pub fn fingerprint(body: &[u8]) -> String {
    format!("{:x}", Sha256::digest(body))
}

#[derive(Clone)]
pub struct Processor {
    store: Store,
    metrics: Arc<DiscoveryMetrics>,
    shutdown: CancellationToken,
    writers: TaskTracker,
}

/// What the consumer loop decided to do next; computed inside the select so
/// the merged stream borrow ends before state is touched.
enum Step {
    Shutdown,
    Rebuild,
    SourceClosed,
    Item(EmailWithUser),
}

impl Processor {
    pub fn new(
        store: Store,
        metrics: Arc<DiscoveryMetrics>,
        shutdown: CancellationToken,
        writers: TaskTracker,
    ) -> Self {
        Self {
            store,
            metrics,
            shutdown,
            writers,
        }
    }

    /// Consume the merged stream until shutdown, rebuilding it on every
    /// membership pulse. With no active channel the loop parks on the pulse
    /// rather than spinning.
    pub(crate) async fn run(&self, users: &ActiveUsers, pulses: &mut mpsc::Receiver<()>) {
        let mut current: Option<FanIn> = None;

        loop {
            let step = match current.as_mut() {
                None => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => Step::Shutdown,
                        pulse = pulses.recv() => match pulse {
                            Some(()) => Step::Rebuild,
                            None => Step::Shutdown,
                        },
                    }
                }
                Some(fanin) => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => Step::Shutdown,
                        pulse = pulses.recv() => match pulse {
                            Some(()) => Step::Rebuild,
                            None => Step::Shutdown,
                        },
                        item = fanin.recv() => match item {
                            Some(item) => Step::Item(item),
                            None => Step::SourceClosed,
                        },
                    }
                }
            };

            match step {
                Step::Shutdown => {
                    if let Some(fanin) = current.take() {
                        fanin.tear_down(users).await;
                    }
                    return;
                }
                Step::Rebuild | Step::SourceClosed => {
                    if let Some(fanin) = current.take() {
                        fanin.tear_down(users).await;
                    }
                    current = FanIn::build(users);
                    if current.is_none() {
                        log::info!("no active user channels, waiting for membership change");
                    }
                }
                Step::Item(item) => self.dispatch(item),
            }
        }
    }

    /// Hand one item to a storage worker and return to the stream. The
    /// worker holds a wait-group registration until it completes; a worker
    /// that observes cancellation before touching storage just releases it.
    pub(crate) fn dispatch(&self, item: EmailWithUser) {
        let processor = self.clone();
        self.writers.spawn(async move {
            if processor.shutdown.is_cancelled() {
                return;
            }
            processor.handle_item(item).await;
        });
    }

    /// Full per-item protocol: store step, downstream hand-off, timestamp
    /// updates. The three storage operations are independent; a failure is
    /// logged and the rest still run, because every statement is conditional
    /// or idempotent and the next poll re-offers anything missed.
    pub async fn handle_item(&self, item: EmailWithUser) {
        let user_id = item.user_id;
        let received_at = item.email.received_at;

        let is_new = match self.store_email(&item.email, user_id).await {
            Ok(is_new) => is_new,
            Err(err) => {
                log::error!(
                    "failed to store email {} for user {}: {}",
                    item.email.message_id,
                    user_id,
                    err
                );
                false
            }
        };

        if is_new {
            self.send_to_analysis_queue(&item.email);
        }

        if let Err(err) = self.store.touch_last_email_check(user_id, Utc::now()).await {
            log::error!("failed to update last_email_check for {}: {}", user_id, err);
        }

        if is_new {
            if let Err(err) = self
                .store
                .raise_last_email_received(user_id, received_at)
                .await
            {
                log::error!(
                    "failed to update last_email_received for {}: {}",
                    user_id,
                    err
                );
            }
        }
    }

    /// Store one email's metadata and link it to its recipient. Returns
    /// whether this sighting created a new unique email.
    async fn store_email(
        &self,
        email: &ProviderEmail,
        user_id: Uuid,
    ) -> Result<bool, DiscoveryError> {
        let message_id = Uuid::parse_str(&email.message_id).map_err(|source| {
            DiscoveryError::MalformedMessageId {
                value: email.message_id.clone(),
                source,
            }
        })?;
        let fingerprint = fingerprint(email.body.as_bytes());

        let (canonical_id, is_new) = match self.store.email_id_by_fingerprint(&fingerprint).await? {
            // Content already known: adopt the canonical row.
            Some(existing) => (existing, false),
            None => match self
                .store
                .insert_email(message_id, &fingerprint, email.received_at)
                .await
            {
                Ok(EmailInsert::Inserted) => (message_id, true),
                Ok(EmailInsert::IdConflictUpdated) => (message_id, false),
                // Lost the race: a concurrent worker inserted this content
                // first. Adopt the winner's id.
                Err(err) if is_fingerprint_conflict(&err) => {
                    match self.store.email_id_by_fingerprint(&fingerprint).await? {
                        Some(existing) => (existing, false),
                        None => return Err(err.into()),
                    }
                }
                Err(err) => return Err(err.into()),
            },
        };

        if is_new {
            self.metrics.record_discovered(user_id);
        }

        self.store.link_user_email(user_id, canonical_id).await?;

        Ok(is_new)
    }

    /// Hand-off point for the fraud-analysis queue. Fire-and-forget; today
    /// only the counter moves.
    fn send_to_analysis_queue(&self, _email: &ProviderEmail) {
        self.metrics.record_queued();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_hex_sha256_of_body() {
        assert_eq!(
            fingerprint(b"hi"),
            "8f434346648f6b96df89dda901c5176b10a6d83961dd3c1ac88b59b2dc327aa4"
        );
    }

    #[test]
    fn test_fingerprint_is_stable_and_body_sensitive() {
        assert_eq!(fingerprint(b"z"), fingerprint(b"z"));
        assert_ne!(fingerprint(b"z"), fingerprint(b"Z"));
        assert_eq!(fingerprint(b"").len(), 64);
    }
}
