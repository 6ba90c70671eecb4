//! Dynamic fan-in over the active pollers' channels.
//!
//! A build snapshots the endpoints currently parked in the active-user map
//! and spawns one forwarder task per endpoint, all feeding an unbuffered
//! merged channel. Membership changes never mutate a live merge: the
//! consumer tears the build down and constructs a fresh one, which keeps the
//! invariants trivial at the cost of re-polling the occasional in-flight
//! item.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{ActiveUsers, EmailWithUser};

type ReclaimedSource = Option<(Uuid, mpsc::Receiver<EmailWithUser>)>;

/// One generation of the merged stream.
pub(crate) struct FanIn {
    output: mpsc::Receiver<EmailWithUser>,
    /// Cancels this generation's forwarders only; pollers are untouched.
    epoch: CancellationToken,
    forwarders: Vec<JoinHandle<ReclaimedSource>>,
}

impl FanIn {
    /// Snapshot the map's endpoints and start a merged stream over them.
    /// `None` when no endpoint is available, in which case the consumer must
    /// wait for a membership pulse rather than spin.
    pub fn build(users: &ActiveUsers) -> Option<Self> {
        let sources = users.take_outputs();
        if sources.is_empty() {
            return None;
        }

        log::info!("rebuilding fan-in over {} user channels", sources.len());

        // Capacity 1 keeps the merge effectively unbuffered: a slow consumer
        // blocks forwarders, which backs up into the per-user buffers and
        // from there into the pollers' sends.
        let (tx, output) = mpsc::channel(1);
        let epoch = CancellationToken::new();
        let forwarders = sources
            .into_iter()
            .map(|(user_id, source)| {
                tokio::spawn(forward(user_id, source, tx.clone(), epoch.clone()))
            })
            .collect();

        // The local sender drops here, so the merged output closes exactly
        // when every forwarder has completed.
        Some(Self {
            output,
            epoch,
            forwarders,
        })
    }

    /// Next merged item; `None` once every forwarder has completed.
    pub async fn recv(&mut self) -> Option<EmailWithUser> {
        self.output.recv().await
    }

    /// Stop this generation and park surviving endpoints back in the map so
    /// the next build can capture them.
    pub async fn tear_down(self, users: &ActiveUsers) {
        self.epoch.cancel();
        drop(self.output);

        for forwarder in self.forwarders {
            match forwarder.await {
                Ok(Some((user_id, source))) => users.restore_output(user_id, source),
                // Source exhausted: its poller is gone for good.
                Ok(None) => {}
                Err(err) => log::error!("fan-in forwarder failed: {}", err),
            }
        }
    }
}

/// Pump one per-user channel into the merged output until the generation is
/// cancelled or the source closes. An item already taken off the source when
/// cancellation lands is dropped; the affected user's next poll re-offers it
/// because the receive window is recomputed from stored state.
async fn forward(
    user_id: Uuid,
    mut source: mpsc::Receiver<EmailWithUser>,
    tx: mpsc::Sender<EmailWithUser>,
    epoch: CancellationToken,
) -> ReclaimedSource {
    loop {
        let item = tokio::select! {
            _ = epoch.cancelled() => return Some((user_id, source)),
            item = source.recv() => match item {
                Some(item) => item,
                None => return None,
            },
        };

        tokio::select! {
            _ = epoch.cancelled() => return Some((user_id, source)),
            sent = tx.send(item) => {
                if sent.is_err() {
                    return Some((user_id, source));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use chrono::Utc;

    use crate::models::{ProviderEmail, User};

    use super::super::PollerHandle;
    use super::*;

    fn item_for(user_id: Uuid, body: &str) -> EmailWithUser {
        EmailWithUser {
            user_id,
            email: ProviderEmail {
                message_id: Uuid::new_v4().to_string(),
                user_id,
                from: "sender@example.com".into(),
                to: "user@example.com".into(),
                subject: "subject".into(),
                snippet: "snippet".into(),
                received_at: Utc::now(),
                body: body.into(),
            },
        }
    }

    fn register(users: &ActiveUsers, buffer: usize) -> (Uuid, mpsc::Sender<EmailWithUser>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(buffer);
        users.insert(PollerHandle {
            user: User {
                id,
                email: format!("{}@example.com", id.simple()),
                last_email_check: None,
                last_email_received: None,
            },
            cancel: CancellationToken::new(),
            output: Mutex::new(Some(rx)),
        });
        (id, tx)
    }

    #[test]
    fn test_build_with_no_sources_returns_none() {
        let (users, _pulses) = ActiveUsers::new();
        assert!(FanIn::build(&users).is_none());
    }

    #[tokio::test]
    async fn test_merges_items_from_all_sources() {
        let (users, _pulses) = ActiveUsers::new();
        let (id_a, tx_a) = register(&users, 4);
        let (id_b, tx_b) = register(&users, 4);

        let mut fanin = FanIn::build(&users).expect("two sources available");

        tx_a.send(item_for(id_a, "from a")).await.unwrap();
        tx_b.send(item_for(id_b, "from b")).await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..2 {
            let item = tokio::time::timeout(Duration::from_secs(1), fanin.recv())
                .await
                .expect("merged item arrives")
                .expect("stream open");
            seen.push(item.user_id);
        }
        seen.sort();
        let mut expected = vec![id_a, id_b];
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn test_single_source_degenerates_to_that_channel() {
        let (users, _pulses) = ActiveUsers::new();
        let (id, tx) = register(&users, 4);
        let mut fanin = FanIn::build(&users).expect("one source available");

        for body in ["one", "two", "three"] {
            tx.send(item_for(id, body)).await.unwrap();
        }
        for expected in ["one", "two", "three"] {
            let item = tokio::time::timeout(Duration::from_secs(1), fanin.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(item.email.body, expected);
        }
    }

    #[tokio::test]
    async fn test_output_closes_when_all_sources_close() {
        let (users, _pulses) = ActiveUsers::new();
        let (id, tx) = register(&users, 4);
        let mut fanin = FanIn::build(&users).expect("source available");

        tx.send(item_for(id, "last")).await.unwrap();
        drop(tx);

        assert!(fanin.recv().await.is_some());
        assert!(
            tokio::time::timeout(Duration::from_secs(1), fanin.recv())
                .await
                .expect("close is observed")
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_tear_down_parks_endpoints_for_the_next_build() {
        let (users, _pulses) = ActiveUsers::new();
        let (id, tx) = register(&users, 4);

        let fanin = FanIn::build(&users).expect("source available");
        fanin.tear_down(&users).await;

        // The endpoint is back, so a second generation can capture it and
        // still deliver items produced before the rebuild.
        tx.send(item_for(id, "survives rebuild")).await.unwrap();
        let mut fanin = FanIn::build(&users).expect("endpoint was restored");
        let item = tokio::time::timeout(Duration::from_secs(1), fanin.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.email.body, "survives rebuild");
    }

    #[tokio::test]
    async fn test_exhausted_source_is_not_restored() {
        let (users, _pulses) = ActiveUsers::new();
        let (_, tx) = register(&users, 4);

        let mut fanin = FanIn::build(&users).expect("source available");
        drop(tx);
        assert!(fanin.recv().await.is_none());
        fanin.tear_down(&users).await;

        assert!(FanIn::build(&users).is_none());
    }
}
