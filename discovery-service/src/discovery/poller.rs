//! Per-user email poller.
//!
//! Each active user gets one task that waits out a deterministic initial
//! delay, then polls the provider on a fixed cadence and pushes every
//! discovered email onto a bounded channel. A full channel blocks the send,
//! which is the backpressure path all the way up to the provider call.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::User;
use crate::provider::Provider;
use crate::store::Store;

use super::EmailWithUser;

/// Sort order requested from the provider on every poll.
const ORDER_BY_RECEIVED_AT: &str = "received_at";

/// How far back polls without history look on the first check.
const FIRST_CHECK_LOOKBACK_HOURS: i64 = 24;

/// Everything a poller needs besides the user itself.
#[derive(Clone)]
pub(crate) struct PollerContext {
    pub store: Store,
    pub provider: Arc<dyn Provider>,
    pub polling_interval: Duration,
    pub jitter_max: Duration,
    pub channel_buffer: usize,
}

/// Spawn the polling task for one user. The returned receiver closes when
/// the task exits, because the task owns the only sender.
pub(crate) fn spawn(
    ctx: PollerContext,
    user: User,
    cancel: CancellationToken,
) -> mpsc::Receiver<EmailWithUser> {
    let (tx, rx) = mpsc::channel(ctx.channel_buffer);
    tokio::spawn(run(ctx, user, cancel, tx));
    rx
}

async fn run(
    ctx: PollerContext,
    user: User,
    cancel: CancellationToken,
    tx: mpsc::Sender<EmailWithUser>,
) {
    // Staggered start so a fleet of pollers does not hit the provider in
    // phase. The delay is a pure function of the user id.
    let delay = initial_delay(user.id, ctx.jitter_max);
    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(delay) => {}
    }
    poll_once(&ctx, &user, &cancel, &tx).await;

    let mut ticker = interval_at(
        Instant::now() + ctx.polling_interval,
        ctx.polling_interval,
    );
    // A poll delayed by backpressure must not be followed by a burst of
    // catch-up polls.
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => poll_once(&ctx, &user, &cancel, &tx).await,
        }
    }
}

/// Deterministic stagger in `[0, jitter_max)`: the first 8 bytes of the user
/// id, big-endian, reduced modulo the jitter window. Same user, same delay.
pub fn initial_delay(user_id: Uuid, jitter_max: Duration) -> Duration {
    let jitter_nanos = jitter_max.as_nanos() as u64;
    if jitter_nanos == 0 {
        return Duration::ZERO;
    }

    let (seed, _) = user_id.as_u64_pair();
    Duration::from_nanos(seed % jitter_nanos)
}

/// Lower bound of the next fetch window, from the freshest stored state.
/// The 1-second back-off absorbs clock skew and sub-second duplicates;
/// dedup absorbs the re-offered boundary email.
fn received_after(user: &User, now: DateTime<Utc>) -> DateTime<Utc> {
    if let Some(last_received) = user.last_email_received {
        last_received - ChronoDuration::seconds(1)
    } else if let Some(last_check) = user.last_email_check {
        last_check - ChronoDuration::seconds(1)
    } else {
        now - ChronoDuration::hours(FIRST_CHECK_LOOKBACK_HOURS)
    }
}

async fn poll_once(
    ctx: &PollerContext,
    snapshot: &User,
    cancel: &CancellationToken,
    tx: &mpsc::Sender<EmailWithUser>,
) {
    // Re-read the user row so the window reflects what other workers stored
    // since the last tick. On failure, the construction-time snapshot is
    // still a valid (if stale) window.
    let user = match ctx.store.user_by_id(snapshot.id).await {
        Ok(fresh) => fresh,
        Err(err) => {
            log::error!("poller {}: failed to refresh user row: {}", snapshot.id, err);
            snapshot.clone()
        }
    };

    let received_after = received_after(&user, Utc::now());
    let emails = match ctx
        .provider
        .get_emails(user.id, received_after, ORDER_BY_RECEIVED_AT)
        .await
    {
        Ok(emails) => emails,
        Err(err) => {
            log::error!("poller {}: provider fetch failed: {}", user.id, err);
            return;
        }
    };

    for email in emails {
        let item = EmailWithUser {
            user_id: user.id,
            email,
        };
        // The send blocks while the channel is full; that is the intended
        // backpressure. Cancellation drops the remainder of the batch, which
        // the next poll re-fetches from stored state.
        tokio::select! {
            _ = cancel.cancelled() => return,
            sent = tx.send(item) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const JITTER: Duration = Duration::from_secs(30);

    #[test]
    fn test_initial_delay_is_deterministic() {
        let user_id = Uuid::new_v4();
        assert_eq!(initial_delay(user_id, JITTER), initial_delay(user_id, JITTER));
    }

    #[test]
    fn test_initial_delay_stays_in_jitter_window() {
        for _ in 0..1_000 {
            let delay = initial_delay(Uuid::new_v4(), JITTER);
            assert!(delay < JITTER, "delay {:?} outside [0, {:?})", delay, JITTER);
        }
    }

    #[test]
    fn test_initial_delays_spread_across_the_window() {
        // A thousand random users should land well spread over the window;
        // require every tenth of it to be hit.
        let mut buckets = [0usize; 10];
        for _ in 0..1_000 {
            let delay = initial_delay(Uuid::new_v4(), JITTER);
            let bucket = (delay.as_nanos() * 10 / JITTER.as_nanos()) as usize;
            buckets[bucket.min(9)] += 1;
        }
        assert!(
            buckets.iter().all(|&count| count > 0),
            "initial delays clustered: {:?}",
            buckets
        );
    }

    #[test]
    fn test_zero_jitter_window_means_no_delay() {
        assert_eq!(initial_delay(Uuid::new_v4(), Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn test_received_after_prefers_last_email_received() {
        let now = Utc::now();
        let received = now - ChronoDuration::minutes(5);
        let checked = now - ChronoDuration::minutes(1);
        let user = User {
            id: Uuid::new_v4(),
            email: "user@example.com".into(),
            last_email_check: Some(checked),
            last_email_received: Some(received),
        };

        assert_eq!(
            received_after(&user, now),
            received - ChronoDuration::seconds(1)
        );
    }

    #[test]
    fn test_received_after_falls_back_to_last_check() {
        let now = Utc::now();
        let checked = now - ChronoDuration::minutes(1);
        let user = User {
            id: Uuid::new_v4(),
            email: "user@example.com".into(),
            last_email_check: Some(checked),
            last_email_received: None,
        };

        assert_eq!(
            received_after(&user, now),
            checked - ChronoDuration::seconds(1)
        );
    }

    #[test]
    fn test_received_after_defaults_to_24h_lookback() {
        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4(),
            email: "user@example.com".into(),
            last_email_check: None,
            last_email_received: None,
        };

        assert_eq!(received_after(&user, now), now - ChronoDuration::hours(24));
    }

    #[tokio::test]
    async fn test_bounded_channel_applies_backpressure() {
        // A full per-user buffer refuses further sends until the consumer
        // drains; nothing is dropped.
        let (tx, mut rx) = mpsc::channel::<u32>(50);
        for n in 0..50 {
            tx.try_send(n).expect("buffer should hold 50 items");
        }
        assert!(tx.try_send(50).is_err(), "51st send should block");

        assert_eq!(rx.recv().await, Some(0));
        tx.try_send(50).expect("space after one recv");
    }
}
