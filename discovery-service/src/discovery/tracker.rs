//! User tracker and membership maintainer.
//!
//! The tracker reconciles the provider's user list against the active-user
//! map on a fixed cadence. Its first pass runs in batch mode: every absent
//! user is registered synchronously and the fan-in is pulsed once, so a
//! tenant with thousands of users does not trigger thousands of rebuilds.
//! Later passes emit one membership event per user; the maintainer drains
//! those, starts or stops pollers, and pulses after each change.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::DiscoveryError;
use crate::models::User;

use super::poller::{self, PollerContext};
use super::{ActiveUsers, MembershipEvent, PollerHandle};

pub(crate) struct UserTracker {
    ctx: PollerContext,
    tenant_id: Uuid,
    users: Arc<ActiveUsers>,
    events: mpsc::UnboundedSender<MembershipEvent>,
    rescan_interval: Duration,
    shutdown: CancellationToken,
}

impl UserTracker {
    pub fn new(
        ctx: PollerContext,
        tenant_id: Uuid,
        users: Arc<ActiveUsers>,
        events: mpsc::UnboundedSender<MembershipEvent>,
        rescan_interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            tenant_id,
            users,
            events,
            rescan_interval,
            shutdown,
        }
    }

    pub async fn run(self) {
        // Initial reconciliation before the ticker starts.
        if let Err(err) = self.reconcile(true).await {
            log::error!("initial user reconciliation failed: {}", err);
        }

        let mut ticker = interval_at(
            Instant::now() + self.rescan_interval,
            self.rescan_interval,
        );
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(err) = self.reconcile(false).await {
                        log::error!("user reconciliation failed: {}", err);
                    }
                }
            }
        }
    }

    /// One reconciliation pass. Provider or user-listing failures abort the
    /// pass (the next tick retries); per-user store failures skip that user.
    async fn reconcile(&self, initial: bool) -> Result<(), DiscoveryError> {
        let provider_users = self.ctx.provider.get_users(self.tenant_id).await?;
        log::info!(
            "provider listed {} users for tenant {}",
            provider_users.len(),
            self.tenant_id
        );

        let known_users = self.ctx.store.all_users().await?;

        let mut listed: HashSet<Uuid> = HashSet::with_capacity(provider_users.len());
        let mut to_start: Vec<User> = Vec::new();

        for provider_user in &provider_users {
            listed.insert(provider_user.id);

            if let Err(err) = self.ctx.store.upsert_user(provider_user).await {
                log::error!("failed to upsert user {}: {}", provider_user.id, err);
                continue;
            }

            if self.users.contains(provider_user.id) {
                continue;
            }

            if initial {
                // Batch mode: collect for synchronous registration below.
                match self.ctx.store.user_by_id(provider_user.id).await {
                    Ok(user) => to_start.push(user),
                    Err(err) => log::error!(
                        "failed to load user {} for registration: {}",
                        provider_user.id,
                        err
                    ),
                }
            } else {
                let _ = self.events.send(MembershipEvent::Add(provider_user.id));
            }
        }

        if initial && !to_start.is_empty() {
            log::info!(
                "initial reconciliation: starting {} pollers, pulsing fan-in once",
                to_start.len()
            );
            for user in to_start {
                register_poller(&self.users, &self.ctx, user, &self.shutdown);
            }
            self.users.pulse();
        }

        // Users known to the store but gone from the provider stop polling.
        // Their rows are kept.
        for user in known_users {
            if !listed.contains(&user.id) && self.users.contains(user.id) {
                let _ = self.events.send(MembershipEvent::Remove(user.id));
            }
        }

        Ok(())
    }
}

/// Drain membership events, starting and stopping pollers. Each applied
/// change pulses the fan-in so the merged stream is rebuilt.
pub(crate) async fn run_membership_maintainer(
    users: Arc<ActiveUsers>,
    ctx: PollerContext,
    shutdown: CancellationToken,
    mut events: mpsc::UnboundedReceiver<MembershipEvent>,
) {
    log::info!("membership maintainer started, waiting for events");

    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => return,
            event = events.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };

        match event {
            MembershipEvent::Add(user_id) => {
                if users.contains(user_id) {
                    log::debug!("user {} already has an active poller", user_id);
                    continue;
                }
                match ctx.store.user_by_id(user_id).await {
                    Ok(user) => {
                        let email = user.email.clone();
                        register_poller(&users, &ctx, user, &shutdown);
                        users.pulse();
                        log::info!("started polling for user {} ({})", email, user_id);
                    }
                    Err(err) => {
                        log::error!("failed to load user {}: {}", user_id, err);
                    }
                }
            }
            MembershipEvent::Remove(user_id) => {
                if users.remove(user_id) {
                    users.pulse();
                    log::info!("stopped polling for user {}", user_id);
                } else {
                    log::debug!("user {} has no active poller", user_id);
                }
            }
        }
    }
}

/// Spawn a poller under a child of the root token and register its handle.
fn register_poller(
    users: &ActiveUsers,
    ctx: &PollerContext,
    user: User,
    shutdown: &CancellationToken,
) {
    let cancel = shutdown.child_token();
    let output = poller::spawn(ctx.clone(), user.clone(), cancel.clone());
    users.insert(PollerHandle {
        user,
        cancel,
        output: std::sync::Mutex::new(Some(output)),
    });
}
