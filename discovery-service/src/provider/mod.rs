//! Provider gateway: the external source of tenant users and their emails.

mod http;
mod mock;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::{DiscoveryConfig, ProviderKind};
use crate::error::DiscoveryError;
use crate::models::{ProviderEmail, ProviderUser};

pub use http::HttpProvider;
pub use mock::MockProvider;

/// Number of users the in-process mock is seeded with for dev runs.
const MOCK_SEED_USERS: usize = 100;

/// Read-only view of an email provider (Google, Microsoft, or the mock).
#[async_trait]
pub trait Provider: Send + Sync {
    /// All users of the tenant.
    async fn get_users(&self, tenant_id: Uuid) -> Result<Vec<ProviderUser>, DiscoveryError>;

    /// Emails for one user with `received_at >= received_after`, ordered by
    /// `order_by` (`"received_at"` for ascending receive time).
    async fn get_emails(
        &self,
        user_id: Uuid,
        received_after: DateTime<Utc>,
        order_by: &str,
    ) -> Result<Vec<ProviderEmail>, DiscoveryError>;
}

/// Build the provider selected by the configuration.
pub fn from_config(config: &DiscoveryConfig) -> Result<Arc<dyn Provider>, DiscoveryError> {
    match config.provider_kind {
        ProviderKind::Google | ProviderKind::Microsoft => Ok(Arc::new(HttpProvider::new(
            config.provider_api_url.clone(),
            config.provider_kind,
        )?)),
        ProviderKind::Mock => Ok(Arc::new(
            MockProvider::seeded(config.tenant_id, MOCK_SEED_USERS).with_synthesis(),
        )),
    }
}
