//! HTTP client for the provider API.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

use crate::config::ProviderKind;
use crate::error::DiscoveryError;
use crate::models::{ProviderEmail, ProviderUser};

use super::Provider;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Provider client over the REST routes `/{segment}/users/{tenant}` and
/// `/{segment}/emails/{user}` where `{segment}` selects the backend.
pub struct HttpProvider {
    http: reqwest::Client,
    base_url: String,
    segment: &'static str,
}

impl HttpProvider {
    pub fn new(base_url: String, kind: ProviderKind) -> Result<Self, DiscoveryError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent("discovery-service/0.1")
            .build()
            .map_err(DiscoveryError::ProviderHttp)?;

        Ok(Self {
            http,
            base_url,
            segment: kind.segment(),
        })
    }

    fn url(&self, resource: &str, id: Uuid) -> String {
        format!(
            "{}/{}/{}/{}",
            self.base_url.trim_end_matches('/'),
            self.segment,
            resource,
            id
        )
    }
}

#[async_trait]
impl Provider for HttpProvider {
    async fn get_users(&self, tenant_id: Uuid) -> Result<Vec<ProviderUser>, DiscoveryError> {
        let response = self.http.get(self.url("users", tenant_id)).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(DiscoveryError::provider_status(status, body));
        }

        Ok(response.json().await?)
    }

    async fn get_emails(
        &self,
        user_id: Uuid,
        received_after: DateTime<Utc>,
        order_by: &str,
    ) -> Result<Vec<ProviderEmail>, DiscoveryError> {
        let response = self
            .http
            .get(self.url("emails", user_id))
            .query(&[
                (
                    "receivedAfter",
                    received_after.to_rfc3339_opts(SecondsFormat::Secs, true),
                ),
                ("orderBy", order_by.to_string()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(DiscoveryError::provider_status(status, body));
        }

        Ok(response.json().await?)
    }
}
