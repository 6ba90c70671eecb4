//! Runtime configuration loaded from environment variables.
//!
//! The control surface is intentionally small: a tenant id, a provider
//! selection, and the timing knobs of the polling fabric. Everything has a
//! compiled-in default except the tenant id and the database URL.

use std::time::Duration;

use uuid::Uuid;

use crate::error::DiscoveryError;

/// Fixed cadence of every per-user poller.
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(30);
/// Cadence of the user tracker's reconciliation ticks.
pub const DEFAULT_USER_RESCAN_INTERVAL: Duration = Duration::from_secs(60);
/// Upper bound of the deterministic initial-poll stagger.
pub const DEFAULT_POLLING_JITTER_MAX: Duration = Duration::from_secs(30);
/// Capacity of each per-user output channel.
pub const DEFAULT_CHANNEL_BUFFER: usize = 50;
/// How long shutdown waits for in-flight storage workers to drain.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Which provider backend to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Google,
    Microsoft,
    /// In-process mock, for development and tests.
    Mock,
}

impl ProviderKind {
    fn parse(value: &str) -> Result<Self, DiscoveryError> {
        match value {
            "google" => Ok(ProviderKind::Google),
            "microsoft" => Ok(ProviderKind::Microsoft),
            "mock" => Ok(ProviderKind::Mock),
            other => Err(DiscoveryError::Config(format!(
                "unknown provider kind {:?} (expected google, microsoft, or mock)",
                other
            ))),
        }
    }

    /// URL path segment used by the HTTP provider routes.
    pub fn segment(&self) -> &'static str {
        match self {
            ProviderKind::Google => "google",
            ProviderKind::Microsoft => "microsoft",
            ProviderKind::Mock => "mock",
        }
    }
}

/// Discovery service configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Tenant whose users are observed. One tenant per running instance.
    pub tenant_id: Uuid,
    pub provider_kind: ProviderKind,
    pub provider_api_url: String,
    pub polling_interval: Duration,
    pub user_rescan_interval: Duration,
    pub polling_jitter_max: Duration,
    pub channel_buffer: usize,
    pub shutdown_timeout: Duration,
}

impl DiscoveryConfig {
    /// Load configuration from `DISCOVERY_*` environment variables.
    /// `DISCOVERY_TENANT_ID` is required; everything else has a default.
    pub fn from_env() -> Result<Self, DiscoveryError> {
        let tenant_id = std::env::var("DISCOVERY_TENANT_ID")
            .map_err(|_| DiscoveryError::Config("DISCOVERY_TENANT_ID is required".into()))?;
        let tenant_id = Uuid::parse_str(&tenant_id).map_err(|err| {
            DiscoveryError::Config(format!("DISCOVERY_TENANT_ID is not a UUID: {}", err))
        })?;

        let provider_kind = match std::env::var("DISCOVERY_PROVIDER") {
            Ok(value) => ProviderKind::parse(&value)?,
            Err(_) => ProviderKind::Google,
        };
        let provider_api_url = std::env::var("DISCOVERY_PROVIDER_API_URL")
            .unwrap_or_else(|_| "http://localhost:8080".into());

        Ok(Self {
            tenant_id,
            provider_kind,
            provider_api_url,
            polling_interval: duration_from_env(
                "DISCOVERY_POLLING_INTERVAL_SECS",
                DEFAULT_POLLING_INTERVAL,
            ),
            user_rescan_interval: duration_from_env(
                "DISCOVERY_USER_RESCAN_INTERVAL_SECS",
                DEFAULT_USER_RESCAN_INTERVAL,
            ),
            polling_jitter_max: duration_from_env(
                "DISCOVERY_POLLING_JITTER_MAX_SECS",
                DEFAULT_POLLING_JITTER_MAX,
            ),
            channel_buffer: std::env::var("DISCOVERY_CHANNEL_BUFFER")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(DEFAULT_CHANNEL_BUFFER),
            shutdown_timeout: duration_from_env(
                "DISCOVERY_SHUTDOWN_TIMEOUT_SECS",
                DEFAULT_SHUTDOWN_TIMEOUT,
            ),
        })
    }

    /// Config for tests: mock provider, tight timing, defaults elsewhere.
    pub fn for_tests(tenant_id: Uuid) -> Self {
        Self {
            tenant_id,
            provider_kind: ProviderKind::Mock,
            provider_api_url: String::new(),
            polling_interval: Duration::from_millis(100),
            user_rescan_interval: Duration::from_millis(200),
            polling_jitter_max: Duration::from_millis(1),
            channel_buffer: DEFAULT_CHANNEL_BUFFER,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

fn duration_from_env(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_kind_parse() {
        assert_eq!(ProviderKind::parse("google").unwrap(), ProviderKind::Google);
        assert_eq!(
            ProviderKind::parse("microsoft").unwrap(),
            ProviderKind::Microsoft
        );
        assert_eq!(ProviderKind::parse("mock").unwrap(), ProviderKind::Mock);
        assert!(ProviderKind::parse("imap").is_err());
    }

    #[test]
    fn test_defaults_line_up_with_polling_contract() {
        assert_eq!(DEFAULT_POLLING_INTERVAL, Duration::from_secs(30));
        assert_eq!(DEFAULT_POLLING_JITTER_MAX, Duration::from_secs(30));
        assert_eq!(DEFAULT_CHANNEL_BUFFER, 50);
    }
}
