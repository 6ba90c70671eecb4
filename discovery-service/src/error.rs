use reqwest::StatusCode;
use thiserror::Error;

/// Errors surfaced by the discovery pipeline.
///
/// Most of these are handled where they occur (logged, then retried on the
/// next tick); none propagate past the task that owns the failing resource.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("provider HTTP error: {0}")]
    ProviderHttp(#[from] reqwest::Error),
    #[error("provider returned status {status}: {body}")]
    ProviderStatus { status: StatusCode, body: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("invalid message_id {value:?}: {source}")]
    MalformedMessageId { value: String, source: uuid::Error },
    #[error("configuration error: {0}")]
    Config(String),
}

impl DiscoveryError {
    pub fn provider_status(status: StatusCode, body: String) -> Self {
        DiscoveryError::ProviderStatus { status, body }
    }
}
