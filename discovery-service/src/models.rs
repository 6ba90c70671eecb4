//! Data types shared across the discovery pipeline.
//!
//! Provider types mirror the wire format of the provider API; database types
//! mirror the rows created by the migrations. Email bodies only exist on the
//! provider types: the store keeps metadata plus a content fingerprint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Tenant user tracked by the service.
#[derive(Debug, Clone, FromRow)]
pub struct User {
    /// Database identifier (provider user id on first sighting).
    pub id: Uuid,
    /// Unique address; the upsert conflict target.
    pub email: String,
    /// When the most recent poll finished storing a record for this user.
    pub last_email_check: Option<DateTime<Utc>>,
    /// Receive time of the most recent newly-stored email for this user.
    pub last_email_received: Option<DateTime<Utc>>,
}

/// Unique email metadata row. Identified primarily by `id` (the provider
/// message id) with `fingerprint` as the separately-unique content identity.
#[derive(Debug, Clone, FromRow)]
pub struct Email {
    pub id: Uuid,
    /// Hex-encoded SHA-256 of the email body.
    pub fingerprint: String,
    /// Receive time of the most recent sighting.
    pub received_at: DateTime<Utc>,
}

/// Link between a user and a unique email they received.
#[derive(Debug, Clone, FromRow)]
pub struct UserEmail {
    pub user_id: Uuid,
    pub email_id: Uuid,
}

/// User record as returned by the provider API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderUser {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub tenant_id: Uuid,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Email as returned by the provider API. The body travels with the record so
/// the processor can fingerprint it; it is never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEmail {
    /// String form of the provider's 128-bit message id.
    pub message_id: String,
    pub user_id: Uuid,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub snippet: String,
    pub received_at: DateTime<Utc>,
    #[serde(default)]
    pub body: String,
}
