//! Store adapter: every SQL statement the pipeline executes.
//!
//! Each operation is a single statement with the conflict policy baked into
//! the SQL, so concurrent workers converge without cross-statement
//! transactions. Uniqueness constraints on `emails.id` and
//! `emails.fingerprint` are the serialization point for the dedup protocol.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{ProviderUser, User};

/// Outcome of the email metadata insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailInsert {
    /// Fresh row created: first sighting of this fingerprint.
    Inserted,
    /// The id already existed; `received_at` was overwritten with the most
    /// recent sighting. Not a new unique email.
    IdConflictUpdated,
}

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Register a provider user, keeping the existing row when the address is
    /// already known.
    pub async fn upsert_user(&self, user: &ProviderUser) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"INSERT INTO users (id, email)
               VALUES ($1, $2)
               ON CONFLICT (email) DO NOTHING"#,
        )
        .bind(user.id)
        .bind(&user.email)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn user_by_id(&self, user_id: Uuid) -> Result<User, sqlx::Error> {
        sqlx::query_as(
            r#"SELECT id, email, last_email_check, last_email_received
               FROM users WHERE id = $1"#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn all_users(&self) -> Result<Vec<User>, sqlx::Error> {
        sqlx::query_as(
            r#"SELECT id, email, last_email_check, last_email_received
               FROM users"#,
        )
        .fetch_all(&self.pool)
        .await
    }

    /// Canonical id for a fingerprint, if any email with that content has
    /// been stored before.
    pub async fn email_id_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<Uuid>, sqlx::Error> {
        sqlx::query_scalar(r#"SELECT id FROM emails WHERE fingerprint = $1 LIMIT 1"#)
            .bind(fingerprint)
            .fetch_optional(&self.pool)
            .await
    }

    /// Insert email metadata. An id conflict keeps the row but refreshes
    /// `received_at` to the most recent sighting; a fingerprint conflict
    /// surfaces as a unique-violation error for the caller to reconcile.
    ///
    /// `xmax = 0` holds only for rows created by this statement, which is how
    /// a fresh insert is told apart from an id-conflict overwrite.
    pub async fn insert_email(
        &self,
        id: Uuid,
        fingerprint: &str,
        received_at: DateTime<Utc>,
    ) -> Result<EmailInsert, sqlx::Error> {
        let inserted: bool = sqlx::query_scalar(
            r#"INSERT INTO emails (id, fingerprint, received_at)
               VALUES ($1, $2, $3)
               ON CONFLICT (id) DO UPDATE SET received_at = EXCLUDED.received_at
               RETURNING (xmax = 0)"#,
        )
        .bind(id)
        .bind(fingerprint)
        .bind(received_at)
        .fetch_one(&self.pool)
        .await?;

        if inserted {
            Ok(EmailInsert::Inserted)
        } else {
            Ok(EmailInsert::IdConflictUpdated)
        }
    }

    /// Link a user to a unique email; idempotent.
    pub async fn link_user_email(&self, user_id: Uuid, email_id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"INSERT INTO user_emails (user_id, email_id)
               VALUES ($1, $2)
               ON CONFLICT (user_id, email_id) DO NOTHING"#,
        )
        .bind(user_id)
        .bind(email_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record that a poll result for this user was just processed.
    pub async fn touch_last_email_check(
        &self,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(r#"UPDATE users SET last_email_check = $1 WHERE id = $2"#)
            .bind(at)
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Raise `last_email_received`, never lower it. The condition makes
    /// concurrent updates commute, so no read-modify-write is needed.
    pub async fn raise_last_email_received(
        &self,
        user_id: Uuid,
        received_at: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"UPDATE users
               SET last_email_received = $1
               WHERE id = $2
                 AND (last_email_received IS NULL OR $1 > last_email_received)"#,
        )
        .bind(received_at)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Whether a store error is a unique violation on the email fingerprint,
/// i.e. a concurrent inserter won the race for this content.
pub fn is_fingerprint_conflict(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            db.is_unique_violation()
                && db
                    .constraint()
                    .is_some_and(|name| name.contains("fingerprint"))
        }
        _ => false,
    }
}
