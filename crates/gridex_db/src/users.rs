//! User accounts and the credit ledger.
//!
//! Balances only ever move through `apply_ledger`, which inserts the ledger
//! row and updates the stored balance in the same transaction the caller
//! opened. That keeps `balance == sum(ledger deltas)` checkable at any
//! instant.

use chrono::{DateTime, Utc};
use gridex_protocol::types::Role;
use sha2::{Digest, Sha256};
use tracing::info;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{LedgerKind, LedgerRow, UserRow};
use crate::{Result, Store};

impl Store {
    /// Create a user and grant the starting balance atomically.
    pub async fn create_user(
        &self,
        username: &str,
        password: &str,
        role: Role,
        starting_credits: i64,
    ) -> Result<UserRow> {
        let mut tx = self.pool().begin().await?;

        let taken: Option<String> =
            sqlx::query_scalar("SELECT id FROM gx_users WHERE username = ?")
                .bind(username)
                .fetch_optional(&mut *tx)
                .await?;
        if taken.is_some() {
            return Err(StoreError::UsernameTaken(username.to_string()));
        }

        let id = Uuid::new_v4().to_string();
        let salt = Uuid::new_v4().to_string();
        let hash = password_hash(&salt, password);
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO gx_users (id, username, password_salt, password_hash, role, balance, created_at)
            VALUES (?, ?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(&id)
        .bind(username)
        .bind(&salt)
        .bind(&hash)
        .bind(role.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if starting_credits > 0 {
            apply_ledger(&mut tx, &id, starting_credits, LedgerKind::SignupGrant, None, now)
                .await?;
        }

        let user = fetch_user(&mut tx, &id).await?;
        tx.commit().await?;

        info!("Created user '{}' with role {:?}", username, user.role);
        Ok(user)
    }

    /// Check a username/password pair. Returns the user on success.
    pub async fn verify_login(&self, username: &str, password: &str) -> Result<Option<UserRow>> {
        let user: Option<UserRow> = sqlx::query_as("SELECT * FROM gx_users WHERE username = ?")
            .bind(username)
            .fetch_optional(self.pool())
            .await?;

        Ok(user.filter(|u| password_hash(&u.password_salt, password) == u.password_hash))
    }

    pub async fn user(&self, user_id: &str) -> Result<UserRow> {
        sqlx::query_as("SELECT * FROM gx_users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| StoreError::UserNotFound(user_id.to_string()))
    }

    /// Resolve an opaque owner token to a user. On the trusted campus link
    /// the token is the user id itself.
    pub async fn user_by_token(&self, token: &str) -> Result<Option<UserRow>> {
        Ok(sqlx::query_as("SELECT * FROM gx_users WHERE id = ?")
            .bind(token)
            .fetch_optional(self.pool())
            .await?)
    }

    pub async fn balance(&self, user_id: &str) -> Result<i64> {
        sqlx::query_scalar("SELECT balance FROM gx_users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| StoreError::UserNotFound(user_id.to_string()))
    }

    /// Full ledger for a user, oldest first.
    pub async fn ledger_for_user(&self, user_id: &str) -> Result<Vec<LedgerRow>> {
        Ok(
            sqlx::query_as("SELECT * FROM gx_credit_ledger WHERE user_id = ? ORDER BY id ASC")
                .bind(user_id)
                .fetch_all(self.pool())
                .await?,
        )
    }

    /// Admin adjustment. Returns the new balance.
    pub async fn grant(
        &self,
        user_id: &str,
        delta: i64,
        related_job: Option<&str>,
    ) -> Result<i64> {
        let mut tx = self.pool().begin().await?;
        let balance = apply_ledger(
            &mut tx,
            user_id,
            delta,
            LedgerKind::AdminAdjust,
            related_job,
            Utc::now(),
        )
        .await?;
        tx.commit().await?;
        info!("Adjusted balance of {} by {} -> {}", user_id, delta, balance);
        Ok(balance)
    }
}

/// Insert a ledger row and move the stored balance inside the caller's
/// transaction. Rejects any delta that would drive the balance negative.
/// Returns the balance after the move.
pub(crate) async fn apply_ledger(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    user_id: &str,
    delta: i64,
    kind: LedgerKind,
    job_id: Option<&str>,
    at: DateTime<Utc>,
) -> Result<i64> {
    let balance: i64 = sqlx::query_scalar("SELECT balance FROM gx_users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| StoreError::UserNotFound(user_id.to_string()))?;

    let updated = balance + delta;
    if updated < 0 {
        return Err(StoreError::InsufficientCredits {
            required: -delta,
            available: balance,
        });
    }

    sqlx::query("UPDATE gx_users SET balance = ? WHERE id = ?")
        .bind(updated)
        .bind(user_id)
        .execute(&mut **tx)
        .await?;

    sqlx::query(
        r#"
        INSERT INTO gx_credit_ledger (user_id, delta, kind, job_id, at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(user_id)
    .bind(delta)
    .bind(kind)
    .bind(job_id)
    .bind(at)
    .execute(&mut **tx)
    .await?;

    Ok(updated)
}

async fn fetch_user(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    user_id: &str,
) -> Result<UserRow> {
    sqlx::query_as("SELECT * FROM gx_users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| StoreError::UserNotFound(user_id.to_string()))
}

fn password_hash(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}
