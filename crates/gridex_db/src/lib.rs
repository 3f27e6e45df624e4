//! Durable store for Gridex.
//!
//! SQLite is the source of truth for users, workers, jobs, the pending
//! queue, and the credit ledger. Every public operation that mutates more
//! than one row runs in a single transaction; the in-memory registry in the
//! coordinator is only a cache of currently connected workers.
//!
//! Balances are double-entry: a user's stored balance is always the sum of
//! that user's ledger deltas, and any balance mutation inserts a ledger row
//! in the same transaction.

pub mod error;
pub mod models;
mod schema;

mod jobs;
mod users;
mod workers;

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use tracing::info;

pub use error::StoreError;
pub use jobs::{JobResultPayload, NewJob};
pub use models::{
    JobRow, JobState, LedgerKind, LedgerRow, QueueStats, StoredArtifact, UserRole, UserRow,
    WorkerRow, WorkerState,
};

pub type Result<T> = std::result::Result<T, StoreError>;

/// Handle to the Gridex database. Artifact bytes live on the filesystem
/// under `artifact_root`, keyed by job id; everything else is in SQLite.
#[derive(Clone)]
pub struct Store {
    pool: Pool<Sqlite>,
    artifact_root: PathBuf,
}

impl Store {
    /// Open (creating if missing) the database at a `sqlite:` URL.
    pub async fn open(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        info!("Opened store at {}", url);
        Ok(Self {
            pool,
            artifact_root: default_artifact_root(),
        })
    }

    /// In-memory store for tests. A single connection keeps every caller on
    /// the same database.
    pub async fn open_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Self {
            pool,
            artifact_root: default_artifact_root(),
        })
    }

    /// Override where artifact files are written.
    pub fn with_artifact_root(mut self, root: PathBuf) -> Self {
        self.artifact_root = root;
        self
    }

    /// Apply the schema. Idempotent.
    pub async fn init(&self) -> Result<()> {
        for statement in schema::STATEMENTS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub(crate) fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub(crate) fn artifact_dir(&self, job_id: &str) -> PathBuf {
        self.artifact_root.join(job_id)
    }
}

fn default_artifact_root() -> PathBuf {
    std::env::temp_dir().join("gridex-artifacts")
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Store;

    /// Fresh in-memory store with schema applied.
    pub async fn store() -> Store {
        let store = Store::open_memory().await.unwrap();
        store.init().await.unwrap();
        store
    }
}
