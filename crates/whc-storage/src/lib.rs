//! Connection contracts for the supplier, organization and back-office databases.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use thiserror::Error;
use tracing::warn;
use whc_core::{BlogListFilter, Enrichment, LocalOfferBlog, OfferBlogSourceRow, SyncLedger};

pub mod memory;
pub mod mysql;

pub const CRATE_NAME: &str = "whc-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("invalid sql identifier `{0}`")]
    InvalidIdentifier(String),
    #[error("injected failure: {0}")]
    Injected(String),
}

impl StoreError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Database(err) => classify_sqlx_error(err),
            Self::Injected(_) => RetryDisposition::Retryable,
            Self::Migrate(_) | Self::InvalidIdentifier(_) => RetryDisposition::NonRetryable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_sqlx_error(err: &sqlx::Error) -> RetryDisposition {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => RetryDisposition::Retryable,
        // 40001 covers deadlocks and serialization failures.
        sqlx::Error::Database(db) if db.code().as_deref() == Some("40001") => {
            RetryDisposition::Retryable
        }
        _ => RetryDisposition::NonRetryable,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 5,
            acquire_timeout: Duration::from_secs(20),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Open a MySQL pool, retrying transient connection failures with backoff.
///
/// `label` names the logical connection in logs; the URL is never logged.
pub async fn connect_pool_with_retry(
    label: &str,
    url: &str,
    settings: PoolSettings,
) -> anyhow::Result<MySqlPool> {
    let mut attempt = 0usize;
    loop {
        let result = MySqlPoolOptions::new()
            .max_connections(settings.max_connections.max(1))
            .acquire_timeout(settings.acquire_timeout)
            .connect(url)
            .await;

        match result {
            Ok(pool) => return Ok(pool),
            Err(err)
                if classify_sqlx_error(&err) == RetryDisposition::Retryable
                    && attempt < settings.backoff.max_retries =>
            {
                let delay = settings.backoff.delay_for_attempt(attempt);
                warn!(connection = label, attempt, ?delay, error = %err, "database connect failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                return Err(err).with_context(|| format!("connecting to the {label} database"));
            }
        }
    }
}

/// Read side of the supplier database.
#[async_trait]
pub trait OfferBlogSource: Send + Sync {
    /// Up to `limit` merged rows with `id > after_id`, ordered by id ascending.
    async fn fetch_chunk(
        &self,
        after_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<OfferBlogSourceRow>, StoreError>;
}

/// Organization data reachable on its own connection.
#[async_trait]
pub trait EnrichmentLookup: Send + Sync {
    /// Enrichment keyed by offer number. Offer numbers with no match are absent.
    async fn lookup(&self, offer_nos: &[i64]) -> Result<HashMap<i64, Enrichment>, StoreError>;
}

/// The back-office database the mirror is written to.
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Start a unit of work. Dropping the returned transaction without
    /// committing rolls it back.
    async fn begin(&self) -> Result<Box<dyn TargetTransaction>, StoreError>;

    /// Non-blocking attempt at the named run lock. `None` means another
    /// holder has it.
    async fn try_acquire_run_lock(&self, name: &str)
        -> Result<Option<Box<dyn RunLock>>, StoreError>;

    async fn last_synced(&self) -> Result<Option<SyncLedger>, StoreError>;

    /// Local blogs matching `filter`, newest id first.
    async fn list_blogs(&self, filter: &BlogListFilter) -> Result<Vec<LocalOfferBlog>, StoreError>;

    /// Set or clear the sold flag. Returns false when the blog does not exist.
    async fn set_sold(&self, id: i64, sold: bool) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait TargetTransaction: Send {
    /// Subset of `ids` whose local row is currently marked sold.
    async fn sold_ids(&mut self, ids: &[i64]) -> Result<HashSet<i64>, StoreError>;

    /// Insert new rows and overwrite the allow-listed columns of existing ones.
    async fn upsert_blogs(
        &mut self,
        rows: &[OfferBlogSourceRow],
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    async fn record_success(&mut self, at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait RunLock: Send {
    async fn release(self: Box<Self>) -> Result<(), StoreError>;
}
