//! "Last synchronized at" bookkeeping.

use chrono::{DateTime, Utc};
use whc_core::SyncLedger;
use whc_storage::{StoreError, TargetStore, TargetTransaction};

use crate::SyncError;

/// Last statement of a successful run, inside the run's transaction.
pub async fn record_success(
    tx: &mut dyn TargetTransaction,
    at: DateTime<Utc>,
) -> Result<(), SyncError> {
    tx.record_success(at).await.map_err(SyncError::Ledger)
}

pub async fn last_synced(store: &dyn TargetStore) -> Result<Option<SyncLedger>, StoreError> {
    store.last_synced().await
}
