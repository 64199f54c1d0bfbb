//! Batch writes that never touch rows already marked sold.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;
use whc_core::OfferBlogSourceRow;
use whc_storage::TargetTransaction;

use crate::SyncError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub skipped_sold: usize,
    pub upserted: u64,
}

/// Drop rows whose local counterpart is sold, then upsert the rest.
///
/// The sold set is read inside the caller's transaction right before the
/// write. Ids missing from that set are treated as not sold.
pub async fn write_batch(
    tx: &mut dyn TargetTransaction,
    mut rows: Vec<OfferBlogSourceRow>,
    now: DateTime<Utc>,
) -> Result<BatchOutcome, SyncError> {
    if rows.is_empty() {
        return Ok(BatchOutcome::default());
    }

    let ids = rows.iter().map(|r| r.id).collect::<Vec<_>>();
    let first_id = ids[0];
    let last_id = ids[ids.len() - 1];
    let row_count = rows.len();
    let write_error = |source| SyncError::Write {
        row_count,
        first_id,
        last_id,
        source,
    };

    let sold = tx.sold_ids(&ids).await.map_err(write_error)?;
    rows.retain(|r| !sold.contains(&r.id));
    let skipped_sold = row_count - rows.len();
    if skipped_sold > 0 {
        debug!(skipped_sold, first_id, last_id, "excluding sold offer blogs from batch");
    }

    if rows.is_empty() {
        return Ok(BatchOutcome {
            skipped_sold,
            upserted: 0,
        });
    }

    let upserted = tx.upsert_blogs(&rows, now).await.map_err(write_error)?;
    Ok(BatchOutcome {
        skipped_sold,
        upserted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;
    use whc_core::{Enrichment, LocalOfferBlog};
    use whc_storage::memory::MemoryTargetStore;
    use whc_storage::TargetStore;

    fn row(id: i64, title: &str) -> OfferBlogSourceRow {
        OfferBlogSourceRow {
            id,
            offer_no: Some(id * 10),
            title: title.into(),
            status: 1,
            description: String::new(),
            created_at_whc: NaiveDateTime::default(),
            updated_at_whc: NaiveDateTime::default(),
            file: None,
            enrichment: Enrichment::default(),
        }
    }

    async fn store_with_sold(id: i64) -> MemoryTargetStore {
        let store = MemoryTargetStore::new();
        let mut blog = LocalOfferBlog::inserted_from(&row(id, "local"), Utc::now());
        blog.is_sold = true;
        store.insert_blog(blog).await;
        store
    }

    #[tokio::test]
    async fn sold_rows_are_excluded_from_insert_and_update() {
        let store = store_with_sold(2).await;
        let mut tx = store.begin().await.unwrap();
        let outcome = write_batch(
            tx.as_mut(),
            vec![row(1, "new"), row(2, "changed"), row(3, "new")],
            Utc::now(),
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(outcome, BatchOutcome { skipped_sold: 1, upserted: 2 });
        let state = store.snapshot().await;
        assert_eq!(state.blogs[&2].title, "local");
        assert_eq!(state.blogs[&1].title, "new");
    }

    #[tokio::test]
    async fn fully_sold_batch_is_a_no_op() {
        let store = store_with_sold(4).await;
        let mut tx = store.begin().await.unwrap();
        let outcome = write_batch(tx.as_mut(), vec![row(4, "x")], Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, BatchOutcome { skipped_sold: 1, upserted: 0 });
        assert_eq!(store.upsert_calls(), 0);
    }

    #[tokio::test]
    async fn write_failures_name_the_batch() {
        let store = MemoryTargetStore::new().fail_on_upsert(1);
        let mut tx = store.begin().await.unwrap();
        let err = write_batch(tx.as_mut(), vec![row(7, "a"), row(9, "b")], Utc::now())
            .await
            .unwrap_err();
        match err {
            SyncError::Write { row_count, first_id, last_id, .. } => {
                assert_eq!((row_count, first_id, last_id), (2, 7, 9));
            }
            other => panic!("expected write error, got {other:?}"),
        }
    }
}
