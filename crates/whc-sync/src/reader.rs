//! Chunked, id-ordered reads from the supplier database.

use whc_core::{OfferBlogSourceRow, MAX_ROWS_PER_INSERT};
use whc_storage::OfferBlogSource;

use crate::SyncError;

pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// A chunk is upserted as one statement, so it must fit the placeholder limit.
pub const MAX_CHUNK_SIZE: usize = MAX_ROWS_PER_INSERT;

/// Walks the source in ascending id order, one bounded chunk per call.
pub struct SourceReader<'a> {
    source: &'a dyn OfferBlogSource,
    chunk_size: usize,
    cursor: Option<i64>,
    exhausted: bool,
}

impl<'a> SourceReader<'a> {
    pub fn new(source: &'a dyn OfferBlogSource, chunk_size: usize) -> Self {
        Self {
            source,
            chunk_size: chunk_size.clamp(1, MAX_CHUNK_SIZE),
            cursor: None,
            exhausted: false,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Highest id handed out so far.
    pub fn cursor(&self) -> Option<i64> {
        self.cursor
    }

    pub async fn next_chunk(&mut self) -> Result<Option<Vec<OfferBlogSourceRow>>, SyncError> {
        if self.exhausted {
            return Ok(None);
        }

        let after_id = self.cursor;
        let mut rows = self
            .source
            .fetch_chunk(after_id, self.chunk_size)
            .await
            .map_err(|source| SyncError::SourceRead { after_id, source })?;

        if rows.len() < self.chunk_size {
            self.exhausted = true;
        }

        // Join fan-out can repeat an id; the id is the target's primary key.
        rows.sort_by_key(|r| r.id);
        rows.dedup_by_key(|r| r.id);
        if let Some(after) = after_id {
            rows.retain(|r| r.id > after);
        }

        match rows.last() {
            Some(last) => {
                self.cursor = Some(last.id);
                Ok(Some(rows))
            }
            None => {
                self.exhausted = true;
                Ok(None)
            }
        }
    }
}
