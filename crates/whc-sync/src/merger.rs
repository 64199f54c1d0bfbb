//! Application-level left join of organization data onto source rows.

use std::collections::{BTreeSet, HashMap};

use whc_core::{Enrichment, OfferBlogSourceRow};
use whc_storage::EnrichmentLookup;

use crate::SyncError;

/// Distinct non-null offer numbers, ascending.
pub fn distinct_offer_numbers(rows: &[OfferBlogSourceRow]) -> Vec<i64> {
    rows.iter()
        .filter_map(|r| r.offer_no)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Replace each row's enrichment with the match for its offer number, or with
/// empty enrichment when there is none.
pub fn attach(rows: &mut [OfferBlogSourceRow], found: &HashMap<i64, Enrichment>) -> usize {
    let mut matched = 0;
    for row in rows.iter_mut() {
        row.enrichment = match row.offer_no.and_then(|no| found.get(&no)) {
            Some(enrichment) => {
                matched += 1;
                enrichment.clone()
            }
            None => Enrichment::default(),
        };
    }
    matched
}

/// One batched lookup per chunk. Returns how many rows found a match.
pub async fn merge_enrichment(
    lookup: &dyn EnrichmentLookup,
    rows: &mut [OfferBlogSourceRow],
) -> Result<usize, SyncError> {
    let offer_nos = distinct_offer_numbers(rows);
    if offer_nos.is_empty() {
        return Ok(attach(rows, &HashMap::new()));
    }
    let found = lookup
        .lookup(&offer_nos)
        .await
        .map_err(|source| SyncError::Enrichment {
            offer_count: offer_nos.len(),
            source,
        })?;
    Ok(attach(rows, &found))
}
