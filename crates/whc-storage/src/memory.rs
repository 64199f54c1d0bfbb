//! In-process stand-ins for the three connections.
//!
//! The supplier source reproduces the join rules of the MySQL query (latest
//! file by highest file id, image filter on the winner, organization left
//! joins) so pipeline behaviour can be checked without a server. Each store
//! can be told to fail on its n-th call.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use whc_core::{
    AttachedFile, BlogListFilter, Enrichment, LocalOfferBlog, MagentoPublication,
    OfferBlogSourceRow, SyncLedger,
};

use crate::{
    EnrichmentLookup, OfferBlogSource, RunLock, StoreError, TargetStore, TargetTransaction,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupplierOfferBlog {
    pub id: i64,
    pub offer_no: Option<i64>,
    pub title: String,
    pub status: i32,
    pub description: String,
    pub created_on: NaiveDateTime,
    pub updated_on: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupplierFile {
    pub id: i64,
    pub file_name: Option<String>,
    pub path: Option<String>,
    pub file_type: String,
}

#[derive(Debug, Clone, Default)]
pub struct SupplierTables {
    pub offer_blogs: Vec<SupplierOfferBlog>,
    /// `(offer_blog_id, file_id)` associations.
    pub offer_blog_files: Vec<(i64, i64)>,
    pub files: Vec<SupplierFile>,
}

impl SupplierTables {
    /// Image attachment of the association with the highest file id, if that
    /// file is an image.
    pub fn latest_image(&self, offer_blog_id: i64) -> Option<AttachedFile> {
        let last_file_id = self
            .offer_blog_files
            .iter()
            .filter(|(blog_id, _)| *blog_id == offer_blog_id)
            .map(|(_, file_id)| *file_id)
            .max()?;
        self.files
            .iter()
            .find(|f| f.id == last_file_id && f.file_type.to_ascii_lowercase().starts_with("image"))
            .map(|f| AttachedFile {
                file_name: f.file_name.clone(),
                file_path: f.path.clone(),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrgOffer {
    pub offer_sid: i64,
    pub offer: Option<String>,
    pub supplier_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrgSupplier {
    pub id: i64,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrgOfferExt {
    pub offer_no: i64,
    pub status: Option<i32>,
    pub is_brand: Option<bool>,
    pub is_b_group_appr: Option<bool>,
    pub is_approved: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct OrgTables {
    pub offers: Vec<OrgOffer>,
    pub suppliers: Vec<OrgSupplier>,
    pub offer_ext: Vec<OrgOfferExt>,
}

impl OrgTables {
    /// `None` when neither `offers` nor `offer_ext` has a row for the number.
    pub fn enrichment_for(&self, offer_no: i64) -> Option<Enrichment> {
        let offer = self.offers.iter().find(|o| o.offer_sid == offer_no);
        let ext = self.offer_ext.iter().find(|e| e.offer_no == offer_no);
        if offer.is_none() && ext.is_none() {
            return None;
        }
        let supplier = offer
            .and_then(|o| o.supplier_id)
            .and_then(|sid| self.suppliers.iter().find(|s| s.id == sid))
            .and_then(|s| s.name.clone());
        Some(Enrichment {
            offer_title: offer.and_then(|o| o.offer.clone()),
            supplier,
            offer_ext_status: ext.and_then(|e| e.status),
            is_brand: ext.and_then(|e| e.is_brand),
            is_b_group_appr: ext.and_then(|e| e.is_b_group_appr),
            is_approved: ext.and_then(|e| e.is_approved),
        })
    }
}

/// Counts calls and fails the configured one (1-based).
#[derive(Debug, Default)]
struct FailurePlan {
    calls: AtomicUsize,
    fail_on: Option<usize>,
}

impl FailurePlan {
    fn tick(&self, what: &str) -> Result<(), StoreError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on == Some(call) {
            return Err(StoreError::Injected(format!("{what} call #{call}")));
        }
        Ok(())
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
pub struct MemoryOrgDb {
    tables: RwLock<OrgTables>,
    plan: FailurePlan,
}

impl MemoryOrgDb {
    pub fn new(tables: OrgTables) -> Self {
        Self {
            tables: RwLock::new(tables),
            plan: FailurePlan::default(),
        }
    }

    pub fn fail_on_lookup(mut self, call: usize) -> Self {
        self.plan.fail_on = Some(call);
        self
    }

    pub fn lookup_calls(&self) -> usize {
        self.plan.calls()
    }

    pub async fn update(&self, f: impl FnOnce(&mut OrgTables)) {
        f(&mut *self.tables.write().await);
    }
}

#[async_trait]
impl EnrichmentLookup for MemoryOrgDb {
    async fn lookup(&self, offer_nos: &[i64]) -> Result<HashMap<i64, Enrichment>, StoreError> {
        self.plan.tick("enrichment lookup")?;
        let tables = self.tables.read().await;
        Ok(offer_nos
            .iter()
            .filter_map(|no| tables.enrichment_for(*no).map(|e| (*no, e)))
            .collect())
    }
}

#[derive(Debug, Default)]
pub struct MemorySupplierDb {
    tables: RwLock<SupplierTables>,
    joined_org: Option<Arc<MemoryOrgDb>>,
    plan: FailurePlan,
}

impl MemorySupplierDb {
    pub fn new(tables: SupplierTables) -> Self {
        Self {
            tables: RwLock::new(tables),
            joined_org: None,
            plan: FailurePlan::default(),
        }
    }

    /// Join organization data in the source read, like the same-connection query.
    pub fn joined_with(mut self, org: Arc<MemoryOrgDb>) -> Self {
        self.joined_org = Some(org);
        self
    }

    pub fn fail_on_fetch(mut self, call: usize) -> Self {
        self.plan.fail_on = Some(call);
        self
    }

    pub fn fetch_calls(&self) -> usize {
        self.plan.calls()
    }

    pub async fn update(&self, f: impl FnOnce(&mut SupplierTables)) {
        f(&mut *self.tables.write().await);
    }
}

#[async_trait]
impl OfferBlogSource for MemorySupplierDb {
    async fn fetch_chunk(
        &self,
        after_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<OfferBlogSourceRow>, StoreError> {
        self.plan.tick("source fetch")?;
        let tables = self.tables.read().await;
        let mut blogs = tables
            .offer_blogs
            .iter()
            .filter(|b| after_id.map(|after| b.id > after).unwrap_or(true))
            .collect::<Vec<_>>();
        blogs.sort_by_key(|b| b.id);
        blogs.truncate(limit);

        let org = match &self.joined_org {
            Some(org) => Some(org.tables.read().await),
            None => None,
        };

        Ok(blogs
            .into_iter()
            .map(|b| OfferBlogSourceRow {
                id: b.id,
                offer_no: b.offer_no,
                title: b.title.clone(),
                status: b.status,
                description: b.description.clone(),
                created_at_whc: b.created_on,
                updated_at_whc: b.updated_on,
                file: tables.latest_image(b.id),
                enrichment: match (&org, b.offer_no) {
                    (Some(org), Some(no)) => org.enrichment_for(no).unwrap_or_default(),
                    _ => Enrichment::default(),
                },
            })
            .collect())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryTargetState {
    pub blogs: BTreeMap<i64, LocalOfferBlog>,
    pub ledger: Option<SyncLedger>,
}

/// Back-office store. A transaction buffers its writes and applies them per id
/// on commit. Rows sold in the meantime keep their local values, matching the
/// row locks the MySQL store takes.
#[derive(Debug, Clone, Default)]
pub struct MemoryTargetStore {
    state: Arc<Mutex<MemoryTargetState>>,
    locks: Arc<StdMutex<HashSet<String>>>,
    upsert_plan: Arc<FailurePlan>,
}

impl MemoryTargetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: MemoryTargetState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
            ..Self::default()
        }
    }

    pub fn fail_on_upsert(self, call: usize) -> Self {
        Self {
            upsert_plan: Arc::new(FailurePlan {
                calls: AtomicUsize::new(0),
                fail_on: Some(call),
            }),
            ..self
        }
    }

    pub fn upsert_calls(&self) -> usize {
        self.upsert_plan.calls()
    }

    pub async fn snapshot(&self) -> MemoryTargetState {
        self.state.lock().await.clone()
    }

    pub async fn insert_blog(&self, blog: LocalOfferBlog) {
        self.state.lock().await.blogs.insert(blog.id, blog);
    }

    pub async fn attach_publication(&self, publication: MagentoPublication) -> bool {
        let mut state = self.state.lock().await;
        match state.blogs.get_mut(&publication.offer_blog_id) {
            Some(blog) => {
                blog.publication = Some(publication);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl TargetStore for MemoryTargetStore {
    async fn begin(&self) -> Result<Box<dyn TargetTransaction>, StoreError> {
        Ok(Box::new(MemoryTransaction {
            pending: Vec::new(),
            ledger: None,
            shared: Arc::clone(&self.state),
            upsert_plan: Arc::clone(&self.upsert_plan),
        }))
    }

    async fn try_acquire_run_lock(
        &self,
        name: &str,
    ) -> Result<Option<Box<dyn RunLock>>, StoreError> {
        let inserted = self
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string());
        if !inserted {
            return Ok(None);
        }
        Ok(Some(Box::new(MemoryRunLock {
            name: name.to_string(),
            locks: Arc::clone(&self.locks),
        })))
    }

    async fn last_synced(&self) -> Result<Option<SyncLedger>, StoreError> {
        Ok(self.state.lock().await.ledger)
    }

    async fn list_blogs(&self, filter: &BlogListFilter) -> Result<Vec<LocalOfferBlog>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .blogs
            .values()
            .rev()
            .filter(|b| filter.matches(b))
            .cloned()
            .collect())
    }

    async fn set_sold(&self, id: i64, sold: bool) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.blogs.get_mut(&id) {
            Some(blog) => {
                blog.is_sold = sold;
                blog.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

struct MemoryTransaction {
    pending: Vec<(OfferBlogSourceRow, DateTime<Utc>)>,
    ledger: Option<SyncLedger>,
    shared: Arc<Mutex<MemoryTargetState>>,
    upsert_plan: Arc<FailurePlan>,
}

#[async_trait]
impl TargetTransaction for MemoryTransaction {
    async fn sold_ids(&mut self, ids: &[i64]) -> Result<HashSet<i64>, StoreError> {
        // Upserts never set the flag, so committed state is authoritative.
        let state = self.shared.lock().await;
        Ok(ids
            .iter()
            .copied()
            .filter(|id| state.blogs.get(id).map(|b| b.is_sold).unwrap_or(false))
            .collect())
    }

    async fn upsert_blogs(
        &mut self,
        rows: &[OfferBlogSourceRow],
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        self.upsert_plan.tick("upsert")?;
        self.pending.extend(rows.iter().map(|row| (row.clone(), now)));
        Ok(rows.len() as u64)
    }

    async fn record_success(&mut self, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.ledger = Some(SyncLedger { last_synced: at });
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTransaction {
            pending,
            ledger,
            shared,
            ..
        } = *self;
        let mut state = shared.lock().await;
        for (row, now) in pending {
            match state.blogs.get_mut(&row.id) {
                Some(existing) if existing.is_sold => {}
                Some(existing) => existing.apply_synced_fields(&row, now),
                None => {
                    state.blogs.insert(row.id, LocalOfferBlog::inserted_from(&row, now));
                }
            }
        }
        if ledger.is_some() {
            state.ledger = ledger;
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

struct MemoryRunLock {
    name: String,
    locks: Arc<StdMutex<HashSet<String>>>,
}

#[async_trait]
impl RunLock for MemoryRunLock {
    async fn release(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

impl Drop for MemoryRunLock {
    fn drop(&mut self) {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.name);
    }
}
