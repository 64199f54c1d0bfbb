//! MySQL implementations of the three logical connections.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::mysql::{MySql, MySqlPool, MySqlRow};
use sqlx::pool::PoolConnection;
use sqlx::{QueryBuilder, Row, Transaction};
use tracing::debug;
use whc_core::{
    AttachedFile, BlogListFilter, Enrichment, LocalOfferBlog, MagentoPublication,
    OfferBlogSourceRow, PublicationStatus, SyncLedger, INSERT_COLUMNS, MAX_ROWS_PER_INSERT,
    UPDATE_COLUMNS,
};

use crate::{
    EnrichmentLookup, OfferBlogSource, RunLock, StoreError, TargetStore, TargetTransaction,
};

pub const OFFER_BLOGS_TABLE: &str = "whc_supplier_offer_blogs";
pub const PUBLICATION_TABLE: &str = "whc_supplier_offer_blog_magento";
pub const LEDGER_TABLE: &str = "whc_supplier_offer_blog_last_sync";
pub const LEDGER_ROW_ID: i64 = 1;

const MAX_LOCK_NAME_LEN: usize = 64;

/// Where the organization columns of a source row come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEnrichment {
    /// Rows leave the source query without enrichment; a separate lookup merges it.
    Separate,
    /// The organization schema is reachable from the supplier connection and is
    /// joined in the same query.
    Joined { database: String },
}

/// Backtick-quote a schema name after checking it is a plain identifier.
pub fn quote_identifier(name: &str) -> Result<String, StoreError> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$');
    if !valid {
        return Err(StoreError::InvalidIdentifier(name.to_string()));
    }
    Ok(format!("`{name}`"))
}

/// Keyset-paginated source query. Binds: `after_id`, `limit`.
///
/// The latest file of an offer blog is the association with the highest
/// `file_id`; the image-type filter applies to that winning association only,
/// so an older image never stands in for a newer non-image file.
pub fn source_chunk_sql(enrichment: &SourceEnrichment) -> Result<String, StoreError> {
    let mut sql = String::from(
        r#"
        SELECT CAST(ob.id AS SIGNED) AS id,
               CAST(ob.offer_no AS SIGNED) AS offer_no,
               ob.title AS title,
               CAST(ob.status AS SIGNED) AS status,
               ob.description AS description,
               ob.created_on AS created_at_whc,
               ob.updated_on AS updated_at_whc,
               CAST(f.id IS NOT NULL AS SIGNED) AS has_file,
               f.file_name AS file_name,
               f.path AS file_path"#,
    );

    let joined_schema = match enrichment {
        SourceEnrichment::Separate => None,
        SourceEnrichment::Joined { database } => Some(quote_identifier(database)?),
    };

    if joined_schema.is_some() {
        sql.push_str(
            r#",
               o.offer AS offer_title,
               s.name AS supplier,
               CAST(oe.status AS SIGNED) AS offer_ext_status,
               CAST(oe.is_brand AS SIGNED) AS is_brand,
               CAST(oe.is_b_group_appr AS SIGNED) AS is_b_group_appr,
               CAST(oe.is_approved AS SIGNED) AS is_approved"#,
        );
    }

    sql.push_str(
        r#"
          FROM offer_blog AS ob
          LEFT JOIN (
                SELECT obf_sub.offer_blog_id, MAX(obf_sub.file_id) AS last_file_id
                  FROM offer_blog_file AS obf_sub
                 GROUP BY obf_sub.offer_blog_id
               ) AS latest_obf
            ON ob.id = latest_obf.offer_blog_id
          LEFT JOIN offer_blog_file AS obf
            ON latest_obf.offer_blog_id = obf.offer_blog_id
           AND latest_obf.last_file_id = obf.file_id
          LEFT JOIN `file` AS f
            ON obf.file_id = f.id
           AND f.type LIKE 'image%'"#,
    );

    if let Some(schema) = joined_schema {
        sql.push_str(&format!(
            r#"
          LEFT JOIN {schema}.offers AS o ON ob.offer_no = o.offer_sid
          LEFT JOIN {schema}.suppliers AS s ON o.supplier_id = s.id
          LEFT JOIN {schema}.offer_ext AS oe ON ob.offer_no = oe.offer_no"#
        ));
    }

    sql.push_str(
        r#"
         WHERE ob.id > ?
         ORDER BY ob.id
         LIMIT ?
        "#,
    );
    Ok(sql)
}

/// Batched organization lookup. Keys come from either `offers` or `offer_ext`
/// so each table behaves like an independent left join.
pub fn enrichment_query(offer_nos: &[i64]) -> QueryBuilder<'_, MySql> {
    let mut qb = QueryBuilder::new(
        r#"
        SELECT CAST(k.offer_no AS SIGNED) AS offer_no,
               o.offer AS offer_title,
               s.name AS supplier,
               CAST(oe.status AS SIGNED) AS offer_ext_status,
               CAST(oe.is_brand AS SIGNED) AS is_brand,
               CAST(oe.is_b_group_appr AS SIGNED) AS is_b_group_appr,
               CAST(oe.is_approved AS SIGNED) AS is_approved
          FROM (SELECT offer_sid AS offer_no FROM offers WHERE offer_sid IN ("#,
    );
    push_id_list(&mut qb, offer_nos);
    qb.push(") UNION SELECT offer_no FROM offer_ext WHERE offer_no IN (");
    push_id_list(&mut qb, offer_nos);
    qb.push(
        r#")) AS k
          LEFT JOIN offers AS o ON o.offer_sid = k.offer_no
          LEFT JOIN suppliers AS s ON s.id = o.supplier_id
          LEFT JOIN offer_ext AS oe ON oe.offer_no = k.offer_no
         ORDER BY k.offer_no"#,
    );
    qb
}

pub fn sold_ids_query(ids: &[i64]) -> QueryBuilder<'_, MySql> {
    let mut qb = QueryBuilder::new(format!(
        "SELECT CAST(id AS SIGNED) AS id FROM {OFFER_BLOGS_TABLE} WHERE is_sold = 1 AND id IN ("
    ));
    push_id_list(&mut qb, ids);
    qb.push(") FOR UPDATE");
    qb
}

/// Multi-row `INSERT ... ON DUPLICATE KEY UPDATE` restricted to [`UPDATE_COLUMNS`].
pub fn upsert_query(rows: &[OfferBlogSourceRow], now: DateTime<Utc>) -> QueryBuilder<'_, MySql> {
    let mut qb = QueryBuilder::new(format!(
        "INSERT INTO {OFFER_BLOGS_TABLE} ({}) ",
        INSERT_COLUMNS.join(", ")
    ));
    qb.push_values(rows, |mut b, row| {
        b.push_bind(row.id)
            .push_bind(row.offer_no)
            .push_bind(row.enrichment.offer_title.as_deref())
            .push_bind(row.title.as_str())
            .push_bind(row.enrichment.supplier.as_deref())
            .push_bind(row.status)
            .push_bind(row.enrichment.offer_ext_status)
            .push_bind(row.enrichment.is_brand)
            .push_bind(row.enrichment.is_b_group_appr)
            .push_bind(row.enrichment.is_approved)
            .push_bind(row.description.as_str())
            .push_bind(row.created_at_whc)
            .push_bind(row.updated_at_whc)
            .push_bind(row.has_file())
            .push_bind(row.file_name())
            .push_bind(row.file_path())
            .push_bind(false)
            .push_bind(now)
            .push_bind(now);
    });
    qb.push(" ON DUPLICATE KEY UPDATE ");
    qb.push(
        UPDATE_COLUMNS
            .iter()
            .map(|col| format!("{col} = VALUES({col})"))
            .collect::<Vec<_>>()
            .join(", "),
    );
    qb
}

pub fn list_blogs_query(filter: &BlogListFilter) -> QueryBuilder<'_, MySql> {
    let mut qb = QueryBuilder::new(format!(
        r#"
        SELECT CAST(b.id AS SIGNED) AS id,
               CAST(b.offer_no AS SIGNED) AS offer_no,
               b.offer_title,
               b.title,
               b.supplier,
               CAST(b.status AS SIGNED) AS status,
               CAST(b.offer_ext_status AS SIGNED) AS offer_ext_status,
               CAST(b.is_brand AS SIGNED) AS is_brand,
               CAST(b.is_b_group_appr AS SIGNED) AS is_b_group_appr,
               CAST(b.is_approved AS SIGNED) AS is_approved,
               b.description,
               b.created_at_whc,
               b.updated_at_whc,
               CAST(b.has_file AS SIGNED) AS has_file,
               b.file_name,
               b.file_path,
               CAST(b.is_sold AS SIGNED) AS is_sold,
               b.created_at,
               b.updated_at,
               CAST(p.id AS SIGNED) AS publication_id,
               CAST(p.magento_blog_id AS SIGNED) AS magento_blog_id,
               CAST(p.status AS SIGNED) AS publication_status,
               p.url_key,
               p.created_magento_at,
               p.created_at AS publication_created_at,
               p.updated_at AS publication_updated_at
          FROM {OFFER_BLOGS_TABLE} AS b
          LEFT JOIN {PUBLICATION_TABLE} AS p
            ON p.id = (SELECT MAX(p2.id)
                         FROM {PUBLICATION_TABLE} AS p2
                        WHERE p2.whc_supplier_offer_blog_id = b.id)"#
    ));

    match filter {
        BlogListFilter::All => {}
        BlogListFilter::Statuses { statuses } => {
            if !statuses.is_empty() {
                qb.push(" WHERE b.offer_ext_status IN (");
                let mut sep = qb.separated(", ");
                for status in statuses {
                    sep.push_bind(*status);
                }
                qb.push(")");
            }
        }
        BlogListFilter::WhcInactiveMagentoActive => {
            qb.push(" WHERE b.offer_ext_status <> 1 AND b.is_sold = 0 AND p.status = 1");
        }
        BlogListFilter::WhcActiveNotApproved => {
            qb.push(" WHERE b.offer_ext_status = 1 AND b.is_approved = 0");
        }
        BlogListFilter::WhcActiveApproved => {
            qb.push(" WHERE b.offer_ext_status = 1 AND b.is_approved = 1");
        }
    }
    qb.push(" ORDER BY b.id DESC");
    qb
}

fn push_id_list(qb: &mut QueryBuilder<'_, MySql>, ids: &[i64]) {
    let mut sep = qb.separated(", ");
    for id in ids {
        sep.push_bind(*id);
    }
}

fn narrow_i32(col: &str, value: i64) -> Result<i32, sqlx::Error> {
    i32::try_from(value).map_err(|err| sqlx::Error::ColumnDecode {
        index: col.to_string(),
        source: Box::new(err),
    })
}

fn get_i32(row: &MySqlRow, col: &str) -> Result<i32, sqlx::Error> {
    narrow_i32(col, row.try_get(col)?)
}

fn get_opt_i32(row: &MySqlRow, col: &str) -> Result<Option<i32>, sqlx::Error> {
    row.try_get::<Option<i64>, _>(col)?
        .map(|v| narrow_i32(col, v))
        .transpose()
}

fn get_flag(row: &MySqlRow, col: &str) -> Result<bool, sqlx::Error> {
    Ok(row.try_get::<i64, _>(col)? != 0)
}

fn get_opt_flag(row: &MySqlRow, col: &str) -> Result<Option<bool>, sqlx::Error> {
    Ok(row.try_get::<Option<i64>, _>(col)?.map(|v| v != 0))
}

fn enrichment_from_row(row: &MySqlRow) -> Result<Enrichment, sqlx::Error> {
    Ok(Enrichment {
        offer_title: row.try_get("offer_title")?,
        supplier: row.try_get("supplier")?,
        offer_ext_status: get_opt_i32(row, "offer_ext_status")?,
        is_brand: get_opt_flag(row, "is_brand")?,
        is_b_group_appr: get_opt_flag(row, "is_b_group_appr")?,
        is_approved: get_opt_flag(row, "is_approved")?,
    })
}

fn source_row_from(row: &MySqlRow, joined: bool) -> Result<OfferBlogSourceRow, sqlx::Error> {
    let file = if get_flag(row, "has_file")? {
        Some(AttachedFile {
            file_name: row.try_get("file_name")?,
            file_path: row.try_get("file_path")?,
        })
    } else {
        None
    };
    let enrichment = if joined {
        enrichment_from_row(row)?
    } else {
        Enrichment::default()
    };
    Ok(OfferBlogSourceRow {
        id: row.try_get("id")?,
        offer_no: row.try_get("offer_no")?,
        title: row.try_get("title")?,
        status: get_i32(row, "status")?,
        description: row.try_get("description")?,
        created_at_whc: row.try_get("created_at_whc")?,
        updated_at_whc: row.try_get("updated_at_whc")?,
        file,
        enrichment,
    })
}

fn local_blog_from(row: &MySqlRow) -> Result<LocalOfferBlog, sqlx::Error> {
    let id: i64 = row.try_get("id")?;
    let publication = match row.try_get::<Option<i64>, _>("publication_id")? {
        Some(publication_id) => Some(MagentoPublication {
            id: publication_id,
            offer_blog_id: id,
            magento_blog_id: row.try_get("magento_blog_id")?,
            status: PublicationStatus::from_code(get_i32(row, "publication_status")?),
            url_key: row.try_get("url_key")?,
            created_magento_at: row.try_get("created_magento_at")?,
            created_at: row.try_get("publication_created_at")?,
            updated_at: row.try_get("publication_updated_at")?,
        }),
        None => None,
    };
    Ok(LocalOfferBlog {
        id,
        offer_no: row.try_get("offer_no")?,
        offer_title: row.try_get("offer_title")?,
        title: row.try_get("title")?,
        supplier: row.try_get("supplier")?,
        status: get_i32(row, "status")?,
        offer_ext_status: get_opt_i32(row, "offer_ext_status")?,
        is_brand: get_opt_flag(row, "is_brand")?,
        is_b_group_appr: get_opt_flag(row, "is_b_group_appr")?,
        is_approved: get_opt_flag(row, "is_approved")?,
        description: row.try_get("description")?,
        created_at_whc: row.try_get("created_at_whc")?,
        updated_at_whc: row.try_get("updated_at_whc")?,
        has_file: get_flag(row, "has_file")?,
        file_name: row.try_get("file_name")?,
        file_path: row.try_get("file_path")?,
        is_sold: get_flag(row, "is_sold")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        publication,
    })
}

/// Supplier database reader.
#[derive(Debug, Clone)]
pub struct MySqlOfferBlogSource {
    pool: MySqlPool,
    joined: bool,
    sql: String,
}

impl MySqlOfferBlogSource {
    pub fn new(pool: MySqlPool, enrichment: SourceEnrichment) -> Result<Self, StoreError> {
        let sql = source_chunk_sql(&enrichment)?;
        Ok(Self {
            pool,
            joined: matches!(enrichment, SourceEnrichment::Joined { .. }),
            sql,
        })
    }
}

#[async_trait]
impl OfferBlogSource for MySqlOfferBlogSource {
    async fn fetch_chunk(
        &self,
        after_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<OfferBlogSourceRow>, StoreError> {
        let rows = sqlx::query(&self.sql)
            .bind(after_id.unwrap_or(i64::MIN))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| source_row_from(row, self.joined))
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)
    }
}

/// Organization database reader for the split-connection variant.
#[derive(Debug, Clone)]
pub struct MySqlEnrichmentLookup {
    pool: MySqlPool,
}

impl MySqlEnrichmentLookup {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EnrichmentLookup for MySqlEnrichmentLookup {
    async fn lookup(&self, offer_nos: &[i64]) -> Result<HashMap<i64, Enrichment>, StoreError> {
        if offer_nos.is_empty() {
            return Ok(HashMap::new());
        }
        let mut qb = enrichment_query(offer_nos);
        let rows = qb.build().fetch_all(&self.pool).await?;
        let mut out = HashMap::with_capacity(rows.len());
        for row in &rows {
            let offer_no: i64 = row.try_get("offer_no")?;
            // Duplicate organization rows resolve to the first one returned.
            if !out.contains_key(&offer_no) {
                out.insert(offer_no, enrichment_from_row(row)?);
            }
        }
        Ok(out)
    }
}

/// Back-office database.
#[derive(Debug, Clone)]
pub struct MySqlTargetStore {
    pool: MySqlPool,
}

impl MySqlTargetStore {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl TargetStore for MySqlTargetStore {
    async fn begin(&self) -> Result<Box<dyn TargetTransaction>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(MySqlTargetTransaction { tx }))
    }

    async fn try_acquire_run_lock(
        &self,
        name: &str,
    ) -> Result<Option<Box<dyn RunLock>>, StoreError> {
        if name.is_empty() || name.len() > MAX_LOCK_NAME_LEN {
            return Err(StoreError::InvalidIdentifier(name.to_string()));
        }
        let mut conn = self.pool.acquire().await?;
        let acquired: Option<i64> = sqlx::query_scalar("SELECT GET_LOCK(?, 0)")
            .bind(name)
            .fetch_one(&mut *conn)
            .await?;
        if acquired == Some(1) {
            debug!(lock = name, "acquired advisory lock");
            Ok(Some(Box::new(MySqlRunLock {
                conn: Some(conn),
                name: name.to_string(),
            })))
        } else {
            Ok(None)
        }
    }

    async fn last_synced(&self) -> Result<Option<SyncLedger>, StoreError> {
        let last_synced: Option<DateTime<Utc>> =
            sqlx::query_scalar(&format!("SELECT last_synced FROM {LEDGER_TABLE} WHERE id = ?"))
                .bind(LEDGER_ROW_ID)
                .fetch_optional(&self.pool)
                .await?;
        Ok(last_synced.map(|last_synced| SyncLedger { last_synced }))
    }

    async fn list_blogs(&self, filter: &BlogListFilter) -> Result<Vec<LocalOfferBlog>, StoreError> {
        let mut qb = list_blogs_query(filter);
        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(local_blog_from)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)
    }

    async fn set_sold(&self, id: i64, sold: bool) -> Result<bool, StoreError> {
        let result = sqlx::query(&format!(
            "UPDATE {OFFER_BLOGS_TABLE} SET is_sold = ?, updated_at = ? WHERE id = ?"
        ))
        .bind(sold)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

pub struct MySqlTargetTransaction {
    tx: Transaction<'static, MySql>,
}

#[async_trait]
impl TargetTransaction for MySqlTargetTransaction {
    async fn sold_ids(&mut self, ids: &[i64]) -> Result<HashSet<i64>, StoreError> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }
        let mut qb = sold_ids_query(ids);
        let sold: Vec<i64> = qb
            .build_query_scalar()
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(sold.into_iter().collect())
    }

    async fn upsert_blogs(
        &mut self,
        rows: &[OfferBlogSourceRow],
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        for batch in rows.chunks(MAX_ROWS_PER_INSERT) {
            let mut qb = upsert_query(batch, now);
            qb.build().execute(&mut *self.tx).await?;
        }
        Ok(rows.len() as u64)
    }

    async fn record_success(&mut self, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(&format!(
            r#"
            INSERT INTO {LEDGER_TABLE} (id, last_synced, created_at, updated_at)
            VALUES (?, ?, ?, ?)
            ON DUPLICATE KEY UPDATE last_synced = VALUES(last_synced),
                                    updated_at = VALUES(updated_at)
            "#
        ))
        .bind(LEDGER_ROW_ID)
        .bind(at)
        .bind(at)
        .bind(at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

/// `GET_LOCK` is scoped to the session, so the guard pins one pooled connection.
pub struct MySqlRunLock {
    conn: Option<PoolConnection<MySql>>,
    name: String,
}

#[async_trait]
impl RunLock for MySqlRunLock {
    async fn release(self: Box<Self>) -> Result<(), StoreError> {
        let mut this = self;
        if let Some(mut conn) = this.conn.take() {
            sqlx::query("SELECT RELEASE_LOCK(?)")
                .bind(&this.name)
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }
}

impl Drop for MySqlRunLock {
    fn drop(&mut self) {
        // Closing the session frees the lock server-side; returning it to the
        // pool would keep the lock held.
        if let Some(conn) = self.conn.take() {
            drop(conn.detach());
        }
    }
}
