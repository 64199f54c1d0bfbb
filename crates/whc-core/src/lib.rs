//! Core domain model for the supplier offer blog mirror.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "whc-core";

/// Columns written by the sync on insert, in bind order.
pub const INSERT_COLUMNS: &[&str] = &[
    "id",
    "offer_no",
    "offer_title",
    "title",
    "supplier",
    "status",
    "offer_ext_status",
    "is_brand",
    "is_b_group_appr",
    "is_approved",
    "description",
    "created_at_whc",
    "updated_at_whc",
    "has_file",
    "file_name",
    "file_path",
    "is_sold",
    "created_at",
    "updated_at",
];

/// MySQL rejects prepared statements with more placeholders than this (error 1390).
pub const MAX_STATEMENT_PLACEHOLDERS: usize = u16::MAX as usize;

/// Largest number of rows one multi-row insert can bind.
pub const MAX_ROWS_PER_INSERT: usize = MAX_STATEMENT_PLACEHOLDERS / INSERT_COLUMNS.len();

/// Columns the sync may overwrite on an existing local row.
///
/// Never contains `id`, `is_sold`, `created_at` or anything owned by the
/// publication record.
pub const UPDATE_COLUMNS: &[&str] = &[
    "offer_no",
    "offer_title",
    "title",
    "supplier",
    "status",
    "offer_ext_status",
    "is_brand",
    "is_b_group_appr",
    "is_approved",
    "description",
    "created_at_whc",
    "updated_at_whc",
    "has_file",
    "file_name",
    "file_path",
    "updated_at",
];

/// Image attachment resolved from the latest file association of an offer blog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachedFile {
    pub file_name: Option<String>,
    pub file_path: Option<String>,
}

/// Fields joined in from the organization database, keyed by offer number.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Enrichment {
    pub offer_title: Option<String>,
    pub supplier: Option<String>,
    pub offer_ext_status: Option<i32>,
    pub is_brand: Option<bool>,
    pub is_b_group_appr: Option<bool>,
    pub is_approved: Option<bool>,
}

impl Enrichment {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// One merged row read from the supplier database, ready for upsert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferBlogSourceRow {
    pub id: i64,
    pub offer_no: Option<i64>,
    pub title: String,
    pub status: i32,
    pub description: String,
    pub created_at_whc: NaiveDateTime,
    pub updated_at_whc: NaiveDateTime,
    pub file: Option<AttachedFile>,
    #[serde(default)]
    pub enrichment: Enrichment,
}

impl OfferBlogSourceRow {
    pub fn has_file(&self) -> bool {
        self.file.is_some()
    }

    pub fn file_name(&self) -> Option<&str> {
        self.file.as_ref().and_then(|f| f.file_name.as_deref())
    }

    pub fn file_path(&self) -> Option<&str> {
        self.file.as_ref().and_then(|f| f.file_path.as_deref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublicationStatus {
    Inactive,
    Active,
}

impl PublicationStatus {
    pub fn code(self) -> i32 {
        match self {
            Self::Inactive => 0,
            Self::Active => 1,
        }
    }

    pub fn from_code(code: i32) -> Self {
        if code == 1 {
            Self::Active
        } else {
            Self::Inactive
        }
    }
}

/// External storefront post created when an operator publishes a blog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MagentoPublication {
    pub id: i64,
    pub offer_blog_id: i64,
    pub magento_blog_id: i64,
    pub status: PublicationStatus,
    pub url_key: String,
    pub created_magento_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Persisted mirror of an offer blog in the back-office database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalOfferBlog {
    pub id: i64,
    pub offer_no: Option<i64>,
    pub offer_title: Option<String>,
    pub title: String,
    pub supplier: Option<String>,
    pub status: i32,
    pub offer_ext_status: Option<i32>,
    pub is_brand: Option<bool>,
    pub is_b_group_appr: Option<bool>,
    pub is_approved: Option<bool>,
    pub description: String,
    pub created_at_whc: NaiveDateTime,
    pub updated_at_whc: NaiveDateTime,
    pub has_file: bool,
    pub file_name: Option<String>,
    pub file_path: Option<String>,
    pub is_sold: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub publication: Option<MagentoPublication>,
}

impl LocalOfferBlog {
    /// Fresh local row for a source row that has no local counterpart yet.
    pub fn inserted_from(row: &OfferBlogSourceRow, now: DateTime<Utc>) -> Self {
        let mut blog = Self {
            id: row.id,
            offer_no: None,
            offer_title: None,
            title: String::new(),
            supplier: None,
            status: 0,
            offer_ext_status: None,
            is_brand: None,
            is_b_group_appr: None,
            is_approved: None,
            description: String::new(),
            created_at_whc: row.created_at_whc,
            updated_at_whc: row.updated_at_whc,
            has_file: false,
            file_name: None,
            file_path: None,
            is_sold: false,
            created_at: now,
            updated_at: now,
            publication: None,
        };
        blog.apply_synced_fields(row, now);
        blog
    }

    /// Overwrite exactly the columns in [`UPDATE_COLUMNS`].
    pub fn apply_synced_fields(&mut self, row: &OfferBlogSourceRow, now: DateTime<Utc>) {
        self.offer_no = row.offer_no;
        self.offer_title = row.enrichment.offer_title.clone();
        self.title = row.title.clone();
        self.supplier = row.enrichment.supplier.clone();
        self.status = row.status;
        self.offer_ext_status = row.enrichment.offer_ext_status;
        self.is_brand = row.enrichment.is_brand;
        self.is_b_group_appr = row.enrichment.is_b_group_appr;
        self.is_approved = row.enrichment.is_approved;
        self.description = row.description.clone();
        self.created_at_whc = row.created_at_whc;
        self.updated_at_whc = row.updated_at_whc;
        self.has_file = row.has_file();
        self.file_name = row.file_name().map(ToString::to_string);
        self.file_path = row.file_path().map(ToString::to_string);
        self.updated_at = now;
    }
}

/// Singleton "last synchronized at" record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncLedger {
    pub last_synced: DateTime<Utc>,
}

/// Back-office listing filter. The boolean presets are mutually exclusive and
/// take precedence over the status list.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum BlogListFilter {
    #[default]
    All,
    Statuses {
        statuses: Vec<i32>,
    },
    WhcInactiveMagentoActive,
    WhcActiveNotApproved,
    WhcActiveApproved,
}

impl BlogListFilter {
    /// In-process evaluation with SQL null semantics: a null column never
    /// satisfies a comparison.
    pub fn matches(&self, blog: &LocalOfferBlog) -> bool {
        match self {
            Self::All => true,
            Self::Statuses { statuses } => {
                statuses.is_empty()
                    || blog
                        .offer_ext_status
                        .map(|s| statuses.contains(&s))
                        .unwrap_or(false)
            }
            Self::WhcInactiveMagentoActive => {
                matches!(blog.offer_ext_status, Some(s) if s != 1)
                    && !blog.is_sold
                    && blog
                        .publication
                        .as_ref()
                        .map(|p| p.status == PublicationStatus::Active)
                        .unwrap_or(false)
            }
            Self::WhcActiveNotApproved => {
                blog.offer_ext_status == Some(1) && blog.is_approved == Some(false)
            }
            Self::WhcActiveApproved => {
                blog.offer_ext_status == Some(1) && blog.is_approved == Some(true)
            }
        }
    }
}
