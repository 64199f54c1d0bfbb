//! Axum JSON surface for the back-office offer blog mirror.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};
use whc_core::{BlogListFilter, LocalOfferBlog};
use whc_storage::TargetStore;
use whc_sync::{OfferBlogSync, SyncConfig, SYNC_FAILED_MESSAGE};

pub const CRATE_NAME: &str = "whc-web";

pub const FILE_URL_PREFIX: &str = "/whc-files";

#[derive(Clone)]
pub struct AppState {
    pub sync: Arc<OfferBlogSync>,
    pub file_directory: Option<PathBuf>,
    /// Supplier site base URL, echoed to the listing for deep links.
    pub supplier_url: Option<String>,
}

impl AppState {
    pub fn new(sync: Arc<OfferBlogSync>) -> Self {
        Self {
            sync,
            file_directory: None,
            supplier_url: None,
        }
    }

    pub fn with_file_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.file_directory = Some(dir.into());
        self
    }

    pub fn with_supplier_url(mut self, url: impl Into<String>) -> Self {
        self.supplier_url = Some(url.into());
        self
    }
}

/// Listing query string. The three presets win over `statuses`, in order.
/// Echoed back as given, so only supplied keys serialize.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BlogListQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub whc_not_active_but_magento_active: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub whc_active_but_whc_not_approved: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub whc_active_and_whc_approved: Option<String>,
    /// Comma-separated `offer_ext_status` codes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statuses: Option<String>,
}

impl BlogListQuery {
    pub fn filter(&self) -> BlogListFilter {
        if truthy(&self.whc_not_active_but_magento_active) {
            return BlogListFilter::WhcInactiveMagentoActive;
        }
        if truthy(&self.whc_active_but_whc_not_approved) {
            return BlogListFilter::WhcActiveNotApproved;
        }
        if truthy(&self.whc_active_and_whc_approved) {
            return BlogListFilter::WhcActiveApproved;
        }

        let statuses = self
            .statuses
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .filter_map(|s| s.trim().parse::<i32>().ok())
            .collect::<Vec<_>>();
        if statuses.is_empty() {
            BlogListFilter::All
        } else {
            BlogListFilter::Statuses { statuses }
        }
    }
}

fn truthy(value: &Option<String>) -> bool {
    matches!(
        value.as_deref().map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Some("1" | "true" | "on" | "yes")
    )
}

#[derive(Debug, Serialize)]
struct BlogListResponse {
    blogs: Vec<LocalOfferBlog>,
    last_synced: Option<DateTime<Utc>>,
    file_url_prefix: &'static str,
    filters: BlogListQuery,
    supplier_url: Option<String>,
}

#[derive(Debug, Serialize)]
struct SyncResponse {
    synced: bool,
    last_synced: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct FileQuery {
    path: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/whc-supplier-blog", get(list_handler))
        .route("/whc-supplier-blog/sync", post(sync_handler))
        .route("/whc-supplier-blog/sync/status", get(status_handler))
        .route(FILE_URL_PREFIX, get(file_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let port: u16 = std::env::var("WHC_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);

    let sync = Arc::new(whc_sync::connect_from_config(&config).await?);
    let scheduler = whc_sync::maybe_build_scheduler(Arc::clone(&sync), &config).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!(cron = %config.sync_cron, "scheduled offer blog sync enabled");
    }

    let mut state = AppState::new(sync);
    if let Some(dir) = std::env::var("WHC_FILE_DIRECTORY")
        .ok()
        .filter(|v| !v.trim().is_empty())
    {
        state = state.with_file_directory(dir);
    }
    if let Some(url) = std::env::var("WHC_SUPPLIER_URL")
        .ok()
        .filter(|v| !v.trim().is_empty())
    {
        state = state.with_supplier_url(url);
    }

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving back-office api");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn list_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<BlogListQuery>,
) -> Response {
    let blogs = match state.sync.target().list_blogs(&query.filter()).await {
        Ok(blogs) => blogs,
        Err(err) => return server_error(err.into()),
    };
    match state.sync.last_synced().await {
        Ok(ledger) => Json(BlogListResponse {
            blogs,
            last_synced: ledger.map(|l| l.last_synced),
            file_url_prefix: FILE_URL_PREFIX,
            filters: query,
            supplier_url: state.supplier_url.clone(),
        })
        .into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn sync_handler(State(state): State<Arc<AppState>>) -> Response {
    if !state.sync.sync().await {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({ "message": SYNC_FAILED_MESSAGE })),
        )
            .into_response();
    }
    match state.sync.last_synced().await {
        Ok(ledger) => Json(SyncResponse {
            synced: true,
            last_synced: ledger.map(|l| l.last_synced),
        })
        .into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.sync.state()).into_response()
}

async fn file_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FileQuery>,
) -> Response {
    let (Some(base), Some(requested)) = (state.file_directory.as_deref(), query.path.as_deref())
    else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let path = match resolve_file(base, requested).await {
        Ok(path) => path,
        Err(FileLookup::Forbidden) => return (StatusCode::FORBIDDEN, "Forbidden").into_response(),
        Err(FileLookup::NotFound) => return StatusCode::NOT_FOUND.into_response(),
    };
    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            let mime = mime_guess::from_path(&path).first_or_octet_stream();
            ([(header::CONTENT_TYPE, mime.as_ref())], bytes).into_response()
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "reading supplier file failed");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum FileLookup {
    NotFound,
    Forbidden,
}

/// Resolve `requested` under `base`, rejecting anything that lands outside it
/// either lexically or through a symlink.
async fn resolve_file(base: &Path, requested: &str) -> Result<PathBuf, FileLookup> {
    let relative = lexical_relative(requested).ok_or(FileLookup::Forbidden)?;
    if relative.as_os_str().is_empty() {
        return Err(FileLookup::NotFound);
    }

    let base = tokio::fs::canonicalize(base)
        .await
        .map_err(|_| FileLookup::NotFound)?;
    let resolved = tokio::fs::canonicalize(base.join(&relative))
        .await
        .map_err(|_| FileLookup::NotFound)?;
    if !resolved.starts_with(&base) {
        return Err(FileLookup::Forbidden);
    }

    match tokio::fs::metadata(&resolved).await {
        Ok(meta) if meta.is_file() => Ok(resolved),
        _ => Err(FileLookup::NotFound),
    }
}

/// Leading separators are ignored; `..` may not climb above the base.
fn lexical_relative(requested: &str) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in Path::new(requested.trim()).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

fn server_error(err: anyhow::Error) -> Response {
    warn!(error = %format!("{err:#}"), "back-office request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}
