//! Introspection, nested under `/admin`. The job-queue-era
//! `nar_status`/`cache_nar`/`purge_nar` actions are gone now that
//! fetches happen synchronously inline with the request that needs
//! them; what is left is read-only visibility into how full the cache
//! is and how it has drifted from its upstreams, generalized from the
//! teacher's same-named endpoints onto the new index/storage schema.

use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::app;
use crate::error::{Error, Result};
use crate::upstream::UpstreamError;

pub(super) fn router() -> axum::Router<app::State> {
    use axum::routing::get;

    axum::Router::new()
        .route("/cache_size", get(cache_size))
        .route("/list_cached", get(list_cached))
        .route("/list_cache_diff", get(list_cache_diff))
}

#[derive(Debug, Serialize)]
struct CacheSize {
    narinfo_count: u64,
    nar_count: u64,
    nar_bytes: u64,
    max_bytes: Option<u64>,
}

async fn cache_size(State(state): State<app::State>) -> Result<impl IntoResponse> {
    let index = state.cache.index();

    let narinfo_count = index.narinfo_count().await.map_err(Error::Index)?;
    let nar_count = index.nar_count().await.map_err(Error::Index)?;
    let nar_bytes = index.total_nar_size().await.map_err(Error::Index)?;

    Ok(Json(CacheSize {
        narinfo_count,
        nar_count,
        nar_bytes,
        max_bytes: state.config.max_size.map(|b| b.as_u64()),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct ListLimit {
    limit: usize,
}

impl Default for ListLimit {
    fn default() -> Self {
        Self { limit: 30 }
    }
}

/// Reads the narinfo body for `hash` and returns its store path, or
/// `None` if it vanished from storage between the index lookup and now
/// (a race with eviction, not an error worth failing the whole listing over).
async fn store_path_of(state: &app::State, hash: &crate::hash::Hash) -> Option<String> {
    let raw = state.cache.storage().narinfo_get(hash).await.ok()?;
    let text = String::from_utf8(raw).ok()?;
    let narinfo: crate::narinfo::NarInfo = text.parse().ok()?;
    Some(narinfo.store_path.to_string())
}

#[derive(Debug, Serialize)]
struct ListCached {
    total: u64,
    store_paths: Vec<String>,
}

async fn list_cached(
    Query(ListLimit { limit }): Query<ListLimit>,
    State(state): State<app::State>,
) -> Result<impl IntoResponse> {
    let hashes = state.cache.index().all_narinfo_hashes().await.map_err(Error::Index)?;
    let total = hashes.len() as u64;

    let mut store_paths = Vec::with_capacity(limit.min(hashes.len()));
    for hash in hashes.into_iter().take(limit) {
        if let Some(path) = store_path_of(&state, &hash).await {
            store_paths.push(path);
        }
    }

    Ok(Json(ListCached { total, store_paths }))
}

#[derive(Debug, Serialize)]
struct ListCacheDiff {
    /// Number of cached entries inspected (bounded by `limit`), not the
    /// total cache size — see `cache_size` for that.
    inspected: u64,
    missing_upstream: Vec<String>,
}

/// Store paths present in the local index but no longer obtainable from
/// any configured upstream — entries that have effectively gone stale
/// relative to where they came from.
async fn list_cache_diff(
    Query(ListLimit { limit }): Query<ListLimit>,
    State(state): State<app::State>,
) -> Result<impl IntoResponse> {
    let hashes = state.cache.index().all_narinfo_hashes().await.map_err(Error::Index)?;
    let inspected = hashes.len().min(limit) as u64;

    let mut missing_upstream = Vec::new();
    for hash in hashes.into_iter().take(limit) {
        match state.cache.upstreams().get_narinfo(&hash).await {
            Ok(_) => continue,
            Err(UpstreamError::NotFound) => {
                if let Some(path) = store_path_of(&state, &hash).await {
                    missing_upstream.push(path);
                }
            }
            Err(_) => continue,
        }
    }

    Ok(Json(ListCacheDiff {
        inspected,
        missing_upstream,
    }))
}
