use std::str::FromStr;

use axum::body::StreamBody;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use serde_with::DeserializeFromStr;

use crate::app;
use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::nar_url::NarUrl;

pub(super) fn router() -> axum::Router<app::State> {
    use axum::routing::{delete, get, put};

    axum::Router::new()
        .route("/nix-cache-info", get(nix_cache_info))
        .route(
            "/:narinfo_path",
            get(get_narinfo).head(head_narinfo).put(put_narinfo).delete(delete_narinfo),
        )
        .route(
            "/nar/:nar_path",
            get(get_nar).head(head_nar).put(put_nar).delete(delete_nar),
        )
        .route("/metrics", get(metrics))
}

async fn nix_cache_info(State(state): State<app::State>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/x-nix-cache-info")],
        format!(
            "StoreDir: /nix/store\nWantMassQuery: 1\nPriority: 40\n# served by {}\n",
            state.config.hostname
        ),
    )
}

/// `/{hash}.narinfo` path parameter.
#[derive(Debug, DeserializeFromStr)]
struct NarInfoPath(Hash);

impl FromStr for NarInfoPath {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.strip_suffix(".narinfo") {
            Some(hash) => Ok(Self(hash.parse()?)),
            None => Err(Error::InvalidInput(format!("expected <hash>.narinfo, got {s:?}"))),
        }
    }
}

async fn head_narinfo(
    Path(NarInfoPath(hash)): Path<NarInfoPath>,
    State(state): State<app::State>,
) -> Result<StatusCode> {
    state.cache.get_narinfo(&hash).await?;
    Ok(StatusCode::OK)
}

async fn get_narinfo(
    Path(NarInfoPath(hash)): Path<NarInfoPath>,
    State(state): State<app::State>,
) -> Result<impl IntoResponse> {
    let result = state.cache.get_narinfo(&hash).await?;
    Ok((
        [(header::CONTENT_TYPE, "text/x-nix-narinfo")],
        result.narinfo.to_string(),
    ))
}

async fn put_narinfo(
    Path(NarInfoPath(hash)): Path<NarInfoPath>,
    State(state): State<app::State>,
    body: axum::body::Bytes,
) -> Result<StatusCode> {
    if !state.config.allow_put_verb {
        return Err(Error::Unauthorized);
    }

    if state.cache.has_narinfo(&hash).await? {
        return Err(Error::AlreadyExists);
    }

    state.cache.put_narinfo(&hash, &body).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_narinfo(
    Path(NarInfoPath(hash)): Path<NarInfoPath>,
    State(state): State<app::State>,
) -> Result<StatusCode> {
    if !state.config.allow_delete_verb {
        return Err(Error::Unauthorized);
    }

    if !state.cache.has_narinfo(&hash).await? {
        return Err(Error::NotFound);
    }

    state.cache.delete_narinfo(&hash).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `/nar/{hash}[.ext]` path parameter, reusing [`NarUrl`]'s own parser
/// for the part after the `nar/` prefix (which axum has already
/// stripped by routing on `/nar/:nar_path`).
#[derive(Debug, DeserializeFromStr)]
struct NarPath(NarUrl);

impl FromStr for NarPath {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(format!("nar/{s}").parse()?))
    }
}

fn content_type_for(url: &NarUrl) -> String {
    format!("application/x-nix-nar{}", url.compression.content_type_suffix())
}

async fn head_nar(
    Path(NarPath(url)): Path<NarPath>,
    State(state): State<app::State>,
) -> Result<StatusCode> {
    state.cache.get_nar(&url).await?;
    Ok(StatusCode::OK)
}

async fn get_nar(
    Path(NarPath(url)): Path<NarPath>,
    State(state): State<app::State>,
) -> Result<impl IntoResponse> {
    let nar = state.cache.get_nar(&url).await?;
    let body = StreamBody::new(tokio_util::io::ReaderStream::new(nar.stream));

    Ok((
        [
            (header::CONTENT_TYPE, content_type_for(&url)),
            (header::CONTENT_LENGTH, nar.size.to_string()),
        ],
        body,
    ))
}

async fn put_nar(
    Path(NarPath(url)): Path<NarPath>,
    State(state): State<app::State>,
    body: axum::body::Bytes,
) -> Result<StatusCode> {
    if !state.config.allow_put_verb {
        return Err(Error::Unauthorized);
    }

    if state.cache.storage().nar_has(&url).await.map_err(Error::from)? {
        return Err(Error::AlreadyExists);
    }

    let size = body.len() as u64;
    state
        .cache
        .put_nar(&url, size, Box::pin(std::io::Cursor::new(body.to_vec())))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_nar(
    Path(NarPath(url)): Path<NarPath>,
    State(state): State<app::State>,
) -> Result<StatusCode> {
    if !state.config.allow_delete_verb {
        return Err(Error::Unauthorized);
    }

    if !state.cache.storage().nar_has(&url).await.map_err(Error::from)? {
        return Err(Error::NotFound);
    }

    state.cache.delete_nar(&url).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn metrics(State(state): State<app::State>) -> Result<impl IntoResponse> {
    let total_size = state.cache.index().total_nar_size().await.map_err(Error::Index)?;

    let body = format!(
        "# HELP cache_proxy_nar_bytes_total Total bytes of cached NAR bodies.\n\
# TYPE cache_proxy_nar_bytes_total gauge\n\
cache_proxy_nar_bytes_total {total_size}\n"
    );

    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}
