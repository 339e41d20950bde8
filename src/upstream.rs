//! Upstream binary-cache client: ordered fallback, health tracking,
//! priority discovery via the upstream's own `/nix-cache-info`.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use tokio::sync::RwLock;

use crate::nar_url::NarUrl;
use crate::narinfo::NarInfo;
use crate::netrc::Netrc;

const HEALTH_PROBE_INTERVAL: Duration = Duration::from_secs(60);
const MAX_REDIRECTS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Health {
    Unknown = 0,
    Healthy = 1,
    Unhealthy = 2,
}

impl From<u8> for Health {
    fn from(v: u8) -> Self {
        match v {
            1 => Self::Healthy,
            2 => Self::Unhealthy,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("not found")]
    NotFound,
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("narinfo returned by upstream does not parse: {0}")]
    InvalidNarInfo(#[from] crate::narinfo::NarInfoParseError),
    /// The NARInfo's own hash does not match the requested hash.
    #[error("upstream returned a narinfo for a different hash")]
    BadData,
}

pub struct NarStream {
    pub content_encoding: Option<String>,
    pub size: Option<u64>,
    pub stream: Box<dyn futures::Stream<Item = reqwest::Result<bytes::Bytes>> + Send + Unpin>,
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub url: url::Url,
    pub public_keys: Vec<String>,
    pub dial_timeout: Duration,
    pub response_header_timeout: Duration,
}

/// One configured upstream cache, with its own HTTP client, discovered
/// priority, and health state.
#[derive(Debug)]
pub struct Upstream {
    config: UpstreamConfig,
    client: reqwest::Client,
    priority: RwLock<u32>,
    health: AtomicU8,
    netrc: Option<Arc<Netrc>>,
    self_weak: std::sync::Weak<Upstream>,
}

impl Upstream {
    /// Returns the constructed upstream already wrapped in its `Arc`: a
    /// weak self-reference is threaded through at construction so a
    /// failed request can spawn an out-of-band re-probe of itself.
    pub fn new(config: UpstreamConfig, netrc: Option<Arc<Netrc>>) -> anyhow::Result<Arc<Self>> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.dial_timeout)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()?;

        Ok(Arc::new_cyclic(|weak| Self {
            config,
            client,
            priority: RwLock::new(u32::MAX),
            health: AtomicU8::new(Health::Unknown as u8),
            netrc,
            self_weak: weak.clone(),
        }))
    }

    pub fn url(&self) -> &url::Url {
        &self.config.url
    }

    pub fn health(&self) -> Health {
        self.health.load(Ordering::Relaxed).into()
    }

    pub async fn priority(&self) -> u32 {
        *self.priority.read().await
    }

    fn basic_auth_for(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let Some(host) = self.config.url.host_str() else {
            return request;
        };
        let Some(netrc) = &self.netrc else {
            return request;
        };
        match netrc.credentials_for(host) {
            Some(creds) => request.basic_auth(&creds.login, Some(&creds.password)),
            None => request,
        }
    }

    /// Probes `/nix-cache-info`, updating both priority (on first success)
    /// and health. Call at construction and every 60s thereafter.
    #[tracing::instrument(skip(self), fields(url = %self.config.url))]
    pub async fn probe(&self) {
        let probe_url = self.config.url.join("nix-cache-info").expect("valid base url");
        let request = self.basic_auth_for(self.client.get(probe_url));

        match request.send().await.and_then(|r| r.error_for_status()) {
            Ok(response) => {
                self.health.store(Health::Healthy as u8, Ordering::Relaxed);
                if let Ok(text) = response.text().await {
                    if let Some(priority) = parse_priority(&text) {
                        *self.priority.write().await = priority;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "upstream health probe failed");
                self.health.store(Health::Unhealthy as u8, Ordering::Relaxed);
            }
        }
    }

    /// Spawns the periodic health-probe loop; the returned handle should
    /// be aborted on shutdown.
    pub fn spawn_health_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                this.probe().await;
                tokio::time::sleep(HEALTH_PROBE_INTERVAL).await;
            }
        })
    }

    fn note_request_failure(&self) {
        self.health.store(Health::Unhealthy as u8, Ordering::Relaxed);
        self.trigger_probe();
    }

    /// Forces an immediate out-of-band probe instead of waiting for the
    /// next periodic tick. Spawned rather than awaited so request paths
    /// never block on it.
    pub fn trigger_probe(&self) {
        let Some(this) = self.self_weak.upgrade() else {
            return;
        };
        tokio::spawn(async move { this.probe().await });
    }

    pub async fn get_narinfo(&self, hash: &crate::hash::Hash) -> Result<(NarInfo, String), UpstreamError> {
        let narinfo_url = self
            .config
            .url
            .join(&format!("{hash}.narinfo"))
            .expect("hash is validated nix32");

        let request = self.basic_auth_for(self.client.get(narinfo_url));
        let response = request.send().await.map_err(|e| {
            self.note_request_failure();
            UpstreamError::Request(e)
        })?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(UpstreamError::NotFound);
        }
        let response = response.error_for_status().map_err(|e| {
            self.note_request_failure();
            UpstreamError::Request(e)
        })?;

        let text = response.text().await.map_err(|e| {
            self.note_request_failure();
            UpstreamError::Request(e)
        })?;

        let narinfo: NarInfo = text.parse()?;
        if narinfo.hash() != hash {
            return Err(UpstreamError::BadData);
        }

        Ok((narinfo, text))
    }

    pub async fn get_nar(&self, url: &NarUrl) -> Result<NarStream, UpstreamError> {
        let nar_url = self
            .config
            .url
            .join(&url.to_string())
            .expect("nar url is well-formed");

        let request = self
            .basic_auth_for(self.client.get(nar_url))
            .header("Accept-Encoding", "identity");

        let response = request.send().await.map_err(|e| {
            self.note_request_failure();
            UpstreamError::Request(e)
        })?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(UpstreamError::NotFound);
        }
        let response = response.error_for_status().map_err(|e| {
            self.note_request_failure();
            UpstreamError::Request(e)
        })?;

        let content_encoding = response
            .headers()
            .get(reqwest::header::CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let size = response.content_length();

        Ok(NarStream {
            content_encoding,
            size,
            stream: Box::new(response.bytes_stream()),
        })
    }
}

fn parse_priority(nix_cache_info: &str) -> Option<u32> {
    nix_cache_info.lines().find_map(|line| {
        line.strip_prefix("Priority:")
            .and_then(|v| v.trim().parse().ok())
    })
}

/// The ordered set of configured upstreams, queried in priority order
/// with health-aware fallback.
#[derive(Debug, Clone)]
pub struct UpstreamSet {
    upstreams: Arc<Vec<Arc<Upstream>>>,
}

impl UpstreamSet {
    pub fn new(upstreams: Vec<Arc<Upstream>>) -> Self {
        Self {
            upstreams: Arc::new(upstreams),
        }
    }

    pub fn spawn_health_loops(&self) -> Vec<tokio::task::JoinHandle<()>> {
        self.upstreams.iter().map(|u| u.spawn_health_loop()).collect()
    }

    /// Healthy-first, then priority, falling back to unhealthy upstreams
    /// only once every healthy one has been tried.
    async fn ordered(&self) -> Vec<Arc<Upstream>> {
        let mut with_priority = Vec::new();
        for u in self.upstreams.iter() {
            with_priority.push((u.clone(), u.priority().await));
        }

        let (mut healthy, mut rest): (Vec<_>, Vec<_>) = with_priority
            .into_iter()
            .partition(|(u, _)| u.health() != Health::Unhealthy);

        healthy.sort_by_key(|(_, p)| *p);
        rest.sort_by_key(|(_, p)| *p);

        healthy.into_iter().chain(rest).map(|(u, _)| u).collect()
    }

    pub async fn get_narinfo(&self, hash: &crate::hash::Hash) -> Result<(NarInfo, String, Arc<Upstream>), UpstreamError> {
        let mut last_err = UpstreamError::NotFound;
        for upstream in self.ordered().await {
            match upstream.get_narinfo(hash).await {
                Ok((info, raw)) => return Ok((info, raw, upstream)),
                Err(UpstreamError::NotFound) => continue,
                Err(e) => {
                    last_err = e;
                    continue;
                }
            }
        }
        Err(last_err)
    }

    pub async fn get_nar_from(
        &self,
        preferred: Option<&Arc<Upstream>>,
        url: &NarUrl,
    ) -> Result<NarStream, UpstreamError> {
        if let Some(preferred) = preferred {
            match preferred.get_nar(url).await {
                Ok(stream) => return Ok(stream),
                Err(UpstreamError::NotFound) => {}
                Err(e) if !matches!(e, UpstreamError::Request(_)) => return Err(e),
                Err(_) => {}
            }
        }

        let mut last_err = UpstreamError::NotFound;
        for upstream in self.ordered().await {
            match upstream.get_nar(url).await {
                Ok(stream) => return Ok(stream),
                Err(UpstreamError::NotFound) => continue,
                Err(e) => {
                    last_err = e;
                    continue;
                }
            }
        }
        Err(last_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_priority_from_nix_cache_info() {
        let body = "StoreDir: /nix/store\nWantMassQuery: 1\nPriority: 10\n";
        assert_eq!(parse_priority(body), Some(10));
    }

    #[test]
    fn missing_priority_line_yields_none() {
        assert_eq!(parse_priority("StoreDir: /nix/store\n"), None);
    }

    #[test]
    fn health_round_trips_through_u8() {
        assert_eq!(Health::from(Health::Healthy as u8), Health::Healthy);
        assert_eq!(Health::from(Health::Unhealthy as u8), Health::Unhealthy);
        assert_eq!(Health::from(99), Health::Unknown);
    }
}
