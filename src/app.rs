//! Process wiring: reads config, builds the storage/index/lock/upstream
//! backends named by it, loads or provisions the signing key, and runs
//! the HTTP server alongside the LRU eviction job.

use std::sync::Arc;

use anyhow::Context as _;

use crate::config::{self, Config, StorageConfig};
use crate::engine::Cache;
use crate::http;
use crate::index::{Index, IndexConfig};
use crate::lock::{LocalLocker, LocalRwLocker, Locker, RedisLocker, RetryConfig, RwLocker};
use crate::lru;
use crate::netrc::Netrc;
use crate::signing::Signer;
use crate::storage::local::{LocalStorage, LocalStorageConfig};
use crate::storage::s3::{S3CredentialsConfig, S3Storage, S3StorageConfig};
use crate::storage::Storage;
use crate::upstream::{Upstream, UpstreamConfig, UpstreamSet};

const SECRET_KEY_NAME: &str = "secret-key";
const DEFAULT_LRU_SCHEDULE: &str = "0 0 * * * *";

#[derive(Clone, Debug)]
pub struct State {
    pub config: Arc<Config>,
    pub cache: Arc<Cache>,
}

pub struct App {
    config: Arc<Config>,
    cache: Arc<Cache>,
    server: http::Server,
    lru_config: lru::LruConfig,
    server_shutdown_tx: tokio::sync::oneshot::Sender<()>,
}

impl App {
    #[tracing::instrument(name = "app_init")]
    pub async fn new() -> anyhow::Result<Self> {
        let config = config::get();

        let storage = build_storage(&config)
            .await
            .context("failed to initialize storage backend")?;

        let index = Index::connect(&IndexConfig {
            database_url: config.database_url.clone(),
            max_open_conns: config.database.pool.max_open_conns,
            max_idle_conns: config.database.pool.max_idle_conns,
        })
        .await
        .context("failed to connect to index database")?;

        let signer = if config.sign_narinfo {
            Some(
                load_or_generate_signer(&config, storage.as_ref())
                    .await
                    .context("failed to load or provision signing key")?,
            )
        } else {
            None
        };

        let netrc = load_netrc().map(Arc::new);
        let upstreams = build_upstreams(&config, netrc).context("failed to build upstream set")?;
        upstreams.spawn_health_loops();

        let (narinfo_locker, nar_locker, rw_locker) = build_lockers(&config).await?;

        let temp_dir = config.temp_path.clone().unwrap_or_else(std::env::temp_dir);
        tokio::fs::create_dir_all(&temp_dir)
            .await
            .with_context(|| format!("failed to create temp dir {temp_dir:?}"))?;

        let cache = Arc::new(Cache::new(
            storage,
            index,
            narinfo_locker,
            nar_locker,
            rw_locker,
            upstreams,
            signer,
            temp_dir,
        ));

        let (server_shutdown_tx, server_shutdown_rx) = tokio::sync::oneshot::channel();
        let server = http::Server::new(server_shutdown_rx);

        let schedule_expr = config.lru.schedule.as_deref().unwrap_or(DEFAULT_LRU_SCHEDULE);
        let schedule = lru::parse_schedule(schedule_expr).context("invalid cache.lru.schedule")?;
        let timezone = lru::parse_timezone(&config.lru.timezone).context("invalid cache.lru.timezone")?;

        let lru_config = lru::LruConfig {
            schedule,
            timezone,
            max_size: config.max_size.map(|b| b.as_u64()),
            low_watermark: 0.9,
        };

        Ok(Self {
            config: Arc::new(config),
            cache,
            server,
            lru_config,
            server_shutdown_tx,
        })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let Self {
            config,
            cache,
            server,
            lru_config,
            server_shutdown_tx,
        } = self;

        let state = State {
            config,
            cache: cache.clone(),
        };

        tokio::spawn({
            let cache = cache.clone();
            async move { lru::run(cache, lru_config).await }
        });

        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("received shutdown signal");
            server_shutdown_tx.send(()).ok();
        });

        server.run(state).await?;

        tracing::info!("closing index connection pool");
        cache.index().close().await;

        Ok(())
    }
}

async fn build_storage(config: &Config) -> anyhow::Result<Arc<dyn Storage>> {
    match &config.storage {
        StorageConfig::Local { path } => {
            let storage = LocalStorage::new(LocalStorageConfig { path: path.clone() }).await?;
            Ok(Arc::new(storage))
        }
        StorageConfig::S3(settings) => {
            let credentials = match (&settings.access_key_id, &settings.secret_access_key) {
                (Some(access_key_id), Some(secret_access_key)) => Some(S3CredentialsConfig {
                    access_key_id: access_key_id.clone(),
                    secret_access_key: secret_access_key.clone(),
                }),
                _ => None,
            };

            let storage = S3Storage::new(S3StorageConfig {
                region: settings.region.clone(),
                bucket: settings.bucket.clone(),
                endpoint: settings.endpoint.clone(),
                credentials,
            })
            .await?;
            Ok(Arc::new(storage))
        }
    }
}

/// Loads the signing keypair from storage, generating and persisting one
/// on first boot. A concurrent winner of the first-boot race is handled
/// by re-reading after an `AlreadyExists` from `config_put`.
async fn load_or_generate_signer(config: &Config, storage: &dyn Storage) -> anyhow::Result<Signer> {
    if let Some(path) = &config.secret_key_path {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read secret key from {path:?}"))?;
        return Signer::from_canonical(text.trim()).map_err(|e| anyhow::anyhow!(e));
    }

    match storage.config_get(SECRET_KEY_NAME).await {
        Ok(bytes) => {
            let text = String::from_utf8(bytes).context("stored secret key is not utf-8")?;
            Signer::from_canonical(text.trim()).map_err(|e| anyhow::anyhow!(e))
        }
        Err(crate::storage::StorageError::NotFound) => {
            tracing::info!("no signing key found, provisioning a new one");
            let (signer, canonical) = Signer::generate(format!("{}-1", config.hostname));

            match storage.config_put(SECRET_KEY_NAME, canonical.as_bytes()).await {
                Ok(()) => Ok(signer),
                Err(crate::storage::StorageError::AlreadyExists) => {
                    let bytes = storage.config_get(SECRET_KEY_NAME).await?;
                    let text = String::from_utf8(bytes).context("stored secret key is not utf-8")?;
                    Signer::from_canonical(text.trim()).map_err(|e| anyhow::anyhow!(e))
                }
                Err(e) => Err(e.into()),
            }
        }
        Err(e) => Err(e.into()),
    }
}

fn load_netrc() -> Option<Netrc> {
    let path = std::env::var("NETRC")
        .ok()
        .map(std::path::PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| std::path::PathBuf::from(home).join(".netrc")))?;

    let content = std::fs::read_to_string(&path).ok()?;
    Some(Netrc::parse(&content))
}

fn build_upstreams(config: &Config, netrc: Option<Arc<Netrc>>) -> anyhow::Result<UpstreamSet> {
    let upstreams = config
        .upstream
        .urls
        .iter()
        .map(|url| {
            let upstream_config = UpstreamConfig {
                url: url.clone(),
                public_keys: config.upstream.public_keys.clone(),
                dial_timeout: config.upstream.dialer_timeout,
                response_header_timeout: config.upstream.response_header_timeout,
            };
            Upstream::new(upstream_config, netrc.clone())
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    Ok(UpstreamSet::new(upstreams))
}

/// Builds the per-key download lockers and the global read/write lock.
/// Redis, when configured, backs only the per-key lockers — there is no
/// distributed read/write lock implementation, so eviction's global
/// write lock always stays in-process.
async fn build_lockers(
    config: &Config,
) -> anyhow::Result<(Arc<dyn Locker>, Arc<dyn Locker>, Arc<dyn RwLocker>)> {
    let rw_locker: Arc<dyn RwLocker> = Arc::new(LocalRwLocker::new());

    let Some(redis_config) = &config.redis else {
        return Ok((Arc::new(LocalLocker::new()), Arc::new(LocalLocker::new()), rw_locker));
    };

    let conn = connect_redis(redis_config).await.context("failed to connect to redis")?;

    let retry: RetryConfig = config.lock.retry.clone().into();

    let narinfo_locker: Arc<dyn Locker> = Arc::new(RedisLocker::new(
        conn.clone(),
        format!("{}:narinfo", redis_config.key_prefix),
        config.lock.download_ttl,
        retry.clone(),
        config.lock.allow_degraded_mode,
    ));
    let nar_locker: Arc<dyn Locker> = Arc::new(RedisLocker::new(
        conn,
        format!("{}:nar", redis_config.key_prefix),
        config.lock.download_ttl,
        retry,
        config.lock.allow_degraded_mode,
    ));

    Ok((narinfo_locker, nar_locker, rw_locker))
}

async fn connect_redis(redis_config: &config::RedisConfig) -> anyhow::Result<redis::aio::ConnectionManager> {
    let addr = redis_config
        .addrs
        .first()
        .context("cache.redis.addrs must name at least one host:port")?;

    let scheme = if redis_config.use_tls { "rediss" } else { "redis" };
    let auth = match (&redis_config.username, &redis_config.password) {
        (Some(user), Some(pass)) => format!("{user}:{pass}@"),
        (None, Some(pass)) => format!(":{pass}@"),
        _ => String::new(),
    };
    let url = format!("{scheme}://{auth}{addr}/{}", redis_config.db);

    let client = redis::Client::open(url)?;
    let conn = redis::aio::ConnectionManager::new(client).await?;
    Ok(conn)
}
