//! Configuration: a `[cache]` TOML table read from the path named by
//! `CACHE_PROXY_CONFIG`, falling back to built-in defaults.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context as _;
use bytesize::ByteSize;
use serde::{Deserialize, Serialize};
use url::Url;

const CONFIG_ENV_VAR: &str = "CACHE_PROXY_CONFIG";

pub fn get() -> Config {
    tracing::info!("reading config from {CONFIG_ENV_VAR}");

    let config = (|| -> anyhow::Result<RawConfig> {
        let config_path = std::env::var(CONFIG_ENV_VAR)?;
        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("unable to read config from {config_path:?}"))?;

        Ok(toml::from_str(&config_str)?)
    })()
    .map(|raw| raw.cache)
    .unwrap_or_else(|e| {
        tracing::warn!("unable to read config from env: {e}");
        tracing::info!("using default config");
        Config::default()
    });

    tracing::trace!("using config: {config:?}");

    config
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawConfig {
    cache: Config,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct Config {
    pub hostname: String,
    pub max_size: Option<ByteSize>,

    pub lru: LruConfig,

    pub secret_key_path: Option<PathBuf>,
    pub sign_narinfo: bool,
    pub temp_path: Option<PathBuf>,

    pub database_url: String,
    pub database: DatabaseConfig,

    pub storage: StorageConfig,
    pub upstream: UpstreamConfig,

    pub allow_delete_verb: bool,
    pub allow_put_verb: bool,

    pub redis: Option<RedisConfig>,
    pub lock: LockConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hostname: "cache.example".to_owned(),
            max_size: None,
            lru: LruConfig::default(),
            secret_key_path: None,
            sign_narinfo: true,
            temp_path: None,
            database_url: "sqlite://cache.db".to_owned(),
            database: DatabaseConfig::default(),
            storage: StorageConfig::default(),
            upstream: UpstreamConfig::default(),
            allow_delete_verb: false,
            allow_put_verb: false,
            redis: None,
            lock: LockConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct LruConfig {
    pub schedule: Option<String>,
    pub timezone: String,
}

impl Default for LruConfig {
    fn default() -> Self {
        Self {
            schedule: None,
            timezone: "Local".to_owned(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct DatabaseConfig {
    pub pool: PoolConfig,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct PoolConfig {
    /// 0 means dialect default.
    pub max_open_conns: u32,
    pub max_idle_conns: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_open_conns: 0,
            max_idle_conns: 0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, tag = "kind")]
pub enum StorageConfig {
    Local { path: PathBuf },
    S3(S3StorageSettings),
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Local {
            path: PathBuf::from("./data"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct S3StorageSettings {
    pub bucket: String,
    pub endpoint: Option<String>,
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub force_path_style: bool,
}

impl Default for S3StorageSettings {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            endpoint: None,
            region: "us-east-1".to_owned(),
            access_key_id: None,
            secret_access_key: None,
            force_path_style: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct UpstreamConfig {
    pub urls: Vec<Url>,
    pub public_keys: Vec<String>,
    #[serde(with = "humantime_serde")]
    pub dialer_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub response_header_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            urls: vec![Url::parse("https://cache.nixos.org/").unwrap()],
            public_keys: Vec::new(),
            dialer_timeout: Duration::from_secs(5),
            response_header_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct RedisConfig {
    pub addrs: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub db: i64,
    pub use_tls: bool,
    pub pool_size: u32,
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            addrs: Vec::new(),
            username: None,
            password: None,
            db: 0,
            use_tls: false,
            pool_size: 10,
            key_prefix: "cache-proxy".to_owned(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct LockConfig {
    #[serde(with = "humantime_serde")]
    pub download_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub lru_ttl: Duration,
    pub retry: RetryConfig,
    pub allow_degraded_mode: bool,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            download_ttl: Duration::from_secs(30),
            lru_ttl: Duration::from_secs(300),
            retry: RetryConfig::default(),
            allow_degraded_mode: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            jitter: 0.2,
        }
    }
}

impl From<RetryConfig> for crate::lock::RetryConfig {
    fn from(c: RetryConfig) -> Self {
        Self {
            max_attempts: c.max_attempts,
            initial_delay: c.initial_delay,
            max_delay: c.max_delay,
            jitter: c.jitter,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_one_upstream() {
        let config = Config::default();
        assert_eq!(config.upstream.urls.len(), 1);
        assert!(config.sign_narinfo);
        assert!(config.max_size.is_none());
    }

    #[test]
    fn parses_cache_table_from_toml() {
        let toml_str = r#"
            [cache]
            hostname = "cache.mine"
            max-size = "10GB"

            [cache.storage]
            kind = "local"
            path = "/var/cache"

            [cache.upstream]
            urls = ["https://cache.nixos.org/"]
        "#;

        let raw: RawConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(raw.cache.hostname, "cache.mine");
        assert_eq!(raw.cache.max_size, Some(ByteSize::gb(10)));
    }
}
