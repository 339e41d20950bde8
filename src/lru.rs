//! LRU eviction job: runs on a cron schedule, evicts oldest NARs under
//! the global write lock until the store is back under budget, then
//! sweeps orphaned NARInfo rows.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use apalis::cron::Schedule;
use chrono::{DateTime, Utc};

use crate::engine::Cache;

/// The tz database name the cron schedule fires in. `Local` is not a
/// valid IANA zone (chrono-tz has no such entry), so it's its own
/// variant backed by `chrono::Local` rather than `chrono_tz::Tz`.
#[derive(Debug, Clone, Copy)]
pub enum ConfiguredTz {
    Local,
    Named(chrono_tz::Tz),
}

pub fn parse_timezone(s: &str) -> anyhow::Result<ConfiguredTz> {
    if s.eq_ignore_ascii_case("local") {
        return Ok(ConfiguredTz::Local);
    }
    let tz: chrono_tz::Tz = s
        .parse()
        .map_err(|_| anyhow::anyhow!("unknown tz database name {s:?}"))?;
    Ok(ConfiguredTz::Named(tz))
}

fn upcoming_utc(schedule: &Schedule, tz: ConfiguredTz) -> Box<dyn Iterator<Item = DateTime<Utc>> + '_> {
    match tz {
        ConfiguredTz::Local => Box::new(schedule.upcoming(chrono::Local).map(|dt| dt.with_timezone(&Utc))),
        ConfiguredTz::Named(tz) => Box::new(schedule.upcoming(tz).map(|dt| dt.with_timezone(&Utc))),
    }
}

#[derive(Debug, Clone)]
pub struct LruConfig {
    pub schedule: Schedule,
    pub timezone: ConfiguredTz,
    pub max_size: Option<u64>,
    /// Fraction of `max_size` to evict down to; `1.0` stops at budget,
    /// `0.9` leaves headroom to reduce eviction chatter.
    pub low_watermark: f64,
}

/// Runs the eviction scheduler until the process exits. A run already
/// in progress causes a newly-fired tick to be skipped rather than
/// queued.
pub async fn run(cache: Arc<Cache>, config: LruConfig) {
    let Some(max_size) = config.max_size else {
        tracing::info!("no cache.max-size configured, LRU eviction disabled");
        return;
    };

    let running = Arc::new(AtomicBool::new(false));
    let mut upcoming = upcoming_utc(&config.schedule, config.timezone);

    loop {
        let Some(next) = upcoming.next() else {
            tracing::warn!("cron schedule produced no further occurrences, stopping LRU job");
            return;
        };

        let delay = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::time::sleep(delay).await;

        if running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::warn!("previous LRU run still in progress, skipping this tick");
            continue;
        }

        let cache = cache.clone();
        let running = running.clone();
        let target_size = (max_size as f64 * config.low_watermark) as u64;

        tokio::spawn(async move {
            if let Err(e) = sweep(&cache, max_size, target_size).await {
                tracing::error!(error = %e, "LRU sweep failed");
            }
            running.store(false, Ordering::SeqCst);
        });
    }
}

#[tracing::instrument(skip(cache))]
async fn sweep(cache: &Cache, max_size: u64, target_size: u64) -> anyhow::Result<()> {
    let _write_lock = cache
        .rw_locker()
        .write()
        .await
        .map_err(|e| anyhow::anyhow!("failed to acquire LRU write lock: {e}"))?;

    let total = cache.index().total_nar_size().await?;
    if total <= max_size {
        tracing::debug!(total, max_size, "under budget, nothing to evict");
        prune_orphan_narinfos(cache).await?;
        return Ok(());
    }

    tracing::info!(total, max_size, "over budget, evicting oldest NARs");

    let rows = cache.index().nars_by_last_accessed_asc().await?;
    let mut running_total = total;

    for row in rows {
        if running_total <= target_size {
            break;
        }

        let url = crate::nar_url::NarUrl {
            hash: row.hash.clone(),
            compression: row.compression,
            query: None,
        };

        match cache.storage().nar_delete(&url).await {
            Ok(()) | Err(crate::storage::StorageError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }
        cache.index().delete_nar(&row.hash).await?;

        running_total = running_total.saturating_sub(row.file_size);
        tracing::debug!(hash = %row.hash, freed = row.file_size, running_total, "evicted nar");
    }

    prune_orphan_narinfos(cache).await?;

    Ok(())
}

/// Deletes NARInfo entries whose referenced NAR no longer has a row —
/// the NAR may have been evicted independently of its NARInfo.
async fn prune_orphan_narinfos(cache: &Cache) -> anyhow::Result<()> {
    for hash in cache.index().all_narinfo_hashes().await? {
        let raw = match cache.storage().narinfo_get(&hash).await {
            Ok(raw) => raw,
            Err(crate::storage::StorageError::NotFound) => {
                cache.index().delete_narinfo(&hash).await?;
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let text = String::from_utf8_lossy(&raw).into_owned();
        let Ok(narinfo) = text.parse::<crate::narinfo::NarInfo>() else {
            continue;
        };

        if !cache.index().has_nar(&narinfo.url.hash).await? {
            tracing::debug!(hash = %hash, "pruning narinfo with no surviving nar");
            match cache.storage().narinfo_delete(&hash).await {
                Ok(()) | Err(crate::storage::StorageError::NotFound) => {}
                Err(e) => return Err(e.into()),
            }
            cache.index().delete_narinfo(&hash).await?;
        }
    }
    Ok(())
}

pub fn parse_schedule(expr: &str) -> anyhow::Result<Schedule> {
    Schedule::from_str(expr).map_err(|e| anyhow::anyhow!("invalid cron schedule {expr:?}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Hash;
    use crate::index::Index;
    use crate::lock::{LocalLocker, LocalRwLocker};
    use crate::nar_url::Compression;
    use crate::storage::LocalStorage;
    use crate::upstream::UpstreamSet;
    use std::sync::Arc;

    async fn cache_with_nars(entries: &[(&str, u64, i64)]) -> (tempfile::TempDir, Arc<Cache>) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(
            LocalStorage::new(crate::storage::local::LocalStorageConfig {
                path: dir.path().join("storage"),
            })
            .await
            .unwrap(),
        );
        let index = Index::connect(&crate::index::IndexConfig {
            database_url: "sqlite::memory:".to_owned(),
            max_open_conns: 1,
            max_idle_conns: 0,
        })
        .await
        .unwrap();

        for (hash, size, accessed_at) in entries {
            let hash: Hash = hash.parse().unwrap();
            index.insert_nar(&hash, Compression::Xz, *size, *accessed_at).await.unwrap();
            let url = crate::nar_url::NarUrl {
                hash: hash.clone(),
                compression: Compression::Xz,
                query: None,
            };
            storage.nar_put(&url, *size, Box::pin(std::io::Cursor::new(vec![0u8; *size as usize]))).await.unwrap();
        }

        let cache = Arc::new(Cache::new(
            storage,
            index,
            Arc::new(LocalLocker::new()),
            Arc::new(LocalLocker::new()),
            Arc::new(LocalRwLocker::new()),
            UpstreamSet::new(Vec::new()),
            None,
            dir.path().join("tmp"),
        ));
        (dir, cache)
    }

    const H1: &str = "00ji9synj1r6h6sjw27wwv8fw98myxsg";
    const H2: &str = "11ji9synj1r6h6sjw27wwv8fw98myxsg";
    const H3: &str = "22ji9synj1r6h6sjw27wwv8fw98myxsg";

    #[tokio::test]
    async fn sweep_evicts_oldest_first_until_under_budget() {
        let (_dir, cache) = cache_with_nars(&[(H1, 40, 300), (H2, 40, 100), (H3, 40, 200)]).await;

        sweep(&cache, 100, 100).await.unwrap();

        assert_eq!(cache.index().total_nar_size().await.unwrap(), 80);
        assert!(!cache.index().has_nar(&H2.parse().unwrap()).await.unwrap());
        assert!(cache.index().has_nar(&H1.parse().unwrap()).await.unwrap());
        assert!(cache.index().has_nar(&H3.parse().unwrap()).await.unwrap());
    }

    #[tokio::test]
    async fn sweep_is_a_noop_under_budget() {
        let (_dir, cache) = cache_with_nars(&[(H1, 10, 100)]).await;
        sweep(&cache, 1000, 1000).await.unwrap();
        assert_eq!(cache.index().total_nar_size().await.unwrap(), 10);
    }

    #[tokio::test]
    async fn prune_removes_narinfo_whose_nar_is_gone() {
        let (_dir, cache) = cache_with_nars(&[]).await;
        let narinfo_hash: Hash = H1.parse().unwrap();
        let body = format!(
            "StorePath: /nix/store/{H1}-hello-2.12.1\n\
URL: nar/{H2}.nar.xz\n\
Compression: xz\n\
FileHash: sha256:{H2}\n\
FileSize: 10\n\
NarHash: sha256:{H2}\n\
NarSize: 20\n\
References:\n"
        );
        cache.put_narinfo(&narinfo_hash, body.as_bytes()).await.unwrap();

        prune_orphan_narinfos(&cache).await.unwrap();

        assert!(!cache.has_narinfo(&narinfo_hash).await.unwrap());
    }

    #[test]
    fn parse_schedule_rejects_garbage() {
        assert!(parse_schedule("not a cron expression").is_err());
    }
}
