//! Relational metadata index: `narinfos` and `nars` tables.
//!
//! Backed by [`sqlx::Any`] so the same query layer runs against either
//! SQLite or Postgres, selected by the scheme of `cache.database-url`
//! (`sqlite://...` or `postgres://...`). Both dialects accept the same
//! portable `INSERT ... ON CONFLICT` syntax used here.

use futures::TryStreamExt;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::Row;

use crate::hash::Hash;
use crate::nar_url::Compression;

#[derive(Clone, Debug)]
pub struct IndexConfig {
    pub database_url: String,
    pub max_open_conns: u32,
    pub max_idle_conns: u32,
}

#[derive(Clone, Debug)]
pub struct Index {
    pool: sqlx::AnyPool,
}

/// A row from `narinfos` or `nars`, keyed by hash with an access-time
/// ordering used for eviction scans.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NarRow {
    pub hash: Hash,
    pub compression: Compression,
    pub file_size: u64,
    pub last_accessed_at: i64,
}

impl Index {
    #[tracing::instrument(name = "index_connect", skip(config))]
    pub async fn connect(config: &IndexConfig) -> anyhow::Result<Self> {
        tracing::info!(url = %redact_url(&config.database_url), "connecting to index database");

        let mut options = AnyPoolOptions::new();
        if config.max_open_conns > 0 {
            options = options.max_connections(config.max_open_conns);
        }
        if config.max_idle_conns > 0 {
            options = options.min_connections(config.max_idle_conns);
        }

        let pool = options.connect(&config.database_url).await?;

        let index = Self { pool };
        index.init_schema().await?;
        Ok(index)
    }

    async fn init_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS narinfos (
                hash TEXT PRIMARY KEY,
                created_at BIGINT NOT NULL,
                last_accessed_at BIGINT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS nars (
                hash TEXT PRIMARY KEY,
                compression TEXT NOT NULL,
                file_size BIGINT NOT NULL,
                created_at BIGINT NOT NULL,
                last_accessed_at BIGINT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS narinfos_last_accessed_at ON narinfos (last_accessed_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS nars_last_accessed_at ON nars (last_accessed_at)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn has_narinfo(&self, hash: &Hash, now: i64) -> anyhow::Result<bool> {
        let row: Option<AnyRow> = sqlx::query("SELECT 1 FROM narinfos WHERE hash = ?")
            .bind(hash.as_str())
            .fetch_optional(&self.pool)
            .await?;
        let _ = now;
        Ok(row.is_some())
    }

    /// Best-effort, coalesced-at-source last-access bump.
    pub async fn mark_narinfo_access(&self, hash: &Hash, now: i64) -> anyhow::Result<()> {
        sqlx::query("UPDATE narinfos SET last_accessed_at = ? WHERE hash = ?")
            .bind(now)
            .bind(hash.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_nar_access(&self, hash: &Hash, now: i64) -> anyhow::Result<()> {
        sqlx::query("UPDATE nars SET last_accessed_at = ? WHERE hash = ?")
            .bind(now)
            .bind(hash.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Idempotent upsert: a concurrent winner's row is left untouched.
    pub async fn insert_narinfo(&self, hash: &Hash, now: i64) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO narinfos (hash, created_at, last_accessed_at) VALUES (?, ?, ?)
             ON CONFLICT (hash) DO UPDATE SET last_accessed_at = excluded.last_accessed_at",
        )
        .bind(hash.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_nar(
        &self,
        hash: &Hash,
        compression: Compression,
        file_size: u64,
        now: i64,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO nars (hash, compression, file_size, created_at, last_accessed_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (hash) DO UPDATE SET
                compression = excluded.compression,
                file_size = excluded.file_size,
                last_accessed_at = excluded.last_accessed_at",
        )
        .bind(hash.as_str())
        .bind(compression.to_string())
        .bind(file_size as i64)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Idempotent: deleting an absent row is not an error.
    pub async fn delete_narinfo(&self, hash: &Hash) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM narinfos WHERE hash = ?")
            .bind(hash.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_nar(&self, hash: &Hash) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM nars WHERE hash = ?")
            .bind(hash.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn total_nar_size(&self) -> anyhow::Result<u64> {
        let row: AnyRow = sqlx::query("SELECT COALESCE(SUM(file_size), 0) AS total FROM nars")
            .fetch_one(&self.pool)
            .await?;
        let total: i64 = row.try_get("total")?;
        Ok(total.max(0) as u64)
    }

    /// NAR rows ordered oldest-accessed-first, for eviction scans.
    pub async fn nars_by_last_accessed_asc(&self) -> anyhow::Result<Vec<NarRow>> {
        let rows = sqlx::query(
            "SELECT hash, compression, file_size, last_accessed_at FROM nars
             ORDER BY last_accessed_at ASC",
        )
        .fetch(&self.pool)
        .map_err(anyhow::Error::from)
        .try_fold(Vec::new(), |mut acc, row: AnyRow| async move {
            let hash_str: String = row.try_get("hash").map_err(anyhow::Error::from)?;
            let compression_str: String = row.try_get("compression").map_err(anyhow::Error::from)?;
            let file_size: i64 = row.try_get("file_size").map_err(anyhow::Error::from)?;
            let last_accessed_at: i64 = row.try_get("last_accessed_at").map_err(anyhow::Error::from)?;

            let hash = hash_str.parse().map_err(|e: crate::hash::HashParseError| anyhow::anyhow!(e))?;
            let compression = compression_str
                .parse()
                .map_err(|e: crate::nar_url::CompressionParseError| anyhow::anyhow!(e))?;

            acc.push(NarRow {
                hash,
                compression,
                file_size: file_size.max(0) as u64,
                last_accessed_at,
            });
            Ok(acc)
        })
        .await?;

        Ok(rows)
    }

    /// All NARInfo hashes currently indexed, for the orphan-pruning sweep.
    pub async fn all_narinfo_hashes(&self) -> anyhow::Result<Vec<Hash>> {
        let rows = sqlx::query("SELECT hash FROM narinfos")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| {
                let hash_str: String = row.try_get("hash")?;
                hash_str
                    .parse()
                    .map_err(|e: crate::hash::HashParseError| anyhow::anyhow!(e))
            })
            .collect()
    }

    pub async fn has_nar(&self, hash: &Hash) -> anyhow::Result<bool> {
        let row: Option<AnyRow> = sqlx::query("SELECT 1 FROM nars WHERE hash = ?")
            .bind(hash.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn narinfo_count(&self) -> anyhow::Result<u64> {
        let row: AnyRow = sqlx::query("SELECT COUNT(*) AS n FROM narinfos")
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n.max(0) as u64)
    }

    pub async fn nar_count(&self) -> anyhow::Result<u64> {
        let row: AnyRow = sqlx::query("SELECT COUNT(*) AS n FROM nars")
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n.max(0) as u64)
    }
}

fn redact_url(url: &str) -> String {
    match url.split_once("://") {
        Some((scheme, _)) => format!("{scheme}://..."),
        None => "...".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn index() -> Index {
        Index::connect(&IndexConfig {
            database_url: "sqlite::memory:".to_owned(),
            max_open_conns: 1,
            max_idle_conns: 0,
        })
        .await
        .unwrap()
    }

    const H: &str = "00ji9synj1r6h6sjw27wwv8fw98myxsg";

    #[tokio::test]
    async fn narinfo_insert_is_idempotent_upsert() {
        let idx = index().await;
        let hash: Hash = H.parse().unwrap();
        idx.insert_narinfo(&hash, 100).await.unwrap();
        idx.insert_narinfo(&hash, 200).await.unwrap();
        assert!(idx.has_narinfo(&hash, 0).await.unwrap());
    }

    #[tokio::test]
    async fn nar_eviction_scan_orders_by_last_accessed_asc() {
        let idx = index().await;
        let h1: Hash = H.parse().unwrap();
        let h2: Hash = "11ji9synj1r6h6sjw27wwv8fw98myxsg".parse().unwrap();
        idx.insert_nar(&h1, Compression::Xz, 100, 500).await.unwrap();
        idx.insert_nar(&h2, Compression::Xz, 100, 100).await.unwrap();

        let rows = idx.nars_by_last_accessed_asc().await.unwrap();
        assert_eq!(rows[0].hash, h2);
        assert_eq!(rows[1].hash, h1);
    }

    #[tokio::test]
    async fn total_nar_size_sums_file_sizes() {
        let idx = index().await;
        let h1: Hash = H.parse().unwrap();
        idx.insert_nar(&h1, Compression::Xz, 4096, 1).await.unwrap();
        assert_eq!(idx.total_nar_size().await.unwrap(), 4096);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let idx = index().await;
        let hash: Hash = H.parse().unwrap();
        idx.delete_narinfo(&hash).await.unwrap();
        idx.insert_narinfo(&hash, 1).await.unwrap();
        idx.delete_narinfo(&hash).await.unwrap();
        idx.delete_narinfo(&hash).await.unwrap();
        assert!(!idx.has_narinfo(&hash, 0).await.unwrap());
    }
}
