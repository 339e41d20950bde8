//! The pull-through cache engine: request coalescing, writeback to
//! blob + index, re-signing, and deletion. This is the central object
//! the HTTP layer calls into.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::index::Index;
use crate::lock::{LocalLocker, LocalRwLocker, Locker, RwLocker};
use crate::nar_url::{Compression, NarUrl};
use crate::narinfo::NarInfo;
use crate::signing::Signer;
use crate::storage::{Blob, BlobStream, Storage};
use crate::upstream::UpstreamSet;

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is after 1970")
        .as_secs() as i64
}

pub struct GetNarInfo {
    pub narinfo: NarInfo,
    pub raw: Vec<u8>,
}

pub struct GetNar {
    pub size: u64,
    pub compression: Compression,
    pub stream: BlobStream,
}

/// Owns the long-lived resources of the proxy: storage, index, lock
/// registries, the upstream set, and (optionally) the signer.
pub struct Cache {
    storage: Arc<dyn Storage>,
    index: Index,
    narinfo_locker: Arc<dyn Locker>,
    nar_locker: Arc<dyn Locker>,
    rw_locker: Arc<dyn RwLocker>,
    upstreams: UpstreamSet,
    signer: Option<Signer>,
    temp_dir: std::path::PathBuf,
}

impl Cache {
    pub fn new(
        storage: Arc<dyn Storage>,
        index: Index,
        narinfo_locker: Arc<dyn Locker>,
        nar_locker: Arc<dyn Locker>,
        rw_locker: Arc<dyn RwLocker>,
        upstreams: UpstreamSet,
        signer: Option<Signer>,
        temp_dir: std::path::PathBuf,
    ) -> Self {
        Self {
            storage,
            index,
            narinfo_locker,
            nar_locker,
            rw_locker,
            upstreams,
            signer,
            temp_dir,
        }
    }

    pub async fn has_narinfo(&self, hash: &Hash) -> Result<bool> {
        Ok(self.storage.narinfo_has(hash).await.map_err(Error::from)?)
    }

    /// The central pull-through: serves from storage if present, else
    /// coalesces concurrent downloads behind a per-hash lock and fetches
    /// from the first upstream that has it.
    #[tracing::instrument(skip(self))]
    pub async fn get_narinfo(&self, hash: &Hash) -> Result<GetNarInfo> {
        self.index.mark_narinfo_access(hash, now()).await.ok();

        if let Some(info) = self.try_read_narinfo(hash).await? {
            return Ok(info);
        }

        let _guard = self
            .narinfo_locker
            .lock(hash.as_str())
            .await
            .map_err(|e| Error::LockUnavailable(e.to_string()))?;

        // Double-checked: another waiter may have won the race while we
        // waited for the lock.
        if let Some(info) = self.try_read_narinfo(hash).await? {
            return Ok(info);
        }

        let (mut narinfo, _raw, upstream) = self
            .upstreams
            .get_narinfo(hash)
            .await
            .map_err(|e| match e {
                crate::upstream::UpstreamError::NotFound => Error::UpstreamNotFound,
                crate::upstream::UpstreamError::BadData => {
                    Error::InvalidInput("upstream narinfo hash mismatch".to_owned())
                }
                other => Error::UpstreamUnavailable(other.to_string()),
            })?;

        self.ensure_nar(&narinfo.url.clone(), Some(&upstream)).await?;

        if let Some(signer) = &self.signer {
            let fingerprint = narinfo.fingerprint();
            narinfo.resign(signer.sign(&fingerprint));
        }

        let body = narinfo.to_string().into_bytes();

        match self.storage.narinfo_put(hash, &body).await {
            Ok(()) | Err(crate::storage::StorageError::AlreadyExists) => {}
            Err(e) => return Err(e.into()),
        }
        self.index.insert_narinfo(hash, now()).await.map_err(Error::Index)?;

        // Someone else may have won `Put`; re-read to return the one
        // actually committed to storage.
        self.try_read_narinfo(hash)
            .await?
            .ok_or(Error::NotFound)
    }

    async fn try_read_narinfo(&self, hash: &Hash) -> Result<Option<GetNarInfo>> {
        match self.storage.narinfo_get(hash).await {
            Ok(raw) => {
                let text = String::from_utf8_lossy(&raw).into_owned();
                let narinfo: NarInfo = text.parse()?;
                Ok(Some(GetNarInfo { narinfo, raw }))
            }
            Err(crate::storage::StorageError::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Client push: parses, validates StorePath hash equality, signs,
    /// persists, indexes.
    #[tracing::instrument(skip(self, raw))]
    pub async fn put_narinfo(&self, hash: &Hash, raw: &[u8]) -> Result<()> {
        let text = String::from_utf8_lossy(raw).into_owned();
        let mut narinfo: NarInfo = text.parse()?;

        if narinfo.hash() != hash {
            return Err(Error::InvalidInput(
                "StorePath hash does not match request hash".to_owned(),
            ));
        }

        if let Some(signer) = &self.signer {
            let fingerprint = narinfo.fingerprint();
            narinfo.resign(signer.sign(&fingerprint));
        }

        let body = narinfo.to_string().into_bytes();
        self.storage.narinfo_put(hash, &body).await?;
        self.index.insert_narinfo(hash, now()).await.map_err(Error::Index)?;
        Ok(())
    }

    /// Idempotent: `NotFound` is treated as success.
    pub async fn delete_narinfo(&self, hash: &Hash) -> Result<()> {
        match self.storage.narinfo_delete(hash).await {
            Ok(()) => {}
            Err(crate::storage::StorageError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }
        self.index.delete_narinfo(hash).await.map_err(Error::Index)?;
        Ok(())
    }

    /// Pull-through for the binary body.
    #[tracing::instrument(skip(self))]
    pub async fn get_nar(&self, url: &NarUrl) -> Result<GetNar> {
        self.index.mark_nar_access(&url.hash, now()).await.ok();
        self.ensure_nar(url, None).await?;

        let _read_share = self
            .rw_locker
            .read()
            .await
            .map_err(|e| Error::LockUnavailable(e.to_string()))?;

        let blob = self.storage.nar_get(url).await.map_err(Error::from)?;
        Ok(GetNar {
            size: blob.size,
            compression: url.compression,
            stream: blob.stream,
        })
    }

    /// Ensures the NAR body is present in storage, fetching from
    /// `preferred_upstream` (falling through to the rest) if missing.
    async fn ensure_nar(
        &self,
        url: &NarUrl,
        preferred_upstream: Option<&Arc<crate::upstream::Upstream>>,
    ) -> Result<()> {
        if self.storage.nar_has(url).await.map_err(Error::from)? {
            return Ok(());
        }

        let _guard = self
            .nar_locker
            .lock(url.hash.as_str())
            .await
            .map_err(|e| Error::LockUnavailable(e.to_string()))?;

        if self.storage.nar_has(url).await.map_err(Error::from)? {
            return Ok(());
        }

        let mut stream = self
            .upstreams
            .get_nar_from(preferred_upstream, url)
            .await
            .map_err(|e| match e {
                crate::upstream::UpstreamError::NotFound => Error::UpstreamNotFound,
                other => Error::UpstreamUnavailable(other.to_string()),
            })?;

        let tmp_path = self
            .temp_dir
            .join(format!(".nar-download-{}-{:x}", url.hash, rand::random::<u64>()));

        let written = {
            use futures::StreamExt;
            use tokio::io::AsyncWriteExt;

            let mut file = tokio::fs::File::create(&tmp_path)
                .await
                .map_err(|e| Error::Storage(e.into()))?;
            let mut total: u64 = 0;

            while let Some(chunk) = stream.stream.next().await {
                let chunk = chunk.map_err(|e| Error::UpstreamUnavailable(e.to_string()))?;
                total += chunk.len() as u64;
                if file.write_all(&chunk).await.is_err() {
                    tokio::fs::remove_file(&tmp_path).await.ok();
                    return Err(Error::Storage(anyhow::anyhow!("failed writing temp nar file")));
                }
            }
            file.flush().await.map_err(|e| Error::Storage(e.into()))?;
            total
        };

        if let Some(expected) = stream.size {
            if expected != written {
                tokio::fs::remove_file(&tmp_path).await.ok();
                return Err(Error::UpstreamUnavailable(format!(
                    "nar size mismatch: expected {expected}, got {written}"
                )));
            }
        }

        let file = tokio::fs::File::open(&tmp_path)
            .await
            .map_err(|e| Error::Storage(e.into()))?;

        let put_result = self.storage.nar_put(url, written, Box::pin(file)).await;
        tokio::fs::remove_file(&tmp_path).await.ok();

        match put_result {
            Ok(()) | Err(crate::storage::StorageError::AlreadyExists) => {}
            Err(e) => return Err(e.into()),
        }

        self.index
            .insert_nar(&url.hash, url.compression, written, now())
            .await
            .map_err(Error::Index)?;

        Ok(())
    }

    /// Client push of a binary body.
    #[tracing::instrument(skip(self, stream))]
    pub async fn put_nar(&self, url: &NarUrl, size: u64, stream: BlobStream) -> Result<u64> {
        self.storage.nar_put(url, size, stream).await?;
        self.index
            .insert_nar(&url.hash, url.compression, size, now())
            .await
            .map_err(Error::Index)?;
        Ok(size)
    }

    pub async fn delete_nar(&self, url: &NarUrl) -> Result<()> {
        match self.storage.nar_delete(url).await {
            Ok(()) => {}
            Err(crate::storage::StorageError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }
        self.index.delete_nar(&url.hash).await.map_err(Error::Index)?;
        Ok(())
    }

    pub(crate) fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub(crate) fn index(&self) -> &Index {
        &self.index
    }

    pub(crate) fn rw_locker(&self) -> &Arc<dyn RwLocker> {
        &self.rw_locker
    }

    pub(crate) fn upstreams(&self) -> &UpstreamSet {
        &self.upstreams
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStorage;

    async fn test_cache() -> (tempfile::TempDir, Cache) {
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

        let cache = Cache::new(
            storage,
            index,
            Arc::new(LocalLocker::new()),
            Arc::new(LocalLocker::new()),
            Arc::new(LocalRwLocker::new()),
            UpstreamSet::new(Vec::new()),
            None,
            dir.path().join("tmp"),
        );
        (dir, cache)
    }

    const H: &str = "00ji9synj1r6h6sjw27wwv8fw98myxsg";

    fn sample_narinfo(hash: &str) -> String {
        format!(
            "StorePath: /nix/store/{hash}-hello-2.12.1\n\
URL: nar/11ji9synj1r6h6sjw27wwv8fw98myxsg.nar.xz\n\
Compression: xz\n\
FileHash: sha256:11ji9synj1r6h6sjw27wwv8fw98myxsg\n\
FileSize: 100\n\
NarHash: sha256:11ji9synj1r6h6sjw27wwv8fw98myxsg\n\
NarSize: 200\n\
References:\n"
        )
    }

    #[tokio::test]
    async fn has_narinfo_false_when_absent() {
        let (_dir, cache) = test_cache().await;
        let hash: Hash = H.parse().unwrap();
        assert!(!cache.has_narinfo(&hash).await.unwrap());
    }

    #[tokio::test]
    async fn get_narinfo_without_upstream_is_not_found() {
        let (_dir, cache) = test_cache().await;
        let hash: Hash = H.parse().unwrap();
        assert!(matches!(cache.get_narinfo(&hash).await, Err(Error::NotFound | Error::UpstreamUnavailable(_))));
    }

    #[tokio::test]
    async fn put_narinfo_then_has_and_get_round_trips() {
        let (_dir, cache) = test_cache().await;
        let hash: Hash = H.parse().unwrap();
        let body = sample_narinfo(H);

        cache.put_narinfo(&hash, body.as_bytes()).await.unwrap();
        assert!(cache.has_narinfo(&hash).await.unwrap());

        let fetched = cache.get_narinfo(&hash).await.unwrap();
        assert_eq!(fetched.narinfo.hash(), &hash);
    }

    #[tokio::test]
    async fn put_narinfo_rejects_hash_mismatch() {
        let (_dir, cache) = test_cache().await;
        let wrong_hash: Hash = "22ji9synj1r6h6sjw27wwv8fw98myxsg".parse().unwrap();
        let body = sample_narinfo(H);

        let err = cache.put_narinfo(&wrong_hash, body.as_bytes()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn delete_narinfo_is_idempotent() {
        let (_dir, cache) = test_cache().await;
        let hash: Hash = H.parse().unwrap();
        cache.delete_narinfo(&hash).await.unwrap();

        cache.put_narinfo(&hash, sample_narinfo(H).as_bytes()).await.unwrap();
        cache.delete_narinfo(&hash).await.unwrap();
        cache.delete_narinfo(&hash).await.unwrap();
        assert!(!cache.has_narinfo(&hash).await.unwrap());
    }

    #[tokio::test]
    async fn put_nar_then_get_nar_round_trips_bytes() {
        let (_dir, cache) = test_cache().await;
        let url: NarUrl = "nar/11ji9synj1r6h6sjw27wwv8fw98myxsg.nar.xz".parse().unwrap();
        let body = b"pretend-xz-bytes".to_vec();

        cache
            .put_nar(&url, body.len() as u64, Box::pin(std::io::Cursor::new(body.clone())))
            .await
            .unwrap();

        let mut fetched = cache.get_nar(&url).await.unwrap();
        assert_eq!(fetched.size, body.len() as u64);

        let mut read_back = Vec::new();
        use tokio::io::AsyncReadExt;
        fetched.stream.read_to_end(&mut read_back).await.unwrap();
        assert_eq!(read_back, body);
    }
}
