//! Local filesystem storage backend.
//!
//! Layout under `root`:
//! - `config/<name>` — secret key blobs
//! - `narinfo/h/ha/hash.narinfo`
//! - `nar/h/ha/hash[.ext]`
//!
//! Writes go to a `.tmp-<random>` sibling file, then `rename` into place,
//! so a crash mid-write never leaves a visible partial object.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rand::Rng;
use tokio::fs::{self, File};
use tokio::io::{self, AsyncWriteExt};

use super::{Blob, BlobStream, Storage, StorageError, StorageResult};
use crate::hash::{Hash, HASH_LEN};
use crate::nar_url::NarUrl;

#[derive(Debug, Clone, serde::Deserialize)]
pub struct LocalStorageConfig {
    pub path: PathBuf,
}

#[derive(Debug)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub async fn new(config: LocalStorageConfig) -> StorageResult<Self> {
        let root = config.path;
        fs::create_dir_all(root.join("config")).await?;
        fs::create_dir_all(root.join("narinfo")).await?;
        fs::create_dir_all(root.join("nar")).await?;
        Ok(Self { root })
    }

    fn config_path(&self, name: &str) -> PathBuf {
        self.root.join("config").join(name)
    }

    fn narinfo_path(&self, hash: &Hash) -> PathBuf {
        self.root.join("narinfo").join(hash.shard_path(".narinfo"))
    }

    fn nar_path(&self, url: &NarUrl) -> PathBuf {
        self.root.join("nar").join(url.to_file_path())
    }

    async fn write_atomic(path: &Path, bytes: &[u8], create_new: bool) -> StorageResult<()> {
        if create_new && fs::try_exists(path).await.unwrap_or(false) {
            return Err(StorageError::AlreadyExists);
        }

        fs::create_dir_all(path.parent().expect("blob path always has a parent")).await?;

        let tmp_path = tmp_sibling(path);
        let mut tmp = File::create(&tmp_path).await?;
        tmp.write_all(bytes).await?;
        tmp.flush().await?;
        drop(tmp);

        if create_new {
            match fs::hard_link(&tmp_path, path).await {
                Ok(()) => {
                    fs::remove_file(&tmp_path).await.ok();
                    Ok(())
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    fs::remove_file(&tmp_path).await.ok();
                    Err(StorageError::AlreadyExists)
                }
                Err(e) => {
                    fs::remove_file(&tmp_path).await.ok();
                    Err(e.into())
                }
            }
        } else {
            fs::rename(&tmp_path, path).await?;
            Ok(())
        }
    }

    async fn write_stream_atomic(
        path: &Path,
        mut stream: BlobStream,
    ) -> StorageResult<()> {
        fs::create_dir_all(path.parent().expect("blob path always has a parent")).await?;

        let tmp_path = tmp_sibling(path);
        let mut tmp = File::create(&tmp_path).await?;
        io::copy(&mut stream, &mut tmp).await?;
        tmp.flush().await?;
        drop(tmp);

        fs::rename(&tmp_path, path).await?;
        Ok(())
    }
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let suffix: u64 = rand::thread_rng().gen();
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("blob");
    path.with_file_name(format!(".tmp-{file_name}-{suffix:x}"))
}

#[async_trait]
impl Storage for LocalStorage {
    async fn config_get(&self, name: &str) -> StorageResult<Vec<u8>> {
        Ok(fs::read(self.config_path(name)).await?)
    }

    async fn config_put(&self, name: &str, bytes: &[u8]) -> StorageResult<()> {
        Self::write_atomic(&self.config_path(name), bytes, true).await
    }

    async fn config_delete(&self, name: &str) -> StorageResult<()> {
        match fs::remove_file(self.config_path(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn narinfo_has(&self, hash: &Hash) -> StorageResult<bool> {
        Ok(fs::try_exists(self.narinfo_path(hash)).await?)
    }

    async fn narinfo_get(&self, hash: &Hash) -> StorageResult<Vec<u8>> {
        Ok(fs::read(self.narinfo_path(hash)).await?)
    }

    async fn narinfo_put(&self, hash: &Hash, bytes: &[u8]) -> StorageResult<()> {
        Self::write_atomic(&self.narinfo_path(hash), bytes, true).await
    }

    async fn narinfo_delete(&self, hash: &Hash) -> StorageResult<()> {
        match fs::remove_file(self.narinfo_path(hash)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn narinfo_walk(
        &self,
        f: &mut (dyn FnMut(Hash) -> StorageResult<()> + Send),
    ) -> StorageResult<()> {
        let root = self.root.join("narinfo");
        let mut level1 = fs::read_dir(&root).await?;
        while let Some(d1) = level1.next_entry().await? {
            if !d1.file_type().await?.is_dir() {
                continue;
            }
            let mut level2 = fs::read_dir(d1.path()).await?;
            while let Some(d2) = level2.next_entry().await? {
                if !d2.file_type().await?.is_dir() {
                    continue;
                }
                let mut files = fs::read_dir(d2.path()).await?;
                while let Some(entry) = files.next_entry().await? {
                    let name = entry.file_name();
                    let name = name.to_string_lossy();
                    let Some(hash_str) = name.strip_suffix(".narinfo") else {
                        continue;
                    };
                    if hash_str.len() != HASH_LEN {
                        continue;
                    }
                    if let Ok(hash) = hash_str.parse::<Hash>() {
                        f(hash)?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn nar_has(&self, url: &NarUrl) -> StorageResult<bool> {
        Ok(fs::try_exists(self.nar_path(url)).await?)
    }

    async fn nar_get(&self, url: &NarUrl) -> StorageResult<Blob> {
        let path = self.nar_path(url);
        let file = File::open(&path).await?;
        let size = file.metadata().await?.len();
        Ok(Blob {
            size,
            stream: Box::pin(file),
        })
    }

    async fn nar_put(&self, url: &NarUrl, _size: u64, stream: BlobStream) -> StorageResult<()> {
        Self::write_stream_atomic(&self.nar_path(url), stream).await
    }

    async fn nar_delete(&self, url: &NarUrl) -> StorageResult<()> {
        match fs::remove_file(self.nar_path(url)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn storage() -> (tempfile::TempDir, LocalStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(LocalStorageConfig {
            path: dir.path().to_owned(),
        })
        .await
        .unwrap();
        (dir, storage)
    }

    const H: &str = "00ji9synj1r6h6sjw27wwv8fw98myxsg";

    #[tokio::test]
    async fn config_put_rejects_duplicate() {
        let (_dir, storage) = storage().await;
        storage.config_put("key-1", b"secret").await.unwrap();
        assert!(matches!(
            storage.config_put("key-1", b"other").await,
            Err(StorageError::AlreadyExists)
        ));
    }

    #[tokio::test]
    async fn narinfo_roundtrip_and_walk() {
        let (_dir, storage) = storage().await;
        let hash: Hash = H.parse().unwrap();
        assert!(!storage.narinfo_has(&hash).await.unwrap());
        storage.narinfo_put(&hash, b"body").await.unwrap();
        assert!(storage.narinfo_has(&hash).await.unwrap());
        assert_eq!(storage.narinfo_get(&hash).await.unwrap(), b"body");

        let mut seen = Vec::new();
        storage
            .narinfo_walk(&mut |h| {
                seen.push(h);
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(seen, vec![hash]);
    }

    #[tokio::test]
    async fn narinfo_delete_is_idempotent() {
        let (_dir, storage) = storage().await;
        let hash: Hash = H.parse().unwrap();
        storage.narinfo_delete(&hash).await.unwrap();
        storage.narinfo_put(&hash, b"x").await.unwrap();
        storage.narinfo_delete(&hash).await.unwrap();
        storage.narinfo_delete(&hash).await.unwrap();
    }

    #[tokio::test]
    async fn nar_put_then_get_streams_back_same_bytes() {
        let (_dir, storage) = storage().await;
        let url: NarUrl = format!("nar/{H}.nar.xz").parse().unwrap();
        let body = b"not really xz data".to_vec();
        storage
            .nar_put(&url, body.len() as u64, Box::pin(std::io::Cursor::new(body.clone())))
            .await
            .unwrap();

        let mut blob = storage.nar_get(&url).await.unwrap();
        assert_eq!(blob.size, body.len() as u64);
        let mut read_back = Vec::new();
        blob.stream.read_to_end(&mut read_back).await.unwrap();
        assert_eq!(read_back, body);
    }
}
