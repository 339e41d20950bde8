//! Blob store interface: `ConfigBlob`, `NARInfoBlob`, `NARBlob`.
//!
//! Every backend exposes the same narrow capability set —
//! `Has`/`Get`/`Put`/`Delete`/`Walk` — keyed either by a secret-key name
//! (config), a [`Hash`](crate::hash::Hash) (NARInfo), or a
//! [`NarUrl`](crate::nar_url::NarUrl) (NAR body). Put is always atomic:
//! a crash mid-write must leave no visible object.

pub mod local;
pub mod s3;

use std::pin::Pin;

use async_trait::async_trait;
use tokio::io::AsyncRead;

pub use local::LocalStorage;
pub use s3::S3Storage;

use crate::hash::Hash;
use crate::nar_url::NarUrl;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("storage io error: {0}")]
    Io(anyhow::Error),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

pub type BlobStream = Pin<Box<dyn AsyncRead + Send + Unpin>>;

/// A downloaded blob: its declared size and a streaming body.
pub struct Blob {
    pub size: u64,
    pub stream: BlobStream,
}

/// Backend-agnostic blob store. Implemented by [`LocalStorage`] and
/// [`S3Storage`]; callers never match on the concrete type.
#[async_trait]
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Raw secret-key config blob, keyed by name (there is exactly one:
    /// the signing keypair).
    async fn config_get(&self, name: &str) -> StorageResult<Vec<u8>>;
    /// Fails with `AlreadyExists` if already present (compare-and-create).
    async fn config_put(&self, name: &str, bytes: &[u8]) -> StorageResult<()>;
    async fn config_delete(&self, name: &str) -> StorageResult<()>;

    async fn narinfo_has(&self, hash: &Hash) -> StorageResult<bool>;
    async fn narinfo_get(&self, hash: &Hash) -> StorageResult<Vec<u8>>;
    /// Fails with `AlreadyExists` if already present.
    async fn narinfo_put(&self, hash: &Hash, bytes: &[u8]) -> StorageResult<()>;
    /// Idempotent: `NotFound` is not surfaced by callers as failure.
    async fn narinfo_delete(&self, hash: &Hash) -> StorageResult<()>;
    /// Iterates every stored `.narinfo` key, aborting early if `f` errors.
    /// Not required to be snapshot-consistent with concurrent writers.
    async fn narinfo_walk(
        &self,
        f: &mut (dyn FnMut(Hash) -> StorageResult<()> + Send),
    ) -> StorageResult<()>;

    async fn nar_has(&self, url: &NarUrl) -> StorageResult<bool>;
    async fn nar_get(&self, url: &NarUrl) -> StorageResult<Blob>;
    /// `stream` is consumed fully; the backend buffers to a temp file if it
    /// needs to know the size up front (never to memory).
    async fn nar_put(&self, url: &NarUrl, size: u64, stream: BlobStream) -> StorageResult<()>;
    async fn nar_delete(&self, url: &NarUrl) -> StorageResult<()>;
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound,
            std::io::ErrorKind::AlreadyExists => Self::AlreadyExists,
            _ => Self::Io(e.into()),
        }
    }
}
