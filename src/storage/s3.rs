//! S3-compatible object storage backend.

use aws_sdk_s3::config::{Builder as S3ConfigBuilder, Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncReadExt;

use super::{Blob, BlobStream, Storage, StorageError, StorageResult};
use crate::hash::{Hash, HASH_LEN};
use crate::nar_url::NarUrl;

#[derive(Debug, Clone, Deserialize)]
pub struct S3StorageConfig {
    pub region: String,
    pub bucket: String,
    /// Custom S3 endpoint, e.g. for Minio.
    pub endpoint: Option<String>,
    pub credentials: Option<S3CredentialsConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3CredentialsConfig {
    pub access_key_id: String,
    pub secret_access_key: String,
}

#[derive(Debug)]
pub struct S3Storage {
    client: Client,
    bucket: String,
}

impl S3Storage {
    pub async fn new(config: S3StorageConfig) -> StorageResult<Self> {
        let shared_config = aws_config::load_from_env().await;
        let mut builder =
            S3ConfigBuilder::from(&shared_config).region(Region::new(config.region.clone()));

        if let Some(creds) = &config.credentials {
            builder = builder.credentials_provider(Credentials::new(
                &creds.access_key_id,
                &creds.secret_access_key,
                None,
                None,
                "cache-proxy",
            ));
        }

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket,
        })
    }

    fn config_key(name: &str) -> String {
        format!("config/{name}")
    }

    fn narinfo_key(hash: &Hash) -> String {
        format!("narinfo/{}", hash.shard_path(".narinfo").display())
    }

    fn nar_key(url: &NarUrl) -> String {
        format!("nar/{}", url.to_file_path().display())
    }

    async fn get_object(&self, key: &str) -> StorageResult<Vec<u8>> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(map_sdk_err)?;

        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Io(e.into()))?
            .into_bytes();

        Ok(bytes.to_vec())
    }

    async fn put_object(&self, key: &str, bytes: Vec<u8>) -> StorageResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(map_sdk_err)?;
        Ok(())
    }

    async fn object_exists(&self, key: &str) -> StorageResult<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                // `as_service_error` is `None` for transport-level failures, so
                // those fall through to `map_sdk_err` rather than "not found".
                let not_found = e.as_service_error().is_some_and(|se| se.is_not_found());
                if not_found {
                    Ok(false)
                } else {
                    Err(map_sdk_err(e))
                }
            }
        }
    }

    async fn delete_object(&self, key: &str) -> StorageResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(map_sdk_err)?;
        Ok(())
    }
}

fn map_sdk_err<E: std::fmt::Display>(e: E) -> StorageError {
    StorageError::Io(anyhow::anyhow!("{e}"))
}

#[async_trait]
impl Storage for S3Storage {
    async fn config_get(&self, name: &str) -> StorageResult<Vec<u8>> {
        self.get_object(&Self::config_key(name)).await
    }

    async fn config_put(&self, name: &str, bytes: &[u8]) -> StorageResult<()> {
        let key = Self::config_key(name);
        if self.object_exists(&key).await? {
            return Err(StorageError::AlreadyExists);
        }
        self.put_object(&key, bytes.to_vec()).await
    }

    async fn config_delete(&self, name: &str) -> StorageResult<()> {
        self.delete_object(&Self::config_key(name)).await
    }

    async fn narinfo_has(&self, hash: &Hash) -> StorageResult<bool> {
        self.object_exists(&Self::narinfo_key(hash)).await
    }

    async fn narinfo_get(&self, hash: &Hash) -> StorageResult<Vec<u8>> {
        self.get_object(&Self::narinfo_key(hash)).await
    }

    async fn narinfo_put(&self, hash: &Hash, bytes: &[u8]) -> StorageResult<()> {
        let key = Self::narinfo_key(hash);
        if self.object_exists(&key).await? {
            return Err(StorageError::AlreadyExists);
        }
        self.put_object(&key, bytes.to_vec()).await
    }

    async fn narinfo_delete(&self, hash: &Hash) -> StorageResult<()> {
        self.delete_object(&Self::narinfo_key(hash)).await
    }

    async fn narinfo_walk(
        &self,
        f: &mut (dyn FnMut(Hash) -> StorageResult<()> + Send),
    ) -> StorageResult<()> {
        let mut continuation_token = None;
        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix("narinfo/");
            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let output = request.send().await.map_err(map_sdk_err)?;

            for object in output.contents() {
                let Some(key) = object.key() else { continue };
                let Some(file_name) = key.rsplit('/').next() else {
                    continue;
                };
                let Some(hash_str) = file_name.strip_suffix(".narinfo") else {
                    continue;
                };
                if hash_str.len() != HASH_LEN {
                    continue;
                }
                if let Ok(hash) = hash_str.parse::<Hash>() {
                    f(hash)?;
                }
            }

            match output.next_continuation_token() {
                Some(token) => continuation_token = Some(token.to_owned()),
                None => break,
            }
        }
        Ok(())
    }

    async fn nar_has(&self, url: &NarUrl) -> StorageResult<bool> {
        self.object_exists(&Self::nar_key(url)).await
    }

    async fn nar_get(&self, url: &NarUrl) -> StorageResult<Blob> {
        let key = Self::nar_key(url);
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(map_sdk_err)?;

        let size = output.content_length().unwrap_or(0).max(0) as u64;
        let reader = output.body.into_async_read();

        Ok(Blob {
            size,
            stream: Box::pin(reader),
        })
    }

    async fn nar_put(&self, url: &NarUrl, size: u64, mut stream: BlobStream) -> StorageResult<()> {
        // The SDK needs the full payload up front to compute a checksum;
        // buffering in memory is acceptable here only because callers have
        // already spooled the stream through a temp file upstream of this
        // call for anything large (see the cache engine's ensureNAR).
        let mut buf = Vec::with_capacity(size as usize);
        stream
            .read_to_end(&mut buf)
            .await
            .map_err(|e| StorageError::Io(e.into()))?;
        self.put_object(&Self::nar_key(url), buf).await
    }

    async fn nar_delete(&self, url: &NarUrl) -> StorageResult<()> {
        self.delete_object(&Self::nar_key(url)).await
    }
}
