use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::{stream::BoxStream, StreamExt, TryStreamExt};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::sync::RwLock;

use crate::config::MAX_SIGNED_URL_TTL;
use crate::error::{DispatchError, Result};

pub type ByteStream = BoxStream<'static, Result<Bytes>>;

#[derive(Debug, Clone, PartialEq)]
pub struct BlobMeta {
    pub name: String,
    pub size: u64,
    pub content_type: String,
    pub public_url: String,
}

pub fn public_url(bucket: &str, path: &str) -> String {
    format!("https://storage.googleapis.com/{}/{}", bucket, path)
}

/// Object store gateway. Paths are `kind/owner_or_hash/filename`.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Overwrites on conflict.
    async fn put(&self, bucket: &str, path: &str, data: Bytes, content_type: &str) -> Result<()>;

    /// Fails `NotFound` if absent.
    async fn get(&self, bucket: &str, path: &str) -> Result<ByteStream>;

    async fn exists(&self, bucket: &str, path: &str) -> Result<bool>;

    /// Lazy listing; the stream cannot be restarted.
    fn list(&self, bucket: &str, prefix: &str) -> BoxStream<'static, Result<BlobMeta>>;

    /// HTTPS URL valid for `ttl` (at most 7 days). Fails `NotFound` if absent.
    async fn sign(&self, bucket: &str, path: &str, ttl: Duration) -> Result<String>;

    async fn get_bytes(&self, bucket: &str, path: &str) -> Result<Bytes> {
        let chunks: Vec<Bytes> = self.get(bucket, path).await?.try_collect().await?;
        Ok(Bytes::from(chunks.concat()))
    }
}

pub fn check_ttl(ttl: Duration) -> Result<()> {
    if ttl.is_zero() || ttl > MAX_SIGNED_URL_TTL {
        return Err(DispatchError::BadRequest(format!(
            "signed url ttl must be between 1s and {}s",
            MAX_SIGNED_URL_TTL.as_secs()
        )));
    }
    Ok(())
}

/* ---------------- in-memory ---------------- */

#[derive(Debug, Clone)]
struct StoredBlob {
    data: Bytes,
    content_type: String,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: Arc<RwLock<BTreeMap<(String, String), StoredBlob>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put(&self, bucket: &str, path: &str, data: Bytes, content_type: &str) -> Result<()> {
        let blob = StoredBlob {
            data,
            content_type: content_type.to_string(),
        };
        self.blobs
            .write()
            .await
            .insert((bucket.to_string(), path.to_string()), blob);
        Ok(())
    }

    async fn get(&self, bucket: &str, path: &str) -> Result<ByteStream> {
        let blobs = self.blobs.read().await;
        let blob = blobs
            .get(&(bucket.to_string(), path.to_string()))
            .ok_or_else(|| DispatchError::not_found(format!("blob {bucket}/{path}")))?;
        let data = blob.data.clone();
        Ok(futures::stream::once(async move { Ok(data) }).boxed())
    }

    async fn exists(&self, bucket: &str, path: &str) -> Result<bool> {
        Ok(self
            .blobs
            .read()
            .await
            .contains_key(&(bucket.to_string(), path.to_string())))
    }

    fn list(&self, bucket: &str, prefix: &str) -> BoxStream<'static, Result<BlobMeta>> {
        let blobs = self.blobs.clone();
        let (bucket, prefix) = (bucket.to_string(), prefix.to_string());
        // snapshot al primer poll; el stream no retiene el lock
        futures::stream::once(async move {
            let blobs = blobs.read().await;
            let metas: Vec<Result<BlobMeta>> = blobs
                .iter()
                .filter(|((b, p), _)| *b == bucket && p.starts_with(&prefix))
                .map(|((b, p), blob)| {
                    Ok(BlobMeta {
                        name: p.clone(),
                        size: blob.data.len() as u64,
                        content_type: blob.content_type.clone(),
                        public_url: public_url(b, p),
                    })
                })
                .collect();
            futures::stream::iter(metas)
        })
        .flatten()
        .boxed()
    }

    async fn sign(&self, bucket: &str, path: &str, ttl: Duration) -> Result<String> {
        check_ttl(ttl)?;
        if !self.exists(bucket, path).await? {
            return Err(DispatchError::not_found(format!("blob {bucket}/{path}")));
        }
        let expires = Utc::now().timestamp() + ttl.as_secs() as i64;
        Ok(format!("{}?expires={}", public_url(bucket, path), expires))
    }
}
