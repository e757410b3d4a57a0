use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{stream, stream::BoxStream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::error::{DispatchError, Result};
use crate::gcp::{encode_component, encode_path, GoogleApi};
use crate::storage::{check_ttl, public_url, BlobMeta, ByteStream, ObjectStore};

const API: &str = "https://storage.googleapis.com/storage/v1";
const UPLOAD_API: &str = "https://storage.googleapis.com/upload/storage/v1";
const IAM_CREDENTIALS: &str = "https://iamcredentials.googleapis.com/v1";
const SIGNING_HOST: &str = "storage.googleapis.com";

/// Cloud Storage JSON API. Signed URLs are V4, signed remotely through
/// the IAM Credentials `signBlob` call so no private key is held here.
#[derive(Debug, Clone)]
pub struct GcsStore {
    api: GoogleApi,
    signer_email: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectResource {
    name: String,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    content_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectList {
    #[serde(default)]
    items: Vec<ObjectResource>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Serialize)]
struct SignBlobRequest {
    payload: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignBlobResponse {
    signed_blob: String,
}

impl ObjectResource {
    fn into_meta(self, bucket: &str) -> BlobMeta {
        BlobMeta {
            public_url: public_url(bucket, &self.name),
            size: self.size.and_then(|s| s.parse().ok()).unwrap_or(0),
            content_type: self
                .content_type
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            name: self.name,
        }
    }
}

impl GcsStore {
    pub fn new(api: GoogleApi, signer_email: impl Into<String>) -> Self {
        Self {
            api,
            signer_email: signer_email.into(),
        }
    }

    fn object_url(bucket: &str, path: &str) -> String {
        format!("{}/b/{}/o/{}", API, encode_component(bucket), encode_component(path))
    }

    async fn list_page(&self, bucket: &str, prefix: &str, page_token: &str) -> Result<ObjectList> {
        let mut query = vec![("prefix", prefix.to_string())];
        if !page_token.is_empty() {
            query.push(("pageToken", page_token.to_string()));
        }
        let req = self
            .api
            .http()
            .get(format!("{}/b/{}/o", API, encode_component(bucket)))
            .query(&query);
        self.api.send_json(req, &format!("list gs://{bucket}/{prefix}")).await
    }

    async fn sign_blob(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let url = format!(
            "{}/projects/-/serviceAccounts/{}:signBlob",
            IAM_CREDENTIALS,
            encode_component(&self.signer_email)
        );
        let req = self.api.http().post(url).json(&SignBlobRequest {
            payload: STANDARD.encode(payload),
        });
        let resp: SignBlobResponse = self.api.send_json(req, "signBlob").await?;
        STANDARD
            .decode(resp.signed_blob)
            .map_err(|e| DispatchError::Upstream(format!("signBlob returned invalid base64: {e}")))
    }
}

#[async_trait]
impl ObjectStore for GcsStore {
    async fn put(&self, bucket: &str, path: &str, data: Bytes, content_type: &str) -> Result<()> {
        let req = self
            .api
            .http()
            .post(format!("{}/b/{}/o", UPLOAD_API, encode_component(bucket)))
            .query(&[("uploadType", "media"), ("name", path)])
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(data);
        self.api.send(req, &format!("upload gs://{bucket}/{path}")).await?;
        Ok(())
    }

    async fn get(&self, bucket: &str, path: &str) -> Result<ByteStream> {
        let req = self
            .api
            .http()
            .get(Self::object_url(bucket, path))
            .query(&[("alt", "media")]);
        let resp = self.api.send(req, &format!("blob {bucket}/{path}")).await?;
        Ok(resp.bytes_stream().map_err(DispatchError::from).boxed())
    }

    async fn exists(&self, bucket: &str, path: &str) -> Result<bool> {
        let req = self.api.http().get(Self::object_url(bucket, path));
        match self.api.send(req, &format!("blob {bucket}/{path}")).await {
            Ok(_) => Ok(true),
            Err(DispatchError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn list(&self, bucket: &str, prefix: &str) -> BoxStream<'static, Result<BlobMeta>> {
        let this = self.clone();
        let bucket = bucket.to_string();
        let prefix = prefix.to_string();

        // state: next page token, None once the last page was read
        stream::try_unfold(Some(String::new()), move |token| {
            let this = this.clone();
            let bucket = bucket.clone();
            let prefix = prefix.clone();
            async move {
                let Some(token) = token else {
                    return Ok(None);
                };
                let page = this.list_page(&bucket, &prefix, &token).await?;
                let next = page.next_page_token.filter(|t| !t.is_empty());
                let items: Vec<Result<BlobMeta>> =
                    page.items.into_iter().map(|o| Ok(o.into_meta(&bucket))).collect();
                Ok::<_, DispatchError>(Some((stream::iter(items), next)))
            }
        })
        .try_flatten()
        .boxed()
    }

    async fn sign(&self, bucket: &str, path: &str, ttl: Duration) -> Result<String> {
        check_ttl(ttl)?;
        if !self.exists(bucket, path).await? {
            return Err(DispatchError::not_found(format!("blob {bucket}/{path}")));
        }

        let v4 = V4Request::new(bucket, path, &self.signer_email, ttl, Utc::now());
        let signature = self.sign_blob(v4.string_to_sign().as_bytes()).await?;
        Ok(v4.url(&hex::encode(signature)))
    }
}

/* ---- V4 signing ---- */

/// Pieces of a V4 signed GET, computed before the remote signature.
#[derive(Debug, Clone)]
struct V4Request {
    canonical_uri: String,
    canonical_query: String,
    timestamp: String,
    scope: String,
}

impl V4Request {
    fn new(bucket: &str, path: &str, signer: &str, ttl: Duration, now: DateTime<Utc>) -> Self {
        let timestamp = now.format("%Y%m%dT%H%M%SZ").to_string();
        let scope = format!("{}/auto/storage/goog4_request", now.format("%Y%m%d"));
        let credential = format!("{signer}/{scope}");

        // already sorted by key
        let params = [
            ("X-Goog-Algorithm", "GOOG4-RSA-SHA256".to_string()),
            ("X-Goog-Credential", credential),
            ("X-Goog-Date", timestamp.clone()),
            ("X-Goog-Expires", ttl.as_secs().to_string()),
            ("X-Goog-SignedHeaders", "host".to_string()),
        ];
        let canonical_query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, encode_component(v)))
            .collect::<Vec<_>>()
            .join("&");

        Self {
            canonical_uri: format!("/{}/{}", bucket, encode_path(path)),
            canonical_query,
            timestamp,
            scope,
        }
    }

    fn canonical_request(&self) -> String {
        format!(
            "GET\n{}\n{}\nhost:{}\n\nhost\nUNSIGNED-PAYLOAD",
            self.canonical_uri, self.canonical_query, SIGNING_HOST
        )
    }

    fn string_to_sign(&self) -> String {
        let digest = hex::encode(Sha256::digest(self.canonical_request().as_bytes()));
        format!("GOOG4-RSA-SHA256\n{}\n{}\n{}", self.timestamp, self.scope, digest)
    }

    fn url(&self, signature_hex: &str) -> String {
        format!(
            "https://{}{}?{}&X-Goog-Signature={}",
            SIGNING_HOST, self.canonical_uri, self.canonical_query, signature_hex
        )
    }
}
