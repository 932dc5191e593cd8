//! Blob storage for published artifacts

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;
use url::Url;

use crate::errors::PlatformError;

/// A stored object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobObject {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// Per-object put/get over a bucket.
///
/// Dropping a `put` future must abandon the write; that is how in-flight
/// uploads are cancelled.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), PlatformError>;

    /// `None` when the object does not exist
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<BlobObject>, PlatformError>;
}

/// Content type inferred from a file extension
pub fn content_type_for(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    match extension.as_str() {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" | "mjs" | "cjs" => "application/javascript",
        "json" | "map" => "application/json",
        "webmanifest" => "application/manifest+json",
        "txt" => "text/plain",
        "csv" => "text/csv",
        "xml" => "application/xml",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "avif" => "image/avif",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "otf" => "font/otf",
        "wasm" => "application/wasm",
        "pdf" => "application/pdf",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        _ => "application/octet-stream",
    }
}

/// Reject keys that could escape the bucket
fn checked_key(key: &str) -> Result<&Path, PlatformError> {
    let path = Path::new(key);
    if key.is_empty() || !path.components().all(|c| matches!(c, Component::Normal(_))) {
        return Err(PlatformError::ValidationError(format!("invalid object key: {}", key)));
    }
    Ok(path)
}

/// In-memory blob store
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<BTreeMap<(String, String), BlobObject>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys stored in a bucket, sorted
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        objects
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<BlobObject> {
        let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        objects.get(&(bucket.to_string(), key.to_string())).cloned()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), PlatformError> {
        checked_key(key)?;
        let mut objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        objects.insert(
            (bucket.to_string(), key.to_string()),
            BlobObject {
                bytes,
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Option<BlobObject>, PlatformError> {
        Ok(self.object(bucket, key))
    }
}

/// Blob store on the local filesystem: `{root}/{bucket}/{key}`
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, PlatformError> {
        let key = checked_key(key)?;
        Ok(self.root.join(checked_key(bucket)?).join(key))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<(), PlatformError> {
        let path = self.object_path(bucket, key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        debug!("Stored {}", path.display());
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Option<BlobObject>, PlatformError> {
        let path = self.object_path(bucket, key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(BlobObject {
                bytes,
                content_type: content_type_for(&path).to_string(),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Blob store speaking plain HTTP `PUT`/`GET` to `{endpoint}/{bucket}/{key}`
pub struct HttpBlobStore {
    client: reqwest::Client,
    endpoint: Url,
    token: Option<SecretString>,
}

impl HttpBlobStore {
    pub fn new(endpoint: &str, token: Option<SecretString>) -> Result<Self, PlatformError> {
        let endpoint = Url::parse(endpoint).map_err(|e| PlatformError::ConfigError(e.to_string()))?;
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| PlatformError::ConfigError(e.to_string()))?;
        Ok(Self {
            client,
            endpoint,
            token,
        })
    }

    fn object_url(&self, bucket: &str, key: &str) -> Result<Url, PlatformError> {
        checked_key(key)?;
        let base = self.endpoint.as_str().trim_end_matches('/');
        Url::parse(&format!("{}/{}/{}", base, bucket, key))
            .map_err(|e| PlatformError::StorageError(e.to_string()))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token.expose_secret()),
            None => request,
        }
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), PlatformError> {
        let url = self.object_url(bucket, key)?;
        let response = self
            .authorize(self.client.put(url))
            .header(CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(PlatformError::StorageError(format!(
                "PUT {}/{} returned {}",
                bucket,
                key,
                response.status()
            )));
        }
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Option<BlobObject>, PlatformError> {
        let url = self.object_url(bucket, key)?;
        let response = self.authorize(self.client.get(url)).send().await?;

        // Any non-2xx is treated as absent
        if !response.status().is_success() {
            return Ok(None);
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| content_type_for(Path::new(key)).to_string());
        let bytes = response.bytes().await?.to_vec();

        Ok(Some(BlobObject { bytes, content_type }))
    }
}
