//! Artifact publisher: uploads a build output tree to blob storage

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::errors::PlatformError;
use crate::storage::blob::{content_type_for, BlobStore};
use crate::transport::emitter::LogEmitter;

/// Result of a complete publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReport {
    pub deployment_id: Uuid,
    /// Keys written, sorted
    pub keys: Vec<String>,
}

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Upload every regular file under `output_dir`. Succeeds only when every
    /// file was written.
    async fn publish(
        &self,
        deployment_id: Uuid,
        project_id: Uuid,
        output_dir: &Path,
    ) -> Result<PublishReport, PlatformError>;
}

/// A file to upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactFile {
    pub path: PathBuf,
    /// Path relative to the output directory, `/`-separated
    pub relative: String,
}

/// Object key for one artifact file
pub fn artifact_key(prefix: &str, project_id: &Uuid, relative: &str) -> String {
    format!("{}/{}/{}", prefix.trim_end_matches('/'), project_id, relative)
}

/// Every regular file under `root`, sorted by relative path
pub fn collect_files(root: &Path) -> Result<Vec<ArtifactFile>, PlatformError> {
    if !root.is_dir() {
        return Err(PlatformError::PublishFailure(format!(
            "build output directory {} does not exist",
            root.display()
        )));
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| PlatformError::PublishFailure(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| PlatformError::Internal(e.to_string()))?
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        files.push(ArtifactFile {
            path: entry.path().to_path_buf(),
            relative,
        });
    }

    files.sort_by(|a, b| a.relative.cmp(&b.relative));
    Ok(files)
}

/// Publishes with one concurrent upload per file.
///
/// All uploads share one cancellation token. The first failure cancels it,
/// which drops every in-flight `put` and stops uploads that have not started.
pub struct ArtifactPublisher {
    store: Arc<dyn BlobStore>,
    bucket: String,
    prefix: String,
    emitter: Option<LogEmitter>,
}

impl ArtifactPublisher {
    pub fn new(store: Arc<dyn BlobStore>, bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            prefix: prefix.into(),
            emitter: None,
        }
    }

    /// Report each upload to the deployment's log trail
    pub fn with_emitter(mut self, emitter: LogEmitter) -> Self {
        self.emitter = Some(emitter);
        self
    }
}

#[async_trait]
impl Publisher for ArtifactPublisher {
    async fn publish(
        &self,
        deployment_id: Uuid,
        project_id: Uuid,
        output_dir: &Path,
    ) -> Result<PublishReport, PlatformError> {
        let files = collect_files(output_dir)?;
        if files.is_empty() {
            warn!("Deployment {} has no files to publish", deployment_id);
        }

        let cancel = CancellationToken::new();
        let mut uploads = JoinSet::new();

        for file in files {
            let key = artifact_key(&self.prefix, &project_id, &file.relative);
            if let Some(emitter) = &self.emitter {
                emitter.info(format!("uploading {}", file.relative));
            }

            let store = self.store.clone();
            let bucket = self.bucket.clone();
            let cancel = cancel.clone();

            uploads.spawn(async move {
                let content_type = content_type_for(&file.path);
                let bytes = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(PlatformError::Cancelled(key.clone())),
                    read = tokio::fs::read(&file.path) => read.map_err(|e| {
                        PlatformError::PublishFailure(format!("reading {}: {}", file.path.display(), e))
                    })?,
                };

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(PlatformError::Cancelled(key.clone())),
                    put = store.put(&bucket, &key, bytes, content_type) => match put {
                        Ok(()) => {
                            debug!("Uploaded {} ({})", key, content_type);
                            Ok(key)
                        }
                        Err(e) => Err(PlatformError::PublishFailure(format!("upload of {} failed: {}", key, e))),
                    },
                }
            });
        }

        let mut keys = Vec::new();
        let mut first_error: Option<PlatformError> = None;

        while let Some(joined) = uploads.join_next().await {
            let result = joined
                .map_err(|e| PlatformError::PublishFailure(format!("upload task failed: {}", e)))
                .and_then(|r| r);

            match result {
                Ok(key) => keys.push(key),
                Err(e) if first_error.is_none() => {
                    warn!("Cancelling remaining uploads for {}: {}", deployment_id, e);
                    cancel.cancel();
                    first_error = Some(e);
                }
                Err(e) => debug!("Upload stopped after cancellation: {}", e),
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        keys.sort();
        info!("Published {} objects for deployment {}", keys.len(), deployment_id);
        Ok(PublishReport { deployment_id, keys })
    }
}
