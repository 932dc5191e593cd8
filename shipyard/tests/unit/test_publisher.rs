//! Artifact publisher tests

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use shipyard::deploy::publisher::{ArtifactPublisher, Publisher};
use shipyard::errors::PlatformError;
use shipyard::storage::blob::{BlobObject, BlobStore, MemoryBlobStore};
use uuid::Uuid;

const BUCKET: &str = "shipyard-outputs";
const PREFIX: &str = "__outputs";

fn write(root: &Path, relative: &str, contents: &str) {
    let path = root.join(relative);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

#[tokio::test]
async fn test_publish_uploads_every_file() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "index.html", "<h1>demo</h1>");
    write(dir.path(), "assets/app.js", "console.log('demo')");

    let store = Arc::new(MemoryBlobStore::new());
    let publisher = ArtifactPublisher::new(store.clone(), BUCKET, PREFIX);
    let project_id = Uuid::new_v4();
    let deployment_id = Uuid::new_v4();

    let report = publisher
        .publish(deployment_id, project_id, dir.path())
        .await
        .unwrap();

    let index_key = format!("{}/{}/index.html", PREFIX, project_id);
    let app_key = format!("{}/{}/assets/app.js", PREFIX, project_id);

    assert_eq!(report.deployment_id, deployment_id);
    assert_eq!(report.keys, vec![app_key.clone(), index_key.clone()]);
    assert_eq!(store.keys(BUCKET).len(), 2);

    let index = store.object(BUCKET, &index_key).unwrap();
    assert_eq!(index.content_type, "text/html");
    assert_eq!(index.bytes, b"<h1>demo</h1>".to_vec());

    let app = store.object(BUCKET, &app_key).unwrap();
    assert_eq!(app.content_type, "application/javascript");
}

#[tokio::test]
async fn test_publish_empty_output_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryBlobStore::new());
    let publisher = ArtifactPublisher::new(store.clone(), BUCKET, PREFIX);

    let report = publisher
        .publish(Uuid::new_v4(), Uuid::new_v4(), dir.path())
        .await
        .unwrap();
    assert!(report.keys.is_empty());
}

#[tokio::test]
async fn test_publish_missing_output_fails() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryBlobStore::new());
    let publisher = ArtifactPublisher::new(store.clone(), BUCKET, PREFIX);

    let result = publisher
        .publish(Uuid::new_v4(), Uuid::new_v4(), &dir.path().join("dist"))
        .await;
    assert!(matches!(result, Err(PlatformError::PublishFailure(_))));
    assert!(store.keys(BUCKET).is_empty());
}

/// Fails puts of `bad.txt` at once; every other put hangs until dropped
#[derive(Default)]
struct SlowFailingStore {
    started: AtomicUsize,
    completed: AtomicUsize,
}

#[async_trait]
impl BlobStore for SlowFailingStore {
    async fn put(
        &self,
        _bucket: &str,
        key: &str,
        _bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<(), PlatformError> {
        if key.ends_with("bad.txt") {
            return Err(PlatformError::StorageError("access denied".to_string()));
        }
        self.started.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(300)).await;
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, _bucket: &str, _key: &str) -> Result<Option<BlobObject>, PlatformError> {
        Ok(None)
    }
}

#[tokio::test]
async fn test_publish_failure_cancels_in_flight_uploads() {
    let dir = tempfile::tempdir().unwrap();
    for i in 0..20 {
        write(dir.path(), &format!("file-{:02}.txt", i), "x");
    }
    write(dir.path(), "bad.txt", "x");

    let store = Arc::new(SlowFailingStore::default());
    let publisher = ArtifactPublisher::new(store.clone(), BUCKET, PREFIX);

    let result = publisher
        .publish(Uuid::new_v4(), Uuid::new_v4(), dir.path())
        .await;
    match result {
        Err(PlatformError::PublishFailure(message)) => assert!(message.contains("bad.txt")),
        other => panic!("expected a publish failure, got {:?}", other),
    }

    // Nothing finishes or starts once cancellation has fired
    let started = store.started.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(store.started.load(Ordering::SeqCst), started);
    assert_eq!(store.completed.load(Ordering::SeqCst), 0);
}
