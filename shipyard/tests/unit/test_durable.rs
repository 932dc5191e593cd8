//! Durable log transport tests: emitter to append log to queryable store

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use shipyard::errors::PlatformError;
use shipyard::models::log_event::{LogEvent, LogSource, StoredLog};
use shipyard::transport::durable::{AppendLog, DurableSink, LogStore, MemoryAppendLog, MemoryLogStore};
use shipyard::transport::emitter::LogEmitter;
use shipyard::workers::ingester::process_batch;
use uuid::Uuid;

const GROUP: &str = "api-server-logs-consumer";

fn event(deployment_id: Uuid, sequence: u64, text: &str) -> LogEvent {
    LogEvent {
        event_id: Uuid::new_v4(),
        deployment_id,
        project_id: Uuid::nil(),
        sequence,
        timestamp: Utc::now(),
        source: LogSource::Stdout,
        text: text.to_string(),
    }
}

async fn append(log: &MemoryAppendLog, event: &LogEvent) {
    log.append(&serde_json::to_vec(event).unwrap()).await.unwrap();
}

/// Fails inserts of chosen texts while `failing` is set
#[derive(Default)]
struct FlakyStore {
    inner: MemoryLogStore,
    failing: AtomicBool,
    fail_texts: Mutex<HashSet<String>>,
}

impl FlakyStore {
    fn fail_on(&self, text: &str) {
        self.fail_texts.lock().unwrap().insert(text.to_string());
        self.failing.store(true, Ordering::SeqCst);
    }

    fn recover(&self) {
        self.failing.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl LogStore for FlakyStore {
    async fn insert(&self, event: &LogEvent) -> Result<bool, PlatformError> {
        if self.failing.load(Ordering::SeqCst) && self.fail_texts.lock().unwrap().contains(&event.text) {
            return Err(PlatformError::StorageError("disk full".to_string()));
        }
        self.inner.insert(event).await
    }

    async fn query(&self, deployment_id: Uuid) -> Result<Vec<StoredLog>, PlatformError> {
        self.inner.query(deployment_id).await
    }
}

#[tokio::test]
async fn test_emitter_to_store() {
    let log = Arc::new(MemoryAppendLog::new());
    let store = MemoryLogStore::new();
    let deployment_id = Uuid::new_v4();

    let emitter = LogEmitter::new(Arc::new(DurableSink::new(log.clone())), deployment_id, Uuid::new_v4());
    emitter.info("starting build");
    emitter.emit(LogSource::Stdout, "compiling");
    emitter.info("deployment complete");
    emitter.close().await.unwrap();
    assert_eq!(log.len(), 3);

    let report = process_batch(log.as_ref(), &store, GROUP, 100).await.unwrap();
    assert_eq!(report.fetched, 3);
    assert_eq!(report.stored, 3);
    assert_eq!(report.committed, Some(3));
    assert_eq!(log.committed(GROUP), 3);
    assert!(log.last_heartbeat(GROUP).is_some());

    let texts: Vec<String> = store
        .query(deployment_id)
        .await
        .unwrap()
        .into_iter()
        .map(|l| l.text)
        .collect();
    assert_eq!(texts, vec!["starting build", "compiling", "deployment complete"]);

    // Drained: nothing left to fetch
    let report = process_batch(log.as_ref(), &store, GROUP, 100).await.unwrap();
    assert_eq!(report.fetched, 0);
}

#[tokio::test]
async fn test_redelivery_after_crash_before_commit_is_idempotent() {
    let log = MemoryAppendLog::new();
    let store = MemoryLogStore::new();
    let deployment_id = Uuid::new_v4();

    let first = event(deployment_id, 0, "one");
    let second = event(deployment_id, 1, "two");
    append(&log, &first).await;
    append(&log, &second).await;

    // Written to the store but the consumer died before committing
    store.insert(&first).await.unwrap();
    store.insert(&second).await.unwrap();
    assert_eq!(log.committed(GROUP), 0);

    let report = process_batch(&log, &store, GROUP, 100).await.unwrap();
    assert_eq!(report.duplicates, 2);
    assert_eq!(report.stored, 0);
    assert_eq!(report.committed, Some(2));

    assert_eq!(store.row_count(), 2);
    let rows = store.query(deployment_id).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].event_id, first.event_id);
}

#[tokio::test]
async fn test_failed_write_blocks_commit_but_not_later_writes() {
    let log = MemoryAppendLog::new();
    let store = FlakyStore::default();
    let deployment_id = Uuid::new_v4();

    for (i, text) in ["a", "b", "c", "d"].iter().enumerate() {
        append(&log, &event(deployment_id, i as u64, text)).await;
    }

    store.fail_on("b");
    let report = process_batch(&log, &store, GROUP, 100).await.unwrap();
    assert_eq!(report.fetched, 4);
    assert_eq!(report.stored, 3);
    assert_eq!(report.failed, 1);
    // Only the prefix before the failure is committed
    assert_eq!(report.committed, Some(1));
    assert_eq!(log.committed(GROUP), 1);

    // b, c and d are redelivered; c and d are already stored
    store.recover();
    let report = process_batch(&log, &store, GROUP, 100).await.unwrap();
    assert_eq!(report.fetched, 3);
    assert_eq!(report.stored, 1);
    assert_eq!(report.duplicates, 2);
    assert_eq!(log.committed(GROUP), 4);

    let texts: Vec<String> = store
        .query(deployment_id)
        .await
        .unwrap()
        .into_iter()
        .map(|l| l.text)
        .collect();
    assert_eq!(texts, vec!["a", "b", "c", "d"]);
}

#[tokio::test]
async fn test_malformed_record_is_skipped() {
    let log = MemoryAppendLog::new();
    let store = MemoryLogStore::new();
    let deployment_id = Uuid::new_v4();

    log.append(b"not json").await.unwrap();
    append(&log, &event(deployment_id, 0, "ok")).await;

    let report = process_batch(&log, &store, GROUP, 100).await.unwrap();
    assert_eq!(report.stored, 1);
    assert_eq!(log.committed(GROUP), 2);
}

#[tokio::test]
async fn test_late_events_for_finished_deployment_are_accepted() {
    let log = MemoryAppendLog::new();
    let store = MemoryLogStore::new();
    let deployment_id = Uuid::new_v4();

    append(&log, &event(deployment_id, 0, "deployment complete")).await;
    process_batch(&log, &store, GROUP, 100).await.unwrap();

    append(&log, &event(deployment_id, 1, "trailing line")).await;
    process_batch(&log, &store, GROUP, 100).await.unwrap();

    assert_eq!(store.query(deployment_id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_batch_size_limits_fetch() {
    let log = MemoryAppendLog::new();
    let store = MemoryLogStore::new();
    let deployment_id = Uuid::new_v4();

    for i in 0..5 {
        append(&log, &event(deployment_id, i, "line")).await;
    }

    let report = process_batch(&log, &store, GROUP, 2).await.unwrap();
    assert_eq!(report.fetched, 2);
    assert_eq!(log.committed(GROUP), 2);
}
