//! Durable log transport: an ordered append log drained into a queryable store

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::PlatformError;
use crate::models::log_event::{LogEvent, StoredLog};
use crate::transport::emitter::LogSink;

/// One record read back from the append log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Position in the log, starting at 1
    pub offset: u64,
    pub payload: Vec<u8>,
}

/// Ordered, replicated message log with per-group committed offsets
#[async_trait]
pub trait AppendLog: Send + Sync {
    /// Append a payload and return its offset
    async fn append(&self, payload: &[u8]) -> Result<u64, PlatformError>;

    /// Read up to `max` records after the group's committed offset.
    ///
    /// Anything not committed is returned again on the next fetch.
    async fn fetch(&self, group: &str, max: usize) -> Result<Vec<LogRecord>, PlatformError>;

    /// Mark every record up to and including `offset` as processed
    async fn commit(&self, group: &str, offset: u64) -> Result<(), PlatformError>;

    /// Keep the group's membership alive during a slow batch
    async fn heartbeat(&self, group: &str) -> Result<(), PlatformError>;
}

/// Queryable store the ingester writes into
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Insert an event, returning `false` when its `event_id` is already stored
    async fn insert(&self, event: &LogEvent) -> Result<bool, PlatformError>;

    /// Logs of one deployment in emission order
    async fn query(&self, deployment_id: Uuid) -> Result<Vec<StoredLog>, PlatformError>;
}

/// Producer side of the durable transport
pub struct DurableSink {
    log: Arc<dyn AppendLog>,
}

impl DurableSink {
    pub fn new(log: Arc<dyn AppendLog>) -> Self {
        Self { log }
    }
}

#[async_trait]
impl LogSink for DurableSink {
    async fn append(&self, event: &LogEvent) -> Result<(), PlatformError> {
        let payload = serde_json::to_vec(event)?;
        self.log
            .append(&payload)
            .await
            .map(|_| ())
            .map_err(|e| PlatformError::TransportError(e.to_string()))
    }
}

#[derive(Default)]
struct MemoryLogState {
    records: Vec<Vec<u8>>,
    committed: HashMap<String, u64>,
    heartbeats: HashMap<String, DateTime<Utc>>,
}

/// In-process append log
#[derive(Default)]
pub struct MemoryAppendLog {
    state: Mutex<MemoryLogState>,
}

impl MemoryAppendLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed offset of a group, 0 when nothing was committed
    pub fn committed(&self, group: &str) -> u64 {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.committed.get(group).copied().unwrap_or(0)
    }

    pub fn last_heartbeat(&self, group: &str) -> Option<DateTime<Utc>> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.heartbeats.get(group).copied()
    }

    pub fn len(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AppendLog for MemoryAppendLog {
    async fn append(&self, payload: &[u8]) -> Result<u64, PlatformError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.records.push(payload.to_vec());
        Ok(state.records.len() as u64)
    }

    async fn fetch(&self, group: &str, max: usize) -> Result<Vec<LogRecord>, PlatformError> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let committed = state.committed.get(group).copied().unwrap_or(0) as usize;

        Ok(state
            .records
            .iter()
            .enumerate()
            .skip(committed)
            .take(max)
            .map(|(index, payload)| LogRecord {
                offset: index as u64 + 1,
                payload: payload.clone(),
            })
            .collect())
    }

    async fn commit(&self, group: &str, offset: u64) -> Result<(), PlatformError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let committed = state.committed.entry(group.to_string()).or_insert(0);
        *committed = (*committed).max(offset);
        Ok(())
    }

    async fn heartbeat(&self, group: &str) -> Result<(), PlatformError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.heartbeats.insert(group.to_string(), Utc::now());
        Ok(())
    }
}

#[derive(Default)]
struct MemoryStoreState {
    seen: HashSet<Uuid>,
    events: Vec<LogEvent>,
}

/// In-process queryable log store, deduplicating by `event_id`
#[derive(Default)]
pub struct MemoryLogStore {
    state: Mutex<MemoryStoreState>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored rows across all deployments
    pub fn row_count(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.events.len()
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn insert(&self, event: &LogEvent) -> Result<bool, PlatformError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.seen.insert(event.event_id) {
            return Ok(false);
        }
        state.events.push(event.clone());
        Ok(true)
    }

    async fn query(&self, deployment_id: Uuid) -> Result<Vec<StoredLog>, PlatformError> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut events: Vec<&LogEvent> = state
            .events
            .iter()
            .filter(|e| e.deployment_id == deployment_id)
            .collect();
        events.sort_by_key(|e| e.sequence);
        Ok(events.into_iter().map(StoredLog::from).collect())
    }
}
