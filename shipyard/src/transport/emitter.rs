//! Log emitter facade used by the build executor

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::PlatformError;
use crate::models::log_event::{LogEvent, LogSource};

/// Longest one append may take before its event is dropped
pub const DEFAULT_APPEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Budget per append while a sink is stalled, until it answers in time again
const STALLED_APPEND_TIMEOUT: Duration = Duration::from_millis(10);

/// Capability to append one log event to a transport
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Append an event. Failures are transport errors and never abort a build.
    async fn append(&self, event: &LogEvent) -> Result<(), PlatformError>;

    /// Release connections once no more events will be appended
    async fn close(&self) -> Result<(), PlatformError> {
        Ok(())
    }
}

/// Writes every event to all of its sinks at once, so a slow sink does not
/// hold back the others
pub struct FanoutSink {
    sinks: Vec<Arc<dyn LogSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn LogSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl LogSink for FanoutSink {
    async fn append(&self, event: &LogEvent) -> Result<(), PlatformError> {
        let results = join_all(self.sinks.iter().map(|sink| sink.append(event))).await;
        results.into_iter().find(Result::is_err).unwrap_or(Ok(()))
    }

    async fn close(&self) -> Result<(), PlatformError> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.close().await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Keeps every event in memory
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<LogEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LogEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.text).collect()
    }
}

#[async_trait]
impl LogSink for CollectingSink {
    async fn append(&self, event: &LogEvent) -> Result<(), PlatformError> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        Ok(())
    }
}

enum PumpMessage {
    Event(LogEvent),
    Flush(oneshot::Sender<()>),
}

/// Emits log events for one deployment.
///
/// `emit` never blocks: events are queued to a single pump task that appends
/// them to the sink in sequence order, so concurrent callers cannot reorder
/// each other's output.
#[derive(Clone)]
pub struct LogEmitter {
    tx: mpsc::UnboundedSender<PumpMessage>,
    sink: Arc<dyn LogSink>,
    deployment_id: Uuid,
    project_id: Uuid,
    sequence: Arc<Mutex<u64>>,
}

impl LogEmitter {
    /// Create an emitter and spawn its pump on the current runtime
    pub fn new(sink: Arc<dyn LogSink>, deployment_id: Uuid, project_id: Uuid) -> Self {
        Self::with_append_timeout(sink, deployment_id, project_id, DEFAULT_APPEND_TIMEOUT)
    }

    /// Like `new`, dropping any event the sink does not take within `append_timeout`
    pub fn with_append_timeout(
        sink: Arc<dyn LogSink>,
        deployment_id: Uuid,
        project_id: Uuid,
        append_timeout: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(sink.clone(), rx, append_timeout));

        Self {
            tx,
            sink,
            deployment_id,
            project_id,
            sequence: Arc::new(Mutex::new(0)),
        }
    }

    pub fn deployment_id(&self) -> Uuid {
        self.deployment_id
    }

    pub fn project_id(&self) -> Uuid {
        self.project_id
    }

    /// Queue one line of output
    pub fn emit(&self, source: LogSource, text: impl Into<String>) {
        // Numbering and enqueueing under one lock keeps the queue in sequence order
        let mut sequence = self.sequence.lock().unwrap_or_else(|e| e.into_inner());
        let event = LogEvent {
            event_id: Uuid::new_v4(),
            deployment_id: self.deployment_id,
            project_id: self.project_id,
            sequence: *sequence,
            timestamp: Utc::now(),
            source,
            text: text.into(),
        };
        *sequence += 1;

        if self.tx.send(PumpMessage::Event(event)).is_err() {
            warn!("Log pump stopped, dropping event for deployment {}", self.deployment_id);
        }
    }

    /// Queue a line authored by the executor itself
    pub fn info(&self, text: impl Into<String>) {
        self.emit(LogSource::System, text);
    }

    /// Wait until every event queued so far was delivered or dropped.
    ///
    /// Bounded by the append timeout per queued event, however the sink behaves.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(PumpMessage::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Flush and close the underlying sink
    pub async fn close(&self) -> Result<(), PlatformError> {
        self.flush().await;
        self.sink.close().await
    }
}

async fn pump(
    sink: Arc<dyn LogSink>,
    mut rx: mpsc::UnboundedReceiver<PumpMessage>,
    append_timeout: Duration,
) {
    let mut stalled = false;

    while let Some(message) = rx.recv().await {
        match message {
            PumpMessage::Event(event) => {
                let budget = if stalled { STALLED_APPEND_TIMEOUT } else { append_timeout };
                match tokio::time::timeout(budget, sink.append(&event)).await {
                    Ok(result) => {
                        if stalled {
                            info!(deployment_id = %event.deployment_id, "Log sink recovered");
                            stalled = false;
                        }
                        if let Err(e) = result {
                            warn!(
                                deployment_id = %event.deployment_id,
                                sequence = event.sequence,
                                "Failed to deliver log event: {}", e
                            );
                        }
                    }
                    Err(_) if stalled => {}
                    Err(_) => {
                        warn!(
                            deployment_id = %event.deployment_id,
                            sequence = event.sequence,
                            "Log sink stalled for {:?}, dropping events until it recovers", budget
                        );
                        stalled = true;
                    }
                }
            }
            PumpMessage::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
    debug!("Log pump finished");
}
