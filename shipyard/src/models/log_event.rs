//! Build log events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where a log line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    /// Emitted by the executor itself
    System,
    Stdout,
    Stderr,
}

impl LogSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogSource::System => "system",
            LogSource::Stdout => "stdout",
            LogSource::Stderr => "stderr",
        }
    }
}

impl std::str::FromStr for LogSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(LogSource::System),
            "stdout" => Ok(LogSource::Stdout),
            "stderr" => Ok(LogSource::Stderr),
            _ => Err(format!("Invalid log source: {}", s)),
        }
    }
}

/// One unit of build output.
///
/// `event_id` is assigned at emission and survives redelivery, so stores use
/// it to drop duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    pub event_id: Uuid,
    pub deployment_id: Uuid,
    pub project_id: Uuid,
    /// Emission order within the deployment
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub source: LogSource,
    pub text: String,
}

/// Row returned by the queryable log store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredLog {
    pub event_id: Uuid,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl From<&LogEvent> for StoredLog {
    fn from(event: &LogEvent) -> Self {
        Self {
            event_id: event.event_id,
            text: event.text.clone(),
            timestamp: event.timestamp,
        }
    }
}
