//! Project models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A registered source repository served under a unique subdomain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    /// Unique project ID
    pub id: Uuid,

    /// Display name
    pub name: String,

    /// Git URL the executor clones
    pub repository_url: String,

    /// Public subdomain, immutable once assigned
    pub subdomain: String,

    /// Created timestamp
    pub created_at: DateTime<Utc>,
}

/// Input for project creation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProject {
    pub name: String,

    pub repository_url: String,

    /// Generated when absent
    #[serde(default)]
    pub subdomain: Option<String>,
}
