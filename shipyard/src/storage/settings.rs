//! Settings file management

use std::path::{Path, PathBuf};

use secrecy::SecretString;
use serde::Deserialize;

use crate::errors::PlatformError;
use crate::logs::LogLevel;
use crate::transport::TransportMode;

/// Control plane settings.
///
/// Every field has a default, so `{}` is a valid settings file.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON log lines on stdout
    #[serde(default)]
    pub log_json: bool,

    /// Directory for rolling log files
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// SQLite database shared with build executors
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Base of the public URL, e.g. `http://localhost:9000` serves
    /// `http://{subdomain}.localhost:9000`
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,

    /// Admission API and log reader
    #[serde(default)]
    pub api: ListenerSettings,

    /// Reverse proxy resolver
    #[serde(default = "default_proxy_settings")]
    pub proxy: ProxySettings,

    /// MQTT broker for live logs, disabled when the host is empty
    #[serde(default)]
    pub mqtt: MqttSettings,

    /// Artifact storage
    #[serde(default)]
    pub blob: BlobSettings,

    /// Build executor launch template
    #[serde(default)]
    pub launch: LaunchSettings,

    /// Deployment policy
    #[serde(default)]
    pub deployment: DeploymentSettings,

    /// Status watcher
    #[serde(default)]
    pub watcher: WatcherSettings,

    /// Durable log ingester
    #[serde(default)]
    pub ingester: IngesterSettings,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("shipyard.db")
}

fn default_public_base_url() -> String {
    "http://localhost:9000".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            log_dir: None,
            database_path: default_database_path(),
            public_base_url: default_public_base_url(),
            api: ListenerSettings::default(),
            proxy: default_proxy_settings(),
            mqtt: MqttSettings::default(),
            blob: BlobSettings::default(),
            launch: LaunchSettings::default(),
            deployment: DeploymentSettings::default(),
            watcher: WatcherSettings::default(),
            ingester: IngesterSettings::default(),
        }
    }
}

impl Settings {
    /// Read settings from a JSON file, or defaults when no path is given
    pub async fn load(path: Option<&Path>) -> Result<Self, PlatformError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            PlatformError::ConfigError(format!("Unable to read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&raw)
            .map_err(|e| PlatformError::ConfigError(format!("Invalid settings file: {}", e)))
    }
}

/// A TCP listener
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerSettings {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_api_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    8000
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_api_port(),
        }
    }
}

/// Reverse proxy listener
#[derive(Debug, Clone, Deserialize)]
pub struct ProxySettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_proxy_port")]
    pub port: u16,
}

fn default_true() -> bool {
    true
}

fn default_proxy_port() -> u16 {
    9000
}

fn default_proxy_settings() -> ProxySettings {
    ProxySettings {
        enabled: true,
        host: default_host(),
        port: default_proxy_port(),
    }
}

/// MQTT broker settings
#[derive(Debug, Clone, Deserialize)]
pub struct MqttSettings {
    /// Broker host
    #[serde(default)]
    pub host: String,

    /// Broker port
    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    /// Use TLS
    #[serde(default = "default_true")]
    pub tls: bool,

    /// Optional path to a PEM-encoded CA certificate for broker TLS verification.
    /// When absent, the system certificate store is used.
    #[serde(default)]
    pub ca_cert_path: Option<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<SecretString>,
}

fn default_mqtt_port() -> u16 {
    8883
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_mqtt_port(),
            tls: true,
            ca_cert_path: None,
            username: None,
            password: None,
        }
    }
}

/// Blob storage backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobKind {
    #[default]
    Fs,
    Http,
}

impl BlobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlobKind::Fs => "fs",
            BlobKind::Http => "http",
        }
    }
}

impl std::str::FromStr for BlobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fs" => Ok(BlobKind::Fs),
            "http" => Ok(BlobKind::Http),
            _ => Err(format!("Invalid blob kind: {}", s)),
        }
    }
}

/// Blob storage settings
#[derive(Debug, Clone, Deserialize)]
pub struct BlobSettings {
    #[serde(default)]
    pub kind: BlobKind,

    /// Root directory for the `fs` backend
    #[serde(default = "default_blob_root")]
    pub root: PathBuf,

    /// Endpoint for the `http` backend
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default = "default_bucket")]
    pub bucket: String,

    /// Bearer token for the `http` backend
    #[serde(default)]
    pub token: Option<SecretString>,
}

fn default_blob_root() -> PathBuf {
    PathBuf::from("artifacts")
}

fn default_bucket() -> String {
    "shipyard-outputs".to_string()
}

impl Default for BlobSettings {
    fn default() -> Self {
        Self {
            kind: BlobKind::Fs,
            root: default_blob_root(),
            endpoint: None,
            bucket: default_bucket(),
            token: None,
        }
    }
}

/// Launch template for build executors
#[derive(Debug, Clone, Deserialize)]
pub struct LaunchSettings {
    /// Executor binary; defaults to the running executable
    #[serde(default)]
    pub executable: Option<PathBuf>,

    /// Working directory under which each executor gets its own checkout
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: PathBuf,

    #[serde(default = "default_cluster")]
    pub cluster: String,

    #[serde(default = "default_task_definition")]
    pub task_definition: String,

    #[serde(default = "default_launch_type")]
    pub launch_type: String,

    #[serde(default = "default_container_name")]
    pub container_name: String,

    #[serde(default)]
    pub subnets: Vec<String>,

    #[serde(default)]
    pub security_groups: Vec<String>,

    #[serde(default = "default_true")]
    pub assign_public_ip: bool,
}

fn default_workspace_dir() -> PathBuf {
    PathBuf::from("workspaces")
}

fn default_cluster() -> String {
    "local".to_string()
}

fn default_task_definition() -> String {
    "shipyard-builder".to_string()
}

fn default_launch_type() -> String {
    "PROCESS".to_string()
}

fn default_container_name() -> String {
    "builder".to_string()
}

impl Default for LaunchSettings {
    fn default() -> Self {
        Self {
            executable: None,
            workspace_dir: default_workspace_dir(),
            cluster: default_cluster(),
            task_definition: default_task_definition(),
            launch_type: default_launch_type(),
            container_name: default_container_name(),
            subnets: Vec::new(),
            security_groups: Vec::new(),
            assign_public_ip: true,
        }
    }
}

/// Deployment policy
#[derive(Debug, Clone, Deserialize)]
pub struct DeploymentSettings {
    /// Seconds a deployment may stay non-terminal
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Key prefix for published artifacts
    #[serde(default = "default_directory_prefix")]
    pub directory_prefix: String,

    /// Build output directory, relative to the checkout
    #[serde(default = "default_build_directory")]
    pub build_directory: String,

    /// Install and build command run in the checkout
    #[serde(default = "default_build_command")]
    pub build_command: String,

    /// Log transport used by executors
    #[serde(default)]
    pub log_transport: TransportMode,
}

fn default_timeout() -> u64 {
    30 * 60
}

fn default_directory_prefix() -> String {
    "__outputs".to_string()
}

fn default_build_directory() -> String {
    "dist".to_string()
}

fn default_build_command() -> String {
    "npm install && npm run build".to_string()
}

impl Default for DeploymentSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout(),
            directory_prefix: default_directory_prefix(),
            build_directory: default_build_directory(),
            build_command: default_build_command(),
            log_transport: TransportMode::Durable,
        }
    }
}

/// Status watcher settings
#[derive(Debug, Clone, Deserialize)]
pub struct WatcherSettings {
    #[serde(default = "default_watcher_interval")]
    pub interval_secs: u64,
}

fn default_watcher_interval() -> u64 {
    5
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_watcher_interval(),
        }
    }
}

/// Durable log ingester settings
#[derive(Debug, Clone, Deserialize)]
pub struct IngesterSettings {
    #[serde(default = "default_consumer_group")]
    pub group: String,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_consumer_group() -> String {
    "api-server-logs-consumer".to_string()
}

fn default_batch_size() -> usize {
    100
}

fn default_poll_interval_ms() -> u64 {
    500
}

impl Default for IngesterSettings {
    fn default() -> Self {
        Self {
            group: default_consumer_group(),
            batch_size: default_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}
