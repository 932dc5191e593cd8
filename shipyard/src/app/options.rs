//! Application configuration options

use std::path::PathBuf;
use std::time::Duration;

use crate::deploy::config::LaunchTemplate;
use crate::deploy::fsm::FsmSettings;
use crate::deploy::orchestrator::OrchestratorOptions;
use crate::storage::settings::{BlobSettings, Settings};
use crate::transport::mqtt::MqttAddress;
use crate::workers::{ingester, watcher};

/// Control plane options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// SQLite database for projects, deployments and durable logs
    pub database_path: PathBuf,

    /// Admission API listener
    pub api: ListenerOptions,

    /// Reverse proxy listener
    pub proxy: ListenerOptions,

    /// Serve published artifacts
    pub enable_proxy: bool,

    /// Run the status watcher
    pub enable_watcher: bool,

    /// Run the durable log ingester
    pub enable_ingester: bool,

    /// Live log broker; live logs are off when unconfigured
    pub mqtt: MqttAddress,

    /// Artifact storage
    pub blob: BlobSettings,

    /// Key prefix for published artifacts
    pub directory_prefix: String,

    /// Executor binary, defaults to the running executable
    pub executor: Option<PathBuf>,

    /// Per-launch configuration template
    pub launch: LaunchTemplate,

    pub orchestrator: OrchestratorOptions,

    pub watcher: watcher::Options,

    pub ingester: ingester::Options,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl AppOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            database_path: settings.database_path.clone(),
            api: ListenerOptions {
                host: settings.api.host.clone(),
                port: settings.api.port,
            },
            proxy: ListenerOptions {
                host: settings.proxy.host.clone(),
                port: settings.proxy.port,
            },
            enable_proxy: settings.proxy.enabled,
            enable_watcher: true,
            enable_ingester: true,
            mqtt: MqttAddress {
                host: settings.mqtt.host.clone(),
                port: settings.mqtt.port,
                use_tls: settings.mqtt.tls,
                ca_cert_path: settings.mqtt.ca_cert_path.clone(),
                username: settings.mqtt.username.clone(),
                password: settings.mqtt.password.clone(),
            },
            blob: settings.blob.clone(),
            directory_prefix: settings.deployment.directory_prefix.clone(),
            executor: settings.launch.executable.clone(),
            launch: LaunchTemplate::from_settings(settings),
            orchestrator: OrchestratorOptions {
                fsm: FsmSettings {
                    deployment_timeout: Duration::from_secs(settings.deployment.timeout_secs),
                },
                public_base_url: settings.public_base_url.clone(),
                ..OrchestratorOptions::default()
            },
            watcher: watcher::Options {
                interval: Duration::from_secs(settings.watcher.interval_secs),
            },
            ingester: ingester::Options {
                group: settings.ingester.group.clone(),
                batch_size: settings.ingester.batch_size,
                poll_interval: Duration::from_millis(settings.ingester.poll_interval_ms),
                ..ingester::Options::default()
            },
        }
    }
}

/// Lifecycle options for the control plane
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// TCP listener options
#[derive(Debug, Clone)]
pub struct ListenerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
        }
    }
}
