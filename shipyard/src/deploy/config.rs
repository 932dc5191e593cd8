//! Deployment configuration handed from the orchestrator to a build executor

use std::collections::BTreeMap;
use std::path::PathBuf;

use secrecy::SecretString;
use uuid::Uuid;

use crate::errors::PlatformError;
use crate::models::deployment::Deployment;
use crate::models::project::Project;
use crate::storage::settings::{BlobKind, BlobSettings, DeploymentSettings, Settings};
use crate::transport::mqtt::MqttAddress;
use crate::transport::TransportMode;

/// Environment variable names read by the build executor
pub mod vars {
    pub const GIT_REPOSITORY_URL: &str = "GIT_REPOSITORY_URL";
    pub const PROJECT_ID: &str = "PROJECT_ID";
    pub const DEPLOYMENT_ID: &str = "DEPLOYMENT_ID";
    pub const SOURCE_PATH: &str = "SOURCE_PATH";
    pub const BUILD_DIRECTORY: &str = "BUILD_DIRECTORY";
    pub const BUILD_COMMAND: &str = "BUILD_COMMAND";
    pub const DEPLOYMENT_DIRECTORY: &str = "DEPLOYMENT_DIRECTORY";
    pub const BLOB_KIND: &str = "BLOB_KIND";
    pub const BLOB_ROOT: &str = "BLOB_ROOT";
    pub const BLOB_ENDPOINT: &str = "BLOB_ENDPOINT";
    pub const BLOB_BUCKET: &str = "BLOB_BUCKET";
    pub const BLOB_TOKEN: &str = "BLOB_TOKEN";
    pub const LOG_TRANSPORT: &str = "LOG_TRANSPORT";
    pub const LOG_DATABASE_PATH: &str = "LOG_DATABASE_PATH";
    pub const MQTT_HOST: &str = "MQTT_HOST";
    pub const MQTT_PORT: &str = "MQTT_PORT";
    pub const MQTT_TLS: &str = "MQTT_TLS";
    pub const MQTT_CA_CERT_PATH: &str = "MQTT_CA_CERT_PATH";
    pub const MQTT_USERNAME: &str = "MQTT_USERNAME";
    pub const MQTT_PASSWORD: &str = "MQTT_PASSWORD";
}

/// Where the executor runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeTarget {
    pub cluster: String,
    pub task_definition: String,
    pub launch_type: String,
    pub container_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkPlacement {
    pub subnets: Vec<String>,
    pub security_groups: Vec<String>,
    pub assign_public_ip: bool,
}

/// Everything a launch needs. Built fresh per launch and never persisted.
#[derive(Debug, Clone)]
pub struct DeploymentConfiguration {
    pub target: ComputeTarget,
    pub network: NetworkPlacement,
    /// Plain environment for the executor
    pub environment: BTreeMap<String, String>,
    /// Credentials, injected into the environment at launch only
    pub secrets: BTreeMap<String, SecretString>,
}

impl DeploymentConfiguration {
    pub fn env(&self, name: &str) -> Option<&str> {
        self.environment.get(name).map(String::as_str)
    }
}

/// Static part of every launch, derived from settings
#[derive(Debug, Clone)]
pub struct LaunchTemplate {
    pub target: ComputeTarget,
    pub network: NetworkPlacement,
    pub workspace_dir: PathBuf,
    pub deployment: DeploymentSettings,
    pub blob: BlobSettings,
    pub mqtt: MqttAddress,
    pub log_database_path: PathBuf,
}

impl LaunchTemplate {
    pub fn from_settings(settings: &Settings) -> Self {
        let launch = &settings.launch;
        Self {
            target: ComputeTarget {
                cluster: launch.cluster.clone(),
                task_definition: launch.task_definition.clone(),
                launch_type: launch.launch_type.clone(),
                container_name: launch.container_name.clone(),
            },
            network: NetworkPlacement {
                subnets: launch.subnets.clone(),
                security_groups: launch.security_groups.clone(),
                assign_public_ip: launch.assign_public_ip,
            },
            workspace_dir: launch.workspace_dir.clone(),
            deployment: settings.deployment.clone(),
            blob: settings.blob.clone(),
            mqtt: MqttAddress {
                host: settings.mqtt.host.clone(),
                port: settings.mqtt.port,
                use_tls: settings.mqtt.tls,
                ca_cert_path: settings.mqtt.ca_cert_path.clone(),
                username: settings.mqtt.username.clone(),
                password: settings.mqtt.password.clone(),
            },
            log_database_path: settings.database_path.clone(),
        }
    }

    /// Build the configuration for one deployment of `project`
    pub fn configure(&self, project: &Project, deployment: &Deployment) -> DeploymentConfiguration {
        let mut environment = BTreeMap::new();
        let mut secrets = BTreeMap::new();
        let mut set = |name: &str, value: String| {
            environment.insert(name.to_string(), value);
        };

        set(vars::GIT_REPOSITORY_URL, project.repository_url.clone());
        set(vars::PROJECT_ID, project.id.to_string());
        set(vars::DEPLOYMENT_ID, deployment.id.to_string());
        set(
            vars::SOURCE_PATH,
            self.workspace_dir
                .join(deployment.id.to_string())
                .to_string_lossy()
                .into_owned(),
        );
        set(vars::BUILD_DIRECTORY, self.deployment.build_directory.clone());
        set(vars::BUILD_COMMAND, self.deployment.build_command.clone());
        set(vars::DEPLOYMENT_DIRECTORY, self.deployment.directory_prefix.clone());

        set(vars::BLOB_KIND, self.blob.kind.as_str().to_string());
        set(vars::BLOB_ROOT, self.blob.root.to_string_lossy().into_owned());
        set(vars::BLOB_BUCKET, self.blob.bucket.clone());
        if let Some(endpoint) = &self.blob.endpoint {
            set(vars::BLOB_ENDPOINT, endpoint.clone());
        }

        let mode = self.deployment.log_transport;
        set(vars::LOG_TRANSPORT, mode.as_str().to_string());
        if mode.uses_durable() {
            set(
                vars::LOG_DATABASE_PATH,
                self.log_database_path.to_string_lossy().into_owned(),
            );
        }
        if mode.uses_live() {
            set(vars::MQTT_HOST, self.mqtt.host.clone());
            set(vars::MQTT_PORT, self.mqtt.port.to_string());
            set(vars::MQTT_TLS, self.mqtt.use_tls.to_string());
            if let Some(path) = &self.mqtt.ca_cert_path {
                set(vars::MQTT_CA_CERT_PATH, path.clone());
            }
            if let Some(username) = &self.mqtt.username {
                set(vars::MQTT_USERNAME, username.clone());
            }
            if let Some(password) = &self.mqtt.password {
                secrets.insert(vars::MQTT_PASSWORD.to_string(), password.clone());
            }
        }

        if let Some(token) = &self.blob.token {
            secrets.insert(vars::BLOB_TOKEN.to_string(), token.clone());
        }

        DeploymentConfiguration {
            target: self.target.clone(),
            network: self.network.clone(),
            environment,
            secrets,
        }
    }
}

/// Build executor configuration, read from its environment
#[derive(Debug, Clone)]
pub struct BuildEnv {
    pub repository_url: String,
    pub project_id: Uuid,
    pub deployment_id: Uuid,
    pub source_path: PathBuf,
    pub build_directory: String,
    pub build_command: String,
    pub directory_prefix: String,
    pub blob: BlobSettings,
    pub log_transport: TransportMode,
    pub log_database_path: Option<PathBuf>,
    pub mqtt: MqttAddress,
}

impl BuildEnv {
    pub fn from_env() -> Result<Self, PlatformError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, PlatformError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.is_empty());
        let require = |name: &str| {
            get(name).ok_or_else(|| PlatformError::ConfigError(format!("{} is not set", name)))
        };
        let require_uuid = |name: &str| {
            let raw = require(name)?;
            Uuid::parse_str(&raw)
                .map_err(|e| PlatformError::ConfigError(format!("{} is not a UUID: {}", name, e)))
        };

        let repository_url = require(vars::GIT_REPOSITORY_URL)?;
        let project_id = require_uuid(vars::PROJECT_ID)?;
        let deployment_id = require_uuid(vars::DEPLOYMENT_ID)?;

        let defaults = DeploymentSettings::default();
        let source_path = get(vars::SOURCE_PATH).map(PathBuf::from).unwrap_or_else(|| {
            std::env::temp_dir()
                .join("shipyard")
                .join(deployment_id.to_string())
        });

        let blob_defaults = BlobSettings::default();
        let blob = BlobSettings {
            kind: match get(vars::BLOB_KIND) {
                Some(kind) => kind.parse().map_err(PlatformError::ConfigError)?,
                None => BlobKind::default(),
            },
            root: get(vars::BLOB_ROOT).map(PathBuf::from).unwrap_or(blob_defaults.root),
            endpoint: get(vars::BLOB_ENDPOINT),
            bucket: get(vars::BLOB_BUCKET).unwrap_or(blob_defaults.bucket),
            token: get(vars::BLOB_TOKEN).map(SecretString::from),
        };
        if blob.kind == BlobKind::Http && blob.endpoint.is_none() {
            return Err(PlatformError::ConfigError(format!(
                "{} is required for the http blob store",
                vars::BLOB_ENDPOINT
            )));
        }

        let log_transport = match get(vars::LOG_TRANSPORT) {
            Some(mode) => mode.parse().map_err(PlatformError::ConfigError)?,
            None => TransportMode::default(),
        };
        let log_database_path = get(vars::LOG_DATABASE_PATH).map(PathBuf::from);
        if log_transport.uses_durable() && log_database_path.is_none() {
            return Err(PlatformError::ConfigError(format!(
                "{} is required for durable logs",
                vars::LOG_DATABASE_PATH
            )));
        }

        let mqtt_defaults = MqttAddress::default();
        let mqtt = MqttAddress {
            host: get(vars::MQTT_HOST).unwrap_or_default(),
            port: match get(vars::MQTT_PORT) {
                Some(port) => port.parse().map_err(|e| {
                    PlatformError::ConfigError(format!("{} is not a port: {}", vars::MQTT_PORT, e))
                })?,
                None => mqtt_defaults.port,
            },
            use_tls: get(vars::MQTT_TLS)
                .map(|v| v != "false" && v != "0")
                .unwrap_or(mqtt_defaults.use_tls),
            ca_cert_path: get(vars::MQTT_CA_CERT_PATH),
            username: get(vars::MQTT_USERNAME),
            password: get(vars::MQTT_PASSWORD).map(SecretString::from),
        };
        if log_transport.uses_live() && !mqtt.is_configured() {
            return Err(PlatformError::ConfigError(format!(
                "{} is required for live logs",
                vars::MQTT_HOST
            )));
        }

        Ok(Self {
            repository_url,
            project_id,
            deployment_id,
            source_path,
            build_directory: get(vars::BUILD_DIRECTORY).unwrap_or(defaults.build_directory),
            build_command: get(vars::BUILD_COMMAND).unwrap_or(defaults.build_command),
            directory_prefix: get(vars::DEPLOYMENT_DIRECTORY).unwrap_or(defaults.directory_prefix),
            blob,
            log_transport,
            log_database_path,
            mqtt,
        })
    }

    /// Directory whose files get published
    pub fn output_dir(&self) -> PathBuf {
        self.source_path.join(&self.build_directory)
    }
}
