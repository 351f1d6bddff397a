use std::collections::HashMap;
use std::fs;
use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::registry::ServiceInfo;

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("Invalid config file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid environment variable: {0}")]
    Env(#[from] envy::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: String,
    pub registry: RegistryConfig,
    pub service: ServiceConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            registry: RegistryConfig::default(),
            service: ServiceConfig::default(),
        }
    }
}

/// 注册中心后端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// consul / etcd / memory
    pub backend: String,
    /// 逗号分隔的地址列表
    pub address: String,
    pub consul_token: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            address: String::new(),
            consul_token: None,
            request_timeout_secs: 5,
        }
    }
}

/// 本进程对外注册的服务
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// 未配置时生成 `{name}-{uuid}`
    pub id: Option<String>,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub tags: Vec<String>,
    pub meta: HashMap<String, String>,
    pub heartbeat_interval_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            id: None,
            name: "chain-grpc".to_string(),
            address: "127.0.0.1".to_string(),
            port: 9090,
            tags: Vec::new(),
            meta: HashMap::new(),
            heartbeat_interval_secs: 15,
        }
    }
}

impl ServiceConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    fn resolve_id(&mut self) {
        if self.id.as_deref().is_none_or(str::is_empty) {
            self.id = Some(format!("{}-{}", self.name, Uuid::new_v4()));
        }
    }

    /// 未配置 ID 时先生成并写回，之后每次调用都得到同一个 ID
    pub fn to_service_info(&mut self) -> ServiceInfo {
        self.resolve_id();
        let id = self.id.clone().unwrap_or_default();
        let mut info = ServiceInfo::new(id, &self.name, &self.address, self.port)
            .with_tags(self.tags.iter().cloned());
        info.meta = self.meta.clone();
        info
    }
}

#[derive(Debug, Default, Deserialize)]
struct GlobalEnv {
    log_level: Option<String>,
    config_path: Option<String>,
}

// REGISTRY_*
#[derive(Debug, Default, Deserialize)]
struct RegistryEnv {
    backend: Option<String>,
    address: Option<String>,
    consul_token: Option<String>,
    request_timeout_secs: Option<u64>,
}

// SERVICE_*
#[derive(Debug, Default, Deserialize)]
struct ServiceEnv {
    id: Option<String>,
    name: Option<String>,
    address: Option<String>,
    port: Option<u16>,
    heartbeat_interval_secs: Option<u64>,
}

impl Config {
    /// 依次加载 `.env`、配置文件和环境变量，后者覆盖前者
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let global: GlobalEnv = envy::from_env()?;
        let path = global
            .config_path
            .clone()
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

        let mut config = match fs::read_to_string(&path) {
            Ok(raw) => Self::from_toml_str(&raw)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Self::default(),
            Err(source) => return Err(ConfigError::Io { path, source }),
        };

        config.apply_env(
            global,
            envy::prefixed("REGISTRY_").from_env()?,
            envy::prefixed("SERVICE_").from_env()?,
        );
        config.service.resolve_id();
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    fn apply_env(&mut self, global: GlobalEnv, registry: RegistryEnv, service: ServiceEnv) {
        if let Some(level) = global.log_level {
            self.log_level = level;
        }

        if let Some(backend) = registry.backend {
            self.registry.backend = backend;
        }
        if let Some(address) = registry.address {
            self.registry.address = address;
        }
        if registry.consul_token.is_some() {
            self.registry.consul_token = registry.consul_token;
        }
        if let Some(secs) = registry.request_timeout_secs {
            self.registry.request_timeout_secs = secs;
        }

        if service.id.is_some() {
            self.service.id = service.id;
        }
        if let Some(name) = service.name {
            self.service.name = name;
        }
        if let Some(address) = service.address {
            self.service.address = address;
        }
        if let Some(port) = service.port {
            self.service.port = port;
        }
        if let Some(secs) = service.heartbeat_interval_secs {
            self.service.heartbeat_interval_secs = secs;
        }
    }
}
