//! Registry backend selection.
//!
//! External backends that cannot be reached degrade to an in-process
//! [`MemoryRegistry`]; construction errors never reach the caller.

use std::sync::Arc;
use std::time::Duration;

use super::{
    ConsulRegistry, ConsulRegistryConfig, EtcdRegistry, EtcdRegistryConfig, MemoryRegistry,
    MemoryRegistryConfig, Registry, RegistryKind,
};
use crate::config::RegistryConfig;

/// 各后端的构造参数
#[derive(Debug, Clone, Default)]
pub struct RegistryOptions {
    pub memory: MemoryRegistryConfig,
    pub etcd: EtcdRegistryConfig,
    pub consul: ConsulRegistryConfig,
}

impl RegistryOptions {
    pub fn from_config(config: &RegistryConfig) -> Self {
        let request_timeout = Duration::from_secs(config.request_timeout_secs);
        Self {
            memory: MemoryRegistryConfig::default(),
            etcd: EtcdRegistryConfig {
                request_timeout,
                ..EtcdRegistryConfig::default()
            },
            consul: ConsulRegistryConfig {
                token: config.consul_token.clone(),
                request_timeout,
                ..ConsulRegistryConfig::default()
            },
        }
    }
}

/// 按后端类型和地址创建注册中心，使用默认参数
pub async fn new_registry(kind: RegistryKind, address: &str) -> Arc<dyn Registry> {
    new_registry_with(kind, address, RegistryOptions::default()).await
}

/// 按配置创建注册中心；无法识别的后端类型按内存后端处理
pub async fn from_config(config: &RegistryConfig) -> Arc<dyn Registry> {
    let kind = config.backend.parse::<RegistryKind>().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Falling back to memory registry");
        RegistryKind::Memory
    });
    new_registry_with(kind, &config.address, RegistryOptions::from_config(config)).await
}

pub async fn new_registry_with(
    kind: RegistryKind,
    address: &str,
    options: RegistryOptions,
) -> Arc<dyn Registry> {
    let registry: Arc<dyn Registry> = match kind {
        RegistryKind::Memory => Arc::new(MemoryRegistry::with_config(options.memory)),
        RegistryKind::Etcd => {
            match EtcdRegistry::connect(split_endpoints(address), options.etcd).await {
                Ok(registry) => Arc::new(registry),
                Err(e) => {
                    tracing::warn!(
                        address = %address,
                        error = %e,
                        "Failed to create etcd registry, falling back to memory registry"
                    );
                    Arc::new(MemoryRegistry::with_config(options.memory))
                }
            }
        }
        RegistryKind::Consul => match ConsulRegistry::connect(address, options.consul).await {
            Ok(registry) => Arc::new(registry),
            Err(e) => {
                tracing::warn!(
                    address = %address,
                    error = %e,
                    "Failed to create consul registry, falling back to memory registry"
                );
                Arc::new(MemoryRegistry::with_config(options.memory))
            }
        },
    };

    tracing::info!(requested = %kind, selected = %registry.kind(), "Service registry ready");
    registry
}

fn split_endpoints(address: &str) -> Vec<String> {
    address
        .split(',')
        .map(str::trim)
        .filter(|endpoint| !endpoint.is_empty())
        .map(str::to_string)
        .collect()
}
