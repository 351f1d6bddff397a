//! Service registry module
//!
//! This module contains the registry contract and its backends:
//! - `types`: `ServiceInfo` and backend selection types
//! - `error`: the registry error taxonomy
//! - `memory`: in-process registry with a liveness sweep
//! - `etcd`: lease-backed registry with a keep-alive task
//! - `consul`: agent-checked registry over the Consul HTTP API
//! - `factory`: backend selection with fallback to memory

pub mod consul;
pub mod error;
pub mod etcd;
pub mod factory;
pub mod memory;
pub mod types;

use async_trait::async_trait;

pub use consul::{ConsulRegistry, ConsulRegistryConfig};
pub use error::RegistryError;
pub use etcd::{EtcdRegistry, EtcdRegistryConfig};
pub use factory::{RegistryOptions, from_config, new_registry, new_registry_with};
pub use memory::{MemoryRegistry, MemoryRegistryConfig, SweepOutcome};
pub use types::{RegistryKind, ServiceInfo, UnknownRegistryKind};

/// 所有注册中心后端实现的统一接口
///
/// 丢弃返回的 future 即取消该操作；网络后端额外受请求超时约束，
/// 超时返回 [`RegistryError::Timeout`]，不会被当作空结果。
#[async_trait]
pub trait Registry: Send + Sync + std::fmt::Debug {
    /// 当前使用的后端
    fn kind(&self) -> RegistryKind;

    /// 注册服务实例，对同一 ID 重复调用为覆盖更新
    async fn register(&self, service: &ServiceInfo) -> Result<(), RegistryError>;

    /// 注销服务实例
    async fn deregister(&self, service_id: &str) -> Result<(), RegistryError>;

    /// 返回指定服务名下所有健康实例的副本
    async fn discover(&self, service_name: &str) -> Result<Vec<ServiceInfo>, RegistryError>;

    /// 显式心跳，具体效果由后端决定
    async fn health_check(&self, service_id: &str) -> Result<(), RegistryError>;

    /// 停止后台任务并释放连接
    async fn close(&self) -> Result<(), RegistryError>;
}
