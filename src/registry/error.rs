use thiserror::Error;

/// 注册中心错误类型
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Service not found: {service_id}")]
    ServiceNotFound { service_id: String },

    #[error("Service {service_id} is no longer present in the store")]
    LeaseExpired { service_id: String },

    #[error("Registry backend unavailable: {0}")]
    Unavailable(String),

    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Consul returned {status}: {body}")]
    Consul { status: u16, body: String },

    #[error("Operation timed out: {operation}")]
    Timeout { operation: &'static str },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Registry is closed")]
    Closed,
}

impl RegistryError {
    pub(crate) fn not_found(service_id: &str) -> Self {
        RegistryError::ServiceNotFound {
            service_id: service_id.to_string(),
        }
    }

    // 调用方需要重新注册的错误
    pub fn requires_reregistration(&self) -> bool {
        matches!(
            self,
            RegistryError::ServiceNotFound { .. } | RegistryError::LeaseExpired { .. }
        )
    }
}
