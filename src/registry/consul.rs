use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};

use super::{Registry, RegistryError, RegistryKind, ServiceInfo};

pub const DEFAULT_CONSUL_ADDRESS: &str = "127.0.0.1:8500";

/// Consul 注册中心配置
#[derive(Debug, Clone)]
pub struct ConsulRegistryConfig {
    /// ACL token，通过 `X-Consul-Token` 发送
    pub token: Option<String>,
    pub request_timeout: Duration,
    /// 健康检查探测周期
    pub check_interval: Duration,
    /// 单次探测超时
    pub check_timeout: Duration,
    /// 持续失败多久后由 Consul 自动注销
    pub deregister_critical_after: Duration,
}

impl Default for ConsulRegistryConfig {
    fn default() -> Self {
        Self {
            token: None,
            request_timeout: Duration::from_secs(5),
            check_interval: Duration::from_secs(10),
            check_timeout: Duration::from_secs(5),
            deregister_critical_after: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct AgentServiceRegistration<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    name: &'a str,
    address: &'a str,
    port: u16,
    tags: &'a [String],
    meta: &'a HashMap<String, String>,
    check: AgentServiceCheck,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct AgentServiceCheck {
    #[serde(rename = "HTTP")]
    http: String,
    interval: String,
    timeout: String,
    deregister_critical_service_after: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthServiceEntry {
    #[serde(default)]
    node: Option<HealthNode>,
    service: HealthService,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthNode {
    #[serde(default)]
    address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthService {
    #[serde(rename = "ID")]
    id: String,
    service: String,
    #[serde(default)]
    address: String,
    port: u16,
    #[serde(default)]
    tags: Option<Vec<String>>,
    #[serde(default)]
    meta: Option<HashMap<String, String>>,
}

impl From<HealthServiceEntry> for ServiceInfo {
    fn from(entry: HealthServiceEntry) -> Self {
        let service = entry.service;
        // 服务未单独声明地址时 Consul 使用节点地址
        let address = if service.address.is_empty() {
            entry.node.map(|node| node.address).unwrap_or_default()
        } else {
            service.address
        };

        ServiceInfo {
            id: service.id,
            name: service.service,
            address,
            port: service.port,
            tags: service.tags.unwrap_or_default(),
            meta: service.meta.unwrap_or_default(),
            // 只查询了 passing 的实例
            healthy: true,
            last_seen: None,
        }
    }
}

/// 基于 Consul agent 的注册中心
///
/// 健康检查完全由 Consul 执行，本地不保存状态也不运行后台任务。
#[derive(Debug, Clone)]
pub struct ConsulRegistry {
    http: reqwest::Client,
    base_url: Url,
    config: ConsulRegistryConfig,
}

impl ConsulRegistry {
    /// 创建客户端并查询当前 leader，Consul 不可达时立即失败
    pub async fn connect(address: &str, config: ConsulRegistryConfig) -> Result<Self, RegistryError> {
        let base_url = consul_base_url(address)?;
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        let registry = Self {
            http,
            base_url,
            config,
        };

        let leader = registry.leader().await.map_err(|e| {
            RegistryError::Unavailable(format!("consul at {} is unreachable: {e}", registry.base_url))
        })?;
        tracing::info!(address = %registry.base_url, leader = %leader, "Connected to Consul");

        Ok(registry)
    }

    /// 当前 Raft leader 地址
    pub async fn leader(&self) -> Result<String, RegistryError> {
        let response = self
            .send("status_leader", self.request(Method::GET, &["status", "leader"]))
            .await?;
        response
            .json::<String>()
            .await
            .map_err(|e| http_error("status_leader", e))
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        // consul_base_url 已保证可以作为 base
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().push("v1").extend(segments);
        }
        url
    }

    fn request(&self, method: Method, segments: &[&str]) -> RequestBuilder {
        self.request_url(method, self.endpoint(segments))
    }

    fn request_url(&self, method: Method, url: Url) -> RequestBuilder {
        let request = self.http.request(method, url);
        match &self.config.token {
            Some(token) => request.header("X-Consul-Token", token),
            None => request,
        }
    }

    async fn send(
        &self,
        operation: &'static str,
        request: RequestBuilder,
    ) -> Result<Response, RegistryError> {
        let response = request
            .send()
            .await
            .map_err(|e| http_error(operation, e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(RegistryError::Consul {
            status: status.as_u16(),
            body,
        })
    }

    fn registration<'a>(&self, service: &'a ServiceInfo) -> AgentServiceRegistration<'a> {
        AgentServiceRegistration {
            id: &service.id,
            name: &service.name,
            address: &service.address,
            port: service.port,
            tags: &service.tags,
            meta: &service.meta,
            check: AgentServiceCheck {
                http: format!("http://{}:{}/health", service.address, service.port),
                interval: go_duration(self.config.check_interval),
                timeout: go_duration(self.config.check_timeout),
                deregister_critical_service_after: go_duration(self.config.deregister_critical_after),
            },
        }
    }
}

#[async_trait]
impl Registry for ConsulRegistry {
    fn kind(&self) -> RegistryKind {
        RegistryKind::Consul
    }

    async fn register(&self, service: &ServiceInfo) -> Result<(), RegistryError> {
        let request = self
            .request(Method::PUT, &["agent", "service", "register"])
            .json(&self.registration(service));
        self.send("service_register", request).await?;

        tracing::info!(
            service_id = %service.id,
            service_name = %service.name,
            endpoint = %service.endpoint(),
            "Service registered in Consul"
        );
        Ok(())
    }

    async fn deregister(&self, service_id: &str) -> Result<(), RegistryError> {
        let request = self.request(Method::PUT, &["agent", "service", "deregister", service_id]);
        match self.send("service_deregister", request).await {
            Ok(_) => {
                tracing::info!(service_id = %service_id, "Service deregistered from Consul");
                Ok(())
            }
            Err(RegistryError::Consul { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                Err(RegistryError::not_found(service_id))
            }
            Err(e) => Err(e),
        }
    }

    async fn discover(&self, service_name: &str) -> Result<Vec<ServiceInfo>, RegistryError> {
        let mut url = self.endpoint(&["health", "service", service_name]);
        url.query_pairs_mut().append_pair("passing", "true");

        let response = self
            .send("health_service", self.request_url(Method::GET, url))
            .await?;
        let entries = response
            .json::<Vec<HealthServiceEntry>>()
            .await
            .map_err(|e| http_error("health_service", e))?;

        tracing::debug!(
            service_name = %service_name,
            count = entries.len(),
            "Discovered passing services from Consul"
        );
        Ok(entries.into_iter().map(ServiceInfo::from).collect())
    }

    async fn health_check(&self, _service_id: &str) -> Result<(), RegistryError> {
        // Consul agent 自行探测
        Ok(())
    }

    async fn close(&self) -> Result<(), RegistryError> {
        Ok(())
    }
}

fn http_error(operation: &'static str, error: reqwest::Error) -> RegistryError {
    if error.is_timeout() {
        RegistryError::Timeout { operation }
    } else {
        RegistryError::Http(error)
    }
}

fn consul_base_url(address: &str) -> Result<Url, RegistryError> {
    let address = address
        .split(',')
        .map(str::trim)
        .find(|candidate| !candidate.is_empty())
        .unwrap_or(DEFAULT_CONSUL_ADDRESS);

    let with_scheme = if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{address}")
    };

    let url = Url::parse(&with_scheme).map_err(|e| {
        RegistryError::Unavailable(format!("invalid consul address {address}: {e}"))
    })?;
    if url.cannot_be_a_base() {
        return Err(RegistryError::Unavailable(format!(
            "invalid consul address {address}"
        )));
    }
    Ok(url)
}

// Consul 使用 Go 的时长格式
fn go_duration(duration: Duration) -> String {
    if duration.subsec_nanos() == 0 {
        format!("{}s", duration.as_secs())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_consul_addresses() {
        assert_eq!(consul_base_url("").unwrap().as_str(), "http://127.0.0.1:8500/");
        assert_eq!(
            consul_base_url("consul.local:8500, other:8500").unwrap().as_str(),
            "http://consul.local:8500/"
        );
        assert_eq!(
            consul_base_url("https://consul.local").unwrap().as_str(),
            "https://consul.local/"
        );
    }

    #[test]
    fn formats_check_durations_for_consul() {
        assert_eq!(go_duration(Duration::from_secs(10)), "10s");
        assert_eq!(go_duration(Duration::from_millis(1500)), "1500ms");
    }

    #[test]
    fn falls_back_to_node_address() {
        let raw = r#"[{
            "Node": {"Node": "node-1", "Address": "10.0.0.9"},
            "Service": {"ID": "svc-1", "Service": "pricing", "Address": "", "Port": 9090, "Tags": null, "Meta": null},
            "Checks": []
        }]"#;
        let entries: Vec<HealthServiceEntry> = serde_json::from_str(raw).unwrap();
        let info = ServiceInfo::from(entries.into_iter().next().unwrap());

        assert_eq!(info.address, "10.0.0.9");
        assert!(info.tags.is_empty());
        assert!(info.healthy);
    }
}
