use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use chain_registry::registry::{
    ConsulRegistry, ConsulRegistryConfig, Registry, RegistryError, RegistryKind, ServiceInfo,
};

async fn consul_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/status/leader"))
        .respond_with(ResponseTemplate::new(200).set_body_json("10.0.0.1:8300"))
        .mount(&server)
        .await;
    server
}

async fn connect(server: &MockServer) -> ConsulRegistry {
    ConsulRegistry::connect(&server.uri(), ConsulRegistryConfig::default())
        .await
        .expect("Failed to connect to mock consul")
}

#[tokio::test]
async fn test_connect_queries_leader() {
    let server = consul_server().await;
    let registry = connect(&server).await;

    assert_eq!(registry.kind(), RegistryKind::Consul);
    assert_eq!(registry.leader().await.unwrap(), "10.0.0.1:8300");
}

#[tokio::test]
async fn test_connect_fails_when_leader_query_fails() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/status/leader"))
        .respond_with(ResponseTemplate::new(500).set_body_string("No cluster leader"))
        .mount(&server)
        .await;

    let result = ConsulRegistry::connect(&server.uri(), ConsulRegistryConfig::default()).await;
    assert!(matches!(result, Err(RegistryError::Unavailable(_))));
}

#[tokio::test]
async fn test_register_sends_service_with_http_check() {
    let server = consul_server().await;
    Mock::given(method("PUT"))
        .and(path("/v1/agent/service/register"))
        .and(body_partial_json(json!({
            "ID": "svc-1",
            "Name": "pricing",
            "Address": "10.0.0.5",
            "Port": 9090,
            "Tags": ["grpc"],
            "Meta": {"version": "1.0"},
            "Check": {
                "HTTP": "http://10.0.0.5:9090/health",
                "Interval": "10s",
                "Timeout": "5s",
                "DeregisterCriticalServiceAfter": "30s"
            }
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let registry = connect(&server).await;
    let service = ServiceInfo::new("svc-1", "pricing", "10.0.0.5", 9090)
        .with_tags(["grpc"])
        .with_meta("version", "1.0");

    registry.register(&service).await.unwrap();
}

#[tokio::test]
async fn test_discover_queries_passing_instances() {
    let server = consul_server().await;
    Mock::given(method("GET"))
        .and(path("/v1/health/service/pricing"))
        .and(query_param("passing", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {
                "Node": {"Node": "node-1", "Address": "10.0.0.9"},
                "Service": {
                    "ID": "svc-1",
                    "Service": "pricing",
                    "Address": "10.0.0.5",
                    "Port": 9090,
                    "Tags": ["grpc"],
                    "Meta": {"version": "1.0"}
                },
                "Checks": [{"CheckID": "serfHealth", "Status": "passing"}]
            }
        ])))
        .mount(&server)
        .await;

    let registry = connect(&server).await;
    let services = registry.discover("pricing").await.unwrap();

    assert_eq!(services.len(), 1);
    assert_eq!(services[0].id, "svc-1");
    assert_eq!(services[0].address, "10.0.0.5");
    assert_eq!(services[0].port, 9090);
    assert_eq!(services[0].tags, vec!["grpc".to_string()]);
    assert!(services[0].healthy);
}

#[tokio::test]
async fn test_discover_error_is_not_an_empty_result() {
    let server = consul_server().await;
    Mock::given(method("GET"))
        .and(path("/v1/health/service/pricing"))
        .respond_with(ResponseTemplate::new(500).set_body_string("rpc error"))
        .mount(&server)
        .await;

    let registry = connect(&server).await;
    let result = registry.discover("pricing").await;

    assert!(matches!(result, Err(RegistryError::Consul { status: 500, .. })));
}

#[tokio::test]
async fn test_slow_consul_surfaces_timeout() {
    let server = consul_server().await;
    Mock::given(method("GET"))
        .and(path("/v1/health/service/pricing"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([]))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let config = ConsulRegistryConfig {
        request_timeout: Duration::from_millis(200),
        ..ConsulRegistryConfig::default()
    };
    let registry = ConsulRegistry::connect(&server.uri(), config).await.unwrap();

    let result = registry.discover("pricing").await;
    assert!(matches!(result, Err(RegistryError::Timeout { .. })));
}

#[tokio::test]
async fn test_deregister_unknown_service() {
    let server = consul_server().await;
    Mock::given(method("PUT"))
        .and(path("/v1/agent/service/deregister/svc-1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v1/agent/service/deregister/ghost"))
        .respond_with(ResponseTemplate::new(404).set_body_string("Unknown service ID"))
        .mount(&server)
        .await;

    let registry = connect(&server).await;

    registry.deregister("svc-1").await.unwrap();
    let result = registry.deregister("ghost").await;
    assert!(matches!(result, Err(RegistryError::ServiceNotFound { .. })));
}

#[tokio::test]
async fn test_acl_token_is_sent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/status/leader"))
        .and(header("X-Consul-Token", "secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json("10.0.0.1:8300"))
        .expect(1)
        .mount(&server)
        .await;

    let config = ConsulRegistryConfig {
        token: Some("secret".to_string()),
        ..ConsulRegistryConfig::default()
    };
    ConsulRegistry::connect(&server.uri(), config).await.unwrap();
}

#[tokio::test]
async fn test_health_check_and_close_are_noops() {
    let server = consul_server().await;
    let registry = connect(&server).await;

    registry.health_check("anything").await.unwrap();
    registry.close().await.unwrap();
}
