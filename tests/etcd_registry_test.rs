//! These tests need a running etcd at localhost:2379:
//! `cargo test --test etcd_registry_test -- --ignored`

use std::time::Duration;

use chain_registry::registry::{
    EtcdRegistry, EtcdRegistryConfig, Registry, RegistryError, RegistryKind, ServiceInfo,
};

const ETCD_ENDPOINT: &str = "localhost:2379";

async fn connect(config: EtcdRegistryConfig) -> EtcdRegistry {
    EtcdRegistry::connect(vec![ETCD_ENDPOINT.to_string()], config)
        .await
        .expect("Failed to connect to etcd")
}

#[tokio::test]
#[ignore = "requires a running etcd"]
async fn test_etcd_register_discover_deregister() {
    let registry = connect(EtcdRegistryConfig::default()).await;
    assert_eq!(registry.kind(), RegistryKind::Etcd);

    let service = ServiceInfo::new("test-etcd-service-1", "test-etcd-service", "localhost", 8888)
        .with_tags(["test", "etcd"])
        .with_meta("env", "test");
    registry.register(&service).await.unwrap();

    let services = registry.discover("test-etcd-service").await.unwrap();
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].port, 8888);
    assert!(services[0].healthy);
    assert!(services[0].last_seen.is_some());

    registry.health_check("test-etcd-service-1").await.unwrap();

    registry.deregister("test-etcd-service-1").await.unwrap();
    assert!(registry.discover("test-etcd-service").await.unwrap().is_empty());

    registry.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running etcd"]
async fn test_etcd_unknown_service_is_reported() {
    let registry = connect(EtcdRegistryConfig::default()).await;

    assert!(matches!(
        registry.deregister("never-registered").await,
        Err(RegistryError::ServiceNotFound { .. })
    ));
    assert!(matches!(
        registry.health_check("never-registered").await,
        Err(RegistryError::ServiceNotFound { .. })
    ));

    registry.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running etcd"]
async fn test_etcd_reregistration_replaces_record() {
    let registry = connect(EtcdRegistryConfig::default()).await;

    let mut service = ServiceInfo::new("test-etcd-upsert-1", "test-etcd-upsert", "localhost", 8001);
    registry.register(&service).await.unwrap();
    service.port = 8002;
    registry.register(&service).await.unwrap();

    let services = registry.discover("test-etcd-upsert").await.unwrap();
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].port, 8002);

    registry.deregister("test-etcd-upsert-1").await.unwrap();
    registry.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running etcd"]
async fn test_etcd_keep_alive_outlives_ttl() {
    let config = EtcdRegistryConfig {
        lease_ttl: Duration::from_secs(3),
        ..EtcdRegistryConfig::default()
    };
    let registry = connect(config).await;

    registry
        .register(&ServiceInfo::new("test-etcd-ka-1", "test-etcd-ka", "localhost", 8003))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(7)).await;
    assert_eq!(registry.discover("test-etcd-ka").await.unwrap().len(), 1);
    registry.health_check("test-etcd-ka-1").await.unwrap();

    registry.deregister("test-etcd-ka-1").await.unwrap();
    registry.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running etcd"]
async fn test_etcd_abandoned_record_expires() {
    let config = EtcdRegistryConfig {
        lease_ttl: Duration::from_secs(3),
        ..EtcdRegistryConfig::default()
    };
    let observer = connect(EtcdRegistryConfig::default()).await;

    {
        let registry = connect(config).await;
        registry
            .register(&ServiceInfo::new("test-etcd-gone-1", "test-etcd-gone", "localhost", 8004))
            .await
            .unwrap();
        assert_eq!(observer.discover("test-etcd-gone").await.unwrap().len(), 1);
        // 模拟进程退出：不注销，直接丢弃，续约任务随之停止
    }

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(observer.discover("test-etcd-gone").await.unwrap().is_empty());

    observer.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running etcd"]
async fn test_etcd_discover_skips_malformed_records() {
    let registry = connect(EtcdRegistryConfig::default()).await;
    registry
        .register(&ServiceInfo::new("test-etcd-bad-1", "test-etcd-bad", "localhost", 8005))
        .await
        .unwrap();

    let mut client = etcd_client::Client::connect([ETCD_ENDPOINT], None).await.unwrap();
    client
        .put("/services/test-etcd-bad/garbage", "{not json", None)
        .await
        .unwrap();

    let services = registry.discover("test-etcd-bad").await.unwrap();
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].id, "test-etcd-bad-1");

    client.delete("/services/test-etcd-bad/garbage", None).await.unwrap();
    registry.deregister("test-etcd-bad-1").await.unwrap();
    registry.close().await.unwrap();
}
