use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use etcd_client::{
    Client, ConnectOptions, GetOptions, LeaseKeepAliveStream, LeaseKeeper, PutOptions,
};
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::{Registry, RegistryError, RegistryKind, ServiceInfo};

pub const DEFAULT_ETCD_ENDPOINT: &str = "localhost:2379";

/// etcd 注册中心配置
#[derive(Debug, Clone)]
pub struct EtcdRegistryConfig {
    /// 每条注册记录绑定的租约时长
    pub lease_ttl: Duration,
    pub dial_timeout: Duration,
    pub request_timeout: Duration,
    pub key_prefix: String,
}

impl Default for EtcdRegistryConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(30),
            dial_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
            key_prefix: "/services".to_string(),
        }
    }
}

impl EtcdRegistryConfig {
    fn lease_ttl_secs(&self) -> i64 {
        i64::try_from(self.lease_ttl.as_secs().max(1)).unwrap_or(i64::MAX)
    }

    // 在租约过期前续期三次
    fn keep_alive_period(&self) -> Duration {
        (self.lease_ttl / 3).max(Duration::from_secs(1))
    }

    fn service_key(&self, service_name: &str, service_id: &str) -> String {
        format!("{}{}", self.service_prefix(service_name), service_id)
    }

    fn service_prefix(&self, service_name: &str) -> String {
        format!("{}/{}/", self.key_prefix.trim_end_matches('/'), service_name)
    }
}

// 本进程注册过的服务：ID -> 键与租约
#[derive(Debug, Clone)]
struct Registration {
    key: String,
    lease_id: i64,
}

// 重新注册同一 ID 时，返回需要撤销的旧登记；同一租约不撤销
fn superseded(previous: Option<Registration>, lease_id: i64) -> Option<Registration> {
    previous.filter(|p| p.lease_id != lease_id)
}

#[derive(Debug)]
enum KeepAliveCommand {
    Track(i64),
    Untrack(i64),
}

// 续约任务持有的租约表，值为 None 表示需要（重新）建立续约流
#[derive(Debug)]
struct LeaseSet<K> {
    leases: HashMap<i64, Option<K>>,
}

impl<K> LeaseSet<K> {
    fn new() -> Self {
        Self {
            leases: HashMap::new(),
        }
    }

    fn apply(&mut self, command: KeepAliveCommand) {
        match command {
            // 重复 Track 会丢弃旧流，下一轮重新建立
            KeepAliveCommand::Track(lease_id) => {
                self.leases.insert(lease_id, None);
            }
            KeepAliveCommand::Untrack(lease_id) => {
                self.leases.remove(&lease_id);
            }
        }
    }

    fn remove_expired(&mut self, expired: impl IntoIterator<Item = i64>) {
        for lease_id in expired {
            self.leases.remove(&lease_id);
        }
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = (i64, &mut Option<K>)> {
        self.leases.iter_mut().map(|(&lease_id, slot)| (lease_id, slot))
    }

    fn len(&self) -> usize {
        self.leases.len()
    }
}

/// 基于 etcd 租约的注册中心
///
/// 每次注册都会创建一个新租约，并交给实例唯一的续约任务维护。
/// 续约停止后（进程退出、网络分区、`close`），记录在租约到期后由 etcd 自动删除。
pub struct EtcdRegistry {
    client: RwLock<Option<Client>>,
    endpoints: Vec<String>,
    config: EtcdRegistryConfig,
    registrations: DashMap<String, Registration>,
    // 串行化 register/deregister，避免并发覆盖同一 ID 时误撤销存活租约
    mutation_lock: Mutex<()>,
    keep_alive_tx: mpsc::UnboundedSender<KeepAliveCommand>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    task_tracker: TaskTracker,
}

impl fmt::Debug for EtcdRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EtcdRegistry")
            .field("endpoints", &self.endpoints)
            .field("config", &self.config)
            .field("registrations", &self.registrations.len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl EtcdRegistry {
    /// 连接 etcd 并确认集群可达；不可达时返回 [`RegistryError::Unavailable`]
    pub async fn connect(
        endpoints: Vec<String>,
        config: EtcdRegistryConfig,
    ) -> Result<Self, RegistryError> {
        let endpoints = if endpoints.is_empty() {
            vec![DEFAULT_ETCD_ENDPOINT.to_string()]
        } else {
            endpoints
        };

        let options = ConnectOptions::new()
            .with_connect_timeout(config.dial_timeout)
            .with_timeout(config.request_timeout);

        let mut client = match tokio::time::timeout(
            config.dial_timeout,
            Client::connect(endpoints.clone(), Some(options)),
        )
        .await
        {
            Ok(Ok(client)) => client,
            Ok(Err(e)) => {
                return Err(RegistryError::Unavailable(format!(
                    "failed to connect to etcd at {}: {e}",
                    endpoints.join(",")
                )));
            }
            Err(_) => {
                return Err(RegistryError::Unavailable(format!(
                    "timed out connecting to etcd at {}",
                    endpoints.join(",")
                )));
            }
        };

        // 通道是惰性建立的，需要一次真实请求才能确认连通
        match tokio::time::timeout(config.dial_timeout, client.status()).await {
            Ok(Ok(status)) => tracing::info!(
                endpoints = ?endpoints,
                version = %status.version(),
                "Connected to etcd"
            ),
            Ok(Err(e)) => {
                return Err(RegistryError::Unavailable(format!(
                    "etcd at {} is unreachable: {e}",
                    endpoints.join(",")
                )));
            }
            Err(_) => {
                return Err(RegistryError::Unavailable(format!(
                    "timed out checking etcd status at {}",
                    endpoints.join(",")
                )));
            }
        }

        let (keep_alive_tx, keep_alive_rx) = mpsc::unbounded_channel();
        let registry = Self {
            client: RwLock::new(Some(client.clone())),
            endpoints,
            config,
            registrations: DashMap::new(),
            mutation_lock: Mutex::new(()),
            keep_alive_tx,
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            task_tracker: TaskTracker::new(),
        };

        // 启动续约任务
        registry.task_tracker.spawn(run_keep_alive(
            client,
            keep_alive_rx,
            registry.shutdown.clone(),
            registry.config.keep_alive_period(),
            registry.config.request_timeout,
        ));

        Ok(registry)
    }

    async fn client(&self) -> Result<Client, RegistryError> {
        self.client.read().await.clone().ok_or(RegistryError::Closed)
    }

    async fn timed<T, F>(&self, operation: &'static str, request: F) -> Result<T, RegistryError>
    where
        F: Future<Output = Result<T, etcd_client::Error>>,
    {
        tokio::time::timeout(self.config.request_timeout, request)
            .await
            .map_err(|_| RegistryError::Timeout { operation })?
            .map_err(RegistryError::from)
    }

    async fn revoke_lease(&self, client: &mut Client, lease_id: i64) {
        if let Err(e) = self.timed("lease_revoke", client.lease_revoke(lease_id)).await {
            tracing::warn!(
                lease_id = lease_id,
                error = %e,
                "Failed to revoke lease, it will expire after its TTL"
            );
        }
    }

    fn send_keep_alive(&self, command: KeepAliveCommand) {
        if self.keep_alive_tx.send(command).is_err() {
            tracing::warn!("Keep-alive task is not running, lease will not be renewed");
        }
    }

    fn registration(&self, service_id: &str) -> Result<Registration, RegistryError> {
        self.registrations
            .get(service_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RegistryError::not_found(service_id))
    }
}

#[async_trait]
impl Registry for EtcdRegistry {
    fn kind(&self) -> RegistryKind {
        RegistryKind::Etcd
    }

    async fn register(&self, service: &ServiceInfo) -> Result<(), RegistryError> {
        let mut client = self.client().await?;
        let _guard = self.mutation_lock.lock().await;

        let mut record = service.clone();
        record.healthy = true;
        record.last_seen = Some(Utc::now());
        let payload = serde_json::to_string(&record)?;
        let key = self.config.service_key(&service.name, &service.id);

        let lease = self
            .timed("lease_grant", client.lease_grant(self.config.lease_ttl_secs(), None))
            .await?;
        let lease_id = lease.id();

        let put = client.put(
            key.clone(),
            payload,
            Some(PutOptions::new().with_lease(lease_id)),
        );
        let written = self.timed("put", put).await;
        if let Err(e) = written {
            self.revoke_lease(&mut client, lease_id).await;
            return Err(e);
        }

        self.send_keep_alive(KeepAliveCommand::Track(lease_id));

        let previous = self.registrations.insert(
            service.id.clone(),
            Registration {
                key: key.clone(),
                lease_id,
            },
        );
        // 旧租约上只剩被替换的键（服务名变更时是旧路径），撤销即可清理
        if let Some(previous) = superseded(previous, lease_id) {
            self.send_keep_alive(KeepAliveCommand::Untrack(previous.lease_id));
            self.revoke_lease(&mut client, previous.lease_id).await;
        }

        tracing::info!(
            service_id = %service.id,
            service_name = %service.name,
            endpoint = %service.endpoint(),
            key = %key,
            lease_id = lease_id,
            "Service registered in etcd"
        );
        Ok(())
    }

    async fn deregister(&self, service_id: &str) -> Result<(), RegistryError> {
        let mut client = self.client().await?;
        let _guard = self.mutation_lock.lock().await;

        let registration = self.registration(service_id)?;
        self.timed("delete", client.delete(registration.key.clone(), None))
            .await?;

        self.send_keep_alive(KeepAliveCommand::Untrack(registration.lease_id));
        self.revoke_lease(&mut client, registration.lease_id).await;
        self.registrations.remove(service_id);

        tracing::info!(
            service_id = %service_id,
            key = %registration.key,
            "Service deregistered from etcd"
        );
        Ok(())
    }

    async fn discover(&self, service_name: &str) -> Result<Vec<ServiceInfo>, RegistryError> {
        let mut client = self.client().await?;
        let prefix = self.config.service_prefix(service_name);

        let response = self
            .timed(
                "get",
                client.get(prefix.clone(), Some(GetOptions::new().with_prefix())),
            )
            .await?;

        let services = decode_services(
            service_name,
            response.kvs().iter().map(|kv| (kv.key(), kv.value())),
        );
        tracing::debug!(
            service_name = %service_name,
            count = services.len(),
            "Discovered services from etcd"
        );
        Ok(services)
    }

    async fn health_check(&self, service_id: &str) -> Result<(), RegistryError> {
        let mut client = self.client().await?;
        let registration = self.registration(service_id)?;

        let response = self
            .timed("get", client.get(registration.key.clone(), None))
            .await?;
        if response.kvs().is_empty() {
            return Err(RegistryError::LeaseExpired {
                service_id: service_id.to_string(),
            });
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), RegistryError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.shutdown.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;
        self.client.write().await.take();

        tracing::info!(
            endpoints = ?self.endpoints,
            registrations = self.registrations.len(),
            "etcd registry closed, remaining leases will expire"
        );
        Ok(())
    }
}

impl Drop for EtcdRegistry {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// 解析前缀扫描结果，损坏的记录跳过而不是中断整个扫描。
// 名称中可以含 `/`，`pricing/v2` 的键同样以 `/services/pricing/` 开头，需按名称再过滤一次。
fn decode_services<'a, I>(service_name: &str, entries: I) -> Vec<ServiceInfo>
where
    I: IntoIterator<Item = (&'a [u8], &'a [u8])>,
{
    entries
        .into_iter()
        .filter_map(|(key, value)| match serde_json::from_slice::<ServiceInfo>(value) {
            Ok(info) if info.name != service_name => {
                tracing::debug!(
                    key = %String::from_utf8_lossy(key),
                    service_name = %service_name,
                    record_name = %info.name,
                    "Skipping record of another service sharing the key prefix"
                );
                None
            }
            Ok(mut info) => {
                // 键存在即表示租约仍在续期
                info.healthy = true;
                Some(info)
            }
            Err(e) => {
                tracing::warn!(
                    key = %String::from_utf8_lossy(key),
                    error = %e,
                    "Skipping malformed service record"
                );
                None
            }
        })
        .collect()
}

struct LeaseKeepAlive {
    keeper: LeaseKeeper,
    stream: LeaseKeepAliveStream,
}

enum Renewal {
    Alive(i64),
    Expired,
    StreamClosed,
}

impl LeaseKeepAlive {
    async fn renew(&mut self) -> Result<Renewal, etcd_client::Error> {
        self.keeper.keep_alive().await?;
        Ok(match self.stream.message().await? {
            Some(response) if response.ttl() > 0 => Renewal::Alive(response.ttl()),
            Some(_) => Renewal::Expired,
            None => Renewal::StreamClosed,
        })
    }
}

// 实例唯一的续约任务
async fn run_keep_alive(
    mut client: Client,
    mut commands: mpsc::UnboundedReceiver<KeepAliveCommand>,
    shutdown: CancellationToken,
    period: Duration,
    request_timeout: Duration,
) {
    let mut leases: LeaseSet<LeaseKeepAlive> = LeaseSet::new();
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            command = commands.recv() => match command {
                Some(command) => leases.apply(command),
                None => break,
            },
            _ = interval.tick() => {
                let expired = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    expired = renew_leases(&mut client, &mut leases, request_timeout) => expired,
                };
                leases.remove_expired(expired);
            }
        }
    }

    tracing::debug!(tracked_leases = leases.len(), "Lease keep-alive task stopped");
}

async fn renew_leases(
    client: &mut Client,
    leases: &mut LeaseSet<LeaseKeepAlive>,
    request_timeout: Duration,
) -> Vec<i64> {
    let mut expired = Vec::new();

    for (lease_id, slot) in leases.iter_mut() {
        if slot.is_none() {
            match tokio::time::timeout(request_timeout, client.lease_keep_alive(lease_id)).await {
                Ok(Ok((keeper, stream))) => *slot = Some(LeaseKeepAlive { keeper, stream }),
                Ok(Err(e)) => {
                    tracing::warn!(lease_id = lease_id, error = %e, "Failed to open lease keep-alive stream");
                    continue;
                }
                Err(_) => {
                    tracing::warn!(lease_id = lease_id, "Timed out opening lease keep-alive stream");
                    continue;
                }
            }
        }
        let Some(keep_alive) = slot.as_mut() else {
            continue;
        };

        match tokio::time::timeout(request_timeout, keep_alive.renew()).await {
            Ok(Ok(Renewal::Alive(ttl))) => {
                tracing::debug!(lease_id = lease_id, ttl = ttl, "Lease renewed");
            }
            Ok(Ok(Renewal::Expired)) => {
                tracing::warn!(
                    lease_id = lease_id,
                    "Lease expired, services bound to it have been removed by etcd"
                );
                expired.push(lease_id);
            }
            Ok(Ok(Renewal::StreamClosed)) => {
                tracing::warn!(lease_id = lease_id, "Keep-alive stream closed, reopening on next tick");
                *slot = None;
            }
            Ok(Err(e)) => {
                tracing::warn!(lease_id = lease_id, error = %e, "Failed to renew lease, retrying on next tick");
                *slot = None;
            }
            Err(_) => {
                tracing::warn!(lease_id = lease_id, "Timed out renewing lease, retrying on next tick");
                *slot = None;
            }
        }
    }

    expired
}
