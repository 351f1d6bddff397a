use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::{Registry, RegistryError, RegistryKind, ServiceInfo};

/// 内存注册中心配置
#[derive(Debug, Clone)]
pub struct MemoryRegistryConfig {
    /// 存活扫描周期
    pub sweep_interval: Duration,
    /// 超过该时长没有心跳则标记为不健康
    pub unhealthy_after: Duration,
    /// 超过该时长没有心跳则移除
    pub remove_after: Duration,
}

impl Default for MemoryRegistryConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            unhealthy_after: Duration::from_secs(60),
            remove_after: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Registered,
    Unhealthy,
    Removed,
}

#[derive(Debug)]
struct ServiceEntry {
    info: ServiceInfo,
    // 单调时钟，仅用于过期计算；对外报告的是 info.last_seen
    heartbeat: Instant,
}

impl ServiceEntry {
    fn new(info: ServiceInfo) -> Self {
        let mut entry = Self {
            info,
            heartbeat: Instant::now(),
        };
        entry.refresh();
        entry
    }

    fn refresh(&mut self) {
        self.heartbeat = Instant::now();
        self.info.healthy = true;
        self.info.last_seen = Some(Utc::now());
    }

    fn state(&self, now: Instant, config: &MemoryRegistryConfig) -> EntryState {
        let silent = now.saturating_duration_since(self.heartbeat);
        if silent > config.remove_after {
            EntryState::Removed
        } else if silent > config.unhealthy_after || !self.info.healthy {
            EntryState::Unhealthy
        } else {
            EntryState::Registered
        }
    }

    fn snapshot(&self, state: EntryState) -> ServiceInfo {
        let mut info = self.info.clone();
        info.healthy = state == EntryState::Registered;
        info
    }
}

type ServiceTable = Arc<RwLock<HashMap<String, ServiceEntry>>>;

/// 一次存活扫描的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub marked_unhealthy: usize,
    pub removed: usize,
}

/// 进程内注册中心，作为外部后端不可用时的兜底实现
///
/// 所有操作与后台扫描共用同一把读写锁。扫描任务随实例创建而启动，
/// 由 [`Registry::close`] 停止；未调用 `close` 时在 drop 时取消。
#[derive(Debug)]
pub struct MemoryRegistry {
    services: ServiceTable,
    config: MemoryRegistryConfig,
    closed: AtomicBool,
    shutdown: CancellationToken,
    task_tracker: TaskTracker,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::with_config(MemoryRegistryConfig::default())
    }

    pub fn with_config(config: MemoryRegistryConfig) -> Self {
        let registry = Self {
            services: Arc::new(RwLock::new(HashMap::new())),
            config,
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            task_tracker: TaskTracker::new(),
        };

        // 启动存活扫描任务
        registry.start_sweep_task();

        registry
    }

    fn start_sweep_task(&self) {
        let services = self.services.clone();
        let config = self.config.clone();
        let shutdown = self.shutdown.clone();

        self.task_tracker.spawn(async move {
            let mut interval =
                tokio::time::interval_at(Instant::now() + config.sweep_interval, config.sweep_interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        tracing::debug!("Executing service liveness sweep...");
                        Self::sweep_table(&services, &config).await;
                    }
                }
            }
            tracing::debug!("Memory registry sweep task stopped");
        });
    }

    async fn sweep_table(services: &ServiceTable, config: &MemoryRegistryConfig) -> SweepOutcome {
        let now = Instant::now();
        let mut outcome = SweepOutcome::default();
        let mut table = services.write().await;

        table.retain(|service_id, entry| match entry.state(now, config) {
            EntryState::Removed => {
                tracing::warn!(
                    service_id = %service_id,
                    service_name = %entry.info.name,
                    "Service removed due to heartbeat timeout"
                );
                outcome.removed += 1;
                false
            }
            EntryState::Unhealthy => {
                if entry.info.healthy {
                    entry.info.healthy = false;
                    tracing::warn!(
                        service_id = %service_id,
                        service_name = %entry.info.name,
                        "Service marked as unhealthy"
                    );
                    outcome.marked_unhealthy += 1;
                }
                true
            }
            EntryState::Registered => true,
        });

        if outcome != SweepOutcome::default() {
            tracing::info!(
                marked_unhealthy = outcome.marked_unhealthy,
                removed = outcome.removed,
                remaining = table.len(),
                "Liveness sweep completed"
            );
        }

        outcome
    }

    /// 立即执行一次存活扫描
    pub async fn sweep(&self) -> SweepOutcome {
        Self::sweep_table(&self.services, &self.config).await
    }

    /// 查询单个实例，包括已标记为不健康的实例
    pub async fn service(&self, service_id: &str) -> Option<ServiceInfo> {
        let now = Instant::now();
        let table = self.services.read().await;
        table.get(service_id).and_then(|entry| match entry.state(now, &self.config) {
            EntryState::Removed => None,
            state => Some(entry.snapshot(state)),
        })
    }

    /// 当前持有的记录数（含尚未被扫描移除的记录）
    pub async fn len(&self) -> usize {
        self.services.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.services.read().await.is_empty()
    }

    fn ensure_open(&self) -> Result<(), RegistryError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RegistryError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    fn kind(&self) -> RegistryKind {
        RegistryKind::Memory
    }

    async fn register(&self, service: &ServiceInfo) -> Result<(), RegistryError> {
        self.ensure_open()?;

        let mut table = self.services.write().await;
        table.insert(service.id.clone(), ServiceEntry::new(service.clone()));

        tracing::info!(
            service_id = %service.id,
            service_name = %service.name,
            endpoint = %service.endpoint(),
            "Service registered"
        );
        Ok(())
    }

    async fn deregister(&self, service_id: &str) -> Result<(), RegistryError> {
        self.ensure_open()?;

        let mut table = self.services.write().await;
        match table.remove(service_id) {
            Some(entry) => tracing::info!(
                service_id = %service_id,
                service_name = %entry.info.name,
                "Service deregistered"
            ),
            None => tracing::debug!(service_id = %service_id, "Deregister of unknown service ignored"),
        }
        Ok(())
    }

    async fn discover(&self, service_name: &str) -> Result<Vec<ServiceInfo>, RegistryError> {
        self.ensure_open()?;

        let now = Instant::now();
        let table = self.services.read().await;
        Ok(table
            .values()
            .filter(|entry| entry.info.name == service_name)
            .filter(|entry| entry.state(now, &self.config) == EntryState::Registered)
            .map(|entry| entry.snapshot(EntryState::Registered))
            .collect())
    }

    async fn health_check(&self, service_id: &str) -> Result<(), RegistryError> {
        self.ensure_open()?;

        let now = Instant::now();
        let mut table = self.services.write().await;
        match table.get_mut(service_id) {
            Some(entry) if entry.state(now, &self.config) != EntryState::Removed => {
                entry.refresh();
                tracing::debug!(service_id = %service_id, "Heartbeat received");
                Ok(())
            }
            _ => Err(RegistryError::not_found(service_id)),
        }
    }

    async fn close(&self) -> Result<(), RegistryError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.shutdown.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;

        tracing::info!("Memory registry closed");
        Ok(())
    }
}

impl Drop for MemoryRegistry {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
