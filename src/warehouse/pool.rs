//! Per-account warehouse connection pools.
//!
//! Each account owns a bounded pool of connections. The manager hands a
//! connection out by moving it from the idle set (so it is invisible to
//! other callers until released), opens new connections below the ceiling,
//! and runs a background health loop that probes idle connections and
//! replenishes pools that fall under the minimum.
//!
//! Account selection policy lives above this module; the pool only answers
//! "give me a connection from account X's pool".

use async_trait::async_trait;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::AccountConfig;
use crate::error::{RelayError, RelayResult};
use crate::tag::TagGenerator;

use super::conn::{HttpTransport, WarehouseConn, WarehouseTransport};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connections the health loop keeps open per account.
    pub min_size: usize,
    /// Global per-account ceiling; the account's own ceiling still applies.
    pub max_size: usize,
    pub connect_timeout: Duration,
    pub health_interval: Duration,
    pub health_timeout: Duration,
    /// Idle connections older than this are destroyed instead of reused.
    pub max_idle: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 4,
            connect_timeout: Duration::from_secs(10),
            health_interval: Duration::from_secs(30),
            health_timeout: Duration::from_secs(5),
            max_idle: Duration::from_secs(300),
        }
    }
}

/// Opens transports for an account. The production factory builds HTTP
/// SQL-API transports; tests substitute mocks.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn open(&self, account: &AccountConfig) -> RelayResult<Arc<dyn WarehouseTransport>>;
}

/// Factory for the warehouse's HTTP SQL API.
pub struct HttpConnectionFactory {
    base_url: String,
}

impl HttpConnectionFactory {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl ConnectionFactory for HttpConnectionFactory {
    async fn open(&self, account: &AccountConfig) -> RelayResult<Arc<dyn WarehouseTransport>> {
        Ok(Arc::new(HttpTransport::new(&self.base_url, account.clone())?))
    }
}

/// Receives pool lifecycle notifications. The connection layer wires these
/// to the vault and circuit breaker; the default implementation ignores
/// everything.
pub trait PoolObserver: Send + Sync {
    fn probe_succeeded(&self, _account: &str) {}
    fn connection_unhealthy(&self, _account: &str) {}
    fn open_failed(&self, _account: &str) {}
}

/// Observer that drops all notifications.
pub struct NullObserver;

impl PoolObserver for NullObserver {}

/// Point-in-time pool counts for one account.
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub total: usize,
    pub idle: usize,
    pub active: usize,
    pub max: usize,
}

struct PoolState {
    account: AccountConfig,
    idle: VecDeque<WarehouseConn>,
    /// Connections alive for this account, idle or checked out, including
    /// reservations for opens in flight.
    total: usize,
}

impl PoolState {
    fn ceiling(&self, cfg: &PoolConfig) -> usize {
        cfg.max_size.min(self.account.max_connections)
    }
}

pub struct ConnectionPoolManager {
    cfg: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    pools: Mutex<HashMap<String, PoolState>>,
    next_id: AtomicU64,
    tags: TagGenerator,
    closed: AtomicBool,
}

impl ConnectionPoolManager {
    pub fn new(cfg: PoolConfig, factory: Arc<dyn ConnectionFactory>, tags: TagGenerator) -> Self {
        Self {
            cfg,
            factory,
            pools: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            tags,
            closed: AtomicBool::new(false),
        }
    }

    /// Open `min(min_size, ceiling)` connections per account concurrently.
    /// An account whose warmup fully fails is left with an empty pool and
    /// reported through the observer.
    pub async fn initialize(&self, accounts: &[AccountConfig], observer: &dyn PoolObserver) {
        {
            let mut pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
            for account in accounts {
                pools
                    .entry(account.username.clone())
                    .or_insert_with(|| PoolState {
                        account: account.clone(),
                        idle: VecDeque::new(),
                        total: 0,
                    });
            }
        }

        let warmups = accounts.iter().map(|account| async move {
            let want = self.cfg.min_size.min(self.cfg.max_size.min(account.max_connections));
            let mut opened = 0usize;
            for _ in 0..want {
                match self.open_reserved(&account.username).await {
                    Ok(conn) => {
                        self.put_idle(conn);
                        opened += 1;
                    }
                    Err(e) => {
                        tracing::warn!(account = %account.username, error = %e, "pool warmup open failed");
                    }
                }
            }
            (account.username.clone(), opened, want)
        });

        for (username, opened, want) in futures::future::join_all(warmups).await {
            if opened == 0 && want > 0 {
                observer.open_failed(&username);
            } else {
                tracing::debug!(account = %username, opened, "pool warmed");
            }
        }
    }

    /// Take a connection from one account's pool: a healthy idle connection
    /// if present, a freshly opened one if below ceiling, otherwise
    /// `NoCapacityError` for the failover loop above to consume.
    pub async fn acquire_from(&self, username: &str) -> RelayResult<WarehouseConn> {
        {
            let mut pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
            let pool = pools.get_mut(username).ok_or_else(|| {
                RelayError::warehouse(format!("no pool registered for account `{username}`"))
            })?;

            while let Some(conn) = pool.idle.pop_front() {
                if !conn.is_healthy() || conn.last_used_at.elapsed() > self.cfg.max_idle {
                    pool.total -= 1;
                    continue;
                }
                return Ok(conn);
            }

            if pool.total >= pool.ceiling(&self.cfg) {
                return Err(RelayError::NoCapacity {
                    account: username.to_string(),
                });
            }
            // Reserve the slot before dropping the lock for the open.
            pool.total += 1;
        }

        match self.open_for(username).await {
            Ok(conn) => Ok(conn),
            Err(e) => {
                let mut pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(pool) = pools.get_mut(username) {
                    pool.total -= 1;
                }
                Err(e)
            }
        }
    }

    /// Take a healthy idle connection if one exists, without opening a new
    /// one. Serves the preferred-account fast path.
    pub fn try_acquire_idle(&self, username: &str) -> Option<WarehouseConn> {
        let mut pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
        let pool = pools.get_mut(username)?;
        while let Some(conn) = pool.idle.pop_front() {
            if !conn.is_healthy() || conn.last_used_at.elapsed() > self.cfg.max_idle {
                pool.total -= 1;
                continue;
            }
            return Some(conn);
        }
        None
    }

    /// Return a connection to its own pool's idle set. Unhealthy
    /// connections are destroyed instead.
    pub fn release(&self, mut conn: WarehouseConn) {
        let mut pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
        let Some(pool) = pools.get_mut(conn.account()) else {
            return;
        };
        if !conn.is_healthy() || self.closed.load(Ordering::Relaxed) {
            pool.total -= 1;
            return;
        }
        conn.last_used_at = Instant::now();
        pool.idle.push_back(conn);
    }

    /// Probe every idle connection; evict and destroy failures; replenish
    /// pools below `min_size`. One pass of the background health loop.
    pub async fn health_check_all(&self, observer: &dyn PoolObserver) {
        let drained: Vec<(String, Vec<WarehouseConn>)> = {
            let mut pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
            pools
                .iter_mut()
                .map(|(name, pool)| (name.clone(), pool.idle.drain(..).collect()))
                .collect()
        };

        for (username, conns) in drained {
            let mut healthy_count = 0usize;
            for mut conn in conns {
                let tag = self.tags.generate();
                match conn.probe(&tag, self.cfg.health_timeout).await {
                    Ok(()) => {
                        conn.last_health_check_at = Some(Instant::now());
                        healthy_count += 1;
                        observer.probe_succeeded(&username);
                        self.put_idle(conn);
                    }
                    Err(e) => {
                        tracing::warn!(account = %username, conn = conn.id(), error = %e, "health probe failed, destroying connection");
                        conn.mark_unhealthy();
                        let mut pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
                        if let Some(pool) = pools.get_mut(&username) {
                            pool.total -= 1;
                        }
                        drop(pools);
                        observer.connection_unhealthy(&username);
                    }
                }
            }
            tracing::trace!(account = %username, healthy = healthy_count, "health pass complete");

            // Replenish below min_size.
            loop {
                {
                    let mut pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
                    let Some(pool) = pools.get_mut(&username) else { break };
                    let floor = self.cfg.min_size.min(pool.ceiling(&self.cfg));
                    if pool.total >= floor {
                        break;
                    }
                    // Reserve the slot before dropping the lock.
                    pool.total += 1;
                }
                match self.open_for(&username).await {
                    Ok(conn) => self.put_idle(conn),
                    Err(e) => {
                        tracing::warn!(account = %username, error = %e, "replenish open failed");
                        let mut pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
                        if let Some(pool) = pools.get_mut(&username) {
                            pool.total -= 1;
                        }
                        drop(pools);
                        observer.open_failed(&username);
                        break;
                    }
                }
            }
        }
    }

    /// Background health loop; stops when [`close`](Self::close) is called.
    pub fn spawn_health_loop(
        self: &Arc<Self>,
        observer: Arc<dyn PoolObserver>,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.cfg.health_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if manager.closed.load(Ordering::Relaxed) {
                    break;
                }
                manager.health_check_all(observer.as_ref()).await;
            }
        })
    }

    /// Drop every idle connection and refuse future releases into the pools.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        let mut pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
        for pool in pools.values_mut() {
            let dropped = pool.idle.len();
            pool.total -= dropped;
            pool.idle.clear();
        }
    }

    pub fn stats(&self) -> HashMap<String, PoolSnapshot> {
        let pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
        pools
            .iter()
            .map(|(name, pool)| {
                (
                    name.clone(),
                    PoolSnapshot {
                        total: pool.total,
                        idle: pool.idle.len(),
                        active: pool.total - pool.idle.len(),
                        max: pool.ceiling(&self.cfg),
                    },
                )
            })
            .collect()
    }

    fn put_idle(&self, conn: WarehouseConn) {
        let mut pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pool) = pools.get_mut(conn.account()) {
            pool.idle.push_back(conn);
        }
    }

    /// Open a connection for a slot that is already reserved in `total`.
    async fn open_for(&self, username: &str) -> RelayResult<WarehouseConn> {
        let account = {
            let pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
            pools
                .get(username)
                .map(|p| p.account.clone())
                .ok_or_else(|| {
                    RelayError::warehouse(format!("no pool registered for account `{username}`"))
                })?
        };
        let transport = tokio::time::timeout(self.cfg.connect_timeout, self.factory.open(&account))
            .await
            .map_err(|_| {
                RelayError::timeout("connection open", self.cfg.connect_timeout.as_millis() as u64)
            })??;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Ok(WarehouseConn::new(id, account.username.clone(), transport))
    }

    /// Reserve a slot and open; used by warmup where the pool entry exists
    /// but no caller holds the lock.
    async fn open_reserved(&self, username: &str) -> RelayResult<WarehouseConn> {
        {
            let mut pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
            let pool = pools.get_mut(username).ok_or_else(|| {
                RelayError::warehouse(format!("no pool registered for account `{username}`"))
            })?;
            if pool.total >= pool.ceiling(&self.cfg) {
                return Err(RelayError::NoCapacity {
                    account: username.to_string(),
                });
            }
            pool.total += 1;
        }
        match self.open_for(username).await {
            Ok(conn) => Ok(conn),
            Err(e) => {
                let mut pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(pool) = pools.get_mut(username) {
                    pool.total -= 1;
                }
                Err(e)
            }
        }
    }
}
