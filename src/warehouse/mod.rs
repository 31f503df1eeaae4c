//! Authenticated warehouse connection layer.
//!
//! Three components form the selection triangle: the credential vault
//! decides *who* (priority-ordered accounts with cooldown bookkeeping), the
//! circuit breaker decides *whether* (per-account closed/open/half-open),
//! and the pool manager decides *with what connection*. They communicate
//! through small synchronous calls plus the breaker's notification channel;
//! the health monitor observes all three.
//!
//! The rest of the crate depends only on [`ConnectionLayer`]. Two concrete
//! implementations exist: [`AuthConnectionLayer`] with the full
//! vault/breaker/pool chain, and [`PlainConnectionLayer`] over a single
//! account for minimal deployments.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::AccountConfig;
use crate::error::{RelayError, RelayResult};
use crate::tag::TagGenerator;
use crate::templates::TemplateRegistry;

pub mod breaker;
pub mod conn;
pub mod health;
pub mod pool;
pub mod vault;

pub use breaker::{BreakerConfig, BreakerEvent, CircuitBreakerRegistry, CircuitState};
pub use conn::{HttpTransport, QueryResult, WarehouseConn, WarehouseTransport};
pub use health::{HealthConfig, HealthMonitor, SystemHealth};
pub use pool::{
    ConnectionFactory, ConnectionPoolManager, HttpConnectionFactory, PoolConfig, PoolObserver,
    PoolSnapshot,
};
pub use vault::{AccountSnapshot, CredentialVault, VaultConfig};

/// Aggregate counts exposed by a connection layer.
#[derive(Debug, Clone, Serialize)]
pub struct LayerStats {
    pub pools: HashMap<String, PoolSnapshot>,
    pub accounts: Vec<AccountSnapshot>,
}

/// The interface every connection layer exposes. The core depends only on
/// this trait; auth-enabled and plain layers are drop-in replacements.
#[async_trait]
pub trait ConnectionLayer: Send + Sync {
    /// Warm pools and start background maintenance.
    async fn initialize(&self) -> RelayResult<()>;

    /// Acquire a connection, preferring `preferred`'s pool when it has a
    /// healthy idle connection and its circuit allows traffic.
    async fn acquire(&self, preferred: Option<&str>) -> RelayResult<WarehouseConn>;

    /// Return a connection to the pool it came from.
    fn release(&self, conn: WarehouseConn);

    /// Acquire, validate, execute one registered template, record the
    /// outcome, release. The only path the dispatcher and scheduler use.
    async fn execute_template(
        &self,
        name: &str,
        params: &[Value],
        deadline: Duration,
        tag: &str,
    ) -> RelayResult<QueryResult>;

    /// Stop background tasks and drop pooled connections.
    async fn close(&self);

    fn stats(&self) -> LayerStats;

    /// Health snapshot, when the layer tracks one.
    fn health(&self) -> Option<SystemHealth> {
        None
    }

    /// Admin: clear an account's cooldown and circuit. Returns false when
    /// the layer has no such account.
    fn unlock(&self, _username: &str) -> bool {
        false
    }

    /// Admin: force selection to the next-priority account. Returns the
    /// username now preferred.
    fn rotate(&self) -> Option<String> {
        None
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Auth-enabled layer
// ─────────────────────────────────────────────────────────────────────────────

/// Routes pool lifecycle notifications into the vault and breaker.
struct LayerObserver {
    vault: Arc<CredentialVault>,
    breaker: Arc<CircuitBreakerRegistry>,
}

impl PoolObserver for LayerObserver {
    fn probe_succeeded(&self, account: &str) {
        // A probe success while the circuit is recovering must go through
        // the half-open slot so the closed transition stays gated.
        match self.breaker.state(account) {
            CircuitState::Closed => {
                self.breaker.record_success(account);
                self.vault.record_success(account);
            }
            _ => {
                if self.breaker.can_execute(account) {
                    self.breaker.record_success(account);
                    self.vault.record_success(account);
                }
            }
        }
    }

    fn connection_unhealthy(&self, account: &str) {
        self.vault.record_failure(account, "health probe failed");
        self.breaker.record_failure(account);
    }

    fn open_failed(&self, account: &str) {
        self.vault.record_failure(account, "connection open failed");
        self.breaker.record_failure(account);
    }
}

/// The full credential-vault + circuit-breaker + pool chain.
pub struct AuthConnectionLayer {
    vault: Arc<CredentialVault>,
    breaker: Arc<CircuitBreakerRegistry>,
    pool: Arc<ConnectionPoolManager>,
    monitor: Arc<HealthMonitor>,
    registry: Arc<TemplateRegistry>,
    observer: Arc<LayerObserver>,
    breaker_events: Mutex<Option<mpsc::UnboundedReceiver<BreakerEvent>>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl AuthConnectionLayer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        accounts: Vec<AccountConfig>,
        vault_cfg: VaultConfig,
        breaker_cfg: BreakerConfig,
        pool_cfg: PoolConfig,
        health_cfg: HealthConfig,
        factory: Arc<dyn ConnectionFactory>,
        registry: Arc<TemplateRegistry>,
        tags: TagGenerator,
    ) -> RelayResult<Self> {
        let vault = Arc::new(CredentialVault::new(accounts, vault_cfg)?);
        let (breaker, breaker_rx) = CircuitBreakerRegistry::new(breaker_cfg);
        let breaker = Arc::new(breaker);
        let pool = Arc::new(ConnectionPoolManager::new(pool_cfg, factory, tags));
        let monitor = Arc::new(HealthMonitor::new(
            health_cfg,
            Arc::clone(&vault),
            Arc::clone(&breaker),
            Arc::clone(&pool),
        ));
        let observer = Arc::new(LayerObserver {
            vault: Arc::clone(&vault),
            breaker: Arc::clone(&breaker),
        });
        Ok(Self {
            vault,
            breaker,
            pool,
            monitor,
            registry,
            observer,
            breaker_events: Mutex::new(Some(breaker_rx)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn vault(&self) -> &Arc<CredentialVault> {
        &self.vault
    }

    pub fn breaker(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breaker
    }

    /// Run one pool health pass outside the background loop. Probe
    /// outcomes feed the vault and breaker exactly as the loop's do.
    pub async fn run_health_pass(&self) {
        self.pool.health_check_all(self.observer.as_ref()).await;
    }

    fn record_outcome(&self, account: &str, result: &RelayResult<QueryResult>) {
        match result {
            Ok(_) => {
                self.vault.record_success(account);
                self.breaker.record_success(account);
            }
            // Validation failures never reach the warehouse; they say
            // nothing about the account's health.
            Err(RelayError::Validation { .. }) => {}
            Err(e) => {
                self.vault.record_failure(account, e.kind());
                self.breaker.record_failure(account);
            }
        }
    }
}

#[async_trait]
impl ConnectionLayer for AuthConnectionLayer {
    async fn initialize(&self) -> RelayResult<()> {
        let accounts = self.vault.candidates(|_| true);
        self.pool.initialize(&accounts, self.observer.as_ref()).await;

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.push(
            self.pool
                .spawn_health_loop(Arc::clone(&self.observer) as Arc<dyn PoolObserver>),
        );
        if let Some(rx) = self
            .breaker_events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            tasks.push(Arc::clone(&self.monitor).start(rx));
        }
        tracing::info!(accounts = accounts.len(), "connection layer initialized");
        Ok(())
    }

    async fn acquire(&self, preferred: Option<&str>) -> RelayResult<WarehouseConn> {
        // Preferred fast path: a healthy idle connection from a closed
        // circuit. Anything else falls through to the priority scan.
        if let Some(name) = preferred {
            if self.breaker.state(name) == CircuitState::Closed {
                if let Some(conn) = self.pool.try_acquire_idle(name) {
                    return Ok(conn);
                }
            }
        }

        let candidates = self.vault.candidates(|_| true);
        if candidates.is_empty() {
            return Err(RelayError::NoAvailableAccount);
        }

        let mut breaker_blocked_all = true;
        for account in &candidates {
            if !self.breaker.can_execute(&account.username) {
                continue;
            }
            breaker_blocked_all = false;
            match self.pool.acquire_from(&account.username).await {
                Ok(conn) => return Ok(conn),
                Err(RelayError::NoCapacity { account }) => {
                    tracing::debug!(%account, "pool at ceiling, trying next account");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(account = %account.username, error = %e, "connection open failed during acquire");
                    self.vault
                        .record_failure(&account.username, "connection open failed");
                    self.breaker.record_failure(&account.username);
                    continue;
                }
            }
        }

        if breaker_blocked_all {
            // Every selectable account is open-circuit; surface which one
            // was preferred so the operator knows where to look.
            Err(RelayError::CircuitOpen {
                account: candidates[0].username.clone(),
            })
        } else {
            Err(RelayError::NoAvailableAccount)
        }
    }

    fn release(&self, conn: WarehouseConn) {
        self.pool.release(conn);
    }

    async fn execute_template(
        &self,
        name: &str,
        params: &[Value],
        deadline: Duration,
        tag: &str,
    ) -> RelayResult<QueryResult> {
        let conn = self.acquire(None).await?;
        let account = conn.account().to_string();
        let result = self
            .registry
            .execute(&conn, name, params, deadline, tag)
            .await;
        self.record_outcome(&account, &result);
        self.release(conn);
        result
    }

    async fn close(&self) {
        let tasks = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *tasks)
        };
        for task in tasks {
            task.abort();
        }
        self.pool.close();
        tracing::info!("connection layer closed");
    }

    fn stats(&self) -> LayerStats {
        LayerStats {
            pools: self.pool.stats(),
            accounts: self.vault.list_all(),
        }
    }

    fn health(&self) -> Option<SystemHealth> {
        Some(self.monitor.snapshot())
    }

    fn unlock(&self, username: &str) -> bool {
        let known = self.vault.unlock(username);
        if known {
            self.breaker.reset(username);
        }
        known
    }

    fn rotate(&self) -> Option<String> {
        let breaker = Arc::clone(&self.breaker);
        self.vault.rotate(move |name| breaker.can_execute(name))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Plain layer
// ─────────────────────────────────────────────────────────────────────────────

/// Single-account layer without failover. Useful for local development and
/// as the minimal implementation of the interface.
pub struct PlainConnectionLayer {
    account: AccountConfig,
    pool: Arc<ConnectionPoolManager>,
    registry: Arc<TemplateRegistry>,
}

impl PlainConnectionLayer {
    pub fn new(
        account: AccountConfig,
        pool_cfg: PoolConfig,
        factory: Arc<dyn ConnectionFactory>,
        registry: Arc<TemplateRegistry>,
        tags: TagGenerator,
    ) -> Self {
        Self {
            account,
            pool: Arc::new(ConnectionPoolManager::new(pool_cfg, factory, tags)),
            registry,
        }
    }
}

#[async_trait]
impl ConnectionLayer for PlainConnectionLayer {
    async fn initialize(&self) -> RelayResult<()> {
        self.pool
            .initialize(std::slice::from_ref(&self.account), &pool::NullObserver)
            .await;
        Ok(())
    }

    async fn acquire(&self, _preferred: Option<&str>) -> RelayResult<WarehouseConn> {
        match self.pool.acquire_from(&self.account.username).await {
            Err(RelayError::NoCapacity { .. }) => Err(RelayError::NoAvailableAccount),
            other => other,
        }
    }

    fn release(&self, conn: WarehouseConn) {
        self.pool.release(conn);
    }

    async fn execute_template(
        &self,
        name: &str,
        params: &[Value],
        deadline: Duration,
        tag: &str,
    ) -> RelayResult<QueryResult> {
        let conn = self.acquire(None).await?;
        let result = self
            .registry
            .execute(&conn, name, params, deadline, tag)
            .await;
        self.release(conn);
        result
    }

    async fn close(&self) {
        self.pool.close();
    }

    fn stats(&self) -> LayerStats {
        LayerStats {
            pools: self.pool.stats(),
            accounts: Vec::new(),
        }
    }
}
