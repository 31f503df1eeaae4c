//! Shared test harness: a scripted in-memory warehouse behind the real
//! connection layer, plus a fully wired dispatcher stack.
#![allow(dead_code)] // Each test binary uses a different slice of the harness.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use actrelay::cache::{CacheConfig, ContextCache};
use actrelay::config::AccountConfig;
use actrelay::config::WarehouseObjects;
use actrelay::dispatch::{DispatcherConfig, ToolDispatcher};
use actrelay::error::{RelayError, RelayResult};
use actrelay::eventlog::{EventLog, EventLogConfig};
use actrelay::metrics::{MetricsConfig, MetricsCore};
use actrelay::scheduler::{SchedulerConfig, TicketScheduler};
use actrelay::tag::TagGenerator;
use actrelay::templates::TemplateRegistry;
use actrelay::warehouse::{
    AuthConnectionLayer, BreakerConfig, ConnectionFactory, ConnectionLayer, HealthConfig,
    PoolConfig, QueryResult, VaultConfig, WarehouseTransport,
};

/// Scripted warehouse shared by every connection the factory opens.
#[derive(Default)]
pub struct TestWarehouse {
    /// Accounts whose statements (including probes) currently fail.
    failing: Mutex<HashSet<String>>,
    /// Context rows by customer key.
    contexts: Mutex<HashMap<String, Value>>,
    /// Canned rows returned for any other SELECT.
    canned: Mutex<Vec<Value>>,
    /// Artificial latency applied to every statement.
    delay: Mutex<Duration>,
    /// (account, sql, tag) per executed statement.
    pub calls: Mutex<Vec<(String, String, String)>>,
    pub executed: AtomicUsize,
}

impl TestWarehouse {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, account: &str, failing: bool) {
        let mut set = self.failing.lock().unwrap();
        if failing {
            set.insert(account.to_string());
        } else {
            set.remove(account);
        }
    }

    pub fn put_context(&self, customer: &str, document: Value) {
        self.contexts
            .lock()
            .unwrap()
            .insert(customer.to_string(), document);
    }

    pub fn set_canned_rows(&self, rows: Vec<Value>) {
        *self.canned.lock().unwrap() = rows;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls_for(&self, account: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(a, _, _)| a == account)
            .count()
    }
}

pub struct TestTransport {
    account: String,
    warehouse: Arc<TestWarehouse>,
}

#[async_trait]
impl WarehouseTransport for TestTransport {
    async fn run(
        &self,
        sql: &str,
        binds: &[Value],
        tag: &str,
        _deadline: Duration,
    ) -> RelayResult<QueryResult> {
        self.warehouse.calls.lock().unwrap().push((
            self.account.clone(),
            sql.to_string(),
            tag.to_string(),
        ));
        self.warehouse.executed.fetch_add(1, Ordering::SeqCst);

        let delay = *self.warehouse.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.warehouse.failing.lock().unwrap().contains(&self.account) {
            return Err(RelayError::warehouse("scripted account failure"));
        }

        if sql.trim() == "SELECT 1" {
            return Ok(QueryResult::from_rows(vec![json!({"1": 1})]));
        }
        if sql.starts_with("SELECT context_blob") {
            let customer = binds
                .first()
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let rows = self
                .warehouse
                .contexts
                .lock()
                .unwrap()
                .get(&customer)
                .map(|doc| vec![json!({ "context_blob": doc.to_string() })])
                .unwrap_or_default();
            return Ok(QueryResult::from_rows(rows));
        }
        if sql.starts_with("INSERT") || sql.starts_with("MERGE") {
            return Ok(QueryResult::from_rows(vec![]));
        }
        Ok(QueryResult::from_rows(self.warehouse.canned.lock().unwrap().clone()))
    }
}

pub struct TestFactory {
    warehouse: Arc<TestWarehouse>,
    /// Accounts whose connection opens fail outright.
    pub refuse_opens: Mutex<HashSet<String>>,
}

impl TestFactory {
    pub fn new(warehouse: Arc<TestWarehouse>) -> Arc<Self> {
        Arc::new(Self {
            warehouse,
            refuse_opens: Mutex::new(HashSet::new()),
        })
    }
}

#[async_trait]
impl ConnectionFactory for TestFactory {
    async fn open(&self, account: &AccountConfig) -> RelayResult<Arc<dyn WarehouseTransport>> {
        if self.refuse_opens.lock().unwrap().contains(&account.username) {
            return Err(RelayError::warehouse("scripted open refusal"));
        }
        Ok(Arc::new(TestTransport {
            account: account.username.clone(),
            warehouse: Arc::clone(&self.warehouse),
        }))
    }
}

pub fn account(username: &str, priority: u32) -> AccountConfig {
    AccountConfig {
        username: username.to_string(),
        account: "test".to_string(),
        warehouse: "COMPUTE_WH".to_string(),
        database: "ANALYTICS".to_string(),
        schema: "ACTIVITY".to_string(),
        role: "REPORTER".to_string(),
        secret: "test-secret".to_string(),
        priority,
        max_connections: 4,
        enabled: true,
    }
}

/// Breaker tuned for fast tests: opens after 3 failures, 40ms cooldown,
/// one probe success closes it.
pub fn fast_breaker() -> BreakerConfig {
    BreakerConfig {
        failure_threshold: 3,
        window: Duration::from_secs(60),
        cooldown: Duration::from_millis(40),
        success_threshold: 1,
        max_backoff: Duration::from_millis(320),
        probe_quota: 1,
        probe_timeout: Duration::from_millis(500),
    }
}

pub struct Stack {
    pub dispatcher: Arc<ToolDispatcher>,
    pub layer: Arc<AuthConnectionLayer>,
    pub scheduler: Arc<TicketScheduler>,
    pub log: Arc<EventLog>,
    pub cache: Arc<ContextCache>,
    pub warehouse: Arc<TestWarehouse>,
    pub log_dir: tempfile::TempDir,
}

pub struct StackOptions {
    pub accounts: Vec<AccountConfig>,
    pub eventlog: fn(&mut EventLogConfig),
    pub breaker: BreakerConfig,
    pub scheduler: SchedulerConfig,
}

impl Default for StackOptions {
    fn default() -> Self {
        Self {
            accounts: vec![account("primary", 1), account("secondary", 2)],
            eventlog: |_| {},
            breaker: fast_breaker(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

pub async fn build_stack(options: StackOptions) -> Stack {
    let warehouse = TestWarehouse::new();
    let factory = TestFactory::new(Arc::clone(&warehouse));
    let tags = TagGenerator::new().unwrap();
    let registry = Arc::new(TemplateRegistry::builtin(&WarehouseObjects::default()).unwrap());

    let layer = Arc::new(
        AuthConnectionLayer::new(
            options.accounts,
            VaultConfig {
                max_consecutive_failures: 100,
                base_cooldown: Duration::from_millis(50),
                max_cooldown: Duration::from_millis(400),
            },
            options.breaker,
            PoolConfig {
                min_size: 1,
                max_size: 4,
                connect_timeout: Duration::from_millis(500),
                // Health loop driven manually in tests.
                health_interval: Duration::from_secs(3600),
                health_timeout: Duration::from_millis(200),
                max_idle: Duration::from_secs(600),
            },
            HealthConfig {
                check_interval: Duration::from_secs(3600),
                ..HealthConfig::default()
            },
            factory,
            Arc::clone(&registry),
            tags,
        )
        .unwrap(),
    );
    layer.initialize().await.unwrap();

    let log_dir = tempfile::tempdir().unwrap();
    let mut eventlog_cfg = EventLogConfig {
        dir: log_dir.path().to_path_buf(),
        ..EventLogConfig::default()
    };
    (options.eventlog)(&mut eventlog_cfg);
    let log = Arc::new(EventLog::open(eventlog_cfg).unwrap());

    let cache = Arc::new(ContextCache::new(CacheConfig::default()));
    let scheduler = Arc::new(TicketScheduler::new(
        options.scheduler,
        Arc::clone(&layer) as Arc<dyn ConnectionLayer>,
        Arc::clone(&registry),
        tags,
    ));
    scheduler.start();

    let metrics = Arc::new(MetricsCore::new(MetricsConfig::default()));
    let dispatcher = Arc::new(ToolDispatcher::new(
        DispatcherConfig::default(),
        tags,
        registry,
        Arc::clone(&layer) as Arc<dyn ConnectionLayer>,
        Arc::clone(&log),
        Arc::clone(&cache),
        Arc::clone(&scheduler),
        metrics,
    ));

    Stack {
        dispatcher,
        layer,
        scheduler,
        log,
        cache,
        warehouse,
        log_dir,
    }
}

impl Stack {
    pub async fn shutdown(self) {
        self.scheduler.close();
        self.layer.close().await;
        let _ = self.log.close();
    }

    pub fn read_segment(&self, path: &std::path::Path) -> Vec<Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }
}
