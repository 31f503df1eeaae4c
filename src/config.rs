//! Configuration for the relay.
//!
//! Loaded in order of precedence:
//! 1. Environment variables (highest priority)
//! 2. Config file (~/.config/actrelay/config.toml)
//! 3. Built-in defaults (lowest priority)
//!
//! The fallback warehouse secret comes only from `ACTRELAY_WAREHOUSE_SECRET`;
//! startup fails with `ConfigError` when it is absent. Configuration is
//! immutable after initialization.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::cache::CacheConfig;
use crate::error::{RelayError, RelayResult};
use crate::eventlog::EventLogConfig;
use crate::metrics::MetricsConfig;
use crate::scheduler::SchedulerConfig;
use crate::warehouse::{BreakerConfig, HealthConfig, PoolConfig, VaultConfig};

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Source-system tags written into event extension columns.
pub const SOURCE_SYSTEM: &str = "claude_desktop";

// ─────────────────────────────────────────────────────────────────────────────
// Account and warehouse-object configuration
// ─────────────────────────────────────────────────────────────────────────────

/// One warehouse account. Lower `priority` wins; ties break in
/// configuration order.
#[derive(Clone, Deserialize)]
pub struct AccountConfig {
    pub username: String,
    pub account: String,
    pub warehouse: String,
    pub database: String,
    pub schema: String,
    pub role: String,
    /// Account-specific secret; accounts without one use the fallback
    /// secret from the environment.
    #[serde(default)]
    pub secret: String,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default = "default_account_ceiling")]
    pub max_connections: usize,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_priority() -> u32 {
    1
}

fn default_account_ceiling() -> usize {
    4
}

fn default_true() -> bool {
    true
}

impl std::fmt::Debug for AccountConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountConfig")
            .field("username", &self.username)
            .field("account", &self.account)
            .field("warehouse", &self.warehouse)
            .field("database", &self.database)
            .field("schema", &self.schema)
            .field("role", &self.role)
            .field("secret", &"***")
            .field("priority", &self.priority)
            .field("max_connections", &self.max_connections)
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// Warehouse object names, deferred to configuration. Restricted to an
/// identifier charset so template SQL cannot be altered through them.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WarehouseObjects {
    pub events: String,
    pub context: String,
    pub insights: String,
    pub ingest_ids: String,
    pub provenance: String,
}

impl Default for WarehouseObjects {
    fn default() -> Self {
        Self {
            events: "events".to_string(),
            context: "context_cache".to_string(),
            insights: "insight_atoms".to_string(),
            ingest_ids: "ingest_ids".to_string(),
            provenance: "insight_provenance".to_string(),
        }
    }
}

impl WarehouseObjects {
    pub fn validate(&self) -> RelayResult<()> {
        for (field, name) in [
            ("events", &self.events),
            ("context", &self.context),
            ("insights", &self.insights),
            ("ingest_ids", &self.ingest_ids),
            ("provenance", &self.provenance),
        ] {
            let ok = !name.is_empty()
                && name
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'.');
            if !ok {
                return Err(RelayError::config(format!(
                    "warehouse object `{field}` has invalid name `{name}`"
                )));
            }
        }
        Ok(())
    }
}

/// Per-tool latency budgets; samples past the budget log a warning.
#[derive(Debug, Clone)]
pub struct ToolBudgets {
    pub log_event: Duration,
    pub get_context: Duration,
    pub submit_query: Duration,
    pub log_insight: Duration,
}

impl Default for ToolBudgets {
    fn default() -> Self {
        Self {
            log_event: Duration::from_millis(10),
            get_context: Duration::from_millis(25),
            submit_query: Duration::from_millis(50),
            log_insight: Duration::from_millis(10),
        }
    }
}

/// Process log output settings.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Write JSON log lines to a daily-rotated file in this directory, in
    /// addition to stderr. Empty disables file logging.
    pub dir: Option<PathBuf>,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: None,
            json: false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Application configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the tool/admin surface binds to.
    pub bind_addr: SocketAddr,
    /// Warehouse SQL API base URL.
    pub warehouse_url: String,
    pub accounts: Vec<AccountConfig>,
    pub objects: WarehouseObjects,
    pub pool: PoolConfig,
    pub vault: VaultConfig,
    pub breaker: BreakerConfig,
    pub health: HealthConfig,
    pub eventlog: EventLogConfig,
    pub cache: CacheConfig,
    pub scheduler: SchedulerConfig,
    pub metrics: MetricsConfig,
    pub budgets: ToolBudgets,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8186".parse().expect("static address"),
            warehouse_url: "https://warehouse.internal".to_string(),
            accounts: Vec::new(),
            objects: WarehouseObjects::default(),
            pool: PoolConfig::default(),
            vault: VaultConfig::default(),
            breaker: BreakerConfig::default(),
            health: HealthConfig::default(),
            eventlog: EventLogConfig::default(),
            cache: CacheConfig::default(),
            scheduler: SchedulerConfig::default(),
            metrics: MetricsConfig::default(),
            budgets: ToolBudgets::default(),
            logging: LoggingConfig::default(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// File configuration (deserialization layer)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileConfig {
    pub bind_addr: Option<String>,

    #[serde(default)]
    pub warehouse: FileWarehouse,

    #[serde(default)]
    pub accounts: Vec<AccountConfig>,

    pub pool: Option<FilePool>,
    pub vault: Option<FileVault>,
    pub breaker: Option<FileBreaker>,
    pub health: Option<FileHealth>,
    pub eventlog: Option<FileEventLog>,
    pub cache: Option<FileCache>,
    pub scheduler: Option<FileScheduler>,
    pub metrics: Option<FileMetrics>,
    pub budgets: Option<FileBudgets>,
    pub logging: Option<FileLogging>,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileWarehouse {
    pub url: Option<String>,
    pub objects: Option<WarehouseObjects>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FilePool {
    pub min_size: Option<usize>,
    pub max_size: Option<usize>,
    pub connect_timeout_ms: Option<u64>,
    pub health_interval_ms: Option<u64>,
    pub health_timeout_ms: Option<u64>,
    pub max_idle_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FileVault {
    pub max_consecutive_failures: Option<u32>,
    pub base_cooldown_ms: Option<u64>,
    pub max_cooldown_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FileBreaker {
    pub failure_threshold: Option<u32>,
    pub window_ms: Option<u64>,
    pub cooldown_ms: Option<u64>,
    pub success_threshold: Option<u32>,
    pub max_backoff_ms: Option<u64>,
    pub probe_quota: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FileHealth {
    pub check_interval_ms: Option<u64>,
    pub min_available_accounts: Option<usize>,
    pub alert_cooldown_ms: Option<u64>,
    pub max_alerts_per_hour: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FileEventLog {
    pub dir: Option<String>,
    pub max_bytes: Option<u64>,
    pub max_age_ms: Option<u64>,
    pub max_events: Option<usize>,
    pub flush_threshold: Option<usize>,
    pub flush_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FileCache {
    pub max_entries: Option<usize>,
    pub ttl_ms: Option<u64>,
    pub negative_expected_keys: Option<usize>,
    pub negative_fp_rate: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FileScheduler {
    pub max_concurrent: Option<usize>,
    pub deadline_ms: Option<u64>,
    pub retention_ms: Option<u64>,
    pub headroom_bytes: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FileMetrics {
    pub reservoir_size: Option<usize>,
    pub rollup_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FileBudgets {
    pub log_event_ms: Option<u64>,
    pub get_context_ms: Option<u64>,
    pub submit_query_ms: Option<u64>,
    pub log_insight_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FileLogging {
    pub dir: Option<String>,
    pub json: Option<bool>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration loading
// ─────────────────────────────────────────────────────────────────────────────

impl Config {
    /// Get the config file path: ~/.config/actrelay/config.toml
    pub fn config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|p| p.join(".config").join("actrelay").join("config.toml"))
    }

    /// Create the config file with a commented template if it doesn't exist.
    pub fn ensure_config_exists() {
        let Some(path) = Self::config_path() else {
            return;
        };
        if path.exists() {
            return;
        }
        if let Some(parent) = path.parent() {
            if std::fs::create_dir_all(parent).is_err() {
                return; // Config file is optional.
            }
        }
        let _ = std::fs::write(&path, Self::template_toml());
    }

    fn load_file_config() -> RelayResult<FileConfig> {
        let Some(path) = Self::config_path() else {
            return Ok(FileConfig::default());
        };
        match std::fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).map_err(|e| {
                RelayError::config(format!("failed to parse {}: {e}", path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(FileConfig::default()),
            Err(e) => Err(RelayError::config(format!(
                "cannot read {}: {e}",
                path.display()
            ))),
        }
    }

    /// Load configuration: env vars > file > defaults.
    ///
    /// Fails with `ConfigError` when the fallback warehouse secret is
    /// missing, when no account can be assembled, or when any value fails
    /// validation.
    pub fn from_env() -> RelayResult<Self> {
        let file = Self::load_file_config()?;
        let defaults = Config::default();

        let bind_addr = std::env::var("ACTRELAY_BIND")
            .ok()
            .or(file.bind_addr)
            .map(|s| {
                s.parse::<SocketAddr>()
                    .map_err(|e| RelayError::config(format!("invalid bind address `{s}`: {e}")))
            })
            .transpose()?
            .unwrap_or(defaults.bind_addr);

        let warehouse_url = std::env::var("ACTRELAY_WAREHOUSE_URL")
            .ok()
            .or(file.warehouse.url)
            .unwrap_or(defaults.warehouse_url);

        // Exactly one fallback secret is required at startup.
        let fallback_secret = std::env::var("ACTRELAY_WAREHOUSE_SECRET").map_err(|_| {
            RelayError::config("ACTRELAY_WAREHOUSE_SECRET is required and was not set")
        })?;
        if fallback_secret.is_empty() {
            return Err(RelayError::config("ACTRELAY_WAREHOUSE_SECRET is empty"));
        }

        let mut accounts = file.accounts;
        if accounts.is_empty() {
            // Env-only single-account setup.
            accounts.push(AccountConfig {
                username: env_or("ACTRELAY_WAREHOUSE_USER", "ANALYST"),
                account: env_or("ACTRELAY_WAREHOUSE_ACCOUNT", "local"),
                warehouse: env_or("ACTRELAY_WAREHOUSE_WAREHOUSE", "COMPUTE_WH"),
                database: env_or("ACTRELAY_WAREHOUSE_DATABASE", "ANALYTICS"),
                schema: env_or("ACTRELAY_WAREHOUSE_SCHEMA", "ACTIVITY"),
                role: env_or("ACTRELAY_WAREHOUSE_ROLE", "REPORTER"),
                secret: String::new(),
                priority: 1,
                max_connections: default_account_ceiling(),
                enabled: true,
            });
        }
        for account in &mut accounts {
            if account.secret.is_empty() {
                account.secret = fallback_secret.clone();
            }
            if account.max_connections == 0 {
                return Err(RelayError::config(format!(
                    "account `{}` has a zero connection ceiling",
                    account.username
                )));
            }
        }

        let objects = file.warehouse.objects.unwrap_or_default();
        objects.validate()?;

        let pool = match file.pool {
            Some(p) => PoolConfig {
                min_size: p.min_size.unwrap_or(defaults.pool.min_size),
                max_size: p.max_size.unwrap_or(defaults.pool.max_size),
                connect_timeout: ms_or(p.connect_timeout_ms, defaults.pool.connect_timeout),
                health_interval: ms_or(p.health_interval_ms, defaults.pool.health_interval),
                health_timeout: ms_or(p.health_timeout_ms, defaults.pool.health_timeout),
                max_idle: ms_or(p.max_idle_ms, defaults.pool.max_idle),
            },
            None => defaults.pool,
        };

        let vault = match file.vault {
            Some(v) => VaultConfig {
                max_consecutive_failures: v
                    .max_consecutive_failures
                    .unwrap_or(defaults.vault.max_consecutive_failures),
                base_cooldown: ms_or(v.base_cooldown_ms, defaults.vault.base_cooldown),
                max_cooldown: ms_or(v.max_cooldown_ms, defaults.vault.max_cooldown),
            },
            None => defaults.vault,
        };

        let scheduler = match file.scheduler {
            Some(s) => SchedulerConfig {
                max_concurrent: s.max_concurrent.unwrap_or(defaults.scheduler.max_concurrent),
                deadline: ms_or(s.deadline_ms, defaults.scheduler.deadline),
                retention: ms_or(s.retention_ms, defaults.scheduler.retention),
                headroom: s.headroom_bytes.unwrap_or(defaults.scheduler.headroom),
            },
            None => defaults.scheduler,
        };

        let breaker = match file.breaker {
            Some(b) => BreakerConfig {
                failure_threshold: b
                    .failure_threshold
                    .unwrap_or(defaults.breaker.failure_threshold),
                window: ms_or(b.window_ms, defaults.breaker.window),
                cooldown: ms_or(b.cooldown_ms, defaults.breaker.cooldown),
                success_threshold: b
                    .success_threshold
                    .unwrap_or(defaults.breaker.success_threshold),
                max_backoff: ms_or(b.max_backoff_ms, defaults.breaker.max_backoff),
                probe_quota: b.probe_quota.unwrap_or(defaults.breaker.probe_quota),
                // Probe slots time out with the warehouse call deadline.
                probe_timeout: scheduler.deadline,
            },
            None => BreakerConfig {
                probe_timeout: scheduler.deadline,
                ..defaults.breaker
            },
        };

        let health = match file.health {
            Some(h) => HealthConfig {
                check_interval: ms_or(h.check_interval_ms, defaults.health.check_interval),
                min_available_accounts: h
                    .min_available_accounts
                    .unwrap_or(defaults.health.min_available_accounts),
                alert_cooldown: ms_or(h.alert_cooldown_ms, defaults.health.alert_cooldown),
                max_alerts_per_hour: h
                    .max_alerts_per_hour
                    .unwrap_or(defaults.health.max_alerts_per_hour),
            },
            None => defaults.health,
        };

        let eventlog = {
            let dir = std::env::var("ACTRELAY_SEGMENT_DIR")
                .ok()
                .or(file.eventlog.as_ref().and_then(|e| e.dir.clone()))
                .map(PathBuf::from)
                .unwrap_or(defaults.eventlog.dir);
            match file.eventlog {
                Some(e) => EventLogConfig {
                    dir,
                    max_bytes: e.max_bytes.unwrap_or(defaults.eventlog.max_bytes),
                    max_age: ms_or(e.max_age_ms, defaults.eventlog.max_age),
                    max_events: e.max_events.unwrap_or(defaults.eventlog.max_events),
                    flush_threshold: e
                        .flush_threshold
                        .unwrap_or(defaults.eventlog.flush_threshold),
                    flush_interval: ms_or(e.flush_interval_ms, defaults.eventlog.flush_interval),
                },
                None => EventLogConfig {
                    dir,
                    ..defaults.eventlog
                },
            }
        };

        let cache = match file.cache {
            Some(c) => CacheConfig {
                max_entries: c.max_entries.unwrap_or(defaults.cache.max_entries),
                ttl: ms_or(c.ttl_ms, defaults.cache.ttl),
                negative_expected_keys: c
                    .negative_expected_keys
                    .unwrap_or(defaults.cache.negative_expected_keys),
                negative_fp_rate: c.negative_fp_rate.unwrap_or(defaults.cache.negative_fp_rate),
            },
            None => defaults.cache,
        };

        let metrics = match file.metrics {
            Some(m) => MetricsConfig {
                reservoir_size: m.reservoir_size.unwrap_or(defaults.metrics.reservoir_size),
                rollup_interval: ms_or(m.rollup_interval_ms, defaults.metrics.rollup_interval),
            },
            None => defaults.metrics,
        };

        let budgets = match file.budgets {
            Some(b) => ToolBudgets {
                log_event: ms_or(b.log_event_ms, defaults.budgets.log_event),
                get_context: ms_or(b.get_context_ms, defaults.budgets.get_context),
                submit_query: ms_or(b.submit_query_ms, defaults.budgets.submit_query),
                log_insight: ms_or(b.log_insight_ms, defaults.budgets.log_insight),
            },
            None => defaults.budgets,
        };

        let logging = match file.logging {
            Some(l) => LoggingConfig {
                dir: l.dir.map(PathBuf::from),
                json: l.json.unwrap_or(false),
            },
            None => defaults.logging,
        };

        Ok(Self {
            bind_addr,
            warehouse_url,
            accounts,
            objects,
            pool,
            vault,
            breaker,
            health,
            eventlog,
            cache,
            scheduler,
            metrics,
            budgets,
            logging,
        })
    }

    /// Commented starter template written on first run.
    pub fn template_toml() -> String {
        r#"# actrelay configuration
# Environment variables override file values; ACTRELAY_WAREHOUSE_SECRET is
# always required and never read from this file.

# bind_addr = "127.0.0.1:8186"

[warehouse]
# url = "https://warehouse.internal"

# [warehouse.objects]
# events = "events"
# context = "context_cache"
# insights = "insight_atoms"
# ingest_ids = "ingest_ids"
# provenance = "insight_provenance"

# [[accounts]]
# username = "ANALYST"
# account = "xy12345"
# warehouse = "COMPUTE_WH"
# database = "ANALYTICS"
# schema = "ACTIVITY"
# role = "REPORTER"
# priority = 1
# max_connections = 4

# [pool]
# min_size = 1
# max_size = 4
# connect_timeout_ms = 10000
# health_interval_ms = 30000
# health_timeout_ms = 5000

# [breaker]
# failure_threshold = 5
# window_ms = 60000
# cooldown_ms = 30000
# success_threshold = 2
# max_backoff_ms = 300000

# [eventlog]
# dir = "./segments"
# max_bytes = 16777216
# max_age_ms = 60000
# max_events = 100000

# [cache]
# max_entries = 10000
# ttl_ms = 300000

# [scheduler]
# max_concurrent = 5
# deadline_ms = 30000
# retention_ms = 3600000

# [logging]
# dir = "./logs"
# json = false
"#
        .to_string()
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn ms_or(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_millis).unwrap_or(default)
}
