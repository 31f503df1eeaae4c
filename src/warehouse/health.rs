//! Health monitor: aggregates vault, breaker, and pool state.
//!
//! A polling aggregator composes a per-account and system-level snapshot on
//! every tick and on demand for the admin surface. Breaker notifications
//! feed the alert path; alerts are rate-limited per (kind, account) and per
//! hour, and delivered to the log sink.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use super::breaker::{
    BreakerEvent, BreakerEventKind, CircuitBreakerRegistry, CircuitState,
};
use super::pool::{ConnectionPoolManager, PoolSnapshot};
use super::vault::CredentialVault;

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub check_interval: Duration,
    /// Below this many available (healthy + degraded) accounts the system
    /// is critical.
    pub min_available_accounts: usize,
    /// Minimum spacing between alerts of the same (kind, account).
    pub alert_cooldown: Duration,
    pub max_alerts_per_hour: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(15),
            min_available_accounts: 1,
            alert_cooldown: Duration::from_secs(300),
            max_alerts_per_hour: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountHealth {
    Healthy,
    Degraded,
    Critical,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Healthy,
    Degraded,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub kind: String,
    pub account: Option<String>,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountReport {
    pub username: String,
    pub priority: u32,
    pub circuit_state: CircuitState,
    pub available: bool,
    pub pool: PoolSnapshot,
    /// Successes over attempts; 1.0 before any attempt.
    pub success_rate: f64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub status: AccountHealth,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    pub generated_at: DateTime<Utc>,
    pub healthy: usize,
    pub degraded: usize,
    pub critical: usize,
    pub offline: usize,
    pub overall: OverallStatus,
    pub recommendations: Vec<String>,
    pub accounts: Vec<AccountReport>,
    pub recent_alerts: Vec<Alert>,
}

struct AlertBook {
    last_sent: HashMap<(String, String), Instant>,
    hour_started: Instant,
    sent_this_hour: u32,
    recent: VecDeque<Alert>,
}

const RECENT_ALERTS: usize = 50;

pub struct HealthMonitor {
    cfg: HealthConfig,
    vault: Arc<CredentialVault>,
    breaker: Arc<CircuitBreakerRegistry>,
    pool: Arc<ConnectionPoolManager>,
    alerts: Mutex<AlertBook>,
}

impl HealthMonitor {
    pub fn new(
        cfg: HealthConfig,
        vault: Arc<CredentialVault>,
        breaker: Arc<CircuitBreakerRegistry>,
        pool: Arc<ConnectionPoolManager>,
    ) -> Self {
        Self {
            cfg,
            vault,
            breaker,
            pool,
            alerts: Mutex::new(AlertBook {
                last_sent: HashMap::new(),
                hour_started: Instant::now(),
                sent_this_hour: 0,
                recent: VecDeque::with_capacity(RECENT_ALERTS),
            }),
        }
    }

    /// Compose the full snapshot on demand.
    pub fn snapshot(&self) -> SystemHealth {
        let accounts = self.vault.list_all();
        let breakers = self.breaker.snapshot();
        let pools = self.pool.stats();

        let mut reports = Vec::with_capacity(accounts.len());
        for account in accounts {
            let circuit_state = breakers
                .get(&account.username)
                .map(|b| b.state)
                .unwrap_or(CircuitState::Closed);
            let pool = pools.get(&account.username).cloned().unwrap_or(PoolSnapshot {
                total: 0,
                idle: 0,
                active: 0,
                max: 0,
            });
            let success_rate = if account.total_attempts == 0 {
                1.0
            } else {
                account.successes as f64 / account.total_attempts as f64
            };

            let status = if !account.enabled {
                AccountHealth::Offline
            } else if circuit_state == CircuitState::Open {
                AccountHealth::Critical
            } else if circuit_state == CircuitState::HalfOpen
                || account.in_cooldown
                || (account.total_attempts >= 10 && success_rate < 0.5)
            {
                AccountHealth::Degraded
            } else {
                AccountHealth::Healthy
            };

            reports.push(AccountReport {
                available: matches!(status, AccountHealth::Healthy | AccountHealth::Degraded),
                username: account.username,
                priority: account.priority,
                circuit_state,
                pool,
                success_rate,
                last_success: account.last_success,
                last_failure: account.last_failure,
                status,
            });
        }

        let healthy = reports.iter().filter(|r| r.status == AccountHealth::Healthy).count();
        let degraded = reports.iter().filter(|r| r.status == AccountHealth::Degraded).count();
        let critical = reports.iter().filter(|r| r.status == AccountHealth::Critical).count();
        let offline = reports.iter().filter(|r| r.status == AccountHealth::Offline).count();

        let available = healthy + degraded;
        let overall = if available < self.cfg.min_available_accounts
            || healthy == 0
            || critical > 0
        {
            OverallStatus::Critical
        } else if degraded > healthy {
            OverallStatus::Degraded
        } else {
            OverallStatus::Healthy
        };

        let mut recommendations = Vec::new();
        for report in &reports {
            match report.status {
                AccountHealth::Critical => recommendations.push(format!(
                    "account `{}` circuit is open; investigate warehouse errors or unlock it",
                    report.username
                )),
                AccountHealth::Offline => recommendations.push(format!(
                    "account `{}` is offline; check credentials and connectivity",
                    report.username
                )),
                _ => {}
            }
        }
        if available == 0 {
            recommendations
                .push("no account is available; all warehouse traffic will fail".to_string());
        }

        let recent_alerts = {
            let book = self.alerts.lock().unwrap_or_else(|e| e.into_inner());
            book.recent.iter().cloned().collect()
        };

        SystemHealth {
            generated_at: Utc::now(),
            healthy,
            degraded,
            critical,
            offline,
            overall,
            recommendations,
            accounts: reports,
            recent_alerts,
        }
    }

    /// One poll tick: compose a snapshot and raise alerts on degradation.
    fn poll(&self) {
        let snapshot = self.snapshot();
        tracing::debug!(
            healthy = snapshot.healthy,
            degraded = snapshot.degraded,
            critical = snapshot.critical,
            offline = snapshot.offline,
            overall = ?snapshot.overall,
            "health poll"
        );
        if snapshot.overall == OverallStatus::Critical {
            self.raise(
                AlertSeverity::Critical,
                "system_critical",
                None,
                format!(
                    "system critical: {} healthy, {} degraded, {} critical, {} offline",
                    snapshot.healthy, snapshot.degraded, snapshot.critical, snapshot.offline
                ),
            );
        }
        for report in &snapshot.accounts {
            if report.status == AccountHealth::Offline {
                self.raise(
                    AlertSeverity::Critical,
                    "account_offline",
                    Some(&report.username),
                    format!("account `{}` is offline", report.username),
                );
            }
        }
    }

    fn on_breaker_event(&self, event: BreakerEvent) {
        if let BreakerEventKind::StateChange { from, to } = event.kind {
            match to {
                CircuitState::Open => self.raise(
                    AlertSeverity::Critical,
                    "circuit_open",
                    Some(&event.account),
                    format!("circuit opened for account `{}`", event.account),
                ),
                CircuitState::Closed if from != CircuitState::Closed => self.raise(
                    AlertSeverity::Warning,
                    "circuit_recovered",
                    Some(&event.account),
                    format!("circuit closed for account `{}`", event.account),
                ),
                _ => {}
            }
        }
    }

    /// Deliver an alert unless suppressed by the per-(kind, account)
    /// cooldown or the hourly ceiling.
    fn raise(&self, severity: AlertSeverity, kind: &str, account: Option<&str>, message: String) {
        let mut book = self.alerts.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();

        if now.duration_since(book.hour_started) >= Duration::from_secs(3600) {
            book.hour_started = now;
            book.sent_this_hour = 0;
        }
        if book.sent_this_hour >= self.cfg.max_alerts_per_hour {
            return;
        }
        let key = (kind.to_string(), account.unwrap_or("").to_string());
        if let Some(last) = book.last_sent.get(&key) {
            if now.duration_since(*last) < self.cfg.alert_cooldown {
                return;
            }
        }
        book.last_sent.insert(key, now);
        book.sent_this_hour += 1;

        let alert = Alert {
            severity,
            kind: kind.to_string(),
            account: account.map(str::to_owned),
            message,
            at: Utc::now(),
        };
        match severity {
            AlertSeverity::Critical => {
                tracing::error!(kind, account = ?alert.account, "{}", alert.message)
            }
            AlertSeverity::Warning => {
                tracing::warn!(kind, account = ?alert.account, "{}", alert.message)
            }
        }
        if book.recent.len() >= RECENT_ALERTS {
            book.recent.pop_front();
        }
        book.recent.push_back(alert);
    }

    /// Background loop: poll on the configured interval and consume breaker
    /// notifications as they arrive.
    pub fn start(
        self: Arc<Self>,
        mut breaker_events: mpsc::UnboundedReceiver<BreakerEvent>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.cfg.check_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => self.poll(),
                    event = breaker_events.recv() => match event {
                        Some(event) => self.on_breaker_event(event),
                        None => break,
                    },
                }
            }
        })
    }
}
