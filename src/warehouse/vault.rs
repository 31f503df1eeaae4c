//! Credential vault: the priority-ordered warehouse account list.
//!
//! The vault owns per-account failure/cooldown bookkeeping and answers one
//! question: which account should the next call use. Circuit posture is the
//! breaker's business; callers pass an `allowed` predicate wired to
//! [`CircuitBreakerRegistry::can_execute`](super::breaker::CircuitBreakerRegistry)
//! so the two components stay independently testable.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::AccountConfig;
use crate::error::{RelayError, RelayResult};

#[derive(Debug, Clone)]
pub struct VaultConfig {
    /// Consecutive failures that put an account into cooldown.
    pub max_consecutive_failures: u32,
    /// First cooldown duration; doubles on repeated entries.
    pub base_cooldown: Duration,
    /// Ceiling for the doubling cooldown.
    pub max_cooldown: Duration,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 3,
            base_cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(300),
        }
    }
}

/// Reportable view of one account's bookkeeping.
#[derive(Debug, Clone, Serialize)]
pub struct AccountSnapshot {
    pub username: String,
    pub priority: u32,
    pub enabled: bool,
    pub in_cooldown: bool,
    pub cooldown_remaining_ms: u64,
    pub total_attempts: u64,
    pub successes: u64,
    pub consecutive_failures: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
}

struct AccountEntry {
    cfg: AccountConfig,
    total_attempts: u64,
    successes: u64,
    consecutive_failures: u32,
    last_success: Option<DateTime<Utc>>,
    last_failure: Option<DateTime<Utc>>,
    cooldown_until: Option<Instant>,
    next_backoff: Duration,
}

impl AccountEntry {
    fn in_cooldown(&self) -> bool {
        self.cooldown_until
            .map(|until| Instant::now() < until)
            .unwrap_or(false)
    }

    fn selectable(&self) -> bool {
        self.cfg.enabled && !self.in_cooldown()
    }

    fn snapshot(&self) -> AccountSnapshot {
        AccountSnapshot {
            username: self.cfg.username.clone(),
            priority: self.cfg.priority,
            enabled: self.cfg.enabled,
            in_cooldown: self.in_cooldown(),
            cooldown_remaining_ms: self
                .cooldown_until
                .and_then(|until| until.checked_duration_since(Instant::now()))
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            total_attempts: self.total_attempts,
            successes: self.successes,
            consecutive_failures: self.consecutive_failures,
            last_success: self.last_success,
            last_failure: self.last_failure,
        }
    }
}

/// In-memory account list, sorted by priority with stable tie-breaking.
pub struct CredentialVault {
    cfg: VaultConfig,
    accounts: Mutex<Vec<AccountEntry>>,
}

impl CredentialVault {
    pub fn new(accounts: Vec<AccountConfig>, cfg: VaultConfig) -> RelayResult<Self> {
        if accounts.is_empty() {
            return Err(RelayError::config("at least one warehouse account is required"));
        }
        let mut seen = std::collections::HashSet::new();
        for account in &accounts {
            if !seen.insert(account.username.clone()) {
                return Err(RelayError::config(format!(
                    "duplicate warehouse account `{}`",
                    account.username
                )));
            }
        }
        let base = cfg.base_cooldown;
        let mut entries: Vec<AccountEntry> = accounts
            .into_iter()
            .map(|cfg| AccountEntry {
                cfg,
                total_attempts: 0,
                successes: 0,
                consecutive_failures: 0,
                last_success: None,
                last_failure: None,
                cooldown_until: None,
                next_backoff: base,
            })
            .collect();
        // Stable sort keeps configuration order as the priority tie-breaker.
        entries.sort_by_key(|e| e.cfg.priority);
        Ok(Self {
            cfg,
            accounts: Mutex::new(entries),
        })
    }

    /// All selectable accounts in priority order, filtered by `allowed`
    /// (the breaker's `can_execute`).
    pub fn candidates(&self, allowed: impl Fn(&str) -> bool) -> Vec<AccountConfig> {
        let accounts = self.accounts.lock().unwrap_or_else(|e| e.into_inner());
        accounts
            .iter()
            .filter(|e| e.selectable() && allowed(&e.cfg.username))
            .map(|e| e.cfg.clone())
            .collect()
    }

    /// Lowest-priority-rank selectable account, or none when every account
    /// is disabled, cooling down, or blocked by its breaker.
    pub fn next(&self, allowed: impl Fn(&str) -> bool) -> Option<AccountConfig> {
        self.candidates(allowed).into_iter().next()
    }

    /// Look up an account by username regardless of selectability.
    pub fn get(&self, username: &str) -> Option<AccountConfig> {
        let accounts = self.accounts.lock().unwrap_or_else(|e| e.into_inner());
        accounts
            .iter()
            .find(|e| e.cfg.username == username)
            .map(|e| e.cfg.clone())
    }

    pub fn record_success(&self, username: &str) {
        let mut accounts = self.accounts.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = accounts.iter_mut().find(|e| e.cfg.username == username) {
            entry.total_attempts += 1;
            entry.successes += 1;
            entry.consecutive_failures = 0;
            entry.last_success = Some(Utc::now());
            entry.cooldown_until = None;
            entry.next_backoff = self.cfg.base_cooldown;
        }
    }

    pub fn record_failure(&self, username: &str, reason: &str) {
        let mut accounts = self.accounts.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = accounts.iter_mut().find(|e| e.cfg.username == username) {
            entry.total_attempts += 1;
            entry.consecutive_failures += 1;
            entry.last_failure = Some(Utc::now());
            if entry.consecutive_failures >= self.cfg.max_consecutive_failures {
                let backoff = entry.next_backoff;
                entry.cooldown_until = Some(Instant::now() + backoff);
                entry.next_backoff = (entry.next_backoff * 2).min(self.cfg.max_cooldown);
                tracing::warn!(
                    account = username,
                    consecutive = entry.consecutive_failures,
                    cooldown_ms = backoff.as_millis() as u64,
                    reason,
                    "account entering cooldown"
                );
            } else {
                tracing::debug!(
                    account = username,
                    consecutive = entry.consecutive_failures,
                    reason,
                    "account failure recorded"
                );
            }
        }
    }

    /// Admin path: clear cooldown and failure counters.
    pub fn unlock(&self, username: &str) -> bool {
        let mut accounts = self.accounts.lock().unwrap_or_else(|e| e.into_inner());
        match accounts.iter_mut().find(|e| e.cfg.username == username) {
            Some(entry) => {
                entry.cooldown_until = None;
                entry.consecutive_failures = 0;
                entry.next_backoff = self.cfg.base_cooldown;
                tracing::info!(account = username, "account unlocked");
                true
            }
            None => false,
        }
    }

    /// Force selection away from the current preferred account by putting it
    /// into one base cooldown. Returns the username now preferred.
    pub fn rotate(&self, allowed: impl Fn(&str) -> bool) -> Option<String> {
        let current = self.next(&allowed)?;
        {
            let mut accounts = self.accounts.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = accounts
                .iter_mut()
                .find(|e| e.cfg.username == current.username)
            {
                entry.cooldown_until = Some(Instant::now() + self.cfg.base_cooldown);
            }
        }
        tracing::info!(from = %current.username, "credential rotation requested");
        self.next(&allowed).map(|a| a.username)
    }

    pub fn list_all(&self) -> Vec<AccountSnapshot> {
        let accounts = self.accounts.lock().unwrap_or_else(|e| e.into_inner());
        accounts.iter().map(AccountEntry::snapshot).collect()
    }

    pub fn list_active(&self) -> Vec<AccountSnapshot> {
        let accounts = self.accounts.lock().unwrap_or_else(|e| e.into_inner());
        accounts
            .iter()
            .filter(|e| e.selectable())
            .map(AccountEntry::snapshot)
            .collect()
    }
}
