//! Error taxonomy surfaced to tool callers and operators.
//!
//! Every failure that crosses a component boundary is a [`RelayError`]. The
//! variants map one-to-one onto the wire-level `kind` strings, and each knows
//! whether the caller may retry. Internal-only variants (`NoCapacity`) never
//! reach the tool boundary; the connection layer consumes them during
//! account failover.

use thiserror::Error;

/// Convenient result type for relay operations.
pub type RelayResult<T> = std::result::Result<T, RelayError>;

/// Errors that can occur while handling a tool call or warehouse operation.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Input violates a tool schema or a template validator.
    #[error("validation failed for `{param}`: {message}")]
    Validation {
        /// The offending parameter (tool field or template bind position).
        param: String,
        message: String,
    },

    /// Misconfiguration detected at startup or in the template registry.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// The event log's in-memory pending bound was reached.
    #[error("event log full: {pending} pending records (limit {limit})")]
    Backpressure { pending: usize, limit: usize },

    /// A warehouse call or connection acquire exceeded its deadline.
    #[error("{operation} exceeded deadline of {deadline_ms}ms")]
    Timeout {
        operation: &'static str,
        deadline_ms: u64,
    },

    /// Every account is open-circuit, locked, or disabled.
    #[error("no warehouse account is currently available")]
    NoAvailableAccount,

    /// The selected account is blocked by its circuit breaker. Failover
    /// normally consumes this; it surfaces only when all accounts are open.
    #[error("circuit open for account `{account}`")]
    CircuitOpen { account: String },

    /// A single pool is at ceiling with no idle connection. Internal:
    /// triggers failover to the next account, never surfaced to callers.
    #[error("pool for account `{account}` has no idle capacity")]
    NoCapacity { account: String },

    /// The warehouse returned an error. Carries the warehouse's error text,
    /// never raw SQL.
    #[error("warehouse error: {message}")]
    Warehouse { message: String },

    /// Disk full or unwritable on the event log path.
    #[error("event log I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl RelayError {
    pub fn validation(param: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            param: param.into(),
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn timeout(operation: &'static str, deadline_ms: u64) -> Self {
        Self::Timeout {
            operation,
            deadline_ms,
        }
    }

    pub fn warehouse(message: impl Into<String>) -> Self {
        Self::Warehouse {
            message: message.into(),
        }
    }

    /// Wire-level error kind, stable across releases.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "ValidationError",
            Self::Config { .. } => "ConfigError",
            Self::Backpressure { .. } => "BackpressureError",
            Self::Timeout { .. } => "TimeoutError",
            Self::NoAvailableAccount => "NoAvailableAccount",
            Self::CircuitOpen { .. } => "CircuitOpen",
            Self::NoCapacity { .. } => "NoCapacityError",
            Self::Warehouse { .. } => "WarehouseError",
            Self::Io { .. } => "IOError",
        }
    }

    /// Whether the caller may retry the operation.
    ///
    /// `Warehouse` errors report retryable because the caller cannot tell a
    /// transient warehouse failure from a permanent one; the error text is
    /// passed through for inspection.
    pub fn retryable(&self) -> bool {
        match self {
            Self::Validation { .. } | Self::Config { .. } => false,
            Self::Backpressure { .. }
            | Self::Timeout { .. }
            | Self::NoAvailableAccount
            | Self::CircuitOpen { .. }
            | Self::NoCapacity { .. }
            | Self::Warehouse { .. }
            | Self::Io { .. } => true,
        }
    }

    /// Internal errors are consumed by the failover loop and must never
    /// reach the tool boundary.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::NoCapacity { .. })
    }
}
