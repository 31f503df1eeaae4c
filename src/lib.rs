//! actrelay - activity-telemetry middleware for an LLM desktop assistant.
//!
//! Sits between a desktop client and a Snowflake-shaped warehouse and
//! exposes a small set of tools: append an activity event, fetch customer
//! context, submit an analytic query ticket, append a structured insight.
//! Low tail latency on the hot read/write paths, strong durability on the
//! write path.
//!
//! Architecture:
//! - Tool dispatcher (axum surface): validates calls and composes the rest
//! - Event log: buffered, rotating append-only JSONL segments on disk
//! - Context cache: bounded LRU with a negative-lookup filter
//! - Connection layer: priority-ordered accounts, per-account circuit
//!   breakers and pools, template-only SQL
//! - Ticket scheduler: bounded-concurrency async warehouse queries

pub mod cache;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod eventlog;
pub mod events;
pub mod metrics;
pub mod scheduler;
pub mod server;
pub mod tag;
pub mod templates;
pub mod warehouse;

pub use config::Config;
pub use error::{RelayError, RelayResult};
