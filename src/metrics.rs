//! Per-tool metrics: monotonic counters and bounded latency reservoirs.
//!
//! Each tool keeps a count, an error count, and a sliding reservoir of its
//! most recent latencies; p50/p95/p99 are computed from the reservoir on
//! demand. Labels are the fixed tool names, nothing dynamic. A periodic
//! rollup line goes to the log.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// The fixed set of instrumented tools.
pub const TOOL_NAMES: &[&str] = &["log_event", "get_context", "submit_query", "log_insight"];

#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Recent latency samples retained per tool.
    pub reservoir_size: usize,
    pub rollup_interval: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            reservoir_size: 1000,
            rollup_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Percentiles {
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolSnapshot {
    pub tool: &'static str,
    pub count: u64,
    pub errors: u64,
    #[serde(flatten)]
    pub latency: Percentiles,
}

struct ToolMetrics {
    count: AtomicU64,
    errors: AtomicU64,
    reservoir: Mutex<VecDeque<u64>>,
}

impl ToolMetrics {
    fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            reservoir: Mutex::new(VecDeque::new()),
        }
    }
}

pub struct MetricsCore {
    cfg: MetricsConfig,
    tools: Vec<(&'static str, ToolMetrics)>,
}

impl MetricsCore {
    pub fn new(cfg: MetricsConfig) -> Self {
        Self {
            cfg,
            tools: TOOL_NAMES.iter().map(|name| (*name, ToolMetrics::new())).collect(),
        }
    }

    fn tool(&self, name: &str) -> Option<&ToolMetrics> {
        self.tools
            .iter()
            .find(|(tool, _)| *tool == name)
            .map(|(_, metrics)| metrics)
    }

    /// Record one call's latency and outcome.
    pub fn record(&self, tool: &str, latency: Duration, ok: bool) {
        let Some(metrics) = self.tool(tool) else {
            return;
        };
        metrics.count.fetch_add(1, Ordering::Relaxed);
        if !ok {
            metrics.errors.fetch_add(1, Ordering::Relaxed);
        }
        let mut reservoir = metrics.reservoir.lock().unwrap_or_else(|e| e.into_inner());
        if reservoir.len() >= self.cfg.reservoir_size {
            reservoir.pop_front();
        }
        reservoir.push_back(latency.as_micros() as u64);
    }

    /// Percentiles over the current reservoir.
    pub fn percentiles(&self, tool: &str) -> Percentiles {
        let Some(metrics) = self.tool(tool) else {
            return Percentiles::default();
        };
        let reservoir = metrics.reservoir.lock().unwrap_or_else(|e| e.into_inner());
        let mut samples: Vec<u64> = reservoir.iter().copied().collect();
        drop(reservoir);
        if samples.is_empty() {
            return Percentiles::default();
        }
        samples.sort_unstable();
        Percentiles {
            p50_ms: pick(&samples, 0.50),
            p95_ms: pick(&samples, 0.95),
            p99_ms: pick(&samples, 0.99),
        }
    }

    pub fn snapshot(&self) -> Vec<ToolSnapshot> {
        self.tools
            .iter()
            .map(|(tool, metrics)| ToolSnapshot {
                tool,
                count: metrics.count.load(Ordering::Relaxed),
                errors: metrics.errors.load(Ordering::Relaxed),
                latency: self.percentiles(tool),
            })
            .collect()
    }

    /// Periodic rollup to the log.
    pub fn spawn_rollup(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let metrics = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(metrics.cfg.rollup_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it.
            interval.tick().await;
            loop {
                interval.tick().await;
                for snap in metrics.snapshot() {
                    if snap.count == 0 {
                        continue;
                    }
                    tracing::info!(
                        tool = snap.tool,
                        count = snap.count,
                        errors = snap.errors,
                        p50_ms = snap.latency.p50_ms,
                        p95_ms = snap.latency.p95_ms,
                        p99_ms = snap.latency.p99_ms,
                        "tool metrics rollup"
                    );
                }
            }
        })
    }
}

fn pick(sorted: &[u64], quantile: f64) -> f64 {
    let index = ((sorted.len() as f64 * quantile).ceil() as usize)
        .saturating_sub(1)
        .min(sorted.len() - 1);
    sorted[index] as f64 / 1000.0
}
