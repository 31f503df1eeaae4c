//! Asynchronous query-ticket scheduler.
//!
//! `submit_query` registers a ticket; a dispatch loop runs up to
//! `max_concurrent` tickets against the warehouse through the connection
//! layer; a scavenger reaps terminal tickets after the retention window.
//! Ticket state only moves forward: `pending → running → {completed |
//! failed | cancelled}`, and a terminal state is never replaced.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::{RelayError, RelayResult};
use crate::tag::TagGenerator;
use crate::templates::TemplateRegistry;
use crate::warehouse::{ConnectionLayer, QueryResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TicketState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Server-side handle for one asynchronous warehouse query.
#[derive(Debug, Clone, Serialize)]
pub struct Ticket {
    pub id: String,
    pub state: TicketState,
    pub template: String,
    /// Validated parameter vector, bound at execution time.
    pub params: Vec<Value>,
    pub byte_cap: Option<usize>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Result document on completion, mutually exclusive with `error`.
    pub result: Option<Value>,
    pub error: Option<String>,
    pub result_bytes: usize,
    #[serde(skip)]
    terminal_at: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrent: usize,
    /// Per-execution warehouse deadline.
    pub deadline: Duration,
    /// How long terminal tickets stay queryable.
    pub retention: Duration,
    /// Bytes reserved under the cap for the truncation marker.
    pub headroom: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            deadline: Duration::from_secs(30),
            retention: Duration::from_secs(3600),
            headroom: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub tickets: usize,
    pub pending: usize,
    pub running: usize,
}

struct SchedInner {
    tickets: HashMap<String, Ticket>,
    queue: VecDeque<String>,
    running: HashSet<String>,
}

pub struct TicketScheduler {
    cfg: SchedulerConfig,
    layer: Arc<dyn ConnectionLayer>,
    registry: Arc<TemplateRegistry>,
    tags: TagGenerator,
    inner: Mutex<SchedInner>,
    wake: Arc<Notify>,
    closed: AtomicBool,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl TicketScheduler {
    pub fn new(
        cfg: SchedulerConfig,
        layer: Arc<dyn ConnectionLayer>,
        registry: Arc<TemplateRegistry>,
        tags: TagGenerator,
    ) -> Self {
        Self {
            cfg,
            layer,
            registry,
            tags,
            inner: Mutex::new(SchedInner {
                tickets: HashMap::new(),
                queue: VecDeque::new(),
                running: HashSet::new(),
            }),
            wake: Arc::new(Notify::new()),
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Start the dispatch loop and the scavenger.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());

        let scheduler = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            scheduler.dispatch_loop().await;
        }));

        let scheduler = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if scheduler.closed.load(Ordering::Relaxed) {
                    break;
                }
                scheduler.scavenge();
            }
        }));
    }

    /// Register a ticket. Parameters are validated eagerly so a malformed
    /// call fails at submission, not minutes later in the dispatch loop.
    pub fn create(
        &self,
        template: &str,
        params: Vec<Value>,
        byte_cap: Option<usize>,
    ) -> RelayResult<Ticket> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(RelayError::warehouse("scheduler is shut down"));
        }
        let registered = self.registry.get(template).ok_or_else(|| {
            RelayError::validation("templateName", format!("unknown template `{template}`"))
        })?;
        let validated = registered.validate(&params)?;

        let ticket = Ticket {
            id: Uuid::new_v4().to_string(),
            state: TicketState::Pending,
            template: template.to_string(),
            params: validated,
            byte_cap,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            result_bytes: 0,
            terminal_at: None,
        };

        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.queue.push_back(ticket.id.clone());
            inner.tickets.insert(ticket.id.clone(), ticket.clone());
        }
        self.wake.notify_one();
        tracing::debug!(ticket = %ticket.id, template, "ticket created");
        Ok(ticket)
    }

    pub fn status(&self, id: &str) -> Option<Ticket> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.tickets.get(id).cloned()
    }

    /// Cancel a ticket. Succeeds only while it is still pending; a
    /// cancelled ticket is never executed.
    pub fn cancel(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(ticket) = inner.tickets.get_mut(id) else {
            return false;
        };
        if ticket.state != TicketState::Pending {
            return false;
        }
        ticket.state = TicketState::Cancelled;
        ticket.completed_at = Some(Utc::now());
        ticket.terminal_at = Some(Instant::now());
        inner.queue.retain(|queued| queued != id);
        tracing::debug!(ticket = %id, "ticket cancelled");
        true
    }

    pub fn stats(&self) -> SchedulerStats {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        SchedulerStats {
            tickets: inner.tickets.len(),
            pending: inner.queue.len(),
            running: inner.running.len(),
        }
    }

    /// Stop the loops. Running executions finish on their own tasks but
    /// no further tickets are dispatched.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.wake.notify_waiters();
        let tasks = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *tasks)
        };
        for task in tasks {
            task.abort();
        }
    }

    async fn dispatch_loop(self: Arc<Self>) {
        loop {
            if self.closed.load(Ordering::Relaxed) {
                break;
            }
            while let Some(ticket) = self.claim_next() {
                let scheduler = Arc::clone(&self);
                tokio::spawn(async move {
                    scheduler.run_ticket(ticket).await;
                });
            }
            // Woken by create/completion; the timeout covers lost wakeups.
            let _ = tokio::time::timeout(Duration::from_millis(250), self.wake.notified()).await;
        }
    }

    /// Pop the next pending ticket and mark it running, respecting the
    /// concurrency bound. Skips ids whose tickets were cancelled in queue.
    fn claim_next(&self) -> Option<Ticket> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.running.len() >= self.cfg.max_concurrent {
            return None;
        }
        while let Some(id) = inner.queue.pop_front() {
            let Some(ticket) = inner.tickets.get_mut(&id) else {
                continue;
            };
            if ticket.state != TicketState::Pending {
                continue;
            }
            ticket.state = TicketState::Running;
            ticket.started_at = Some(Utc::now());
            let claimed = ticket.clone();
            inner.running.insert(id);
            return Some(claimed);
        }
        None
    }

    async fn run_ticket(&self, ticket: Ticket) {
        let tag = self.tags.generate();
        let outcome = self
            .layer
            .execute_template(&ticket.template, &ticket.params, self.cfg.deadline, &tag)
            .await;

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.running.remove(&ticket.id);
        if let Some(stored) = inner.tickets.get_mut(&ticket.id) {
            // A ticket transitions to a terminal state exactly once.
            if stored.state == TicketState::Running {
                match outcome {
                    Ok(result) => {
                        let (document, bytes) =
                            cap_result(result, ticket.byte_cap, self.cfg.headroom);
                        stored.state = TicketState::Completed;
                        stored.result = Some(document);
                        stored.result_bytes = bytes;
                    }
                    Err(e) => {
                        tracing::warn!(ticket = %ticket.id, error = %e, "ticket execution failed");
                        stored.state = TicketState::Failed;
                        stored.error = Some(e.to_string());
                    }
                }
                stored.completed_at = Some(Utc::now());
                stored.terminal_at = Some(Instant::now());
            }
        }
        drop(inner);
        self.wake.notify_one();
    }

    fn scavenge(&self) {
        let retention = self.cfg.retention;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let before = inner.tickets.len();
        inner.tickets.retain(|_, ticket| {
            !(ticket.state.is_terminal()
                && ticket
                    .terminal_at
                    .map(|t| t.elapsed() >= retention)
                    .unwrap_or(false))
        });
        let reaped = before - inner.tickets.len();
        if reaped > 0 {
            tracing::debug!(reaped, "reaped terminal tickets");
        }
    }
}

/// Apply the byte cap: drop rows from the tail until the serialized row
/// list fits under `cap - headroom`, and attach a truncation marker with
/// the original and returned row counts.
fn cap_result(result: QueryResult, byte_cap: Option<usize>, headroom: usize) -> (Value, usize) {
    let original_rows = result.row_count;
    let original_bytes = result.bytes;
    let mut rows = result.rows;

    let truncated = match byte_cap {
        Some(cap) if original_bytes > cap => {
            // Keep a prefix of rows whose serialized array stays under the
            // cap minus headroom: brackets plus per-row bytes and commas.
            let target = cap.saturating_sub(headroom);
            let mut size = 2usize;
            let mut keep = 0usize;
            for row in &rows {
                let row_bytes = serde_json::to_string(row).map(|s| s.len()).unwrap_or(0);
                let separator = if keep == 0 { 0 } else { 1 };
                if size + row_bytes + separator > target {
                    break;
                }
                size += row_bytes + separator;
                keep += 1;
            }
            rows.truncate(keep);
            true
        }
        _ => false,
    };

    let returned = rows.len();
    let document = json!({
        "rows": rows,
        "returned_row_count": returned,
        "truncated": truncated,
        "original_row_count": original_rows,
        "original_bytes": original_bytes,
    });
    let bytes = serde_json::to_string(&document).map(|s| s.len()).unwrap_or(0);
    (document, bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WarehouseObjects;
    use crate::templates::names;
    use crate::warehouse::conn::WarehouseConn;
    use crate::warehouse::LayerStats;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Layer that returns a fixed row set after an optional delay.
    struct StaticLayer {
        rows: Vec<Value>,
        delay: Duration,
        fail: bool,
        executions: AtomicUsize,
        peak_concurrent: AtomicUsize,
        current: AtomicUsize,
    }

    impl StaticLayer {
        fn new(rows: Vec<Value>) -> Arc<Self> {
            Arc::new(Self {
                rows,
                delay: Duration::ZERO,
                fail: false,
                executions: AtomicUsize::new(0),
                peak_concurrent: AtomicUsize::new(0),
                current: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ConnectionLayer for StaticLayer {
        async fn initialize(&self) -> RelayResult<()> {
            Ok(())
        }
        async fn acquire(&self, _preferred: Option<&str>) -> RelayResult<WarehouseConn> {
            unreachable!("tests execute through execute_template")
        }
        fn release(&self, _conn: WarehouseConn) {}
        async fn execute_template(
            &self,
            _name: &str,
            _params: &[Value],
            _deadline: Duration,
            _tag: &str,
        ) -> RelayResult<QueryResult> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_concurrent.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.current.fetch_sub(1, Ordering::SeqCst);
            self.executions.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(RelayError::warehouse("scripted failure"))
            } else {
                Ok(QueryResult::from_rows(self.rows.clone()))
            }
        }
        async fn close(&self) {}
        fn stats(&self) -> LayerStats {
            LayerStats {
                pools: HashMap::new(),
                accounts: Vec::new(),
            }
        }
    }

    fn scheduler_with(layer: Arc<StaticLayer>, cfg: SchedulerConfig) -> Arc<TicketScheduler> {
        let registry = Arc::new(TemplateRegistry::builtin(&WarehouseObjects::default()).unwrap());
        Arc::new(TicketScheduler::new(
            cfg,
            layer,
            registry,
            TagGenerator::new().unwrap(),
        ))
    }

    async fn wait_terminal(scheduler: &TicketScheduler, id: &str) -> Ticket {
        for _ in 0..200 {
            if let Some(ticket) = scheduler.status(id) {
                if ticket.state.is_terminal() {
                    return ticket;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("ticket {id} never reached a terminal state");
    }

    #[tokio::test]
    async fn test_ticket_lifecycle_completes() {
        let layer = StaticLayer::new(vec![json!({"activity": "cdesk.user_asked"})]);
        let scheduler = scheduler_with(Arc::clone(&layer), SchedulerConfig::default());
        scheduler.start();

        let ticket = scheduler
            .create(names::READ_CONTEXT, vec![json!("customer_1")], None)
            .unwrap();
        assert_eq!(ticket.state, TicketState::Pending);

        let done = wait_terminal(&scheduler, &ticket.id).await;
        assert_eq!(done.state, TicketState::Completed);
        let result = done.result.unwrap();
        assert_eq!(result["returned_row_count"], 1);
        assert_eq!(result["truncated"], false);
        assert!(done.started_at.is_some());
        assert!(done.completed_at.is_some());
        scheduler.close();
    }

    #[tokio::test]
    async fn test_failed_execution_marks_failed_with_error_text() {
        let mut inner = StaticLayer::new(vec![]);
        Arc::get_mut(&mut inner).unwrap().fail = true;
        let scheduler = scheduler_with(Arc::clone(&inner), SchedulerConfig::default());
        scheduler.start();

        let ticket = scheduler
            .create(names::READ_CONTEXT, vec![json!("customer_1")], None)
            .unwrap();
        let done = wait_terminal(&scheduler, &ticket.id).await;
        assert_eq!(done.state, TicketState::Failed);
        assert!(done.error.unwrap().contains("scripted failure"));
        assert!(done.result.is_none());
        scheduler.close();
    }

    #[tokio::test]
    async fn test_cancel_pending_ticket_prevents_execution() {
        let layer = StaticLayer::new(vec![json!({"a": 1})]);
        let scheduler = scheduler_with(Arc::clone(&layer), SchedulerConfig::default());
        // Loop not started: the ticket stays pending while we cancel it.
        let ticket = scheduler
            .create(names::READ_CONTEXT, vec![json!("customer_1")], None)
            .unwrap();
        assert!(scheduler.cancel(&ticket.id));
        scheduler.start();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let status = scheduler.status(&ticket.id).unwrap();
        assert_eq!(status.state, TicketState::Cancelled);
        assert_eq!(layer.executions.load(Ordering::SeqCst), 0);
        // Cancel is not idempotent once terminal.
        assert!(!scheduler.cancel(&ticket.id));
        scheduler.close();
    }

    #[tokio::test]
    async fn test_concurrency_stays_within_bound() {
        let mut layer = StaticLayer::new(vec![json!({"a": 1})]);
        Arc::get_mut(&mut layer).unwrap().delay = Duration::from_millis(50);
        let scheduler = scheduler_with(
            Arc::clone(&layer),
            SchedulerConfig {
                max_concurrent: 2,
                ..SchedulerConfig::default()
            },
        );
        scheduler.start();

        let ids: Vec<String> = (0..6)
            .map(|_| {
                scheduler
                    .create(names::READ_CONTEXT, vec![json!("customer_1")], None)
                    .unwrap()
                    .id
            })
            .collect();
        for id in &ids {
            wait_terminal(&scheduler, id).await;
        }
        assert_eq!(layer.executions.load(Ordering::SeqCst), 6);
        assert!(layer.peak_concurrent.load(Ordering::SeqCst) <= 2);
        scheduler.close();
    }

    #[tokio::test]
    async fn test_byte_cap_truncates_with_marker() {
        let rows: Vec<Value> = (0..10_000)
            .map(|i| json!({"id": i, "payload": "xxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx"}))
            .collect();
        let layer = StaticLayer::new(rows);
        let scheduler = scheduler_with(layer, SchedulerConfig::default());
        scheduler.start();

        let ticket = scheduler
            .create(
                names::READ_CONTEXT,
                vec![json!("customer_1")],
                Some(10_000),
            )
            .unwrap();
        let done = wait_terminal(&scheduler, &ticket.id).await;
        assert_eq!(done.state, TicketState::Completed);
        let result = done.result.unwrap();
        assert_eq!(result["truncated"], true);
        assert_eq!(result["original_row_count"], 10_000);
        let returned = result["returned_row_count"].as_u64().unwrap();
        assert!(returned < 10_000);
        let rows_bytes = serde_json::to_string(&result["rows"]).unwrap().len();
        assert!(rows_bytes <= 10_000 - 200, "rows serialize to {rows_bytes}");
        scheduler.close();
    }

    #[tokio::test]
    async fn test_unknown_template_rejected_at_create() {
        let layer = StaticLayer::new(vec![]);
        let scheduler = scheduler_with(layer, SchedulerConfig::default());
        let err = scheduler
            .create("no_such_template", vec![], None)
            .unwrap_err();
        assert_eq!(err.kind(), "ValidationError");
    }

    #[tokio::test]
    async fn test_scavenger_reaps_old_terminal_tickets() {
        let layer = StaticLayer::new(vec![json!({"a": 1})]);
        let scheduler = scheduler_with(
            layer,
            SchedulerConfig {
                retention: Duration::from_millis(20),
                ..SchedulerConfig::default()
            },
        );
        scheduler.start();
        let ticket = scheduler
            .create(names::READ_CONTEXT, vec![json!("customer_1")], None)
            .unwrap();
        wait_terminal(&scheduler, &ticket.id).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        scheduler.scavenge();
        assert!(scheduler.status(&ticket.id).is_none());
        scheduler.close();
    }
}
