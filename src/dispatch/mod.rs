//! Tool dispatcher: the sole entry point exposed to the desktop client.
//!
//! Four tools, each wrapped by the same discipline: schema validation,
//! correlation-tag allocation, execution, a latency sample into the
//! metrics core (with a warning past the tool's budget), and a normalized
//! response shape.

use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cache::ContextCache;
use crate::config::{ToolBudgets, SOURCE_SYSTEM, VERSION};
use crate::error::{RelayError, RelayResult};
use crate::eventlog::EventLog;
use crate::events::{normalize_activity, ActivityEvent};
use crate::metrics::MetricsCore;
use crate::scheduler::{Ticket, TicketScheduler};
use crate::tag::TagGenerator;
use crate::templates::{names, validators, TemplateRegistry};
use crate::warehouse::{ConnectionLayer, SystemHealth};

// ─────────────────────────────────────────────────────────────────────────────
// Tool request schemas
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct LogEventRequest {
    pub activity: String,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub link: Option<String>,
    /// Customer attribution; defaults to the configured desktop user.
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub revenue_impact: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetContextRequest {
    pub customer_key: String,
    #[serde(default)]
    pub max_bytes: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitQueryRequest {
    pub template_name: String,
    #[serde(default)]
    pub params: Vec<Value>,
    #[serde(default)]
    pub byte_cap: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogInsightRequest {
    pub subject: String,
    pub metric: String,
    pub value: f64,
    pub provenance_hash: String,
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub budgets: ToolBudgets,
    /// Customer key attributed to events that do not name one.
    pub default_customer: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            budgets: ToolBudgets::default(),
            default_customer: "local_user".to_string(),
        }
    }
}

pub struct ToolDispatcher {
    cfg: DispatcherConfig,
    tags: TagGenerator,
    registry: Arc<TemplateRegistry>,
    layer: Arc<dyn ConnectionLayer>,
    log: Arc<EventLog>,
    cache: Arc<ContextCache>,
    scheduler: Arc<TicketScheduler>,
    metrics: Arc<MetricsCore>,
}

impl ToolDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: DispatcherConfig,
        tags: TagGenerator,
        registry: Arc<TemplateRegistry>,
        layer: Arc<dyn ConnectionLayer>,
        log: Arc<EventLog>,
        cache: Arc<ContextCache>,
        scheduler: Arc<TicketScheduler>,
        metrics: Arc<MetricsCore>,
    ) -> Self {
        Self {
            cfg,
            tags,
            registry,
            layer,
            log,
            cache,
            scheduler,
            metrics,
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Tools
    // ─────────────────────────────────────────────────────────────────────

    /// `log_event`: append one activity event to the durable log.
    pub async fn log_event(&self, request: LogEventRequest) -> RelayResult<Value> {
        let start = Instant::now();
        let result = self.log_event_inner(request).await;
        self.finish("log_event", start, self.cfg.budgets.log_event, &result);
        result
    }

    async fn log_event_inner(&self, request: LogEventRequest) -> RelayResult<Value> {
        // Un-namespaced activities are rewritten, never rejected.
        let activity = normalize_activity(&request.activity)?;
        let customer = request
            .customer
            .unwrap_or_else(|| self.cfg.default_customer.clone());
        validators::identifier(&[json!(customer)], 0, "customer")?;
        if let Some(link) = &request.link {
            validators::url(&[json!(link)], 0, "link")?;
        }
        if let Some(session) = &request.session_id {
            validators::identifier(&[json!(session)], 0, "session_id")?;
        }
        if let Some(revenue) = request.revenue_impact {
            validators::finite_number(&[json!(revenue)], 0, "revenue_impact")?;
        }
        let metadata = match request.metadata {
            Some(doc) => validators::json_doc(&[doc], 0, "metadata")?,
            None => Value::Null,
        };

        let tag = self.tags.generate();
        let mut event = ActivityEvent::new(activity, customer, tag.clone());
        event.metadata = metadata;
        event.link = request.link;
        event.session_id = request.session_id;
        event.revenue_impact = request.revenue_impact;
        let event_id = event.id.clone();

        self.log.append(event)?;
        Ok(json!({ "ok": true, "eventId": event_id, "tag": tag }))
    }

    /// `get_context`: cached customer context, warehouse-backed on miss.
    pub async fn get_context(&self, request: GetContextRequest) -> RelayResult<Value> {
        let start = Instant::now();
        let result = self.get_context_inner(request, start).await;
        self.finish("get_context", start, self.cfg.budgets.get_context, &result);
        result
    }

    async fn get_context_inner(
        &self,
        request: GetContextRequest,
        start: Instant,
    ) -> RelayResult<Value> {
        validators::identifier(&[json!(request.customer_key)], 0, "customerKey")?;
        let tag = self.tags.generate();

        if let Some(entry) = self.cache.get(&request.customer_key) {
            return Ok(self.context_response(
                &request.customer_key,
                Some(entry.document),
                true,
                request.max_bytes,
                &tag,
            ));
        }

        // One warehouse read, bounded by what is left of the budget.
        let budget = self.cfg.budgets.get_context;
        let remaining = budget.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            return Err(RelayError::timeout("get_context", budget.as_millis() as u64));
        }
        let result = self
            .layer
            .execute_template(
                names::READ_CONTEXT,
                &[json!(request.customer_key)],
                remaining,
                &tag,
            )
            .await?;

        let document = result.rows.first().map(|row| {
            let blob = &row["context_blob"];
            // The warehouse hands documents back as serialized text.
            match blob.as_str() {
                Some(text) => serde_json::from_str(text).unwrap_or_else(|_| blob.clone()),
                None => blob.clone(),
            }
        });
        if let Some(doc) = &document {
            // Only a successful fetch writes to the cache.
            self.cache.set(&request.customer_key, doc.clone());
        }
        Ok(self.context_response(
            &request.customer_key,
            document,
            false,
            request.max_bytes,
            &tag,
        ))
    }

    fn context_response(
        &self,
        customer: &str,
        document: Option<Value>,
        cached: bool,
        max_bytes: Option<usize>,
        tag: &str,
    ) -> Value {
        let Some(document) = document else {
            return json!({
                "customer": customer,
                "context": Value::Null,
                "cached": cached,
                "truncated": false,
                "tag": tag,
            });
        };

        let serialized = document.to_string();
        match max_bytes {
            Some(cap) if serialized.len() > cap => {
                // Back the cut off to a character boundary so the preview
                // stays valid UTF-8.
                let mut cut = cap;
                while cut > 0 && !serialized.is_char_boundary(cut) {
                    cut -= 1;
                }
                let preview = &serialized[..cut];
                json!({
                    "customer": customer,
                    "context": Value::Null,
                    "contextPreview": preview,
                    "cached": cached,
                    "truncated": true,
                    "originalBytes": serialized.len(),
                    "tag": tag,
                })
            }
            _ => json!({
                "customer": customer,
                "context": document,
                "cached": cached,
                "truncated": false,
                "tag": tag,
            }),
        }
    }

    /// `submit_query`: register an asynchronous analytic query ticket.
    pub async fn submit_query(&self, request: SubmitQueryRequest) -> RelayResult<Value> {
        let start = Instant::now();
        let result = self.submit_query_inner(request).await;
        self.finish("submit_query", start, self.cfg.budgets.submit_query, &result);
        result
    }

    async fn submit_query_inner(&self, request: SubmitQueryRequest) -> RelayResult<Value> {
        if !self.registry.contains(&request.template_name) {
            return Err(RelayError::validation(
                "templateName",
                format!("unknown template `{}`", request.template_name),
            ));
        }
        let ticket =
            self.scheduler
                .create(&request.template_name, request.params, request.byte_cap)?;
        Ok(json!({ "ticketId": ticket.id, "state": ticket.state }))
    }

    /// `log_insight`: record a structured metric observation as an
    /// `insight_recorded` event.
    pub async fn log_insight(&self, request: LogInsightRequest) -> RelayResult<Value> {
        let start = Instant::now();
        let result = self.log_insight_inner(request).await;
        self.finish("log_insight", start, self.cfg.budgets.log_insight, &result);
        result
    }

    async fn log_insight_inner(&self, request: LogInsightRequest) -> RelayResult<Value> {
        validators::identifier(&[json!(request.subject)], 0, "subject")?;
        validators::identifier(&[json!(request.metric)], 0, "metric")?;
        validators::finite_number(&[json!(request.value)], 0, "value")?;
        validators::hex16(&[json!(request.provenance_hash)], 0, "provenanceHash")?;

        let tag = self.tags.generate();
        let mut event = ActivityEvent::new(
            "cdesk.insight_recorded".to_string(),
            self.cfg.default_customer.clone(),
            tag.clone(),
        );
        event.metadata = json!({
            "subject": request.subject,
            "metric": request.metric,
            "value": request.value,
            "provenance_hash": request.provenance_hash,
            "source_system": SOURCE_SYSTEM,
            "source_version": VERSION,
        });
        let event_id = event.id.clone();

        self.log.append(event)?;
        Ok(json!({ "ok": true, "eventId": event_id, "tag": tag }))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Admin and polling surface
    // ─────────────────────────────────────────────────────────────────────

    pub fn health(&self) -> Option<SystemHealth> {
        self.layer.health()
    }

    pub fn unlock_account(&self, username: &str) -> bool {
        self.layer.unlock(username)
    }

    pub fn rotate_credentials(&self) -> Option<String> {
        self.layer.rotate()
    }

    pub fn ticket_status(&self, id: &str) -> Option<Ticket> {
        self.scheduler.status(id)
    }

    pub fn cancel_ticket(&self, id: &str) -> bool {
        self.scheduler.cancel(id)
    }

    /// Aggregate stats across subsystems for the admin surface.
    pub fn stats(&self) -> Value {
        json!({
            "eventlog": self.log.stats(),
            "cache": self.cache.stats(),
            "scheduler": self.scheduler.stats(),
            "warehouse": self.layer.stats(),
            "tools": self.metrics.snapshot(),
        })
    }

    fn finish<T>(&self, tool: &str, start: Instant, budget: Duration, result: &RelayResult<T>) {
        let elapsed = start.elapsed();
        self.metrics.record(tool, elapsed, result.is_ok());
        if elapsed > budget {
            tracing::warn!(
                tool,
                elapsed_ms = elapsed.as_millis() as u64,
                budget_ms = budget.as_millis() as u64,
                "tool exceeded its latency budget"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::config::WarehouseObjects;
    use crate::eventlog::EventLogConfig;
    use crate::metrics::MetricsConfig;
    use crate::scheduler::SchedulerConfig;
    use crate::warehouse::conn::WarehouseConn;
    use crate::warehouse::{LayerStats, QueryResult};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Connection layer that serves a canned context row.
    struct FakeLayer {
        calls: AtomicUsize,
        row: Option<Value>,
    }

    impl FakeLayer {
        fn with_row(row: Value) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                row: Some(row),
            })
        }

        fn empty() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                row: None,
            })
        }
    }

    #[async_trait]
    impl ConnectionLayer for FakeLayer {
        async fn initialize(&self) -> RelayResult<()> {
            Ok(())
        }
        async fn acquire(&self, _preferred: Option<&str>) -> RelayResult<WarehouseConn> {
            unreachable!("dispatcher goes through execute_template")
        }
        fn release(&self, _conn: WarehouseConn) {}
        async fn execute_template(
            &self,
            _name: &str,
            _params: &[Value],
            _deadline: Duration,
            _tag: &str,
        ) -> RelayResult<QueryResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(QueryResult::from_rows(
                self.row.clone().into_iter().collect(),
            ))
        }
        async fn close(&self) {}
        fn stats(&self) -> LayerStats {
            LayerStats {
                pools: HashMap::new(),
                accounts: Vec::new(),
            }
        }
    }

    struct Harness {
        dispatcher: ToolDispatcher,
        layer: Arc<FakeLayer>,
        log_dir: tempfile::TempDir,
    }

    fn harness(layer: Arc<FakeLayer>) -> Harness {
        let log_dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(TemplateRegistry::builtin(&WarehouseObjects::default()).unwrap());
        let log = Arc::new(
            EventLog::open(EventLogConfig {
                dir: log_dir.path().to_path_buf(),
                ..EventLogConfig::default()
            })
            .unwrap(),
        );
        let cache = Arc::new(ContextCache::new(CacheConfig::default()));
        let tags = TagGenerator::new().unwrap();
        let scheduler = Arc::new(TicketScheduler::new(
            SchedulerConfig::default(),
            Arc::clone(&layer) as Arc<dyn ConnectionLayer>,
            Arc::clone(&registry),
            tags,
        ));
        let metrics = Arc::new(MetricsCore::new(MetricsConfig::default()));
        let dispatcher = ToolDispatcher::new(
            DispatcherConfig::default(),
            tags,
            registry,
            layer.clone(),
            Arc::clone(&log),
            cache,
            scheduler,
            metrics,
        );
        Harness {
            dispatcher,
            layer,
            log_dir,
        }
    }

    fn log_lines(harness: &Harness) -> Vec<Value> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(harness.log_dir.path()).unwrap() {
            let content = std::fs::read_to_string(entry.unwrap().path()).unwrap();
            out.extend(
                content
                    .lines()
                    .map(|l| serde_json::from_str::<Value>(l).unwrap()),
            );
        }
        out
    }

    #[tokio::test]
    async fn test_log_event_normalizes_activity_and_appends() {
        let h = harness(FakeLayer::empty());
        let response = h
            .dispatcher
            .log_event(LogEventRequest {
                activity: "user_asked".into(),
                metadata: Some(json!({"q": "why"})),
                link: None,
                customer: Some("customer_0001".into()),
                session_id: Some("sess-1".into()),
                revenue_impact: None,
            })
            .await
            .unwrap();
        assert_eq!(response["ok"], true);
        let tag = response["tag"].as_str().unwrap();
        assert!(TagGenerator::is_valid(tag));

        h.dispatcher.log.flush().unwrap();
        let lines = log_lines(&h);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["activity"], "cdesk.user_asked");
        assert_eq!(lines[0]["tag"], tag);
    }

    #[tokio::test]
    async fn test_log_event_rejects_malformed_activity() {
        let h = harness(FakeLayer::empty());
        let err = h
            .dispatcher
            .log_event(LogEventRequest {
                activity: "Not A Name".into(),
                metadata: None,
                link: None,
                customer: None,
                session_id: None,
                revenue_impact: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ValidationError");
        h.dispatcher.log.flush().unwrap();
        assert!(log_lines(&h).is_empty());
    }

    #[tokio::test]
    async fn test_get_context_miss_fetches_and_populates_cache() {
        let row = json!({"context_blob": "{\"plan\":\"pro\"}"});
        let h = harness(FakeLayer::with_row(row));
        let first = h
            .dispatcher
            .get_context(GetContextRequest {
                customer_key: "customer_0001".into(),
                max_bytes: None,
            })
            .await
            .unwrap();
        assert_eq!(first["cached"], false);
        assert_eq!(first["context"]["plan"], "pro");
        assert_eq!(h.layer.calls.load(Ordering::SeqCst), 1);

        let second = h
            .dispatcher
            .get_context(GetContextRequest {
                customer_key: "customer_0001".into(),
                max_bytes: None,
            })
            .await
            .unwrap();
        assert_eq!(second["cached"], true);
        // No second warehouse round-trip.
        assert_eq!(h.layer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_context_applies_max_bytes_with_marker() {
        let row = json!({"context_blob": json!({"blob": "x".repeat(4096)}).to_string()});
        let h = harness(FakeLayer::with_row(row));
        let response = h
            .dispatcher
            .get_context(GetContextRequest {
                customer_key: "customer_0001".into(),
                max_bytes: Some(256),
            })
            .await
            .unwrap();
        assert_eq!(response["truncated"], true);
        assert!(response["originalBytes"].as_u64().unwrap() > 4096);
        assert!(response["contextPreview"].as_str().unwrap().len() <= 256);
    }

    #[tokio::test]
    async fn test_max_bytes_cut_lands_on_utf8_boundary() {
        // Multibyte payload with an odd cap: slicing off-boundary would
        // panic while building the response.
        let blob = json!({"notes": "日本語のメモ".repeat(100)}).to_string();
        let h = harness(FakeLayer::with_row(json!({ "context_blob": blob })));
        let response = h
            .dispatcher
            .get_context(GetContextRequest {
                customer_key: "customer_0001".into(),
                max_bytes: Some(101),
            })
            .await
            .unwrap();
        assert_eq!(response["truncated"], true);
        let preview = response["contextPreview"].as_str().unwrap();
        assert!(preview.len() <= 101);
        assert!(preview.is_char_boundary(preview.len()));
    }

    #[tokio::test]
    async fn test_get_context_injection_rejected_before_any_warehouse_call() {
        let h = harness(FakeLayer::empty());
        let err = h
            .dispatcher
            .get_context(GetContextRequest {
                customer_key: "'; DROP TABLE X; --".into(),
                max_bytes: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ValidationError");
        assert!(!err.retryable());
        assert_eq!(h.layer.calls.load(Ordering::SeqCst), 0);
        h.dispatcher.log.flush().unwrap();
        assert!(log_lines(&h).is_empty());
    }

    #[tokio::test]
    async fn test_submit_query_creates_pending_ticket() {
        let h = harness(FakeLayer::empty());
        let response = h
            .dispatcher
            .submit_query(SubmitQueryRequest {
                template_name: names::READ_RECENT_ACTIVITIES.into(),
                params: vec![json!("customer_0001"), json!(50)],
                byte_cap: Some(10_000),
            })
            .await
            .unwrap();
        assert_eq!(response["state"], "pending");
        let id = response["ticketId"].as_str().unwrap();
        assert!(h.dispatcher.ticket_status(id).is_some());
    }

    #[tokio::test]
    async fn test_submit_query_unknown_template_fails() {
        let h = harness(FakeLayer::empty());
        let err = h
            .dispatcher
            .submit_query(SubmitQueryRequest {
                template_name: "drop_everything".into(),
                params: vec![],
                byte_cap: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ValidationError");
    }

    #[tokio::test]
    async fn test_log_insight_requires_16_hex_provenance() {
        let h = harness(FakeLayer::empty());
        let bad = h
            .dispatcher
            .log_insight(LogInsightRequest {
                subject: "customer_0001".into(),
                metric: "weekly_active_days".into(),
                value: 4.0,
                provenance_hash: "NOT-HEX".into(),
            })
            .await
            .unwrap_err();
        assert_eq!(bad.kind(), "ValidationError");

        let ok = h
            .dispatcher
            .log_insight(LogInsightRequest {
                subject: "customer_0001".into(),
                metric: "weekly_active_days".into(),
                value: 4.0,
                provenance_hash: "0123456789abcdef".into(),
            })
            .await
            .unwrap();
        assert_eq!(ok["ok"], true);

        h.dispatcher.log.flush().unwrap();
        let lines = log_lines(&h);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["activity"], "cdesk.insight_recorded");
        assert_eq!(lines[0]["metadata"]["provenance_hash"], "0123456789abcdef");
    }

    #[tokio::test]
    async fn test_metrics_record_every_call() {
        let h = harness(FakeLayer::empty());
        let _ = h
            .dispatcher
            .log_event(LogEventRequest {
                activity: "user_asked".into(),
                metadata: None,
                link: None,
                customer: None,
                session_id: None,
                revenue_impact: None,
            })
            .await;
        let _ = h
            .dispatcher
            .log_event(LogEventRequest {
                activity: "bad name".into(),
                metadata: None,
                link: None,
                customer: None,
                session_id: None,
                revenue_impact: None,
            })
            .await;
        let stats = h.dispatcher.stats();
        let tools = stats["tools"].as_array().unwrap();
        let log_event = tools.iter().find(|t| t["tool"] == "log_event").unwrap();
        assert_eq!(log_event["count"], 2);
        assert_eq!(log_event["errors"], 1);
    }
}
