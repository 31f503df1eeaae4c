//! Warehouse connection handles and the transport boundary.
//!
//! The warehouse's SQL engine is an external collaborator. Everything this
//! crate sends crosses a [`WarehouseTransport`]: one parameterized statement,
//! a bind vector, a correlation tag, and a deadline. The production transport
//! speaks the warehouse's HTTP SQL API via `reqwest`; tests substitute
//! hand-written mocks.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::AccountConfig;
use crate::error::{RelayError, RelayResult};

/// Result of one warehouse statement.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryResult {
    /// Row objects keyed by column name.
    pub rows: Vec<Value>,
    pub row_count: usize,
    /// Serialized size of `rows`, used for byte-cap accounting.
    pub bytes: usize,
}

impl QueryResult {
    pub fn from_rows(rows: Vec<Value>) -> Self {
        let bytes = serde_json::to_string(&rows).map(|s| s.len()).unwrap_or(0);
        Self {
            row_count: rows.len(),
            bytes,
            rows,
        }
    }
}

/// Transport over which statements reach the warehouse.
#[async_trait]
pub trait WarehouseTransport: Send + Sync {
    /// Execute one parameterized statement. `binds` are positional and are
    /// never interpolated into `sql`; `tag` is set as the session query tag.
    async fn run(
        &self,
        sql: &str,
        binds: &[Value],
        tag: &str,
        deadline: Duration,
    ) -> RelayResult<QueryResult>;
}

/// A pooled warehouse connection. Never shared between accounts; ownership
/// moves out of the pool on acquire and back on release.
pub struct WarehouseConn {
    pub(crate) id: u64,
    pub(crate) account: String,
    transport: Arc<dyn WarehouseTransport>,
    pub(crate) opened_at: Instant,
    pub(crate) last_used_at: Instant,
    pub(crate) last_health_check_at: Option<Instant>,
    healthy: AtomicBool,
}

impl WarehouseConn {
    pub fn new(id: u64, account: String, transport: Arc<dyn WarehouseTransport>) -> Self {
        let now = Instant::now();
        Self {
            id,
            account,
            transport,
            opened_at: now,
            last_used_at: now,
            last_health_check_at: None,
            healthy: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Username of the account this connection belongs to.
    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// Flag the connection as broken; the pool destroys it on release
    /// instead of returning it to the idle set.
    pub fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::Relaxed);
    }

    /// Execute a statement on this connection. The deadline is enforced here
    /// regardless of transport behavior; on expiry the call is abandoned and
    /// the connection is flagged unhealthy (the in-flight statement cannot
    /// be reused).
    pub async fn execute(
        &self,
        sql: &str,
        binds: &[Value],
        tag: &str,
        deadline: Duration,
    ) -> RelayResult<QueryResult> {
        match tokio::time::timeout(deadline, self.transport.run(sql, binds, tag, deadline)).await {
            Ok(result) => result,
            Err(_) => {
                self.mark_unhealthy();
                Err(RelayError::timeout(
                    "warehouse call",
                    deadline.as_millis() as u64,
                ))
            }
        }
    }

    /// Trivial probe used by the pool's health loop.
    pub async fn probe(&self, tag: &str, deadline: Duration) -> RelayResult<()> {
        self.execute("SELECT 1", &[], tag, deadline).await.map(|_| ())
    }
}

impl std::fmt::Debug for WarehouseConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarehouseConn")
            .field("id", &self.id)
            .field("account", &self.account)
            .field("healthy", &self.is_healthy())
            .field("age_ms", &self.opened_at.elapsed().as_millis())
            .field(
                "last_health_check_ms",
                &self.last_health_check_at.map(|t| t.elapsed().as_millis()),
            )
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP transport (SQL API)
// ─────────────────────────────────────────────────────────────────────────────

/// Transport that speaks the warehouse's HTTP SQL API.
pub struct HttpTransport {
    client: reqwest::Client,
    statements_url: String,
    account: AccountConfig,
}

impl HttpTransport {
    pub fn new(base_url: &str, account: AccountConfig) -> RelayResult<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(1)
            .build()
            .map_err(|e| RelayError::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            statements_url: format!("{}/api/v2/statements", base_url.trim_end_matches('/')),
            account,
        })
    }

    /// Positional bind vector in the SQL API's 1-based map shape.
    fn bindings(binds: &[Value]) -> Value {
        let mut map = serde_json::Map::new();
        for (i, bind) in binds.iter().enumerate() {
            let (ty, value) = match bind {
                Value::Null => ("TEXT", Value::Null),
                Value::Bool(b) => ("BOOLEAN", Value::String(b.to_string())),
                Value::Number(n) => ("FIXED", Value::String(n.to_string())),
                Value::String(s) => ("TEXT", Value::String(s.clone())),
                other => ("TEXT", Value::String(other.to_string())),
            };
            map.insert((i + 1).to_string(), json!({ "type": ty, "value": value }));
        }
        Value::Object(map)
    }

    /// Reshape the SQL API's columnar payload into row objects.
    fn rows_from_response(body: &Value) -> Vec<Value> {
        let names: Vec<String> = body["resultSetMetaData"]["rowType"]
            .as_array()
            .map(|cols| {
                cols.iter()
                    .filter_map(|c| c["name"].as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default();
        body["data"]
            .as_array()
            .map(|rows| {
                rows.iter()
                    .map(|row| {
                        let mut obj = serde_json::Map::new();
                        if let Some(cells) = row.as_array() {
                            for (name, cell) in names.iter().zip(cells) {
                                obj.insert(name.clone(), cell.clone());
                            }
                        }
                        Value::Object(obj)
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl WarehouseTransport for HttpTransport {
    async fn run(
        &self,
        sql: &str,
        binds: &[Value],
        tag: &str,
        deadline: Duration,
    ) -> RelayResult<QueryResult> {
        let request = json!({
            "statement": sql,
            "bindings": Self::bindings(binds),
            "warehouse": self.account.warehouse,
            "database": self.account.database,
            "schema": self.account.schema,
            "role": self.account.role,
            "timeout": deadline.as_secs().max(1),
            "parameters": { "query_tag": tag },
        });

        let response = self
            .client
            .post(&self.statements_url)
            .bearer_auth(&self.account.secret)
            .header("X-Warehouse-Account", &self.account.account)
            .header("X-Warehouse-User", &self.account.username)
            .json(&request)
            .timeout(deadline)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RelayError::timeout("warehouse call", deadline.as_millis() as u64)
                } else {
                    RelayError::warehouse(format!("transport failure: {e}"))
                }
            })?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| RelayError::warehouse(format!("unreadable response: {e}")))?;

        if !status.is_success() {
            // Pass through the warehouse's error text, never the SQL.
            let message = body["message"]
                .as_str()
                .unwrap_or("warehouse rejected the statement");
            return Err(RelayError::warehouse(format!("{status}: {message}")));
        }

        Ok(QueryResult::from_rows(Self::rows_from_response(&body)))
    }
}
