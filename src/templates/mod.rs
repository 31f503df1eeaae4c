//! Parameterized SQL template registry.
//!
//! The registry is the only legal way to send SQL to the warehouse. Every
//! template is fixed text with question-mark bind markers; parameters travel
//! exclusively through the bind vector after passing the template's
//! validator. A registry-wide structural check runs at process start and
//! fails with `ConfigError` before anything touches the warehouse.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::WarehouseObjects;
use crate::error::{RelayError, RelayResult};
use crate::warehouse::conn::{QueryResult, WarehouseConn};

pub mod validators;

use validators as v;

/// Canonical template names.
pub mod names {
    pub const APPEND_EVENT: &str = "append_event";
    pub const APPEND_INSIGHT: &str = "append_insight";
    pub const READ_CONTEXT: &str = "read_context";
    pub const WRITE_CONTEXT: &str = "write_context";
    pub const READ_RECENT_ACTIVITIES: &str = "read_recent_activities";
    pub const AGGREGATE_ACTIVITY_COUNTS: &str = "aggregate_activity_counts";
    pub const HEALTH_PROBE: &str = "health_probe";
    pub const RECORD_INGEST_ID: &str = "record_ingest_id";
    pub const CHECK_INGEST_ID: &str = "check_ingest_id";
    pub const READ_INSIGHTS_BY_CUSTOMER: &str = "read_insights_by_customer";
    pub const READ_INSIGHTS_BY_SUBJECT: &str = "read_insights_by_subject";
    pub const READ_INSIGHTS_BY_SUBJECT_METRIC: &str = "read_insights_by_subject_metric";
    pub const APPEND_PROVENANCE: &str = "append_provenance";
    pub const READ_PROVENANCE: &str = "read_provenance";
}

/// Pure validator: parameter vector in, validated parameter vector out.
pub type Validator = Arc<dyn Fn(&[Value]) -> RelayResult<Vec<Value>> + Send + Sync>;

/// A registered SQL template.
#[derive(Clone)]
pub struct Template {
    pub name: String,
    pub sql: String,
    /// Number of bind markers. Zero means the template is declared nullary.
    pub arity: usize,
    validator: Validator,
}

impl Template {
    /// Run the validator over a parameter vector.
    pub fn validate(&self, params: &[Value]) -> RelayResult<Vec<Value>> {
        v::expect_arity(params, self.arity, &self.name)?;
        (self.validator)(params)
    }
}

impl std::fmt::Debug for Template {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Template")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .finish()
    }
}

/// Markers whose presence in template SQL would indicate string building
/// rather than parameterization.
const FORBIDDEN_SQL_MARKERS: &[&str] = &["${", "`", "||", ";", "--", "/*"];

/// Registry of every template this process may execute.
pub struct TemplateRegistry {
    templates: HashMap<String, Template>,
}

impl TemplateRegistry {
    /// Empty registry. Most callers want [`TemplateRegistry::builtin`].
    pub fn new() -> Self {
        Self {
            templates: HashMap::new(),
        }
    }

    /// Register a template. Arity zero declares the template nullary.
    pub fn register(
        &mut self,
        name: &str,
        sql: impl Into<String>,
        arity: usize,
        validator: Validator,
    ) {
        self.templates.insert(
            name.to_string(),
            Template {
                name: name.to_string(),
                sql: sql.into(),
                arity,
                validator,
            },
        );
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.templates.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get(&self, name: &str) -> Option<&Template> {
        self.templates.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }

    /// Registry-wide structural validation, run once at process start.
    ///
    /// Checks that every template is parameterized (unless declared nullary),
    /// that the bind-marker count matches the declared arity, and that the
    /// SQL text contains no marker that could smuggle in a second statement.
    pub fn validate_all(&self) -> RelayResult<()> {
        for template in self.templates.values() {
            let marker_count = template.sql.matches('?').count();
            if template.arity == 0 && marker_count != 0 {
                return Err(RelayError::config(format!(
                    "template `{}` is declared nullary but contains bind markers",
                    template.name
                )));
            }
            if template.arity > 0 && marker_count != template.arity {
                return Err(RelayError::config(format!(
                    "template `{}` declares arity {} but contains {} bind markers",
                    template.name, template.arity, marker_count
                )));
            }
            for marker in FORBIDDEN_SQL_MARKERS {
                if template.sql.contains(marker) {
                    return Err(RelayError::config(format!(
                        "template `{}` contains forbidden sequence `{marker}`",
                        template.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Validate parameters and execute the template on a connection.
    ///
    /// The validator runs first; only the validated bind vector reaches the
    /// connection. Nothing is ever formatted into the SQL text.
    pub async fn execute(
        &self,
        conn: &WarehouseConn,
        name: &str,
        params: &[Value],
        deadline: Duration,
        tag: &str,
    ) -> RelayResult<QueryResult> {
        let template = self.get(name).ok_or_else(|| {
            RelayError::validation("templateName", format!("unknown template `{name}`"))
        })?;
        let binds = template.validate(params)?;
        conn.execute(&template.sql, &binds, tag, deadline).await
    }

    /// The built-in template set over the configured warehouse objects.
    ///
    /// Object names come from configuration, are restricted to an identifier
    /// charset here, and are substituted once at build time; they are never
    /// caller-controlled.
    pub fn builtin(objects: &WarehouseObjects) -> RelayResult<Self> {
        objects.validate()?;
        let events = &objects.events;
        let context = &objects.context;
        let insights = &objects.insights;
        let ingest_ids = &objects.ingest_ids;
        let provenance = &objects.provenance;

        let mut registry = Self::new();

        registry.register(
            names::APPEND_EVENT,
            format!(
                "INSERT INTO {events} \
                 (activity_id, activity, customer, ts, activity_occurrence, \
                  activity_repeated_at, link, revenue_impact, _feature_json, \
                  _source_system, _source_version, _session_id, _query_tag) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ),
            13,
            Arc::new(|p: &[Value]| {
                Ok(vec![
                    v::uuid_param(p, 0, "activity_id")?,
                    v::activity_name(p, 1, "activity")?,
                    v::identifier(p, 2, "customer")?,
                    v::timestamp(p, 3, "ts")?,
                    v::int_in_range(p, 4, "activity_occurrence", 1, i64::MAX)?,
                    v::optional(p, 5, "activity_repeated_at", v::timestamp)?,
                    v::optional(p, 6, "link", v::url)?,
                    v::optional(p, 7, "revenue_impact", v::finite_number)?,
                    v::json_doc(p, 8, "_feature_json")?,
                    v::identifier(p, 9, "_source_system")?,
                    v::identifier(p, 10, "_source_version")?,
                    v::optional(p, 11, "_session_id", v::identifier)?,
                    v::query_tag(p, 12, "_query_tag")?,
                ])
            }),
        );

        registry.register(
            names::APPEND_INSIGHT,
            format!(
                "INSERT INTO {insights} \
                 (insight_id, customer, subject, metric, value, provenance_hash, \
                  recorded_at, _query_tag) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)"
            ),
            8,
            Arc::new(|p: &[Value]| {
                Ok(vec![
                    v::uuid_param(p, 0, "insight_id")?,
                    v::identifier(p, 1, "customer")?,
                    v::identifier(p, 2, "subject")?,
                    v::identifier(p, 3, "metric")?,
                    v::finite_number(p, 4, "value")?,
                    v::hex16(p, 5, "provenance_hash")?,
                    v::timestamp(p, 6, "recorded_at")?,
                    v::query_tag(p, 7, "_query_tag")?,
                ])
            }),
        );

        registry.register(
            names::READ_CONTEXT,
            format!("SELECT context_blob, updated_at FROM {context} WHERE customer = ?"),
            1,
            Arc::new(|p: &[Value]| Ok(vec![v::identifier(p, 0, "customer")?])),
        );

        registry.register(
            names::WRITE_CONTEXT,
            format!(
                "MERGE INTO {context} t USING (SELECT ? AS customer, ? AS context_blob) s \
                 ON t.customer = s.customer \
                 WHEN MATCHED THEN UPDATE SET context_blob = s.context_blob, \
                 updated_at = CURRENT_TIMESTAMP() \
                 WHEN NOT MATCHED THEN INSERT (customer, context_blob, updated_at) \
                 VALUES (s.customer, s.context_blob, CURRENT_TIMESTAMP())"
            ),
            2,
            Arc::new(|p: &[Value]| {
                Ok(vec![
                    v::identifier(p, 0, "customer")?,
                    v::json_doc(p, 1, "context_blob")?,
                ])
            }),
        );

        registry.register(
            names::READ_RECENT_ACTIVITIES,
            format!(
                "SELECT activity, ts, link, revenue_impact FROM {events} \
                 WHERE customer = ? ORDER BY ts DESC LIMIT ?"
            ),
            2,
            Arc::new(|p: &[Value]| {
                Ok(vec![
                    v::identifier(p, 0, "customer")?,
                    v::int_in_range(p, 1, "limit", 1, 1000)?,
                ])
            }),
        );

        registry.register(
            names::AGGREGATE_ACTIVITY_COUNTS,
            format!(
                "SELECT activity, COUNT(activity) AS occurrences FROM {events} \
                 WHERE customer = ? AND ts >= ? GROUP BY activity"
            ),
            2,
            Arc::new(|p: &[Value]| {
                Ok(vec![
                    v::identifier(p, 0, "customer")?,
                    v::timestamp(p, 1, "since")?,
                ])
            }),
        );

        registry.register(names::HEALTH_PROBE, "SELECT 1", 0, Arc::new(|_: &[Value]| Ok(vec![])));

        registry.register(
            names::RECORD_INGEST_ID,
            format!("INSERT INTO {ingest_ids} (ingest_id, recorded_at) VALUES (?, ?)"),
            2,
            Arc::new(|p: &[Value]| {
                Ok(vec![
                    v::hex16(p, 0, "ingest_id")?,
                    v::timestamp(p, 1, "recorded_at")?,
                ])
            }),
        );

        registry.register(
            names::CHECK_INGEST_ID,
            format!("SELECT COUNT(ingest_id) AS n FROM {ingest_ids} WHERE ingest_id = ?"),
            1,
            Arc::new(|p: &[Value]| Ok(vec![v::hex16(p, 0, "ingest_id")?])),
        );

        registry.register(
            names::READ_INSIGHTS_BY_CUSTOMER,
            format!(
                "SELECT customer, subject, metric, value, provenance_hash, recorded_at \
                 FROM {insights} WHERE customer = ? ORDER BY recorded_at DESC"
            ),
            1,
            Arc::new(|p: &[Value]| Ok(vec![v::identifier(p, 0, "customer")?])),
        );

        registry.register(
            names::READ_INSIGHTS_BY_SUBJECT,
            format!(
                "SELECT customer, subject, metric, value, provenance_hash, recorded_at \
                 FROM {insights} WHERE subject = ? ORDER BY recorded_at DESC"
            ),
            1,
            Arc::new(|p: &[Value]| Ok(vec![v::identifier(p, 0, "subject")?])),
        );

        registry.register(
            names::READ_INSIGHTS_BY_SUBJECT_METRIC,
            format!(
                "SELECT customer, subject, metric, value, provenance_hash, recorded_at \
                 FROM {insights} WHERE subject = ? AND metric = ? ORDER BY recorded_at DESC"
            ),
            2,
            Arc::new(|p: &[Value]| {
                Ok(vec![
                    v::identifier(p, 0, "subject")?,
                    v::identifier(p, 1, "metric")?,
                ])
            }),
        );

        registry.register(
            names::APPEND_PROVENANCE,
            format!(
                "INSERT INTO {provenance} \
                 (provenance_hash, template_name, params_json, executed_at, _query_tag) \
                 VALUES (?, ?, ?, ?, ?)"
            ),
            5,
            Arc::new(|p: &[Value]| {
                Ok(vec![
                    v::hex16(p, 0, "provenance_hash")?,
                    v::identifier(p, 1, "template_name")?,
                    v::json_doc(p, 2, "params_json")?,
                    v::timestamp(p, 3, "executed_at")?,
                    v::query_tag(p, 4, "_query_tag")?,
                ])
            }),
        );

        registry.register(
            names::READ_PROVENANCE,
            format!(
                "SELECT template_name, params_json, executed_at \
                 FROM {provenance} WHERE provenance_hash = ?"
            ),
            1,
            Arc::new(|p: &[Value]| Ok(vec![v::hex16(p, 0, "provenance_hash")?])),
        );

        registry.validate_all()?;
        Ok(registry)
    }
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::new()
    }
}
