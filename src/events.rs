// Activity events - the unit appended to the durable log
//
// Events model the ActivitySchema shape the warehouse expects: a named,
// timestamped, per-customer occurrence plus extension fields. Occurrence
// numbering is warehouse-derived; this layer records what the caller
// supplied and defaults `occurrence` to 1.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::OnceLock;
use uuid::Uuid;

use crate::error::{RelayError, RelayResult};

/// Namespace prefix required on every activity name.
pub const ACTIVITY_PREFIX: &str = "cdesk.";

/// Catalog of recognized activity names. Non-exclusive: any well-formed
/// `cdesk.*` name is accepted; these are the ones the assistant emits today.
pub const KNOWN_ACTIVITIES: &[&str] = &[
    "cdesk.session_started",
    "cdesk.session_ended",
    "cdesk.user_asked",
    "cdesk.claude_responded",
    "cdesk.tool_called",
    "cdesk.sql_executed",
    "cdesk.sql_completed",
    "cdesk.file_read",
    "cdesk.file_written",
    "cdesk.insight_recorded",
    "cdesk.context_refreshed",
    "cdesk.artifact_created",
    "cdesk.error_encountered",
    "cdesk.retry_attempted",
    "cdesk.fallback_triggered",
    "cdesk.timeout_occurred",
];

fn activity_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^cdesk\.[a-z_]+$").expect("static pattern"))
}

/// Normalize an activity name to the `cdesk.` namespace.
///
/// Un-namespaced names are rewritten by prepending the prefix, never
/// rejected. Names that still violate the pattern after normalization fail
/// with `ValidationError`.
pub fn normalize_activity(raw: &str) -> RelayResult<String> {
    let name = if raw.starts_with(ACTIVITY_PREFIX) {
        raw.to_string()
    } else {
        format!("{ACTIVITY_PREFIX}{raw}")
    };
    if !activity_pattern().is_match(&name) {
        return Err(RelayError::validation(
            "activity",
            format!("`{name}` does not match the activity namespace pattern"),
        ));
    }
    Ok(name)
}

/// One record of the append-only event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEvent {
    /// Unique event id.
    pub id: String,
    /// Namespaced activity name (`cdesk.*`).
    pub activity: String,
    /// Customer key the activity belongs to.
    pub customer: String,
    /// Event timestamp. Not required to be monotonic per customer.
    pub ts: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revenue_impact: Option<f64>,
    /// Free-form metadata document.
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Correlation tag (`cdesk_<16 hex>`) tying this event to a warehouse call.
    pub tag: String,
    /// Occurrence number, consistent with warehouse-side derivation.
    pub occurrence: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_occurrence_ts: Option<DateTime<Utc>>,
}

impl ActivityEvent {
    /// Build an event with generated id and current timestamp.
    pub fn new(activity: String, customer: String, tag: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            activity,
            customer,
            ts: Utc::now(),
            link: None,
            revenue_impact: None,
            metadata: serde_json::Value::Null,
            session_id: None,
            tag,
            occurrence: 1,
            previous_occurrence_ts: None,
        }
    }

    /// Stable ingest id for warehouse-side deduplication: the first 16 hex
    /// characters of sha256 over the event id.
    pub fn ingest_id(&self) -> String {
        let digest = Sha256::digest(self.id.as_bytes());
        digest[..8].iter().map(|b| format!("{b:02x}")).collect()
    }
}
