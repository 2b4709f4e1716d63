//! Domain model shared across the VSentry crates.
//!
//! These are the persisted shapes: ingest configuration and its bearer
//! tokens, detection rules, incidents with their alert evidence, and
//! playbooks with their execution history. Serialization matches the wire
//! format the admin API exposes.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A named output sink: where one tenant's logs land at the log backend,
/// and which event fields the backend should index as stream labels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    pub id: i64,
    pub name: String,
    pub endpoint: String,
    /// Comma-separated field names, e.g. `"host,source"`. May arrive with a
    /// `_stream_fields=` prefix pasted in from backend docs; the forwarder
    /// strips it.
    pub stream_fields: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A bearer token bound to one ingest configuration. One config may carry
/// many tokens; deleting either side invalidates the cache entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestAuth {
    pub id: i64,
    pub ingest_id: i64,
    pub secret_key: String,
    pub created_at: DateTime<Utc>,
}

/// The resolved view of a token, cached under `t:<token>` and attached to
/// every authenticated ingest request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestCacheEntry {
    pub id: i64,
    pub endpoint: String,
    pub stream_fields: String,
}

/// A persisted detection. The query string is opaque to VSentry and passed
/// verbatim to the log backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub query: String,
    /// Six-field cron expression (`sec min hr dom mon dow`) or
    /// `@every <duration>`.
    pub interval: String,
    pub severity: String,
    pub enabled: bool,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentStatus {
    New,
    Acknowledged,
    Resolved,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::New => "new",
            IncidentStatus::Acknowledged => "acknowledged",
            IncidentStatus::Resolved => "resolved",
        }
    }
}

impl fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IncidentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(IncidentStatus::New),
            "acknowledged" => Ok(IncidentStatus::Acknowledged),
            "resolved" => Ok(IncidentStatus::Resolved),
            other => Err(format!("unknown incident status: {other}")),
        }
    }
}

/// An open correlation bucket for one rule. At most one non-resolved
/// incident exists per rule at any time; new evidence folds into it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: i64,
    pub rule_id: i64,
    /// Copied from the rule at creation time; later rule renames do not
    /// retitle open incidents.
    pub name: String,
    pub severity: String,
    pub status: IncidentStatus,
    pub alert_count: i64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub assignee: Option<String>,
    pub closing_classification: Option<String>,
    pub closing_comment: Option<String>,
}

/// One log line of evidence attached to an incident. The fingerprint is
/// the global dedup key: a duplicate never produces a second row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: i64,
    pub incident_id: i64,
    pub rule_id: i64,
    pub content: String,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    Manual,
    Incident,
    Timer,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Manual => "manual",
            TriggerType::Incident => "incident",
            TriggerType::Timer => "timer",
        }
    }
}

impl FromStr for TriggerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(TriggerType::Manual),
            "incident" => Ok(TriggerType::Incident),
            "timer" => Ok(TriggerType::Timer),
            other => Err(format!("unknown trigger type: {other}")),
        }
    }
}

/// A stored response workflow: a node/edge graph plus trigger metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Playbook {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub is_active: bool,
    pub trigger_type: TriggerType,
    /// React-Flow style `{nodes, edges}` document, kept schemaless here;
    /// the automation crate parses it at run time.
    pub definition: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Success,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
        }
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(ExecutionStatus::Running),
            "success" => Ok(ExecutionStatus::Success),
            "failed" => Ok(ExecutionStatus::Failed),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// One playbook run. `logs` maps node id to that node's step result and is
/// re-saved after every node so a polling UI sees partial progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybookExecution {
    pub id: i64,
    pub playbook_id: i64,
    pub status: ExecutionStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub logs: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            IncidentStatus::New,
            IncidentStatus::Acknowledged,
            IncidentStatus::Resolved,
        ] {
            assert_eq!(status.as_str().parse::<IncidentStatus>(), Ok(status));
        }
        assert!("closed".parse::<IncidentStatus>().is_err());
    }

    #[test]
    fn trigger_type_serializes_lowercase() {
        let json = serde_json::to_string(&TriggerType::Incident).unwrap();
        assert_eq!(json, "\"incident\"");
    }
}
