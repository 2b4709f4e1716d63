//! Graph and run-state types for the playbook engine.
//!
//! The definition format mirrors what the flow editor exports: nodes carry
//! a UI type plus a business `data.type`, edges carry an optional
//! `sourceHandle` naming the condition branch they hang off.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Node {
    pub id: String,
    /// Flow-editor UI type; the engine dispatches on `data.type` instead.
    #[serde(default, rename = "type")]
    pub kind: String,
    pub data: NodeData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeData {
    #[serde(default)]
    pub label: String,
    /// Business type: trigger, http_request, send_email, expression,
    /// condition.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub config: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Edge {
    #[serde(default)]
    pub id: String,
    pub source: String,
    pub target: String,
    /// Condition branch selector: `"true"` or `"false"`.
    #[serde(default, rename = "sourceHandle")]
    pub source_handle: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Success,
    Failed,
    Skipped,
}

/// Outcome of one node: persisted into the execution's logs map and
/// exposed to later nodes through the expression environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub status: StepStatus,
    #[serde(default)]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepResult {
    pub fn success(output: Value) -> Self {
        StepResult {
            status: StepStatus::Success,
            output,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        StepResult {
            status: StepStatus::Failed,
            output: Value::Null,
            error: Some(error.into()),
        }
    }
}

/// Per-run state threaded through the interpreter. Owned by one run; never
/// shared across runs.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub playbook_id: i64,
    pub execution_id: i64,
    /// Trigger payload: `{incident: ...}` for incident dispatch, caller
    /// supplied for manual runs.
    pub global: Map<String, Value>,
    /// Results of already-executed nodes, keyed by node id.
    pub steps: HashMap<String, StepResult>,
}
