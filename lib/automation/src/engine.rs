//! The playbook interpreter.
//!
//! Single-threaded BFS from the trigger node. Condition nodes gate their
//! out-edges by comparing the boolean output against each edge's
//! `sourceHandle`; every other node enqueues all targets. A visited set
//! guarantees termination even on definitions containing cycles.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde_json::{Map, Value};

use vsentry_common::ExecutionStatus;
use vsentry_store::Store;

use crate::actions::{run_condition, run_expression, run_http_request, run_send_email};
use crate::types::{Edge, ExecutionContext, Node, StepResult, StepStatus, WorkflowDefinition};
use crate::variable::resolve_variables;

pub struct Engine {
    store: Arc<Store>,
    client: reqwest::Client,
}

impl Engine {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            client: reqwest::Client::new(),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Execute a playbook. The returned id is the execution row created at
    /// entry; it is returned even when the run itself fails, so callers
    /// can always point at the record. Errors are reserved for failures
    /// before that row exists (unknown playbook, unparseable definition).
    pub async fn run(&self, playbook_id: i64, input: Map<String, Value>) -> Result<i64> {
        let playbook = self
            .store
            .get_playbook(playbook_id)?
            .ok_or_else(|| anyhow!("playbook {playbook_id} not found"))?;

        let def: WorkflowDefinition = serde_json::from_value(playbook.definition)
            .map_err(|e| anyhow!("invalid definition: {e}"))?;

        let start = Utc::now();
        let execution_id = self.store.create_execution(playbook_id, start)?;

        let mut ctx = ExecutionContext {
            playbook_id,
            execution_id,
            global: input,
            steps: HashMap::new(),
        };

        let nodes_by_id: HashMap<&str, &Node> =
            def.nodes.iter().map(|n| (n.id.as_str(), n)).collect();
        let mut out_edges: HashMap<&str, Vec<&Edge>> = HashMap::new();
        for edge in &def.edges {
            out_edges.entry(edge.source.as_str()).or_default().push(edge);
        }

        let Some(trigger) = def.nodes.iter().find(|n| n.data.kind == "trigger") else {
            warn!("playbook {playbook_id}: no trigger node found");
            self.finalize(execution_id, ExecutionStatus::Failed, start);
            return Ok(execution_id);
        };

        let mut queue: VecDeque<String> = VecDeque::from([trigger.id.clone()]);
        let mut visited: HashSet<String> = HashSet::new();

        while let Some(curr) = queue.pop_front() {
            if !visited.insert(curr.clone()) {
                continue;
            }

            let result = match nodes_by_id.get(curr.as_str()) {
                Some(node) => self.execute_node(node, &ctx).await,
                // An edge pointing at nothing is a definition bug; treat it
                // like an unknown node type.
                None => StepResult::failed(format!("Unknown node id: {curr}")),
            };

            let failed = result.status == StepStatus::Failed;
            ctx.steps.insert(curr.clone(), result);
            self.persist_logs(&ctx);

            if failed {
                warn!("playbook {playbook_id}: node {curr} failed, stopping execution");
                self.finalize(execution_id, ExecutionStatus::Failed, start);
                return Ok(execution_id);
            }

            let is_condition = nodes_by_id
                .get(curr.as_str())
                .map(|n| n.data.kind == "condition")
                .unwrap_or(false);
            let branch = matches!(
                ctx.steps.get(&curr).map(|r| &r.output),
                Some(Value::Bool(true))
            );

            for edge in out_edges.get(curr.as_str()).into_iter().flatten() {
                if is_condition {
                    // Enqueue only the edge whose handle names the branch
                    // taken; an output matching neither handle simply ends
                    // that path.
                    let taken = if branch { "true" } else { "false" };
                    if edge.source_handle.as_deref() == Some(taken) {
                        queue.push_back(edge.target.clone());
                    }
                } else {
                    queue.push_back(edge.target.clone());
                }
            }
        }

        self.finalize(execution_id, ExecutionStatus::Success, start);
        info!("playbook {playbook_id}: execution {execution_id} finished");
        Ok(execution_id)
    }

    async fn execute_node(&self, node: &Node, ctx: &ExecutionContext) -> StepResult {
        let resolved = match resolve_variables(&node.data.config, ctx) {
            Ok(resolved) => resolved,
            Err(e) => return StepResult::failed(e.to_string()),
        };

        match node.data.kind.as_str() {
            "trigger" => StepResult::success(Value::Object(ctx.global.clone())),
            "http_request" => run_http_request(&self.client, &resolved).await,
            "send_email" => run_send_email(&resolved).await,
            "expression" => run_expression(&resolved, ctx),
            "condition" => run_condition(&resolved, ctx),
            other => StepResult::failed(format!("Unknown node type: {other}")),
        }
    }

    /// Re-save the aggregated logs map so a polling UI observes progress
    /// mid-run. Persistence failures must not kill the run.
    fn persist_logs(&self, ctx: &ExecutionContext) {
        match serde_json::to_value(&ctx.steps) {
            Ok(logs) => {
                if let Err(e) = self.store.update_execution_logs(ctx.execution_id, &logs) {
                    error!("execution {}: failed to persist logs: {e}", ctx.execution_id);
                }
            }
            Err(e) => error!("execution {}: failed to encode logs: {e}", ctx.execution_id),
        }
    }

    fn finalize(&self, execution_id: i64, status: ExecutionStatus, start: DateTime<Utc>) {
        let end = Utc::now();
        let duration_ms = (end - start).num_milliseconds();
        if let Err(e) = self
            .store
            .finish_execution(execution_id, status, end, duration_ms)
        {
            error!("execution {execution_id}: failed to finalize: {e}");
        }
    }
}
