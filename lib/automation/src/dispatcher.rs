//! Incident-triggered playbook dispatch.
//!
//! Called by the rule executor whenever folding produced new evidence.
//! Selects the active incident-triggered playbooks linked to the
//! incident's rule and runs each on its own task; the executor never
//! blocks on playbook work.

use std::sync::Arc;

use anyhow::Result;
use log::{error, info};
use serde_json::{Map, Value};

use vsentry_common::Incident;

use crate::engine::Engine;

pub async fn dispatch_by_incident(engine: Arc<Engine>, incident: Incident) {
    let playbooks = match engine.store().playbooks_for_incident(incident.rule_id) {
        Ok(playbooks) => playbooks,
        Err(e) => {
            error!("incident {}: playbook lookup failed: {e}", incident.id);
            return;
        }
    };
    if playbooks.is_empty() {
        return;
    }

    let incident_value = match serde_json::to_value(&incident) {
        Ok(value) => value,
        Err(e) => {
            error!("incident {}: failed to encode: {e}", incident.id);
            return;
        }
    };

    info!(
        "incident {}: dispatching {} playbook(s)",
        incident.id,
        playbooks.len()
    );
    for playbook in playbooks {
        let engine = engine.clone();
        let mut global = Map::new();
        global.insert("incident".to_string(), incident_value.clone());
        tokio::spawn(async move {
            if let Err(e) = engine.run(playbook.id, global).await {
                error!("playbook {} failed to start: {e}", playbook.id);
            }
        });
    }
}

/// Manual trigger: the caller's context becomes the run's global
/// environment verbatim.
pub async fn dispatch_manual(
    engine: &Engine,
    playbook_id: i64,
    context: Map<String, Value>,
) -> Result<i64> {
    engine.run(playbook_id, context).await
}
