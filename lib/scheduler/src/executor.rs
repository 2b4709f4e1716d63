//! Rule evaluation against the log backend, and evidence folding.
//!
//! A tick queries the last 12 hours regardless of the rule's interval -
//! deliberately conservative, since the fingerprint unique index makes
//! re-reads idempotent. Query failures abandon the tick; the next fire
//! re-covers the window.

use std::sync::Arc;

use chrono::{Duration, Utc};
use log::{debug, error, info};

use vsentry_automation::{Engine, dispatch_by_incident};
use vsentry_common::Rule;
use vsentry_store::{Evidence, Store};

const QUERY_LOOKBACK_HOURS: i64 = 12;
const QUERY_LIMIT: &str = "1000";

/// ISO 8601 at second precision, the form the log backend's `_time`
/// filter accepts.
const TIME_FMT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// `hex(md5("<rule_id>-<line>"))`: the global dedup key for evidence.
pub fn fingerprint(rule_id: i64, line: &str) -> String {
    format!("{:x}", md5::compute(format!("{rule_id}-{line}")))
}

pub struct Executor {
    store: Arc<Store>,
    automation: Arc<Engine>,
    client: reqwest::Client,
    query_url: String,
}

impl Executor {
    pub fn new(store: Arc<Store>, automation: Arc<Engine>, query_url: String) -> Self {
        Self {
            store,
            automation,
            client: reqwest::Client::new(),
            query_url,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// One evaluation tick: query, dedup by fingerprint, fold into the
    /// rule's open incident, and dispatch playbooks if anything new
    /// landed. Never propagates errors - a failed tick is logged and
    /// abandoned.
    pub async fn execute_rule(&self, rule: &Rule) {
        let now = Utc::now();
        let from = now - Duration::hours(QUERY_LOOKBACK_HOURS);
        let query = format!(
            "({}) AND _time:[{}, {}]",
            rule.query,
            from.format(TIME_FMT),
            now.format(TIME_FMT)
        );
        debug!("[rule:{}] executing: {query}", rule.id);

        let response = match self
            .client
            .post(&self.query_url)
            .form(&[("query", query.as_str()), ("limit", QUERY_LIMIT)])
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                error!("[rule:{}] query request failed: {e}", rule.id);
                return;
            }
        };
        if !response.status().is_success() {
            error!(
                "[rule:{}] query returned status {}",
                rule.id,
                response.status()
            );
            return;
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                error!("[rule:{}] failed to read query response: {e}", rule.id);
                return;
            }
        };
        if body.trim().is_empty() {
            return;
        }

        // One JSON document per line; empty lines are padding.
        let evidence: Vec<Evidence> = body
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| Evidence {
                content: line.to_string(),
                fingerprint: fingerprint(rule.id, line),
            })
            .collect();

        let outcome = match self.store.fold_evidence(rule, &evidence, now) {
            Ok(Some(outcome)) => outcome,
            Ok(None) => return,
            Err(e) => {
                error!("[rule:{}] folding failed, abandoning tick: {e}", rule.id);
                return;
            }
        };

        if outcome.new_alerts > 0 {
            info!(
                "[rule:{}] {} new alert(s) folded into incident {}",
                rule.id, outcome.new_alerts, outcome.incident.id
            );
            // Fire-and-forget: playbook execution must not block the
            // scheduler tick.
            tokio::spawn(dispatch_by_incident(
                self.automation.clone(),
                outcome.incident,
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use axum::extract::State;
    use axum::routing::post;
    use axum::{Form, Router};
    use serde_json::json;
    use vsentry_common::{ExecutionStatus, IncidentStatus, TriggerType};
    use vsentry_store::{NewPlaybook, NewRule};

    #[test]
    fn fingerprint_is_stable_and_rule_scoped() {
        let a = fingerprint(1, r#"{"msg":"failed login"}"#);
        let b = fingerprint(1, r#"{"msg":"failed login"}"#);
        let c = fingerprint(2, r#"{"msg":"failed login"}"#);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    /// Log-backend stand-in: serves whatever NDJSON body is currently
    /// loaded and records the queries it receives.
    #[derive(Clone, Default)]
    struct Backend {
        body: Arc<Mutex<String>>,
        queries: Arc<Mutex<Vec<String>>>,
    }

    #[derive(serde::Deserialize)]
    struct QueryForm {
        query: String,
        limit: String,
    }

    async fn spawn_backend() -> (Backend, String) {
        let backend = Backend::default();
        let app = Router::new()
            .route(
                "/select/logsql/query",
                post(
                    |State(backend): State<Backend>, Form(form): Form<QueryForm>| async move {
                        assert_eq!(form.limit, "1000");
                        backend.queries.lock().unwrap().push(form.query);
                        backend.body.lock().unwrap().clone()
                    },
                ),
            )
            .with_state(backend.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (backend, format!("http://{addr}/select/logsql/query"))
    }

    fn executor_fixture(store: Arc<Store>, url: String) -> Executor {
        let automation = Arc::new(Engine::new(store.clone()));
        Executor::new(store, automation, url)
    }

    fn seeded_rule(store: &Store) -> Rule {
        store
            .create_rule(&NewRule {
                name: "r1".into(),
                description: String::new(),
                query: "q".into(),
                interval: "@every 1m".into(),
                severity: "high".into(),
                enabled: true,
            })
            .unwrap()
    }

    #[tokio::test]
    async fn query_is_time_bounded() {
        let (backend, url) = spawn_backend().await;
        let store = Arc::new(Store::open_in_memory().unwrap());
        let rule = seeded_rule(&store);
        let executor = executor_fixture(store, url);

        executor.execute_rule(&rule).await;

        let queries = backend.queries.lock().unwrap();
        assert_eq!(queries.len(), 1);
        assert!(queries[0].starts_with("(q) AND _time:["));
        assert!(queries[0].ends_with("Z]"));
    }

    #[tokio::test]
    async fn identical_lines_fold_once() {
        let (backend, url) = spawn_backend().await;
        let store = Arc::new(Store::open_in_memory().unwrap());
        let rule = seeded_rule(&store);
        let executor = executor_fixture(store.clone(), url);

        let line = r#"{"msg":"failed login","host":"web-1"}"#;
        *backend.body.lock().unwrap() = format!("{line}\n{line}\n");

        executor.execute_rule(&rule).await;
        let incidents = store.list_incidents().unwrap();
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].alert_count, 1);

        // Second tick over the identical response: nothing changes.
        executor.execute_rule(&rule).await;
        let incidents = store.list_incidents().unwrap();
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].alert_count, 1);
        assert_eq!(store.alerts_for_incident(incidents[0].id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn resolution_starts_a_new_incident() {
        let (backend, url) = spawn_backend().await;
        let store = Arc::new(Store::open_in_memory().unwrap());
        let rule = seeded_rule(&store);
        let executor = executor_fixture(store.clone(), url);

        *backend.body.lock().unwrap() = "{\"n\":1}\n".into();
        executor.execute_rule(&rule).await;

        *backend.body.lock().unwrap() = "{\"n\":1}\n{\"n\":2}\n".into();
        executor.execute_rule(&rule).await;

        let incidents = store.list_incidents().unwrap();
        assert_eq!(incidents.len(), 1);
        let first = incidents[0].clone();
        assert_eq!(first.alert_count, 2);

        store
            .set_incident_status(first.id, IncidentStatus::Resolved, None, None)
            .unwrap();

        *backend.body.lock().unwrap() = "{\"n\":3}\n".into();
        executor.execute_rule(&rule).await;

        let incidents = store.list_incidents().unwrap();
        assert_eq!(incidents.len(), 2);
        let fresh = incidents
            .iter()
            .find(|i| i.id != first.id)
            .expect("new incident");
        assert_eq!(fresh.alert_count, 1);
        assert_eq!(
            store.get_incident(first.id).unwrap().unwrap().alert_count,
            2
        );
    }

    #[tokio::test]
    async fn unreachable_backend_abandons_the_tick() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let rule = seeded_rule(&store);
        // Nothing listens here; the request fails and the tick is dropped.
        let executor = executor_fixture(store.clone(), "http://127.0.0.1:9/query".into());

        executor.execute_rule(&rule).await;
        assert!(store.list_incidents().unwrap().is_empty());
    }

    #[tokio::test]
    async fn new_evidence_dispatches_linked_playbooks_once() {
        let (backend, url) = spawn_backend().await;
        let store = Arc::new(Store::open_in_memory().unwrap());
        let rule = seeded_rule(&store);
        store
            .create_playbook(&NewPlaybook {
                name: "notify".into(),
                description: String::new(),
                is_active: true,
                trigger_type: TriggerType::Incident,
                definition: json!({
                    "nodes": [{"id": "t", "type": "input",
                               "data": {"label": "t", "type": "trigger", "config": {}}}],
                    "edges": []
                }),
                rule_ids: vec![rule.id],
            })
            .unwrap();
        let executor = executor_fixture(store.clone(), url);

        *backend.body.lock().unwrap() = "{\"n\":1}\n".into();
        executor.execute_rule(&rule).await;
        // Duplicate tick: no new evidence, no second dispatch.
        executor.execute_rule(&rule).await;

        let mut executions = vec![];
        for _ in 0..50 {
            executions = store.list_executions(None).unwrap();
            if !executions.is_empty() && executions[0].status != ExecutionStatus::Running {
                break;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
        }
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, ExecutionStatus::Success);
    }
}
