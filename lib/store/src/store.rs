//! Relational persistence on SQLite.
//!
//! # Design
//! A single [`rusqlite::Connection`] behind a mutex, jbaker07-style: the
//! write volume here is configuration CRUD plus one folding transaction per
//! rule tick, so connection pooling would buy nothing. Timestamps are
//! stored as RFC 3339 text, ids are SQLite rowids.
//!
//! # Invariants enforced at this layer
//! - `alerts.fingerprint` carries a unique index; `INSERT OR IGNORE` makes
//!   evidence insertion idempotent.
//! - [`Store::fold_evidence`] runs in one transaction so an incident and
//!   its first alert rows cannot be torn apart by a crash.

use std::path::Path;
use std::sync::Mutex;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Deserialize;
use serde_json::Value;

use vsentry_common::{
    Alert, ExecutionStatus, Incident, IncidentStatus, IngestAuth, IngestConfig, Playbook,
    PlaybookExecution, Rule, TriggerType,
};

/// One line of evidence ready for insertion: the raw log line plus the
/// fingerprint the executor computed for it.
#[derive(Debug, Clone)]
pub struct Evidence {
    pub content: String,
    pub fingerprint: String,
}

/// Result of folding a batch of evidence into the incident table.
#[derive(Debug, Clone)]
pub struct FoldOutcome {
    pub incident: Incident,
    /// How many alert rows were actually inserted (duplicates excluded).
    pub new_alerts: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewRule {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub query: String,
    pub interval: String,
    pub severity: String,
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewPlaybook {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_active: bool,
    pub trigger_type: TriggerType,
    pub definition: Value,
    #[serde(default)]
    pub rule_ids: Vec<i64>,
}

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS ingest_configs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                endpoint TEXT NOT NULL DEFAULT '',
                stream_fields TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS ingest_auths (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ingest_id INTEGER NOT NULL,
                secret_key TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_ingest_auths_ingest
                ON ingest_auths(ingest_id);

            CREATE TABLE IF NOT EXISTS rules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                query TEXT NOT NULL,
                interval TEXT NOT NULL,
                severity TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 0,
                version INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS incidents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                rule_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                severity TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'new',
                alert_count INTEGER NOT NULL DEFAULT 0,
                first_seen TEXT NOT NULL,
                last_seen TEXT NOT NULL,
                assignee TEXT,
                closing_classification TEXT,
                closing_comment TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_incidents_rule_status
                ON incidents(rule_id, status);

            CREATE TABLE IF NOT EXISTS alerts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                incident_id INTEGER NOT NULL,
                rule_id INTEGER NOT NULL,
                content TEXT NOT NULL,
                fingerprint TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_alerts_fingerprint
                ON alerts(fingerprint);

            CREATE INDEX IF NOT EXISTS idx_alerts_incident
                ON alerts(incident_id);

            CREATE TABLE IF NOT EXISTS playbooks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                is_active INTEGER NOT NULL DEFAULT 0,
                trigger_type TEXT NOT NULL DEFAULT 'manual',
                definition TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS rule_playbooks (
                rule_id INTEGER NOT NULL,
                playbook_id INTEGER NOT NULL,
                PRIMARY KEY (rule_id, playbook_id)
            );

            CREATE TABLE IF NOT EXISTS playbook_executions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                playbook_id INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'running',
                start_time TEXT NOT NULL,
                end_time TEXT,
                duration_ms INTEGER,
                logs TEXT NOT NULL DEFAULT '{}'
            );

            CREATE INDEX IF NOT EXISTS idx_executions_playbook
                ON playbook_executions(playbook_id);
            "#,
        )?;
        Ok(())
    }

    // Ingest configuration

    pub fn list_ingest_configs(&self) -> Result<Vec<IngestConfig>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, endpoint, stream_fields, created_at, updated_at
             FROM ingest_configs ORDER BY id",
        )?;
        let configs = stmt
            .query_map([], ingest_config_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(configs)
    }

    pub fn get_ingest_config(&self, id: i64) -> Result<Option<IngestConfig>> {
        let conn = self.conn.lock().unwrap();
        let config = conn
            .query_row(
                "SELECT id, name, endpoint, stream_fields, created_at, updated_at
                 FROM ingest_configs WHERE id = ?1",
                params![id],
                ingest_config_row,
            )
            .optional()?;
        Ok(config)
    }

    pub fn create_ingest_config(
        &self,
        name: &str,
        endpoint: &str,
        stream_fields: &str,
    ) -> Result<IngestConfig> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();
        conn.execute(
            "INSERT INTO ingest_configs (name, endpoint, stream_fields, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![name, endpoint, stream_fields, now, now],
        )?;
        let id = conn.last_insert_rowid();
        let config = conn.query_row(
            "SELECT id, name, endpoint, stream_fields, created_at, updated_at
             FROM ingest_configs WHERE id = ?1",
            params![id],
            ingest_config_row,
        )?;
        Ok(config)
    }

    pub fn update_ingest_config(
        &self,
        id: i64,
        name: &str,
        endpoint: &str,
        stream_fields: &str,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE ingest_configs
             SET name = ?2, endpoint = ?3, stream_fields = ?4, updated_at = ?5
             WHERE id = ?1",
            params![id, name, endpoint, stream_fields, Utc::now()],
        )?;
        Ok(changed > 0)
    }

    /// Delete a config and every token bound to it. Returns the removed
    /// tokens so the caller can invalidate their cache entries.
    pub fn delete_ingest_config(&self, id: i64) -> Result<Vec<IngestAuth>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let auths = {
            let mut stmt = tx.prepare(
                "SELECT id, ingest_id, secret_key, created_at
                 FROM ingest_auths WHERE ingest_id = ?1",
            )?;
            stmt.query_map(params![id], auth_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };
        tx.execute("DELETE FROM ingest_auths WHERE ingest_id = ?1", params![id])?;
        tx.execute("DELETE FROM ingest_configs WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(auths)
    }

    pub fn auths_for_config(&self, ingest_id: i64) -> Result<Vec<IngestAuth>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, ingest_id, secret_key, created_at
             FROM ingest_auths WHERE ingest_id = ?1 ORDER BY id",
        )?;
        let auths = stmt
            .query_map(params![ingest_id], auth_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(auths)
    }

    pub fn auth_by_token(&self, token: &str) -> Result<Option<IngestAuth>> {
        let conn = self.conn.lock().unwrap();
        let auth = conn
            .query_row(
                "SELECT id, ingest_id, secret_key, created_at
                 FROM ingest_auths WHERE secret_key = ?1",
                params![token],
                auth_row,
            )
            .optional()?;
        Ok(auth)
    }

    pub fn create_ingest_auth(&self, ingest_id: i64, secret_key: &str) -> Result<IngestAuth> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO ingest_auths (ingest_id, secret_key, created_at) VALUES (?1, ?2, ?3)",
            params![ingest_id, secret_key, Utc::now()],
        )?;
        let id = conn.last_insert_rowid();
        let auth = conn.query_row(
            "SELECT id, ingest_id, secret_key, created_at FROM ingest_auths WHERE id = ?1",
            params![id],
            auth_row,
        )?;
        Ok(auth)
    }

    /// Delete one token binding, returning it for cache invalidation.
    pub fn delete_ingest_auth(&self, id: i64) -> Result<Option<IngestAuth>> {
        let conn = self.conn.lock().unwrap();
        let auth = conn
            .query_row(
                "SELECT id, ingest_id, secret_key, created_at FROM ingest_auths WHERE id = ?1",
                params![id],
                auth_row,
            )
            .optional()?;
        if auth.is_some() {
            conn.execute("DELETE FROM ingest_auths WHERE id = ?1", params![id])?;
        }
        Ok(auth)
    }

    // Rules

    pub fn list_rules(&self) -> Result<Vec<Rule>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!("{RULE_SELECT} ORDER BY id"))?;
        let rules = stmt
            .query_map([], rule_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rules)
    }

    pub fn enabled_rules(&self) -> Result<Vec<Rule>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!("{RULE_SELECT} WHERE enabled = 1 ORDER BY id"))?;
        let rules = stmt
            .query_map([], rule_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rules)
    }

    pub fn get_rule(&self, id: i64) -> Result<Option<Rule>> {
        let conn = self.conn.lock().unwrap();
        let rule = conn
            .query_row(&format!("{RULE_SELECT} WHERE id = ?1"), params![id], rule_row)
            .optional()?;
        Ok(rule)
    }

    pub fn create_rule(&self, new: &NewRule) -> Result<Rule> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();
        conn.execute(
            "INSERT INTO rules (name, description, query, interval, severity, enabled, version,
                                created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?8)",
            params![
                new.name,
                new.description,
                new.query,
                new.interval,
                new.severity,
                new.enabled,
                now,
                now
            ],
        )?;
        let id = conn.last_insert_rowid();
        let rule = conn.query_row(&format!("{RULE_SELECT} WHERE id = ?1"), params![id], rule_row)?;
        Ok(rule)
    }

    /// Full-field update; bumps the monotonic version counter.
    pub fn update_rule(&self, id: i64, new: &NewRule) -> Result<Option<Rule>> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE rules
             SET name = ?2, description = ?3, query = ?4, interval = ?5, severity = ?6,
                 enabled = ?7, version = version + 1, updated_at = ?8
             WHERE id = ?1",
            params![
                id,
                new.name,
                new.description,
                new.query,
                new.interval,
                new.severity,
                new.enabled,
                Utc::now()
            ],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        let rule = conn.query_row(&format!("{RULE_SELECT} WHERE id = ?1"), params![id], rule_row)?;
        Ok(Some(rule))
    }

    pub fn delete_rule(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute("DELETE FROM rules WHERE id = ?1", params![id])?;
        conn.execute("DELETE FROM rule_playbooks WHERE rule_id = ?1", params![id])?;
        Ok(changed > 0)
    }

    // Incidents and evidence

    pub fn list_incidents(&self) -> Result<Vec<Incident>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!("{INCIDENT_SELECT} ORDER BY last_seen DESC"))?;
        let incidents = stmt
            .query_map([], incident_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(incidents)
    }

    pub fn get_incident(&self, id: i64) -> Result<Option<Incident>> {
        let conn = self.conn.lock().unwrap();
        get_incident(&conn, id)
    }

    pub fn alerts_for_incident(&self, incident_id: i64) -> Result<Vec<Alert>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, incident_id, rule_id, content, fingerprint, created_at
             FROM alerts WHERE incident_id = ?1 ORDER BY id",
        )?;
        let alerts = stmt
            .query_map(params![incident_id], alert_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(alerts)
    }

    pub fn set_incident_status(
        &self,
        id: i64,
        status: IncidentStatus,
        closing_classification: Option<&str>,
        closing_comment: Option<&str>,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE incidents
             SET status = ?2,
                 closing_classification = COALESCE(?3, closing_classification),
                 closing_comment = COALESCE(?4, closing_comment)
             WHERE id = ?1",
            params![id, status.as_str(), closing_classification, closing_comment],
        )?;
        Ok(changed > 0)
    }

    pub fn assign_incident(&self, id: i64, assignee: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE incidents SET assignee = ?2 WHERE id = ?1",
            params![id, assignee],
        )?;
        Ok(changed > 0)
    }

    /// Fold a batch of evidence for `rule` into the incident table, all in
    /// one transaction:
    ///
    /// 1. reuse the most recent non-resolved incident for the rule, or
    ///    create a fresh one;
    /// 2. `INSERT OR IGNORE` each line by fingerprint, counting the rows
    ///    that actually landed;
    /// 3. if anything landed, bump `alert_count` and `last_seen`.
    ///
    /// Returns `None` when `evidence` is empty. The caller decides whether
    /// to dispatch playbooks based on [`FoldOutcome::new_alerts`].
    pub fn fold_evidence(
        &self,
        rule: &Rule,
        evidence: &[Evidence],
        now: DateTime<Utc>,
    ) -> Result<Option<FoldOutcome>> {
        if evidence.is_empty() {
            return Ok(None);
        }

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let open = tx
            .query_row(
                &format!(
                    "{INCIDENT_SELECT} WHERE rule_id = ?1 AND status != 'resolved'
                     ORDER BY last_seen DESC LIMIT 1"
                ),
                params![rule.id],
                incident_row,
            )
            .optional()?;

        let incident_id = match &open {
            Some(incident) => incident.id,
            None => {
                tx.execute(
                    "INSERT INTO incidents (rule_id, name, severity, status, alert_count,
                                            first_seen, last_seen)
                     VALUES (?1, ?2, ?3, 'new', 0, ?4, ?5)",
                    params![rule.id, rule.name, rule.severity, now, now],
                )?;
                tx.last_insert_rowid()
            }
        };

        let mut new_alerts = 0usize;
        for line in evidence {
            new_alerts += tx.execute(
                "INSERT OR IGNORE INTO alerts (incident_id, rule_id, content, fingerprint,
                                               created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![incident_id, rule.id, line.content, line.fingerprint, now],
            )?;
        }

        if new_alerts > 0 {
            tx.execute(
                "UPDATE incidents SET alert_count = alert_count + ?2, last_seen = ?3
                 WHERE id = ?1",
                params![incident_id, new_alerts as i64, now],
            )?;
        }

        let incident = get_incident(&tx, incident_id)?
            .ok_or_else(|| anyhow::anyhow!("incident {incident_id} vanished mid-transaction"))?;
        tx.commit()?;

        Ok(Some(FoldOutcome {
            incident,
            new_alerts,
        }))
    }

    // Playbooks

    pub fn list_playbooks(&self) -> Result<Vec<Playbook>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!("{PLAYBOOK_SELECT} ORDER BY id"))?;
        let playbooks = stmt
            .query_map([], playbook_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(playbooks)
    }

    pub fn get_playbook(&self, id: i64) -> Result<Option<Playbook>> {
        let conn = self.conn.lock().unwrap();
        let playbook = conn
            .query_row(
                &format!("{PLAYBOOK_SELECT} WHERE id = ?1"),
                params![id],
                playbook_row,
            )
            .optional()?;
        Ok(playbook)
    }

    pub fn create_playbook(&self, new: &NewPlaybook) -> Result<Playbook> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let now = Utc::now();
        tx.execute(
            "INSERT INTO playbooks (name, description, is_active, trigger_type, definition,
                                    created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                new.name,
                new.description,
                new.is_active,
                new.trigger_type.as_str(),
                new.definition.to_string(),
                now,
                now
            ],
        )?;
        let id = tx.last_insert_rowid();
        for rule_id in &new.rule_ids {
            tx.execute(
                "INSERT OR IGNORE INTO rule_playbooks (rule_id, playbook_id) VALUES (?1, ?2)",
                params![rule_id, id],
            )?;
        }
        let playbook = tx.query_row(
            &format!("{PLAYBOOK_SELECT} WHERE id = ?1"),
            params![id],
            playbook_row,
        )?;
        tx.commit()?;
        Ok(playbook)
    }

    pub fn update_playbook(&self, id: i64, new: &NewPlaybook) -> Result<Option<Playbook>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE playbooks
             SET name = ?2, description = ?3, is_active = ?4, trigger_type = ?5,
                 definition = ?6, updated_at = ?7
             WHERE id = ?1",
            params![
                id,
                new.name,
                new.description,
                new.is_active,
                new.trigger_type.as_str(),
                new.definition.to_string(),
                Utc::now()
            ],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        tx.execute("DELETE FROM rule_playbooks WHERE playbook_id = ?1", params![id])?;
        for rule_id in &new.rule_ids {
            tx.execute(
                "INSERT OR IGNORE INTO rule_playbooks (rule_id, playbook_id) VALUES (?1, ?2)",
                params![rule_id, id],
            )?;
        }
        let playbook = tx.query_row(
            &format!("{PLAYBOOK_SELECT} WHERE id = ?1"),
            params![id],
            playbook_row,
        )?;
        tx.commit()?;
        Ok(Some(playbook))
    }

    pub fn delete_playbook(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute("DELETE FROM playbooks WHERE id = ?1", params![id])?;
        conn.execute(
            "DELETE FROM rule_playbooks WHERE playbook_id = ?1",
            params![id],
        )?;
        Ok(changed > 0)
    }

    pub fn rules_for_playbook(&self, playbook_id: i64) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT rule_id FROM rule_playbooks WHERE playbook_id = ?1 ORDER BY rule_id",
        )?;
        let ids = stmt
            .query_map(params![playbook_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    /// Active playbooks with `trigger_type = 'incident'` linked to the
    /// given rule through the rule/playbook join table.
    pub fn playbooks_for_incident(&self, rule_id: i64) -> Result<Vec<Playbook>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT p.id, p.name, p.description, p.is_active, p.trigger_type, p.definition,
                    p.created_at, p.updated_at
             FROM playbooks p
             JOIN rule_playbooks rp ON rp.playbook_id = p.id
             WHERE rp.rule_id = ?1 AND p.is_active = 1 AND p.trigger_type = 'incident'
             ORDER BY p.id",
        )?;
        let playbooks = stmt
            .query_map(params![rule_id], playbook_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(playbooks)
    }

    // Executions

    pub fn create_execution(&self, playbook_id: i64, start: DateTime<Utc>) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO playbook_executions (playbook_id, status, start_time, logs)
             VALUES (?1, 'running', ?2, '{}')",
            params![playbook_id, start],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Re-save the aggregated per-node logs map. Called after every node so
    /// a polling UI observes partial progress.
    pub fn update_execution_logs(&self, id: i64, logs: &Value) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE playbook_executions SET logs = ?2 WHERE id = ?1",
            params![id, logs.to_string()],
        )?;
        Ok(())
    }

    pub fn finish_execution(
        &self,
        id: i64,
        status: ExecutionStatus,
        end: DateTime<Utc>,
        duration_ms: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE playbook_executions SET status = ?2, end_time = ?3, duration_ms = ?4
             WHERE id = ?1",
            params![id, status.as_str(), end, duration_ms],
        )?;
        Ok(())
    }

    pub fn get_execution(&self, id: i64) -> Result<Option<PlaybookExecution>> {
        let conn = self.conn.lock().unwrap();
        let execution = conn
            .query_row(
                &format!("{EXECUTION_SELECT} WHERE id = ?1"),
                params![id],
                execution_row,
            )
            .optional()?;
        Ok(execution)
    }

    pub fn list_executions(&self, playbook_id: Option<i64>) -> Result<Vec<PlaybookExecution>> {
        let conn = self.conn.lock().unwrap();
        let executions = match playbook_id {
            Some(playbook_id) => {
                let mut stmt = conn.prepare(&format!(
                    "{EXECUTION_SELECT} WHERE playbook_id = ?1 ORDER BY id DESC LIMIT 100"
                ))?;
                stmt.query_map(params![playbook_id], execution_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt =
                    conn.prepare(&format!("{EXECUTION_SELECT} ORDER BY id DESC LIMIT 100"))?;
                stmt.query_map([], execution_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(executions)
    }
}

const RULE_SELECT: &str = "SELECT id, name, description, query, interval, severity, enabled, \
                           version, created_at, updated_at FROM rules";

const INCIDENT_SELECT: &str = "SELECT id, rule_id, name, severity, status, alert_count, \
                               first_seen, last_seen, assignee, closing_classification, \
                               closing_comment FROM incidents";

const PLAYBOOK_SELECT: &str = "SELECT id, name, description, is_active, trigger_type, definition, \
                               created_at, updated_at FROM playbooks";

const EXECUTION_SELECT: &str = "SELECT id, playbook_id, status, start_time, end_time, \
                                duration_ms, logs FROM playbook_executions";

fn get_incident(conn: &Connection, id: i64) -> Result<Option<Incident>> {
    let incident = conn
        .query_row(
            &format!("{INCIDENT_SELECT} WHERE id = ?1"),
            params![id],
            incident_row,
        )
        .optional()?;
    Ok(incident)
}

fn ingest_config_row(row: &Row) -> rusqlite::Result<IngestConfig> {
    Ok(IngestConfig {
        id: row.get(0)?,
        name: row.get(1)?,
        endpoint: row.get(2)?,
        stream_fields: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn auth_row(row: &Row) -> rusqlite::Result<IngestAuth> {
    Ok(IngestAuth {
        id: row.get(0)?,
        ingest_id: row.get(1)?,
        secret_key: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn rule_row(row: &Row) -> rusqlite::Result<Rule> {
    Ok(Rule {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        query: row.get(3)?,
        interval: row.get(4)?,
        severity: row.get(5)?,
        enabled: row.get(6)?,
        version: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn incident_row(row: &Row) -> rusqlite::Result<Incident> {
    let status: String = row.get(4)?;
    Ok(Incident {
        id: row.get(0)?,
        rule_id: row.get(1)?,
        name: row.get(2)?,
        severity: row.get(3)?,
        status: status
            .parse()
            .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, e.into()))?,
        alert_count: row.get(5)?,
        first_seen: row.get(6)?,
        last_seen: row.get(7)?,
        assignee: row.get(8)?,
        closing_classification: row.get(9)?,
        closing_comment: row.get(10)?,
    })
}

fn alert_row(row: &Row) -> rusqlite::Result<Alert> {
    Ok(Alert {
        id: row.get(0)?,
        incident_id: row.get(1)?,
        rule_id: row.get(2)?,
        content: row.get(3)?,
        fingerprint: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn playbook_row(row: &Row) -> rusqlite::Result<Playbook> {
    let trigger: String = row.get(4)?;
    let definition: String = row.get(5)?;
    Ok(Playbook {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        is_active: row.get(3)?,
        trigger_type: trigger
            .parse()
            .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, e.into()))?,
        definition: serde_json::from_str(&definition)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn execution_row(row: &Row) -> rusqlite::Result<PlaybookExecution> {
    let status: String = row.get(2)?;
    let logs: String = row.get(6)?;
    Ok(PlaybookExecution {
        id: row.get(0)?,
        playbook_id: row.get(1)?,
        status: status
            .parse()
            .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, e.into()))?,
        start_time: row.get(3)?,
        end_time: row.get(4)?,
        duration_ms: row.get(5)?,
        logs: serde_json::from_str(&logs)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use vsentry_common::IncidentStatus;

    fn seeded_rule(store: &Store) -> Rule {
        store
            .create_rule(&NewRule {
                name: "brute force".into(),
                description: String::new(),
                query: "event:login AND outcome:failure".into(),
                interval: "@every 1m".into(),
                severity: "high".into(),
                enabled: true,
            })
            .unwrap()
    }

    fn ev(rule_id: i64, line: &str) -> Evidence {
        Evidence {
            content: line.to_string(),
            fingerprint: format!("{:x}", md5_like(rule_id, line)),
        }
    }

    // Deterministic stand-in; the real fingerprint lives in the scheduler.
    fn md5_like(rule_id: i64, line: &str) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut h = std::collections::hash_map::DefaultHasher::new();
        (rule_id, line).hash(&mut h);
        h.finish()
    }

    #[test]
    fn folding_is_idempotent_per_fingerprint() {
        let store = Store::open_in_memory().unwrap();
        let rule = seeded_rule(&store);
        let now = Utc::now();

        let first = store
            .fold_evidence(&rule, &[ev(rule.id, "L")], now)
            .unwrap()
            .unwrap();
        assert_eq!(first.new_alerts, 1);
        assert_eq!(first.incident.alert_count, 1);

        // Same line again: no new alert row, counts unchanged, same incident.
        let second = store
            .fold_evidence(&rule, &[ev(rule.id, "L")], now)
            .unwrap()
            .unwrap();
        assert_eq!(second.new_alerts, 0);
        assert_eq!(second.incident.id, first.incident.id);
        assert_eq!(second.incident.alert_count, 1);
        assert_eq!(store.alerts_for_incident(first.incident.id).unwrap().len(), 1);
    }

    #[test]
    fn new_evidence_folds_into_open_incident() {
        let store = Store::open_in_memory().unwrap();
        let rule = seeded_rule(&store);
        let now = Utc::now();

        let first = store
            .fold_evidence(&rule, &[ev(rule.id, "L1")], now)
            .unwrap()
            .unwrap();
        let second = store
            .fold_evidence(&rule, &[ev(rule.id, "L2")], now)
            .unwrap()
            .unwrap();

        assert_eq!(second.incident.id, first.incident.id);
        assert_eq!(second.incident.alert_count, 2);
    }

    #[test]
    fn resolution_opens_a_fresh_incident() {
        let store = Store::open_in_memory().unwrap();
        let rule = seeded_rule(&store);
        let now = Utc::now();

        let first = store
            .fold_evidence(&rule, &[ev(rule.id, "L1")], now)
            .unwrap()
            .unwrap();
        store
            .set_incident_status(first.incident.id, IncidentStatus::Resolved, None, Some("done"))
            .unwrap();

        let third = store
            .fold_evidence(&rule, &[ev(rule.id, "L3")], now)
            .unwrap()
            .unwrap();
        assert_ne!(third.incident.id, first.incident.id);
        assert_eq!(third.incident.alert_count, 1);

        // The resolved incident is untouched.
        let resolved = store.get_incident(first.incident.id).unwrap().unwrap();
        assert_eq!(resolved.status, IncidentStatus::Resolved);
        assert_eq!(resolved.alert_count, 1);
    }

    #[test]
    fn alert_count_matches_alert_rows() {
        let store = Store::open_in_memory().unwrap();
        let rule = seeded_rule(&store);
        let now = Utc::now();

        let evidence: Vec<Evidence> = (0..5).map(|i| ev(rule.id, &format!("line-{i}"))).collect();
        let outcome = store.fold_evidence(&rule, &evidence, now).unwrap().unwrap();

        assert_eq!(outcome.incident.alert_count, 5);
        assert_eq!(
            store.alerts_for_incident(outcome.incident.id).unwrap().len() as i64,
            outcome.incident.alert_count
        );
    }

    #[test]
    fn rule_update_bumps_version() {
        let store = Store::open_in_memory().unwrap();
        let rule = seeded_rule(&store);
        assert_eq!(rule.version, 1);

        let updated = store
            .update_rule(
                rule.id,
                &NewRule {
                    name: rule.name.clone(),
                    description: rule.description.clone(),
                    query: "event:login".into(),
                    interval: rule.interval.clone(),
                    severity: rule.severity.clone(),
                    enabled: false,
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(updated.version, 2);
        assert!(!updated.enabled);
    }

    #[test]
    fn deleting_a_config_returns_its_tokens() {
        let store = Store::open_in_memory().unwrap();
        let config = store
            .create_ingest_config("default", "http://lb/insert", "host,source")
            .unwrap();
        store.create_ingest_auth(config.id, "abc").unwrap();
        store.create_ingest_auth(config.id, "def").unwrap();

        let removed = store.delete_ingest_config(config.id).unwrap();
        let mut tokens: Vec<_> = removed.into_iter().map(|a| a.secret_key).collect();
        tokens.sort();
        assert_eq!(tokens, vec!["abc", "def"]);
        assert!(store.get_ingest_config(config.id).unwrap().is_none());
        assert!(store.auth_by_token("abc").unwrap().is_none());
    }

    #[test]
    fn incident_playbook_join_filters_inactive_and_manual() {
        let store = Store::open_in_memory().unwrap();
        let rule = seeded_rule(&store);

        let linked = |trigger: TriggerType, active: bool| NewPlaybook {
            name: "pb".into(),
            description: String::new(),
            is_active: active,
            trigger_type: trigger,
            definition: serde_json::json!({"nodes": [], "edges": []}),
            rule_ids: vec![rule.id],
        };

        let hit = store.create_playbook(&linked(TriggerType::Incident, true)).unwrap();
        store.create_playbook(&linked(TriggerType::Incident, false)).unwrap();
        store.create_playbook(&linked(TriggerType::Manual, true)).unwrap();

        let dispatched = store.playbooks_for_incident(rule.id).unwrap();
        assert_eq!(dispatched.len(), 1);
        assert_eq!(dispatched[0].id, hit.id);
    }

    #[test]
    fn execution_lifecycle_persists_partial_logs() {
        let store = Store::open_in_memory().unwrap();
        let playbook = store
            .create_playbook(&NewPlaybook {
                name: "pb".into(),
                description: String::new(),
                is_active: true,
                trigger_type: TriggerType::Manual,
                definition: serde_json::json!({"nodes": [], "edges": []}),
                rule_ids: vec![],
            })
            .unwrap();

        let start = Utc::now();
        let id = store.create_execution(playbook.id, start).unwrap();

        let partial = serde_json::json!({"n1": {"status": "success", "output": 1}});
        store.update_execution_logs(id, &partial).unwrap();

        let running = store.get_execution(id).unwrap().unwrap();
        assert_eq!(running.status, ExecutionStatus::Running);
        assert_eq!(running.logs, partial);
        assert!(running.end_time.is_none());

        store
            .finish_execution(id, ExecutionStatus::Success, Utc::now(), 42)
            .unwrap();
        let done = store.get_execution(id).unwrap().unwrap();
        assert_eq!(done.status, ExecutionStatus::Success);
        assert_eq!(done.duration_ms, Some(42));
    }
}
