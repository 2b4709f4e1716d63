//! Rule scheduling: one task per enabled rule, firing on its cron
//! expression or `@every` interval.
//!
//! Each rule's task sleeps until the next fire time and then awaits the
//! executor inline, so a run that overlaps its own interval cannot start a
//! second concurrent evaluation (single-flight by construction).
//! [`CronEngine::reload_rules`] is the coarse hot-reload hook: admin rule
//! CRUD cancels every entry and re-registers from the database. Rule
//! counts are small, so the rebuild is cheap.

mod executor;

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Result, anyhow, bail};
use chrono::Utc;
use log::{error, info, warn};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Duration;

use vsentry_common::Rule;

pub use executor::{Executor, fingerprint};

/// A parsed rule schedule: six-field cron (seconds granularity) or the
/// `@every <duration>` shorthand.
#[derive(Debug, Clone)]
enum RuleSchedule {
    Cron(Box<cron::Schedule>),
    Every(Duration),
}

fn parse_schedule(expr: &str) -> Result<RuleSchedule> {
    let expr = expr.trim();
    if let Some(rest) = expr.strip_prefix("@every") {
        let duration = parse_duration(rest.trim())?;
        if duration.is_zero() {
            bail!("@every duration must be > 0");
        }
        return Ok(RuleSchedule::Every(duration));
    }
    let schedule =
        cron::Schedule::from_str(expr).map_err(|e| anyhow!("invalid cron expression: {e}"))?;
    Ok(RuleSchedule::Cron(Box::new(schedule)))
}

/// `90s`, `5m`, `2h`, and compounds like `1h30m`.
fn parse_duration(s: &str) -> Result<Duration> {
    if s.is_empty() {
        bail!("empty duration");
    }
    let mut total = Duration::ZERO;
    let mut digits = String::new();
    for c in s.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        if digits.is_empty() {
            bail!("invalid duration: {s}");
        }
        let n: u64 = digits.parse()?;
        digits.clear();
        total += match c {
            's' => Duration::from_secs(n),
            'm' => Duration::from_secs(n * 60),
            'h' => Duration::from_secs(n * 3600),
            other => bail!("invalid duration unit '{other}' in {s}"),
        };
    }
    if !digits.is_empty() {
        bail!("duration missing unit: {s}");
    }
    Ok(total)
}

pub struct CronEngine {
    executor: Arc<Executor>,
    entries: Mutex<HashMap<i64, JoinHandle<()>>>,
}

impl CronEngine {
    pub fn new(executor: Arc<Executor>) -> Self {
        Self {
            executor,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Cancel every scheduled entry, reload enabled rules, and register
    /// each on its schedule. Holding the entries lock for the whole pass
    /// makes concurrent reloads serialize instead of interleaving.
    pub async fn reload_rules(&self) -> Result<()> {
        let mut entries = self.entries.lock().await;
        for (_, task) in entries.drain() {
            task.abort();
        }

        let rules = self.executor.store().enabled_rules()?;
        let mut scheduled = 0usize;
        for rule in rules {
            let schedule = match parse_schedule(&rule.interval) {
                Ok(schedule) => schedule,
                Err(e) => {
                    error!("failed to schedule rule [{}]: {e}", rule.name);
                    continue;
                }
            };
            let executor = self.executor.clone();
            let rule_id = rule.id;
            entries.insert(rule_id, tokio::spawn(run_entry(executor, rule, schedule)));
            scheduled += 1;
        }

        info!("scheduler: reloaded {scheduled} rules");
        Ok(())
    }

    pub async fn stop(&self) {
        let mut entries = self.entries.lock().await;
        for (_, task) in entries.drain() {
            task.abort();
        }
        info!("scheduler stopped");
    }
}

async fn run_entry(executor: Arc<Executor>, rule: Rule, schedule: RuleSchedule) {
    loop {
        let delay = match &schedule {
            RuleSchedule::Every(duration) => *duration,
            RuleSchedule::Cron(schedule) => match schedule.upcoming(Utc).next() {
                Some(next) => (next - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::from_secs(0)),
                None => {
                    warn!("rule [{}] has no future fire times", rule.name);
                    return;
                }
            },
        };
        tokio::time::sleep(delay).await;
        // Awaited inline: a run outlasting its interval delays the next
        // tick instead of stacking a concurrent one.
        executor.execute_rule(&rule).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_six_field_cron() {
        let schedule = parse_schedule("*/10 * * * * *").unwrap();
        let RuleSchedule::Cron(schedule) = schedule else {
            panic!("expected cron schedule");
        };
        // Fires at seconds granularity.
        let mut upcoming = schedule.upcoming(Utc);
        let a = upcoming.next().unwrap();
        let b = upcoming.next().unwrap();
        assert_eq!((b - a).num_seconds(), 10);
    }

    #[test]
    fn parses_at_every_shorthand() {
        match parse_schedule("@every 5m").unwrap() {
            RuleSchedule::Every(d) => assert_eq!(d, Duration::from_secs(300)),
            _ => panic!("expected interval schedule"),
        }
        match parse_schedule("@every 1h30m").unwrap() {
            RuleSchedule::Every(d) => assert_eq!(d, Duration::from_secs(5400)),
            _ => panic!("expected interval schedule"),
        }
        match parse_schedule("@every 45s").unwrap() {
            RuleSchedule::Every(d) => assert_eq!(d, Duration::from_secs(45)),
            _ => panic!("expected interval schedule"),
        }
    }

    #[test]
    fn rejects_malformed_schedules() {
        assert!(parse_schedule("not a schedule").is_err());
        assert!(parse_schedule("@every").is_err());
        assert!(parse_schedule("@every 10").is_err());
        assert!(parse_schedule("@every 0s").is_err());
        assert!(parse_schedule("@every tenseconds").is_err());
    }

    #[tokio::test]
    async fn reload_registers_enabled_rules_and_is_idempotent() {
        use vsentry_automation::Engine;
        use vsentry_store::{NewRule, Store};

        let store = Arc::new(Store::open_in_memory().unwrap());
        let rule = |name: &str, interval: &str, enabled: bool| NewRule {
            name: name.into(),
            description: String::new(),
            query: "q".into(),
            interval: interval.into(),
            severity: "low".into(),
            enabled,
        };
        let a = store.create_rule(&rule("a", "@every 1h", true)).unwrap();
        let b = store.create_rule(&rule("b", "0 */5 * * * *", true)).unwrap();
        store.create_rule(&rule("c", "@every 1h", false)).unwrap();
        // Unschedulable interval: skipped with an error, not fatal.
        store.create_rule(&rule("d", "whenever", true)).unwrap();

        let automation = Arc::new(Engine::new(store.clone()));
        let executor = Arc::new(Executor::new(
            store.clone(),
            automation,
            "http://127.0.0.1:9/select/logsql/query".into(),
        ));
        let engine = CronEngine::new(executor);

        engine.reload_rules().await.unwrap();
        {
            let entries = engine.entries.lock().await;
            let mut ids: Vec<i64> = entries.keys().copied().collect();
            ids.sort();
            assert_eq!(ids, vec![a.id, b.id]);
        }

        // A second reload with no underlying change produces the same set.
        engine.reload_rules().await.unwrap();
        {
            let entries = engine.entries.lock().await;
            let mut ids: Vec<i64> = entries.keys().copied().collect();
            ids.sort();
            assert_eq!(ids, vec![a.id, b.id]);
        }

        engine.stop().await;
    }
}
