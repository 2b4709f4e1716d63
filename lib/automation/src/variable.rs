//! Template resolution and the expression environment.
//!
//! Node configs may embed `{{ expression }}` occurrences in string values.
//! Each expression is evaluated with rhai against the run's context and
//! substituted back as text. Bare expressions (expression/condition nodes)
//! evaluate through the same environment.
//!
//! The environment exposes:
//! - `incident`: the trigger payload's incident, if any
//! - `steps`: node id → `{status, output, error}` of executed nodes
//! - `env`: the whole trigger payload
//! - helpers: `sprintf`, `to_table_markdown`, `to_table_html`

use std::sync::LazyLock;

use anyhow::{Result, anyhow};
use regex::Regex;
use rhai::serde::{from_dynamic, to_dynamic};
use rhai::{Dynamic, Scope};
use serde_json::{Map, Value, json};

use crate::types::ExecutionContext;

static TEMPLATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{(.*?)\}\}").expect("template regex"));

/// Resolve every `{{ ... }}` occurrence in the string values of `config`.
/// Non-string values pass through unchanged. The first compile or run
/// failure aborts resolution, naming the offending key.
pub fn resolve_variables(
    config: &Map<String, Value>,
    ctx: &ExecutionContext,
) -> Result<Map<String, Value>> {
    let mut resolved = Map::new();

    for (key, value) in config {
        let Value::String(raw) = value else {
            resolved.insert(key.clone(), value.clone());
            continue;
        };

        let matches: Vec<(String, String)> = TEMPLATE_RE
            .captures_iter(raw)
            .map(|c| (c[0].to_string(), c[1].trim().to_string()))
            .collect();

        if matches.is_empty() {
            resolved.insert(key.clone(), value.clone());
            continue;
        }

        let mut out = raw.clone();
        for (occurrence, expression) in matches {
            let evaluated = eval_expression(ctx, &expression)
                .map_err(|e| anyhow!("in {key}: {e}"))?;
            out = out.replacen(&occurrence, &display_value(&evaluated), 1);
        }
        resolved.insert(key.clone(), Value::String(out));
    }

    Ok(resolved)
}

/// Compile and evaluate one expression against the run context.
pub fn eval_expression(ctx: &ExecutionContext, expression: &str) -> Result<Value> {
    let engine = build_engine();
    let ast = engine
        .compile_expression(normalize_quotes(expression))
        .map_err(|e| anyhow!("compile error: {e}"))?;

    let mut scope = build_scope(ctx)?;
    let out = engine
        .eval_ast_with_scope::<Dynamic>(&mut scope, &ast)
        .map_err(|e| anyhow!("run error: {e}"))?;

    from_dynamic(&out).map_err(|e| anyhow!("run error: {e}"))
}

/// Analyst-facing expressions use single-quoted strings
/// (`severity == 'high'`); rhai reserves single quotes for characters.
/// Rewrite them to double quotes outside existing string literals.
fn normalize_quotes(expression: &str) -> String {
    let mut out = String::with_capacity(expression.len());
    let mut in_double = false;
    for c in expression.chars() {
        match c {
            '"' => {
                in_double = !in_double;
                out.push(c);
            }
            '\'' if !in_double => out.push('"'),
            _ => out.push(c),
        }
    }
    out
}

fn build_scope(ctx: &ExecutionContext) -> Result<Scope<'static>> {
    let mut scope = Scope::new();

    let incident = ctx.global.get("incident").cloned().unwrap_or(Value::Null);
    scope.push_dynamic(
        "incident",
        to_dynamic(&incident).map_err(|e| anyhow!("env error: {e}"))?,
    );

    let steps: Map<String, Value> = ctx
        .steps
        .iter()
        .map(|(id, result)| {
            (
                id.clone(),
                json!({
                    "status": result.status,
                    "output": result.output,
                    "error": result.error.clone().unwrap_or_default(),
                }),
            )
        })
        .collect();
    scope.push_dynamic(
        "steps",
        to_dynamic(&Value::Object(steps)).map_err(|e| anyhow!("env error: {e}"))?,
    );

    scope.push_dynamic(
        "env",
        to_dynamic(&Value::Object(ctx.global.clone())).map_err(|e| anyhow!("env error: {e}"))?,
    );

    Ok(scope)
}

fn build_engine() -> rhai::Engine {
    let mut engine = rhai::Engine::new();

    engine.register_fn("sprintf", |fmt: &str| sprintf(fmt, &[]));
    engine.register_fn("sprintf", |fmt: &str, a: Dynamic| sprintf(fmt, &[a]));
    engine.register_fn("sprintf", |fmt: &str, a: Dynamic, b: Dynamic| {
        sprintf(fmt, &[a, b])
    });
    engine.register_fn(
        "sprintf",
        |fmt: &str, a: Dynamic, b: Dynamic, c: Dynamic| sprintf(fmt, &[a, b, c]),
    );
    engine.register_fn(
        "sprintf",
        |fmt: &str, a: Dynamic, b: Dynamic, c: Dynamic, d: Dynamic| sprintf(fmt, &[a, b, c, d]),
    );

    engine.register_fn("to_table_markdown", |rows: Dynamic, a: &str| {
        table_markdown(&rows, &[a])
    });
    engine.register_fn("to_table_markdown", |rows: Dynamic, a: &str, b: &str| {
        table_markdown(&rows, &[a, b])
    });
    engine.register_fn(
        "to_table_markdown",
        |rows: Dynamic, a: &str, b: &str, c: &str| table_markdown(&rows, &[a, b, c]),
    );
    engine.register_fn(
        "to_table_markdown",
        |rows: Dynamic, a: &str, b: &str, c: &str, d: &str| table_markdown(&rows, &[a, b, c, d]),
    );

    engine.register_fn("to_table_html", |rows: Dynamic, a: &str| {
        table_html(&rows, &[a])
    });
    engine.register_fn("to_table_html", |rows: Dynamic, a: &str, b: &str| {
        table_html(&rows, &[a, b])
    });
    engine.register_fn(
        "to_table_html",
        |rows: Dynamic, a: &str, b: &str, c: &str| table_html(&rows, &[a, b, c]),
    );
    engine.register_fn(
        "to_table_html",
        |rows: Dynamic, a: &str, b: &str, c: &str, d: &str| table_html(&rows, &[a, b, c, d]),
    );

    engine
}

/// Go-style formatting: strings bare, scalars via Display, composites as
/// compact JSON, null as the empty string.
pub(crate) fn display_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn display_dynamic(value: &Dynamic) -> String {
    match from_dynamic::<Value>(value) {
        Ok(v) => display_value(&v),
        Err(_) => value.to_string(),
    }
}

/// Minimal printf: `%v`/`%s`/`%d`/`%f` consume the next argument, `%%`
/// escapes. Verbs beyond the argument list are left verbatim.
fn sprintf(fmt: &str, args: &[Dynamic]) -> String {
    let mut out = String::with_capacity(fmt.len());
    let mut args = args.iter();
    let mut chars = fmt.chars();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some(verb @ ('v' | 's' | 'd' | 'f')) => match args.next() {
                Some(arg) => out.push_str(&display_dynamic(arg)),
                None => {
                    out.push('%');
                    out.push(verb);
                }
            },
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

fn rows_of(rows: &Dynamic) -> Option<Vec<Map<String, Value>>> {
    let value: Value = from_dynamic(rows).ok()?;
    let list = value.as_array()?;
    if list.is_empty() {
        return None;
    }
    Some(
        list.iter()
            .filter_map(|row| row.as_object().cloned())
            .collect(),
    )
}

fn table_markdown(rows: &Dynamic, columns: &[&str]) -> String {
    let Some(rows) = rows_of(rows) else {
        return "No Data".to_string();
    };

    let mut out = String::new();
    out.push_str(&format!("| {} |\n", columns.join(" | ")));
    out.push('|');
    for _ in columns {
        out.push_str(" --- |");
    }
    out.push('\n');

    for row in rows {
        let cells: Vec<String> = columns
            .iter()
            .map(|col| display_value(row.get(*col).unwrap_or(&Value::Null)))
            .collect();
        out.push_str(&format!("| {} |\n", cells.join(" | ")));
    }
    out
}

fn table_html(rows: &Dynamic, columns: &[&str]) -> String {
    let Some(rows) = rows_of(rows) else {
        return "<p style='color: gray;'>No Data Available</p>".to_string();
    };

    // Inline styles only: mail clients strip external CSS.
    let mut out = String::from(
        "<table border='1' cellpadding='5' cellspacing='0' style='border-collapse: collapse; \
         width: 100%; font-family: sans-serif; font-size: 14px;'>",
    );

    out.push_str("<tr style='background-color: #f2f2f2; text-align: left;'>");
    for col in columns {
        out.push_str(&format!(
            "<th style='padding: 8px; border: 1px solid #ddd;'>{col}</th>"
        ));
    }
    out.push_str("</tr>");

    for row in rows {
        out.push_str("<tr>");
        for col in columns {
            let cell = match row.get(*col) {
                None | Some(Value::Null) => "-".to_string(),
                Some(v) => display_value(v),
            };
            out.push_str(&format!(
                "<td style='padding: 8px; border: 1px solid #ddd;'>{cell}</td>"
            ));
        }
        out.push_str("</tr>");
    }
    out.push_str("</table>");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StepResult;
    use std::collections::HashMap;

    fn ctx_with_incident(severity: &str) -> ExecutionContext {
        let mut global = Map::new();
        global.insert(
            "incident".to_string(),
            json!({"id": 3, "severity": severity, "name": "brute force", "alert_count": 4}),
        );
        ExecutionContext {
            playbook_id: 1,
            execution_id: 1,
            global,
            steps: HashMap::new(),
        }
    }

    #[test]
    fn evaluates_incident_fields() {
        let ctx = ctx_with_incident("high");
        let out = eval_expression(&ctx, "incident.severity == 'high'").unwrap();
        assert_eq!(out, Value::Bool(true));

        let out = eval_expression(&ctx, "incident.alert_count > 10").unwrap();
        assert_eq!(out, Value::Bool(false));
    }

    #[test]
    fn resolves_templates_in_string_values() {
        let ctx = ctx_with_incident("high");
        let mut config = Map::new();
        config.insert(
            "subject".to_string(),
            json!("[{{ incident.severity }}] {{ incident.name }}"),
        );
        config.insert("retries".to_string(), json!(3));

        let resolved = resolve_variables(&config, &ctx).unwrap();
        assert_eq!(resolved["subject"], json!("[high] brute force"));
        // Non-string values pass through untouched.
        assert_eq!(resolved["retries"], json!(3));
    }

    #[test]
    fn resolution_is_pure() {
        let ctx = ctx_with_incident("low");
        let mut config = Map::new();
        config.insert("v".to_string(), json!("{{ incident.severity }}"));

        let first = resolve_variables(&config, &ctx).unwrap();
        let second = resolve_variables(&config, &ctx).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn resolution_failure_names_the_key() {
        let ctx = ctx_with_incident("high");
        let mut config = Map::new();
        config.insert("body".to_string(), json!("{{ ) nonsense ( }}"));

        let err = resolve_variables(&config, &ctx).unwrap_err().to_string();
        assert!(err.contains("body"), "error should name the key: {err}");
    }

    #[test]
    fn steps_projection_is_visible() {
        let mut ctx = ctx_with_incident("high");
        ctx.steps.insert(
            "query".to_string(),
            StepResult::success(json!({"status_code": 200, "body": "ok"})),
        );

        let out = eval_expression(&ctx, "steps.query.output.status_code").unwrap();
        assert_eq!(out, json!(200));
        let out = eval_expression(&ctx, "steps.query.error").unwrap();
        assert_eq!(out, json!(""));
    }

    #[test]
    fn sprintf_formats_mixed_arguments() {
        let ctx = ctx_with_incident("high");
        let out =
            eval_expression(&ctx, "sprintf('%v alerts on %v', incident.alert_count, incident.name)")
                .unwrap();
        assert_eq!(out, json!("4 alerts on brute force"));
    }

    #[test]
    fn markdown_table_renders_rows() {
        let mut ctx = ctx_with_incident("high");
        ctx.global.insert(
            "rows".to_string(),
            json!([{"host": "web-1", "count": 2}, {"host": "web-2", "count": 5}]),
        );

        let out = eval_expression(&ctx, "to_table_markdown(env.rows, 'host', 'count')").unwrap();
        let text = out.as_str().unwrap();
        assert!(text.starts_with("| host | count |\n| --- | --- |\n"));
        assert!(text.contains("| web-1 | 2 |"));
        assert!(text.contains("| web-2 | 5 |"));
    }

    #[test]
    fn html_table_handles_missing_cells() {
        let mut ctx = ctx_with_incident("high");
        ctx.global
            .insert("rows".to_string(), json!([{"host": "web-1"}]));

        let out = eval_expression(&ctx, "to_table_html(env.rows, 'host', 'count')").unwrap();
        let text = out.as_str().unwrap();
        assert!(text.contains("<th style='padding: 8px; border: 1px solid #ddd;'>host</th>"));
        assert!(text.contains(">web-1</td>"));
        assert!(text.contains(">-</td>"));
    }

    #[test]
    fn empty_rows_degrade_to_placeholder() {
        let mut ctx = ctx_with_incident("high");
        ctx.global.insert("rows".to_string(), json!([]));

        let md = eval_expression(&ctx, "to_table_markdown(env.rows, 'a')").unwrap();
        assert_eq!(md, json!("No Data"));
        let html = eval_expression(&ctx, "to_table_html(env.rows, 'a')").unwrap();
        assert_eq!(html, json!("<p style='color: gray;'>No Data Available</p>"));
    }
}
