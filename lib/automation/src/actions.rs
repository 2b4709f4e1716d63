//! Typed step handlers for playbook nodes.
//!
//! Every handler takes the node's resolved config and returns a
//! [`StepResult`]; failures are values, not errors, so the engine can
//! record them in the execution log and halt traversal.

use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use log::debug;
use serde_json::{Map, Value, json};
use tokio::time::Duration;

use crate::types::{ExecutionContext, StepResult};
use crate::variable::eval_expression;

const HTTP_STEP_TIMEOUT: Duration = Duration::from_secs(30);

/// Response bodies larger than this are truncated before they enter the
/// execution log.
const MAX_RESPONSE_BYTES: usize = 10 * 1024 * 1024;

fn str_field<'a>(config: &'a Map<String, Value>, key: &str) -> &'a str {
    config.get(key).and_then(Value::as_str).unwrap_or_default()
}

/// `http_request` step: url, method (GET default), headers, body.
/// Output: `{status_code, body}`.
pub(crate) async fn run_http_request(
    client: &reqwest::Client,
    config: &Map<String, Value>,
) -> StepResult {
    let url = str_field(config, "url");
    let method = match str_field(config, "method") {
        "" => reqwest::Method::GET,
        name => match reqwest::Method::from_bytes(name.to_uppercase().as_bytes()) {
            Ok(method) => method,
            Err(e) => return StepResult::failed(format!("invalid method {name}: {e}")),
        },
    };

    let mut request = client.request(method, url).timeout(HTTP_STEP_TIMEOUT);

    if let Some(Value::Object(headers)) = config.get("headers") {
        for (name, value) in headers {
            if let Value::String(value) = value {
                request = request.header(name, value);
            }
        }
    }

    if let Some(Value::String(body)) = config.get("body")
        && !body.is_empty()
    {
        request = request.body(body.clone());
    }

    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => return StepResult::failed(e.to_string()),
    };

    let status_code = response.status().as_u16();
    let body = match response.bytes().await {
        Ok(bytes) => {
            let end = bytes.len().min(MAX_RESPONSE_BYTES);
            String::from_utf8_lossy(&bytes[..end]).into_owned()
        }
        Err(e) => return StepResult::failed(e.to_string()),
    };

    debug!("http_request {url} -> {status_code}");
    StepResult::success(json!({"status_code": status_code, "body": body}))
}

/// `send_email` step over SMTP. STARTTLS is opportunistic with certificate
/// verification disabled: internal relays rarely present valid chains, and
/// a refused upgrade downgrades to plaintext rather than failing the run.
/// PLAIN auth only when a password is configured; MAIL FROM is the
/// configured username.
pub(crate) async fn run_send_email(config: &Map<String, Value>) -> StepResult {
    let host = str_field(config, "host");
    let port = config.get("port").and_then(Value::as_u64).unwrap_or(25) as u16;
    let username = str_field(config, "username");
    let password = str_field(config, "password");
    let to = str_field(config, "to");
    let subject = str_field(config, "subject");
    let content = str_field(config, "content");

    let from: Mailbox = match username.parse() {
        Ok(mailbox) => mailbox,
        Err(e) => return StepResult::failed(format!("invalid sender {username}: {e}")),
    };

    let mut message = Message::builder()
        .from(from)
        .subject(subject)
        .header(ContentType::TEXT_HTML);
    for recipient in to.split(',') {
        match recipient.trim().parse::<Mailbox>() {
            Ok(mailbox) => message = message.to(mailbox),
            Err(e) => return StepResult::failed(format!("invalid recipient {recipient}: {e}")),
        }
    }
    let message = match message.body(content.to_string()) {
        Ok(message) => message,
        Err(e) => return StepResult::failed(e.to_string()),
    };

    let tls = match TlsParameters::builder(host.to_string())
        .dangerous_accept_invalid_certs(true)
        .build()
    {
        Ok(tls) => tls,
        Err(e) => return StepResult::failed(e.to_string()),
    };

    let mut transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
        .port(port)
        .tls(Tls::Opportunistic(tls));
    if !password.is_empty() {
        transport = transport.credentials(Credentials::new(username.to_string(), password.to_string()));
    }

    match transport.build().send(message).await {
        Ok(_) => StepResult::success(json!("Email sent successfully")),
        Err(e) => StepResult::failed(e.to_string()),
    }
}

/// `expression` step: the evaluated value becomes the step output.
pub(crate) fn run_expression(config: &Map<String, Value>, ctx: &ExecutionContext) -> StepResult {
    let expression = str_field(config, "expression");
    match eval_expression(ctx, expression) {
        Ok(output) => StepResult::success(output),
        Err(e) => StepResult::failed(e.to_string()),
    }
}

/// `condition` step: same evaluator; the engine coerces the output to a
/// boolean for edge gating.
pub(crate) fn run_condition(config: &Map<String, Value>, ctx: &ExecutionContext) -> StepResult {
    if str_field(config, "expression").is_empty() {
        return StepResult::failed("No valid expression found");
    }
    run_expression(config, ctx)
}
