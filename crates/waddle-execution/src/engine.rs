use std::time::{Duration, Instant};

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, error, warn};
use waddle_core::types::{CommandRequest, CommandResult};
use waddle_registry::{Command, CommandType};

pub const USER_AGENT: &str = "WaddleBot-Router/1.0";

/// Dispatches commands to their execution backend: local containers,
/// serverless functions (Lambda / OpenWhisk), or plain webhooks.
///
/// One pooled client serves every backend; each request carries the
/// command's own timeout. Only Lambda gets retries — the other backends
/// are single-shot and report their failure upstream.
pub struct ExecutionEngine {
    client: Client,
    default_timeout: Duration,
    max_retries: u32,
    openwhisk_auth: Option<String>,
}

impl ExecutionEngine {
    pub fn new(default_timeout_secs: u64, max_retries: u32, openwhisk_auth: Option<String>) -> Self {
        Self {
            client: Client::new(),
            default_timeout: Duration::from_secs(default_timeout_secs),
            max_retries,
            openwhisk_auth: openwhisk_auth.filter(|k| !k.is_empty()),
        }
    }

    /// The payload envelope every backend receives.
    pub fn build_payload(request: &CommandRequest, user_context: Option<&Value>) -> Value {
        json!({
            "command": request.command,
            "parameters": request.parameters,
            "user": {
                "id": request.user_id,
                "name": request.user_name,
            },
            "context": {
                "platform": request.platform,
                "server_id": request.server_id,
                "channel_id": request.channel_id,
                "entity_id": request.entity_id,
                "message_id": request.message_id,
                "timestamp": request.timestamp.to_rfc3339(),
            },
            "raw_message": request.raw_message,
            "user_context": user_context.cloned().unwrap_or_else(|| json!({})),
        })
    }

    /// Execute a command and report the outcome; never returns Err — every
    /// failure mode is folded into the result so the pipeline can log it.
    pub async fn execute(
        &self,
        command: &Command,
        request: &CommandRequest,
        user_context: Option<&Value>,
    ) -> CommandResult {
        let started = Instant::now();
        let payload = Self::build_payload(request, user_context);

        let mut result = match command.kind {
            CommandType::Lambda => self.execute_with_retries(command, &payload).await,
            CommandType::Container | CommandType::Webhook | CommandType::Openwhisk => {
                self.single_attempt(command, &payload).await
            }
        };
        result.execution_time_ms = started.elapsed().as_millis() as i64;

        if result.success {
            debug!(
                command = %command.command,
                status = result.status_code,
                elapsed_ms = result.execution_time_ms,
                "command executed"
            );
        } else {
            warn!(
                command = %command.command,
                status = result.status_code,
                error = result.error_message.as_deref().unwrap_or(""),
                "command execution failed"
            );
        }
        result
    }

    async fn single_attempt(&self, command: &Command, payload: &Value) -> CommandResult {
        match self.send(command, payload).await {
            Ok(result) => result,
            Err(e) => transport_failure(&e),
        }
    }

    /// Lambda path: transient failures and timeouts retry with exponential
    /// backoff (2^attempt seconds) up to the configured budget.
    async fn execute_with_retries(&self, command: &Command, payload: &Value) -> CommandResult {
        for attempt in 0..=self.max_retries {
            match self.send(command, payload).await {
                Ok(mut result) => {
                    result.retry_count = attempt;
                    return result;
                }
                Err(e) if attempt < self.max_retries => {
                    warn!(
                        command = %command.command,
                        attempt,
                        error = %e,
                        "transient backend error; backing off"
                    );
                    tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                }
                Err(e) => {
                    let mut result = if e.is_timeout() {
                        CommandResult::failure(408, "Request timeout", 0)
                    } else {
                        transport_failure(&e)
                    };
                    result.retry_count = attempt;
                    return result;
                }
            }
        }
        unreachable!("retry loop always returns");
    }

    async fn send(&self, command: &Command, payload: &Value) -> reqwest::Result<CommandResult> {
        let method =
            Method::from_bytes(command.method.to_uppercase().as_bytes()).unwrap_or(Method::POST);
        let timeout = if command.timeout_secs > 0 {
            Duration::from_secs(command.timeout_secs)
        } else {
            self.default_timeout
        };

        let mut request = self
            .client
            .request(method.clone(), &command.location_url)
            .timeout(timeout)
            .headers(self.headers_for(command));

        // GET carries the envelope's scalar fields as query parameters;
        // body-bearing methods get the full JSON envelope.
        if method == Method::GET {
            request = request.query(&flatten_for_query(payload));
        } else {
            request = request.json(payload);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let response_data = parse_body(&body);

        Ok(CommandResult {
            success: status.is_success(),
            response_data,
            execution_time_ms: 0,
            status_code: status.as_u16(),
            error_message: error_for_status(status),
            retry_count: 0,
        })
    }

    fn headers_for(&self, command: &Command) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert("user-agent", HeaderValue::from_static(USER_AGENT));
        headers.insert("x-waddlebot-source", HeaderValue::from_static("router"));
        headers.insert(
            "x-waddlebot-type",
            HeaderValue::from_static(match command.kind {
                CommandType::Container => "local-interaction",
                _ => "community-interaction",
            }),
        );

        if command.kind == CommandType::Openwhisk {
            if let Some(auth) = &self.openwhisk_auth {
                match HeaderValue::from_str(&format!("Basic {}", auth)) {
                    Ok(value) => {
                        headers.insert("authorization", value);
                    }
                    Err(e) => error!(error = %e, "invalid openwhisk auth key"),
                }
            }
        }

        if let Some(extra) = &command.headers {
            for (name, value) in extra {
                match (
                    HeaderName::from_bytes(name.as_bytes()),
                    HeaderValue::from_str(value),
                ) {
                    (Ok(name), Ok(value)) => {
                        headers.insert(name, value);
                    }
                    _ => warn!(header = %name, "skipping invalid command header"),
                }
            }
        }
        headers
    }
}

/// JSON body if it parses, otherwise the raw text wrapped for the caller.
fn parse_body(body: &str) -> Value {
    match serde_json::from_str(body) {
        Ok(value) => value,
        Err(_) => json!({ "response": body }),
    }
}

fn error_for_status(status: StatusCode) -> Option<String> {
    if status.is_success() {
        None
    } else {
        Some(format!("HTTP {}", status.as_u16()))
    }
}

fn transport_failure(e: &reqwest::Error) -> CommandResult {
    if e.is_timeout() {
        CommandResult::failure(408, "Request timeout", 0)
    } else {
        CommandResult::failure(500, &format!("Request failed: {}", e), 0)
    }
}

/// Top-level scalars of the envelope, stringified for a GET query.
fn flatten_for_query(payload: &Value) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let Some(map) = payload.as_object() else {
        return pairs;
    };
    for (key, value) in map {
        match value {
            Value::String(s) => pairs.push((key.clone(), s.clone())),
            Value::Object(inner) => {
                for (inner_key, inner_value) in inner {
                    let flat = match inner_value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    pairs.push((format!("{}_{}", key, inner_key), flat));
                }
            }
            other => pairs.push((key.clone(), other.to_string())),
        }
    }
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;
    use waddle_core::types::parse_message;

    fn request() -> CommandRequest {
        parse_message("!help me", "twitch", "42", "", "u1", "alice").unwrap()
    }

    #[test]
    fn payload_envelope_is_stable() {
        let req = request();
        let payload = ExecutionEngine::build_payload(&req, None);

        assert_eq!(payload["command"], "help");
        assert_eq!(payload["parameters"], json!(["me"]));
        assert_eq!(payload["user"]["id"], "u1");
        assert_eq!(payload["user"]["name"], "alice");
        assert_eq!(payload["context"]["platform"], "twitch");
        assert_eq!(payload["context"]["entity_id"], "twitch+42");
        assert_eq!(payload["raw_message"], "!help me");
        assert_eq!(payload["user_context"], json!({}));
    }

    #[test]
    fn payload_carries_user_context() {
        let req = request();
        let ctx = json!({"role": "moderator"});
        let payload = ExecutionEngine::build_payload(&req, Some(&ctx));
        assert_eq!(payload["user_context"]["role"], "moderator");
    }

    #[test]
    fn body_parsing_wraps_non_json() {
        assert_eq!(parse_body("{\"text\": \"ok\"}"), json!({"text": "ok"}));
        assert_eq!(parse_body("plain text"), json!({"response": "plain text"}));
    }

    #[test]
    fn query_flattening_stringifies_scalars() {
        let payload = json!({
            "command": "help",
            "parameters": ["a"],
            "user": {"id": "u1", "name": "alice"},
        });
        let pairs = flatten_for_query(&payload);
        assert!(pairs.contains(&("command".to_string(), "help".to_string())));
        assert!(pairs.contains(&("user_id".to_string(), "u1".to_string())));
        assert!(pairs.contains(&("parameters".to_string(), "[\"a\"]".to_string())));
    }
}
