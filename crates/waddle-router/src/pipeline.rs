use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::future::{join_all, BoxFuture, FutureExt};
use reqwest::{Client, Method};
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use waddle_cache::TtlCache;
use waddle_core::types::{
    message_id, parse_message, CommandRequest, CommandResult, InboundEvent, MessageType,
};
use waddle_execution::{ExecutionEngine, USER_AGENT};
use waddle_ratelimit::RateLimiter;
use waddle_rbac::{types::command_permission, RbacService, RoleScope};
use waddle_registry::{Command, ExecutionMode, RegistryStore};
use waddle_sessions::SessionStore;
use waddle_strings::{RuleAction, StringMatch, StringMatcher};

use crate::error::ApiError;
use crate::reputation::ReputationClient;

/// TTLs for cached permission decisions. Misses are cached briefly so an
/// entity hammering an unprovisioned command does not hammer the store.
const PERMISSION_TTL: Duration = Duration::from_secs(300);
const PERMISSION_NEGATIVE_TTL: Duration = Duration::from_secs(60);

/// Running counters surfaced by `GET /router/metrics`.
#[derive(Default)]
pub struct Metrics {
    commands_processed: AtomicU64,
    commands_successful: AtomicU64,
    commands_failed: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    rate_limits_hit: AtomicU64,
    string_matches: AtomicU64,
    total_execution_time_ms: AtomicU64,
}

impl Metrics {
    fn record_dispatch(&self, result: &CommandResult) {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
        if result.success {
            self.commands_successful.fetch_add(1, Ordering::Relaxed);
        } else {
            self.commands_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.total_execution_time_ms
            .fetch_add(result.execution_time_ms.max(0) as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Value {
        let processed = self.commands_processed.load(Ordering::Relaxed);
        let total_time = self.total_execution_time_ms.load(Ordering::Relaxed);
        json!({
            "commands_processed": processed,
            "commands_successful": self.commands_successful.load(Ordering::Relaxed),
            "commands_failed": self.commands_failed.load(Ordering::Relaxed),
            "cache_hits": self.cache_hits.load(Ordering::Relaxed),
            "cache_misses": self.cache_misses.load(Ordering::Relaxed),
            "rate_limits_hit": self.rate_limits_hit.load(Ordering::Relaxed),
            "string_matches": self.string_matches.load(Ordering::Relaxed),
            "avg_execution_time_ms": if processed > 0 { total_time / processed } else { 0 },
        })
    }

    pub fn success_rate(&self) -> f64 {
        let processed = self.commands_processed.load(Ordering::Relaxed).max(1);
        self.commands_successful.load(Ordering::Relaxed) as f64 / processed as f64 * 100.0
    }
}

/// The dispatch pipeline: everything that happens to one inbound event.
///
/// Composes the registry, cache, rate limiter, string matcher, RBAC,
/// session store, execution engine, and reputation client. One instance
/// serves every request; all mutable state lives in the thread-safe
/// services it holds.
pub struct CommandPipeline {
    registry: Arc<RegistryStore>,
    cache: Arc<TtlCache>,
    limiter: Arc<RateLimiter>,
    engine: Arc<ExecutionEngine>,
    strings: Arc<StringMatcher>,
    sessions: Arc<SessionStore>,
    rbac: Arc<RbacService>,
    reputation: ReputationClient,
    /// Client for string-match webhooks and event-triggered modules.
    http: Client,
    pub metrics: Metrics,
    /// Bounds concurrent dispatches across one batch request.
    batch_workers: Arc<Semaphore>,
    /// Bounds parallel event modules within one request.
    event_workers: usize,
    request_timeout: Duration,
}

impl CommandPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<RegistryStore>,
        cache: Arc<TtlCache>,
        limiter: Arc<RateLimiter>,
        engine: Arc<ExecutionEngine>,
        strings: Arc<StringMatcher>,
        sessions: Arc<SessionStore>,
        rbac: Arc<RbacService>,
        reputation: ReputationClient,
        max_workers: usize,
        event_workers: usize,
        request_timeout_secs: u64,
    ) -> Self {
        info!(max_workers, event_workers, "command pipeline initialized");
        Self {
            registry,
            cache,
            limiter,
            engine,
            strings,
            sessions,
            rbac,
            reputation,
            http: Client::new(),
            metrics: Metrics::default(),
            batch_workers: Arc::new(Semaphore::new(max_workers.max(1))),
            event_workers,
            request_timeout: Duration::from_secs(request_timeout_secs),
        }
    }

    // ── single event ──────────────────────────────────────────────────────────

    /// Run one validated event through the full pipeline and build the
    /// response envelope.
    pub async fn handle_event(&self, event: InboundEvent) -> Result<Value, ApiError> {
        let entity_id = self.registry.ensure_entity(
            &event.platform,
            &event.server_id,
            &event.channel_id,
            &event.user_id,
        )?;
        let session_id = self.sessions.create(&entity_id)?;

        // Global onboarding must not fail the event.
        if let Err(e) = self.rbac.ensure_user_in_global(&event.user_id) {
            error!(user_id = %event.user_id, error = %e, "global community onboarding failed");
        }

        if event.message_type != MessageType::ChatMessage {
            // Non-chat events skip command parsing entirely.
            let reputation = self
                .reputation
                .process(&event.user_id, &entity_id, &event)
                .await;
            let module_results = self.run_event_modules(&event, &entity_id, &session_id).await;
            return Ok(json!({
                "success": true,
                "message_type": event.message_type.as_str(),
                "processed": true,
                "session_id": session_id,
                "reputation_processed": reputation,
                "event_modules_executed": module_results.len(),
                "module_results": module_results,
            }));
        }

        if let Some(request) = parse_message(
            &event.message_content,
            &event.platform,
            &event.server_id,
            &event.channel_id,
            &event.user_id,
            &event.user_name,
        ) {
            let command_name = request.command.clone();
            let result = self.dispatch_command(request).await;
            let reputation = self
                .reputation
                .process(&event.user_id, &entity_id, &event)
                .await;
            let module_results = self.run_event_modules(&event, &entity_id, &session_id).await;
            return Ok(json!({
                "success": result.success,
                "command": command_name,
                "execution_time_ms": result.execution_time_ms,
                "response": result.response_data,
                "status_code": result.status_code,
                "processed": true,
                "session_id": session_id,
                "reputation_processed": reputation,
                "event_modules_executed": module_results.len(),
                "module_results": module_results,
            }));
        }

        // Not a command: content rules get first refusal.
        if let Some(matched) = self.strings.check(&event.message_content, &entity_id)? {
            let request = plain_request(&event, &entity_id);
            let result = self
                .process_string_match(&request, matched, Instant::now())
                .await;
            return Ok(json!({
                "success": result.success,
                "action": "string_match",
                "execution_time_ms": result.execution_time_ms,
                "response": result.response_data,
                "status_code": result.status_code,
                "processed": true,
                "session_id": session_id,
            }));
        }

        let reputation = self
            .reputation
            .process(&event.user_id, &entity_id, &event)
            .await;
        let module_results = self.run_event_modules(&event, &entity_id, &session_id).await;
        Ok(json!({
            "success": true,
            "message": "Not a command",
            "processed": false,
            "session_id": session_id,
            "reputation_processed": reputation,
            "event_modules_executed": module_results.len(),
            "module_results": module_results,
        }))
    }

    // ── command dispatch ──────────────────────────────────────────────────────

    /// Look up, authorize, rate-limit, execute, and audit one command.
    /// Boxed because string-match `command` actions recurse through here.
    pub fn dispatch_command(&self, request: CommandRequest) -> BoxFuture<'_, CommandResult> {
        async move {
            let started = Instant::now();
            let prefix = request
                .raw_message
                .chars()
                .next()
                .map(String::from)
                .unwrap_or_else(|| "!".to_string());

            let Some(command) = self.lookup_command(&prefix, &request.command) else {
                // Unknown command: content rules may still claim the message.
                match self.strings.check(&request.raw_message, &request.entity_id) {
                    Ok(Some(matched)) => {
                        return self.process_string_match(&request, matched, started).await;
                    }
                    Ok(None) => {}
                    Err(e) => error!(error = %e, "string match check failed"),
                }
                return CommandResult::failure(
                    404,
                    &format!("Command '{}' not found", request.command),
                    elapsed_ms(started),
                );
            };

            if !self.check_permission(command.id, &request.entity_id) {
                return CommandResult::failure(
                    403,
                    &format!(
                        "Command '{}' not enabled for this channel",
                        request.command
                    ),
                    elapsed_ms(started),
                );
            }

            // Moderation-style commands additionally require the caller's
            // role to grant the mapped permission; everything else maps to
            // commands.basic, which every role carries.
            let required = command_permission(&request.command);
            let scope = RoleScope::Entity(request.entity_id.clone());
            match self
                .rbac
                .has_permission(&request.user_id, required, Some(&scope))
            {
                Ok(true) => {}
                Ok(false) => {
                    return CommandResult::failure(
                        403,
                        &format!("Not authorized to use command '{}'", request.command),
                        elapsed_ms(started),
                    );
                }
                Err(e) => {
                    error!(user_id = %request.user_id, error = %e, "role resolution failed");
                    return CommandResult::failure(
                        403,
                        &format!("Not authorized to use command '{}'", request.command),
                        elapsed_ms(started),
                    );
                }
            }

            if command.rate_limit > 0
                && !self.limiter.check(
                    command.id,
                    &request.entity_id,
                    &request.user_id,
                    command.rate_limit,
                )
            {
                self.metrics.rate_limits_hit.fetch_add(1, Ordering::Relaxed);
                let mut result =
                    CommandResult::failure(429, "Rate limit exceeded", elapsed_ms(started));
                result.response_data = json!({ "error": "Rate limit exceeded" });
                return result;
            }

            let payload = ExecutionEngine::build_payload(&request, None);
            let result = self.engine.execute(&command, &request, None).await;

            if let Err(e) = self
                .registry
                .record_execution(&request, &command, &result, &payload)
            {
                error!(execution_id = %request.message_id, error = %e, "execution audit write failed");
            }
            self.registry.bump_usage(command.id, &request.entity_id);
            self.metrics.record_dispatch(&result);
            result
        }
        .boxed()
    }

    fn lookup_command(&self, prefix: &str, name: &str) -> Option<Command> {
        let cache_key = format!("command:{}:{}", prefix, name);
        if let Some(cached) = self.cache.get(&cache_key) {
            self.metrics.cache_hits.fetch_add(1, Ordering::Relaxed);
            return serde_json::from_value(cached).ok();
        }
        self.metrics.cache_misses.fetch_add(1, Ordering::Relaxed);

        match self.registry.find_command(prefix, name) {
            Ok(Some(command)) => {
                if let Ok(value) = serde_json::to_value(&command) {
                    self.cache.set(&cache_key, value);
                }
                Some(command)
            }
            Ok(None) => None,
            Err(e) => {
                error!(prefix, name, error = %e, "command lookup failed");
                None
            }
        }
    }

    fn check_permission(&self, command_id: i64, entity_id: &str) -> bool {
        let cache_key = format!("permission:{}:{}", command_id, entity_id);
        if let Some(cached) = self.cache.get(&cache_key) {
            return cached.as_bool().unwrap_or(false);
        }

        let enabled = match self.registry.permission_enabled(command_id, entity_id) {
            Ok(enabled) => enabled,
            Err(e) => {
                error!(command_id, entity_id, error = %e, "permission check failed");
                return false;
            }
        };
        let ttl = if enabled {
            PERMISSION_TTL
        } else {
            PERMISSION_NEGATIVE_TTL
        };
        self.cache.set_with_ttl(&cache_key, json!(enabled), ttl);
        enabled
    }

    // ── string-match actions ──────────────────────────────────────────────────

    pub async fn process_string_match(
        &self,
        request: &CommandRequest,
        matched: StringMatch,
        started: Instant,
    ) -> CommandResult {
        self.metrics.string_matches.fetch_add(1, Ordering::Relaxed);
        let elapsed = elapsed_ms(started);

        match matched.action {
            RuleAction::Warn | RuleAction::Block => CommandResult {
                success: true,
                response_data: json!({
                    "action": matched.action.as_str(),
                    "message": matched.message,
                    "rule_id": matched.rule_id,
                }),
                execution_time_ms: elapsed,
                status_code: 200,
                error_message: None,
                retry_count: 0,
            },

            RuleAction::Command => {
                let Some(command_name) = matched.command_to_execute.clone() else {
                    return CommandResult {
                        success: false,
                        response_data: json!({
                            "action": "command",
                            "error": "No command specified for execution",
                            "rule_id": matched.rule_id,
                        }),
                        execution_time_ms: elapsed,
                        status_code: 500,
                        error_message: Some("No command specified for execution".to_string()),
                        retry_count: 0,
                    };
                };

                let raw_message = if matched.command_parameters.is_empty() {
                    format!("#{}", command_name)
                } else {
                    format!("#{} {}", command_name, matched.command_parameters.join(" "))
                };
                let triggered = CommandRequest {
                    message_id: format!("{}_triggered", request.message_id),
                    entity_id: request.entity_id.clone(),
                    user_id: request.user_id.clone(),
                    user_name: request.user_name.clone(),
                    command: command_name.clone(),
                    parameters: matched.command_parameters.clone(),
                    raw_message,
                    platform: request.platform.clone(),
                    server_id: request.server_id.clone(),
                    channel_id: request.channel_id.clone(),
                    timestamp: request.timestamp,
                };

                let triggered_result = self.dispatch_command(triggered).await;
                CommandResult {
                    success: triggered_result.success,
                    response_data: json!({
                        "action": "command",
                        "triggered_command": command_name,
                        "command_result": triggered_result.response_data,
                        "rule_id": matched.rule_id,
                    }),
                    execution_time_ms: elapsed + triggered_result.execution_time_ms,
                    status_code: triggered_result.status_code,
                    error_message: triggered_result.error_message,
                    retry_count: 0,
                }
            }

            RuleAction::Webhook => {
                let outcome = self.execute_match_webhook(request, &matched).await;
                let status = outcome["status_code"].as_u64().unwrap_or(200) as u16;
                CommandResult {
                    success: outcome["success"].as_bool().unwrap_or(false),
                    response_data: json!({
                        "action": "webhook",
                        "webhook_result": outcome,
                        "rule_id": matched.rule_id,
                    }),
                    execution_time_ms: elapsed,
                    status_code: status,
                    error_message: None,
                    retry_count: 0,
                }
            }
        }
    }

    /// POST the typed string-match payload to the rule's webhook. Failures
    /// are logged; the match itself is still reported upstream.
    async fn execute_match_webhook(&self, request: &CommandRequest, matched: &StringMatch) -> Value {
        let Some(webhook_url) = &matched.webhook_url else {
            return json!({
                "success": false,
                "error": "No webhook URL configured",
                "status_code": 500,
            });
        };

        let payload = json!({
            "type": "string_match",
            "rule_id": matched.rule_id,
            "pattern": matched.pattern,
            "match_type": matched.match_type.as_str(),
            "message_content": request.raw_message,
            "user": { "id": request.user_id, "name": request.user_name },
            "context": {
                "platform": request.platform,
                "server_id": request.server_id,
                "channel_id": request.channel_id,
                "entity_id": request.entity_id,
                "message_id": request.message_id,
                "timestamp": request.timestamp.to_rfc3339(),
            },
        });

        let response = self
            .http
            .post(webhook_url)
            .timeout(self.request_timeout)
            .header("user-agent", USER_AGENT)
            .header("x-waddlebot-source", "string-matcher")
            .header("x-waddlebot-type", "string-match-webhook")
            .json(&payload)
            .send()
            .await;

        match response {
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                let response_data: Value = serde_json::from_str(&body)
                    .unwrap_or_else(|_| json!({ "response": body }));
                json!({
                    "success": status.is_success(),
                    "response_data": response_data,
                    "status_code": status.as_u16(),
                    "webhook_url": webhook_url,
                })
            }
            Err(e) => {
                warn!(webhook_url, error = %e, "string match webhook failed");
                json!({ "success": false, "error": e.to_string(), "status_code": 500 })
            }
        }
    }

    // ── event-triggered modules ───────────────────────────────────────────────

    /// Fire every module subscribed to this event type for the entity.
    /// Sequential modules run in priority order first; parallel modules
    /// fan out on a bounded pool and are all joined before returning.
    pub async fn run_event_modules(
        &self,
        event: &InboundEvent,
        entity_id: &str,
        session_id: &str,
    ) -> Vec<Value> {
        let modules = match self
            .registry
            .event_modules(event.message_type.as_str(), entity_id)
        {
            Ok(modules) => modules,
            Err(e) => {
                error!(entity_id, error = %e, "event module lookup failed");
                return Vec::new();
            }
        };
        if modules.is_empty() {
            return Vec::new();
        }

        let (parallel, sequential): (Vec<_>, Vec<_>) = modules
            .into_iter()
            .partition(|m| m.execution_mode == ExecutionMode::Parallel);

        let mut results = Vec::new();
        for module in &sequential {
            results.push(
                self.execute_event_module(module, event, entity_id, session_id)
                    .await,
            );
        }

        if !parallel.is_empty() {
            let pool = Arc::new(Semaphore::new(self.event_workers.max(1)));
            let futures = parallel.iter().map(|module| {
                let pool = Arc::clone(&pool);
                async move {
                    let _permit = pool.acquire_owned().await.expect("semaphore closed");
                    self.execute_event_module(module, event, entity_id, session_id)
                        .await
                }
            });
            results.extend(join_all(futures).await);
        }
        results
    }

    async fn execute_event_module(
        &self,
        module: &Command,
        event: &InboundEvent,
        entity_id: &str,
        session_id: &str,
    ) -> Value {
        let payload = json!({
            "user_id": event.user_id,
            "entity_id": entity_id,
            "message_type": event.message_type.as_str(),
            "event_data": serde_json::to_value(event).unwrap_or(Value::Null),
            "session_id": session_id,
            "execution_id": format!("event_{}", Utc::now().timestamp_micros()),
            "trigger_type": "event",
        });

        let method = Method::from_bytes(module.method.to_uppercase().as_bytes())
            .unwrap_or(Method::POST);
        let timeout = if module.timeout_secs > 0 {
            Duration::from_secs(module.timeout_secs)
        } else {
            self.request_timeout
        };

        let mut request = self
            .http
            .request(method, &module.location_url)
            .timeout(timeout)
            .header("user-agent", USER_AGENT)
            .json(&payload);
        if let Some(headers) = &module.headers {
            for (name, value) in headers {
                request = request.header(name.as_str(), value.as_str());
            }
        }

        let started = Instant::now();
        match request.send().await {
            Ok(response) if response.status().is_success() => {
                let status = response.status().as_u16();
                let body = response.json::<Value>().await.unwrap_or(Value::Null);
                debug!(module = %module.command, status, "event module executed");
                json!({
                    "module": module.command,
                    "success": true,
                    "response": body,
                    "status_code": status,
                    "execution_time_ms": elapsed_ms(started),
                })
            }
            Ok(response) => {
                let status = response.status().as_u16();
                json!({
                    "module": module.command,
                    "success": false,
                    "error": format!("HTTP {}", status),
                    "status_code": status,
                })
            }
            Err(e) => {
                warn!(module = %module.command, error = %e, "event module failed");
                json!({
                    "module": module.command,
                    "success": false,
                    "error": e.to_string(),
                })
            }
        }
    }

    // ── batch ingest ──────────────────────────────────────────────────────────

    /// Process up to 100 events: invalid entries are skipped, every
    /// distinct user is onboarded once, and command dispatches share the
    /// worker pool under a common deadline.
    pub async fn handle_batch(self: &Arc<Self>, events: Vec<Value>) -> Result<Value, ApiError> {
        if events.len() > 100 {
            return Err(ApiError::bad_request("Batch size too large (max 100 events)"));
        }
        let total_count = events.len();

        let mut requests = Vec::new();
        let mut users = HashSet::new();
        for raw in events {
            let Ok(event) = serde_json::from_value::<InboundEvent>(raw) else {
                continue;
            };
            users.insert(event.user_id.clone());
            if let Err(e) = self.registry.ensure_entity(
                &event.platform,
                &event.server_id,
                &event.channel_id,
                &event.user_id,
            ) {
                error!(error = %e, "batch entity ensure failed");
            }
            if event.message_type == MessageType::ChatMessage {
                if let Some(request) = parse_message(
                    &event.message_content,
                    &event.platform,
                    &event.server_id,
                    &event.channel_id,
                    &event.user_id,
                    &event.user_name,
                ) {
                    requests.push(request);
                }
            }
        }

        if !users.is_empty() {
            let outcome = self
                .rbac
                .ensure_users_in_global_bulk(users.into_iter().collect())
                .await;
            debug!(
                total = outcome.total,
                successful = outcome.successful,
                "bulk global onboarding"
            );
        }

        if requests.is_empty() {
            return Ok(json!({
                "success": true,
                "message": "No valid commands in batch",
                "processed_count": 0,
                "total_count": total_count,
            }));
        }

        let deadline =
            tokio::time::Instant::now() + self.request_timeout + Duration::from_secs(10);
        let handles: Vec<_> = requests
            .iter()
            .cloned()
            .map(|request| {
                let pipeline = Arc::clone(self);
                let workers = Arc::clone(&self.batch_workers);
                tokio::spawn(async move {
                    let _permit = workers.acquire_owned().await.expect("semaphore closed");
                    pipeline.dispatch_command(request).await
                })
            })
            .collect();

        let mut results = Vec::new();
        for handle in handles {
            let result = match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => CommandResult::failure(500, &format!("Processing failed: {}", e), 0),
                Err(_) => CommandResult::failure(500, "Batch deadline exceeded", 0),
            };
            results.push(result);
        }

        let successful = results.iter().filter(|r| r.success).count();
        let avg_time = results
            .iter()
            .map(|r| r.execution_time_ms)
            .sum::<i64>()
            .checked_div(results.len() as i64)
            .unwrap_or(0);

        Ok(json!({
            "success": true,
            "processed_count": results.len(),
            "total_count": total_count,
            "successful_count": successful,
            "failed_count": results.len() - successful,
            "avg_execution_time_ms": avg_time,
            "results": requests
                .iter()
                .zip(&results)
                .map(|(request, result)| json!({
                    "command": request.command,
                    "success": result.success,
                    "execution_time_ms": result.execution_time_ms,
                    "status_code": result.status_code,
                }))
                .collect::<Vec<_>>(),
        }))
    }
}

fn elapsed_ms(started: Instant) -> i64 {
    started.elapsed().as_millis() as i64
}

/// A command-shaped request for a message that is not a command, used when
/// string-match processing needs dispatch context.
fn plain_request(event: &InboundEvent, entity_id: &str) -> CommandRequest {
    CommandRequest {
        message_id: message_id(&event.platform, &event.server_id, &event.channel_id),
        entity_id: entity_id.to_string(),
        user_id: event.user_id.clone(),
        user_name: event.user_name.clone(),
        command: String::new(),
        parameters: Vec::new(),
        raw_message: event.message_content.clone(),
        platform: event.platform.clone(),
        server_id: event.server_id.clone(),
        channel_id: event.channel_id.clone(),
        timestamp: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;
    use waddle_strings::{MatchType, RuleDraft};

    /// A fully in-memory pipeline. Outbound URLs point at a dead local
    /// port, so executed commands fail fast with a transport error — the
    /// dispatch decisions under test happen before (or regardless of) the
    /// network hop.
    fn test_pipeline() -> Arc<CommandPipeline> {
        let cache = Arc::new(TtlCache::new(
            Duration::from_secs(300),
            Duration::from_secs(600),
        ));
        let registry =
            Arc::new(RegistryStore::new(Connection::open_in_memory().unwrap()).unwrap());
        let limiter =
            Arc::new(RateLimiter::new(60, Connection::open_in_memory().unwrap()).unwrap());
        let strings = Arc::new(
            StringMatcher::new(Connection::open_in_memory().unwrap(), cache.clone()).unwrap(),
        );
        let sessions =
            Arc::new(SessionStore::new(Connection::open_in_memory().unwrap(), 3600).unwrap());
        let rbac = Arc::new(RbacService::new(Connection::open_in_memory().unwrap()).unwrap());
        rbac.initialize().unwrap();
        let engine = Arc::new(ExecutionEngine::new(2, 0, None));
        let reputation = ReputationClient::new(
            Client::new(),
            "http://127.0.0.1:9/reputation".to_string(),
            1,
        );
        Arc::new(CommandPipeline::new(
            registry, cache, limiter, engine, strings, sessions, rbac, reputation, 4, 5, 2,
        ))
    }

    fn register_command(pipeline: &CommandPipeline, name: &str, rate_limit: u32) -> i64 {
        let draft = waddle_registry::CommandDraft {
            command: name.to_string(),
            prefix: "!".to_string(),
            description: None,
            location_url: "http://127.0.0.1:9/module".to_string(),
            location: "internal".to_string(),
            kind: waddle_registry::CommandType::Container,
            method: "POST".to_string(),
            timeout_secs: 1,
            headers: None,
            auth_required: false,
            rate_limit,
            module_type: "local".to_string(),
            module_id: None,
            version: "1.0".to_string(),
            trigger_type: waddle_registry::TriggerType::Command,
            event_types: Vec::new(),
            priority: 100,
            execution_mode: ExecutionMode::Sequential,
        };
        pipeline.registry.create_command(&draft).unwrap().id
    }

    fn request(message: &str) -> CommandRequest {
        parse_message(message, "twitch", "42", "", "u1", "alice").unwrap()
    }

    #[tokio::test]
    async fn unknown_command_is_404() {
        let pipeline = test_pipeline();
        let result = pipeline.dispatch_command(request("!nope")).await;
        assert!(!result.success);
        assert_eq!(result.status_code, 404);
        assert_eq!(result.response_data["error"], "Command 'nope' not found");
    }

    #[tokio::test]
    async fn unprovisioned_entity_is_403() {
        let pipeline = test_pipeline();
        register_command(&pipeline, "help", 0);
        pipeline
            .registry
            .ensure_entity("twitch", "42", "", "alice")
            .unwrap();

        let result = pipeline.dispatch_command(request("!help")).await;
        assert!(!result.success);
        assert_eq!(result.status_code, 403);
    }

    #[tokio::test]
    async fn second_call_within_window_is_429() {
        let pipeline = test_pipeline();
        let command_id = register_command(&pipeline, "ping", 1);
        pipeline
            .registry
            .ensure_entity("twitch", "42", "", "alice")
            .unwrap();
        pipeline
            .registry
            .set_permission(command_id, "twitch+42", true)
            .unwrap();

        // First call is admitted (and fails on the dead endpoint, which is
        // fine — it was dispatched).
        let first = pipeline.dispatch_command(request("!ping")).await;
        assert_ne!(first.status_code, 429);

        let second = pipeline.dispatch_command(request("!ping")).await;
        assert_eq!(second.status_code, 429);
        assert_eq!(second.response_data["error"], "Rate limit exceeded");
    }

    #[tokio::test]
    async fn executed_commands_are_audited() {
        let pipeline = test_pipeline();
        let command_id = register_command(&pipeline, "ping", 0);
        pipeline
            .registry
            .ensure_entity("twitch", "42", "", "alice")
            .unwrap();
        pipeline
            .registry
            .set_permission(command_id, "twitch+42", true)
            .unwrap();

        let req = request("!ping now");
        let execution_id = req.message_id.clone();
        pipeline.dispatch_command(req).await;

        let info = pipeline
            .registry
            .execution_by_id(&execution_id)
            .unwrap()
            .unwrap();
        assert_eq!(info.entity_id, "twitch+42");
        assert_eq!(
            pipeline
                .registry
                .permission_usage(command_id, "twitch+42")
                .unwrap(),
            Some(1)
        );
    }

    #[tokio::test]
    async fn moderation_commands_require_role() {
        let pipeline = test_pipeline();
        let command_id = register_command(&pipeline, "ban", 0);
        pipeline
            .registry
            .ensure_entity("twitch", "42", "", "alice")
            .unwrap();
        pipeline
            .registry
            .set_permission(command_id, "twitch+42", true)
            .unwrap();

        // Plain user: the ban command maps to users.ban, which the user
        // bundle does not carry.
        let denied = pipeline.dispatch_command(request("!ban troll")).await;
        assert_eq!(denied.status_code, 403);

        pipeline
            .rbac
            .assign_role(
                "u1",
                waddle_rbac::Role::Owner,
                "admin",
                &RoleScope::Entity("twitch+42".to_string()),
            )
            .unwrap();
        let allowed = pipeline.dispatch_command(request("!ban troll")).await;
        assert_ne!(allowed.status_code, 403);
    }

    #[tokio::test]
    async fn unknown_command_falls_back_to_string_rules() {
        let pipeline = test_pipeline();
        pipeline
            .strings
            .create_rule(&RuleDraft {
                pattern: "*".to_string(),
                match_type: MatchType::Exact,
                case_sensitive: false,
                enabled_entity_ids: Vec::new(),
                action: RuleAction::Warn,
                command_to_execute: None,
                command_parameters: Vec::new(),
                webhook_url: None,
                warning_message: Some("Please be civil.".to_string()),
                block_message: None,
                priority: 100,
                created_by: "system".to_string(),
            })
            .unwrap();

        let result = pipeline.dispatch_command(request("!mystery")).await;
        assert!(result.success);
        assert_eq!(result.response_data["action"], "warn");
        assert_eq!(result.response_data["message"], "Please be civil.");
    }

    #[tokio::test]
    async fn non_command_chat_event_builds_envelope() {
        let pipeline = test_pipeline();
        let event = InboundEvent {
            platform: "twitch".to_string(),
            server_id: "42".to_string(),
            channel_id: String::new(),
            user_id: "u1".to_string(),
            user_name: "alice".to_string(),
            message_content: "just chatting".to_string(),
            message_type: MessageType::ChatMessage,
            bits: None,
            minutes: None,
            amount: None,
        };

        let envelope = pipeline.handle_event(event).await.unwrap();
        assert_eq!(envelope["success"], true);
        assert_eq!(envelope["processed"], false);
        assert_eq!(envelope["message"], "Not a command");
        assert!(envelope["session_id"].is_string());
        assert_eq!(envelope["event_modules_executed"], 0);

        // First contact onboarded the user into GLOBAL.
        assert_eq!(pipeline.rbac.global_membership("u1").unwrap(), (1, 1));
        // The session maps back to the entity.
        let session_id = envelope["session_id"].as_str().unwrap();
        assert!(pipeline.sessions.validate(session_id, "twitch+42").unwrap());
    }
}
