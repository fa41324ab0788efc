use std::sync::Arc;
use std::time::Instant;

use axum::middleware;
use axum::routing::{get, post, put};
use axum::Router;
use waddle_accounts::AccountStore;
use waddle_cache::TtlCache;
use waddle_coordination::Coordinator;
use waddle_core::config::WaddleConfig;
use waddle_ratelimit::RateLimiter;
use waddle_registry::RegistryStore;
use waddle_sessions::SessionStore;
use waddle_strings::StringMatcher;

use crate::pipeline::CommandPipeline;

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: WaddleConfig,
    pub registry: Arc<RegistryStore>,
    pub sessions: Arc<SessionStore>,
    pub accounts: Arc<AccountStore>,
    pub coordination: Arc<Coordinator>,
    pub strings: Arc<StringMatcher>,
    pub cache: Arc<TtlCache>,
    pub limiter: Arc<RateLimiter>,
    pub pipeline: Arc<CommandPipeline>,
    pub started_at: Instant,
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/router/events", post(crate::http::events::post_event))
        .route(
            "/router/events/batch",
            post(crate::http::events::post_event_batch),
        )
        .route("/router/commands", get(crate::http::registry_api::list_commands))
        .route("/router/entities", get(crate::http::registry_api::list_entities))
        .route(
            "/router/responses",
            post(crate::http::responses::submit_response),
        )
        .route(
            "/router/responses/recent",
            get(crate::http::responses::recent_responses),
        )
        .route(
            "/router/responses/{execution_id}",
            get(crate::http::responses::get_responses),
        )
        .route(
            "/router/string-rules",
            get(crate::http::rules::list_rules).post(crate::http::rules::create_rule),
        )
        .route(
            "/router/string-rules/{rule_id}",
            put(crate::http::rules::update_rule).delete(crate::http::rules::delete_rule),
        )
        .route(
            "/router/coordination/claim",
            post(crate::http::coordination::claim),
        )
        .route(
            "/router/coordination/release",
            post(crate::http::coordination::release),
        )
        .route(
            "/router/coordination/checkin",
            post(crate::http::coordination::checkin),
        )
        .route(
            "/router/coordination/heartbeat",
            post(crate::http::coordination::heartbeat),
        )
        .route(
            "/router/coordination/status",
            post(crate::http::coordination::update_status),
        )
        .route(
            "/router/coordination/error",
            post(crate::http::coordination::report_error),
        )
        .route(
            "/router/coordination/release-offline",
            post(crate::http::coordination::release_offline),
        )
        .route(
            "/router/coordination/populate",
            post(crate::http::coordination::populate),
        )
        .route(
            "/router/coordination/entities",
            get(crate::http::coordination::list_entities),
        )
        .route(
            "/router/coordination/stats",
            get(crate::http::coordination::stats),
        )
        .route("/router/metrics", get(crate::http::ops::metrics))
        .route("/router/health", get(crate::http::ops::health))
        .route(
            "/router/admin/service-accounts",
            get(crate::http::admin::list_accounts).post(crate::http::admin::create_account),
        )
        .route(
            "/router/admin/service-accounts/{account_id}/regenerate",
            post(crate::http::admin::regenerate_key),
        )
        .route(
            "/router/admin/service-accounts/{account_id}/revoke",
            post(crate::http::admin::revoke_account),
        )
        .route("/router/admin/api-usage", get(crate::http::admin::api_usage))
        .route(
            "/router/admin/commands",
            post(crate::http::admin::register_command),
        )
        .route(
            "/router/admin/commands/{command_id}/deactivate",
            post(crate::http::admin::deactivate_command),
        )
        .route(
            "/router/admin/commands/{command_id}/permissions",
            post(crate::http::admin::set_command_permission),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            crate::auth::auth_middleware,
        ))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
