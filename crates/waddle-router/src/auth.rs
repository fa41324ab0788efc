//! API-key authentication for every router route.
//!
//! Runs as a single middleware layer: resolve the account by key hash,
//! gate on account type for the route, check permission globs and the
//! hourly limit, then log the call (endpoint, status, latency, sizes)
//! after the handler finishes.

use std::time::Instant;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{CONTENT_LENGTH, USER_AGENT};
use axum::http::{HeaderMap, Method};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use tracing::warn;
use waddle_accounts::{AccountStore, AccountType, ServiceAccount, UsageRecord};

use crate::app::AppState;
use crate::error::ApiError;

/// Which account types may touch a route at all. Permission globs narrow
/// further within the allowed set; admin keys carry `router/*` and pass
/// the glob check everywhere.
fn allowed_types(path: &str, method: &Method) -> &'static [AccountType] {
    use AccountType::*;
    if path.starts_with("/router/admin/") {
        return &[Admin];
    }
    if path == "/router/events" || path == "/router/events/batch" {
        return &[Collector, Admin];
    }
    if path.starts_with("/router/coordination") {
        return &[Collector, Admin];
    }
    if path.starts_with("/router/responses") {
        return if *method == Method::POST {
            &[Interaction, Webhook, Admin]
        } else {
            &[Collector, Interaction, Webhook, Admin]
        };
    }
    if path == "/router/commands" || path == "/router/entities" {
        return &[Collector, Interaction, Admin];
    }
    // Everything else (metrics, health, string rules): any authenticated
    // account type; the permission globs decide.
    &[Collector, Interaction, Webhook, Admin]
}

fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        if !key.is_empty() {
            return Some(key.to_string());
        }
    }
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
        .filter(|k| !k.is_empty())
}

/// Account resolved by the middleware, stashed in request extensions for
/// handlers that need the caller's identity.
#[derive(Clone)]
pub struct AuthedAccount(pub ServiceAccount);

pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let started = Instant::now();
    let path = request.uri().path().to_string();
    let method = request.method().clone();
    // Permission globs use the un-rooted endpoint form, e.g. "router/events".
    let endpoint = path.trim_start_matches('/').to_string();

    let ip_address = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').next().unwrap_or(v).trim().to_string());
    let user_agent = request
        .headers()
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let request_size = request
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok());

    let Some(api_key) = extract_api_key(request.headers()) else {
        return ApiError::unauthorized("API key required").into_response();
    };

    let account = match state.accounts.validate_key(&api_key) {
        Ok(Some(account)) => account,
        Ok(None) => return ApiError::unauthorized("Invalid API key").into_response(),
        Err(e) => {
            warn!(error = %e, "api key validation failed");
            return ApiError::internal("Authentication backend error").into_response();
        }
    };

    if !allowed_types(&path, &method).contains(&account.account_type) {
        let response = ApiError::forbidden(format!(
            "Account type '{}' not allowed for this endpoint",
            account.account_type.as_str()
        ))
        .into_response();
        log_call(&state.accounts, &account, &endpoint, &method, &response, started, ip_address, user_agent, request_size);
        return response;
    }

    if !AccountStore::check_permission(&account, &endpoint, method.as_str()) {
        let response = ApiError::forbidden("Insufficient permissions").into_response();
        log_call(&state.accounts, &account, &endpoint, &method, &response, started, ip_address, user_agent, request_size);
        return response;
    }

    match state.accounts.check_hourly_limit(&account) {
        Ok(true) => {}
        Ok(false) => {
            let response = ApiError::too_many_requests("Rate limit exceeded").into_response();
            log_call(&state.accounts, &account, &endpoint, &method, &response, started, ip_address, user_agent, request_size);
            return response;
        }
        Err(e) => {
            warn!(error = %e, "hourly limit check failed");
            return ApiError::internal("Authentication backend error").into_response();
        }
    }

    let mut request = request;
    request.extensions_mut().insert(AuthedAccount(account.clone()));
    let response = next.run(request).await;

    log_call(&state.accounts, &account, &endpoint, &method, &response, started, ip_address, user_agent, request_size);
    response
}

#[allow(clippy::too_many_arguments)]
fn log_call(
    accounts: &AccountStore,
    account: &ServiceAccount,
    endpoint: &str,
    method: &Method,
    response: &Response,
    started: Instant,
    ip_address: Option<String>,
    user_agent: Option<String>,
    request_size: Option<i64>,
) {
    let response_size = response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok());
    accounts.log_usage(
        account.id,
        &UsageRecord {
            endpoint: endpoint.to_string(),
            method: method.to_string(),
            ip_address,
            user_agent,
            response_status: response.status().as_u16(),
            response_time_ms: started.elapsed().as_millis() as i64,
            request_size,
            response_size,
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_policies_gate_account_types() {
        use AccountType::*;
        assert!(allowed_types("/router/events", &Method::POST).contains(&Collector));
        assert!(!allowed_types("/router/events", &Method::POST).contains(&Interaction));

        assert!(allowed_types("/router/responses", &Method::POST).contains(&Webhook));
        assert!(!allowed_types("/router/responses", &Method::POST).contains(&Collector));
        assert!(allowed_types("/router/responses/x1", &Method::GET).contains(&Collector));

        assert!(allowed_types("/router/coordination/claim", &Method::POST).contains(&Collector));
        assert_eq!(allowed_types("/router/admin/api-usage", &Method::GET), &[Admin]);
    }

    #[test]
    fn api_key_extraction_prefers_header_then_bearer() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_api_key(&headers), None);

        headers.insert("authorization", "Bearer wbot_abc".parse().unwrap());
        assert_eq!(extract_api_key(&headers), Some("wbot_abc".to_string()));

        headers.insert("x-api-key", "wbot_xyz".parse().unwrap());
        assert_eq!(extract_api_key(&headers), Some("wbot_xyz".to_string()));
    }
}
