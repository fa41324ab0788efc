use std::sync::Mutex;

use chrono::{Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::init_db;
use crate::error::{AccountError, Result};
use crate::types::{AccountType, ServiceAccount, UsageRecord};

/// SHA-256 of the presented key, hex-encoded. The only form kept at rest.
pub fn hash_api_key(api_key: &str) -> String {
    hex::encode(Sha256::digest(api_key.as_bytes()))
}

/// Mint a fresh opaque key. 256 bits of randomness behind a recognisable
/// prefix so leaked keys are easy to grep for.
fn generate_api_key() -> String {
    format!(
        "wbot_{}{}",
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    )
}

/// Store for service accounts and the per-call usage log.
pub struct AccountStore {
    db: Mutex<Connection>,
}

impl AccountStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// Create an account and return it with the plaintext key — the only
    /// time the key is ever visible.
    #[allow(clippy::too_many_arguments)]
    pub fn create_account(
        &self,
        account_name: &str,
        account_type: AccountType,
        platform: Option<&str>,
        permissions: Option<Vec<String>>,
        rate_limit: u32,
        description: Option<&str>,
        created_by: &str,
    ) -> Result<(ServiceAccount, String)> {
        let api_key = generate_api_key();
        let key_hash = hash_api_key(&api_key);
        let permissions = permissions.unwrap_or_else(|| account_type.default_permissions());
        let now = Utc::now().to_rfc3339();

        let db = self.db.lock().unwrap();
        let inserted = db.execute(
            "INSERT OR IGNORE INTO service_accounts
             (account_name, account_type, platform, api_key_hash, permissions, is_active,
              usage_count, rate_limit, created_by, description, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, 0, ?6, ?7, ?8, ?9, ?9)",
            params![
                account_name,
                account_type.as_str(),
                platform,
                key_hash,
                serde_json::to_string(&permissions)?,
                rate_limit,
                created_by,
                description,
                now,
            ],
        )?;
        if inserted == 0 {
            return Err(AccountError::DuplicateName(account_name.to_string()));
        }

        let account = db
            .query_row(
                &format!("{} WHERE account_name = ?1", ACCOUNT_SELECT),
                params![account_name],
                row_to_account,
            )
            .map_err(AccountError::Database)?;
        info!(account_name, account_type = account_type.as_str(), "service account created");
        Ok((account, api_key))
    }

    /// Resolve a presented key to an active, unexpired account, bumping its
    /// usage bookkeeping. Returns `None` for unknown, inactive, or expired
    /// keys.
    pub fn validate_key(&self, api_key: &str) -> Result<Option<ServiceAccount>> {
        if !api_key.starts_with("wbot_") {
            return Ok(None);
        }

        let key_hash = hash_api_key(api_key);
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let account = db
            .query_row(
                &format!(
                    "{} WHERE api_key_hash = ?1 AND is_active = 1",
                    ACCOUNT_SELECT
                ),
                params![key_hash],
                row_to_account,
            )
            .optional()?;

        let Some(account) = account else {
            return Ok(None);
        };
        if let Some(expires) = &account.expires_at {
            if expires <= &now {
                return Ok(None);
            }
        }

        db.execute(
            "UPDATE service_accounts
             SET last_used = ?2, usage_count = usage_count + 1
             WHERE id = ?1",
            params![account.id, now],
        )?;
        Ok(Some(account))
    }

    /// Endpoint permission check: exact match, `prefix/*`, or `prefix*`.
    pub fn check_permission(account: &ServiceAccount, endpoint: &str, method: &str) -> bool {
        let with_method = format!("{} {}", method, endpoint);
        for permission in &account.permissions {
            if permission == endpoint || *permission == with_method {
                return true;
            }
            if let Some(base) = permission.strip_suffix("/*") {
                if endpoint.starts_with(base) {
                    return true;
                }
            } else if let Some(base) = permission.strip_suffix('*') {
                if endpoint.starts_with(base) {
                    return true;
                }
            }
        }
        false
    }

    /// Hourly rate limit: admit while the trailing-hour usage count stays
    /// below the account's limit (0 = unlimited).
    pub fn check_hourly_limit(&self, account: &ServiceAccount) -> Result<bool> {
        if account.rate_limit == 0 {
            return Ok(true);
        }
        let one_hour_ago = (Utc::now() - Duration::hours(1)).to_rfc3339();
        let db = self.db.lock().unwrap();
        let recent: i64 = db.query_row(
            "SELECT COUNT(*) FROM api_usage
             WHERE service_account_id = ?1 AND timestamp > ?2",
            params![account.id, one_hour_ago],
            |r| r.get(0),
        )?;
        Ok(recent < account.rate_limit as i64)
    }

    /// Append one usage row. Failures are swallowed — accounting must
    /// never fail a request.
    pub fn log_usage(&self, account_id: i64, record: &UsageRecord) {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        if let Err(e) = db.execute(
            "INSERT INTO api_usage
             (service_account_id, endpoint, method, ip_address, user_agent,
              response_status, response_time_ms, request_size, response_size, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                account_id,
                record.endpoint,
                record.method,
                record.ip_address,
                record.user_agent,
                record.response_status,
                record.response_time_ms,
                record.request_size,
                record.response_size,
                now,
            ],
        ) {
            warn!(account_id, error = %e, "api usage log write failed");
        }
    }

    pub fn list_accounts(&self) -> Result<Vec<ServiceAccount>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!("{} ORDER BY account_name", ACCOUNT_SELECT))?;
        let rows = stmt.query_map([], row_to_account)?;
        let mut accounts = Vec::new();
        for row in rows {
            accounts.push(row?);
        }
        Ok(accounts)
    }

    pub fn get_account(&self, id: i64) -> Result<Option<ServiceAccount>> {
        let db = self.db.lock().unwrap();
        let found = db
            .query_row(
                &format!("{} WHERE id = ?1", ACCOUNT_SELECT),
                params![id],
                row_to_account,
            )
            .optional()?;
        Ok(found)
    }

    /// Deactivate an account, invalidating its key immediately.
    pub fn revoke(&self, id: i64) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let rows = db.execute(
            "UPDATE service_accounts SET is_active = 0, updated_at = ?2 WHERE id = ?1",
            params![id, now],
        )?;
        if rows == 0 {
            return Err(AccountError::NotFound(id));
        }
        info!(account_id = id, "service account revoked");
        Ok(())
    }

    /// Replace the key: the old hash stops validating, the new plaintext is
    /// returned once.
    pub fn regenerate_key(&self, id: i64) -> Result<String> {
        let api_key = generate_api_key();
        let key_hash = hash_api_key(&api_key);
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let rows = db.execute(
            "UPDATE service_accounts SET api_key_hash = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, key_hash, now],
        )?;
        if rows == 0 {
            return Err(AccountError::NotFound(id));
        }
        info!(account_id = id, "api key regenerated");
        Ok(api_key)
    }

    /// Usage summary for the trailing `days`: total calls, per-status
    /// counts, and the busiest endpoints.
    pub fn usage_stats(&self, account_id: Option<i64>, days: i64) -> Result<serde_json::Value> {
        let since = (Utc::now() - Duration::days(days)).to_rfc3339();
        let db = self.db.lock().unwrap();

        let total: i64 = db.query_row(
            "SELECT COUNT(*) FROM api_usage
             WHERE timestamp > ?1 AND (?2 IS NULL OR service_account_id = ?2)",
            params![since, account_id],
            |r| r.get(0),
        )?;

        let mut status_codes = serde_json::Map::new();
        let mut stmt = db.prepare(
            "SELECT response_status, COUNT(*) FROM api_usage
             WHERE timestamp > ?1 AND (?2 IS NULL OR service_account_id = ?2)
             GROUP BY response_status",
        )?;
        let rows = stmt.query_map(params![since, account_id], |r| {
            Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            status_codes.insert(status.to_string(), count.into());
        }

        let mut top_endpoints = Vec::new();
        let mut stmt = db.prepare(
            "SELECT endpoint, COUNT(*) AS calls FROM api_usage
             WHERE timestamp > ?1 AND (?2 IS NULL OR service_account_id = ?2)
             GROUP BY endpoint ORDER BY calls DESC LIMIT 10",
        )?;
        let rows = stmt.query_map(params![since, account_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (endpoint, requests) = row?;
            top_endpoints.push(serde_json::json!({
                "endpoint": endpoint,
                "requests": requests,
            }));
        }

        Ok(serde_json::json!({
            "total_requests": total,
            "period_days": days,
            "status_codes": status_codes,
            "top_endpoints": top_endpoints,
        }))
    }
}

const ACCOUNT_SELECT: &str = "SELECT id, account_name, account_type, platform, permissions,
        is_active, rate_limit, expires_at, usage_count, last_used, description, created_by,
        created_at
 FROM service_accounts";

fn row_to_account(row: &rusqlite::Row<'_>) -> rusqlite::Result<ServiceAccount> {
    let account_type: String = row.get(2)?;
    let permissions: String = row.get(4)?;
    Ok(ServiceAccount {
        id: row.get(0)?,
        account_name: row.get(1)?,
        account_type: AccountType::parse(&account_type).unwrap_or(AccountType::Webhook),
        platform: row.get(3)?,
        permissions: serde_json::from_str(&permissions).unwrap_or_default(),
        is_active: row.get(5)?,
        rate_limit: row.get::<_, i64>(6)? as u32,
        expires_at: row.get(7)?,
        usage_count: row.get(8)?,
        last_used: row.get(9)?,
        description: row.get(10)?,
        created_by: row.get(11)?,
        created_at: row.get(12)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> AccountStore {
        AccountStore::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    fn collector(store: &AccountStore) -> (ServiceAccount, String) {
        store
            .create_account(
                "twitch-collector",
                AccountType::Collector,
                Some("twitch"),
                None,
                1000,
                None,
                "system",
            )
            .unwrap()
    }

    #[test]
    fn created_key_validates_by_hash() {
        let s = store();
        let (account, key) = collector(&s);
        assert!(key.starts_with("wbot_"));

        let validated = s.validate_key(&key).unwrap().unwrap();
        assert_eq!(validated.id, account.id);
        assert_eq!(validated.account_type, AccountType::Collector);

        assert!(s.validate_key("wbot_unknown").unwrap().is_none());
        assert!(s.validate_key("not-a-key").unwrap().is_none());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let s = store();
        collector(&s);
        let err = s
            .create_account(
                "twitch-collector",
                AccountType::Collector,
                None,
                None,
                0,
                None,
                "system",
            )
            .unwrap_err();
        assert!(matches!(err, AccountError::DuplicateName(_)));
    }

    #[test]
    fn revoked_and_regenerated_keys() {
        let s = store();
        let (account, key) = collector(&s);

        let new_key = s.regenerate_key(account.id).unwrap();
        assert!(s.validate_key(&key).unwrap().is_none());
        assert!(s.validate_key(&new_key).unwrap().is_some());

        s.revoke(account.id).unwrap();
        assert!(s.validate_key(&new_key).unwrap().is_none());
    }

    #[test]
    fn permission_globs() {
        let s = store();
        let (account, _) = collector(&s);

        assert!(AccountStore::check_permission(&account, "router/events", "POST"));
        assert!(AccountStore::check_permission(
            &account,
            "router/coordination/claim",
            "POST"
        ));
        assert!(!AccountStore::check_permission(&account, "router/metrics", "GET"));
        assert!(!AccountStore::check_permission(&account, "admin/anything", "GET"));

        let (admin, _) = s
            .create_account("ops", AccountType::Admin, None, None, 0, None, "system")
            .unwrap();
        assert!(AccountStore::check_permission(&admin, "router/metrics", "GET"));
        assert!(AccountStore::check_permission(&admin, "admin/service-accounts", "GET"));
    }

    #[test]
    fn hourly_limit_counts_usage_rows() {
        let s = store();
        let (mut account, _) = collector(&s);
        account.rate_limit = 2;

        let record = UsageRecord {
            endpoint: "router/events".to_string(),
            method: "POST".to_string(),
            ip_address: None,
            user_agent: None,
            response_status: 200,
            response_time_ms: 5,
            request_size: None,
            response_size: None,
        };

        assert!(s.check_hourly_limit(&account).unwrap());
        s.log_usage(account.id, &record);
        assert!(s.check_hourly_limit(&account).unwrap());
        s.log_usage(account.id, &record);
        assert!(!s.check_hourly_limit(&account).unwrap());

        // 0 means unlimited.
        account.rate_limit = 0;
        assert!(s.check_hourly_limit(&account).unwrap());
    }

    #[test]
    fn usage_stats_aggregate() {
        let s = store();
        let (account, _) = collector(&s);
        for status in [200, 200, 429] {
            s.log_usage(
                account.id,
                &UsageRecord {
                    endpoint: "router/events".to_string(),
                    method: "POST".to_string(),
                    ip_address: None,
                    user_agent: None,
                    response_status: status,
                    response_time_ms: 3,
                    request_size: None,
                    response_size: None,
                },
            );
        }

        let stats = s.usage_stats(Some(account.id), 7).unwrap();
        assert_eq!(stats["total_requests"], 3);
        assert_eq!(stats["status_codes"]["200"], 2);
        assert_eq!(stats["status_codes"]["429"], 1);
        assert_eq!(stats["top_endpoints"][0]["endpoint"], "router/events");
    }
}
