use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 8010;
pub const DEFAULT_BIND: &str = "0.0.0.0";

/// Command prefixes and the module class they route to.
pub const PREFIX_LOCAL: char = '!';
pub const PREFIX_COMMUNITY: char = '#';

/// Top-level config (waddlebot.toml + WADDLE_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaddleConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub openwhisk: OpenWhiskConfig,
    #[serde(default)]
    pub integrations: IntegrationsConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

impl Default for WaddleConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            database: DatabaseConfig::default(),
            router: RouterConfig::default(),
            openwhisk: OpenWhiskConfig::default(),
            integrations: IntegrationsConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file. Required — boot fails without it.
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Worker pool size shared by batch ingest.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Default timeout for module execution calls, seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Default per-command requests per minute (0 disables).
    #[serde(default = "default_rate_limit")]
    pub default_rate_limit: u32,
    /// Sliding-window width for per-command rate limiting, seconds.
    #[serde(default = "default_rate_window")]
    pub rate_limit_window_secs: u64,
    #[serde(default = "default_command_ttl")]
    pub command_cache_ttl_secs: u64,
    #[serde(default = "default_entity_ttl")]
    pub entity_cache_ttl_secs: u64,
    /// Lambda retry budget.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Fan-out bound for parallel event modules within one request.
    #[serde(default = "default_event_workers")]
    pub event_module_workers: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            request_timeout_secs: default_request_timeout(),
            default_rate_limit: default_rate_limit(),
            rate_limit_window_secs: default_rate_window(),
            command_cache_ttl_secs: default_command_ttl(),
            entity_cache_ttl_secs: default_entity_ttl(),
            max_retries: default_max_retries(),
            event_module_workers: default_event_workers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OpenWhiskConfig {
    #[serde(default)]
    pub api_host: String,
    /// Sent as `Authorization: Basic <auth_key>` on openwhisk dispatch.
    #[serde(default)]
    pub auth_key: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

/// URLs of the external WaddleBot services this router talks to.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IntegrationsConfig {
    /// Required — boot fails without it.
    #[serde(default)]
    pub core_api_url: String,
    /// Required — boot fails without it.
    #[serde(default)]
    pub marketplace_api_url: String,
    /// Defaults to `{core_api_url}/api/reputation` when empty.
    #[serde(default)]
    pub reputation_api_url: String,
    #[serde(default = "default_reputation_timeout")]
    pub reputation_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Session TTL, seconds. Refreshed on activity.
    #[serde(default = "default_session_ttl")]
    pub ttl_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_session_ttl(),
        }
    }
}

impl WaddleConfig {
    /// Load config from a TOML file with WADDLE_* env var overrides.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let mut figment = Figment::new();
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        } else {
            figment = figment.merge(Toml::file("waddlebot.toml"));
        }

        let config: WaddleConfig = figment
            .merge(Env::prefixed("WADDLE_").split("_"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject configs missing the values the router cannot run without.
    /// Mirrors the deployment contract: the process exits non-zero rather
    /// than limping along against a half-configured environment.
    pub fn validate(&self) -> crate::error::Result<()> {
        let mut missing = Vec::new();
        if self.database.path.is_empty() {
            missing.push("database.path");
        }
        if self.integrations.core_api_url.is_empty() {
            missing.push("integrations.core_api_url");
        }
        if self.integrations.marketplace_api_url.is_empty() {
            missing.push("integrations.marketplace_api_url");
        }
        if !missing.is_empty() {
            return Err(crate::error::CoreError::Config(format!(
                "missing required configuration: {}",
                missing.join(", ")
            )));
        }
        Ok(())
    }

    /// Effective reputation endpoint base.
    pub fn reputation_url(&self) -> String {
        if self.integrations.reputation_api_url.is_empty() {
            format!("{}/api/reputation", self.integrations.core_api_url)
        } else {
            self.integrations.reputation_api_url.clone()
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_max_workers() -> usize {
    20
}
fn default_request_timeout() -> u64 {
    30
}
fn default_rate_limit() -> u32 {
    60
}
fn default_rate_window() -> u64 {
    60
}
fn default_command_ttl() -> u64 {
    300
}
fn default_entity_ttl() -> u64 {
    600
}
fn default_max_retries() -> u32 {
    3
}
fn default_event_workers() -> usize {
    5
}
fn default_namespace() -> String {
    "guest".to_string()
}
fn default_reputation_timeout() -> u64 {
    10
}
fn default_session_ttl() -> u64 {
    3600
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populated() -> WaddleConfig {
        let mut config = WaddleConfig::default();
        config.database.path = "/tmp/waddle.db".to_string();
        config.integrations.core_api_url = "http://core:8000".to_string();
        config.integrations.marketplace_api_url = "http://marketplace:8000".to_string();
        config
    }

    #[test]
    fn validate_rejects_missing_required_values() {
        let err = WaddleConfig::default().validate().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("database.path"));
        assert!(msg.contains("core_api_url"));
        assert!(msg.contains("marketplace_api_url"));
    }

    #[test]
    fn validate_accepts_populated_config() {
        assert!(populated().validate().is_ok());
    }

    #[test]
    fn reputation_url_falls_back_to_core() {
        let config = populated();
        assert_eq!(config.reputation_url(), "http://core:8000/api/reputation");

        let mut config = populated();
        config.integrations.reputation_api_url = "http://rep:8000".to_string();
        assert_eq!(config.reputation_url(), "http://rep:8000");
    }
}
