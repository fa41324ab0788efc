use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use rusqlite::Connection;
use tracing::{info, warn};
use waddle_accounts::AccountStore;
use waddle_cache::TtlCache;
use waddle_coordination::Coordinator;
use waddle_core::config::WaddleConfig;
use waddle_execution::ExecutionEngine;
use waddle_ratelimit::RateLimiter;
use waddle_rbac::RbacService;
use waddle_registry::RegistryStore;
use waddle_sessions::SessionStore;
use waddle_strings::StringMatcher;

mod app;
mod auth;
mod error;
mod http;
mod pipeline;
mod reputation;

/// How often expired session rows are purged.
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(600);

#[derive(Parser)]
#[command(name = "waddle-router", about = "WaddleBot command router")]
struct Args {
    /// Path to the TOML config file (default: ./waddlebot.toml, with
    /// WADDLE_* environment overrides).
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "waddle_router=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();
    // Missing required configuration is fatal: exit non-zero immediately
    // rather than serving requests against a half-configured environment.
    let config = WaddleConfig::load(args.config.as_deref()).context("configuration invalid")?;

    let db_path = config.database.path.clone();
    // Each subsystem gets its own connection to the shared database so the
    // stores do not contend on one lock.
    let open = |name: &str| -> anyhow::Result<Connection> {
        Connection::open(&db_path).with_context(|| format!("opening database for {}", name))
    };

    let registry = Arc::new(RegistryStore::new(open("registry")?)?);
    let sessions = Arc::new(SessionStore::new(
        open("sessions")?,
        config.session.ttl_secs,
    )?);
    let rbac = Arc::new(RbacService::new(open("rbac")?)?);
    rbac.initialize().context("RBAC initialization failed")?;
    let accounts = Arc::new(AccountStore::new(open("accounts")?)?);
    let coordination = Arc::new(Coordinator::new(open("coordination")?)?);
    let limiter = Arc::new(RateLimiter::new(
        config.router.rate_limit_window_secs,
        open("rate limiter")?,
    )?);

    let cache = Arc::new(TtlCache::new(
        Duration::from_secs(config.router.command_cache_ttl_secs),
        Duration::from_secs(config.router.entity_cache_ttl_secs),
    ));
    let strings = Arc::new(StringMatcher::new(open("string matcher")?, cache.clone())?);

    let engine = Arc::new(ExecutionEngine::new(
        config.router.request_timeout_secs,
        config.router.max_retries,
        Some(config.openwhisk.auth_key.clone()),
    ));
    let reputation = reputation::ReputationClient::new(
        reqwest::Client::new(),
        config.reputation_url(),
        config.integrations.reputation_timeout_secs,
    );

    let pipeline = Arc::new(pipeline::CommandPipeline::new(
        registry.clone(),
        cache.clone(),
        limiter.clone(),
        engine,
        strings.clone(),
        sessions.clone(),
        rbac.clone(),
        reputation,
        config.router.max_workers,
        config.router.event_module_workers,
        config.router.request_timeout_secs,
    ));

    // Background sweepers run for the life of the process.
    waddle_cache::spawn_sweeper(cache.clone());
    waddle_ratelimit::spawn_sweeper(limiter.clone());
    {
        let sessions = sessions.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SESSION_SWEEP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Err(e) = sessions.cleanup_expired() {
                    warn!(error = %e, "session sweep failed");
                }
            }
        });
    }

    let bind = config.gateway.bind.clone();
    let port = config.gateway.port;
    let state = Arc::new(app::AppState {
        config,
        registry,
        sessions,
        accounts,
        coordination,
        strings,
        cache,
        limiter,
        pipeline,
        started_at: Instant::now(),
    });
    let router = app::build_router(state);

    let addr: SocketAddr = format!("{}:{}", bind, port).parse()?;
    info!("WaddleBot router listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    // Graceful shutdown: stop accepting, let in-flight dispatches drain.
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received; draining in-flight requests");
        })
        .await?;

    Ok(())
}
