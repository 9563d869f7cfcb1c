use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{any, get};
use axum::Router;
use tracing::{info, warn};

mod admission;
mod auth;
mod config;
mod dns;
mod http_proxy;
mod ip_filter;
mod l4;
mod link;
mod metrics;
mod ports;
mod ratelimit;
mod registry;
mod repository;
mod subdomain;
mod tunnel;

use admission::Admission;
use auth::SecretValidator;
use config::ServerConfig;
use dns::DomainValidator;
use ip_filter::IpAllowList;
use metrics::Metrics;
use ports::PortAllocator;
use ratelimit::{MemoryRateLimiter, RateLimiter, RedisRateLimiter};
use registry::TunnelRegistry;
use repository::{InMemoryRepository, RequestLogger, TunnelRepository, REPO_BUDGET};
use subdomain::SubdomainPool;
use tunnel::TunnelStatus;

/// A paused tunnel record is deleted after this long without a reattach.
const PAUSED_MAX_AGE: Duration = Duration::from_secs(24 * 3600);
/// Extra slack an orphaned pending entry gets past the request budget.
const ORPHAN_SLACK: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub registry: Arc<TunnelRegistry>,
    pub pool: Arc<SubdomainPool>,
    pub ports: Arc<PortAllocator>,
    pub limiter: Arc<dyn RateLimiter>,
    pub repo: Arc<dyn TunnelRepository>,
    pub admission: Arc<Admission>,
    pub metrics: Metrics,
    pub logger: RequestLogger,
    pub ip_allow: Arc<IpAllowList>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunlink_server=info".into()),
        )
        .init();

    let config = Arc::new(ServerConfig::from_env());
    let metrics = Metrics::new();

    let limiter: Arc<dyn RateLimiter> = match config.redis_url.as_deref() {
        Some(url) => match RedisRateLimiter::connect(url, metrics.clone()).await {
            Ok(limiter) => {
                info!("rate limiter: redis counters");
                limiter
            }
            Err(err) => {
                warn!(%err, "redis unavailable, falling back to in-memory rate limiter");
                MemoryRateLimiter::new()
            }
        },
        None => {
            info!("rate limiter: in-memory counters");
            MemoryRateLimiter::new()
        }
    };

    let repo: Arc<dyn TunnelRepository> = Arc::new(InMemoryRepository::new());
    if config.database_url.is_some() {
        // The durable repository lives behind the same trait; this build
        // ships the in-memory adapter only.
        warn!("DATABASE_URL set but no durable repository is compiled in");
    }

    let registry = Arc::new(TunnelRegistry::new());
    let pool = Arc::new(SubdomainPool::new());
    let ports = Arc::new(PortAllocator::new(config.port_range));
    let validator = Arc::new(SecretValidator::new(
        config.jwt_secret.as_deref(),
        config.api_key_secret.as_deref(),
    ));
    let domains = match DomainValidator::new(&config.base_domain) {
        Ok(v) => Some(Arc::new(v)),
        Err(err) => {
            warn!(%err, "dns validator unavailable, custom host requests disabled");
            None
        }
    };
    let admission = Arc::new(Admission::new(
        config.clone(),
        validator,
        pool.clone(),
        ports.clone(),
        repo.clone(),
        domains,
    ));

    let state = AppState {
        config: config.clone(),
        registry: registry.clone(),
        pool: pool.clone(),
        ports,
        limiter,
        repo: repo.clone(),
        admission,
        metrics,
        logger: RequestLogger::new(repo.clone()),
        ip_allow: Arc::new(IpAllowList::from_strings(&config.ip_whitelist)),
    };

    spawn_sweepers(state.clone());

    let app = Router::new()
        .route("/tunnel", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(any(http_proxy::proxy_handler))
        .with_state(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!(
        %addr,
        base_domain = %config.base_domain,
        port_range = ?config.port_range,
        "tunlink server listening"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let shutdown_state = state.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received, closing tunnels");
        shutdown_state.registry.close_all();
    })
    .await?;

    // Links remove themselves on teardown; give the pumps their drain window.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while state.registry.count() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    info!(remaining = state.registry.count(), "server stopped");
    Ok(())
}

/// Background maintenance: orphaned pendings, subdomain cool-downs, and
/// the paused-tunnel delete policy.
fn spawn_sweepers(state: AppState) {
    let orphan_age = state.config.request_timeout + ORPHAN_SLACK;
    let orphan_state = state.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(30));
        loop {
            tick.tick().await;
            for conn in orphan_state.registry.connections() {
                conn.sweep_orphans(orphan_age);
            }
        }
    });

    let pool_state = state.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(60));
        loop {
            tick.tick().await;
            pool_state.pool.sweep();
        }
    });

    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(60));
        loop {
            tick.tick().await;
            for (id, subdomain) in state.registry.expired_paused(PAUSED_MAX_AGE) {
                info!(tunnel_id = %id, %subdomain, "paused tunnel expired, deleting");
                match tokio::time::timeout(
                    REPO_BUDGET,
                    state.repo.update_status(id, TunnelStatus::Deleted),
                )
                .await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => warn!(%err, "delete status update failed"),
                    Err(_) => warn!("delete status update timed out"),
                }
            }
        }
    });
}

/// Health check endpoint
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "active_tunnels": state.registry.count(),
    }))
}

/// Prometheus metrics endpoint
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let body = state.metrics.to_prometheus().await;
    (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain")], body)
}

/// Control upgrade endpoint. Origin and peer gates run before the upgrade;
/// a `token=` query parameter stands in for the init frame's token.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> axum::response::Response {
    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
    if let Err(err) = admission::check_origin(&state.config, origin) {
        warn!(%err, %peer, "upgrade refused");
        return (StatusCode::FORBIDDEN, err.to_string()).into_response();
    }
    if let Err(err) = admission::check_peer(&state.ip_allow, peer.ip()) {
        warn!(%err, %peer, "upgrade refused");
        return (StatusCode::FORBIDDEN, err.to_string()).into_response();
    }

    let token = params.get("token").cloned();
    ws.on_upgrade(move |socket| link::handle_socket(socket, state, token))
}
