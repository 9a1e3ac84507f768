//! Application assembly: shared state, router, lifecycle tasks.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::{any, get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde_json::{json, Value};
use time::OffsetDateTime;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::dashboard::{self, Publisher};
use crate::db::{DbHandle, ProxyDb};
use crate::engine::BufferEngine;
use crate::proxy;
use crate::store::ConversationStore;
use crate::upstream::{HttpUpstream, UpstreamClient};

/// How long shutdown waits for in-flight checkpoints to drain.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// How often idle conversations are swept.
const EVICTION_INTERVAL: Duration = Duration::from_secs(60);

/// Application state shared across handlers.
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<ConversationStore>,
    pub engine: Arc<BufferEngine>,
    pub upstream: Arc<dyn UpstreamClient>,
    pub publisher: Publisher,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// Wire up the store, publisher, and engine around the given upstream.
    #[must_use]
    pub fn new(config: Config, upstream: Arc<dyn UpstreamClient>, db: Option<DbHandle>) -> SharedState {
        let config = Arc::new(config);
        let store = Arc::new(ConversationStore::new(config.conversation_ttl));
        let publisher = Publisher::new();
        let engine = BufferEngine::new(
            Arc::clone(&config),
            Arc::clone(&store),
            Arc::clone(&upstream),
            publisher.clone(),
            db,
        );
        Arc::new(Self {
            config,
            store,
            engine,
            upstream,
            publisher,
        })
    }
}

/// Build the full application router: interception, health, reset, and the
/// dashboard surfaces. Both listeners serve the same router.
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/v1/messages", post(proxy::handle_messages))
        .route("/v1/_reset", post(handle_reset))
        .route("/health", get(handle_health))
        .route("/dashboard", get(dashboard::dashboard_page))
        .route("/dashboard/ws", get(dashboard::ws_handler))
        .route("/dashboard/api/conversations", get(dashboard::list_conversations))
        .route(
            "/dashboard/api/conversation/{key}",
            get(dashboard::conversation_detail),
        )
        // Everything else under the API roots forwards untouched.
        .route("/v1/{*rest}", any(proxy::handle_passthrough))
        .route("/api/{*rest}", any(proxy::handle_passthrough))
        .with_state(state)
}

/// `GET /health`
async fn handle_health(State(state): State<SharedState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "conversations": state.store.len(),
        "passthrough": state.config.passthrough,
    }))
}

/// `POST /v1/_reset`: reset one conversation (by conv_id prefix) or all.
async fn handle_reset(
    State(state): State<SharedState>,
    body: Bytes,
) -> axum::response::Response {
    use axum::http::StatusCode;
    use axum::response::IntoResponse;

    let parsed: Value = serde_json::from_slice(&body).unwrap_or_else(|_| json!({}));
    match parsed.get("conv_id").and_then(Value::as_str) {
        Some(conv_id) => {
            let count = state.engine.reset_matching(conv_id, "api_reset").await;
            if count == 0 {
                (
                    StatusCode::NOT_FOUND,
                    Json(json!({"error": "conversation not found"})),
                )
                    .into_response()
            } else {
                Json(json!({"status": "reset", "conv_id": conv_id})).into_response()
            }
        }
        None => {
            let count = state.engine.reset_all("api_reset_all").await;
            Json(json!({"status": "reset_all", "count": count})).into_response()
        }
    }
}

/// Periodically sweep idle conversations.
pub fn spawn_eviction_task(state: SharedState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(EVICTION_INTERVAL);
        interval.tick().await; // immediate first tick
        loop {
            interval.tick().await;
            let evicted = state.store.evict_idle(OffsetDateTime::now_utc());
            if !evicted.is_empty() {
                tracing::info!(count = evicted.len(), "evicted idle conversations");
            }
        }
    })
}

/// Run the proxy until interrupted.
///
/// # Errors
/// Returns an error if a listener cannot bind or the server fails.
pub async fn run(config: Config) -> Result<()> {
    let upstream: Arc<dyn UpstreamClient> =
        Arc::new(HttpUpstream::new(&config.upstream_url).context("upstream client")?);

    let db = match ProxyDb::open(&config.db_path) {
        Ok(db) => Some(DbHandle::new(db)),
        Err(err) => {
            tracing::warn!(error = %err, "snapshot persistence disabled");
            None
        }
    };

    let state = AppState::new(config.clone(), upstream, db);
    let app = router(Arc::clone(&state))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let eviction = spawn_eviction_task(Arc::clone(&state));

    let proxy_addr: SocketAddr = format!("{}:{}", config.host, config.proxy_port)
        .parse()
        .context("proxy bind address")?;
    let proxy_listener = tokio::net::TcpListener::bind(proxy_addr)
        .await
        .context("proxy listener")?;
    tracing::info!(addr = %proxy_addr, "proxy listening");

    if config.dashboard_port == config.proxy_port {
        axum::serve(proxy_listener, app)
            .with_graceful_shutdown(wait_for_shutdown(shutdown_rx))
            .await
            .context("proxy server")?;
    } else {
        let dashboard_addr: SocketAddr = format!("{}:{}", config.host, config.dashboard_port)
            .parse()
            .context("dashboard bind address")?;
        let dashboard_listener = tokio::net::TcpListener::bind(dashboard_addr)
            .await
            .context("dashboard listener")?;
        tracing::info!(addr = %dashboard_addr, "dashboard listening");

        let proxy_serve = axum::serve(proxy_listener, app.clone())
            .with_graceful_shutdown(wait_for_shutdown(shutdown_rx.clone()));
        let dashboard_serve = axum::serve(dashboard_listener, app)
            .with_graceful_shutdown(wait_for_shutdown(shutdown_rx));
        let (proxy_result, dashboard_result) = tokio::join!(proxy_serve, dashboard_serve);
        proxy_result.context("proxy server")?;
        dashboard_result.context("dashboard server")?;
    }

    eviction.abort();
    state.store.shutdown(SHUTDOWN_GRACE).await;
    tracing::info!("server stopped");
    Ok(())
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stopping| *stopping).await;
}
