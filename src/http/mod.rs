//! HTTP surface: the JSON API and the Prometheus metrics endpoint.
//!
//! The API and `/metrics` listen on separate ports. Control routes sit behind
//! an optional bearer token; read routes are open.

mod routes;

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;

use crate::engine::Engine;
use crate::error::EngineError;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    token: Option<Arc<str>>,
}

impl AppState {
    pub fn new(engine: Engine, token: Option<String>) -> Self {
        Self {
            engine,
            token: token.filter(|t| !t.is_empty()).map(Arc::from),
        }
    }
}

/// Build the API router.
pub fn router(state: AppState) -> Router {
    let mut control = Router::new()
        .route("/api/jails/:name/enable", post(routes::enable_jail))
        .route("/api/jails/:name/disable", post(routes::disable_jail))
        .route("/api/jails/:name/toggle", post(routes::toggle_jail))
        .route("/api/jails/:name/unban", post(routes::unban))
        .route("/api/service/restart", post(routes::restart_service));
    // Agent administration is only mounted behind a token.
    if state.token.is_some() {
        control = control
            .route("/api/agents/:id", delete(routes::remove_agent))
            .route("/api/agents/:id/register", post(routes::register_agent));
    }
    let control =
        control.route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .route("/api/health", get(routes::health))
        .route("/api/jails", get(routes::list_jails))
        .route("/api/jails/:name", get(routes::get_jail))
        .route("/api/bans/active", get(routes::active_bans))
        .route("/api/bans/history", get(routes::ban_history))
        .route("/api/host", get(routes::host_stats))
        .route("/api/audit", get(routes::audit))
        .route("/api/agents", get(routes::list_agents))
        .route("/api/agents/push", post(routes::agent_push))
        .route("/api/agents/:id", get(routes::get_agent))
        .route("/api/agents/:id/history", get(routes::agent_history))
        .merge(control)
        .with_state(state)
}

async fn require_token(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let Some(expected) = &state.token else {
        return next.run(req).await;
    };
    let presented = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");
    if bool::from(presented.as_bytes().ct_eq(expected.as_bytes())) {
        next.run(req).await
    } else {
        tracing::warn!(path = %req.uri().path(), "control request without a valid token");
        EngineError::Authentication("api".to_string()).into_response()
    }
}

/// Serve the API until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await
}

/// Handler for GET /metrics - returns Prometheus metrics in text format.
async fn metrics_handler() -> String {
    crate::metrics::gather_metrics()
}

/// Run the HTTP server for Prometheus metrics.
///
/// Binds to `0.0.0.0:port` and serves `/metrics`. Long-running; spawn it.
pub async fn run_metrics_server(port: u16) {
    let app = Router::new().route("/metrics", get(metrics_handler));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Prometheus HTTP server listening on {}", addr);

    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind metrics server on {}: {}", addr, e);
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Metrics server error: {}", e);
    }
}
