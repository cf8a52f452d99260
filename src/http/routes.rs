//! API handlers. Each one is a thin shim over [`Engine`](crate::engine::Engine).

use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;

use super::AppState;
use crate::agents::{AgentDetail, AgentServer, AgentSnapshot, PushReceipt, SnapshotEntry};
use crate::audit::AuditRecord;
use crate::bans::{ActiveBans, BanHistory};
use crate::engine::Health;
use crate::error::{EngineError, EngineResult};
use crate::executor::ActionOutcome;
use crate::host::HostStats;
use crate::reconcile::{ReconciledJail, ReconciledView};

const AGENT_ID_HEADER: &str = "x-agent-id";
const AGENT_SECRET_HEADER: &str = "x-agent-secret";

#[derive(Debug, Default, Deserialize)]
pub struct StrictQuery {
    #[serde(default)]
    strict: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct BansQuery {
    jail: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct UnbanBody {
    address: String,
}

#[derive(Debug, Deserialize)]
pub struct RegisterBody {
    secret: String,
    name: Option<String>,
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> EngineResult<T> {
    payload
        .map(|Json(v)| v)
        .map_err(|rejection| EngineError::validation("body", rejection.body_text()))
}

pub async fn health(State(state): State<AppState>) -> Json<Health> {
    Json(state.engine.health().await)
}

pub async fn list_jails(State(state): State<AppState>) -> Json<Arc<ReconciledView>> {
    Json(state.engine.list_jails().await)
}

pub async fn get_jail(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> EngineResult<Json<Arc<ReconciledJail>>> {
    state.engine.get_jail(&name).await.map(Json)
}

pub async fn enable_jail(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(q): Query<StrictQuery>,
) -> EngineResult<Json<ActionOutcome>> {
    state.engine.enable(&name, q.strict).await.map(Json)
}

pub async fn disable_jail(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(q): Query<StrictQuery>,
) -> EngineResult<Json<ActionOutcome>> {
    state.engine.disable(&name, q.strict).await.map(Json)
}

pub async fn toggle_jail(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(q): Query<StrictQuery>,
) -> EngineResult<Json<ActionOutcome>> {
    state.engine.toggle(&name, q.strict).await.map(Json)
}

pub async fn unban(
    State(state): State<AppState>,
    Path(name): Path<String>,
    payload: Result<Json<UnbanBody>, JsonRejection>,
) -> EngineResult<Json<ActionOutcome>> {
    let UnbanBody { address } = body(payload)?;
    state.engine.unban(&name, &address).await.map(Json)
}

pub async fn restart_service(State(state): State<AppState>) -> EngineResult<Json<ActionOutcome>> {
    state.engine.restart_service().await.map(Json)
}

pub async fn active_bans(
    State(state): State<AppState>,
    Query(q): Query<BansQuery>,
) -> EngineResult<Json<Arc<ActiveBans>>> {
    state.engine.active_bans(q.jail.as_deref()).await.map(Json)
}

pub async fn ban_history(
    State(state): State<AppState>,
    Query(q): Query<BansQuery>,
) -> EngineResult<Json<Arc<BanHistory>>> {
    state
        .engine
        .ban_history(q.jail.as_deref(), q.limit.unwrap_or(100))
        .await
        .map(Json)
}

pub async fn host_stats(State(state): State<AppState>) -> EngineResult<Json<Arc<HostStats>>> {
    state.engine.host_stats().await.map(Json)
}

pub async fn audit(
    State(state): State<AppState>,
    Query(q): Query<LimitQuery>,
) -> Json<Vec<AuditRecord>> {
    Json(state.engine.audit_recent(q.limit.unwrap_or(50)))
}

pub async fn agent_push(
    State(state): State<AppState>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    payload: Result<Json<AgentSnapshot>, JsonRejection>,
) -> EngineResult<Json<PushReceipt>> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).unwrap_or("");
    let id = header(AGENT_ID_HEADER);
    let secret = header(AGENT_SECRET_HEADER);
    if id.is_empty() || secret.is_empty() {
        return Err(EngineError::Authentication(
            "missing X-Agent-Id or X-Agent-Secret".to_string(),
        ));
    }
    let snapshot = body(payload)?;
    let address = connect.map(|ConnectInfo(addr)| addr.ip().to_string());
    state
        .engine
        .agents()?
        .push(id, secret, address.as_deref(), snapshot)
        .await
        .map(Json)
}

pub async fn list_agents(State(state): State<AppState>) -> EngineResult<Json<Vec<AgentServer>>> {
    state.engine.agents()?.list_agents().await.map(Json)
}

pub async fn get_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> EngineResult<Json<AgentDetail>> {
    state.engine.agents()?.get_agent(&id).await.map(Json)
}

pub async fn agent_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<LimitQuery>,
) -> EngineResult<Json<Vec<SnapshotEntry>>> {
    let limit = u32::try_from(q.limit.unwrap_or(20)).unwrap_or(u32::MAX);
    state.engine.agents()?.snapshot_history(&id, limit).await.map(Json)
}

pub async fn register_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<RegisterBody>, JsonRejection>,
) -> EngineResult<(StatusCode, Json<AgentServer>)> {
    let RegisterBody { secret, name } = body(payload)?;
    let agent = state
        .engine
        .agents()?
        .register(&id, &secret, name.as_deref(), None)
        .await?;
    Ok((StatusCode::CREATED, Json(agent)))
}

pub async fn remove_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> EngineResult<impl IntoResponse> {
    state.engine.agents()?.remove(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}
