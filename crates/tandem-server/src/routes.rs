//! Thin HTTP surface over the session engine.
//!
//! Every route needs `Authorization: Bearer <token>`. Lifecycle changes are
//! fanned out to connected participants the same way socket actions are.

use axum::extract::{FromRequestParts, Path, Query, State, WebSocketUpgrade};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::error;

use tandem_core::definition::SessionDefinition;
use tandem_core::ids::{SessionId, UserId};
use tandem_core::session::{ControlMode, SessionStatus};
use tandem_engine::{EngineError, SessionEvent, SessionView};
use tandem_store::sessions::{ParticipantRow, SessionRow};

use crate::health::HealthResponse;
use crate::server::AppState;
use crate::ws;

/// The user behind a request's bearer token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthUser(pub UserId);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .ok_or(ApiError::Unauthorized)?;
        state
            .runtime
            .auth
            .authenticate(token)
            .map(AuthUser)
            .ok_or(ApiError::Unauthorized)
    }
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    Engine(EngineError),
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self::Engine(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            Self::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized", "Unauthorized".to_string()),
            Self::Engine(e) => {
                let (status, code) = match &e {
                    EngineError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
                    EngineError::InvalidState(_) => (StatusCode::CONFLICT, "invalid_state"),
                    EngineError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
                    EngineError::Forbidden(_) => (StatusCode::FORBIDDEN, "forbidden"),
                    EngineError::InvalidDefinition(_) => (StatusCode::BAD_REQUEST, "invalid_definition"),
                    EngineError::Store(_) => {
                        error!(error = %e, "store failure behind HTTP request");
                        (StatusCode::INTERNAL_SERVER_ERROR, "internal")
                    }
                };
                (status, code, e.to_string())
            }
        };
        (status, Json(json!({ "error": message, "code": code }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub definition: SessionDefinition,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantSummary {
    pub user_id: UserId,
    pub role: Option<String>,
    pub control_mode: ControlMode,
    pub connected: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: SessionId,
    pub name: String,
    pub host_id: UserId,
    pub status: SessionStatus,
    pub current_phase: Option<String>,
    pub participants: Vec<ParticipantSummary>,
}

impl SessionSummary {
    fn new(session: SessionRow, participants: Vec<ParticipantRow>) -> Self {
        Self {
            id: session.id,
            name: session.definition.name,
            host_id: session.host_id,
            status: session.status,
            current_phase: session.current_phase,
            participants: participants
                .into_iter()
                .map(|p| ParticipantSummary {
                    user_id: p.user_id,
                    role: p.role,
                    control_mode: p.control_mode,
                    connected: p.connected,
                })
                .collect(),
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn summary(state: &AppState, id: &SessionId) -> ApiResult<Json<SessionSummary>> {
    let engine = &state.runtime.engine;
    Ok(Json(SessionSummary::new(engine.get(id)?, engine.participants(id)?)))
}

async fn publish(state: &AppState, id: &SessionId, events: Vec<SessionEvent>) {
    state.runtime.fanout.publish(id, events).await;
}

pub async fn create_session(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(req): Json<CreateSessionRequest>,
) -> ApiResult<(StatusCode, Json<SessionSummary>)> {
    let session = state.runtime.engine.create(&req.definition, &user)?;
    Ok((StatusCode::CREATED, summary(&state, &session.id)?))
}

pub async fn get_session(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<SessionId>,
) -> ApiResult<Json<SessionView>> {
    Ok(Json(state.runtime.engine.view_for(&id, &user)?))
}

pub async fn join_session(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<SessionId>,
) -> ApiResult<Json<SessionSummary>> {
    let events = state.runtime.engine.join(&id, &user)?;
    publish(&state, &id, events).await;
    summary(&state, &id)
}

pub async fn leave_session(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<SessionId>,
) -> ApiResult<Json<SessionSummary>> {
    let events = state.runtime.engine.leave(&id, &user)?;
    publish(&state, &id, events).await;
    summary(&state, &id)
}

pub async fn start_session(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<SessionId>,
) -> ApiResult<Json<SessionSummary>> {
    let events = state.runtime.engine.start(&id, &user)?;
    publish(&state, &id, events).await;
    summary(&state, &id)
}

pub async fn pause_session(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<SessionId>,
) -> ApiResult<Json<SessionSummary>> {
    let events = state.runtime.engine.pause(&id, &user)?;
    publish(&state, &id, events).await;
    summary(&state, &id)
}

pub async fn resume_session(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<SessionId>,
) -> ApiResult<Json<SessionSummary>> {
    let events = state.runtime.engine.resume(&id, &user)?;
    publish(&state, &id, events).await;
    summary(&state, &id)
}

pub async fn delete_session(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<SessionId>,
) -> ApiResult<StatusCode> {
    let events = state.runtime.engine.delete(&id, &user)?;
    publish(&state, &id, events).await;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(state.runtime.health())
}

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    #[serde(default)]
    pub token: Option<String>,
}

/// GET /ws: token in the query string; a bad token is closed with 4001 after
/// the upgrade so browser clients can read the code.
pub async fn user_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
) -> impl IntoResponse {
    let user = query
        .token
        .as_deref()
        .and_then(|token| state.runtime.auth.authenticate(token));
    let runtime = state.runtime.clone();
    ws.on_upgrade(move |socket| ws::user::serve(socket, runtime, user))
}

pub async fn agent_socket(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let runtime = state.runtime.clone();
    ws.on_upgrade(move |socket| ws::agent::serve(socket, runtime))
}

pub async fn session_socket(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let runtime = state.runtime.clone();
    ws.on_upgrade(move |socket| ws::session::serve(socket, runtime))
}
