//! The gateway's HTTP API as an axum [`Router`].
//!
//! | Method | Path | Success | Failure |
//! |---|---|---|---|
//! | `POST` | `/api/v1/modules/:id/command` | `202` + command id | `400` invalid, `404` unknown module, `409` rejected for mode, `429` rate limited, `503` unavailable, `504` timeout |
//! | `GET` | `/api/v1/status` | `200` [`SystemStatus`](conductor_runtime::SystemStatus) | |
//! | `GET` | `/api/v1/metrics` | `200` Prometheus text | |
//! | `POST` | `/api/v1/emergency-stop` | `202`, always | |
//! | `POST` | `/api/v1/mode` | `200` new state | `400` not an operator event, `409` illegal transition |
//! | `GET` | `/api/v1/schema/command` | `200` JSON Schema of the command body | |
//! | `GET` | `/api/v1/telemetry` | WebSocket upgrade, see [`stream`](crate::stream) | |
//!
//! Error bodies are `{"error": <kind>, "message": <text>}`; command errors
//! add the serialised [`CommandError`] as `detail`.

use std::num::NonZeroU32;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Request, State, rejection::JsonRejection},
    http::{StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use conductor_runtime::Orchestrator;
use conductor_types::{Command, CommandError, CommandRequest, ModeEvent};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use schemars::schema_for;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::stream::telemetry_socket;

pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Mode events an operator may request through `POST /api/v1/mode`.
pub const OPERATOR_EVENTS: [ModeEvent; 7] = [
    ModeEvent::StartRequested,
    ModeEvent::Activate,
    ModeEvent::Deactivate,
    ModeEvent::ChargingStarted,
    ModeEvent::ChargingComplete,
    ModeEvent::EmergencyReset,
    ModeEvent::ErrorReset,
];

// ────────────────────────────────────────────────────────────────────────────
// State
// ────────────────────────────────────────────────────────────────────────────

/// Shared by every handler.  The limiter is process-wide: all clients draw
/// from the same command budget.
#[derive(Clone)]
pub struct GatewayState {
    orchestrator: Orchestrator,
    limiter: Arc<DefaultDirectRateLimiter>,
}

impl GatewayState {
    /// `commands_per_second` of 0 is treated as 1.
    pub fn new(orchestrator: Orchestrator, commands_per_second: u32) -> Self {
        let rate = NonZeroU32::new(commands_per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            orchestrator,
            limiter: Arc::new(RateLimiter::direct(Quota::per_second(rate))),
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }
}

#[derive(Debug, Deserialize)]
struct ModeRequest {
    event: ModeEvent,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct EmergencyStopRequest {
    #[serde(default)]
    reason: Option<String>,
}

// ────────────────────────────────────────────────────────────────────────────
// Router
// ────────────────────────────────────────────────────────────────────────────

pub fn api_router(state: GatewayState) -> Router {
    let commands = Router::new()
        .route("/api/v1/modules/:module_id/command", post(submit_command))
        .route_layer(middleware::from_fn_with_state(state.clone(), limit_commands));

    Router::new()
        .merge(commands)
        .route("/api/v1/status", get(status))
        .route("/api/v1/metrics", get(metrics))
        .route("/api/v1/emergency-stop", post(emergency_stop))
        .route("/api/v1/mode", post(mode_event))
        .route("/api/v1/schema/command", get(command_schema))
        .route("/api/v1/telemetry", get(telemetry_socket))
        .fallback(not_found)
        .with_state(state)
}

async fn limit_commands(
    State(state): State<GatewayState>,
    request: Request,
    next: Next,
) -> Response {
    if state.limiter.check().is_err() {
        warn!(path = %request.uri().path(), "command rate limit exceeded");
        return error(
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limited",
            "command rate limit exceeded",
        );
    }
    next.run(request).await
}

// ────────────────────────────────────────────────────────────────────────────
// Handlers
// ────────────────────────────────────────────────────────────────────────────

async fn submit_command(
    State(state): State<GatewayState>,
    Path(module_id): Path<String>,
    body: Result<Json<CommandRequest>, JsonRejection>,
) -> Response {
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => {
            return error(
                StatusCode::BAD_REQUEST,
                "invalid",
                format!("malformed command body: {}", rejection.body_text()),
            );
        }
    };
    if request.action.trim().is_empty() {
        return error(StatusCode::BAD_REQUEST, "invalid", "action must not be empty");
    }
    debug!(module = %module_id, action = %request.action, "command submitted");

    match state
        .orchestrator
        .dispatch(&module_id, Command::from(request))
        .await
    {
        Ok(ack) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "status": "accepted",
                "command_id": ack.command_id,
                "detail": ack.detail,
            })),
        )
            .into_response(),
        Err(e) => command_error(&e),
    }
}

async fn status(State(state): State<GatewayState>) -> Response {
    Json(state.orchestrator.status()).into_response()
}

async fn metrics(State(state): State<GatewayState>) -> Response {
    (
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        state.orchestrator.prometheus(),
    )
        .into_response()
}

/// Always accepted, even with a missing or unreadable body.
async fn emergency_stop(State(state): State<GatewayState>, body: Bytes) -> Response {
    let request: EmergencyStopRequest = serde_json::from_slice(&body).unwrap_or_default();
    let reason = request
        .reason
        .unwrap_or_else(|| "emergency stop requested via gateway".to_string());
    let robot = state.orchestrator.emergency_stop(&reason).await;
    (
        StatusCode::ACCEPTED,
        Json(json!({ "status": "accepted", "state": robot })),
    )
        .into_response()
}

async fn mode_event(
    State(state): State<GatewayState>,
    body: Result<Json<ModeRequest>, JsonRejection>,
) -> Response {
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => {
            return error(
                StatusCode::BAD_REQUEST,
                "invalid",
                format!("malformed mode body: {}", rejection.body_text()),
            );
        }
    };
    if !OPERATOR_EVENTS.contains(&request.event) {
        return error(
            StatusCode::BAD_REQUEST,
            "invalid",
            format!("'{}' cannot be requested by an operator", request.event),
        );
    }

    let reason = request
        .reason
        .unwrap_or_else(|| format!("{} requested via gateway", request.event));
    match state.orchestrator.apply_mode_event(request.event, &reason) {
        Ok(robot) => Json(robot).into_response(),
        Err(e) => (
            StatusCode::CONFLICT,
            Json(json!({
                "error": "transition_rejected",
                "message": e.to_string(),
                "detail": e,
            })),
        )
            .into_response(),
    }
}

async fn command_schema() -> Response {
    Json(schema_for!(CommandRequest)).into_response()
}

async fn not_found(request: Request) -> Response {
    error(
        StatusCode::NOT_FOUND,
        "not_found",
        format!("no route for {}", request.uri().path()),
    )
}

fn error(status: StatusCode, kind: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({ "error": kind, "message": message.into() })),
    )
        .into_response()
}

fn command_error(e: &CommandError) -> Response {
    let (status, kind) = match e {
        CommandError::Rejected { .. } => (StatusCode::CONFLICT, "rejected"),
        CommandError::Timeout { .. } => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
        CommandError::Invalid(_) => (StatusCode::BAD_REQUEST, "invalid"),
        CommandError::UnknownModule(_) => (StatusCode::NOT_FOUND, "unknown_module"),
        CommandError::Unavailable { .. } => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
        CommandError::Failed { .. } => (StatusCode::BAD_GATEWAY, "failed"),
    };
    (
        status,
        Json(json!({ "error": kind, "message": e.to_string(), "detail": e })),
    )
        .into_response()
}
