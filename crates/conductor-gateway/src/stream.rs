//! WebSocket telemetry stream served at `/api/v1/telemetry`.
//!
//! Every fused frame and every mode transition is pushed to the client as a
//! JSON-encoded [`Event`].  Clients may send
//! `{"type":"emergency_stop","reason":"..."}` upstream.

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use conductor_middleware::Topic;
use conductor_runtime::Orchestrator;
use conductor_types::{Event, EventPayload};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::router::GatewayState;

pub(crate) async fn telemetry_socket(
    ws: WebSocketUpgrade,
    State(state): State<GatewayState>,
) -> Response {
    let orchestrator = state.orchestrator().clone();
    ws.on_upgrade(move |socket| stream_telemetry(socket, orchestrator))
}

async fn stream_telemetry(socket: WebSocket, orchestrator: Orchestrator) {
    info!("telemetry client connected");
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut telemetry = orchestrator.bus().subscribe_to(Topic::Telemetry);
    let mut health = orchestrator.bus().subscribe_to(Topic::Health);

    loop {
        let outgoing = tokio::select! {
            // ── Downstream: frames and mode transitions → client ───────────
            event = telemetry.next_event() => match event {
                Some(event) => event,
                None => break,
            },
            event = health.next_event() => match event {
                Some(event) => event,
                None => break,
            },
            // ── Upstream: client → orchestrator ────────────────────────────
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_upstream_message(&text, &orchestrator).await;
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    _ => {}
                }
                continue;
            }
        };

        if !is_streamed(&outgoing) {
            continue;
        }
        match serde_json::to_string(&outgoing) {
            Ok(json) => {
                if ws_tx.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            Err(e) => warn!(error = %e, "event serialization error"),
        }
    }

    info!("telemetry client disconnected");
}

/// Only fused frames and mode transitions are streamed to clients.
fn is_streamed(event: &Event) -> bool {
    matches!(
        event.payload,
        EventPayload::Frame(_) | EventPayload::ModeChanged { .. }
    )
}

/// Handle a text message sent by a WebSocket client.
///
/// | `type` | Effect |
/// |---|---|
/// | `emergency_stop` | [`Orchestrator::emergency_stop`] with the optional `reason` |
///
/// Anything else is ignored.
pub(crate) async fn handle_upstream_message(text: &str, orchestrator: &Orchestrator) {
    let Ok(json) = serde_json::from_str::<Value>(text) else {
        debug!("ignoring non-JSON client message");
        return;
    };
    if json.get("type").and_then(Value::as_str) == Some("emergency_stop") {
        let reason = json
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or("emergency stop requested via telemetry socket");
        orchestrator.emergency_stop(reason).await;
    }
}
