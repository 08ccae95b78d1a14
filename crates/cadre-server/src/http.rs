use crate::rpc::{self, RpcRequest};
use crate::{AppState, BridgeEnvelope};
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::{BroadcastStream, IntervalStream};
use tower_http::cors::CorsLayer;

const SSE_PING_INTERVAL: Duration = Duration::from_secs(30);

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/events", get(events))
        .route("/metrics", get(metrics))
        .route("/debug/events", post(debug_events))
        .route("/debug/ring", post(debug_ring_toggle))
        .route("/rpc", get(rpc_ws))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let agents = state.manager.list().await.map(|a| a.len()).unwrap_or(0);
    Json(json!({
        "healthy": true,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_ms": cadre_types::now_ms().saturating_sub(state.started_at_ms),
        "agents": agents,
        "bus_seq": state.bus.seq(),
        "durable_store": state.durable_store,
    }))
}

fn sse_stream(state: AppState) -> impl Stream<Item = Result<Event, Infallible>> {
    let rx = state.bridge.subscribe();
    let ready = tokio_stream::once(Ok(Event::default().event("engine.ready").data(
        json!({
            "status": "ready",
            "transport": "sse",
            "timestamp_ms": cadre_types::now_ms(),
        })
        .to_string(),
    )));
    let live = BroadcastStream::new(rx).filter_map(|envelope| async move {
        match envelope {
            Ok(BridgeEnvelope { event, data }) => {
                Some(Ok(Event::default().event(event).data(data.to_string())))
            }
            // Lagged receivers drop, they never block the broadcaster.
            Err(_) => None,
        }
    });
    let first_ping = tokio::time::Instant::now() + SSE_PING_INTERVAL;
    let pings = IntervalStream::new(tokio::time::interval_at(first_ping, SSE_PING_INTERVAL))
        .map(|_| Ok(Event::default().event("ping").data("{}")));
    ready.chain(futures::stream::select(live, pings))
}

async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    Sse::new(sse_stream(state)).keep_alive(KeepAlive::new().interval(SSE_PING_INTERVAL))
}

async fn metrics(State(state): State<AppState>) -> Json<Value> {
    let fanout = state.debug_ring.metrics().snapshot();
    Json(json!({
        "droppable_skip_total": fanout.droppable_skip_total,
        "dropped_total": fanout.dropped_total,
        "overflow_count": fanout.overflow_count,
        "bus": {
            "seq": state.bus.seq(),
            "subscribers": state.bus.subscriber_count(),
            "dropped_total": state.bus.dropped_total(),
        },
        "debug_ring": {
            "enabled": state.debug_ring.enabled(),
            "max_id": state.debug_ring.max_id(),
        },
    }))
}

#[derive(Debug, Deserialize)]
struct DebugPollRequest {
    #[serde(default)]
    after: u64,
    #[serde(default = "default_poll_limit")]
    limit: usize,
}

fn default_poll_limit() -> usize {
    100
}

async fn debug_events(
    State(state): State<AppState>,
    Json(req): Json<DebugPollRequest>,
) -> Json<Value> {
    let (events, max_id) = state.debug_ring.poll(req.after, req.limit);
    Json(json!({ "events": events, "max_id": max_id }))
}

#[derive(Debug, Deserialize)]
struct DebugRingToggle {
    enabled: bool,
}

async fn debug_ring_toggle(
    State(state): State<AppState>,
    Json(req): Json<DebugRingToggle>,
) -> Json<Value> {
    state.debug_ring.set_enabled(req.enabled);
    Json(json!({ "enabled": state.debug_ring.enabled() }))
}

async fn rpc_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| rpc_ws_stream(socket, state))
}

/// JSON-RPC over one WebSocket: requests flow in, responses flow out, and
/// every bridge envelope is pushed as a notification.
async fn rpc_ws_stream(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = tokio::sync::mpsc::channel::<String>(256);

    let forward_state = state.clone();
    let forward_tx = out_tx.clone();
    let forwarder = tokio::spawn(async move {
        let mut rx = forward_state.bridge.subscribe();
        loop {
            match rx.recv().await {
                Ok(envelope) => {
                    let notification = json!({
                        "method": envelope.event,
                        "params": envelope.data,
                    });
                    if forward_tx.send(notification.to_string()).await.is_err() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "ws notification stream lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let writer = tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if sink.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        let text = match message {
            WsMessage::Text(text) => text.to_string(),
            WsMessage::Close(_) => break,
            _ => continue,
        };
        let request: RpcRequest = match serde_json::from_str(&text) {
            Ok(request) => request,
            Err(err) => {
                let reply = json!({
                    "id": Value::Null,
                    "error": { "code": rpc::PARSE_ERROR, "message": err.to_string() },
                });
                if out_tx.send(reply.to_string()).await.is_err() {
                    break;
                }
                continue;
            }
        };

        let id = request.id.clone();
        let result = rpc::dispatch(&state, &request.method, request.params).await;
        // Requests without an id are notifications; no reply goes back.
        let Some(id) = id else { continue };
        let reply = match result {
            Ok(result) => json!({ "id": id, "result": result }),
            Err(err) => json!({
                "id": id,
                "error": { "code": err.code, "message": err.message },
            }),
        };
        if out_tx.send(reply.to_string()).await.is_err() {
            break;
        }
    }

    forwarder.abort();
    writer.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    async fn test_state() -> (tempfile::TempDir, AppState) {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::build(crate::AppStateOptions {
            state_dir: dir.path().join("state"),
            db_path: dir.path().join("state").join("cadre.db"),
            workspace_root_dir: dir.path().join("workspaces"),
            project_root: dir.path().to_path_buf(),
            user_config_path: dir.path().join("user-config.toml"),
            workspace_config_path: None,
            agent_launch: None,
        })
        .await
        .unwrap();
        (dir, state)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn post_json(app: Router, uri: &str, body: Value) -> (StatusCode, Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn health_reports_ready() {
        let (_dir, state) = test_state().await;
        let (status, payload) = get_json(router(state), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload["healthy"], json!(true));
        assert!(payload["version"].is_string());
        assert_eq!(payload["durable_store"], json!(true));
    }

    #[tokio::test]
    async fn metrics_exposes_backpressure_counters() {
        let (_dir, state) = test_state().await;
        let (status, payload) = get_json(router(state), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(payload["droppable_skip_total"].is_number());
        assert!(payload["dropped_total"].is_number());
        assert!(payload["overflow_count"].is_number());
        assert!(payload["bus"]["seq"].is_number());
    }

    #[tokio::test]
    async fn debug_ring_toggle_and_first_poll_ack() {
        let (_dir, state) = test_state().await;
        let app = router(state.clone());

        let (status, payload) =
            post_json(app.clone(), "/debug/ring", json!({"enabled": true})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload["enabled"], json!(true));

        state
            .debug_ring
            .publish("turn/started", json!({"threadId": "t1"}), 1);

        let (_, ack) = post_json(app.clone(), "/debug/events", json!({"after": 0})).await;
        assert_eq!(ack["events"].as_array().unwrap().len(), 0);
        let max_id = ack["max_id"].as_u64().unwrap();
        assert_eq!(max_id, 1);

        state
            .debug_ring
            .publish("turn/completed", json!({"threadId": "t1"}), 2);
        let (_, page) = post_json(app, "/debug/events", json!({"after": max_id})).await;
        let events = page["events"].as_array().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["method"], json!("turn/completed"));
    }
}
