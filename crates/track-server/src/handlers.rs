//! Connection handlers for the tracking endpoint.
//!
//! One WebSocket per client. The authentication layer in front of this
//! service resolves the caller and passes the identity string along; this
//! module only wires sockets to the broker and pumps frames both ways.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::protocol::{ClientMessage, ServerMessage};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use livetrack_core::{BrokerConfig, ConnectionId, TrackingBroker, TrackingEvent};
use livetrack_transport::GroupRouter;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The tracking broker.
    pub broker: TrackingBroker,
    /// Group delivery router the broker publishes through.
    pub groups: Arc<GroupRouter>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state with a running broker.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let groups = Arc::new(GroupRouter::new());
        let broker = TrackingBroker::start(
            groups.clone(),
            BrokerConfig {
                reap_interval: config.reap_interval(),
                on_reap: Some(metrics::record_reap),
            },
        );

        Self {
            broker,
            groups,
            config,
        }
    }
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let app = Router::new()
        .route(&config.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    let addr = config.bind_addr();
    let listener = TcpListener::bind(addr).await?;

    info!("Livetrack server listening on {}", addr);
    info!(
        "Tracking endpoint: ws://{}{}",
        addr, config.websocket_path
    );

    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// WebSocket upgrade handler.
///
/// The caller identity arrives as a query parameter, already resolved by the
/// authentication layer in front of this service.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let Some(identity) = params.get("identity").cloned() else {
        return (StatusCode::BAD_REQUEST, "missing identity").into_response();
    };
    if identity.is_empty() {
        return (StatusCode::BAD_REQUEST, "empty identity").into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, identity, state))
        .into_response()
}

/// Handle one tracking connection for its whole lifetime.
async fn handle_socket(socket: WebSocket, identity: String, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let handle = ConnectionId::generate();
    debug!(identity = %identity, connection = %handle, "Tracking socket connected");

    // Attach the outbound channel before the broker learns about the
    // connection, so a group add can never race an unattached socket.
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    state.groups.attach(handle.clone(), outbound_tx);
    state.broker.on_connect(&identity, handle.clone());

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            // Events fanned out to one of this connection's groups.
            Some(frame) = outbound_rx.recv() => {
                let text = match String::from_utf8(frame.to_vec()) {
                    Ok(text) => text,
                    Err(_) => {
                        warn!(connection = %handle, "Dropping non-UTF-8 outbound frame");
                        continue;
                    }
                };
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }

            // Inbound client traffic.
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if text.len() > state.config.limits.max_message_size {
                            metrics::record_error("oversized_message");
                            send_reply(
                                &mut sender,
                                &ServerMessage::error("message", "message too large"),
                            )
                            .await;
                            continue;
                        }

                        let reply = match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(client_msg) => {
                                handle_message(client_msg, &identity, &handle, &state).await
                            }
                            Err(e) => {
                                metrics::record_error("malformed_message");
                                ServerMessage::error("message", e.to_string())
                            }
                        };
                        send_reply(&mut sender, &reply).await;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        // Clients speak JSON text frames only.
                        send_reply(
                            &mut sender,
                            &ServerMessage::error("message", "binary frames not supported"),
                        )
                        .await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %handle, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %handle, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %handle, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    // Disconnect cleanup always runs: registry first, then purge, then the
    // delivery side.
    state.broker.on_disconnect(&identity, &handle);
    state.groups.detach(&handle);
    metrics::set_active_topics(state.broker.stats().topic_count);

    debug!(identity = %identity, connection = %handle, "Tracking socket disconnected");
}

/// Handle one decoded client message.
async fn handle_message(
    msg: ClientMessage,
    identity: &str,
    handle: &ConnectionId,
    state: &Arc<AppState>,
) -> ServerMessage {
    match msg {
        ClientMessage::Join { topic } => {
            if let Err(reason) = validate_topic(&topic, state) {
                return ServerMessage::error("join", reason);
            }
            match state.broker.join_topic(&topic, handle).await {
                Ok(()) => {
                    metrics::record_subscription();
                    metrics::set_active_topics(state.broker.stats().topic_count);
                    ServerMessage::ack("join")
                }
                Err(e) => {
                    warn!(connection = %handle, topic = %topic, error = %e, "Join failed");
                    metrics::record_error("join");
                    ServerMessage::error("join", e.to_string())
                }
            }
        }

        ClientMessage::Leave { topic } => match state.broker.leave_topic(&topic, handle).await {
            Ok(()) => {
                metrics::set_active_topics(state.broker.stats().topic_count);
                ServerMessage::ack("leave")
            }
            Err(e) => ServerMessage::error("leave", e.to_string()),
        },

        ClientMessage::Publish {
            topic,
            event,
            payload,
        } => {
            if let Err(reason) = validate_topic(&topic, state) {
                return ServerMessage::error("publish", reason);
            }
            let mut tracking_event = TrackingEvent::new(&topic, payload);
            if let Some(name) = event {
                tracking_event = tracking_event.with_event(name);
            }

            match state.broker.publish_to_topic(&topic, tracking_event).await {
                Ok(recipients) => {
                    metrics::record_publish();
                    debug!(topic = %topic, recipients, "Published");
                    ServerMessage::ack("publish")
                }
                Err(e) => {
                    metrics::record_error("publish");
                    ServerMessage::error("publish", e.to_string())
                }
            }
        }

        ClientMessage::Location {
            latitude,
            longitude,
        } => match state
            .broker
            .publish_location_update(identity, latitude, longitude)
            .await
        {
            Ok(_) => {
                metrics::record_location_update();
                ServerMessage::ack("location")
            }
            Err(e) => {
                metrics::record_error("location");
                ServerMessage::error("location", e.to_string())
            }
        },

        ClientMessage::Ping => ServerMessage::Pong,
    }
}

fn validate_topic(topic: &str, state: &AppState) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("topic cannot be empty");
    }
    if topic.len() > state.config.limits.max_topic_length {
        return Err("topic name too long");
    }
    Ok(())
}

/// Send a control reply, ignoring a closed socket (the main loop notices on
/// the next turn).
async fn send_reply(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    reply: &ServerMessage,
) {
    if let Ok(text) = serde_json::to_string(reply) {
        let _ = sender.send(Message::Text(text)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_app_state_wires_broker_to_groups() {
        let state = AppState::new(Config::default());

        let handle = ConnectionId::new("h1");
        let (tx, mut rx) = mpsc::unbounded_channel();
        state.groups.attach(handle.clone(), tx);
        state.broker.on_connect("u1", handle.clone());

        state.broker.join_topic("order:1", &handle).await.unwrap();
        let delivered = state
            .broker
            .publish_to_topic("order:1", TrackingEvent::new("order:1", serde_json::json!({})))
            .await
            .unwrap();

        assert_eq!(delivered, 1);
        assert!(rx.try_recv().is_ok());
        state.broker.shutdown().await;
    }

    #[tokio::test]
    async fn test_handle_message_rejects_bad_topics() {
        let state = Arc::new(AppState::new(Config::default()));
        let handle = ConnectionId::new("h1");

        let reply = handle_message(
            ClientMessage::Join {
                topic: String::new(),
            },
            "u1",
            &handle,
            &state,
        )
        .await;
        assert!(matches!(reply, ServerMessage::Error { .. }));

        let reply = handle_message(
            ClientMessage::Join {
                topic: "t".repeat(state.config.limits.max_topic_length + 1),
            },
            "u1",
            &handle,
            &state,
        )
        .await;
        assert!(matches!(reply, ServerMessage::Error { .. }));
        state.broker.shutdown().await;
    }

    #[tokio::test]
    async fn test_join_unattached_connection_is_an_error() {
        let state = Arc::new(AppState::new(Config::default()));
        // No groups.attach: the transport refuses the group add, so the
        // index records nothing.
        let handle = ConnectionId::new("ghost");

        let reply = handle_message(
            ClientMessage::Join {
                topic: "order:1".to_string(),
            },
            "u1",
            &handle,
            &state,
        )
        .await;

        assert!(matches!(reply, ServerMessage::Error { .. }));
        assert!(state.broker.subscribers_of("order:1").is_empty());
        state.broker.shutdown().await;
    }
}
