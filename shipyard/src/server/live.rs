//! Live log relay over WebSocket

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::server::handlers::ErrorResponse;
use crate::server::state::ServerState;
use crate::transport::live::{BusMessage, PubSubBus};
use crate::transport::topics::Topics;

/// Sent by the viewer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Subscribe { channel: String },
}

/// Sent to the viewer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Subscription is active; relaying starts after this
    Joined { channel: String },
    Log {
        channel: String,
        event: serde_json::Value,
    },
    Error { message: String },
}

impl ServerMessage {
    fn from_bus(message: BusMessage) -> Self {
        let event = serde_json::from_str(&message.payload)
            .unwrap_or_else(|_| serde_json::Value::String(message.payload.clone()));
        ServerMessage::Log {
            channel: message.channel,
            event,
        }
    }
}

/// Live logs handler
pub async fn logs_ws_handler(
    State(state): State<Arc<ServerState>>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(bus) = state.bus.clone() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse {
                error: "live logs are not enabled".to_string(),
            }),
        )
            .into_response();
    };

    let send_timeout = state.send_timeout;
    ws.on_upgrade(move |socket| relay(socket, bus, send_timeout))
}

async fn send(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    message: &ServerMessage,
    timeout: Duration,
) -> bool {
    let text = match serde_json::to_string(message) {
        Ok(text) => text,
        Err(e) => {
            warn!("Unable to encode live message: {}", e);
            return true;
        }
    };

    match tokio::time::timeout(timeout, sender.send(Message::Text(text.into()))).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!("Live viewer went away: {}", e);
            false
        }
        Err(_) => {
            warn!("Dropping live viewer slower than {:?}", timeout);
            false
        }
    }
}

/// Wait for a valid subscribe request
async fn handshake(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    receiver: &mut futures::stream::SplitStream<WebSocket>,
    timeout: Duration,
) -> Option<String> {
    while let Some(Ok(message)) = receiver.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => return None,
            _ => continue,
        };

        let reply = match serde_json::from_str::<ClientMessage>(text.as_str()) {
            Ok(ClientMessage::Subscribe { channel }) if Topics::is_viewer_pattern(&channel) => {
                return Some(channel);
            }
            Ok(ClientMessage::Subscribe { channel }) => format!("unknown channel: {}", channel),
            Err(e) => format!("expected a subscribe message: {}", e),
        };

        if !send(sender, &ServerMessage::Error { message: reply }, timeout).await {
            return None;
        }
    }
    None
}

async fn relay(socket: WebSocket, bus: Arc<dyn PubSubBus>, timeout: Duration) {
    let (mut sender, mut receiver) = socket.split();

    // A viewer that never subscribes does not get to hold the socket
    let subscribed = handshake(&mut sender, &mut receiver, timeout);
    let channel = match tokio::time::timeout(timeout, subscribed).await {
        Ok(Some(channel)) => channel,
        Ok(None) => return,
        Err(_) => {
            debug!("Live viewer did not subscribe within {:?}", timeout);
            let message = ServerMessage::Error {
                message: "subscribe timed out".to_string(),
            };
            send(&mut sender, &message, timeout).await;
            return;
        }
    };

    let mut subscription = match bus.subscribe(&channel).await {
        Ok(subscription) => subscription,
        Err(e) => {
            warn!("Unable to subscribe to {}: {}", channel, e);
            let message = ServerMessage::Error {
                message: format!("unable to subscribe: {}", e),
            };
            send(&mut sender, &message, timeout).await;
            return;
        }
    };

    if !send(&mut sender, &ServerMessage::Joined { channel: channel.clone() }, timeout).await {
        return;
    }
    info!("Live viewer joined {}", channel);

    loop {
        tokio::select! {
            message = subscription.recv() => {
                let Some(message) = message else {
                    break;
                };
                if !send(&mut sender, &ServerMessage::from_bus(message), timeout).await {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }

    debug!("Live viewer left {}", channel);
}
