//! Live tail client: follows build output through the API's WebSocket relay

use std::future::Future;
use std::pin::Pin;

use colored::Colorize;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, info};
use url::Url;

use crate::errors::PlatformError;
use crate::models::log_event::{LogEvent, LogSource};
use crate::server::live::{ClientMessage, ServerMessage};

/// WebSocket URL of the live relay behind an API base URL
pub fn relay_url(api_base: &str) -> Result<Url, PlatformError> {
    let mut url = Url::parse(api_base)
        .map_err(|e| PlatformError::ConfigError(format!("invalid API url {}: {}", api_base, e)))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(PlatformError::ConfigError(format!(
                "unsupported API scheme: {}",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| PlatformError::ConfigError(format!("cannot use {} for {}", scheme, api_base)))?;
    url.set_path("/logs/ws");
    Ok(url)
}

/// Format one relay message for the terminal
pub fn render(message: &ServerMessage) -> String {
    match message {
        ServerMessage::Joined { channel } => format!("{} {}", "joined".green(), channel),
        ServerMessage::Error { message } => format!("{} {}", "error:".red().bold(), message),
        ServerMessage::Log { channel, event } => {
            match serde_json::from_value::<LogEvent>(event.clone()) {
                Ok(event) => {
                    let prefix = format!("[{}]", short_id(&event.deployment_id.to_string())).dimmed();
                    match event.source {
                        LogSource::Stderr => format!("{} {}", prefix, event.text.red()),
                        LogSource::System => format!("{} {}", prefix, event.text.cyan()),
                        LogSource::Stdout => format!("{} {}", prefix, event.text),
                    }
                }
                Err(_) => format!("[{}] {}", channel, event),
            }
        }
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

/// Subscribe to `pattern` and print events until the relay closes or shutdown
pub async fn run(
    api_base: &str,
    pattern: &str,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) -> Result<(), PlatformError> {
    let url = relay_url(api_base)?;
    info!("Connecting to live relay: {}", url);

    let (mut ws_stream, _) = connect_async(url.as_str())
        .await
        .map_err(|e| PlatformError::TransportError(format!("{}: {}", url, e)))?;

    let subscribe = serde_json::to_string(&ClientMessage::Subscribe {
        channel: pattern.to_string(),
    })?;
    ws_stream
        .send(Message::Text(subscribe.into()))
        .await
        .map_err(|e| PlatformError::TransportError(e.to_string()))?;

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                let _ = ws_stream.close(None).await;
                return Ok(());
            }
            msg = ws_stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerMessage>(text.as_str()) {
                            Ok(message) => println!("{}", render(&message)),
                            Err(e) => debug!("Ignoring relay message: {}", e),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Live relay closed the connection");
                        return Ok(());
                    }
                    Some(Err(e)) => return Err(PlatformError::TransportError(e.to_string())),
                    _ => {}
                }
            }
        }
    }
}
