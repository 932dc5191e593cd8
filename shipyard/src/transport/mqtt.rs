//! MQTT implementation of the live log bus

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::PlatformError;
use crate::transport::live::{BusMessage, PubSubBus, Subscription};

/// MQTT broker address
#[derive(Debug, Clone)]
pub struct MqttAddress {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    /// Optional path to a PEM-encoded CA certificate for broker verification.
    /// When `None` and `use_tls` is `true`, the system certificate store is used.
    pub ca_cert_path: Option<String>,
    pub username: Option<String>,
    pub password: Option<SecretString>,
}

impl Default for MqttAddress {
    fn default() -> Self {
        Self {
            host: "".to_string(),
            port: 8883,
            use_tls: true,
            ca_cert_path: None,
            username: None,
            password: None,
        }
    }
}

impl MqttAddress {
    pub fn is_configured(&self) -> bool {
        !self.host.is_empty()
    }
}

/// Local subscribers per broker subscription.
///
/// The broker call is made under the lock so a subscribe and an unsubscribe
/// for the same pattern reach the request queue in the order they were counted.
#[derive(Default)]
struct PatternRefs {
    counts: std::sync::Mutex<HashMap<String, usize>>,
}

impl PatternRefs {
    fn acquire<F>(&self, pattern: &str, subscribe: F) -> Result<(), PlatformError>
    where
        F: FnOnce() -> Result<(), PlatformError>,
    {
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        if !counts.contains_key(pattern) {
            subscribe()?;
        }
        *counts.entry(pattern.to_string()).or_insert(0) += 1;
        Ok(())
    }

    fn release<F: FnOnce()>(&self, pattern: &str, unsubscribe: F) {
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        let Some(count) = counts.get_mut(pattern) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            counts.remove(pattern);
            unsubscribe();
        }
    }
}

/// Pub/sub bus on an MQTT broker.
///
/// A background task drives the event loop and fans incoming publishes out
/// to local subscriptions, which apply their own pattern filter.
pub struct MqttBus {
    client: AsyncClient,
    fanout: broadcast::Sender<BusMessage>,
    patterns: Arc<PatternRefs>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl MqttBus {
    /// Connect to the broker
    pub async fn connect(address: &MqttAddress, client_id: &str) -> Result<Self, PlatformError> {
        if !address.is_configured() {
            return Err(PlatformError::ConfigError("MQTT host is not configured".to_string()));
        }

        let mut options = MqttOptions::new(client_id, &address.host, address.port);
        options.set_keep_alive(Duration::from_secs(30));
        if let (Some(username), Some(password)) = (&address.username, &address.password) {
            options.set_credentials(username, password.expose_secret());
        }

        if address.use_tls {
            use rumqttc::{TlsConfiguration, Transport};
            use rustls::ClientConfig;

            let mut root_cert_store = rustls::RootCertStore::empty();

            if let Some(ref ca_path) = address.ca_cert_path {
                let ca_pem = std::fs::read(ca_path).map_err(|e| {
                    PlatformError::ConfigError(format!("Failed to read CA cert {ca_path}: {e}"))
                })?;
                let mut cursor = std::io::Cursor::new(ca_pem);
                for cert in rustls_pemfile::certs(&mut cursor).flatten() {
                    let _ = root_cert_store.add(cert);
                }
            } else {
                for cert in rustls_native_certs::load_native_certs().unwrap_or_default() {
                    let _ = root_cert_store.add(cert);
                }
            }

            let client_config = ClientConfig::builder()
                .with_root_certificates(root_cert_store)
                .with_no_client_auth();

            options.set_transport(Transport::tls_with_config(TlsConfiguration::Rustls(
                Arc::new(client_config),
            )));
        }

        let (client, event_loop) = AsyncClient::new(options, 64);
        let (fanout, _) = broadcast::channel(1024);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(drive_event_loop(event_loop, fanout.clone(), cancel.clone()));
        info!("MQTT bus connecting to {}:{}", address.host, address.port);

        Ok(Self {
            client,
            fanout,
            patterns: Arc::new(PatternRefs::default()),
            event_loop: Mutex::new(Some(handle)),
            cancel,
        })
    }
}

async fn drive_event_loop(
    mut event_loop: EventLoop,
    fanout: broadcast::Sender<BusMessage>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            event = event_loop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = BusMessage {
                    channel: publish.topic.clone(),
                    payload: String::from_utf8_lossy(&publish.payload).to_string(),
                };
                let _ = fanout.send(message);
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("MQTT connected");
            }
            Ok(Event::Incoming(Packet::SubAck(_))) => {
                debug!("Subscription acknowledged");
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                info!("MQTT disconnected");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                // The next poll reconnects
                warn!("MQTT poll error: {}", e);
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
            }
        }
    }
}

#[async_trait]
impl PubSubBus for MqttBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), PlatformError> {
        // Never wait for room in the request queue: with the broker down the
        // event loop stops draining it and the message is dropped instead.
        self.client
            .try_publish(channel, QoS::AtMostOnce, false, payload.as_bytes().to_vec())
            .map_err(|e| PlatformError::TransportError(format!("live event dropped: {}", e)))
    }

    async fn subscribe(&self, pattern: &str) -> Result<Subscription, PlatformError> {
        // Take the local receiver first so nothing published after the
        // broker acknowledges the subscription is missed.
        let rx = self.fanout.subscribe();
        self.patterns.acquire(pattern, || {
            self.client
                .try_subscribe(pattern, QoS::AtMostOnce)
                .map_err(|e| PlatformError::TransportError(e.to_string()))?;
            info!("Subscribed to: {}", pattern);
            Ok(())
        })?;

        // The broker subscription lives as long as its last local subscriber
        let client = self.client.clone();
        let patterns = self.patterns.clone();
        let owned = pattern.to_string();
        Ok(Subscription::new(pattern, rx).with_release(move || {
            patterns.release(&owned, || match client.try_unsubscribe(owned.as_str()) {
                Ok(()) => debug!("Unsubscribed from: {}", owned),
                Err(e) => warn!("Unable to unsubscribe from {}: {}", owned, e),
            });
        }))
    }

    async fn close(&self) -> Result<(), PlatformError> {
        let handle = self.event_loop.lock().await.take();
        let Some(handle) = handle else {
            return Ok(());
        };

        if let Err(e) = self.client.try_disconnect() {
            warn!("MQTT disconnect failed: {}", e);
            self.cancel.cancel();
        }

        // Give the event loop a bounded window to flush queued publishes
        if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
            warn!("MQTT event loop did not stop in time");
            self.cancel.cancel();
        }
        Ok(())
    }
}
