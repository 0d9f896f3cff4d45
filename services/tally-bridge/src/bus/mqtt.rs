//! MQTT publisher backed by rumqttc.
//!
//! rumqttc splits the client into a cheap [`AsyncClient`] handle and an
//! [`EventLoop`] that must be polled for anything to reach the broker. The
//! event loop runs on its own task; it also owns reconnection, which rumqttc
//! performs on the next poll after an error.
//!
//! Requests are queued without waiting. While the broker is unreachable the
//! event loop stops draining the queue, so once it is full a publish fails
//! immediately instead of stalling the caller until the broker returns.

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{BusError, Delivery, Publisher};
use crate::supervisor::shutdown_requested;

/// Pause between event loop polls after a connection error.
const RECONNECT_PAUSE: Duration = Duration::from_secs(1);

/// Capacity of the request queue between client handle and event loop.
const REQUEST_CAPACITY: usize = 16;

/// Broker connection settings.
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub credentials: Option<(String, String)>,
    pub keep_alive: Duration,
}

/// Publisher sending aggregate updates to an MQTT broker.
#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
}

impl MqttPublisher {
    /// Create the client and spawn its event loop.
    ///
    /// The returned task runs until a DISCONNECT has been sent (see
    /// [`disconnect`](Self::disconnect)) or `shutdown` flips to `true`.
    pub fn connect(
        settings: &MqttSettings,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let mut options = MqttOptions::new(
            settings.client_id.clone(),
            settings.host.clone(),
            settings.port,
        );
        options.set_keep_alive(settings.keep_alive);
        if let Some((username, password)) = &settings.credentials {
            options.set_credentials(username.clone(), password.clone());
        }

        let (client, event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let broker = format!("{}:{}", settings.host, settings.port);

        info!(
            broker = %broker,
            client_id = %settings.client_id,
            authenticated = settings.credentials.is_some(),
            "Starting MQTT client"
        );

        let handle = tokio::spawn(drive_event_loop(event_loop, broker, shutdown));
        (Self { client }, handle)
    }

    /// Queue a DISCONNECT for the broker.
    pub fn disconnect(&self) {
        if let Err(e) = self.client.try_disconnect() {
            debug!(error = %e, "MQTT disconnect request not queued");
        }
    }
}

fn qos(delivery: Delivery) -> QoS {
    match delivery {
        Delivery::AtMostOnce => QoS::AtMostOnce,
        Delivery::AtLeastOnce => QoS::AtLeastOnce,
        Delivery::ExactlyOnce => QoS::ExactlyOnce,
    }
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn publish(
        &self,
        topic: &str,
        payload: &str,
        delivery: Delivery,
        retain: bool,
    ) -> Result<(), BusError> {
        self.client
            .try_publish(topic, qos(delivery), retain, payload.as_bytes().to_vec())
            .map_err(|e| BusError::Publish(e.to_string()))
    }
}

async fn drive_event_loop(
    mut event_loop: EventLoop,
    broker: String,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_requested(&mut shutdown) => {
                info!(broker = %broker, "MQTT event loop shutting down");
                break;
            }
            event = event_loop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    info!(broker = %broker, code = ?ack.code, "Connected to MQTT broker");
                }
                Ok(Event::Incoming(Packet::PubAck(ack))) => {
                    debug!(pkid = ack.pkid, "Publication acknowledged");
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    info!(broker = %broker, "Disconnected from MQTT broker");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        broker = %broker,
                        error = %e,
                        retry_in_ms = RECONNECT_PAUSE.as_millis() as u64,
                        "MQTT connection error"
                    );
                    tokio::time::sleep(RECONNECT_PAUSE).await;
                }
            }
        }
    }
}
