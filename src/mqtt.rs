//! MQTT session on `rust-mqtt`
//!
//! An [`MqttSession`] is one open broker session over any `embedded-io-async`
//! stream: a plain TCP socket or a TLS connection wrapping one. QoS 0 only.
//! The session borrows its packet buffers, so it lives no longer than the
//! stream it runs on. On the board that scope is the uplink task
//! (`crate::uplink`, firmware builds only).

use embedded_io_async::{Read, Write};
use heapless::Vec;
use log::{debug, info, warn};
use rust_mqtt::client::client::MqttClient;
use rust_mqtt::client::client_config::{ClientConfig, MqttVersion};
use rust_mqtt::packet::v5::publish_packet::QualityOfService;
use rust_mqtt::packet::v5::reason_codes::ReasonCode;
use rust_mqtt::utils::rng_generator::CountingRng;

use crate::config;
use crate::platform::{Clock, InboundMessage, SessionParams};

/// Properties the client may attach to one packet
const MAX_PROPERTIES: usize = 5;

/// Outgoing packet buffer; fits a full serial line plus topic
pub const TX_BUFFER_SIZE: usize = config::INPUT_BUFFER_SIZE + 512;

/// Incoming packet buffer, advertised to the broker as the maximum packet
/// size. Messages that fit here but exceed the relay limit are skipped.
pub const RX_BUFFER_SIZE: usize = 2048;

/// Packet buffers for one session
pub struct SessionBuffers {
    tx: [u8; TX_BUFFER_SIZE],
    rx: [u8; RX_BUFFER_SIZE],
}

impl SessionBuffers {
    pub const fn new() -> Self {
        Self {
            tx: [0; TX_BUFFER_SIZE],
            rx: [0; RX_BUFFER_SIZE],
        }
    }
}

impl Default for SessionBuffers {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether an error means the stream is gone
pub fn is_fatal(code: &ReasonCode) -> bool {
    matches!(code, ReasonCode::NetworkError)
}

pub struct MqttSession<'a, T, C>
where
    T: Read + Write,
{
    client: MqttClient<'a, T, MAX_PROPERTIES, CountingRng>,
    clock: C,
    last_sent_ms: u64,
}

impl<'a, T, C> MqttSession<'a, T, C>
where
    T: Read + Write,
    C: Clock,
{
    /// Send CONNECT on `io` and wait for the broker's CONNACK.
    ///
    /// `seed` starts the packet identifier sequence.
    pub async fn connect(
        io: T,
        buffers: &'a mut SessionBuffers,
        params: &SessionParams<'a>,
        clock: C,
        seed: u64,
    ) -> Result<Self, ReasonCode> {
        let mut client_config = ClientConfig::new(MqttVersion::MQTTv5, CountingRng(seed));
        client_config.add_max_subscribe_qos(QualityOfService::QoS0);
        client_config.add_client_id(params.client_id);
        if !params.username.is_empty() {
            client_config.add_username(params.username);
        }
        if !params.password.is_empty() {
            client_config.add_password(params.password);
        }
        client_config.keep_alive = config::MQTT_KEEP_ALIVE_SECS;
        client_config.max_packet_size = RX_BUFFER_SIZE as u32;
        client_config.add_max_packet_size_as_prop();

        let SessionBuffers { tx, rx } = buffers;
        let mut client = MqttClient::<_, MAX_PROPERTIES, _>::new(
            io,
            tx,
            TX_BUFFER_SIZE,
            rx,
            RX_BUFFER_SIZE,
            client_config,
        );

        client.connect_to_broker().await.map_err(|e| {
            warn!("[MQTT] Connect to {} refused: {:?}", params.host, e);
            e
        })?;
        info!("[MQTT] Connected to {} as {}", params.host, params.client_id);

        let last_sent_ms = clock.now_ms();
        Ok(Self {
            client,
            clock,
            last_sent_ms,
        })
    }

    pub async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), ReasonCode> {
        self.client
            .send_message(topic, payload, QualityOfService::QoS0, false)
            .await?;
        self.last_sent_ms = self.clock.now_ms();
        Ok(())
    }

    /// Subscribe and wait for the SUBACK.
    pub async fn subscribe(&mut self, topic: &str) -> Result<(), ReasonCode> {
        self.client.subscribe_to_topic(topic).await?;
        self.last_sent_ms = self.clock.now_ms();
        info!("[MQTT] Subscribed to {}", topic);
        Ok(())
    }

    /// Read one packet from the stream.
    ///
    /// Only call this when bytes are waiting. Non-message packets and
    /// messages over the relay limit yield `Ok(None)` with the session kept.
    pub async fn receive(&mut self) -> Result<Option<InboundMessage>, ReasonCode> {
        let (topic, payload) = match self.client.receive_message().await {
            Ok(message) => message,
            Err(e) if is_fatal(&e) => return Err(e),
            Err(e) => {
                debug!("[MQTT] Skipped packet: {:?}", e);
                return Ok(None);
            }
        };

        match Vec::from_slice(payload) {
            Ok(payload) => {
                debug!("[MQTT] Message on {} ({} bytes)", topic, payload.len());
                Ok(Some(InboundMessage { payload }))
            }
            Err(()) => {
                warn!(
                    "[MQTT] Dropped {} byte message on {}, limit is {}",
                    payload.len(),
                    topic,
                    config::MAX_INBOUND_PAYLOAD
                );
                Ok(None)
            }
        }
    }

    /// Ping the broker once the session has been idle for the keep-alive
    /// interval.
    pub async fn keep_alive(&mut self) -> Result<(), ReasonCode> {
        let now = self.clock.now_ms();
        if now.saturating_sub(self.last_sent_ms) < config::MQTT_KEEP_ALIVE_SECS as u64 * 1000 {
            return Ok(());
        }
        self.last_sent_ms = now;
        self.client.send_ping().await
    }

    pub async fn disconnect(mut self) {
        if let Err(e) = self.client.disconnect().await {
            debug!("[MQTT] Disconnect: {:?}", e);
        }
    }
}
