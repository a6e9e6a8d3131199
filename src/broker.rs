//! Broker session setup
//!
//! Derives the topics from the device name, picks the transport for the
//! endpoint and opens the session: connect, announce, subscribe.

use core::fmt::Write;

use heapless::String;
use log::{info, warn};

use crate::platform::{BrokerClient, SessionParams, Transport};
use crate::settings::{DEVICE_NAME_LEN, SettingsRecord};
use crate::state_machine::{ConnectionEvent, ConnectionState};
use crate::status::{Progress, SessionInfo, Status};
use crate::{BridgeError, config};

/// Room for the longest device name plus prefix and suffix
pub const TOPIC_CAPACITY: usize = DEVICE_NAME_LEN + 48;

const _: () = assert!(
    TOPIC_CAPACITY >= DEVICE_NAME_LEN + config::TOPIC_PREFIX.len() + config::PUBLISH_SUFFIX.len()
        && TOPIC_CAPACITY
            >= DEVICE_NAME_LEN + config::TOPIC_PREFIX.len() + config::SUBSCRIBE_SUFFIX.len()
);

/// How the broker transport is chosen from the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportPolicy {
    /// Secure if the endpoint contains the marker, plain otherwise
    ProviderMarker(&'static str),
    AlwaysSecure,
    AlwaysPlain,
}

impl Default for TransportPolicy {
    fn default() -> Self {
        TransportPolicy::ProviderMarker(config::SECURE_PROVIDER_MARKER)
    }
}

impl TransportPolicy {
    /// Transport and port to use for `endpoint`.
    pub fn select(&self, endpoint: &str) -> (Transport, u16) {
        let secure = match self {
            TransportPolicy::ProviderMarker(marker) => endpoint.contains(marker),
            TransportPolicy::AlwaysSecure => true,
            TransportPolicy::AlwaysPlain => false,
        };

        if secure {
            (Transport::Secure, config::MQTT_SECURE_PORT)
        } else {
            (Transport::Plain, config::MQTT_PORT)
        }
    }
}

/// Outbound and inbound topics of one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    publish: String<TOPIC_CAPACITY>,
    subscribe: String<TOPIC_CAPACITY>,
}

impl Topics {
    pub fn for_device(device_name: &str) -> Self {
        let mut publish = String::new();
        let mut subscribe = String::new();
        let written = write!(
            publish,
            "{}{}{}",
            config::TOPIC_PREFIX,
            device_name,
            config::PUBLISH_SUFFIX
        )
        .and_then(|()| {
            write!(
                subscribe,
                "{}{}{}",
                config::TOPIC_PREFIX,
                device_name,
                config::SUBSCRIBE_SUFFIX
            )
        });
        // Holds for any name that fits a settings record
        debug_assert!(written.is_ok(), "topic overflow for '{}'", device_name);
        Self { publish, subscribe }
    }

    pub fn publish(&self) -> &str {
        &self.publish
    }

    pub fn subscribe(&self) -> &str {
        &self.subscribe
    }
}

/// Open a broker session for the configured device.
///
/// On success the device name has been published to the outbound topic and
/// the inbound topic is subscribed.
pub async fn attach_broker<B, F>(
    broker: &mut B,
    state: &mut ConnectionState,
    record: &SettingsRecord,
    policy: &TransportPolicy,
    report: &mut F,
) -> Result<Topics, BridgeError>
where
    B: BrokerClient,
    F: FnMut(Progress<'_>),
{
    state.handle_event(ConnectionEvent::BrokerAttachStarted);

    let topics = Topics::for_device(&record.device_name);
    let (transport, port) = policy.select(&record.broker_endpoint);

    report(Progress::Session(SessionInfo {
        endpoint: &record.broker_endpoint,
        publish_topic: topics.publish(),
        subscribe_topic: topics.subscribe(),
    }));

    let params = SessionParams {
        host: &record.broker_endpoint,
        port,
        transport,
        client_id: &record.device_name,
        username: &record.broker_username,
        password: &record.broker_secret,
    };

    info!(
        "[MQTT] Connecting to {}:{} ({:?}) as '{}'",
        params.host, params.port, params.transport, params.client_id
    );

    if let Err(e) = open_session(broker, &params, &topics).await {
        warn!("[MQTT] Broker attach failed: {:?}", e);
        state.handle_event(ConnectionEvent::BrokerConnectFailed);
        report(Progress::Status(Status::BrokerConnectFailed));
        return Err(BridgeError::BrokerAttachFailed);
    }

    info!("[MQTT] Session open, subscribed to {}", topics.subscribe());
    state.handle_event(ConnectionEvent::BrokerConnected);
    report(Progress::Status(Status::BrokerConnected));
    Ok(topics)
}

async fn open_session<B: BrokerClient>(
    broker: &mut B,
    params: &SessionParams<'_>,
    topics: &Topics,
) -> Result<(), B::Error> {
    broker.connect(params).await?;
    broker
        .publish(topics.publish(), params.client_id.as_bytes())
        .await?;
    broker.subscribe(topics.subscribe()).await
}
