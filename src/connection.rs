//! Connection manager
//!
//! Owns the radio, the broker client and the connection state. The bridge
//! only talks to the network through this.

use log::{debug, info, warn};

use crate::broker::{self, Topics, TransportPolicy};
use crate::platform::{BrokerClient, Clock, InboundMessage, WifiRadio};
use crate::settings::SettingsRecord;
use crate::state_machine::ConnectionState;
use crate::status::Progress;
use crate::{BridgeError, config, wifi};

pub struct ConnectionManager<R, B> {
    radio: R,
    broker: B,
    policy: TransportPolicy,
    state: ConnectionState,
    topics: Option<Topics>,
}

impl<R: WifiRadio, B: BrokerClient> ConnectionManager<R, B> {
    pub fn new(radio: R, broker: B, policy: TransportPolicy) -> Self {
        Self {
            radio,
            broker,
            policy,
            state: ConnectionState::new(config::WIFI_TRY_LIMIT),
            topics: None,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn is_live(&self) -> bool {
        self.state.is_live()
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    #[cfg(test)]
    pub(crate) fn broker_mut(&mut self) -> &mut B {
        &mut self.broker
    }

    /// Join WiFi, then open the broker session.
    pub async fn attach<C, F>(
        &mut self,
        clock: &C,
        record: &SettingsRecord,
        report: &mut F,
    ) -> Result<(), BridgeError>
    where
        C: Clock,
        F: FnMut(Progress<'_>),
    {
        self.attach_wireless(clock, record, report).await?;
        self.attach_broker(record, report).await
    }

    pub async fn attach_wireless<C, F>(
        &mut self,
        clock: &C,
        record: &SettingsRecord,
        report: &mut F,
    ) -> Result<usize, BridgeError>
    where
        C: Clock,
        F: FnMut(Progress<'_>),
    {
        self.topics = None;
        wifi::attach_wireless(&mut self.radio, clock, &mut self.state, record, report).await
    }

    pub async fn attach_broker<F>(
        &mut self,
        record: &SettingsRecord,
        report: &mut F,
    ) -> Result<(), BridgeError>
    where
        F: FnMut(Progress<'_>),
    {
        let topics =
            broker::attach_broker(&mut self.broker, &mut self.state, record, &self.policy, report)
                .await?;
        self.topics = Some(topics);
        Ok(())
    }

    /// Re-open the broker session if it dropped while live.
    ///
    /// WiFi is never re-joined from here.
    pub async fn ensure_live<F>(
        &mut self,
        record: &SettingsRecord,
        report: &mut F,
    ) -> Result<(), BridgeError>
    where
        F: FnMut(Progress<'_>),
    {
        if !self.state.is_live() || self.broker.is_connected() {
            return Ok(());
        }

        warn!("[MQTT] Broker session lost, reconnecting");
        self.attach_broker(record, report).await
    }

    /// Publish one line from the robot to the outbound topic.
    pub async fn publish_line(&mut self, line: &[u8]) -> Result<(), BridgeError> {
        let Some(topics) = self.topics.as_ref() else {
            return Err(BridgeError::BrokerAttachFailed);
        };
        if !self.broker.is_connected() {
            return Err(BridgeError::BrokerAttachFailed);
        }

        self.broker
            .publish(topics.publish(), line)
            .await
            .map_err(|e| {
                warn!("[MQTT] Publish failed: {:?}", e);
                BridgeError::BrokerAttachFailed
            })?;
        debug!("[MQTT] Published {} bytes", line.len());
        Ok(())
    }

    /// Next message from the broker, if one is waiting.
    pub async fn poll_inbound(&mut self) -> Option<InboundMessage> {
        if !self.broker.is_connected() {
            return None;
        }

        match self.broker.poll().await {
            Ok(Some(message)) => {
                info!("[MQTT] Inbound message ({} bytes)", message.payload.len());
                Some(message)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("[MQTT] Poll failed: {:?}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{block_on, MockBroker, MockClock, MockRadio};
    use std::vec::Vec;

    fn record() -> SettingsRecord {
        let mut record = SettingsRecord::default();
        record.wifi_candidates[0].name.push_str("Home").unwrap();
        record.wifi_candidates[0].password.push_str("pw").unwrap();
        record.device_name.push_str("robot1").unwrap();
        record.broker_endpoint.push_str("broker.local").unwrap();
        record
    }

    fn manager() -> ConnectionManager<MockRadio, MockBroker> {
        ConnectionManager::new(
            MockRadio::new().accept("Home", "pw"),
            MockBroker::new(),
            TransportPolicy::default(),
        )
    }

    fn attach(manager: &mut ConnectionManager<MockRadio, MockBroker>, record: &SettingsRecord) {
        let clock = MockClock::new();
        block_on(manager.attach(&clock, record, &mut |_| {})).unwrap();
    }

    #[test]
    fn test_attach_goes_live() {
        let mut manager = manager();
        attach(&mut manager, &record());

        assert!(manager.is_live());
        assert_eq!(manager.broker().sessions.len(), 1);
    }

    #[test]
    fn test_wifi_failure_skips_broker() {
        let mut manager = ConnectionManager::new(
            MockRadio::new(),
            MockBroker::new(),
            TransportPolicy::default(),
        );
        let clock = MockClock::new();

        let result = block_on(manager.attach(&clock, &record(), &mut |_| {}));

        assert_eq!(result, Err(BridgeError::NoNetworksFound));
        assert!(manager.broker().sessions.is_empty());
        assert!(!manager.is_live());
    }

    #[test]
    fn test_ensure_live_reconnects_dropped_session() {
        let mut manager = manager();
        let record = record();
        attach(&mut manager, &record);

        // Healthy session: nothing to do
        block_on(manager.ensure_live(&record, &mut |_| {})).unwrap();
        assert_eq!(manager.broker().sessions.len(), 1);

        manager.broker_mut().connected = false;
        let mut seen = Vec::new();
        block_on(manager.ensure_live(&record, &mut |p: Progress<'_>| {
            if let Progress::Status(s) = p {
                seen.push(s.code());
            }
        }))
        .unwrap();

        assert_eq!(manager.broker().sessions.len(), 2);
        assert_eq!(seen, vec![8]);
        // WiFi was left alone
        assert_eq!(manager.radio_mut().begins.len(), 1);
    }

    #[test]
    fn test_failed_reconnect_stays_live() {
        let mut manager = manager();
        let record = record();
        attach(&mut manager, &record);

        manager.broker_mut().connected = false;
        manager.broker_mut().refuse = true;
        let result = block_on(manager.ensure_live(&record, &mut |_| {}));

        assert_eq!(result, Err(BridgeError::BrokerAttachFailed));
        assert!(manager.is_live());

        // Next loop iteration tries again
        manager.broker_mut().refuse = false;
        block_on(manager.ensure_live(&record, &mut |_| {})).unwrap();
        assert_eq!(manager.broker().sessions.len(), 3);
    }

    #[test]
    fn test_ensure_live_is_noop_when_not_live() {
        let mut manager = manager();
        block_on(manager.ensure_live(&record(), &mut |_| {})).unwrap();
        assert!(manager.broker().sessions.is_empty());
    }

    #[test]
    fn test_publish_line_uses_outbound_topic() {
        let mut manager = manager();
        attach(&mut manager, &record());

        block_on(manager.publish_line(b"*MF100")).unwrap();

        let (topic, payload) = manager.broker().published.last().unwrap();
        assert_eq!(topic, "devices/robot1/messages/events/");
        assert_eq!(payload, b"*MF100");
    }

    #[test]
    fn test_publish_before_attach_fails() {
        let mut manager = manager();
        assert_eq!(
            block_on(manager.publish_line(b"x")),
            Err(BridgeError::BrokerAttachFailed)
        );
    }

    #[test]
    fn test_poll_inbound() {
        let mut manager = manager();
        attach(&mut manager, &record());
        manager
            .broker_mut()
            .deliver(b"FORWARD");

        let message = block_on(manager.poll_inbound()).unwrap();
        assert_eq!(&message.payload[..], b"FORWARD");
        assert!(block_on(manager.poll_inbound()).is_none());
    }
}
