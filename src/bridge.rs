//! Network bridge
//!
//! Ties the serial link, settings, status display and connection manager
//! together: startup (discovery, settings, attach) and the steady-state loop.

use log::{info, warn};

use crate::connection::ConnectionManager;
use crate::discovery::{self, Mode};
use crate::link::SerialLink;
use crate::platform::{
    BrokerClient, Clock, OutputPin, ReadStorage, SerialRead, SerialReadReady, SerialWrite,
    Storage, WifiRadio,
};
use crate::protocol::{Command, Dispatch, ProtocolEngine};
use crate::settings::ConfigStore;
use crate::status::{ConsoleReporter, Progress, Reporter, RobotReporter};
use crate::{BridgeError, VERSION, config};

pub struct NetworkBridge<S, P, C, E, R, B> {
    link: SerialLink<S, P>,
    clock: C,
    store: ConfigStore<E>,
    connection: ConnectionManager<R, B>,
    engine: ProtocolEngine,
    reporter: Reporter,
    chip_id: u32,
}

impl<S, P, C, E, R, B> NetworkBridge<S, P, C, E, R, B>
where
    S: SerialRead + SerialWrite + SerialReadReady,
    P: OutputPin,
    C: Clock,
    E: ReadStorage + Storage,
    E::Error: core::fmt::Debug,
    R: WifiRadio,
    B: BrokerClient,
{
    /// The bridge starts in administration mode until [`NetworkBridge::start`]
    /// has probed for a robot.
    pub fn new(
        link: SerialLink<S, P>,
        clock: C,
        store: ConfigStore<E>,
        connection: ConnectionManager<R, B>,
        chip_id: u32,
    ) -> Self {
        Self {
            link,
            clock,
            store,
            connection,
            engine: ProtocolEngine::new(Mode::Administration),
            reporter: Reporter::Console(ConsoleReporter::new()),
            chip_id,
        }
    }

    pub fn mode(&self) -> Mode {
        self.engine.mode()
    }

    pub fn link(&self) -> &SerialLink<S, P> {
        &self.link
    }

    pub fn connection(&self) -> &ConnectionManager<R, B> {
        &self.connection
    }

    #[cfg(test)]
    pub(crate) fn link_mut(&mut self) -> &mut SerialLink<S, P> {
        &mut self.link
    }

    #[cfg(test)]
    pub(crate) fn connection_mut(&mut self) -> &mut ConnectionManager<R, B> {
        &mut self.connection
    }

    #[cfg(test)]
    pub(crate) fn store(&self) -> &ConfigStore<E> {
        &self.store
    }

    /// Probe for a robot, load settings and, with a robot, go online.
    ///
    /// Ends with flash code 1 when a robot was found, 2 otherwise.
    pub async fn start(&mut self) -> Mode {
        info!("[MAIN] Network client {} starting", VERSION);

        let mode = discovery::find_robot(&mut self.link, &self.clock).await;

        if let Err(e) = self.store.load() {
            warn!("[CONFIG] Using empty settings: {:?}", e);
        }

        self.engine = ProtocolEngine::new(mode);
        self.reporter = match mode {
            Mode::Bridging => Reporter::Robot(RobotReporter::new()),
            Mode::Administration => Reporter::Console(ConsoleReporter::new()),
        };
        info!("[MAIN] Serial line in {:?} mode", mode);

        let code = match mode {
            Mode::Bridging => {
                if let Err(e) = self.connect_to_network().await {
                    warn!("[MAIN] Initial attach failed: {:?}", e);
                }
                1
            }
            Mode::Administration => 2,
        };
        self.link.indicator_mut().flash_code(&self.clock, code).await;
        mode
    }

    /// Join WiFi and the broker with the stored settings.
    pub async fn connect_to_network(&mut self) -> Result<(), BridgeError> {
        let Self {
            link,
            clock,
            store,
            connection,
            reporter,
            ..
        } = self;
        let clock: &C = clock;
        let mut report = |progress: Progress<'_>| {
            if let Err(e) = reporter.show(link, clock.now_ms(), progress) {
                warn!("[STATE] Status display failed: {:?}", e);
            }
        };
        connection.attach(clock, store.record(), &mut report).await
    }

    /// One pass of the main loop: handle serial input, keep the broker
    /// session up and relay at most one inbound message.
    pub async fn poll(&mut self) -> Result<(), BridgeError> {
        while let Some(byte) = self.link.read_byte()? {
            let command = match self.engine.feed(byte) {
                None => continue,
                Some(Dispatch::Publish(line)) => {
                    if let Err(e) = self.connection.publish_line(line).await {
                        warn!("[SERIAL] Line not published: {:?}", e);
                    }
                    continue;
                }
                Some(Dispatch::Command(command)) => command,
            };
            self.execute(command).await?;
        }

        self.ensure_live().await;

        if let Some(message) = self.connection.poll_inbound().await {
            self.link.write_framed(&message.payload)?;
        }
        Ok(())
    }

    /// Run forever.
    pub async fn run(&mut self) -> ! {
        self.start().await;
        loop {
            if let Err(e) = self.poll().await {
                warn!("[MAIN] Loop error: {:?}", e);
            }
            self.clock.delay_ms(config::LOOP_IDLE_MS).await;
        }
    }

    async fn ensure_live(&mut self) {
        let Self {
            link,
            clock,
            store,
            connection,
            reporter,
            ..
        } = self;
        let clock: &C = clock;
        let mut report = |progress: Progress<'_>| {
            if let Err(e) = reporter.show(link, clock.now_ms(), progress) {
                warn!("[STATE] Status display failed: {:?}", e);
            }
        };
        if let Err(e) = connection.ensure_live(store.record(), &mut report).await {
            warn!("[MQTT] Reconnect failed: {:?}", e);
        }
    }

    async fn execute(&mut self, command: Command) -> Result<(), BridgeError> {
        info!("[SERIAL] Command {:?}", command);
        match command {
            Command::Version => self
                .link
                .print_line(format_args!("Network Client Version {}", VERSION)),
            Command::ChipId => self.link.print_line(format_args!("{:x}", self.chip_id)),
            Command::ExportSettings => self.store.export_to_serial(&mut self.link),
            Command::DemoSettings => self.store.load_demo(),
            Command::ImportSettings => {
                match self
                    .store
                    .import_from_serial(&mut self.link, &self.clock, config::RESPONSE_TIMEOUT_MS)
                    .await
                {
                    Ok(()) => self.store.persist(),
                    Err(e) => {
                        warn!("[CONFIG] Settings upload failed: {:?}", e);
                        self.link.print_line(format_args!("download failed"))
                    }
                }
            }
            Command::ListAccessPoints => self.list_access_points().await,
            Command::Connect => {
                if let Err(e) = self.connect_to_network().await {
                    warn!("[MAIN] Attach failed: {:?}", e);
                }
                Ok(())
            }
        }
    }

    async fn list_access_points(&mut self) -> Result<(), BridgeError> {
        self.link.print_line(format_args!("Listing access points"))?;

        let networks = match self.connection.radio_mut().scan().await {
            Ok(networks) => networks,
            Err(e) => {
                warn!("[WIFI] Scan failed: {:?}", e);
                heapless::Vec::new()
            }
        };

        self.link
            .print_line(format_args!("{} network(s) found", networks.len()))?;
        for (i, ap) in networks.iter().enumerate() {
            self.link.print_line(format_args!(
                "{}: {}, Ch:{} ({}dBm) {}",
                i + 1,
                ap.ssid,
                ap.channel,
                ap.rssi,
                if ap.open { "open" } else { "" }
            ))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::TransportPolicy;
    use crate::mock::{
        access_point, block_on, test_link, MockBroker, MockClock, MockPin, MockRadio, MockSerial,
        MockStorage,
    };
    use crate::settings::{SettingsRecord, REDACTED};

    type TestBridge =
        NetworkBridge<MockSerial, MockPin, MockClock, MockStorage, MockRadio, MockBroker>;

    const BANNER: &[u8] = b"HullOS R3.1\r\n";

    fn bridge_with(storage: MockStorage, radio: MockRadio) -> TestBridge {
        NetworkBridge::new(
            test_link(),
            MockClock::new(),
            ConfigStore::new(storage, config::SETTINGS_FLASH_OFFSET),
            ConnectionManager::new(radio, MockBroker::new(), TransportPolicy::default()),
            0x00C0FFEE,
        )
    }

    /// Storage holding settings for network "Home" and device "robot1"
    fn configured_storage() -> MockStorage {
        let mut record = SettingsRecord::default();
        record.wifi_candidates[0].name.push_str("Home").unwrap();
        record.wifi_candidates[0].password.push_str("pw").unwrap();
        record.device_name.push_str("robot1").unwrap();
        record.broker_endpoint.push_str("broker.local").unwrap();

        let mut storage = MockStorage::new();
        let offset = config::SETTINGS_FLASH_OFFSET as usize;
        let encoded = record.encode();
        storage.data[offset..offset + encoded.len()].copy_from_slice(&encoded);
        storage
    }

    fn online_bridge() -> TestBridge {
        let mut bridge = bridge_with(configured_storage(), MockRadio::new().accept("Home", "pw"));
        bridge.link_mut().serial_mut().respond_to(b"*IV", BANNER);
        assert_eq!(block_on(bridge.start()), Mode::Bridging);
        bridge.link_mut().serial_mut().take_tx();
        bridge
    }

    fn admin_bridge() -> TestBridge {
        let mut bridge = bridge_with(MockStorage::new(), MockRadio::new());
        assert_eq!(block_on(bridge.start()), Mode::Administration);
        bridge.link_mut().serial_mut().take_tx();
        bridge
    }

    fn send(bridge: &mut TestBridge, bytes: &[u8]) -> std::string::String {
        bridge.link_mut().serial_mut().push_rx(bytes);
        block_on(bridge.poll()).unwrap();
        let tx = bridge.link_mut().serial_mut().take_tx();
        std::string::String::from_utf8(tx).unwrap()
    }

    #[test]
    fn test_robot_start_goes_online_with_colors() {
        let mut bridge = bridge_with(configured_storage(), MockRadio::new().accept("Home", "pw"));
        bridge.link_mut().serial_mut().respond_to(b"*IV", BANNER);

        block_on(bridge.start());

        assert!(bridge.connection().is_live());
        let tx = bridge.link_mut().serial_mut().tx_text();
        assert!(tx.contains("\rBLUE\r\n"));
        assert!(tx.contains("\rWHITE\r\n"));
        assert!(tx.ends_with("\rGREEN\r\n"));
        assert!(!tx.contains("Endpoint:"));
    }

    #[test]
    fn test_bridging_publishes_robot_lines() {
        let mut bridge = online_bridge();

        let echoed = send(&mut bridge, b"*MF100\r\n\r\n");

        assert!(echoed.is_empty());
        let published = &bridge.connection().broker().published;
        // Device announcement, then the robot line
        assert_eq!(published.len(), 2);
        assert_eq!(published[1].0, "devices/robot1/messages/events/");
        assert_eq!(published[1].1, b"*MF100");
    }

    #[test]
    fn test_bridging_relays_inbound_messages() {
        let mut bridge = online_bridge();
        bridge
            .connection_mut()
            .broker_mut()
            .deliver(b"*RR");
        let before = bridge.link().indicator().is_lit();

        let written = send(&mut bridge, b"");

        assert_eq!(written, "\r*RR\r");
        assert_ne!(bridge.link().indicator().is_lit(), before);
    }

    #[test]
    fn test_bridging_reconnects_dropped_broker() {
        let mut bridge = online_bridge();
        bridge.connection_mut().broker_mut().connected = false;

        let written = send(&mut bridge, b"");

        assert_eq!(bridge.connection().broker().sessions.len(), 2);
        // Same status as before, inside the heartbeat window
        assert!(written.is_empty() || written == "\rBLACK\r\n" || written == "\rGREEN\r\n");
    }

    #[test]
    fn test_robot_commands_are_not_interpreted_in_bridging() {
        let mut bridge = online_bridge();
        let echoed = send(&mut bridge, b"*IV\r");
        assert!(echoed.is_empty());
        assert_eq!(bridge.connection().broker().published[1].1, b"*IV");
    }

    #[test]
    fn test_admin_start_resets_blank_storage() {
        let bridge = admin_bridge();
        assert_eq!(bridge.store().record(), &SettingsRecord::default());
        assert_eq!(bridge.store().storage().writes, 1);
        assert_eq!(bridge.mode(), Mode::Administration);
    }

    #[test]
    fn test_admin_version_and_chip_id() {
        let mut bridge = admin_bridge();

        let out = send(&mut bridge, b"*IV\r\n*NI\r\n");

        assert_eq!(
            out,
            std::format!("Network Client Version {}\r\nc0ffee\r\n", VERSION)
        );
    }

    #[test]
    fn test_admin_unknown_lines_are_ignored() {
        let mut bridge = admin_bridge();
        assert!(send(&mut bridge, b"hello\r*XX\r\r").is_empty());
    }

    #[test]
    fn test_admin_demo_then_export() {
        let mut bridge = admin_bridge();

        send(&mut bridge, b"*ND\r");
        let out = send(&mut bridge, b"*NR\r");

        assert!(out.starts_with(&std::format!("Put\r\n{}\r\nDefault\r\n", REDACTED)));
        assert!(out.ends_with(&std::format!("Quick\r\nDeployment\r\nTo\r\n{}\r\n", REDACTED)));
        assert_eq!(bridge.store().storage().writes, 2);
    }

    #[test]
    fn test_admin_import_persists() {
        let mut bridge = admin_bridge();
        let mut upload = std::vec::Vec::new();
        upload.extend_from_slice(b"*NS\r\n");
        upload.extend_from_slice(b"Home\r\npw\r\n");
        for _ in 0..4 {
            upload.extend_from_slice(b"\r\n\r\n");
        }
        upload.extend_from_slice(b"robot1\r\nuser\r\nbroker.local\r\nkey\r\n");

        let out = send(&mut bridge, &upload);

        assert!(out.is_empty());
        assert_eq!(bridge.store().record().device_name, "robot1");
        assert_eq!(bridge.store().storage().writes, 2);
    }

    #[test]
    fn test_admin_import_timeout_reports_failure() {
        let mut bridge = admin_bridge();

        let out = send(&mut bridge, b"*NS\r\nHome\r\n");

        assert_eq!(out, "download failed\r\n");
        assert_eq!(bridge.store().record(), &SettingsRecord::default());
        assert_eq!(bridge.store().storage().writes, 1);
    }

    #[test]
    fn test_admin_list_access_points() {
        let radio = MockRadio::new()
            .visible(access_point("Home", 6, -52, false))
            .visible(access_point("Cafe", 11, -80, true));
        let mut bridge = bridge_with(MockStorage::new(), radio);
        block_on(bridge.start());
        bridge.link_mut().serial_mut().take_tx();

        let out = send(&mut bridge, b"*NA\r");

        assert_eq!(
            out,
            "Listing access points\r\n\
             2 network(s) found\r\n\
             1: Home, Ch:6 (-52dBm) \r\n\
             2: Cafe, Ch:11 (-80dBm) open\r\n"
        );
    }

    #[test]
    fn test_admin_connect_prints_progress() {
        let mut bridge = bridge_with(configured_storage(), MockRadio::new().accept("Home", "pw"));
        block_on(bridge.start());
        bridge.link_mut().serial_mut().take_tx();

        let out = send(&mut bridge, b"*NC\r");

        assert_eq!(
            out,
            "Connecting to wifi\r\n\
             Connected to access point OK\r\n\
             MAC address:A8:D9:B3:0D:AA:CE\r\n\
             Endpoint: broker.local\r\n\
             Publish: devices/robot1/messages/events/\r\n\
             Subscribe: devices/robot1/messages/devicebound/#\r\n\
             MQTT connected OK\r\n"
        );
        assert!(bridge.connection().is_live());
    }

    #[test]
    fn test_admin_connect_without_networks() {
        let mut bridge = admin_bridge();
        let out = send(&mut bridge, b"*NC\r");
        assert_eq!(out, "No wifi access points found\r\n");
        assert!(!bridge.connection().is_live());
    }
}
