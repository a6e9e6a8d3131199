#![cfg_attr(not(test), no_std)]

//! HullOS Network Client Library
//!
//! This library provides the pieces of a WiFi-to-MQTT bridge for a robot
//! controller attached over a serial line. The robot is discovered at boot;
//! if it answers, serial lines are relayed to an MQTT broker and broker
//! messages are written back to the robot. Otherwise the serial line accepts
//! a small set of `*XX` administration commands for configuring the bridge.
//!
//! Hardware is reached only through the traits in [`platform`], so everything
//! here builds and is tested on the host.

pub mod bridge;
pub mod broker;
pub mod connection;
pub mod discovery;
pub mod indicator;
pub mod line;
pub mod link;
pub mod mqtt;
pub mod platform;
pub mod protocol;
pub mod settings;
pub mod state_machine;
pub mod status;
#[cfg(feature = "firmware")]
pub mod uplink;
pub mod wifi;

#[cfg(test)]
mod mock;

/// Project version information, reported by `*IV`
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration constants
pub mod config {
    /// Prefix the robot answers a version query with
    pub const ROBOT_BANNER: &str = "HullOS";

    /// Baud rate of the robot serial line
    pub const ROBOT_BAUD_RATE: u32 = 1200;

    /// Timeout for one line of serial input (discovery reply and settings upload)
    pub const RESPONSE_TIMEOUT_MS: u32 = 5000;

    /// Capacity of the serial protocol line buffer
    pub const INPUT_BUFFER_SIZE: usize = 1000;

    /// Byte written before and after every message relayed from the broker
    pub const MESSAGE_SENTINEL: u8 = 0x0d;

    /// Join status polls per access point before giving up on it
    pub const WIFI_TRY_LIMIT: u32 = 20;

    /// Interval between join status polls in milliseconds
    pub const WIFI_POLL_INTERVAL_MS: u32 = 500;

    /// Settle time before each access point is tried in milliseconds
    pub const WIFI_SETTLE_MS: u32 = 500;

    /// Maximum networks kept from one scan
    pub const MAX_SCAN_RESULTS: usize = 16;

    /// Heartbeat interval of the robot status light in milliseconds
    pub const FLASH_INTERVAL_MS: u64 = 500;

    /// Indicator timing for digit flash codes in milliseconds
    pub const DIGIT_FLASH_INTERVAL_MS: u32 = 400;
    pub const DIGIT_GAP_MS: u32 = 500;

    /// Pause between main loop iterations in milliseconds
    pub const LOOP_IDLE_MS: u32 = 1;

    /// Discovery handshake delays in milliseconds
    pub const ROBOT_BOOT_DELAY_MS: u32 = 1000;
    pub const ROBOT_HALT_DELAY_MS: u32 = 200;

    /// Endpoint marker that selects the secure broker transport
    pub const SECURE_PROVIDER_MARKER: &str = "azure";

    /// MQTT ports for plain and secure transport
    pub const MQTT_PORT: u16 = 1883;
    pub const MQTT_SECURE_PORT: u16 = 8883;

    /// MQTT keep-alive in seconds
    pub const MQTT_KEEP_ALIVE_SECS: u16 = 60;

    /// Largest broker message relayed to the robot
    pub const MAX_INBOUND_PAYLOAD: usize = 512;

    /// Topic layout, derived from the device name
    pub const TOPIC_PREFIX: &str = "devices/";
    pub const PUBLISH_SUFFIX: &str = "/messages/events/";
    pub const SUBSCRIBE_SUFFIX: &str = "/messages/devicebound/#";

    /// Flash offset of the persisted settings record
    pub const SETTINGS_FLASH_OFFSET: u32 = 0x9000;
}

/// Error types for the network client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeError {
    /// Scan found no networks at all
    NoNetworksFound,
    /// No configured candidate names a visible network
    NoCandidateMatchesConfig,
    /// Every configured candidate failed to join
    WirelessAttachFailed,
    /// Broker connect, publish or subscribe failed
    BrokerAttachFailed,
    /// A serial line did not arrive in time
    SerialFieldTimeout,
    /// A serial line was longer than its field
    SerialLineTruncated,
    /// A serial line was not valid UTF-8
    InvalidText,
    /// Serial port I/O error
    Serial,
    /// Settings storage error
    Storage,
}
