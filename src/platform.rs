//! Hardware seams
//!
//! The serial line, indicator pin and settings storage use the `embedded-io`,
//! `embedded-hal` and `embedded-storage` traits directly. Time, the WiFi radio
//! and the broker client have no common ecosystem trait, so they are defined
//! here.

use core::fmt::Debug;
use core::future::Future;
use heapless::{String, Vec};

pub use embedded_hal::digital::OutputPin;
pub use embedded_io::{Read as SerialRead, ReadReady as SerialReadReady, Write as SerialWrite};
pub use embedded_storage::{ReadStorage, Storage};

use crate::config;

/// Maximum SSID length (IEEE 802.11)
pub const MAX_SSID_LEN: usize = 32;

/// Monotonic time and cooperative delays.
pub trait Clock {
    /// Milliseconds since boot.
    fn now_ms(&self) -> u64;

    /// Wait for `ms` milliseconds, yielding to other tasks.
    fn delay_ms(&self, ms: u32) -> impl Future<Output = ()>;
}

impl<C: Clock> Clock for &C {
    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }

    fn delay_ms(&self, ms: u32) -> impl Future<Output = ()> {
        (**self).delay_ms(ms)
    }
}

/// Clock on the embassy time driver
#[cfg(feature = "firmware")]
#[derive(Debug, Clone, Copy, Default)]
pub struct EmbassyClock;

#[cfg(feature = "firmware")]
impl Clock for EmbassyClock {
    fn now_ms(&self) -> u64 {
        embassy_time::Instant::now().as_millis()
    }

    fn delay_ms(&self, ms: u32) -> impl Future<Output = ()> {
        embassy_time::Timer::after_millis(ms as u64)
    }
}

/// One network found by a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPoint {
    pub ssid: String<MAX_SSID_LEN>,
    pub channel: u8,
    pub rssi: i8,
    pub open: bool,
}

/// Station-mode WiFi driver.
pub trait WifiRadio {
    type Error: Debug;

    /// Scan for visible networks.
    fn scan(
        &mut self,
    ) -> impl Future<Output = Result<Vec<AccessPoint, { config::MAX_SCAN_RESULTS }>, Self::Error>>;

    /// Start joining a network. Completion is observed through [`WifiRadio::is_connected`].
    fn begin(
        &mut self,
        ssid: &str,
        password: &str,
    ) -> impl Future<Output = Result<(), Self::Error>>;

    /// Whether the station is associated.
    fn is_connected(&mut self) -> bool;

    /// Drop any association.
    fn disconnect(&mut self) -> impl Future<Output = Result<(), Self::Error>>;

    /// Station MAC address.
    fn mac_address(&self) -> [u8; 6];
}

/// Transport security of a broker session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Plain,
    Secure,
}

/// Everything needed to open a broker session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionParams<'a> {
    pub host: &'a str,
    pub port: u16,
    pub transport: Transport,
    pub client_id: &'a str,
    pub username: &'a str,
    pub password: &'a str,
}

/// A message delivered on a subscribed topic.
///
/// Only the payload is relayed. The topic is logged where it is received
/// and never copied, so its length is not limited here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub payload: Vec<u8, { config::MAX_INBOUND_PAYLOAD }>,
}

/// Publish/subscribe broker client.
pub trait BrokerClient {
    type Error: Debug;

    /// Open a session, replacing any previous one.
    fn connect(
        &mut self,
        params: &SessionParams<'_>,
    ) -> impl Future<Output = Result<(), Self::Error>>;

    /// Whether the session is still up.
    fn is_connected(&self) -> bool;

    fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
    ) -> impl Future<Output = Result<(), Self::Error>>;

    fn subscribe(&mut self, topic: &str) -> impl Future<Output = Result<(), Self::Error>>;

    /// Service the session and return the next inbound message, if any.
    ///
    /// Must not wait for traffic: returns `Ok(None)` when nothing is pending.
    fn poll(&mut self) -> impl Future<Output = Result<Option<InboundMessage>, Self::Error>>;
}
