//! Connection status display
//!
//! With a robot attached, status is shown as colors on the robot (and keeps
//! blinking while the same status is repeated). Without one, it is printed as
//! text for whoever is on the other end of the serial line.

use core::fmt;

use log::debug;

use crate::config;
use crate::link::SerialLink;
use crate::platform::{OutputPin, SerialRead, SerialReadReady, SerialWrite};
use crate::BridgeError;

/// Connection progress, numbered as on the status light
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status<'a> {
    ConnectingToWifi,
    NoAccessPointsFound,
    NoAccessPointNamesMatch,
    /// Joining the named access point
    ConnectingToAccessPoint(&'a str),
    AccessPointConnected { mac: [u8; 6] },
    AccessPointConnectFailed,
    BrokerConnectFailed,
    BrokerConnected,
}

impl Status<'_> {
    pub fn code(&self) -> u8 {
        match self {
            Status::ConnectingToWifi => 1,
            Status::NoAccessPointsFound => 2,
            Status::NoAccessPointNamesMatch => 3,
            Status::ConnectingToAccessPoint(_) => 4,
            Status::AccessPointConnected { .. } => 5,
            Status::AccessPointConnectFailed => 6,
            Status::BrokerConnectFailed => 7,
            Status::BrokerConnected => 8,
        }
    }

    /// Robot command that shows this status.
    pub fn robot_color(&self) -> &'static str {
        match self {
            Status::ConnectingToWifi => "BLUE",
            Status::NoAccessPointsFound => "RED",
            Status::NoAccessPointNamesMatch => "*PC255,165,0",
            Status::ConnectingToAccessPoint(_) => "YELLOW",
            Status::AccessPointConnected { .. } => "WHITE",
            Status::AccessPointConnectFailed => "CYAN",
            Status::BrokerConnectFailed => "MAGENTA",
            Status::BrokerConnected => "GREEN",
        }
    }
}

/// Robot command for the dark half of the heartbeat
pub const ROBOT_LIGHT_OFF: &str = "BLACK";

/// Broker session details shown when a session is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo<'a> {
    pub endpoint: &'a str,
    pub publish_topic: &'a str,
    pub subscribe_topic: &'a str,
}

/// Progress notifications raised while attaching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress<'a> {
    Status(Status<'a>),
    Session(SessionInfo<'a>),
}

/// `AA:BB:CC:DD:EE:FF`
pub struct MacAddress(pub [u8; 6]);

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

/// Something that can show connection status.
pub trait StatusSink {
    fn report<S, P>(
        &mut self,
        link: &mut SerialLink<S, P>,
        now_ms: u64,
        status: Status<'_>,
    ) -> Result<(), BridgeError>
    where
        S: SerialRead + SerialWrite + SerialReadReady,
        P: OutputPin;

    /// Show the broker session being opened. Ignored by default.
    fn describe_session<S, P>(
        &mut self,
        _link: &mut SerialLink<S, P>,
        _session: &SessionInfo<'_>,
    ) -> Result<(), BridgeError>
    where
        S: SerialRead + SerialWrite + SerialReadReady,
        P: OutputPin,
    {
        Ok(())
    }
}

/// Text lines for a configuration host. Each status is printed once.
#[derive(Debug, Default)]
pub struct ConsoleReporter {
    last_code: Option<u8>,
}

impl ConsoleReporter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StatusSink for ConsoleReporter {
    fn report<S, P>(
        &mut self,
        link: &mut SerialLink<S, P>,
        _now_ms: u64,
        status: Status<'_>,
    ) -> Result<(), BridgeError>
    where
        S: SerialRead + SerialWrite + SerialReadReady,
        P: OutputPin,
    {
        if self.last_code == Some(status.code()) {
            return Ok(());
        }
        self.last_code = Some(status.code());

        match status {
            Status::ConnectingToWifi => link.print_line(format_args!("Connecting to wifi")),
            Status::NoAccessPointsFound => {
                link.print_line(format_args!("No wifi access points found"))
            }
            Status::NoAccessPointNamesMatch => {
                link.print_line(format_args!("No wifi access point names match config"))
            }
            Status::ConnectingToAccessPoint(name) => {
                link.print_line(format_args!("Connecting to: {}", name))
            }
            Status::AccessPointConnected { mac } => {
                link.print_line(format_args!("Connected to access point OK"))?;
                link.print_line(format_args!("MAC address:{}", MacAddress(mac)))
            }
            Status::AccessPointConnectFailed => {
                link.print_line(format_args!("Access point connection failed"))
            }
            Status::BrokerConnectFailed => link.print_line(format_args!("MQTT connection failed")),
            Status::BrokerConnected => link.print_line(format_args!("MQTT connected OK")),
        }
    }

    fn describe_session<S, P>(
        &mut self,
        link: &mut SerialLink<S, P>,
        session: &SessionInfo<'_>,
    ) -> Result<(), BridgeError>
    where
        S: SerialRead + SerialWrite + SerialReadReady,
        P: OutputPin,
    {
        link.print_line(format_args!("Endpoint: {}", session.endpoint))?;
        link.print_line(format_args!("Publish: {}", session.publish_topic))?;
        link.print_line(format_args!("Subscribe: {}", session.subscribe_topic))
    }
}

/// Colors on the robot, with a heartbeat while a status repeats.
#[derive(Debug, Default)]
pub struct RobotReporter {
    last_code: Option<u8>,
    next_heartbeat_ms: u64,
    lit: bool,
}

impl RobotReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_lit(&self) -> bool {
        self.lit
    }
}

impl StatusSink for RobotReporter {
    fn report<S, P>(
        &mut self,
        link: &mut SerialLink<S, P>,
        now_ms: u64,
        status: Status<'_>,
    ) -> Result<(), BridgeError>
    where
        S: SerialRead + SerialWrite + SerialReadReady,
        P: OutputPin,
    {
        if self.last_code != Some(status.code()) {
            debug!("[STATE] Robot status {} -> {}", self.last_code.unwrap_or(0), status.code());
            self.last_code = Some(status.code());
            self.next_heartbeat_ms = now_ms + config::FLASH_INTERVAL_MS;
            self.lit = true;
            return link.robot_command(status.robot_color());
        }

        if now_ms < self.next_heartbeat_ms {
            return Ok(());
        }
        self.next_heartbeat_ms = now_ms + config::FLASH_INTERVAL_MS;

        if self.lit {
            self.lit = false;
            link.robot_command(ROBOT_LIGHT_OFF)
        } else {
            self.lit = true;
            link.robot_command(status.robot_color())
        }
    }
}

/// The status rendering picked once at startup.
#[derive(Debug)]
pub enum Reporter {
    Console(ConsoleReporter),
    Robot(RobotReporter),
}

impl StatusSink for Reporter {
    fn report<S, P>(
        &mut self,
        link: &mut SerialLink<S, P>,
        now_ms: u64,
        status: Status<'_>,
    ) -> Result<(), BridgeError>
    where
        S: SerialRead + SerialWrite + SerialReadReady,
        P: OutputPin,
    {
        match self {
            Reporter::Console(console) => console.report(link, now_ms, status),
            Reporter::Robot(robot) => robot.report(link, now_ms, status),
        }
    }

    fn describe_session<S, P>(
        &mut self,
        link: &mut SerialLink<S, P>,
        session: &SessionInfo<'_>,
    ) -> Result<(), BridgeError>
    where
        S: SerialRead + SerialWrite + SerialReadReady,
        P: OutputPin,
    {
        match self {
            Reporter::Console(console) => console.describe_session(link, session),
            Reporter::Robot(robot) => robot.describe_session(link, session),
        }
    }
}

impl Reporter {
    /// Show one progress notification.
    pub fn show<S, P>(
        &mut self,
        link: &mut SerialLink<S, P>,
        now_ms: u64,
        progress: Progress<'_>,
    ) -> Result<(), BridgeError>
    where
        S: SerialRead + SerialWrite + SerialReadReady,
        P: OutputPin,
    {
        match progress {
            Progress::Status(status) => self.report(link, now_ms, status),
            Progress::Session(session) => self.describe_session(link, &session),
        }
    }
}
