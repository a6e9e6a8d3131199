//! Robot discovery
//!
//! At boot the serial peer is asked for its version. A HullOS robot answers
//! with its banner and the bridge starts relaying; anything else gets the
//! administration command set.

use log::{info, warn};

use crate::line::LineBuffer;
use crate::link::SerialLink;
use crate::platform::{Clock, OutputPin, SerialRead, SerialReadReady, SerialWrite};
use crate::config;

/// Role of the serial line, fixed at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// A robot is attached; lines are relayed to the broker
    Bridging,
    /// No robot; lines are administration commands
    Administration,
}

/// Probe the serial peer and decide the mode.
pub async fn find_robot<S, P, C>(link: &mut SerialLink<S, P>, clock: &C) -> Mode
where
    S: SerialRead + SerialWrite + SerialReadReady,
    P: OutputPin,
    C: Clock,
{
    link.indicator_mut().on();
    if let Err(e) = link.discard_input() {
        warn!("[DISCOVERY] Could not flush input: {:?}", e);
    }

    // Give the robot time to boot
    clock.delay_ms(config::ROBOT_BOOT_DELAY_MS).await;
    link.indicator_mut().off();
    clock.delay_ms(config::ROBOT_BOOT_DELAY_MS).await;

    // Stop any running program, then ask for the version
    if let Err(e) = link.robot_command("*RH") {
        warn!("[DISCOVERY] Serial write failed: {:?}", e);
        return Mode::Administration;
    }
    clock.delay_ms(config::ROBOT_HALT_DELAY_MS).await;
    if let Err(e) = link.robot_command("*IV") {
        warn!("[DISCOVERY] Serial write failed: {:?}", e);
        return Mode::Administration;
    }

    let mut reply = LineBuffer::<{ config::INPUT_BUFFER_SIZE }>::new();
    if link
        .read_line(clock, &mut reply, config::RESPONSE_TIMEOUT_MS)
        .await
        .is_err()
    {
        info!("[DISCOVERY] No reply from serial peer");
        return Mode::Administration;
    }

    if reply.line().starts_with(config::ROBOT_BANNER.as_bytes()) {
        info!("[DISCOVERY] Robot found");
        return Mode::Bridging;
    }

    info!("[DISCOVERY] Peer is not a robot ({} byte reply)", reply.len());
    link.indicator_mut().flash_code(clock, 5).await;
    clock.delay_ms(config::ROBOT_BOOT_DELAY_MS).await;
    Mode::Administration
}
