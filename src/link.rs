//! Serial link to the robot (or to a configuration host)
//!
//! Owns the UART and the activity indicator. Everything written to or read
//! from the peer goes through here.

use core::fmt;

use log::{trace, warn};

use crate::indicator::Indicator;
use crate::line::LineBuffer;
use crate::platform::{Clock, OutputPin, SerialRead, SerialReadReady, SerialWrite};
use crate::{BridgeError, config};

pub struct SerialLink<S, P> {
    serial: S,
    indicator: Indicator<P>,
    after_cr: bool,
}

impl<S, P> SerialLink<S, P>
where
    S: SerialRead + SerialWrite + SerialReadReady,
    P: OutputPin,
{
    pub fn new(serial: S, indicator: Indicator<P>) -> Self {
        Self {
            serial,
            indicator,
            after_cr: false,
        }
    }

    #[cfg(test)]
    pub(crate) fn serial_mut(&mut self) -> &mut S {
        &mut self.serial
    }

    pub fn indicator(&self) -> &Indicator<P> {
        &self.indicator
    }

    pub fn indicator_mut(&mut self) -> &mut Indicator<P> {
        &mut self.indicator
    }

    /// Next received byte, if one is waiting.
    ///
    /// An LF directly after a CR is swallowed, so CRLF reads as one terminator
    /// and both CR and LF still end a line on their own.
    pub fn read_byte(&mut self) -> Result<Option<u8>, BridgeError> {
        loop {
            if !self.serial.read_ready().map_err(|_| BridgeError::Serial)? {
                return Ok(None);
            }

            let mut byte = [0u8; 1];
            if self.serial.read(&mut byte).map_err(|_| BridgeError::Serial)? == 0 {
                return Ok(None);
            }

            let after_cr = core::mem::replace(&mut self.after_cr, byte[0] == b'\r');
            if after_cr && byte[0] == b'\n' {
                continue;
            }
            return Ok(Some(byte[0]));
        }
    }

    /// Throw away everything already received.
    pub fn discard_input(&mut self) -> Result<(), BridgeError> {
        let mut dropped = 0usize;
        while self.read_byte()?.is_some() {
            dropped += 1;
        }
        if dropped > 0 {
            trace!("[SERIAL] Discarded {} stale bytes", dropped);
        }
        Ok(())
    }

    /// Read one line into `line`, polling every millisecond.
    ///
    /// Returns [`BridgeError::SerialFieldTimeout`] if no terminator arrives
    /// within `timeout_ms` of idle polling. Overlong lines complete normally;
    /// callers check [`LineBuffer::is_truncated`].
    pub async fn read_line<C: Clock, const N: usize>(
        &mut self,
        clock: &C,
        line: &mut LineBuffer<N>,
        timeout_ms: u32,
    ) -> Result<(), BridgeError> {
        line.clear();
        let mut remaining = timeout_ms;

        while remaining > 0 {
            while let Some(byte) = self.read_byte()? {
                if line.push(byte) {
                    return Ok(());
                }
            }
            clock.delay_ms(1).await;
            remaining -= 1;
        }

        warn!("[SERIAL] Line read timed out after {} ms", timeout_ms);
        Err(BridgeError::SerialFieldTimeout)
    }

    pub fn write_all(&mut self, bytes: &[u8]) -> Result<(), BridgeError> {
        self.serial
            .write_all(bytes)
            .map_err(|_| BridgeError::Serial)
    }

    /// Write formatted text followed by CRLF.
    pub fn print_line(&mut self, args: fmt::Arguments<'_>) -> Result<(), BridgeError> {
        self.serial
            .write_fmt(args)
            .map_err(|_| BridgeError::Serial)?;
        self.write_all(b"\r\n")
    }

    /// Send a command line to the robot and flip the activity light.
    ///
    /// The leading CR terminates anything half-typed on the robot side.
    pub fn robot_command(&mut self, command: &str) -> Result<(), BridgeError> {
        self.indicator.flip();
        self.write_all(b"\r")?;
        self.write_all(command.as_bytes())?;
        self.write_all(b"\r\n")
    }

    /// Relay a broker message, bracketed by the message sentinel.
    pub fn write_framed(&mut self, payload: &[u8]) -> Result<(), BridgeError> {
        self.write_all(&[config::MESSAGE_SENTINEL])?;
        self.write_all(payload)?;
        self.write_all(&[config::MESSAGE_SENTINEL])?;
        self.indicator.flip();
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), BridgeError> {
        self.serial.flush().map_err(|_| BridgeError::Serial)
    }
}
