//! Serial line protocol
//!
//! Bytes from the serial line are collected into lines. What a line means
//! depends on the mode picked at startup: with a robot attached every line is
//! traffic for the broker, otherwise lines are `*XX` administration commands.

use log::{debug, warn};

use crate::config;
use crate::discovery::Mode;
use crate::line::LineBuffer;

/// Administration commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// `*IV` print the firmware version
    Version,
    /// `*NI` print the chip id in hex
    ChipId,
    /// `*NR` print the stored settings
    ExportSettings,
    /// `*ND` store the built-in sample settings
    DemoSettings,
    /// `*NS` read settings from the serial line and store them
    ImportSettings,
    /// `*NA` scan and list access points
    ListAccessPoints,
    /// `*NC` connect to WiFi and the broker
    Connect,
}

impl Command {
    /// Parse a complete line. Matching is exact and case sensitive.
    pub fn parse(line: &[u8]) -> Option<Self> {
        match line {
            b"*IV" => Some(Command::Version),
            b"*NI" => Some(Command::ChipId),
            b"*NR" => Some(Command::ExportSettings),
            b"*ND" => Some(Command::DemoSettings),
            b"*NS" => Some(Command::ImportSettings),
            b"*NA" => Some(Command::ListAccessPoints),
            b"*NC" => Some(Command::Connect),
            _ => None,
        }
    }
}

/// What to do with a completed line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch<'a> {
    /// Publish verbatim to the outbound topic
    Publish(&'a [u8]),
    Command(Command),
}

pub struct ProtocolEngine {
    mode: Mode,
    line: LineBuffer<{ config::INPUT_BUFFER_SIZE }>,
    line_done: bool,
}

impl ProtocolEngine {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            line: LineBuffer::new(),
            line_done: false,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Feed one received byte.
    ///
    /// Returns the dispatch for the line this byte completed, if any. An
    /// overlong line is dispatched with its first
    /// [`config::INPUT_BUFFER_SIZE`] bytes.
    pub fn feed(&mut self, byte: u8) -> Option<Dispatch<'_>> {
        if self.line_done {
            self.line.clear();
            self.line_done = false;
        }

        if !self.line.push(byte) {
            return None;
        }
        self.line_done = true;

        if self.line.is_truncated() {
            warn!(
                "[SERIAL] Line longer than {} bytes, excess dropped",
                self.line.capacity()
            );
        }

        let line = self.line.line();
        match self.mode {
            Mode::Bridging if line.is_empty() => None,
            Mode::Bridging => Some(Dispatch::Publish(line)),
            Mode::Administration => match Command::parse(line) {
                Some(command) => Some(Dispatch::Command(command)),
                None => {
                    debug!("[SERIAL] Ignoring unknown command ({} bytes)", line.len());
                    None
                }
            },
        }
    }
}
