//! Persisted network settings
//!
//! The record is stored as one fixed-size block: a leading marker and a
//! layout version, the text fields each padded to `max + 1` bytes with NULs,
//! and a trailing marker. Anything that does not decode cleanly is treated as
//! blank storage.

use core::fmt::Debug;

use heapless::String;
use log::{info, warn};

use crate::line::LineBuffer;
use crate::link::SerialLink;
use crate::platform::{
    Clock, OutputPin, ReadStorage, SerialRead, SerialReadReady, SerialWrite, Storage,
};
use crate::BridgeError;

/// Number of WiFi candidates in the record
pub const MAX_CANDIDATES: usize = 5;

pub const AP_NAME_LEN: usize = 40;
pub const AP_PASSWORD_LEN: usize = 40;
pub const DEVICE_NAME_LEN: usize = 50;
pub const BROKER_USERNAME_LEN: usize = 200;
pub const BROKER_ENDPOINT_LEN: usize = 200;
pub const BROKER_SECRET_LEN: usize = 200;

/// Shown in place of a stored secret; sending it back keeps the secret.
pub const REDACTED: &str = "********";

const FIRST_MARKER: u8 = 0x55;
const LAST_MARKER: u8 = 0xAA;
const LAYOUT_VERSION: u8 = 1;

/// Size of the encoded record in bytes
pub const RECORD_SIZE: usize = 2
    + MAX_CANDIDATES * (AP_NAME_LEN + 1 + AP_PASSWORD_LEN + 1)
    + DEVICE_NAME_LEN
    + 1
    + BROKER_USERNAME_LEN
    + 1
    + BROKER_ENDPOINT_LEN
    + 1
    + BROKER_SECRET_LEN
    + 1
    + 1;

const LONGEST_FIELD: usize = BROKER_SECRET_LEN;

/// One WiFi network to try. An empty name marks an unused slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WifiCandidate {
    pub name: String<AP_NAME_LEN>,
    pub password: String<AP_PASSWORD_LEN>,
}

impl WifiCandidate {
    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsRecord {
    pub wifi_candidates: [WifiCandidate; MAX_CANDIDATES],
    pub device_name: String<DEVICE_NAME_LEN>,
    pub broker_username: String<BROKER_USERNAME_LEN>,
    pub broker_endpoint: String<BROKER_ENDPOINT_LEN>,
    pub broker_secret: String<BROKER_SECRET_LEN>,
}

impl SettingsRecord {
    /// Built-in sample settings, handy for checking a board end to end.
    pub fn demo() -> Self {
        let mut record = Self::default();
        let samples = [("Put", "Your"), ("Default", "Settings"), ("Here", "For")];
        let mut filled = Ok(());
        for (slot, (name, password)) in record.wifi_candidates.iter_mut().zip(samples) {
            filled = filled
                .and_then(|()| slot.name.push_str(name))
                .and_then(|()| slot.password.push_str(password));
        }
        filled = filled
            .and_then(|()| record.device_name.push_str("Quick"))
            .and_then(|()| record.broker_username.push_str("Deployment"))
            .and_then(|()| record.broker_endpoint.push_str("To"))
            .and_then(|()| record.broker_secret.push_str("A Robot"));
        debug_assert!(filled.is_ok(), "demo settings overflow a field");
        record
    }

    /// Candidates with a non-empty name, in configured order.
    pub fn candidates(&self) -> impl Iterator<Item = (usize, &WifiCandidate)> {
        self.wifi_candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.is_empty())
    }

    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut buf = [0u8; RECORD_SIZE];
        let mut writer = FieldWriter { buf: &mut buf, pos: 0 };

        writer.byte(FIRST_MARKER);
        writer.byte(LAYOUT_VERSION);
        for candidate in &self.wifi_candidates {
            writer.text(&candidate.name, AP_NAME_LEN);
            writer.text(&candidate.password, AP_PASSWORD_LEN);
        }
        writer.text(&self.device_name, DEVICE_NAME_LEN);
        writer.text(&self.broker_username, BROKER_USERNAME_LEN);
        writer.text(&self.broker_endpoint, BROKER_ENDPOINT_LEN);
        writer.text(&self.broker_secret, BROKER_SECRET_LEN);
        writer.byte(LAST_MARKER);

        buf
    }

    /// Decode a stored record, or `None` if it is not a valid one.
    pub fn decode(buf: &[u8; RECORD_SIZE]) -> Option<Self> {
        if buf[0] != FIRST_MARKER || buf[1] != LAYOUT_VERSION || buf[RECORD_SIZE - 1] != LAST_MARKER
        {
            return None;
        }

        let mut reader = FieldReader { buf, pos: 2 };
        let mut record = Self::default();
        for candidate in record.wifi_candidates.iter_mut() {
            candidate.name = reader.text()?;
            candidate.password = reader.text()?;
        }
        record.device_name = reader.text()?;
        record.broker_username = reader.text()?;
        record.broker_endpoint = reader.text()?;
        record.broker_secret = reader.text()?;
        Some(record)
    }
}

struct FieldWriter<'a> {
    buf: &'a mut [u8; RECORD_SIZE],
    pos: usize,
}

impl FieldWriter<'_> {
    fn byte(&mut self, value: u8) {
        self.buf[self.pos] = value;
        self.pos += 1;
    }

    fn text(&mut self, value: &str, max: usize) {
        let bytes = value.as_bytes();
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        // Padding is already zero
        self.pos += max + 1;
    }
}

struct FieldReader<'a> {
    buf: &'a [u8; RECORD_SIZE],
    pos: usize,
}

impl FieldReader<'_> {
    fn text<const N: usize>(&mut self) -> Option<String<N>> {
        let field = &self.buf[self.pos..self.pos + N + 1];
        self.pos += N + 1;

        let end = field.iter().position(|&b| b == 0)?;
        let text = core::str::from_utf8(&field[..end]).ok()?;
        String::try_from(text).ok()
    }
}

/// Owns the settings record and the storage it lives in.
pub struct ConfigStore<E> {
    storage: E,
    offset: u32,
    record: SettingsRecord,
}

impl<E> ConfigStore<E>
where
    E: ReadStorage + Storage,
    E::Error: Debug,
{
    /// The record starts out empty until [`ConfigStore::load`] is called.
    pub fn new(storage: E, offset: u32) -> Self {
        Self {
            storage,
            offset,
            record: SettingsRecord::default(),
        }
    }

    pub fn record(&self) -> &SettingsRecord {
        &self.record
    }

    #[cfg(test)]
    pub(crate) fn storage(&self) -> &E {
        &self.storage
    }

    /// Read the stored record. Invalid storage is reset to an empty record,
    /// which is persisted straight away.
    pub fn load(&mut self) -> Result<(), BridgeError> {
        let mut buf = [0u8; RECORD_SIZE];
        self.storage.read(self.offset, &mut buf).map_err(|e| {
            warn!("[CONFIG] Settings read failed: {:?}", e);
            BridgeError::Storage
        })?;

        match SettingsRecord::decode(&buf) {
            Some(record) => {
                info!("[CONFIG] Settings loaded for device '{}'", record.device_name);
                self.record = record;
                Ok(())
            }
            None => {
                warn!("[CONFIG] No valid settings stored, resetting to empty");
                self.record = SettingsRecord::default();
                self.persist()
            }
        }
    }

    /// Write the whole record in one storage write.
    pub fn persist(&mut self) -> Result<(), BridgeError> {
        let buf = self.record.encode();
        self.storage.write(self.offset, &buf).map_err(|e| {
            warn!("[CONFIG] Settings write failed: {:?}", e);
            BridgeError::Storage
        })?;
        info!("[CONFIG] Settings persisted ({} bytes)", RECORD_SIZE);
        Ok(())
    }

    /// Replace the record with the built-in sample and persist it.
    pub fn load_demo(&mut self) -> Result<(), BridgeError> {
        self.record = SettingsRecord::demo();
        self.persist()
    }

    /// Print the record one field per line, secrets redacted.
    pub fn export_to_serial<S, P>(&self, link: &mut SerialLink<S, P>) -> Result<(), BridgeError>
    where
        S: SerialRead + SerialWrite + SerialReadReady,
        P: OutputPin,
    {
        for candidate in &self.record.wifi_candidates {
            link.print_line(format_args!("{}", candidate.name))?;
            link.print_line(format_args!("{}", redact(&candidate.password)))?;
        }
        link.print_line(format_args!("{}", self.record.device_name))?;
        link.print_line(format_args!("{}", self.record.broker_username))?;
        link.print_line(format_args!("{}", self.record.broker_endpoint))?;
        link.print_line(format_args!("{}", redact(&self.record.broker_secret)))
    }

    /// Read a record in export order, one field per line.
    ///
    /// A redacted secret keeps the stored value. On any error the current
    /// record is left untouched. Nothing is persisted here.
    pub async fn import_from_serial<S, P, C>(
        &mut self,
        link: &mut SerialLink<S, P>,
        clock: &C,
        timeout_ms: u32,
    ) -> Result<(), BridgeError>
    where
        S: SerialRead + SerialWrite + SerialReadReady,
        P: OutputPin,
        C: Clock,
    {
        let mut staged = self.record.clone();
        let mut line = LineBuffer::<LONGEST_FIELD>::new();

        for candidate in staged.wifi_candidates.iter_mut() {
            candidate.name = read_field(link, clock, &mut line, timeout_ms).await?;
            let password = read_field(link, clock, &mut line, timeout_ms).await?;
            keep_unless_redacted(&mut candidate.password, password);
        }
        staged.device_name = read_field(link, clock, &mut line, timeout_ms).await?;
        staged.broker_username = read_field(link, clock, &mut line, timeout_ms).await?;
        staged.broker_endpoint = read_field(link, clock, &mut line, timeout_ms).await?;
        let secret = read_field(link, clock, &mut line, timeout_ms).await?;
        keep_unless_redacted(&mut staged.broker_secret, secret);

        self.record = staged;
        info!("[CONFIG] Settings received over serial");
        Ok(())
    }
}

fn redact(secret: &str) -> &str {
    if secret.is_empty() { "" } else { REDACTED }
}

fn keep_unless_redacted<const N: usize>(stored: &mut String<N>, received: String<N>) {
    if received.as_str() != REDACTED {
        *stored = received;
    }
}

async fn read_field<S, P, C, const N: usize>(
    link: &mut SerialLink<S, P>,
    clock: &C,
    line: &mut LineBuffer<LONGEST_FIELD>,
    timeout_ms: u32,
) -> Result<String<N>, BridgeError>
where
    S: SerialRead + SerialWrite + SerialReadReady,
    P: OutputPin,
    C: Clock,
{
    link.read_line(clock, line, timeout_ms).await?;
    if line.is_truncated() || line.len() > N {
        warn!("[CONFIG] Field longer than {} bytes", N);
        return Err(BridgeError::SerialLineTruncated);
    }
    let text = core::str::from_utf8(line.line()).map_err(|_| BridgeError::InvalidText)?;
    String::try_from(text).map_err(|_| BridgeError::SerialLineTruncated)
}
