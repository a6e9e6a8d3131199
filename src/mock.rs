//! In-memory doubles for the hardware seams, for host unit tests.

use core::cell::{Cell, RefCell};
use core::convert::Infallible;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};
use std::collections::VecDeque;
use std::rc::Rc;
use std::string::{String as StdString, ToString};
use std::vec::Vec;

use embedded_io::ErrorKind;
use heapless::{String, Vec as HVec};

use crate::config;
use crate::indicator::Indicator;
use crate::link::SerialLink;
use crate::platform::{
    AccessPoint, BrokerClient, Clock, InboundMessage, SessionParams, Transport, WifiRadio,
};

/// Run a future that never pends (all mocks complete immediately).
pub fn block_on<F: Future>(mut f: F) -> F::Output {
    fn noop_raw_waker() -> RawWaker {
        fn noop(_: *const ()) {}
        fn clone(_: *const ()) -> RawWaker {
            noop_raw_waker()
        }
        static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, noop, noop, noop);
        RawWaker::new(core::ptr::null(), &VTABLE)
    }

    let waker = unsafe { Waker::from_raw(noop_raw_waker()) };
    let mut cx = Context::from_waker(&waker);

    // SAFETY: We don't move f after pinning
    let mut f = unsafe { Pin::new_unchecked(&mut f) };

    match f.as_mut().poll(&mut cx) {
        Poll::Ready(result) => result,
        Poll::Pending => panic!("Mock future returned Pending unexpectedly"),
    }
}

/// Virtual clock; every delay advances time instantly.
#[derive(Default)]
pub struct MockClock {
    now: Cell<u64>,
}

impl MockClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, ms: u64) {
        self.now.set(self.now.get() + ms);
    }
}

impl Clock for MockClock {
    fn now_ms(&self) -> u64 {
        self.now.get()
    }

    fn delay_ms(&self, ms: u32) -> impl Future<Output = ()> {
        self.advance(ms as u64);
        core::future::ready(())
    }
}

/// Output pin that records every level written (`true` = high).
pub struct MockPin {
    levels: Rc<RefCell<Vec<bool>>>,
}

impl MockPin {
    pub fn new() -> Self {
        Self {
            levels: Rc::new(RefCell::new(Vec::new())),
        }
    }

    pub fn levels(&self) -> Rc<RefCell<Vec<bool>>> {
        self.levels.clone()
    }
}

impl embedded_hal::digital::ErrorType for MockPin {
    type Error = Infallible;
}

impl embedded_hal::digital::OutputPin for MockPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.levels.borrow_mut().push(false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.levels.borrow_mut().push(true);
        Ok(())
    }
}

/// Serial port with scripted input.
///
/// A responder queues a reply the first time its trigger appears in the
/// transmitted bytes, which lets tests play the robot side of a handshake.
#[derive(Default)]
pub struct MockSerial {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
    responders: Vec<(Vec<u8>, Vec<u8>, bool)>,
}

impl MockSerial {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_rx(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes.iter().copied());
    }

    pub fn respond_to(&mut self, trigger: &[u8], reply: &[u8]) {
        self.responders.push((trigger.to_vec(), reply.to_vec(), false));
    }

    pub fn take_tx(&mut self) -> Vec<u8> {
        core::mem::take(&mut self.tx)
    }

    pub fn tx_text(&self) -> StdString {
        StdString::from_utf8_lossy(&self.tx).into_owned()
    }

    pub fn rx_pending(&self) -> usize {
        self.rx.len()
    }
}

impl embedded_io::ErrorType for MockSerial {
    type Error = Infallible;
}

impl embedded_io::Read for MockSerial {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let mut count = 0;
        while count < buf.len() {
            match self.rx.pop_front() {
                Some(b) => {
                    buf[count] = b;
                    count += 1;
                }
                None => break,
            }
        }
        Ok(count)
    }
}

impl embedded_io::ReadReady for MockSerial {
    fn read_ready(&mut self) -> Result<bool, Self::Error> {
        Ok(!self.rx.is_empty())
    }
}

impl embedded_io::Write for MockSerial {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.tx.extend_from_slice(buf);
        for (trigger, reply, fired) in self.responders.iter_mut() {
            if !*fired && self.tx.windows(trigger.len()).any(|w| w == trigger.as_slice()) {
                *fired = true;
                self.rx.extend(reply.iter().copied());
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

pub fn test_link() -> SerialLink<MockSerial, MockPin> {
    SerialLink::new(MockSerial::new(), Indicator::new(MockPin::new(), true))
}

/// Byte-addressable storage initialised to the erased state.
pub struct MockStorage {
    pub data: Vec<u8>,
    pub writes: usize,
}

impl MockStorage {
    pub fn new() -> Self {
        Self {
            data: vec![0xFF; 0x1_0000],
            writes: 0,
        }
    }
}

impl embedded_storage::ReadStorage for MockStorage {
    type Error = ();

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let start = offset as usize;
        let end = start + bytes.len();
        if end > self.data.len() {
            return Err(());
        }
        bytes.copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }
}

impl embedded_storage::Storage for MockStorage {
    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        let start = offset as usize;
        let end = start + bytes.len();
        if end > self.data.len() {
            return Err(());
        }
        self.data[start..end].copy_from_slice(bytes);
        self.writes += 1;
        Ok(())
    }
}

pub fn access_point(ssid: &str, channel: u8, rssi: i8, open: bool) -> AccessPoint {
    AccessPoint {
        ssid: String::try_from(ssid).unwrap(),
        channel,
        rssi,
        open,
    }
}

/// WiFi radio with a fixed set of visible networks and accepted credentials.
#[derive(Default)]
pub struct MockRadio {
    pub visible: Vec<AccessPoint>,
    pub accepted: Vec<(StdString, StdString)>,
    /// Status polls needed before an accepted join reports connected
    pub polls_to_connect: u32,
    pub begins: Vec<StdString>,
    pub scans: usize,
    pub disconnects: usize,
    joining: Option<bool>,
    polls: u32,
}

impl MockRadio {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(mut self, ssid: &str, password: &str) -> Self {
        self.accepted.push((ssid.to_string(), password.to_string()));
        self
    }

    pub fn visible(mut self, ap: AccessPoint) -> Self {
        self.visible.push(ap);
        self
    }

    pub fn drop_link(&mut self) {
        self.joining = None;
    }
}

impl WifiRadio for MockRadio {
    type Error = ();

    fn scan(
        &mut self,
    ) -> impl Future<Output = Result<HVec<AccessPoint, { config::MAX_SCAN_RESULTS }>, Self::Error>>
    {
        self.scans += 1;
        let found = self.visible.iter().cloned().collect();
        core::future::ready(Ok(found))
    }

    fn begin(&mut self, ssid: &str, password: &str) -> impl Future<Output = Result<(), Self::Error>> {
        self.begins.push(ssid.to_string());
        let ok = self
            .accepted
            .iter()
            .any(|(s, p)| s == ssid && p == password);
        self.joining = Some(ok);
        self.polls = 0;
        core::future::ready(Ok(()))
    }

    fn is_connected(&mut self) -> bool {
        match self.joining {
            Some(true) => {
                self.polls += 1;
                self.polls > self.polls_to_connect
            }
            _ => false,
        }
    }

    fn disconnect(&mut self) -> impl Future<Output = Result<(), Self::Error>> {
        self.disconnects += 1;
        self.joining = None;
        core::future::ready(Ok(()))
    }

    fn mac_address(&self) -> [u8; 6] {
        [0xA8, 0xD9, 0xB3, 0x0D, 0xAA, 0xCE]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedSession {
    pub host: StdString,
    pub port: u16,
    pub transport: Transport,
    pub client_id: StdString,
    pub username: StdString,
    pub password: StdString,
}

/// Broker client recording everything sent through it.
#[derive(Default)]
pub struct MockBroker {
    pub refuse: bool,
    pub connected: bool,
    pub sessions: Vec<RecordedSession>,
    pub published: Vec<(StdString, Vec<u8>)>,
    pub subscriptions: Vec<StdString>,
    pub inbound: VecDeque<InboundMessage>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deliver(&mut self, payload: &[u8]) {
        self.inbound.push_back(InboundMessage {
            payload: HVec::from_slice(payload).unwrap(),
        });
    }
}

impl BrokerClient for MockBroker {
    type Error = ();

    fn connect(&mut self, params: &SessionParams<'_>) -> impl Future<Output = Result<(), Self::Error>> {
        self.sessions.push(RecordedSession {
            host: params.host.to_string(),
            port: params.port,
            transport: params.transport,
            client_id: params.client_id.to_string(),
            username: params.username.to_string(),
            password: params.password.to_string(),
        });
        self.connected = !self.refuse;
        core::future::ready(if self.refuse { Err(()) } else { Ok(()) })
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> impl Future<Output = Result<(), Self::Error>> {
        let result = if self.connected {
            self.published.push((topic.to_string(), payload.to_vec()));
            Ok(())
        } else {
            Err(())
        };
        core::future::ready(result)
    }

    fn subscribe(&mut self, topic: &str) -> impl Future<Output = Result<(), Self::Error>> {
        self.subscriptions.push(topic.to_string());
        core::future::ready(Ok(()))
    }

    fn poll(&mut self) -> impl Future<Output = Result<Option<InboundMessage>, Self::Error>> {
        let next = if self.connected {
            self.inbound.pop_front()
        } else {
            None
        };
        core::future::ready(Ok(next))
    }
}

#[derive(Default)]
struct Wire {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
    connack_code: u8,
    subscribes: usize,
    pings: usize,
}

/// Broker end of an MQTT 5 stream.
///
/// Clones share one wire, so a test keeps a handle while the session owns
/// another. CONNECT, SUBSCRIBE and PINGREQ are answered as they are written.
/// Reading with nothing queued fails like a socket timeout.
#[derive(Clone, Default)]
pub struct MockTransport {
    wire: Rc<RefCell<Wire>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer CONNECT with `code` instead of success.
    pub fn refuse_with(self, code: u8) -> Self {
        self.wire.borrow_mut().connack_code = code;
        self
    }

    pub fn push_rx(&self, bytes: &[u8]) {
        self.wire.borrow_mut().rx.extend(bytes.iter().copied());
    }

    pub fn tx(&self) -> Vec<u8> {
        self.wire.borrow().tx.clone()
    }

    pub fn subscribes(&self) -> usize {
        self.wire.borrow().subscribes
    }

    pub fn pings(&self) -> usize {
        self.wire.borrow().pings
    }
}

impl embedded_io_async::ErrorType for MockTransport {
    type Error = ErrorKind;
}

impl embedded_io_async::Read for MockTransport {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let mut wire = self.wire.borrow_mut();
        if wire.rx.is_empty() {
            return Err(ErrorKind::TimedOut);
        }
        let mut count = 0;
        while count < buf.len() {
            match wire.rx.pop_front() {
                Some(b) => {
                    buf[count] = b;
                    count += 1;
                }
                None => break,
            }
        }
        Ok(count)
    }
}

impl embedded_io_async::Write for MockTransport {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        let mut wire = self.wire.borrow_mut();
        wire.tx.extend_from_slice(buf);

        match buf.first() {
            Some(0x10) => {
                let code = wire.connack_code;
                wire.rx.extend([0x20, 0x03, 0x00, code, 0x00]);
            }
            Some(0x82) => {
                // Packet identifier follows the remaining length
                let mut at = 1;
                while buf.get(at).is_some_and(|b| b & 0x80 != 0) {
                    at += 1;
                }
                let id = [buf[at + 1], buf[at + 2]];
                wire.subscribes += 1;
                wire.rx.extend([0x90, 0x04, id[0], id[1], 0x00, 0x00]);
            }
            Some(0xC0) => {
                wire.pings += 1;
                wire.rx.extend([0xD0, 0x00]);
            }
            _ => {}
        }
        Ok(buf.len())
    }
}
