//! Broker uplink
//!
//! An MQTT session borrows its socket, TLS record buffers and packet
//! buffers, so it runs inside [`run`] for as long as it is open. The bridge
//! task reaches it through an [`UplinkHandle`], which implements
//! [`BrokerClient`] over channels.
//!
//! Secure sessions are TLS 1.3 (`embedded-tls`) on the same socket. The
//! server certificate is not verified.

use core::cell::{Cell, RefCell};

use embassy_net::Stack;
use embassy_net::dns::DnsQueryType;
use embassy_net::tcp::{self, State, TcpSocket};
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::{Duration, Timer};
use embedded_io_async::{ErrorType, Read, Write};
use embedded_tls::{Aes128GcmSha256, TlsConfig, TlsConnection, TlsContext, UnsecureProvider};
use heapless::{String, Vec};
use log::{info, warn};
use rand_core::{CryptoRng, RngCore};

use crate::broker::TOPIC_CAPACITY;
use crate::config;
use crate::mqtt::{self, MqttSession, SessionBuffers};
use crate::platform::{BrokerClient, EmbassyClock, InboundMessage, SessionParams, Transport};
use crate::settings::{BROKER_ENDPOINT_LEN, BROKER_SECRET_LEN, BROKER_USERNAME_LEN, DEVICE_NAME_LEN};

/// TCP socket buffer size, each direction
const SOCKET_BUFFER_SIZE: usize = 3072;

/// Largest TLS record plus overhead
const TLS_READ_BUFFER_SIZE: usize = 16640;

/// Outgoing TLS records; fits the largest publish
const TLS_WRITE_BUFFER_SIZE: usize = 4096;

const SOCKET_TIMEOUT_SECS: u64 = 10;

/// Delay between session service passes
const POLL_INTERVAL_MS: u64 = 5;

/// Inbound messages waiting for the bridge
const INBOUND_QUEUE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UplinkError {
    /// A field does not fit its buffer
    TooLarge,
    NotConnected,
    Dns,
    Connect,
    Tls,
    /// Broker refused CONNECT
    Refused,
    /// Publish or subscribe failed on an open session
    Session,
}

/// Owned copy of [`SessionParams`]
struct Credentials {
    host: String<BROKER_ENDPOINT_LEN>,
    port: u16,
    transport: Transport,
    client_id: String<DEVICE_NAME_LEN>,
    username: String<BROKER_USERNAME_LEN>,
    password: String<BROKER_SECRET_LEN>,
}

impl Credentials {
    fn copy_from(params: &SessionParams<'_>) -> Result<Self, UplinkError> {
        Ok(Self {
            host: text(params.host)?,
            port: params.port,
            transport: params.transport,
            client_id: text(params.client_id)?,
            username: text(params.username)?,
            password: text(params.password)?,
        })
    }

    fn params(&self) -> SessionParams<'_> {
        SessionParams {
            host: &self.host,
            port: self.port,
            transport: self.transport,
            client_id: &self.client_id,
            username: &self.username,
            password: &self.password,
        }
    }
}

fn text<const N: usize>(value: &str) -> Result<String<N>, UplinkError> {
    String::try_from(value).map_err(|_| UplinkError::TooLarge)
}

enum Request {
    Connect(Credentials),
    Publish {
        topic: String<TOPIC_CAPACITY>,
        payload: Vec<u8, { config::INPUT_BUFFER_SIZE }>,
    },
    Subscribe(String<TOPIC_CAPACITY>),
}

/// Channels between the bridge and the uplink task
pub struct Uplink {
    requests: Channel<CriticalSectionRawMutex, Request, 1>,
    replies: Channel<CriticalSectionRawMutex, Result<(), UplinkError>, 1>,
    inbound: Channel<CriticalSectionRawMutex, InboundMessage, INBOUND_QUEUE>,
    connected: Mutex<CriticalSectionRawMutex, Cell<bool>>,
}

impl Uplink {
    pub const fn new() -> Self {
        Self {
            requests: Channel::new(),
            replies: Channel::new(),
            inbound: Channel::new(),
            connected: Mutex::new(Cell::new(false)),
        }
    }

    pub fn handle(&self) -> UplinkHandle<'_> {
        UplinkHandle { uplink: self }
    }

    fn is_connected(&self) -> bool {
        self.connected.lock(|c| c.get())
    }

    fn set_connected(&self, connected: bool) {
        self.connected.lock(|c| c.set(connected));
    }

    async fn reply(&self, result: Result<(), UplinkError>) {
        self.replies.send(result).await;
    }
}

impl Default for Uplink {
    fn default() -> Self {
        Self::new()
    }
}

/// Broker client side of an [`Uplink`]
#[derive(Clone, Copy)]
pub struct UplinkHandle<'a> {
    uplink: &'a Uplink,
}

impl UplinkHandle<'_> {
    async fn request(&mut self, request: Request) -> Result<(), UplinkError> {
        self.uplink.requests.send(request).await;
        self.uplink.replies.receive().await
    }
}

impl BrokerClient for UplinkHandle<'_> {
    type Error = UplinkError;

    async fn connect(&mut self, params: &SessionParams<'_>) -> Result<(), Self::Error> {
        let credentials = Credentials::copy_from(params)?;
        self.request(Request::Connect(credentials)).await
    }

    fn is_connected(&self) -> bool {
        self.uplink.is_connected()
    }

    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), Self::Error> {
        if !self.uplink.is_connected() {
            return Err(UplinkError::NotConnected);
        }
        let topic = text(topic)?;
        let payload = Vec::from_slice(payload).map_err(|_| UplinkError::TooLarge)?;
        self.request(Request::Publish { topic, payload }).await
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), Self::Error> {
        if !self.uplink.is_connected() {
            return Err(UplinkError::NotConnected);
        }
        self.request(Request::Subscribe(text(topic)?)).await
    }

    async fn poll(&mut self) -> Result<Option<InboundMessage>, Self::Error> {
        Ok(self.uplink.inbound.try_receive().ok())
    }
}

/// Socket and session memory, reused by every session
pub struct UplinkBuffers {
    socket_rx: [u8; SOCKET_BUFFER_SIZE],
    socket_tx: [u8; SOCKET_BUFFER_SIZE],
    tls_read: [u8; TLS_READ_BUFFER_SIZE],
    tls_write: [u8; TLS_WRITE_BUFFER_SIZE],
    mqtt: SessionBuffers,
}

impl UplinkBuffers {
    pub const fn new() -> Self {
        Self {
            socket_rx: [0; SOCKET_BUFFER_SIZE],
            socket_tx: [0; SOCKET_BUFFER_SIZE],
            tls_read: [0; TLS_READ_BUFFER_SIZE],
            tls_write: [0; TLS_WRITE_BUFFER_SIZE],
            mqtt: SessionBuffers::new(),
        }
    }
}

impl Default for UplinkBuffers {
    fn default() -> Self {
        Self::new()
    }
}

/// esp-hal TRNG as a `rand_core` generator for the TLS handshake
pub struct HardwareRng(esp_hal::rng::Rng);

impl HardwareRng {
    pub fn new(rng: esp_hal::rng::Rng) -> Self {
        Self(rng)
    }
}

impl RngCore for HardwareRng {
    fn next_u32(&mut self) -> u32 {
        self.0.random()
    }

    fn next_u64(&mut self) -> u64 {
        rand_core::impls::next_u64_via_u32(self)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        rand_core::impls::fill_bytes_via_next(self, dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

impl CryptoRng for HardwareRng {}

/// Socket shared between the session stream and readiness checks.
///
/// Both run on the uplink task and never overlap.
struct SharedSocket<'s, 'b>(&'s RefCell<TcpSocket<'b>>);

impl ErrorType for SharedSocket<'_, '_> {
    type Error = tcp::Error;
}

#[allow(clippy::await_holding_refcell_ref)]
impl Read for SharedSocket<'_, '_> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        self.0.borrow_mut().read(buf).await
    }
}

#[allow(clippy::await_holding_refcell_ref)]
impl Write for SharedSocket<'_, '_> {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.0.borrow_mut().write(buf).await
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        self.0.borrow_mut().flush().await
    }
}

/// Serve broker sessions for the bridge. Never returns.
pub async fn run<R>(uplink: &Uplink, stack: Stack<'_>, buffers: &mut UplinkBuffers, mut rng: R) -> !
where
    R: RngCore + CryptoRng,
{
    let mut next = None;
    loop {
        let credentials = match next.take() {
            Some(credentials) => credentials,
            None => wait_for_connect(uplink).await,
        };
        next = session(uplink, stack, buffers, &credentials, &mut rng).await;
        uplink.set_connected(false);
    }
}

async fn wait_for_connect(uplink: &Uplink) -> Credentials {
    loop {
        match uplink.requests.receive().await {
            Request::Connect(credentials) => return credentials,
            Request::Publish { .. } | Request::Subscribe(_) => {
                uplink.reply(Err(UplinkError::NotConnected)).await
            }
        }
    }
}

/// Open one session and serve it until it drops.
///
/// Returns the credentials of a replacement session if the bridge asked for
/// one.
async fn session<R>(
    uplink: &Uplink,
    stack: Stack<'_>,
    buffers: &mut UplinkBuffers,
    credentials: &Credentials,
    rng: &mut R,
) -> Option<Credentials>
where
    R: RngCore + CryptoRng,
{
    let UplinkBuffers {
        socket_rx,
        socket_tx,
        tls_read,
        tls_write,
        mqtt,
    } = buffers;

    let socket = RefCell::new(TcpSocket::new(stack, socket_rx, socket_tx));
    socket
        .borrow_mut()
        .set_timeout(Some(Duration::from_secs(SOCKET_TIMEOUT_SECS)));

    if let Err(e) = dial(&socket, stack, credentials).await {
        uplink.reply(Err(e)).await;
        return None;
    }

    let seed = rng.next_u64();
    let next = match credentials.transport {
        Transport::Plain => serve(uplink, SharedSocket(&socket), &socket, mqtt, credentials, seed).await,
        Transport::Secure => {
            let mut tls = TlsConnection::<_, Aes128GcmSha256>::new(
                SharedSocket(&socket),
                tls_read,
                tls_write,
            );
            let tls_config = TlsConfig::new().with_server_name(&credentials.host);
            let provider = UnsecureProvider::new::<Aes128GcmSha256>(&mut *rng);
            match tls.open(TlsContext::new(&tls_config, provider)).await {
                Ok(()) => {
                    info!("[MQTT] TLS established with {}", credentials.host);
                    serve(uplink, tls, &socket, mqtt, credentials, seed).await
                }
                Err(e) => {
                    warn!("[MQTT] TLS handshake with {} failed: {:?}", credentials.host, e);
                    uplink.reply(Err(UplinkError::Tls)).await;
                    None
                }
            }
        }
    };

    socket.borrow_mut().abort();
    next
}

async fn dial(
    socket: &RefCell<TcpSocket<'_>>,
    stack: Stack<'_>,
    credentials: &Credentials,
) -> Result<(), UplinkError> {
    stack.wait_config_up().await;

    let addresses = stack
        .dns_query(&credentials.host, DnsQueryType::A)
        .await
        .map_err(|e| {
            warn!("[MQTT] DNS lookup for {} failed: {:?}", credentials.host, e);
            UplinkError::Dns
        })?;
    let Some(&address) = addresses.first() else {
        return Err(UplinkError::Dns);
    };

    let mut socket = socket.borrow_mut();
    socket
        .connect((address, credentials.port))
        .await
        .map_err(|e| {
            warn!(
                "[MQTT] TCP connect to {}:{} failed: {:?}",
                credentials.host, credentials.port, e
            );
            UplinkError::Connect
        })?;

    info!("[MQTT] TCP connected to {}:{}", credentials.host, credentials.port);
    Ok(())
}

async fn serve<T>(
    uplink: &Uplink,
    io: T,
    socket: &RefCell<TcpSocket<'_>>,
    buffers: &mut SessionBuffers,
    credentials: &Credentials,
    seed: u64,
) -> Option<Credentials>
where
    T: Read + Write,
{
    let params = credentials.params();
    let mut session = match MqttSession::connect(io, buffers, &params, EmbassyClock, seed).await {
        Ok(session) => session,
        Err(_) => {
            uplink.reply(Err(UplinkError::Refused)).await;
            return None;
        }
    };
    uplink.set_connected(true);
    uplink.reply(Ok(())).await;

    loop {
        while let Ok(request) = uplink.requests.try_receive() {
            let result = match request {
                Request::Connect(next) => {
                    uplink.set_connected(false);
                    session.disconnect().await;
                    return Some(next);
                }
                Request::Publish { topic, payload } => session.publish(&topic, &payload).await,
                Request::Subscribe(topic) => session.subscribe(&topic).await,
            };

            match result {
                Ok(()) => uplink.reply(Ok(())).await,
                Err(e) => {
                    warn!("[MQTT] Request failed: {:?}", e);
                    let fatal = mqtt::is_fatal(&e);
                    uplink.reply(Err(UplinkError::Session)).await;
                    if fatal {
                        return None;
                    }
                }
            }
        }

        if socket.borrow().can_recv() {
            match session.receive().await {
                Ok(Some(message)) => uplink.inbound.send(message).await,
                Ok(None) => {}
                Err(e) => {
                    warn!("[MQTT] Session lost: {:?}", e);
                    return None;
                }
            }
        }

        if let Err(e) = session.keep_alive().await {
            warn!("[MQTT] Keep-alive failed: {:?}", e);
            if mqtt::is_fatal(&e) {
                return None;
            }
        }

        if socket.borrow().state() != State::Established {
            info!("[MQTT] Broker closed the connection");
            return None;
        }

        Timer::after_millis(POLL_INTERVAL_MS).await;
    }
}
