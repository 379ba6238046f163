//! Connection management.
//!
//! A [`Connection`] walks `Idle -> Resolving -> Connecting -> Ready`, and ends
//! in `Closed` after [`Connection::close`]. Each connect attempt is tagged
//! with an epoch; `close()` bumps the epoch and aborts the attempt's tasks, and
//! every task re-checks its epoch before touching shared state, so work that
//! completes after a close is a no-op.
//!
//! Faults are surfaced once per attempt through the error hook, posted onto
//! the runtime rather than called inline, so the hook may close or drop the
//! connection freely.

use crate::callback::{share, Callback, SharedCallback};
use crate::command::Command;
use crate::dispatch;
use crate::error::{ClientError, Fault};
use crate::keepalive::{self, PongTracker, Tick, DEFAULT_PING_INTERVAL};
use crate::registry::{CallbackHandle, CallbackInfo, CallbackRegistry};
use bytes::Bytes;
use ilmp_protocol::{
    cancel_frame, handshake, ping_frame, readable, Frame, FrameBuffer, ProtocolDecoder,
    WireVersion, CLIENT_PROTOCOL_VERSION, DEFAULT_PORT,
};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server host name or address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Site directory named in commands. Empty means "same as host".
    pub site_dir: String,
    /// Protocol version advertised in the handshake.
    pub client_version: String,
    /// Interval between keepalive pings.
    pub ping_interval: Duration,
    /// Timeout for connecting to a single endpoint.
    pub connect_timeout: Duration,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            site_dir: String::new(),
            client_version: CLIENT_PROTOCOL_VERSION.to_string(),
            ping_interval: DEFAULT_PING_INTERVAL,
            connect_timeout: Duration::from_secs(10),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_site_dir(mut self, site_dir: impl Into<String>) -> Self {
        self.site_dir = site_dir.into();
        self
    }

    pub fn with_client_version(mut self, version: impl Into<String>) -> Self {
        self.client_version = version.into();
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }

    /// Site directory used when a command does not name one.
    pub fn effective_site_dir(&self) -> &str {
        if self.site_dir.is_empty() {
            &self.host
        } else {
            &self.site_dir
        }
    }
}

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Resolving,
    Connecting,
    Ready,
    Closed,
}

type ReadyHook = Arc<dyn Fn() + Send + Sync>;
type ErrorHook = Arc<dyn Fn(Fault) + Send + Sync>;

struct Inner {
    state: ConnectionState,
    /// Incremented by every teardown; tasks of older epochs are stale.
    epoch: u64,
    /// Set once a fault was surfaced for the current epoch.
    faulted: bool,
    was_connected: bool,
    version: WireVersion,
    pong: PongTracker,
    registry: CallbackRegistry,
    writer: Option<mpsc::UnboundedSender<Bytes>>,
    tasks: Vec<JoinHandle<()>>,
    on_ready: Option<ReadyHook>,
    on_error: Option<ErrorHook>,
}

pub(crate) struct Shared {
    id: Uuid,
    config: ConnectionConfig,
    inner: Mutex<Inner>,
}

/// A connection to an ILMP server.
///
/// Cloning is cheap; all clones drive the same connection. Background tasks
/// hold their own clone, so call [`Connection::close`] to stop them.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Creates a new connection (not yet connected).
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: Uuid::new_v4(),
                config,
                inner: Mutex::new(Inner {
                    state: ConnectionState::Idle,
                    epoch: 0,
                    faulted: false,
                    was_connected: false,
                    version: WireVersion::AwaitingVersion,
                    pong: PongTracker::default(),
                    registry: CallbackRegistry::new(),
                    writer: None,
                    tasks: Vec::new(),
                    on_ready: None,
                    on_error: None,
                }),
            }),
        }
    }

    /// Identifier used in log lines.
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    /// Sets the hook invoked each time the connection becomes ready.
    pub fn on_ready<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.inner.lock().on_ready = Some(Arc::new(hook));
    }

    /// Sets the hook receiving faults.
    pub fn on_error<F>(&self, hook: F)
    where
        F: Fn(Fault) + Send + Sync + 'static,
    {
        self.shared.inner.lock().on_error = Some(Arc::new(hook));
    }

    /// Tears down any previous attempt and starts connecting in the background.
    ///
    /// Progress is reported through the ready and error hooks. Fails only when
    /// called outside a tokio runtime.
    pub fn connect(&self) -> Result<(), ClientError> {
        let runtime = tokio::runtime::Handle::try_current()?;
        let epoch = self.shared.teardown(ConnectionState::Resolving);

        tracing::debug!(
            conn = %self.shared.id,
            "Connecting to {}:{}...",
            self.shared.config.host,
            self.shared.config.port
        );

        let task = runtime.spawn(drive(self.shared.clone(), epoch));
        self.shared.track(epoch, task);
        Ok(())
    }

    /// Closes the connection and destroys every registered callback.
    ///
    /// Safe to call any number of times, including before `connect()`.
    pub fn close(&self) {
        self.shared.teardown(ConnectionState::Closed);
    }

    /// Closes, then connects again.
    pub fn reconnect(&self) -> Result<(), ClientError> {
        self.close();
        self.connect()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.inner.lock().state
    }

    /// Returns whether the transport is open for writing.
    pub fn is_open(&self) -> bool {
        self.shared.inner.lock().writer.is_some()
    }

    /// Returns whether any connect attempt ever reached the ready state.
    pub fn was_connected(&self) -> bool {
        self.shared.inner.lock().was_connected
    }

    /// Wire format negotiated on the current connection.
    pub fn protocol_version(&self) -> WireVersion {
        self.shared.inner.lock().version
    }

    /// Starts building a command for `pageview_id`.
    pub fn command(&self, name: &str, pageview_id: i64) -> Command<'_> {
        Command::new(self, name, pageview_id)
    }

    /// Registers a callback without referencing it in a command.
    pub fn register_callback<C>(&self, pageview_id: i64, callback: C) -> CallbackHandle
    where
        C: Callback + 'static,
    {
        self.register_shared(pageview_id, share(callback))
    }

    /// Tells the server the callback is no longer needed and destroys it.
    ///
    /// Returns false if the callback was already gone.
    pub fn cancel_callback(&self, handle: CallbackHandle) -> bool {
        let removed = self.shared.inner.lock().registry.remove(handle);
        match removed {
            Some(handler) => {
                self.write(cancel_frame(handle.pageview_id(), handle.callback_id()));
                drop(handler);
                true
            }
            None => false,
        }
    }

    /// Returns whether the callback behind `handle` is still registered.
    pub fn is_registered(&self, handle: CallbackHandle) -> bool {
        self.shared.inner.lock().registry.contains(handle)
    }

    /// Server-side refcount of a registered callback.
    pub fn callback_refcount(&self, handle: CallbackHandle) -> Option<i64> {
        self.shared.inner.lock().registry.refcount(handle)
    }

    /// Number of registered callbacks across all pageviews.
    pub fn callback_count(&self) -> usize {
        self.shared.inner.lock().registry.len()
    }

    /// Lists registered callbacks, for debugging.
    pub fn callbacks(&self) -> Vec<CallbackInfo> {
        self.shared.inner.lock().registry.snapshot()
    }

    pub(crate) fn register_shared(
        &self,
        pageview_id: i64,
        handler: SharedCallback,
    ) -> CallbackHandle {
        self.shared.inner.lock().registry.register(pageview_id, handler)
    }

    pub(crate) fn rearm(&self, handle: CallbackHandle) -> bool {
        self.shared.inner.lock().registry.rearm(handle)
    }

    /// Queues a frame for the transport. Dropped silently if the transport
    /// is not open.
    pub(crate) fn write(&self, data: Bytes) {
        self.shared.write(data);
    }
}

impl Shared {
    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    /// Starts a new epoch: aborts the old attempt's tasks, releases the
    /// transport and destroys every callback.
    fn teardown(&self, next: ConnectionState) -> u64 {
        let (epoch, released) = {
            let mut inner = self.inner.lock();
            inner.epoch += 1;
            for task in inner.tasks.drain(..) {
                task.abort();
            }
            inner.writer = None;
            inner.faulted = false;
            inner.pong = PongTracker::default();
            inner.version = WireVersion::AwaitingVersion;
            inner.state = next;
            (inner.epoch, inner.registry.clear())
        };

        if !released.is_empty() {
            tracing::debug!(conn = %self.id, "Deregistered {} callbacks", released.len());
        }
        // handlers are dropped here, outside the lock
        drop(released);
        epoch
    }

    fn track(&self, epoch: u64, task: JoinHandle<()>) {
        let mut inner = self.inner.lock();
        if inner.epoch == epoch {
            inner.tasks.push(task);
        } else {
            task.abort();
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        let inner = self.inner.lock();
        inner.epoch == epoch && !inner.faulted
    }

    fn advance(&self, epoch: u64, state: ConnectionState) -> bool {
        let mut inner = self.inner.lock();
        if inner.epoch != epoch {
            return false;
        }
        inner.state = state;
        true
    }

    fn write(&self, data: Bytes) {
        let inner = self.inner.lock();
        match &inner.writer {
            Some(writer) => {
                tracing::trace!(conn = %self.id, ">> {}", readable(&data));
                let _ = writer.send(data);
            }
            None => {
                tracing::trace!(
                    conn = %self.id,
                    "transport not open, dropping {}",
                    readable(&data)
                );
            }
        }
    }

    /// Surfaces a fault, at most once per epoch.
    pub(crate) fn raise(&self, epoch: u64, fault: Fault) {
        let hook = {
            let mut inner = self.inner.lock();
            if inner.epoch != epoch || inner.faulted {
                tracing::debug!(conn = %self.id, "suppressing fault: {}", fault);
                return;
            }
            inner.faulted = true;
            inner.on_error.clone()
        };

        tracing::warn!(conn = %self.id, kind = %fault.kind, "{}", fault.message);
        if let Some(hook) = hook {
            tokio::spawn(async move { hook(fault) });
        }
    }

    /// One keepalive tick. `None` means the timer should not be rearmed.
    pub(crate) fn ping_tick(&self, epoch: u64) -> Option<Tick> {
        let mut inner = self.inner.lock();
        if inner.epoch != epoch || inner.faulted {
            return None;
        }
        let writer = inner.writer.clone()?;

        let tick = inner.pong.tick();
        if tick == Tick::SendPing {
            tracing::trace!(conn = %self.id, ">> ping");
            let _ = writer.send(ping_frame());
        }
        Some(tick)
    }

    /// Decodes and dispatches one frame. Returns false once the read loop
    /// must stop.
    fn process_frame(&self, epoch: u64, decoder: &mut ProtocolDecoder, frame: Bytes) -> bool {
        tracing::trace!(conn = %self.id, "<< {}", readable(&frame));

        if !self.is_current(epoch) {
            return false;
        }

        let frame = match decoder.decode(&frame) {
            Ok(frame) => frame,
            Err(e) => {
                self.raise(epoch, Fault::from(e));
                return false;
            }
        };

        let routed = {
            let mut inner = self.inner.lock();
            if inner.epoch != epoch {
                return false;
            }
            inner.version = decoder.version();

            match frame {
                Frame::Pong => {
                    if !inner.pong.is_pending() {
                        tracing::debug!(conn = %self.id, "unsolicited pong");
                    }
                    inner.pong.pong();
                    return true;
                }
                Frame::Update { url } => {
                    drop(inner);
                    tracing::info!(conn = %self.id, "Server instructed to update the client");
                    self.raise(epoch, Fault::protocol_version(url));
                    return false;
                }
                Frame::Announce { version } => {
                    tracing::debug!(conn = %self.id, version, "server announced protocol version");
                    return true;
                }
                Frame::Unknown(leading) => {
                    tracing::debug!(
                        conn = %self.id,
                        "ignoring frame with unknown leading token {}",
                        readable(&leading)
                    );
                    return true;
                }
                frame => dispatch::route(frame, &mut inner.registry),
            }
        };

        let mut released = routed.released;
        for delivery in routed.deliveries {
            if !self.is_current(epoch) {
                return false;
            }
            delivery.deliver();
        }

        if let Some(update) = routed.deferred {
            let mut inner = self.inner.lock();
            if inner.epoch != epoch {
                return false;
            }
            released.extend(update.apply(&mut inner.registry));
        }
        // destroyed handlers are dropped outside the lock
        drop(released);
        true
    }
}

/// Resolves, connects, sends the handshake and then becomes the read loop.
async fn drive(shared: Arc<Shared>, epoch: u64) {
    let config = &shared.config;

    let lookup = tokio::net::lookup_host((config.host.as_str(), config.port)).await;
    let addrs: Vec<SocketAddr> = match lookup {
        Ok(addrs) => addrs.collect(),
        Err(e) => {
            let msg = format!("Unable to resolve hostname {}: {}", config.host, e);
            shared.raise(epoch, Fault::network(msg));
            return;
        }
    };
    if addrs.is_empty() {
        let msg = format!("Unable to resolve hostname {}: no addresses", config.host);
        shared.raise(epoch, Fault::network(msg));
        return;
    }

    if !shared.advance(epoch, ConnectionState::Connecting) {
        return;
    }

    let stream = match connect_any(&shared, &addrs).await {
        Ok(stream) => stream,
        Err(last_error) => {
            let msg = format!(
                "Unable to connect to {}:{}: {}",
                config.host, config.port, last_error
            );
            shared.raise(epoch, Fault::network(msg));
            return;
        }
    };

    tracing::debug!(conn = %shared.id, "TCP connected, configuring socket");
    stream.set_nodelay(true).ok();
    let (reader, writer) = stream.into_split();

    let (tx, rx) = mpsc::unbounded_channel();
    let _ = tx.send(handshake(&config.client_version));

    let ready = {
        let mut inner = shared.inner.lock();
        if inner.epoch != epoch {
            return;
        }
        inner.state = ConnectionState::Ready;
        inner.was_connected = true;
        inner.writer = Some(tx);
        inner
            .tasks
            .push(tokio::spawn(write_loop(shared.clone(), epoch, writer, rx)));
        inner.tasks.push(tokio::spawn(keepalive::run(
            shared.clone(),
            epoch,
            config.ping_interval,
        )));
        inner.on_ready.clone()
    };

    tracing::debug!(conn = %shared.id, "Connection ready");
    if let Some(hook) = ready {
        hook();
    }

    read_loop(&shared, epoch, reader).await;
}

/// Tries each endpoint in order. Returns the last failure if none accepts.
async fn connect_any(shared: &Shared, addrs: &[SocketAddr]) -> Result<TcpStream, String> {
    let mut last_error = String::new();
    for (i, addr) in addrs.iter().enumerate() {
        let attempt = TcpStream::connect(addr);
        match tokio::time::timeout(shared.config.connect_timeout, attempt).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => last_error = format!("{}: {}", addr, e),
            Err(_) => last_error = format!("{}: timed out", addr),
        }
        if i + 1 < addrs.len() {
            tracing::info!(
                conn = %shared.id,
                "Unable to connect to '{}'; trying next endpoint",
                addr
            );
        }
    }
    Err(last_error)
}

async fn read_loop(shared: &Arc<Shared>, epoch: u64, mut reader: OwnedReadHalf) {
    let buffer_size = shared.config.read_buffer_size;
    let mut frames = FrameBuffer::with_capacity(buffer_size);
    let mut decoder = ProtocolDecoder::new();

    loop {
        let buf = frames.buffer_mut();
        buf.reserve(buffer_size);
        match reader.read_buf(buf).await {
            Ok(0) => {
                shared.raise(epoch, Fault::network("connection closed by server"));
                return;
            }
            Ok(n) => {
                tracing::trace!(conn = %shared.id, "read {} bytes", n);
            }
            Err(e) => {
                let msg = format!("Error while reading data: {}", e);
                shared.raise(epoch, Fault::network(msg));
                return;
            }
        }

        // drain everything buffered before reading again
        while let Some(frame) = frames.next_frame() {
            if !shared.process_frame(epoch, &mut decoder, frame) {
                return;
            }
        }
    }
}

async fn write_loop(
    shared: Arc<Shared>,
    epoch: u64,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
) {
    while let Some(data) = rx.recv().await {
        if let Err(e) = writer.write_all(&data).await {
            let msg = format!("Error while writing: {}", e);
            shared.raise(epoch, Fault::network(msg));
            return;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::from_fn;
    use crate::error::FaultKind;
    use ilmp_protocol::Tokens;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    const HANDSHAKE: &[u8] = b"GET /ilcs? ILMP/2.0\n\n";
    const WAIT: Duration = Duration::from_secs(5);

    type Log = Arc<Mutex<Vec<String>>>;

    struct Harness {
        conn: Connection,
        faults: mpsc::UnboundedReceiver<Fault>,
        ready: mpsc::UnboundedReceiver<()>,
    }

    fn harness(config: ConnectionConfig) -> Harness {
        let conn = Connection::new(config);
        let (fault_tx, faults) = mpsc::unbounded_channel();
        let (ready_tx, ready) = mpsc::unbounded_channel();
        conn.on_error(move |fault| {
            let _ = fault_tx.send(fault);
        });
        conn.on_ready(move || {
            let _ = ready_tx.send(());
        });
        Harness {
            conn,
            faults,
            ready,
        }
    }

    async fn listen() -> (TcpListener, ConnectionConfig) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, ConnectionConfig::new("127.0.0.1").with_port(port))
    }

    /// Connects and accepts, returning the server side after the handshake.
    async fn establish(listener: &TcpListener, h: &mut Harness) -> TcpStream {
        h.conn.connect().unwrap();
        let (mut server, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();

        let mut hello = vec![0u8; HANDSHAKE.len()];
        timeout(WAIT, server.read_exact(&mut hello))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hello, HANDSHAKE);

        timeout(WAIT, h.ready.recv()).await.unwrap().unwrap();
        server
    }

    /// Reads one frame, terminator included.
    async fn read_frame(server: &mut TcpStream) -> Vec<u8> {
        let mut frame = Vec::new();
        loop {
            let byte = timeout(WAIT, server.read_u8()).await.unwrap().unwrap();
            frame.push(byte);
            if byte == 0x01 {
                return frame;
            }
        }
    }

    async fn next_fault(h: &mut Harness) -> Fault {
        timeout(WAIT, h.faults.recv()).await.unwrap().unwrap()
    }

    fn recorder(log: &Log) -> impl FnMut(&mut Tokens<'_>) + Send + 'static {
        let log = log.clone();
        move |params: &mut Tokens<'_>| {
            let params: Vec<String> = params
                .map(|p| String::from_utf8_lossy(p).into_owned())
                .collect();
            log.lock().push(params.join(","));
        }
    }

    /// Waits until `log` holds `n` entries.
    async fn wait_for(log: &Log, n: usize) {
        timeout(WAIT, async {
            while log.lock().len() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_handshake_and_ready() {
        let (listener, config) = listen().await;
        let mut h = harness(config);
        assert_eq!(h.conn.state(), ConnectionState::Idle);
        assert!(!h.conn.was_connected());

        let _server = establish(&listener, &mut h).await;
        assert_eq!(h.conn.state(), ConnectionState::Ready);
        assert!(h.conn.is_open());
        assert!(h.conn.was_connected());

        h.conn.close();
        assert_eq!(h.conn.state(), ConnectionState::Closed);
        assert!(!h.conn.is_open());
        assert!(h.conn.was_connected());
    }

    #[tokio::test]
    async fn test_command_and_batch_delivery() {
        let (listener, config) = listen().await;
        let mut h = harness(config.with_site_dir("chat"));
        let mut server = establish(&listener, &mut h).await;

        let log = Log::default();
        h.conn
            .command("chat.join", 7)
            .plain("lob\x02by")
            .int(-2)
            .func(recorder(&log))
            .send();
        assert_eq!(
            read_frame(&mut server).await,
            b"7\x02Mchat|chat.join\x03plob\x052by\x03j-2\x03c1\x01"
        );

        server
            .write_all(b"ILMP\x022\x01m7\x021\x02hello\x04world\x021\x02again\x01")
            .await
            .unwrap();
        wait_for(&log, 2).await;

        assert_eq!(*log.lock(), vec!["hello,world", "again"]);
        assert_eq!(h.conn.protocol_version(), WireVersion::V2);
        h.conn.close();
    }

    #[tokio::test]
    async fn test_command_site_dir_override() {
        let (listener, config) = listen().await;
        let mut h = harness(config);
        let mut server = establish(&listener, &mut h).await;

        h.conn.command("ping", 1).send();
        assert_eq!(read_frame(&mut server).await, b"1\x02M127.0.0.1|ping\x01");

        h.conn.command("ping", 1).with_site_dir("other").send();
        assert_eq!(read_frame(&mut server).await, b"1\x02Mother|ping\x01");
        h.conn.close();
    }

    #[tokio::test]
    async fn test_legacy_sequence_gap_is_protocol_fault() {
        let (listener, config) = listen().await;
        let mut h = harness(config);
        let mut server = establish(&listener, &mut h).await;

        let log = Log::default();
        h.conn.register_callback(7, from_fn(recorder(&log)));

        server
            .write_all(
                b"1\x027\x021\x02\x02one\x01\
                  2\x027\x021\x02\x02two\x01\
                  4\x027\x021\x02\x02four\x01\
                  5\x027\x021\x02\x02five\x01",
            )
            .await
            .unwrap();

        let fault = next_fault(&mut h).await;
        assert_eq!(fault.kind, FaultKind::Protocol);
        assert_eq!(*log.lock(), vec!["one", "two"]);
        assert_eq!(h.conn.protocol_version(), WireVersion::V1);

        // reading stopped at the faulty frame
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(log.lock().len(), 2);
        assert!(h.faults.try_recv().is_err());
        h.conn.close();
    }

    #[tokio::test]
    async fn test_oversized_legacy_refcount_keeps_reading() {
        let (listener, config) = listen().await;
        let mut h = harness(config);
        let mut server = establish(&listener, &mut h).await;

        let log = Log::default();
        let handle = h.conn.register_callback(7, from_fn(recorder(&log)));

        server
            .write_all(
                b"1\x027\x021\x0299999999999999999999\x02a\x01\
                  2\x027\x021\x02+\x02b\x01\
                  3\x027\x021\x02-\x02c\x01",
            )
            .await
            .unwrap();

        wait_for(&log, 3).await;
        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
        assert!(h.faults.try_recv().is_err());
        assert_eq!(h.conn.callback_refcount(handle), Some(i64::MAX - 1));
        assert_eq!(h.conn.state(), ConnectionState::Ready);
        h.conn.close();
    }

    #[tokio::test]
    async fn test_legacy_handler_registered_during_final_message() {
        let (listener, config) = listen().await;
        let mut h = harness(config);
        let mut server = establish(&listener, &mut h).await;

        let slot: Arc<Mutex<Option<CallbackHandle>>> = Arc::default();
        let seen: Arc<Mutex<Vec<bool>>> = Arc::default();
        let handle = {
            let (slot, seen) = (slot.clone(), seen.clone());
            let conn = h.conn.clone();
            h.conn.register_callback(
                7,
                from_fn(move |_: &mut Tokens<'_>| {
                    if let Some(handle) = *slot.lock() {
                        seen.lock().push(conn.is_registered(handle));
                    }
                }),
            )
        };
        *slot.lock() = Some(handle);

        server
            .write_all(b"1\x027\x021\x02-\x02last\x01")
            .await
            .unwrap();

        timeout(WAIT, async {
            while h.conn.is_registered(handle) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(*seen.lock(), vec![true]);
        assert!(h.faults.try_recv().is_err());
        h.conn.close();
    }

    #[tokio::test]
    async fn test_update_demand_surfaces_url() {
        let (listener, config) = listen().await;
        let mut h = harness(config);
        let mut server = establish(&listener, &mut h).await;

        let log = Log::default();
        h.conn.register_callback(7, from_fn(recorder(&log)));

        server
            .write_all(b"ILMP\x022\x01U\x02http://example.com/update\x01m7\x021\x02late\x01")
            .await
            .unwrap();

        let fault = next_fault(&mut h).await;
        assert_eq!(fault.kind, FaultKind::ProtocolVersion);
        assert_eq!(fault.message, "http://example.com/update");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(log.lock().is_empty());
        h.conn.close();
    }

    #[tokio::test]
    async fn test_ping_timeout_raises_single_fault() {
        let (listener, config) = listen().await;
        let mut h = harness(config.with_ping_interval(Duration::from_millis(100)));
        let mut server = establish(&listener, &mut h).await;

        assert_eq!(read_frame(&mut server).await, b"P\x01");

        let fault = next_fault(&mut h).await;
        assert_eq!(fault, Fault::network("Ping/pong timeout"));

        // no further pings after the timeout
        let mut buf = [0u8; 16];
        assert!(timeout(Duration::from_millis(300), server.read(&mut buf))
            .await
            .is_err());
        assert!(h.faults.try_recv().is_err());
        h.conn.close();
    }

    #[tokio::test]
    async fn test_pong_keeps_connection_alive() {
        let (listener, config) = listen().await;
        let mut h = harness(config.with_ping_interval(Duration::from_millis(50)));
        let mut server = establish(&listener, &mut h).await;

        for _ in 0..4 {
            assert_eq!(read_frame(&mut server).await, b"P\x01");
            server.write_all(b"P\x01").await.unwrap();
        }

        assert!(h.faults.try_recv().is_err());
        assert_eq!(h.conn.state(), ConnectionState::Ready);
        h.conn.close();
    }

    #[tokio::test]
    async fn test_refused_connect_is_network_fault() {
        let (listener, config) = listen().await;
        let port = config.port;
        drop(listener);

        let mut h = harness(config);
        h.conn.connect().unwrap();

        let fault = next_fault(&mut h).await;
        assert_eq!(fault.kind, FaultKind::Network);
        assert!(fault
            .message
            .starts_with(&format!("Unable to connect to 127.0.0.1:{}", port)));
        assert!(!h.conn.was_connected());
    }

    /// Distinct addresses nothing listens on.
    async fn closed_addrs(n: usize) -> Vec<SocketAddr> {
        let mut listeners = Vec::new();
        for _ in 0..n {
            listeners.push(TcpListener::bind("127.0.0.1:0").await.unwrap());
        }
        listeners.iter().map(|l| l.local_addr().unwrap()).collect()
    }

    #[tokio::test]
    async fn test_connect_falls_back_to_next_endpoint() {
        let (listener, config) = listen().await;
        let live = listener.local_addr().unwrap();
        let dead = closed_addrs(1).await[0];
        let h = harness(config);

        let stream = connect_any(&h.conn.shared, &[dead, live]).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap(), live);
        let (_server, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_connect_reports_last_failure() {
        let (_listener, config) = listen().await;
        let dead = closed_addrs(2).await;
        let (first, second) = (dead[0], dead[1]);
        let h = harness(config);

        let err = connect_any(&h.conn.shared, &[first, second])
            .await
            .unwrap_err();
        assert!(err.starts_with(&second.to_string()));
        assert!(!err.contains(&first.to_string()));
    }

    #[tokio::test]
    async fn test_server_eof_is_network_fault() {
        let (listener, config) = listen().await;
        let mut h = harness(config);
        let server = establish(&listener, &mut h).await;
        drop(server);

        let fault = next_fault(&mut h).await;
        assert_eq!(fault, Fault::network("connection closed by server"));
    }

    #[tokio::test]
    async fn test_no_fault_after_close() {
        let (listener, config) = listen().await;
        let mut h = harness(config);
        let server = establish(&listener, &mut h).await;

        h.conn.close();
        drop(server);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.faults.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_callback_sends_cancel_frame() {
        let (listener, config) = listen().await;
        let mut h = harness(config);
        let mut server = establish(&listener, &mut h).await;

        let log = Log::default();
        let handle = h.conn.register_callback(3, from_fn(recorder(&log)));
        assert!(h.conn.cancel_callback(handle));
        assert_eq!(read_frame(&mut server).await, b"3\x02C1\x01");

        assert!(!h.conn.cancel_callback(handle));
        assert!(!h.conn.is_registered(handle));
        h.conn.close();
    }

    #[tokio::test]
    async fn test_handler_may_close_connection() {
        let (listener, config) = listen().await;
        let mut h = harness(config);
        let mut server = establish(&listener, &mut h).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let conn = h.conn.clone();
        h.conn
            .command("chat.join", 1)
            .func(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                conn.close();
            })
            .send();
        read_frame(&mut server).await;

        server
            .write_all(b"ILMP\x022\x01m1\x021\x02a\x021\x02b\x01")
            .await
            .unwrap();

        timeout(WAIT, async {
            while h.conn.state() != ConnectionState::Closed {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.conn.callback_count(), 0);
    }

    #[tokio::test]
    async fn test_reconnect_starts_fresh() {
        let (listener, config) = listen().await;
        let mut h = harness(config);
        let _first = establish(&listener, &mut h).await;

        let handle = h.conn.register_callback(1, from_fn(|_: &mut Tokens<'_>| {}));
        h.conn.reconnect().unwrap();
        assert!(!h.conn.is_registered(handle));

        let (mut server, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        let mut hello = vec![0u8; HANDSHAKE.len()];
        server.read_exact(&mut hello).await.unwrap();
        timeout(WAIT, h.ready.recv()).await.unwrap().unwrap();

        assert_eq!(h.conn.protocol_version(), WireVersion::AwaitingVersion);
        let fresh = h.conn.register_callback(1, from_fn(|_: &mut Tokens<'_>| {}));
        assert_eq!(fresh.callback_id(), 1);
        h.conn.close();
    }

    #[test]
    fn test_close_before_connect_is_noop() {
        let conn = Connection::new(ConnectionConfig::new("localhost"));
        conn.close();
        conn.close();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(!conn.was_connected());
        assert!(!conn.is_open());
    }

    #[test]
    fn test_close_destroys_callbacks() {
        struct Dropped(Arc<AtomicUsize>);
        impl Callback for Dropped {
            fn on_data(&mut self, _params: &mut Tokens<'_>) {}
        }
        impl Drop for Dropped {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let conn = Connection::new(ConnectionConfig::new("localhost"));
        let handles: Vec<_> = (1..=3)
            .map(|pv| conn.register_callback(pv, Dropped(drops.clone())))
            .collect();

        conn.close();
        assert_eq!(drops.load(Ordering::SeqCst), 3);
        assert!(handles.iter().all(|h| !conn.is_registered(*h)));
        assert!(!conn.cancel_callback(handles[0]));
    }

    #[test]
    fn test_connect_outside_runtime() {
        let conn = Connection::new(ConnectionConfig::new("localhost"));
        assert!(matches!(conn.connect(), Err(ClientError::NoRuntime(_))));
        assert_eq!(conn.state(), ConnectionState::Idle);
    }

    #[test]
    fn test_config_defaults() {
        let config = ConnectionConfig::new("chat.example.com");
        assert_eq!(config.port, 80);
        assert_eq!(config.effective_site_dir(), "chat.example.com");
        assert_eq!(config.client_version, "2.0");
        assert_eq!(config.ping_interval, Duration::from_secs(60));

        let config = config.with_site_dir("rooms").with_read_buffer_size(16);
        assert_eq!(config.effective_site_dir(), "rooms");
        assert_eq!(config.read_buffer_size, MIN_READ_BUFFER_SIZE);
    }
}
