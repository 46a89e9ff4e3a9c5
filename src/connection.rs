// ABOUTME: The raw byte-oriented peer connection: state machine, 250ms liveness watchdog,
// ABOUTME: inactivity timeout and serialized writes. MessageConnection builds frames on top of this.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex as AsyncMutex, RwLock, broadcast, watch};
use tokio::task::JoinHandle;

use crate::cancel::CancelToken;
use crate::error::{PeerError, PeerResult};

const WATCHDOG_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Pending,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPath {
    Direct,
    Indirect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected(Option<String>),
    ReadProgress { bytes_so_far: usize, total: usize },
    WriteProgress { bytes_so_far: usize, total: usize },
}

/// Tunable knobs for a single connection. Mirrors the shape of the
/// teacher's `KeepAliveConfig`: a `Default` plus fluent `with_*` setters.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub connect_timeout: Duration,
    /// Zero disables the inactivity timer.
    pub inactivity_timeout: Duration,
    pub read_chunk_size: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ConnectionOptions {
            connect_timeout: Duration::from_secs(10),
            inactivity_timeout: Duration::from_secs(60),
            read_chunk_size: 16 * 1024,
        }
    }
}

impl ConnectionOptions {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    pub fn with_read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size;
        self
    }
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

struct Inner {
    id: u64,
    remote: SocketAddr,
    options: ConnectionOptions,
    direction: Direction,
    path: ConnectionPath,
    state: RwLock<ConnectionState>,
    socket: StdMutex<Option<Arc<TcpStream>>>,
    write_lock: AsyncMutex<()>,
    events: broadcast::Sender<ConnectionEvent>,
    activity: watch::Sender<Instant>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

/// A raw, already-framed-at-the-byte-level connection to a peer.
///
/// Cheap to clone: every clone shares the same underlying socket, state
/// and background tasks. This is what lets the watchdog and inactivity
/// timers call back into `disconnect` without a separate handle type.
#[derive(Clone)]
pub struct Connection(Arc<Inner>);

impl Connection {
    fn build(
        remote: SocketAddr,
        options: ConnectionOptions,
        direction: Direction,
        path: ConnectionPath,
        initial_state: ConnectionState,
    ) -> Self {
        let (events, _) = broadcast::channel(32);
        let (activity, _) = watch::channel(Instant::now());
        Connection(Arc::new(Inner {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            remote,
            options,
            direction,
            path,
            state: RwLock::new(initial_state),
            socket: StdMutex::new(None),
            write_lock: AsyncMutex::new(()),
            events,
            activity,
            tasks: StdMutex::new(Vec::new()),
        }))
    }

    /// A not-yet-connected outbound connection. Call [`connect`](Self::connect)
    /// to establish it.
    pub fn new(
        remote: SocketAddr,
        options: ConnectionOptions,
        direction: Direction,
        path: ConnectionPath,
    ) -> Self {
        Self::build(remote, options, direction, path, ConnectionState::Pending)
    }

    /// Wraps an already-open socket (e.g. one just accepted by a
    /// [`crate::listener::Listener`]). Skips `Connecting` entirely and
    /// starts the watchdog/inactivity timers immediately.
    pub fn from_socket(
        socket: TcpStream,
        remote: SocketAddr,
        options: ConnectionOptions,
        direction: Direction,
        path: ConnectionPath,
    ) -> Self {
        let conn = Self::build(remote, options, direction, path, ConnectionState::Connected);
        conn.install_socket(socket);
        conn
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn remote(&self) -> SocketAddr {
        self.0.remote
    }

    pub fn direction(&self) -> Direction {
        self.0.direction
    }

    pub fn path(&self) -> ConnectionPath {
        self.0.path
    }

    pub async fn state(&self) -> ConnectionState {
        *self.0.state.read().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.0.events.subscribe()
    }

    async fn set_state(&self, state: ConnectionState) {
        *self.0.state.write().await = state;
    }

    fn install_socket(&self, socket: TcpStream) {
        let socket = Arc::new(socket);
        *self.0.socket.lock().unwrap() = Some(socket.clone());
        self.spawn_watchdog(socket.clone());
        if !self.0.options.inactivity_timeout.is_zero() {
            self.spawn_inactivity_timer();
        }
        let _ = self.0.events.send(ConnectionEvent::Connected);
    }

    fn spawn_watchdog(&self, socket: Arc<TcpStream>) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut probe = [0u8; 1];
            loop {
                tokio::time::sleep(WATCHDOG_INTERVAL).await;
                if this.state().await != ConnectionState::Connected {
                    return;
                }
                match socket.peek(&mut probe).await {
                    Ok(0) => {
                        this.disconnect(Some("closed unexpectedly")).await;
                        return;
                    }
                    Ok(_) => continue,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                    Err(_) => {
                        this.disconnect(Some("closed unexpectedly")).await;
                        return;
                    }
                }
            }
        });
        self.0.tasks.lock().unwrap().push(handle);
    }

    fn spawn_inactivity_timer(&self) {
        let this = self.clone();
        let timeout = self.0.options.inactivity_timeout;
        let mut activity_rx = self.0.activity.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                let deadline = *activity_rx.borrow() + timeout;
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline.into()) => {
                        if this.state().await == ConnectionState::Connected {
                            this.disconnect(Some("inactivity timeout")).await;
                        }
                        return;
                    }
                    changed = activity_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
        });
        self.0.tasks.lock().unwrap().push(handle);
    }

    fn mark_active(&self) {
        let _ = self.0.activity.send(Instant::now());
    }

    fn socket_handle(&self) -> PeerResult<Arc<TcpStream>> {
        self.0
            .socket
            .lock()
            .unwrap()
            .clone()
            .ok_or(PeerError::InvalidState(ConnectionState::Disconnected))
    }

    /// Connects to `remote`, racing the supplied cancellation token and the
    /// configured connect timeout.
    #[tracing::instrument(skip(self, cancel), fields(connection_id = self.0.id, remote = %self.0.remote))]
    pub async fn connect(&self, cancel: &CancelToken) -> PeerResult<()> {
        {
            let state = self.state().await;
            if state != ConnectionState::Pending {
                return Err(PeerError::InvalidState(state));
            }
        }
        self.set_state(ConnectionState::Connecting).await;

        tokio::select! {
            _ = cancel.cancelled() => {
                self.set_state(ConnectionState::Disconnected).await;
                Err(PeerError::Cancelled)
            }
            _ = tokio::time::sleep(self.0.options.connect_timeout) => {
                self.set_state(ConnectionState::Disconnected).await;
                Err(PeerError::Timeout)
            }
            result = TcpStream::connect(self.0.remote) => {
                match result {
                    Ok(socket) => {
                        self.set_state(ConnectionState::Connected).await;
                        self.install_socket(socket);
                        Ok(())
                    }
                    Err(e) => {
                        self.set_state(ConnectionState::Disconnected).await;
                        Err(PeerError::Connect(e.to_string()))
                    }
                }
            }
        }
    }

    /// Reads exactly `n` bytes, racing `cancel`.
    #[tracing::instrument(skip(self, cancel), fields(connection_id = self.0.id, n))]
    pub async fn read(&self, n: usize, cancel: &CancelToken) -> PeerResult<Bytes> {
        if self.state().await != ConnectionState::Connected {
            return Err(PeerError::InvalidState(self.state().await));
        }
        let socket = self.socket_handle()?;
        let chunk_size = self.0.options.read_chunk_size.max(1);
        let mut buf = vec![0u8; n];
        let mut filled = 0;
        while filled < n {
            let end = (filled + chunk_size).min(n);
            tokio::select! {
                _ = cancel.cancelled() => return Err(PeerError::Cancelled),
                result = (&*socket).read(&mut buf[filled..end]) => {
                    match result {
                        Ok(0) => {
                            self.disconnect(Some("remote connection closed")).await;
                            return Err(PeerError::Read("remote closed the connection".into()));
                        }
                        Ok(read) => {
                            filled += read;
                            self.mark_active();
                            let _ = self.0.events.send(ConnectionEvent::ReadProgress {
                                bytes_so_far: filled,
                                total: n,
                            });
                        }
                        Err(e) => {
                            self.disconnect(Some(&e.to_string())).await;
                            return Err(PeerError::Read(e.to_string()));
                        }
                    }
                }
            }
        }
        Ok(Bytes::from(buf))
    }

    /// Writes the entire buffer, serialized against concurrent writers on
    /// this connection, racing `cancel`.
    #[tracing::instrument(skip(self, data, cancel), fields(connection_id = self.0.id, len = data.len()))]
    pub async fn write(&self, data: &[u8], cancel: &CancelToken) -> PeerResult<()> {
        if self.state().await != ConnectionState::Connected {
            return Err(PeerError::InvalidState(self.state().await));
        }
        let socket = self.socket_handle()?;
        let _guard = self.0.write_lock.lock().await;
        let mut written = 0;
        while written < data.len() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(PeerError::Cancelled),
                result = (&*socket).write(&data[written..]) => {
                    match result {
                        Ok(0) => {
                            self.disconnect(Some("remote connection closed")).await;
                            return Err(PeerError::Write("remote closed the connection".into()));
                        }
                        Ok(n) => {
                            written += n;
                            self.mark_active();
                            let _ = self.0.events.send(ConnectionEvent::WriteProgress {
                                bytes_so_far: written,
                                total: data.len(),
                            });
                        }
                        Err(e) => {
                            self.disconnect(Some(&e.to_string())).await;
                            return Err(PeerError::Write(e.to_string()));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Idempotent: disconnecting an already-disconnected connection is a no-op.
    pub async fn disconnect(&self, reason: Option<&str>) {
        {
            let state = self.state().await;
            if matches!(
                state,
                ConnectionState::Disconnecting | ConnectionState::Disconnected
            ) {
                return;
            }
        }
        self.set_state(ConnectionState::Disconnecting).await;
        for handle in self.0.tasks.lock().unwrap().drain(..) {
            handle.abort();
        }
        *self.0.socket.lock().unwrap() = None;
        self.set_state(ConnectionState::Disconnected).await;
        let _ = self
            .0
            .events
            .send(ConnectionEvent::Disconnected(reason.map(str::to_string)));
    }
}
