// ABOUTME: PeerConnectionManager: the username-keyed connection cache, the direct/indirect
// ABOUTME: connection race, supersession, transfer rendezvous and pending-solicitation bookkeeping

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{Notify, RwLock};

use crate::cancel::CancelToken;
use crate::connection::{Connection, ConnectionEvent, ConnectionOptions, ConnectionPath, Direction};
use crate::error::{PeerError, PeerResult};
use crate::frame::HandshakeFrame;
use crate::message_connection::MessageConnection;
use crate::server_connection::ServerConnection;
use crate::wait_key;
use crate::waiter::Waiter;

const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

enum CacheSlot {
    /// Someone is establishing the connection; later lookups wait on the
    /// `Notify` and then re-check the cache.
    Establishing(Arc<Notify>),
    Ready(MessageConnection),
}

struct Inner {
    local_username: String,
    cache: RwLock<HashMap<String, CacheSlot>>,
    pending_solicitations: StdMutex<HashMap<u32, String>>,
    next_token: AtomicU32,
    waiter: Waiter,
    server: ServerConnection,
    connection_options: ConnectionOptions,
}

/// Owns the username-keyed cache of message connections to peers, races
/// direct-vs-indirect connection attempts, and correlates inbound
/// `PierceFirewall`/transfer sockets back to the request that solicited
/// them.
#[derive(Clone)]
pub struct PeerConnectionManager(Arc<Inner>);

impl PeerConnectionManager {
    pub fn new(local_username: impl Into<String>, server: ServerConnection) -> Self {
        PeerConnectionManager(Arc::new(Inner {
            local_username: local_username.into(),
            cache: RwLock::new(HashMap::new()),
            pending_solicitations: StdMutex::new(HashMap::new()),
            next_token: AtomicU32::new(1),
            waiter: Waiter::new(DEFAULT_WAIT_TIMEOUT),
            server,
            connection_options: ConnectionOptions::default(),
        }))
    }

    fn next_token(&self) -> u32 {
        self.0.next_token.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns the cached message connection to `username`, establishing
    /// one (racing a direct dial against a server-mediated indirect
    /// rendezvous) if none exists yet.
    #[tracing::instrument(skip(self, cancel), fields(%username, %endpoint))]
    pub async fn get_or_add(
        &self,
        username: &str,
        endpoint: SocketAddr,
        cancel: &CancelToken,
    ) -> PeerResult<MessageConnection> {
        loop {
            {
                let cache = self.0.cache.read().await;
                match cache.get(username) {
                    Some(CacheSlot::Ready(mc)) => return Ok(mc.clone()),
                    Some(CacheSlot::Establishing(notify)) => {
                        let notify = notify.clone();
                        drop(cache);
                        notify.notified().await;
                        continue;
                    }
                    None => {}
                }
            }

            let notify = Arc::new(Notify::new());
            {
                let mut cache = self.0.cache.write().await;
                match cache.get(username) {
                    Some(CacheSlot::Ready(mc)) => return Ok(mc.clone()),
                    Some(CacheSlot::Establishing(_)) => continue,
                    None => {
                        cache.insert(username.to_string(), CacheSlot::Establishing(notify.clone()));
                    }
                }
            }

            let result = self.establish_outbound(username, endpoint, cancel).await;
            let mut cache = self.0.cache.write().await;
            match &result {
                Ok(mc) => {
                    cache.insert(username.to_string(), CacheSlot::Ready(mc.clone()));
                    drop(cache);
                    self.spawn_cache_eviction(username.to_string(), mc.clone());
                    notify.notify_waiters();
                    return result;
                }
                Err(_) => {
                    cache.remove(username);
                }
            }
            drop(cache);
            notify.notify_waiters();
            return result;
        }
    }

    /// Removes `username`'s cache entry once its connection disconnects on
    /// its own (inactivity timeout, watchdog, read/write error) — the only
    /// other removal paths are `establish_outbound` failure and `dispose`.
    /// Guards against removing a *newer* connection that superseded this one
    /// in the meantime by checking the cached entry is still this exact one.
    fn spawn_cache_eviction(&self, username: String, mc: MessageConnection) {
        let this = self.clone();
        let conn_id = mc.connection().id();
        let mut events = mc.connection().subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ConnectionEvent::Disconnected(_)) => break,
                    Ok(_) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            let mut cache = this.0.cache.write().await;
            if let Some(CacheSlot::Ready(cached)) = cache.get(&username) {
                if cached.connection().id() == conn_id {
                    cache.remove(&username);
                }
            }
        });
    }

    async fn establish_outbound(
        &self,
        username: &str,
        endpoint: SocketAddr,
        cancel: &CancelToken,
    ) -> PeerResult<MessageConnection> {
        let direct_conn = Connection::new(
            endpoint,
            self.0.connection_options.clone(),
            Direction::Outbound,
            ConnectionPath::Direct,
        );
        let direct = direct_conn.connect(cancel);

        let token = self.next_token();
        let indirect = self.solicit_indirect(username, token, cancel);

        tokio::pin!(direct);
        tokio::pin!(indirect);

        let outcome = tokio::select! {
            direct_result = &mut direct => {
                match direct_result {
                    Ok(()) => Outbound::Direct,
                    Err(direct_err) => match indirect.await {
                        Ok((stream, remote)) => Outbound::Indirect(stream, remote),
                        Err(indirect_err) => {
                            return Err(PeerError::Connect(format!(
                                "direct failed ({direct_err}) and indirect failed ({indirect_err})"
                            )));
                        }
                    },
                }
            }
            indirect_result = &mut indirect => {
                match indirect_result {
                    Ok((stream, remote)) => Outbound::Indirect(stream, remote),
                    Err(indirect_err) => match direct.await {
                        Ok(()) => Outbound::Direct,
                        Err(direct_err) => {
                            return Err(PeerError::Connect(format!(
                                "indirect failed ({indirect_err}) and direct failed ({direct_err})"
                            )));
                        }
                    },
                }
            }
        };

        match outcome {
            // `direct_conn` is still borrowed by the (completed) `direct`
            // future pinned above, so hand finish_direct a clone rather
            // than moving it out from under that borrow.
            Outbound::Direct => self.finish_direct(direct_conn.clone(), username).await,
            Outbound::Indirect(stream, remote) => {
                self.finish_indirect(stream, remote, username).await
            }
        }
    }

    /// Registers the pending solicitation, sends the request, and waits for
    /// the matching `PierceFirewall` to resolve it. The pending-solicitation
    /// entry is released on every exit path — success, timeout, cancel, or
    /// this future simply being dropped because the direct attempt won the
    /// race first — via the `_guard`'s `Drop` impl.
    async fn solicit_indirect(
        &self,
        username: &str,
        token: u32,
        cancel: &CancelToken,
    ) -> PeerResult<(TcpStream, SocketAddr)> {
        self.0
            .pending_solicitations
            .lock()
            .unwrap()
            .insert(token, username.to_string());
        let _guard = PendingSolicitationGuard { inner: &self.0, token };

        self.0
            .server
            .send_connect_to_peer_request(token, username, "P")
            .await?;
        let key = wait_key!("SolicitedPeerConnection", username, token);
        self.0.waiter.wait(key, None, cancel).await
    }

    async fn finish_direct(
        &self,
        conn: Connection,
        username: &str,
    ) -> PeerResult<MessageConnection> {
        let init = HandshakeFrame::PeerInit {
            username: self.0.local_username.clone(),
            conn_type: "P".to_string(),
            token: self.next_token(),
        };
        conn.write(&init.to_bytes(), &CancelToken::none()).await?;
        let mc = MessageConnection::new(conn, username.to_string());
        mc.start_continuous_read();
        Ok(mc)
    }

    async fn finish_indirect(
        &self,
        stream: TcpStream,
        remote: SocketAddr,
        username: &str,
    ) -> PeerResult<MessageConnection> {
        let conn = Connection::from_socket(
            stream,
            remote,
            self.0.connection_options.clone(),
            Direction::Outbound,
            ConnectionPath::Indirect,
        );
        let mc = MessageConnection::new(conn, username.to_string());
        mc.start_continuous_read();
        Ok(mc)
    }

    /// Registers an unsolicited inbound message connection, superseding
    /// (and disconnecting) whatever was previously cached for this
    /// username. The most-recently-established connection always wins.
    pub async fn add_message_connection(
        &self,
        username: String,
        stream: TcpStream,
        remote: SocketAddr,
    ) -> PeerResult<()> {
        let conn = Connection::from_socket(
            stream,
            remote,
            self.0.connection_options.clone(),
            Direction::Inbound,
            ConnectionPath::Direct,
        );
        let mc = MessageConnection::new(conn, username.clone());
        mc.start_continuous_read();

        let mut cache = self.0.cache.write().await;
        let previous = cache.insert(username.clone(), CacheSlot::Ready(mc.clone()));
        drop(cache);
        self.spawn_cache_eviction(username, mc);
        if let Some(CacheSlot::Ready(previous)) = previous {
            previous
                .connection()
                .disconnect(Some("superseded by a newer connection"))
                .await;
        }
        Ok(())
    }

    /// Opens (or accepts) a raw transfer connection for `token`, racing
    /// direct vs. indirect exactly like `get_or_add`, but never caching
    /// the result: transfer connections are single-use.
    pub async fn get_transfer(
        &self,
        username: &str,
        endpoint: SocketAddr,
        token: u32,
        cancel: &CancelToken,
    ) -> PeerResult<Connection> {
        let direct_conn = Connection::new(
            endpoint,
            self.0.connection_options.clone(),
            Direction::Outbound,
            ConnectionPath::Direct,
        );
        let direct = direct_conn.connect(cancel);
        let indirect = self.solicit_indirect_transfer(username, token, cancel);

        tokio::pin!(direct);
        tokio::pin!(indirect);

        let conn = tokio::select! {
            direct_result = &mut direct => {
                match direct_result {
                    Ok(()) => {
                        let init = HandshakeFrame::PeerInit {
                            username: self.0.local_username.clone(),
                            conn_type: "F".to_string(),
                            token,
                        };
                        direct_conn.write(&init.to_bytes(), cancel).await?;
                        direct_conn.write(&token.to_le_bytes(), cancel).await?;
                        direct_conn.clone()
                    }
                    Err(direct_err) => match indirect.await {
                        Ok((stream, remote)) => {
                            let conn = Connection::from_socket(
                                stream,
                                remote,
                                self.0.connection_options.clone(),
                                Direction::Outbound,
                                ConnectionPath::Indirect,
                            );
                            conn.write(&token.to_le_bytes(), cancel).await?;
                            conn
                        }
                        Err(indirect_err) => {
                            return Err(PeerError::Connect(format!(
                                "direct failed ({direct_err}) and indirect failed ({indirect_err})"
                            )));
                        }
                    },
                }
            }
            indirect_result = &mut indirect => {
                match indirect_result {
                    Ok((stream, remote)) => {
                        let conn = Connection::from_socket(
                            stream,
                            remote,
                            self.0.connection_options.clone(),
                            Direction::Outbound,
                            ConnectionPath::Indirect,
                        );
                        conn.write(&token.to_le_bytes(), cancel).await?;
                        conn
                    }
                    Err(indirect_err) => match direct.await {
                        Ok(()) => {
                            let init = HandshakeFrame::PeerInit {
                                username: self.0.local_username.clone(),
                                conn_type: "F".to_string(),
                                token,
                            };
                            direct_conn.write(&init.to_bytes(), cancel).await?;
                            direct_conn.write(&token.to_le_bytes(), cancel).await?;
                            direct_conn.clone()
                        }
                        Err(direct_err) => {
                            return Err(PeerError::Connect(format!(
                                "indirect failed ({indirect_err}) and direct failed ({direct_err})"
                            )));
                        }
                    },
                }
            }
        };

        Ok(conn)
    }

    async fn solicit_indirect_transfer(
        &self,
        username: &str,
        token: u32,
        cancel: &CancelToken,
    ) -> PeerResult<(TcpStream, SocketAddr)> {
        self.0
            .pending_solicitations
            .lock()
            .unwrap()
            .insert(token, username.to_string());
        let _guard = PendingSolicitationGuard { inner: &self.0, token };

        self.0
            .server
            .send_connect_to_peer_request(token, username, "F")
            .await?;
        let key = wait_key!("SolicitedPeerConnection", username, token);
        self.0.waiter.wait(key, None, cancel).await
    }

    /// Handles an inbound `"F"`-type `PeerInit`: the remote token isn't the
    /// `PeerInit`'s own token but a further 4 bytes read off the socket
    /// immediately after the handshake.
    pub async fn add_transfer_connection(
        &self,
        username: String,
        _peer_init_token: u32,
        stream: TcpStream,
        remote: SocketAddr,
    ) -> PeerResult<()> {
        let conn = Connection::from_socket(
            stream,
            remote,
            self.0.connection_options.clone(),
            Direction::Inbound,
            ConnectionPath::Direct,
        );
        let token_bytes = conn.read(4, &CancelToken::none()).await?;
        let remote_token = u32::from_le_bytes(token_bytes[0..4].try_into().unwrap());
        let key = wait_key!("DirectTransfer", username, remote_token);
        self.0.waiter.complete(key, conn);
        Ok(())
    }

    /// Waits for a peer to dial us directly for a transfer identified by
    /// `token`, as arranged out-of-band over an existing message
    /// connection. Completed by [`add_transfer_connection`](Self::add_transfer_connection).
    pub async fn get_inbound_transfer(
        &self,
        username: &str,
        token: u32,
        cancel: &CancelToken,
    ) -> PeerResult<Connection> {
        let key = wait_key!("DirectTransfer", username, token);
        self.0.waiter.wait(key, None, cancel).await
    }

    /// Handles an inbound `PierceFirewall`: completes the wait installed
    /// by `solicit_indirect`/`solicit_indirect_transfer` for this token.
    pub async fn complete_solicitation(
        &self,
        token: u32,
        stream: TcpStream,
        remote: SocketAddr,
    ) -> PeerResult<()> {
        let username = self
            .0
            .pending_solicitations
            .lock()
            .unwrap()
            .remove(&token);
        match username {
            Some(username) => {
                let key = wait_key!("SolicitedPeerConnection", username, token);
                self.0.waiter.complete(key, (stream, remote));
                Ok(())
            }
            None => Err(PeerError::Protocol(format!(
                "PierceFirewall for unknown token {token}"
            ))),
        }
    }

    /// Tears down every cached connection and fails every pending wait.
    /// Safe to call more than once.
    pub async fn dispose(&self) {
        self.0.pending_solicitations.lock().unwrap().clear();
        self.0.waiter.cancel_all();
        let mut cache = self.0.cache.write().await;
        for (_, slot) in cache.drain() {
            if let CacheSlot::Ready(mc) = slot {
                mc.connection()
                    .disconnect(Some("peer connection manager disposed"))
                    .await;
            }
        }
    }
}

enum Outbound {
    Direct,
    Indirect(TcpStream, SocketAddr),
}

/// Scope-exit guard for a pending-solicitation entry: removed on every exit
/// path, including the indirect future being dropped un-polled because the
/// direct attempt won the race.
struct PendingSolicitationGuard<'a> {
    inner: &'a Inner,
    token: u32,
}

impl Drop for PendingSolicitationGuard<'_> {
    fn drop(&mut self) {
        self.inner.pending_solicitations.lock().unwrap().remove(&self.token);
    }
}
