use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::broadcast;

use crate::cancel::CancelToken;
use crate::datatypes::ConnectToPeerRequest;
use crate::error::PeerResult;
use crate::message_connection::MessageConnection;

struct Inner {
    connection: MessageConnection,
}

/// Login, room membership and search aggregation against the Soulseek
/// server are out of scope here; this only covers what the peer
/// connection manager needs from the server link.
#[derive(Clone)]
pub struct ServerConnection(Arc<Inner>);

impl ServerConnection {
    /// Wraps an already-connected, already-logged-in message connection.
    /// The caller is responsible for establishing and authenticating it.
    pub fn new(connection: MessageConnection) -> Self {
        ServerConnection(Arc::new(Inner { connection }))
    }

    pub async fn send_connect_to_peer_request(
        &self,
        token: u32,
        username: &str,
        conn_type: &str,
    ) -> PeerResult<()> {
        let request = ConnectToPeerRequest {
            token,
            username: username.to_string(),
            conn_type: conn_type.to_string(),
        };
        self.0
            .connection
            .send(request.encode(), &CancelToken::none())
            .await
    }

    /// Subscribes to raw inbound server frame bodies, for a caller-supplied
    /// handler to decode and act on (room chat, search results, etc. are
    /// all out of scope for this crate and left to that handler).
    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.0.connection.subscribe()
    }

    pub fn connection(&self) -> &MessageConnection {
        &self.0.connection
    }
}
