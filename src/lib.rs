//! Peer connection core for a Soulseek-protocol client: the binary
//! envelope codec, the raw and framed connection types, the direct/indirect
//! connection race, and the username-keyed peer connection cache.
//!
//! # Quick start
//!
//! ```no_run
//! use std::net::SocketAddr;
//! use slsk_peer::{CancelToken, PeerConnectionManager, ServerConnection};
//!
//! # async fn example(server: ServerConnection, endpoint: SocketAddr) -> slsk_peer::PeerResult<()> {
//! let pcm = PeerConnectionManager::new("my_username", server);
//! let cancel = CancelToken::new();
//! let connection = pcm.get_or_add("some_peer", endpoint, &cancel).await?;
//! let mut frames = connection.subscribe();
//! while let Ok(frame) = frames.recv().await {
//!     // decode `frame` with a `Reader` for the relevant code space
//!     let _ = frame;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`codec`] — wire code spaces and the `Writer`/`Reader` primitives.
//! - [`frame`] — the generic message envelope plus the two handshake frames.
//! - [`connection`] — the raw byte-oriented connection and its state machine.
//! - [`message_connection`] — frames built on top of a raw connection.
//! - [`waiter`] — token-keyed correlation between a request and its reply.
//! - [`listener`] — the inbound accept loop and handshake dispatch.
//! - [`pcm`] — the manager tying all of the above together.
//! - [`server_connection`] — the thin link to the Soulseek server.

pub mod cancel;
pub mod codec;
pub mod connection;
pub mod datatypes;
pub mod error;
pub mod frame;
pub mod listener;
pub mod message_connection;
pub mod pcm;
pub mod server_connection;
pub mod waiter;

#[cfg(test)]
mod tests;

pub use cancel::CancelToken;
pub use codec::{CodecError, DistributedCode, PeerCode, Reader, ServerCode, WireCode, Writer};
pub use connection::{
    Connection, ConnectionEvent, ConnectionOptions, ConnectionPath, ConnectionState, Direction,
};
pub use error::{PeerError, PeerResult};
pub use frame::{Frame, HandshakeFrame};
pub use listener::Listener;
pub use message_connection::MessageConnection;
pub use pcm::PeerConnectionManager;
pub use server_connection::ServerConnection;
pub use waiter::{WaitKey, WaitKeyPart, Waiter};

/// Convenience alias matching the error type most call sites actually use.
pub type Error = PeerError;
pub type Result<T> = std::result::Result<T, Error>;
