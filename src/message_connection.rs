// ABOUTME: Wraps a raw Connection with the length-prefixed frame loop and a broadcast channel
// ABOUTME: of decoded frame bodies; this is what peers and the server actually exchange messages over

use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use bytes::Bytes;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::cancel::CancelToken;
use crate::connection::Connection;
use crate::error::PeerResult;

type SyncHandler = dyn Fn(&Bytes) + Send + Sync;

struct Inner {
    connection: Connection,
    username: String,
    message_tx: broadcast::Sender<Bytes>,
    sync_handler: StdMutex<Option<Arc<SyncHandler>>>,
    reader_task: StdMutex<Option<JoinHandle<()>>>,
}

/// A `Connection` plus the identity (username) of the peer at the other
/// end and a continuous background reader that turns the byte stream
/// into a sequence of length-prefixed frame bodies.
#[derive(Clone)]
pub struct MessageConnection(Arc<Inner>);

impl MessageConnection {
    pub fn new(connection: Connection, username: String) -> Self {
        let (message_tx, _) = broadcast::channel(128);
        MessageConnection(Arc::new(Inner {
            connection,
            username,
            message_tx,
            sync_handler: StdMutex::new(None),
            reader_task: StdMutex::new(None),
        }))
    }

    pub fn connection(&self) -> &Connection {
        &self.0.connection
    }

    pub fn username(&self) -> &str {
        &self.0.username
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.0.message_tx.subscribe()
    }

    /// Registers a hook invoked synchronously, inline in the reader task,
    /// before a frame is broadcast to subscribers. Used for messages that
    /// must be handled before any queued subscriber sees them.
    pub fn set_sync_handler<F>(&self, handler: F)
    where
        F: Fn(&Bytes) + Send + Sync + 'static,
    {
        *self.0.sync_handler.lock().unwrap() = Some(Arc::new(handler));
    }

    /// Spawns the background task that reads `uint32 length` + `length`
    /// bytes in a loop and broadcasts each decoded body. A connection-level
    /// read error (including EOF) ends the loop silently; the underlying
    /// `Connection` has already transitioned to `Disconnected` by then.
    pub fn start_continuous_read(&self) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let cancel = CancelToken::none();
            loop {
                let frame = match this.read_one_frame(&cancel).await {
                    Ok(frame) => frame,
                    Err(_) => return,
                };
                if let Some(handler) = this.0.sync_handler.lock().unwrap().clone() {
                    handler(&frame);
                }
                let _ = this.0.message_tx.send(frame);
            }
        });
        *self.0.reader_task.lock().unwrap() = Some(handle);
    }

    async fn read_one_frame(&self, cancel: &CancelToken) -> PeerResult<Bytes> {
        let len_bytes = self.0.connection.read(4, cancel).await?;
        let len = u32::from_le_bytes(len_bytes[0..4].try_into().unwrap()) as usize;
        self.0.connection.read(len, cancel).await
    }

    /// Sends a fully-built frame (length prefix included).
    pub async fn send(&self, frame: Bytes, cancel: &CancelToken) -> PeerResult<()> {
        self.0.connection.write(&frame, cancel).await
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(handle) = self.reader_task.lock().unwrap().take() {
            handle.abort();
        }
    }
}
