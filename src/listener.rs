use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};

use crate::error::{PeerError, PeerResult};
use crate::frame::HandshakeFrame;
use crate::pcm::PeerConnectionManager;

pub struct Listener {
    tcp: TcpListener,
    pcm: PeerConnectionManager,
}

impl Listener {
    pub async fn bind(addr: SocketAddr, pcm: PeerConnectionManager) -> std::io::Result<Self> {
        let tcp = TcpListener::bind(addr).await?;
        Ok(Listener { tcp, pcm })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.tcp.local_addr()
    }

    /// Runs the accept loop forever, spawning one handshake task per
    /// inbound socket so a slow or misbehaving peer can't stall accepting
    /// the next one.
    pub async fn run(self) {
        loop {
            let (stream, remote) = match self.tcp.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            };
            let pcm = self.pcm.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_inbound(stream, remote, pcm).await {
                    tracing::warn!(error = %e, %remote, "inbound handshake failed");
                }
            });
        }
    }
}

#[tracing::instrument(skip(stream, pcm), fields(%remote))]
async fn handle_inbound(
    mut stream: TcpStream,
    remote: SocketAddr,
    pcm: PeerConnectionManager,
) -> PeerResult<()> {
    let handshake = HandshakeFrame::read_from(&mut stream).await?;
    match handshake {
        HandshakeFrame::PeerInit {
            username,
            conn_type,
            token,
        } => match conn_type.as_str() {
            "P" | "D" => pcm.add_message_connection(username, stream, remote).await,
            "F" => pcm.add_transfer_connection(username, token, stream, remote).await,
            other => Err(PeerError::Protocol(format!(
                "unknown PeerInit connection type {other:?}"
            ))),
        },
        HandshakeFrame::PierceFirewall { token } => {
            pcm.complete_solicitation(token, stream, remote).await
        }
    }
}
