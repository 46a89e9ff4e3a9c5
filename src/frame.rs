//! The generic `Frame<C>` envelope plus the two handshake frames exchanged
//! before a connection is handed to a `Listener` or `PeerConnectionManager`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::{CodecError, Reader, WireCode};

/// A decoded message: its code plus the unread remainder of the body.
/// Callers continue reading typed fields off `payload` with a `Reader`.
pub struct Frame<C> {
    pub code: C,
    pub payload: Bytes,
}

impl<C: WireCode> Frame<C> {
    /// `body` is the frame body *without* the leading 4-byte length prefix
    /// (i.e. starting at the code field), as produced by reading exactly
    /// `length` bytes off a `Connection`.
    pub fn decode(body: Bytes) -> Result<Self, CodecError> {
        let mut reader = Reader::<C>::new(body);
        let code = reader.read_code()?;
        let payload = reader.read_remaining();
        Ok(Frame { code, payload })
    }
}

/// The unsolicited handshake frames a peer may open a direct connection
/// with. Neither belongs to the Server/Peer/Distributed code spaces: each
/// has its own single-byte code and no length-prefixed code word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeFrame {
    /// `PeerInit(username, type, token)`: an unsolicited direct connection.
    /// `conn_type` is one of `"P"` (peer messages), `"F"` (file transfer) or
    /// `"D"` (distributed search, handled like `"P"`).
    PeerInit {
        username: String,
        conn_type: String,
        token: u32,
    },
    /// `PierceFirewall(token)`: completes a solicited connection a peer
    /// opened in response to our `ConnectToPeerRequest`.
    PierceFirewall { token: u32 },
}

const PEER_INIT_CODE: u8 = 1;
const PIERCE_FIREWALL_CODE: u8 = 0;

impl HandshakeFrame {
    pub fn to_bytes(&self) -> Bytes {
        let mut body = BytesMut::new();
        match self {
            HandshakeFrame::PierceFirewall { token } => {
                body.put_u8(PIERCE_FIREWALL_CODE);
                body.put_u32_le(*token);
            }
            HandshakeFrame::PeerInit {
                username,
                conn_type,
                token,
            } => {
                body.put_u8(PEER_INIT_CODE);
                body.put_u32_le(username.len() as u32);
                body.put_slice(username.as_bytes());
                body.put_u32_le(conn_type.len() as u32);
                body.put_slice(conn_type.as_bytes());
                body.put_u32_le(*token);
            }
        }
        let mut framed = BytesMut::with_capacity(4 + body.len());
        framed.put_u32_le(body.len() as u32);
        framed.put_slice(&body);
        framed.freeze()
    }

    /// Reads one handshake frame directly off a raw, just-accepted socket.
    /// Used only before a socket is wrapped in a [`crate::connection::Connection`].
    #[tracing::instrument(skip(stream))]
    pub async fn read_from<S>(stream: &mut S) -> Result<Self, CodecError>
    where
        S: AsyncRead + Unpin,
    {
        let mut len_buf = [0u8; 4];
        read_exact_or_truncated(stream, &mut len_buf, 4).await?;
        let len = u32::from_le_bytes(len_buf) as usize;

        let mut body = vec![0u8; len];
        read_exact_or_truncated(stream, &mut body, len).await?;
        let mut cursor = Bytes::from(body);

        let code = cursor.get_u8();
        match code {
            PIERCE_FIREWALL_CODE => {
                if cursor.remaining() < 4 {
                    return Err(CodecError::Truncated {
                        needed: 4,
                        available: cursor.remaining(),
                    });
                }
                Ok(HandshakeFrame::PierceFirewall {
                    token: cursor.get_u32_le(),
                })
            }
            PEER_INIT_CODE => {
                let username = read_prefixed_string(&mut cursor)?;
                let conn_type = read_prefixed_string(&mut cursor)?;
                if cursor.remaining() < 4 {
                    return Err(CodecError::Truncated {
                        needed: 4,
                        available: cursor.remaining(),
                    });
                }
                let token = cursor.get_u32_le();
                Ok(HandshakeFrame::PeerInit {
                    username,
                    conn_type,
                    token,
                })
            }
            other => Err(CodecError::UnknownCode(other as u32)),
        }
    }

    pub async fn write_to<S>(&self, stream: &mut S) -> std::io::Result<()>
    where
        S: AsyncWrite + Unpin,
    {
        stream.write_all(&self.to_bytes()).await
    }
}

async fn read_exact_or_truncated<S>(
    stream: &mut S,
    buf: &mut [u8],
    needed: usize,
) -> Result<(), CodecError>
where
    S: AsyncRead + Unpin,
{
    stream
        .read_exact(buf)
        .await
        .map_err(|_| CodecError::Truncated {
            needed,
            available: 0,
        })
}

fn read_prefixed_string(cursor: &mut Bytes) -> Result<String, CodecError> {
    if cursor.remaining() < 4 {
        return Err(CodecError::Truncated {
            needed: 4,
            available: cursor.remaining(),
        });
    }
    let len = cursor.get_u32_le() as usize;
    if cursor.remaining() < len {
        return Err(CodecError::Truncated {
            needed: len,
            available: cursor.remaining(),
        });
    }
    let raw = cursor.split_to(len);
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn peer_init_round_trips() {
        let frame = HandshakeFrame::PeerInit {
            username: "nicotine".into(),
            conn_type: "P".into(),
            token: 77,
        };
        let (mut client, mut server) = duplex(256);
        frame.write_to(&mut client).await.unwrap();
        let decoded = HandshakeFrame::read_from(&mut server).await.unwrap();
        assert_eq!(decoded, frame);
    }

    #[tokio::test]
    async fn pierce_firewall_round_trips() {
        let frame = HandshakeFrame::PierceFirewall { token: 9001 };
        let (mut client, mut server) = duplex(64);
        frame.write_to(&mut client).await.unwrap();
        let decoded = HandshakeFrame::read_from(&mut server).await.unwrap();
        assert_eq!(decoded, frame);
    }
}
