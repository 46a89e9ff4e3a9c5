// ABOUTME: Wire code spaces and the Writer/Reader primitives shared by every message type
// ABOUTME: Frame shape: uint32 length, then (uint32 code, payload) inside the declared length

use std::io::{Cursor, Read, Write as _};
use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Errors raised while reading or writing a single message body.
///
/// These are local to the codec layer; callers above `Connection` see them
/// converted into [`crate::error::PeerError`].
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("truncated frame: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("code mismatch: expected {expected:#x}, actual {actual:#x}")]
    CodeMismatch { expected: u32, actual: u32 },

    #[error("unknown wire code: {0:#x}")]
    UnknownCode(u32),

    #[error("compression error: {0}")]
    Compression(String),
}

/// A wire code that identifies a message within one of the three code
/// spaces (Server, Peer, Distributed). Implemented via `num_enum` for the
/// concrete `*Code` enums below.
pub trait WireCode: Copy + Into<u32> + Sized {
    fn from_u32(value: u32) -> Result<Self, CodecError>;
}

macro_rules! wire_code_enum {
    ($name:ident { $($variant:ident = $value:expr),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
        #[repr(u32)]
        pub enum $name {
            $($variant = $value),+
        }

        impl WireCode for $name {
            fn from_u32(value: u32) -> Result<Self, CodecError> {
                <$name>::try_from(value).map_err(|_| CodecError::UnknownCode(value))
            }
        }
    };
}

wire_code_enum!(ServerCode {
    Login = 1,
    SetListenPort = 2,
    GetPeerAddress = 3,
    AddUser = 5,
    GetStatus = 7,
    ConnectToPeer = 18,
    PrivateMessage = 22,
    AcknowledgePrivateMessage = 23,
    FileSearch = 26,
    SetOnlineStatus = 28,
    SharedFoldersAndFiles = 35,
});

wire_code_enum!(PeerCode {
    BrowseRequest = 4,
    BrowseResponse = 5,
    SearchRequest = 8,
    UserInfoRequest = 15,
    PlaceInQueueRequest = 51,
});

wire_code_enum!(DistributedCode {
    SearchRequest = 3,
});

/// Incrementally builds one message body: `begin_frame` writes the code,
/// `write_*` appends fields in declared order, `build` patches in the
/// leading length prefix.
pub struct Writer<C> {
    buf: BytesMut,
    _marker: std::marker::PhantomData<C>,
}

const HEADER_LEN: usize = 4 /* length prefix */ + 4 /* code */;

impl<C: WireCode> Writer<C> {
    pub fn begin_frame(code: C) -> Self {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u32_le(0); // patched by build()
        buf.put_u32_le(code.into());
        Writer {
            buf,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.buf.put_u8(value);
        self
    }

    pub fn write_bool(&mut self, value: bool) -> &mut Self {
        self.write_u8(value as u8)
    }

    pub fn write_i32(&mut self, value: i32) -> &mut Self {
        self.buf.put_i32_le(value);
        self
    }

    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.buf.put_u32_le(value);
        self
    }

    pub fn write_i64(&mut self, value: i64) -> &mut Self {
        self.buf.put_i64_le(value);
        self
    }

    pub fn write_string(&mut self, value: &str) -> &mut Self {
        self.buf.put_u32_le(value.len() as u32);
        self.buf.put_slice(value.as_bytes());
        self
    }

    pub fn write_bytes(&mut self, value: &[u8]) -> &mut Self {
        self.buf.put_slice(value);
        self
    }

    pub fn write_ipv4_reversed(&mut self, addr: Ipv4Addr) -> &mut Self {
        let mut octets = addr.octets();
        octets.reverse();
        self.buf.put_slice(&octets);
        self
    }

    /// Deflate-compresses everything written so far after the code field,
    /// replacing it in place. Only valid to call once, before `build`.
    pub fn compress(&mut self) -> Result<(), CodecError> {
        let payload = self.buf.split_off(HEADER_LEN);
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&payload)
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        let compressed = encoder
            .finish()
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        self.buf.put_slice(&compressed);
        Ok(())
    }

    /// Finalizes the frame, patching the length prefix, and returns the
    /// full wire representation (length prefix included).
    pub fn build(mut self) -> Bytes {
        let body_len = (self.buf.len() - 4) as u32;
        self.buf[0..4].copy_from_slice(&body_len.to_le_bytes());
        self.buf.freeze()
    }
}

/// Reads fields out of a single message body in declared order.
///
/// Constructed from the body bytes *after* the leading length prefix has
/// already been stripped (i.e. starting at the code field).
pub struct Reader<C> {
    cursor: Cursor<Bytes>,
    _marker: std::marker::PhantomData<C>,
}

impl<C: WireCode> Reader<C> {
    pub fn new(body: Bytes) -> Self {
        Reader {
            cursor: Cursor::new(body),
            _marker: std::marker::PhantomData,
        }
    }

    fn remaining(&self) -> usize {
        let pos = self.cursor.position() as usize;
        self.cursor.get_ref().len().saturating_sub(pos)
    }

    fn require(&self, needed: usize) -> Result<(), CodecError> {
        let available = self.remaining();
        if available < needed {
            return Err(CodecError::Truncated { needed, available });
        }
        Ok(())
    }

    pub fn has_more(&self) -> bool {
        self.remaining() > 0
    }

    pub fn read_code(&mut self) -> Result<C, CodecError> {
        let raw = self.read_u32()?;
        C::from_u32(raw)
    }

    pub fn expect_code(&mut self, expected: C) -> Result<(), CodecError>
    where
        C: PartialEq,
    {
        let actual = self.read_code()?;
        if actual != expected {
            return Err(CodecError::CodeMismatch {
                expected: expected.into(),
                actual: actual.into(),
            });
        }
        Ok(())
    }

    /// Replaces the unread remainder of the body with its deflate-inflated
    /// form. Used by messages (e.g. browse responses) whose payload after
    /// the code field is a single raw deflate stream.
    pub fn decompress(&mut self) -> Result<(), CodecError> {
        let pos = self.cursor.position() as usize;
        let body = self.cursor.get_ref().clone();
        let compressed = body.slice(pos..);
        let mut decoder = DeflateDecoder::new(compressed.as_ref());
        let mut inflated = Vec::new();
        decoder
            .read_to_end(&mut inflated)
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        self.cursor = Cursor::new(Bytes::from(inflated));
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        self.require(1)?;
        Ok(self.cursor.get_u8())
    }

    pub fn read_bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_i32(&mut self) -> Result<i32, CodecError> {
        self.require(4)?;
        Ok(self.cursor.get_i32_le())
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        self.require(4)?;
        Ok(self.cursor.get_u32_le())
    }

    pub fn read_i64(&mut self) -> Result<i64, CodecError> {
        self.require(8)?;
        Ok(self.cursor.get_i64_le())
    }

    pub fn read_string(&mut self) -> Result<String, CodecError> {
        let len = self.read_u32()? as usize;
        let bytes = self.read_bytes(len)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<Bytes, CodecError> {
        self.require(n)?;
        let pos = self.cursor.position() as usize;
        let slice = self.cursor.get_ref().slice(pos..pos + n);
        self.cursor.advance(n);
        Ok(slice)
    }

    pub fn read_remaining(&mut self) -> Bytes {
        let n = self.remaining();
        self.read_bytes(n).expect("n is exactly what remains")
    }

    pub fn read_ipv4_reversed(&mut self) -> Result<Ipv4Addr, CodecError> {
        let raw = self.read_bytes(4)?;
        Ok(Ipv4Addr::new(raw[3], raw[2], raw[1], raw[0]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_scalar_fields() {
        let mut w = Writer::<PeerCode>::begin_frame(PeerCode::BrowseRequest);
        w.write_i32(-7).write_u32(42).write_i64(9_000_000_000).write_bool(true).write_string("hi");
        let body = w.build().slice(4..); // drop the length prefix for the reader

        let mut r = Reader::<PeerCode>::new(body);
        r.expect_code(PeerCode::BrowseRequest).unwrap();
        assert_eq!(r.read_i32().unwrap(), -7);
        assert_eq!(r.read_u32().unwrap(), 42);
        assert_eq!(r.read_i64().unwrap(), 9_000_000_000);
        assert!(r.read_bool().unwrap());
        assert_eq!(r.read_string().unwrap(), "hi");
        assert!(!r.has_more());
    }

    #[test]
    fn code_mismatch_is_reported() {
        let w = Writer::<PeerCode>::begin_frame(PeerCode::SearchRequest);
        let body = w.build().slice(4..);
        let mut r = Reader::<PeerCode>::new(body);
        let err = r.expect_code(PeerCode::BrowseResponse).unwrap_err();
        assert!(matches!(err, CodecError::CodeMismatch { .. }));
    }

    #[test]
    fn truncated_read_is_reported() {
        let mut r = Reader::<PeerCode>::new(Bytes::from_static(&[1, 2]));
        let err = r.read_i32().unwrap_err();
        assert!(matches!(err, CodecError::Truncated { needed: 4, available: 2 }));
    }

    #[test]
    fn compress_then_decompress_round_trips() {
        let mut w = Writer::<PeerCode>::begin_frame(PeerCode::BrowseResponse);
        w.write_string("a fairly compressible payload payload payload");
        w.compress().unwrap();
        let body = w.build().slice(4..);

        let mut r = Reader::<PeerCode>::new(body);
        r.expect_code(PeerCode::BrowseResponse).unwrap();
        r.decompress().unwrap();
        assert_eq!(
            r.read_string().unwrap(),
            "a fairly compressible payload payload payload"
        );
    }

    #[test]
    fn ipv4_reversed_round_trips() {
        let mut w = Writer::<ServerCode>::begin_frame(ServerCode::GetPeerAddress);
        w.write_ipv4_reversed(Ipv4Addr::new(192, 168, 1, 10));
        let body = w.build().slice(4..);
        let mut r = Reader::<ServerCode>::new(body);
        r.expect_code(ServerCode::GetPeerAddress).unwrap();
        assert_eq!(r.read_ipv4_reversed().unwrap(), Ipv4Addr::new(192, 168, 1, 10));
    }
}
