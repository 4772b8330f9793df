//! Wire-level protocol definitions for the nodelink cluster protocol.
//!
//! Every frame starts with a fixed 30-byte header followed by the frame
//! payload. Logical messages larger than the configured chunk size are split
//! across several frames sharing one counter; the header carries the chunk
//! index, the chunk count and the plaintext length of the whole message.
//!
//! ```text
//! 0        4                16  17  18    20    22          26          30
//! +--------+----------------+---+---+-----+-----+-----------+-----------+---------
//! |counter | command (pad)  |ver|flg|index|total| total_len |  length   | payload
//! +--------+----------------+---+---+-----+-----+-----------+-----------+---------
//! ```

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, TransportError};

/// Frame header size in bytes.
pub const FRAME_HEADER_SIZE: usize = 30;

/// Fixed width of the command tag on the wire.
pub const COMMAND_WIDTH: usize = 12;

/// Header layout version, bumped whenever the header layout changes.
pub const PROTOCOL_VERSION: u8 = 1;

/// Default plaintext bytes carried per frame before a message is chunked.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Upper bound for a single frame payload accepted from the wire.
pub const MAX_FRAME_PAYLOAD: usize = 4 * 1024 * 1024;

/// Fixed-width ASCII command tag such as `hello` or `echo-c`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Command {
    tag: [u8; COMMAND_WIDTH],
    len: u8,
}

impl Command {
    /// Handshake carrying the sender's node name.
    pub const HELLO: Command = Command::from_static(b"hello");
    /// Generic success response.
    pub const OK: Command = Command::from_static(b"ok");
    /// Success response sent by a client.
    pub const OK_C: Command = Command::from_static(b"ok-c");
    /// Success response sent by the master.
    pub const OK_M: Command = Command::from_static(b"ok-m");
    /// Generic echo request.
    pub const ECHO: Command = Command::from_static(b"echo");
    /// Keepalive from client to master.
    pub const ECHO_C: Command = Command::from_static(b"echo-c");
    /// Echo from master to client.
    pub const ECHO_M: Command = Command::from_static(b"echo-m");
    /// Error response; the payload is the error text.
    pub const ERR: Command = Command::from_static(b"err");
    /// Streamed file upload.
    pub const FILE: Command = Command::from_static(b"file");
    /// Large string diagnostic.
    pub const STRING: Command = Command::from_static(b"string");
    /// Batch of queued events.
    pub const BATCH: Command = Command::from_static(b"batch");

    /// Builds a command from a literal; over-long literals fail at compile time.
    pub const fn from_static(tag: &'static [u8]) -> Self {
        assert!(!tag.is_empty() && tag.len() <= COMMAND_WIDTH);
        let mut buf = [b' '; COMMAND_WIDTH];
        let mut i = 0;
        while i < tag.len() {
            buf[i] = tag[i];
            i += 1;
        }
        Command {
            tag: buf,
            len: tag.len() as u8,
        }
    }

    /// Validates and builds a command tag.
    pub fn new(tag: &[u8]) -> Result<Self> {
        if tag.is_empty() || tag.len() > COMMAND_WIDTH {
            return Err(TransportError::InvalidCommand {
                reason: format!("tag length {} not in 1..={}", tag.len(), COMMAND_WIDTH),
            });
        }
        if !tag.iter().all(|b| b.is_ascii_graphic()) {
            return Err(TransportError::InvalidCommand {
                reason: "tag must be printable ASCII without spaces".to_string(),
            });
        }
        let mut buf = [b' '; COMMAND_WIDTH];
        buf[..tag.len()].copy_from_slice(tag);
        Ok(Command {
            tag: buf,
            len: tag.len() as u8,
        })
    }

    fn from_wire(raw: &[u8]) -> Result<Self> {
        let end = raw
            .iter()
            .rposition(|b| *b != b' ')
            .map(|i| i + 1)
            .unwrap_or(0);
        Command::new(&raw[..end]).map_err(|e| TransportError::protocol(e.to_string()))
    }

    /// Tag bytes without padding.
    pub fn as_bytes(&self) -> &[u8] {
        &self.tag[..self.len as usize]
    }

    /// Tag as text. Tags are validated ASCII so this never fails in practice.
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(self.as_bytes()).unwrap_or("?")
    }

    /// True for the error response tag.
    pub fn is_error(&self) -> bool {
        *self == Command::ERR
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Command({})", self.as_str())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for Command {
    type Error = TransportError;

    fn try_from(value: &str) -> Result<Self> {
        Command::new(value.as_bytes())
    }
}

/// Frame flags for protocol control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// Payload is sealed with the connection cipher.
    pub const ENCRYPTED: FrameFlags = FrameFlags(0x01);
    /// Frame belongs to a response to a request issued by the receiver.
    pub const RESPONSE: FrameFlags = FrameFlags(0x02);

    const KNOWN: u8 = 0x03;

    /// Empty flag set.
    pub const fn empty() -> Self {
        FrameFlags(0)
    }

    /// Raw byte representation.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Parses flags, rejecting unknown bits.
    pub fn from_bits(bits: u8) -> Option<Self> {
        if bits & !Self::KNOWN != 0 {
            None
        } else {
            Some(FrameFlags(bits))
        }
    }

    /// True when every bit of `other` is set.
    pub fn contains(self, other: FrameFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Sets the bits of `other`.
    pub fn insert(&mut self, other: FrameFlags) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for FrameFlags {
    type Output = FrameFlags;

    fn bitor(self, rhs: FrameFlags) -> FrameFlags {
        FrameFlags(self.0 | rhs.0)
    }
}

/// Frame header containing metadata about the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Correlation counter shared by a request and its response.
    pub counter: u32,
    /// Command tag.
    pub command: Command,
    /// Header layout version.
    pub version: u8,
    /// Control flags.
    pub flags: FrameFlags,
    /// Position of this frame within its message.
    pub chunk_index: u16,
    /// Number of frames in the message.
    pub chunk_total: u16,
    /// Plaintext length of the full message.
    pub total_len: u32,
    /// Length of this frame's payload on the wire.
    pub payload_len: u32,
}

impl FrameHeader {
    /// Serializes the header into `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(FRAME_HEADER_SIZE);
        dst.put_u32(self.counter);
        dst.put_slice(&self.command.tag);
        dst.put_u8(self.version);
        dst.put_u8(self.flags.bits());
        dst.put_u16(self.chunk_index);
        dst.put_u16(self.chunk_total);
        dst.put_u32(self.total_len);
        dst.put_u32(self.payload_len);
    }

    /// Parses and validates a header from exactly [`FRAME_HEADER_SIZE`] bytes.
    pub fn decode(mut src: &[u8]) -> Result<Self> {
        if src.len() < FRAME_HEADER_SIZE {
            return Err(TransportError::protocol(format!(
                "short header: {} bytes",
                src.len()
            )));
        }
        let counter = src.get_u32();
        let command = Command::from_wire(&src[..COMMAND_WIDTH])?;
        src.advance(COMMAND_WIDTH);
        let version = src.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(TransportError::protocol(format!(
                "header version mismatch: expected {}, got {}",
                PROTOCOL_VERSION, version
            )));
        }
        let flags = FrameFlags::from_bits(src.get_u8())
            .ok_or_else(|| TransportError::protocol("unknown frame flags"))?;
        let chunk_index = src.get_u16();
        let chunk_total = src.get_u16();
        if chunk_total == 0 || chunk_index >= chunk_total {
            return Err(TransportError::protocol(format!(
                "invalid chunk {}/{}",
                chunk_index, chunk_total
            )));
        }
        let total_len = src.get_u32();
        let payload_len = src.get_u32();
        Ok(Self {
            counter,
            command,
            version,
            flags,
            chunk_index,
            chunk_total,
            total_len,
            payload_len,
        })
    }

    /// True if the frame belongs to a response.
    pub fn is_response(&self) -> bool {
        self.flags.contains(FrameFlags::RESPONSE)
    }

    /// True if this is the final chunk of its message.
    pub fn is_last_chunk(&self) -> bool {
        self.chunk_index + 1 == self.chunk_total
    }
}

/// One frame as it travels on the wire, payload already decrypted on receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame header.
    pub header: FrameHeader,
    /// Payload bytes of this chunk.
    pub payload: Bytes,
}

/// A complete logical message after reassembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Correlation counter.
    pub counter: u32,
    /// Command tag.
    pub command: Command,
    /// Whether the message answers a request we issued.
    pub response: bool,
    /// Full plaintext payload.
    pub payload: Bytes,
}

impl Message {
    /// Builds a request message.
    pub fn request(counter: u32, command: Command, payload: impl Into<Bytes>) -> Self {
        Self {
            counter,
            command,
            response: false,
            payload: payload.into(),
        }
    }

    /// Builds a response message for `counter`.
    pub fn response(counter: u32, command: Command, payload: impl Into<Bytes>) -> Self {
        Self {
            counter,
            command,
            response: true,
            payload: payload.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> FrameHeader {
        FrameHeader {
            counter: 42,
            command: Command::ECHO_C,
            version: PROTOCOL_VERSION,
            flags: FrameFlags::RESPONSE,
            chunk_index: 1,
            chunk_total: 3,
            total_len: 1000,
            payload_len: 400,
        }
    }

    #[test]
    fn test_header_roundtrip() {
        let mut buf = BytesMut::new();
        header().encode(&mut buf);
        assert_eq!(buf.len(), FRAME_HEADER_SIZE);
        let decoded = FrameHeader::decode(&buf).unwrap();
        assert_eq!(decoded, header());
        assert!(decoded.is_response());
        assert!(!decoded.is_last_chunk());
    }

    #[test]
    fn test_command_padding() {
        let mut buf = BytesMut::new();
        header().encode(&mut buf);
        assert_eq!(&buf[4..16], b"echo-c      ");
    }

    #[test]
    fn test_command_validation() {
        assert!(Command::new(b"").is_err());
        assert!(Command::new(b"thirteen-char").is_err());
        assert!(Command::new(b"has space").is_err());
        assert!(Command::new(b"sync_i_w_m_p").is_ok());
        assert_eq!(Command::try_from("echo").unwrap(), Command::ECHO);
        assert_eq!(Command::OK_M.to_string(), "ok-m");
    }

    #[test]
    fn test_bad_version_rejected() {
        let mut buf = BytesMut::new();
        header().encode(&mut buf);
        buf[16] = 9;
        assert!(matches!(
            FrameHeader::decode(&buf),
            Err(TransportError::Protocol { .. })
        ));
    }

    #[test]
    fn test_bad_chunk_index_rejected() {
        let mut h = header();
        h.chunk_index = 3;
        let mut buf = BytesMut::new();
        h.encode(&mut buf);
        assert!(FrameHeader::decode(&buf).is_err());

        let mut h = header();
        h.chunk_total = 0;
        h.chunk_index = 0;
        let mut buf = BytesMut::new();
        h.encode(&mut buf);
        assert!(FrameHeader::decode(&buf).is_err());
    }

    #[test]
    fn test_unknown_flags_rejected() {
        let mut buf = BytesMut::new();
        header().encode(&mut buf);
        buf[17] = 0x80;
        assert!(FrameHeader::decode(&buf).is_err());
    }

    #[test]
    fn test_blank_command_rejected() {
        let mut buf = BytesMut::new();
        header().encode(&mut buf);
        buf[4..16].copy_from_slice(b"            ");
        assert!(FrameHeader::decode(&buf).is_err());
    }
}
