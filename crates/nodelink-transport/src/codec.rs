//! Framing codec: splits logical messages into frames, seals payloads, and
//! decodes frames incrementally from a byte stream.
//!
//! [`FrameCodec`] implements `tokio_util`'s `Decoder`/`Encoder` so it can be
//! driven by `FramedRead`/`Framed`. Decoding is frame-level: chunked messages
//! come out as several frames and are stitched back together by
//! [`Reassembler`].

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::crypto::{PayloadCipher, SEAL_OVERHEAD};
use crate::error::{Result, TransportError};
use crate::protocol::{
    Command, Frame, FrameFlags, FrameHeader, Message, DEFAULT_CHUNK_SIZE, FRAME_HEADER_SIZE,
    MAX_FRAME_PAYLOAD, PROTOCOL_VERSION,
};

/// Codec limits.
#[derive(Debug, Clone)]
pub struct CodecConfig {
    /// Plaintext bytes per frame before a message is split.
    pub chunk_size: usize,
    /// Largest frame payload accepted from the wire.
    pub max_frame_payload: usize,
    /// Largest reassembled message accepted from the wire.
    pub max_message_size: usize,
    /// Messages one connection may have half-received at once.
    pub max_partial_messages: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_frame_payload: MAX_FRAME_PAYLOAD,
            max_message_size: 256 * 1024 * 1024,
            max_partial_messages: 64,
        }
    }
}

impl CodecConfig {
    /// Checks that sealed chunks fit inside a frame.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(TransportError::Config {
                reason: "chunk_size must be positive".to_string(),
            });
        }
        if self.max_partial_messages == 0 {
            return Err(TransportError::Config {
                reason: "max_partial_messages must be positive".to_string(),
            });
        }
        if self.chunk_size + SEAL_OVERHEAD > self.max_frame_payload {
            return Err(TransportError::Config {
                reason: format!(
                    "chunk_size {} leaves no room for the cipher overhead within max_frame_payload {}",
                    self.chunk_size, self.max_frame_payload
                ),
            });
        }
        Ok(())
    }
}

/// Position of one chunk within an outgoing message.
#[derive(Debug, Clone, Copy)]
pub struct ChunkSpec {
    /// Correlation counter.
    pub counter: u32,
    /// Command tag.
    pub command: Command,
    /// Whether the message is a response.
    pub response: bool,
    /// Chunk position.
    pub index: u16,
    /// Number of chunks.
    pub total: u16,
    /// Plaintext length of the full message.
    pub total_len: u32,
}

/// Stateful frame encoder/decoder for one connection direction.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    config: CodecConfig,
    cipher: Option<PayloadCipher>,
    header: Option<FrameHeader>,
}

impl FrameCodec {
    /// Creates a codec; with `cipher` set every payload is sealed and plaintext
    /// frames from the peer are refused.
    pub fn new(config: CodecConfig, cipher: Option<PayloadCipher>) -> Self {
        Self {
            config,
            cipher,
            header: None,
        }
    }

    /// Codec limits.
    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    /// Number of frames a message of `len` plaintext bytes is split into.
    pub fn chunk_count(&self, len: usize) -> Result<u16> {
        let chunks = if len == 0 {
            1
        } else {
            len.div_ceil(self.config.chunk_size)
        };
        if chunks > u16::MAX as usize || len > u32::MAX as usize {
            return Err(TransportError::PayloadTooLarge {
                size: len,
                max_size: (self.config.chunk_size * u16::MAX as usize).min(u32::MAX as usize),
            });
        }
        Ok(chunks as u16)
    }

    /// Appends one encoded chunk to `dst`.
    pub fn encode_chunk(&self, spec: ChunkSpec, piece: &[u8], dst: &mut BytesMut) -> Result<()> {
        let mut flags = FrameFlags::empty();
        if spec.response {
            flags.insert(FrameFlags::RESPONSE);
        }
        let sealed;
        let body: &[u8] = match &self.cipher {
            Some(cipher) => {
                flags.insert(FrameFlags::ENCRYPTED);
                sealed = cipher.seal(piece)?;
                &sealed
            }
            None => piece,
        };
        if body.len() > self.config.max_frame_payload {
            return Err(TransportError::PayloadTooLarge {
                size: body.len(),
                max_size: self.config.max_frame_payload,
            });
        }
        let header = FrameHeader {
            counter: spec.counter,
            command: spec.command,
            version: PROTOCOL_VERSION,
            flags,
            chunk_index: spec.index,
            chunk_total: spec.total,
            total_len: spec.total_len,
            payload_len: body.len() as u32,
        };
        dst.reserve(FRAME_HEADER_SIZE + body.len());
        header.encode(dst);
        dst.put_slice(body);
        Ok(())
    }

    /// Encodes a whole message, splitting it into as many frames as needed.
    pub fn encode_message(&self, message: &Message, dst: &mut BytesMut) -> Result<()> {
        let total = self.chunk_count(message.payload.len())?;
        let total_len = message.payload.len() as u32;
        let mut spec = ChunkSpec {
            counter: message.counter,
            command: message.command,
            response: message.response,
            index: 0,
            total,
            total_len,
        };
        if message.payload.is_empty() {
            return self.encode_chunk(spec, &[], dst);
        }
        for (index, piece) in message.payload.chunks(self.config.chunk_size).enumerate() {
            spec.index = index as u16;
            self.encode_chunk(spec, piece, dst)?;
        }
        Ok(())
    }

    /// Encodes a message into a fresh buffer.
    pub fn encode(&self, counter: u32, command: Command, payload: &[u8]) -> Result<Bytes> {
        let mut dst = BytesMut::new();
        let message = Message::request(counter, command, Bytes::copy_from_slice(payload));
        self.encode_message(&message, &mut dst)?;
        Ok(dst.freeze())
    }

    fn open_payload(&self, header: &FrameHeader, raw: Bytes) -> Result<Bytes> {
        let encrypted = header.flags.contains(FrameFlags::ENCRYPTED);
        match (&self.cipher, encrypted) {
            (Some(cipher), true) => cipher
                .open(&raw)
                .map_err(|e| TransportError::protocol(e.to_string())),
            (None, false) => Ok(raw),
            (Some(_), false) => Err(TransportError::protocol(
                "plaintext frame received on an encrypted connection",
            )),
            (None, true) => Err(TransportError::protocol(
                "encrypted frame received but no cluster key is configured",
            )),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        let header = match self.header {
            Some(header) => header,
            None => {
                if src.len() < FRAME_HEADER_SIZE {
                    return Ok(None);
                }
                let header = FrameHeader::decode(&src[..FRAME_HEADER_SIZE])?;
                if header.payload_len as usize > self.config.max_frame_payload {
                    return Err(TransportError::protocol(format!(
                        "frame payload of {} bytes exceeds limit {}",
                        header.payload_len, self.config.max_frame_payload
                    )));
                }
                src.advance(FRAME_HEADER_SIZE);
                self.header = Some(header);
                header
            }
        };

        let len = header.payload_len as usize;
        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }
        self.header = None;
        let raw = src.split_to(len).freeze();
        let payload = self.open_payload(&header, raw)?;
        Ok(Some(Frame { header, payload }))
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = TransportError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        self.encode_message(&item, dst)
    }
}

#[derive(Debug)]
struct Partial {
    command: Command,
    next_index: u16,
    chunk_total: u16,
    total_len: u32,
    buf: BytesMut,
}

/// Collects chunks per `(counter, is_response)` and yields complete messages.
///
/// Buffers only grow with bytes actually received; the declared `total_len`
/// is checked but never used to reserve memory.
#[derive(Debug)]
pub struct Reassembler {
    partial: HashMap<(u32, bool), Partial>,
    max_message_size: usize,
    max_frame_payload: usize,
    max_partial_messages: usize,
}

impl Reassembler {
    /// Creates a reassembler enforcing the message limits of `config`.
    pub fn new(config: &CodecConfig) -> Self {
        Self {
            partial: HashMap::new(),
            max_message_size: config.max_message_size,
            max_frame_payload: config.max_frame_payload,
            max_partial_messages: config.max_partial_messages,
        }
    }

    /// Number of messages currently being reassembled.
    pub fn in_progress(&self) -> usize {
        self.partial.len()
    }

    /// Bytes allocated for partial messages.
    pub fn reserved_bytes(&self) -> usize {
        self.partial.values().map(|p| p.buf.capacity()).sum()
    }

    /// Feeds one frame; returns the message once its last chunk arrived.
    pub fn push(&mut self, frame: Frame) -> Result<Option<Message>> {
        let h = frame.header;
        let key = (h.counter, h.is_response());
        if h.total_len as usize > self.max_message_size {
            return Err(TransportError::protocol(format!(
                "message of {} bytes exceeds limit {}",
                h.total_len, self.max_message_size
            )));
        }

        if h.chunk_index == 0 {
            if self.partial.contains_key(&key) {
                return Err(TransportError::protocol(format!(
                    "counter {} restarted before its previous message completed",
                    h.counter
                )));
            }
            if h.chunk_total == 1 {
                if frame.payload.len() != h.total_len as usize {
                    return Err(TransportError::protocol(format!(
                        "counter {}: got {} bytes, header declared {}",
                        h.counter,
                        frame.payload.len(),
                        h.total_len
                    )));
                }
                return Ok(Some(Message {
                    counter: h.counter,
                    command: h.command,
                    response: h.is_response(),
                    payload: frame.payload,
                }));
            }
            if h.total_len as u64 > h.chunk_total as u64 * self.max_frame_payload as u64 {
                return Err(TransportError::protocol(format!(
                    "counter {}: {} bytes cannot fit in {} chunks",
                    h.counter, h.total_len, h.chunk_total
                )));
            }
            if self.partial.len() >= self.max_partial_messages {
                return Err(TransportError::protocol(format!(
                    "more than {} messages in flight",
                    self.max_partial_messages
                )));
            }
            let buf = BytesMut::from(&frame.payload[..]);
            self.partial.insert(
                key,
                Partial {
                    command: h.command,
                    next_index: 1,
                    chunk_total: h.chunk_total,
                    total_len: h.total_len,
                    buf,
                },
            );
            self.check_overflow(key)?;
            return Ok(None);
        }

        let partial = self.partial.get_mut(&key).ok_or_else(|| {
            TransportError::protocol(format!(
                "chunk {} for counter {} without a first chunk",
                h.chunk_index, h.counter
            ))
        })?;
        if partial.command != h.command
            || partial.chunk_total != h.chunk_total
            || partial.total_len != h.total_len
        {
            return Err(TransportError::protocol(format!(
                "chunk header for counter {} disagrees with its first chunk",
                h.counter
            )));
        }
        if partial.next_index != h.chunk_index {
            return Err(TransportError::protocol(format!(
                "counter {}: expected chunk {}, got {}",
                h.counter, partial.next_index, h.chunk_index
            )));
        }
        partial.buf.extend_from_slice(&frame.payload);
        partial.next_index += 1;
        self.check_overflow(key)?;

        if !h.is_last_chunk() {
            return Ok(None);
        }
        let Some(done) = self.partial.remove(&key) else {
            return Ok(None);
        };
        if done.buf.len() != done.total_len as usize {
            return Err(TransportError::protocol(format!(
                "counter {}: reassembled {} bytes, header declared {}",
                h.counter,
                done.buf.len(),
                done.total_len
            )));
        }
        Ok(Some(Message {
            counter: h.counter,
            command: done.command,
            response: key.1,
            payload: done.buf.freeze(),
        }))
    }

    fn check_overflow(&self, key: (u32, bool)) -> Result<()> {
        if let Some(p) = self.partial.get(&key) {
            if p.buf.len() > p.total_len as usize {
                return Err(TransportError::protocol(format!(
                    "counter {}: received more bytes than the declared {}",
                    key.0, p.total_len
                )));
            }
        }
        Ok(())
    }

    /// Drops every partial message.
    pub fn clear(&mut self) {
        self.partial.clear();
    }
}
