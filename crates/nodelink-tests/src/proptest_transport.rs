//! Property-Based Tests for the wire codec
//!
//! Messages are encoded into one byte stream, optionally with their chunks
//! interleaved, then decoded from arbitrarily sized reads.

use bytes::{Bytes, BytesMut};
use nodelink_transport::codec::ChunkSpec;
use nodelink_transport::{CodecConfig, FrameCodec, Message, Reassembler, Result};
use tokio_util::codec::Decoder;

/// Encodes `messages` back to back.
pub fn encode_all(codec: &FrameCodec, messages: &[Message]) -> Result<BytesMut> {
    let mut wire = BytesMut::new();
    for message in messages {
        codec.encode_message(message, &mut wire)?;
    }
    Ok(wire)
}

/// Encodes `messages` taking one chunk from each in turn, the way concurrent
/// writers share a connection.
pub fn encode_interleaved(codec: &FrameCodec, messages: &[Message]) -> Result<BytesMut> {
    let chunk_size = codec.config().chunk_size;
    let mut plans = Vec::with_capacity(messages.len());
    for message in messages {
        let total = codec.chunk_count(message.payload.len())?;
        let spec = ChunkSpec {
            counter: message.counter,
            command: message.command,
            response: message.response,
            index: 0,
            total,
            total_len: message.payload.len() as u32,
        };
        plans.push((spec, message.payload.clone()));
    }

    let mut wire = BytesMut::new();
    let mut round = 0u16;
    loop {
        let mut wrote = false;
        for (spec, payload) in &plans {
            if round >= spec.total {
                continue;
            }
            let start = round as usize * chunk_size;
            let end = (start + chunk_size).min(payload.len());
            let piece = if start < end { &payload[start..end] } else { &[][..] };
            codec.encode_chunk(ChunkSpec { index: round, ..*spec }, piece, &mut wire)?;
            wrote = true;
        }
        if !wrote {
            return Ok(wire);
        }
        round += 1;
    }
}

/// Feeds `wire` to a fresh decoder `step` bytes at a time and returns every
/// reassembled message in completion order.
pub fn decode_in_steps(codec: &FrameCodec, wire: &[u8], step: usize) -> Result<Vec<Message>> {
    let mut decoder = codec.clone();
    let mut reassembler = Reassembler::new(decoder.config());
    let mut buf = BytesMut::new();
    let mut out = Vec::new();
    for piece in wire.chunks(step.max(1)) {
        buf.extend_from_slice(piece);
        while let Some(frame) = decoder.decode(&mut buf)? {
            if let Some(message) = reassembler.push(frame)? {
                out.push(message);
            }
        }
    }
    Ok(out)
}

/// Codec with a small chunk size so modest payloads span several frames.
pub fn small_chunk_codec(chunk_size: usize) -> FrameCodec {
    FrameCodec::new(
        CodecConfig {
            chunk_size,
            ..CodecConfig::default()
        },
        None,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodelink_transport::{Command, PayloadCipher};
    use proptest::prelude::*;

    const CHUNK: usize = 64;

    fn command_strategy() -> impl Strategy<Value = Command> {
        prop_oneof![
            Just(Command::ECHO),
            Just(Command::ECHO_C),
            Just(Command::FILE),
            Just(Command::BATCH),
            Just(Command::OK_M),
        ]
    }

    fn message_strategy() -> impl Strategy<Value = Message> {
        (
            any::<u32>(),
            command_strategy(),
            any::<bool>(),
            proptest::collection::vec(any::<u8>(), 0..(CHUNK * 7 / 2)),
        )
            .prop_map(|(counter, command, response, payload)| Message {
                counter,
                command,
                response,
                payload: Bytes::from(payload),
            })
    }

    proptest! {
        #[test]
        fn prop_message_survives_any_read_size(
            message in message_strategy(),
            step in 1usize..100,
        ) {
            let codec = small_chunk_codec(CHUNK);
            let wire = encode_all(&codec, std::slice::from_ref(&message)).unwrap();
            let decoded = decode_in_steps(&codec, &wire, step).unwrap();
            prop_assert_eq!(decoded, vec![message]);
        }

        #[test]
        fn prop_interleaved_messages_reassemble(
            messages in proptest::collection::vec(message_strategy(), 1..6),
            step in 1usize..300,
        ) {
            // Distinct (counter, response) keys, as on a live connection.
            let messages: Vec<Message> = messages
                .into_iter()
                .enumerate()
                .map(|(i, m)| Message { counter: i as u32, ..m })
                .collect();
            let codec = small_chunk_codec(CHUNK);
            let wire = encode_interleaved(&codec, &messages).unwrap();
            let mut decoded = decode_in_steps(&codec, &wire, step).unwrap();
            decoded.sort_by_key(|m| m.counter);
            prop_assert_eq!(decoded, messages);
        }

        #[test]
        fn prop_encrypted_frames_roundtrip(
            message in message_strategy(),
            step in 1usize..200,
        ) {
            let cipher = PayloadCipher::from_cluster_key("0123456789abcdef0123456789abcdef").unwrap();
            let codec = FrameCodec::new(
                CodecConfig { chunk_size: CHUNK, ..CodecConfig::default() },
                Some(cipher),
            );
            let wire = encode_all(&codec, std::slice::from_ref(&message)).unwrap();
            prop_assert!(wire.len() > message.payload.len());
            let decoded = decode_in_steps(&codec, &wire, step).unwrap();
            prop_assert_eq!(decoded, vec![message]);
        }
    }

    #[test]
    fn test_three_and_a_half_chunks_one_byte_at_a_time() {
        let codec = FrameCodec::new(CodecConfig::default(), None);
        let chunk = codec.config().chunk_size;
        let payload: Vec<u8> = (0..chunk * 7 / 2).map(|i| (i % 256) as u8).collect();
        let message = Message::request(7, Command::FILE, payload);
        let wire = encode_all(&codec, std::slice::from_ref(&message)).unwrap();
        assert_eq!(codec.chunk_count(message.payload.len()).unwrap(), 4);

        let decoded = decode_in_steps(&codec, &wire, 1).unwrap();
        assert_eq!(decoded, vec![message]);
    }

    #[test]
    fn test_plaintext_rejected_by_keyed_decoder() {
        let plain = small_chunk_codec(CHUNK);
        let keyed = FrameCodec::new(
            CodecConfig {
                chunk_size: CHUNK,
                ..CodecConfig::default()
            },
            Some(PayloadCipher::from_cluster_key("0123456789abcdef0123456789abcdef").unwrap()),
        );
        let wire = encode_all(&plain, &[Message::request(1, Command::ECHO, &b"hi"[..])]).unwrap();
        assert!(decode_in_steps(&keyed, &wire, 16).is_err());
    }
}
