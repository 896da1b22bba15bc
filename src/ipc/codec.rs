//! Length-prefixed MessagePack codec for tokio I/O.
//!
//! Framing: `[4 bytes: payload length, big-endian u32][N bytes: MessagePack payload]`

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::protocol::{MAX_PAYLOAD_SIZE, Message, RawEnvelope};

/// Codec error type.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("payload too large: {0} bytes (max {MAX_PAYLOAD_SIZE})")]
    PayloadTooLarge(usize),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("MessagePack encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("MessagePack decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Pull one complete frame payload out of `src`, tracking the parsed
/// length header across partial reads in `pending_len`.
fn take_frame(
    pending_len: &mut Option<usize>,
    src: &mut BytesMut,
) -> Result<Option<BytesMut>, CodecError> {
    let payload_len = match *pending_len {
        Some(len) => len,
        None => {
            if src.len() < 4 {
                return Ok(None); // Need more data for the header.
            }
            let len = src.get_u32() as usize;
            if len > MAX_PAYLOAD_SIZE {
                return Err(CodecError::PayloadTooLarge(len));
            }
            *pending_len = Some(len);
            len
        }
    };

    if src.len() < payload_len {
        // Reserve space for the remaining bytes to avoid repeated
        // small allocations.
        src.reserve(payload_len - src.len());
        return Ok(None);
    }

    let payload = src.split_to(payload_len);
    *pending_len = None;
    Ok(Some(payload))
}

fn write_frame(item: &Message, dst: &mut BytesMut) -> Result<(), CodecError> {
    let payload = rmp_serde::to_vec_named(item)?;
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(CodecError::PayloadTooLarge(payload.len()));
    }
    dst.reserve(4 + payload.len());
    dst.put_u32(payload.len() as u32);
    dst.extend_from_slice(&payload);
    Ok(())
}

/// Length-prefixed MessagePack codec.
///
/// Encodes [`Message`] values as length-prefixed MessagePack frames and
/// decodes frames back into [`Message`] values. Used by the companion
/// roles (client, provider, selector) for simple send/receive. The daemon
/// itself uses [`FrameCodec`] + [`decode_frame`] for two-phase decode
/// with unknown-type fallback.
#[derive(Debug, Default)]
pub struct MessageCodec {
    /// Length of the current frame being read, if the header has been consumed.
    pending_len: Option<usize>,
}

impl MessageCodec {
    pub fn new() -> Self {
        Self { pending_len: None }
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match take_frame(&mut self.pending_len, src)? {
            Some(payload) => Ok(Some(rmp_serde::from_slice(&payload)?)),
            None => Ok(None),
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        write_frame(&item, dst)
    }
}

/// Frame-level codec — handles only length-prefixed framing.
///
/// Returns raw `BytesMut` payloads without deserializing. Used by the
/// daemon's connection layer for two-phase decode: try [`Message`], then
/// fall back to [`RawEnvelope`] for unknown-type error responses.
#[derive(Debug, Default)]
pub struct FrameCodec {
    pending_len: Option<usize>,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self { pending_len: None }
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        take_frame(&mut self.pending_len, src)
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        write_frame(&item, dst)
    }
}

/// Result of attempting to decode a raw frame into a protocol message.
#[derive(Debug)]
pub enum DecodeResult {
    /// Successfully decoded a known message variant.
    Ok(Message),
    /// Unknown type — extracted envelope for error response echoing.
    UnknownType(RawEnvelope),
    /// Completely malformed — could not even extract `{type, id}`.
    Malformed(rmp_serde::decode::Error),
}

/// Attempt two-phase decode of a raw frame.
///
/// 1. Try to deserialize as [`Message`] (known variant).
/// 2. On failure, try [`RawEnvelope`] to extract `{type, id}`.
/// 3. If both fail, return [`DecodeResult::Malformed`].
pub fn decode_frame(payload: &[u8]) -> DecodeResult {
    match rmp_serde::from_slice::<Message>(payload) {
        Ok(msg) => DecodeResult::Ok(msg),
        Err(_) => match rmp_serde::from_slice::<RawEnvelope>(payload) {
            Ok(envelope) => DecodeResult::UnknownType(envelope),
            Err(e) => DecodeResult::Malformed(e),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::protocol::*;
    use crate::session::types::{CredentialQuery, RequestId, ServiceId};

    fn encode_message(msg: &Message) -> BytesMut {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(msg.clone(), &mut buf).unwrap();
        buf
    }

    fn decode_message(buf: &mut BytesMut) -> Option<Message> {
        let mut codec = MessageCodec::new();
        codec.decode(buf).unwrap()
    }

    #[test]
    fn round_trip_through_codec() {
        let msg = Message::Hello {
            id: 0,
            version: PROTOCOL_VERSION,
            role: Role::Provider,
        };

        let mut buf = encode_message(&msg);
        let decoded = decode_message(&mut buf).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn partial_header_returns_none() {
        let mut codec = MessageCodec::new();
        // Only 2 bytes of the 4-byte header.
        let mut buf = BytesMut::from(&[0u8, 0][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn partial_payload_returns_none() {
        let msg = Message::ListProviders { id: 1 };
        let mut full = encode_message(&msg);

        // Take only the header + half the payload.
        let half = full.len() / 2;
        let mut partial = full.split_to(half);

        let mut codec = MessageCodec::new();
        assert!(codec.decode(&mut partial).unwrap().is_none());

        // Feed the rest.
        partial.extend_from_slice(&full);
        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn multiple_messages_in_buffer() {
        let msg1 = Message::ListProviders { id: 1 };
        let msg2 = Message::CancelRequest {
            id: 2,
            request: RequestId::new("req-1"),
        };

        let mut buf = BytesMut::new();
        let mut codec = MessageCodec::new();
        codec.encode(msg1.clone(), &mut buf).unwrap();
        codec.encode(msg2.clone(), &mut buf).unwrap();

        let mut codec = MessageCodec::new();
        let decoded1 = codec.decode(&mut buf).unwrap().unwrap();
        let decoded2 = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded1, msg1);
        assert_eq!(decoded2, msg2);
    }

    #[test]
    fn binary_query_data_fidelity() {
        let data: Vec<u8> = (0..=255).collect();
        let msg = Message::GetCredentials {
            id: 1,
            caller: "com.example.app".into(),
            options: vec![CredentialQuery {
                credential_type: "passkey".into(),
                query_data: data.clone(),
            }],
        };

        let mut buf = encode_message(&msg);
        let decoded = decode_message(&mut buf).unwrap();
        match decoded {
            Message::GetCredentials { options, .. } => {
                assert_eq!(options[0].query_data, data);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn payload_too_large_on_decode() {
        let mut buf = BytesMut::new();
        // Write a length header claiming 5 MiB.
        buf.put_u32((5 * 1024 * 1024) as u32);
        buf.extend_from_slice(&[0u8; 100]); // some dummy data

        let mut codec = MessageCodec::new();
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::PayloadTooLarge(_)));
    }

    #[test]
    fn empty_buffer_returns_none() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn frame_length_header_is_big_endian() {
        let msg = Message::ListProviders { id: 0 };
        let buf = encode_message(&msg);

        // Read the first 4 bytes as big-endian u32.
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        // The remaining bytes should be exactly that length.
        assert_eq!(buf.len() - 4, len);
    }

    // -- Two-phase decode --

    #[test]
    fn decode_frame_known_message() {
        let msg = Message::BeginClear {
            id: 0,
            request: RequestId::new("req-1"),
        };
        let payload = rmp_serde::to_vec_named(&msg).unwrap();
        match decode_frame(&payload) {
            DecodeResult::Ok(decoded) => assert_eq!(decoded, msg),
            other => panic!("expected Ok, got {other:?}"),
        }
    }

    #[test]
    fn decode_frame_unknown_type_yields_envelope() {
        #[derive(serde::Serialize)]
        struct Unknown {
            #[serde(rename = "type")]
            msg_type: &'static str,
            id: u32,
        }
        let payload = rmp_serde::to_vec_named(&Unknown {
            msg_type: "no_such_message",
            id: 9,
        })
        .unwrap();
        match decode_frame(&payload) {
            DecodeResult::UnknownType(envelope) => assert_eq!(envelope.id, 9),
            other => panic!("expected UnknownType, got {other:?}"),
        }
    }

    #[test]
    fn decode_frame_garbage_is_malformed() {
        match decode_frame(&[0xc1, 0xff, 0x00]) {
            DecodeResult::Malformed(_) => {}
            other => panic!("expected Malformed, got {other:?}"),
        }
    }

    #[test]
    fn frame_codec_returns_raw_payload() {
        let msg = Message::DismissChooser {
            id: 0,
            request: RequestId::new("req-1"),
        };
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(msg.clone(), &mut buf).unwrap();

        let raw = codec.decode(&mut buf).unwrap().unwrap();
        let decoded: Message = rmp_serde::from_slice(&raw).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn query_result_survives_frame_codec() {
        let msg = Message::QueryResult {
            id: 4,
            request: RequestId::new("req-2"),
            service: ServiceId::new("com.example.vault"),
            get_entries: None,
            create_entries: None,
            cleared: Some(false),
            error: Some("locked".into()),
        };
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(msg.clone(), &mut buf).unwrap();
        let raw = codec.decode(&mut buf).unwrap().unwrap();
        match decode_frame(&raw) {
            DecodeResult::Ok(decoded) => assert_eq!(decoded, msg),
            other => panic!("expected Ok, got {other:?}"),
        }
    }
}
