//! Codec for encoding/decoding tunnel messages

use crate::PROTOCOL_VERSION;
use bytes::{Bytes, BytesMut};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};
use thiserror::Error;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Compression error: {0}")]
    CompressionError(#[from] std::io::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("Empty message body")]
    EmptyMessage,
}

/// Tunnel message codec
pub struct TunnelCodec;

impl TunnelCodec {
    /// Maximum message size (16MB), applied to frames and to decompressed bodies
    pub const MAX_MESSAGE_SIZE: usize = crate::MAX_FRAME_SIZE as usize;

    /// Length header size
    pub const HEADER_SIZE: usize = 4;

    /// Prefix a payload with its length
    ///
    /// Format: [length: u32 big-endian][payload]
    pub fn frame(payload: &[u8]) -> Result<Bytes, CodecError> {
        if payload.len() > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(payload.len()));
        }

        let mut buf = BytesMut::with_capacity(Self::HEADER_SIZE + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(payload);

        Ok(buf.freeze())
    }

    /// Extract one frame payload from the front of `buf`
    ///
    /// Returns Ok(None) and leaves `buf` untouched if the header or the body is not
    /// fully buffered yet.
    pub fn unframe(buf: &mut BytesMut) -> Result<Option<BytesMut>, CodecError> {
        // Need at least 4 bytes for length header
        if buf.len() < Self::HEADER_SIZE {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[..Self::HEADER_SIZE]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(length));
        }

        if buf.len() < Self::HEADER_SIZE + length {
            return Ok(None);
        }

        let _ = buf.split_to(Self::HEADER_SIZE);
        Ok(Some(buf.split_to(length)))
    }

    /// Encode a message to a complete frame
    ///
    /// Format: [length: u32][deflate([version: u8][bincode serialized message])]
    pub fn encode<M: Serialize>(msg: &M) -> Result<Bytes, CodecError> {
        let mut body = vec![PROTOCOL_VERSION];
        bincode::serialize_into(&mut body, msg)?;

        let compressed = compress(&body)?;
        Self::frame(&compressed)
    }

    /// Decode a message from the front of `buf`
    ///
    /// Returns Ok(Some(message)) if a complete message was decoded,
    /// Ok(None) if more data is needed,
    /// Err on error
    pub fn decode<M: DeserializeOwned>(buf: &mut BytesMut) -> Result<Option<M>, CodecError> {
        let payload = match Self::unframe(buf)? {
            Some(payload) => payload,
            None => return Ok(None),
        };

        let body = decompress(&payload)?;
        let (version, msg_bytes) = body.split_first().ok_or(CodecError::EmptyMessage)?;
        if *version != PROTOCOL_VERSION {
            return Err(CodecError::UnsupportedVersion(*version));
        }

        let msg: M = bincode::deserialize(msg_bytes)?;
        Ok(Some(msg))
    }

    /// Try to decode multiple messages from buffer
    pub fn decode_all<M: DeserializeOwned>(buf: &mut BytesMut) -> Result<Vec<M>, CodecError> {
        let mut messages = Vec::new();

        while let Some(msg) = Self::decode(buf)? {
            messages.push(msg);
        }

        Ok(messages)
    }
}

fn compress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut encoder = DeflateEncoder::new(Vec::with_capacity(data.len() / 2 + 16), Compression::fast());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn decompress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let limit = TunnelCodec::MAX_MESSAGE_SIZE;
    let mut out = Vec::with_capacity(data.len() * 2);
    DeflateDecoder::new(data)
        .take(limit as u64 + 1)
        .read_to_end(&mut out)?;

    if out.len() > limit {
        return Err(CodecError::MessageTooLarge(out.len()));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{ClientMessage, Request, Response, ServerMessage, CMD_CONNECT};

    fn request() -> ClientMessage {
        ClientMessage::Request(Request {
            password: "secret".to_string(),
            command: CMD_CONNECT,
            addr: "example.com".to_string(),
            port: 443,
        })
    }

    #[test]
    fn test_encode_decode() {
        let msg = request();

        let encoded = TunnelCodec::encode(&msg).unwrap();
        let mut buf = BytesMut::from(encoded.as_ref());

        let decoded: Option<ClientMessage> = TunnelCodec::decode(&mut buf).unwrap();
        assert_eq!(decoded, Some(msg));
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_length_prefix_matches_compressed_body() {
        let encoded = TunnelCodec::encode(&ClientMessage::Data(vec![7u8; 4096])).unwrap();
        let length = u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]) as usize;

        assert_eq!(length, encoded.len() - 4);
        // Repetitive payloads shrink
        assert!(encoded.len() < 4096);
    }

    #[test]
    fn test_frame_round_trip_split_anywhere() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(600).collect();
        let framed = TunnelCodec::frame(&payload).unwrap();

        for split in 0..framed.len() {
            let mut buf = BytesMut::from(&framed[..split]);
            assert!(TunnelCodec::unframe(&mut buf).unwrap().is_none());
            assert_eq!(buf.len(), split, "incomplete frame must not be consumed");

            buf.extend_from_slice(&framed[split..]);
            let out = TunnelCodec::unframe(&mut buf).unwrap().unwrap();
            assert_eq!(&out[..], &payload[..]);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_empty_payload_frame() {
        let framed = TunnelCodec::frame(&[]).unwrap();
        assert_eq!(&framed[..], &[0, 0, 0, 0]);

        let mut buf = BytesMut::from(framed.as_ref());
        let out = TunnelCodec::unframe(&mut buf).unwrap().unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_decode_incomplete() {
        let msg = ServerMessage::Response(Response::failure(crate::ReplyCode::Timeout));
        let encoded = TunnelCodec::encode(&msg).unwrap();

        // Only provide length header
        let mut buf = BytesMut::from(&encoded[..4]);
        let result: Option<ServerMessage> = TunnelCodec::decode(&mut buf).unwrap();
        assert_eq!(result, None);

        // Provide rest of message
        buf.extend_from_slice(&encoded[4..]);
        let result: Option<ServerMessage> = TunnelCodec::decode(&mut buf).unwrap();
        assert_eq!(result, Some(msg));
    }

    #[test]
    fn test_decode_multiple() {
        let msg1 = request();
        let msg2 = ClientMessage::Data(b"GET / HTTP/1.1\r\n\r\n".to_vec());

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&TunnelCodec::encode(&msg1).unwrap());
        buf.extend_from_slice(&TunnelCodec::encode(&msg2).unwrap());
        // Trailing partial frame stays buffered
        buf.extend_from_slice(&[0, 0]);

        let messages: Vec<ClientMessage> = TunnelCodec::decode_all(&mut buf).unwrap();
        assert_eq!(messages, vec![msg1, msg2]);
        assert_eq!(&buf[..], &[0, 0]);
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&(TunnelCodec::MAX_MESSAGE_SIZE as u32 + 1).to_be_bytes());

        let result = TunnelCodec::unframe(&mut buf);
        assert!(matches!(result, Err(CodecError::MessageTooLarge(_))));
    }

    #[test]
    fn test_corrupt_body_is_an_error() {
        let framed = TunnelCodec::frame(&[0xff; 8]).unwrap();
        let mut buf = BytesMut::from(framed.as_ref());

        let result: Result<Option<ClientMessage>, _> = TunnelCodec::decode(&mut buf);
        assert!(result.is_err());
    }

    #[test]
    fn test_unsupported_version() {
        let mut body = vec![PROTOCOL_VERSION + 1];
        bincode::serialize_into(&mut body, &ClientMessage::Data(vec![1])).unwrap();
        let framed = TunnelCodec::frame(&compress(&body).unwrap()).unwrap();
        let mut buf = BytesMut::from(framed.as_ref());

        let result: Result<Option<ClientMessage>, _> = TunnelCodec::decode(&mut buf);
        assert!(matches!(result, Err(CodecError::UnsupportedVersion(2))));
    }

    #[test]
    fn test_wrong_schema_is_an_error() {
        // A server response is not a valid client message
        let encoded = TunnelCodec::encode(&ServerMessage::Response(Response {
            rep: 0,
            addr: u32::MAX,
            port: u16::MAX,
        }))
        .unwrap();
        let mut buf = BytesMut::from(encoded.as_ref());

        let result: Result<Option<ClientMessage>, _> = TunnelCodec::decode(&mut buf);
        assert!(result.is_err());
    }
}
