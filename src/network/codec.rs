//! Frame codec for the Bitcoin wire protocol
//!
//! Every message is preceded by a 24-byte header: network magic, a
//! NUL-padded 12-byte command, the payload length (little-endian) and the
//! first four bytes of the payload's double SHA-256.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::warn;
use tokio_util::codec::{Decoder, Encoder};

use crate::crypto::double_sha256;
use crate::network::message::Message;

/// Size of the frame header
pub const HEADER_SIZE: usize = 24;

/// Largest payload we accept
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;

const COMMAND_SIZE: usize = 12;

/// A framed message whose payload has not been decoded yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub command: String,
    pub payload: Bytes,
}

/// Codec for one network's message frames
#[derive(Debug, Clone)]
pub struct MessageCodec {
    magic: [u8; 4],
}

impl MessageCodec {
    pub fn new(magic: [u8; 4]) -> Self {
        Self { magic }
    }
}

fn checksum(payload: &[u8]) -> [u8; 4] {
    let hash = double_sha256(payload);
    [hash[0], hash[1], hash[2], hash[3]]
}

fn invalid_data(message: String) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, message)
}

impl Encoder<Message> for MessageCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = item.payload();
        let command = item.command().as_bytes();
        if command.len() > COMMAND_SIZE {
            return Err(invalid_data(format!("command too long: {}", item.command())));
        }

        let mut padded = [0u8; COMMAND_SIZE];
        padded[..command.len()].copy_from_slice(command);

        dst.reserve(HEADER_SIZE + payload.len());
        dst.put_slice(&self.magic);
        dst.put_slice(&padded);
        dst.put_u32_le(payload.len() as u32);
        dst.put_slice(&checksum(&payload));
        dst.put_slice(&payload);

        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = RawMessage;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if src.len() < HEADER_SIZE {
                return Ok(None);
            }

            if src[..4] != self.magic {
                return Err(invalid_data("Invalid magic bytes".to_string()));
            }

            let len = u32::from_le_bytes([src[16], src[17], src[18], src[19]]) as usize;
            if len > MAX_MESSAGE_SIZE {
                return Err(invalid_data(format!("Message too large: {} bytes", len)));
            }

            if src.len() < HEADER_SIZE + len {
                src.reserve(HEADER_SIZE + len - src.len());
                return Ok(None);
            }

            let command_bytes = &src[4..4 + COMMAND_SIZE];
            let end = command_bytes
                .iter()
                .position(|b| *b == 0)
                .unwrap_or(COMMAND_SIZE);
            let command = String::from_utf8_lossy(&command_bytes[..end]).into_owned();
            let expected = [src[20], src[21], src[22], src[23]];

            src.advance(HEADER_SIZE);
            let payload = src.split_to(len).freeze();

            // A corrupt frame is dropped; the stream stays aligned
            if checksum(&payload) != expected {
                warn!("Dropping {} message with bad checksum", command);
                continue;
            }

            return Ok(Some(RawMessage { command, payload }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::params::Network;

    fn codec() -> MessageCodec {
        MessageCodec::new(Network::Mainnet.params().magic_bytes())
    }

    #[test]
    fn test_verack_frame_layout() {
        let mut buf = BytesMut::new();
        codec().encode(Message::VerAck, &mut buf).unwrap();
        assert_eq!(
            hex::encode(&buf),
            "f9beb4d976657261636b000000000000000000005df6e0e2"
        );
    }

    #[test]
    fn test_message_codec() {
        let mut codec = codec();
        let mut buf = BytesMut::new();
        codec.encode(Message::Ping(12345), &mut buf).unwrap();

        let raw = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(raw.command, "ping");
        match Message::decode(&raw.command, &raw.payload).unwrap() {
            Message::Ping(nonce) => assert_eq!(nonce, 12345),
            other => panic!("Wrong message type: {:?}", other),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_waits() {
        let mut codec = codec();
        let mut full = BytesMut::new();
        codec.encode(Message::Pong(7), &mut full).unwrap();

        let mut partial = BytesMut::from(&full[..HEADER_SIZE + 3]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&full[HEADER_SIZE + 3..]);
        assert_eq!(codec.decode(&mut partial).unwrap().unwrap().command, "pong");
    }

    #[test]
    fn test_bad_checksum_skipped() {
        let mut codec = codec();
        let mut buf = BytesMut::new();
        codec.encode(Message::Ping(1), &mut buf).unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0xff;
        codec.encode(Message::Ping(2), &mut buf).unwrap();

        let raw = codec.decode(&mut buf).unwrap().unwrap();
        match Message::decode(&raw.command, &raw.payload).unwrap() {
            Message::Ping(nonce) => assert_eq!(nonce, 2),
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_wrong_magic_is_error() {
        let mut buf = BytesMut::new();
        MessageCodec::new(Network::Testnet.params().magic_bytes())
            .encode(Message::VerAck, &mut buf)
            .unwrap();
        assert!(codec().decode(&mut buf).is_err());
    }
}
