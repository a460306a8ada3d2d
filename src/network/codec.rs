use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::io::{Error, ErrorKind};
use tokio_util::codec::{Decoder, Encoder};

use super::cipher::FrameCipher;
use crate::raft::rpc::RaftMessage;
use crate::raft::types::NodeId;

// Constants for message size management
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024; // 64MB - prevent DoS attacks

const LEN_PREFIX: usize = 4;

// Network message envelope that can carry different types of messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NetworkMessage {
    /// First frame on every connection: who is writing
    Hello(NodeId),
    Raft(RaftMessage),
    /// Keeps an idle connection alive
    Heartbeat,
}

/// Length-prefixed bincode frames, optionally sealed with a `FrameCipher`.
///
/// Wire layout: `[len u32 BE][payload]`.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    cipher: Option<FrameCipher>,
    max_frame: usize,
}

impl MessageCodec {
    pub fn new(cipher: Option<FrameCipher>) -> Self {
        Self {
            cipher,
            max_frame: MAX_MESSAGE_SIZE,
        }
    }

    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame;
        self
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Decoder for MessageCodec {
    type Item = NetworkMessage;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> std::io::Result<Option<NetworkMessage>> {
        if src.len() < LEN_PREFIX {
            return Ok(None);
        }

        // Read 4-byte length prefix to know exact message size
        let mut len_bytes = [0u8; LEN_PREFIX];
        len_bytes.copy_from_slice(&src[..LEN_PREFIX]);
        let len = u32::from_be_bytes(len_bytes) as usize;

        // Validate message size to prevent DoS attacks
        if len > self.max_frame {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("Message size {} exceeds maximum {}", len, self.max_frame),
            ));
        }

        if len == 0 {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "Message size cannot be zero",
            ));
        }

        if src.len() < LEN_PREFIX + len {
            src.reserve(LEN_PREFIX + len - src.len());
            return Ok(None);
        }

        src.advance(LEN_PREFIX);
        let frame = src.split_to(len);

        let payload = match &self.cipher {
            Some(cipher) => cipher.open(&frame)?,
            None => frame.to_vec(),
        };

        bincode::deserialize(&payload)
            .map(Some)
            .map_err(|e| Error::new(ErrorKind::InvalidData, format!("Deserialization error: {}", e)))
    }
}

impl Encoder<NetworkMessage> for MessageCodec {
    type Error = Error;

    fn encode(&mut self, item: NetworkMessage, dst: &mut BytesMut) -> std::io::Result<()> {
        let bytes = bincode::serialize(&item)
            .map_err(|e| Error::new(ErrorKind::InvalidData, format!("Serialization error: {}", e)))?;

        let bytes = match &self.cipher {
            Some(cipher) => cipher.seal(&bytes)?,
            None => bytes,
        };

        // Validate serialized size
        if bytes.len() > self.max_frame {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("Serialized message size {} exceeds maximum", bytes.len()),
            ));
        }

        // Write 4-byte length prefix + payload
        dst.reserve(LEN_PREFIX + bytes.len());
        dst.put_u32(bytes.len() as u32);
        dst.extend_from_slice(&bytes);
        Ok(())
    }
}
