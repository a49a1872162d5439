use bincode::Options;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub mod frame;

pub use frame::{
    CodecError, Frame, FrameDecoder, FrameHeader, HEADER_SIZE, MAX_FRAME_SIZE, MAX_PAYLOAD_SIZE,
};

pub const CLIENT_VERSION: u32 = 1;

/// Numeric type tags for the built-in messages.
pub mod msg_type {
    pub const CONNECT: u16 = 1001;
    pub const CONNECTED: u16 = 1002;
    pub const HEARTBEAT: u16 = 1003;
    pub const DISCONNECTED: u16 = 1004;
    pub const TALK: u16 = 1005;
    pub const DISCONNECT: u16 = 1006;
}

// Fixed-width little-endian integers, u64 length prefixes, no trailing bytes.
fn payload_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .with_limit(MAX_PAYLOAD_SIZE as u64)
}

/// A message with a stable type tag and a fixed binary layout.
///
/// The layout is the field order of the implementing struct. `decode` is the
/// left inverse of `encode` for every value.
pub trait WireMessage: Serialize + DeserializeOwned + Send + 'static {
    const TYPE_ID: u16;

    fn encode_payload(&self) -> Result<Bytes, CodecError> {
        payload_options()
            .serialize(self)
            .map(Bytes::from)
            .map_err(|e| match *e {
                bincode::ErrorKind::SizeLimit => CodecError::FrameTooLarge(MAX_PAYLOAD_SIZE + 1),
                other => CodecError::Payload {
                    type_id: Self::TYPE_ID,
                    reason: other.to_string(),
                },
            })
    }

    fn decode_payload(payload: &[u8]) -> Result<Self, CodecError> {
        payload_options()
            .deserialize(payload)
            .map_err(|e| CodecError::Payload {
                type_id: Self::TYPE_ID,
                reason: e.to_string(),
            })
    }

    fn to_frame(&self) -> Result<Frame, CodecError> {
        Frame::new(Self::TYPE_ID, self.encode_payload()?)
    }

    fn from_frame(frame: &Frame) -> Result<Self, CodecError> {
        if frame.type_id != Self::TYPE_ID {
            return Err(CodecError::TypeMismatch {
                expected: Self::TYPE_ID,
                actual: frame.type_id,
            });
        }
        Self::decode_payload(&frame.payload)
    }

    /// Encodes the message as a complete frame, header included.
    fn encode(&self) -> Result<Bytes, CodecError> {
        Ok(self.to_frame()?.encode())
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Self::from_frame(&Frame::parse(bytes)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connect {
    pub client_version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connected {
    pub client_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disconnected {
    pub reason: String,
}

/// Chat line. An empty `recipient` means everyone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Talk {
    pub sender: String,
    pub recipient: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disconnect;

impl WireMessage for Connect {
    const TYPE_ID: u16 = msg_type::CONNECT;
}

impl WireMessage for Connected {
    const TYPE_ID: u16 = msg_type::CONNECTED;
}

impl WireMessage for Heartbeat {
    const TYPE_ID: u16 = msg_type::HEARTBEAT;
}

impl WireMessage for Disconnected {
    const TYPE_ID: u16 = msg_type::DISCONNECTED;
}

impl WireMessage for Talk {
    const TYPE_ID: u16 = msg_type::TALK;
}

impl WireMessage for Disconnect {
    const TYPE_ID: u16 = msg_type::DISCONNECT;
}
