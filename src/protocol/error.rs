use thiserror::Error;

use super::message::PacketType;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("truncated {what}: need {needed} bytes, have {available}")]
    Truncated {
        what: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("empty payload")]
    EmptyPayload,

    #[error("header tag {header} does not match message {message}")]
    TagMismatch {
        header: PacketType,
        message: PacketType,
    },

    #[error("unknown prepared statement id {0}")]
    UnknownStatement(u32),

    #[error("no server greeting in decode context")]
    MissingGreeting,

    #[error("malformed {what}: {reason}")]
    Malformed { what: &'static str, reason: String },

    #[error("unsupported parameter type 0x{0:02x}")]
    UnsupportedParameterType(u8),

    #[error("framing error: {0}")]
    Framing(#[from] std::io::Error),
}

impl DecodeError {
    pub(crate) fn malformed(what: &'static str, reason: impl Into<String>) -> Self {
        DecodeError::Malformed {
            what,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("header tag {header} does not match message {message}")]
    TagMismatch {
        header: PacketType,
        message: PacketType,
    },

    #[error("cannot encode {packet_type}: {reason}")]
    Invalid {
        packet_type: PacketType,
        reason: String,
    },
}
