//! MySQL wire protocol: framing, typed messages and context-aware decoding.

mod buf;
pub mod codec;
pub mod command;
pub mod error;
pub mod handshake;
pub mod message;
pub mod packet;
pub mod prepared;
pub mod resultset;
pub mod wire;

pub use codec::{split_packets, PacketCodec};
pub use command::{ChangeUser, InitDb, QueryCommand, StatementCommand, StmtSendLongData, UtilityCommand};
pub use error::{DecodeError, EncodeError};
pub use handshake::{
    is_eof_packet, is_err_packet, is_ok_packet, AuthData, AuthMoreData, AuthMoreDataKind,
    AuthSwitchRequest, EofPacket, ErrPacket, HandshakeResponse41, HandshakeV10, OkPacket,
    SslRequest,
};
pub use message::{Message, PacketBundle, PacketHeader, PacketType, Request, Response};
pub use packet::{capabilities, Command, Packet};
pub use prepared::{ParamType, Parameter, StmtExecute, StmtPrepareOk};
pub use resultset::{ColumnDefinition, ResultSet};
pub use wire::{decode, decode_bytes, decode_response, encode};
