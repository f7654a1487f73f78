//! Tagged MySQL messages and the bundles mocks are made of.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::command::{ChangeUser, InitDb, QueryCommand, StatementCommand, StmtSendLongData, UtilityCommand};
use super::error::DecodeError;
use super::packet::Command;
use super::handshake::{
    AuthData, AuthMoreData, AuthSwitchRequest, EofPacket, ErrPacket, HandshakeResponse41,
    HandshakeV10, OkPacket, SslRequest,
};
use super::prepared::{StmtExecute, StmtPrepareOk};
use super::resultset::ResultSet;

/// Every packet kind the replay layer distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketType {
    HandshakeV10,
    HandshakeResponse41,
    SslRequest,
    AuthSwitchRequest,
    AuthSwitchResponse,
    AuthMoreData,
    RequestPublicKey,
    EncryptedPassword,
    Ok,
    Err,
    Eof,
    ComQuit,
    ComInitDb,
    ComQuery,
    ComStatistics,
    ComDebug,
    ComPing,
    ComChangeUser,
    ComResetConnection,
    ComStmtPrepare,
    ComStmtPrepareOk,
    ComStmtExecute,
    ComStmtSendLongData,
    ComStmtClose,
    ComStmtReset,
    TextResultSet,
    BinaryResultSet,
    Unknown,
}

impl PacketType {
    pub fn as_str(self) -> &'static str {
        match self {
            PacketType::HandshakeV10 => "HandshakeV10",
            PacketType::HandshakeResponse41 => "HandshakeResponse41",
            PacketType::SslRequest => "SSLRequest",
            PacketType::AuthSwitchRequest => "AuthSwitchRequest",
            PacketType::AuthSwitchResponse => "AuthSwitchResponse",
            PacketType::AuthMoreData => "AuthMoreData",
            PacketType::RequestPublicKey => "RequestPublicKey",
            PacketType::EncryptedPassword => "EncryptedPassword",
            PacketType::Ok => "OK",
            PacketType::Err => "ERR",
            PacketType::Eof => "EOF",
            PacketType::ComQuit => "COM_QUIT",
            PacketType::ComInitDb => "COM_INIT_DB",
            PacketType::ComQuery => "COM_QUERY",
            PacketType::ComStatistics => "COM_STATISTICS",
            PacketType::ComDebug => "COM_DEBUG",
            PacketType::ComPing => "COM_PING",
            PacketType::ComChangeUser => "COM_CHANGE_USER",
            PacketType::ComResetConnection => "COM_RESET_CONNECTION",
            PacketType::ComStmtPrepare => "COM_STMT_PREPARE",
            PacketType::ComStmtPrepareOk => "COM_STMT_PREPARE_OK",
            PacketType::ComStmtExecute => "COM_STMT_EXECUTE",
            PacketType::ComStmtSendLongData => "COM_STMT_SEND_LONG_DATA",
            PacketType::ComStmtClose => "COM_STMT_CLOSE",
            PacketType::ComStmtReset => "COM_STMT_RESET",
            PacketType::TextResultSet => "TextResultSet",
            PacketType::BinaryResultSet => "BinaryResultSet",
            PacketType::Unknown => "Unknown",
        }
    }
}

impl PacketType {
    /// The command opcode behind a client command type.
    pub fn command(self) -> Option<Command> {
        let command = match self {
            PacketType::ComQuit => Command::Quit,
            PacketType::ComInitDb => Command::InitDb,
            PacketType::ComQuery => Command::Query,
            PacketType::ComStatistics => Command::Statistics,
            PacketType::ComDebug => Command::Debug,
            PacketType::ComPing => Command::Ping,
            PacketType::ComChangeUser => Command::ChangeUser,
            PacketType::ComResetConnection => Command::ResetConnection,
            PacketType::ComStmtPrepare => Command::StmtPrepare,
            PacketType::ComStmtExecute => Command::StmtExecute,
            PacketType::ComStmtSendLongData => Command::StmtSendLongData,
            PacketType::ComStmtClose => Command::StmtClose,
            PacketType::ComStmtReset => Command::StmtReset,
            _ => return None,
        };
        Some(command)
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded packet body; exactly one variant per [`PacketType`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    HandshakeV10(HandshakeV10),
    HandshakeResponse41(HandshakeResponse41),
    SslRequest(SslRequest),
    AuthSwitchRequest(AuthSwitchRequest),
    AuthSwitchResponse(AuthData),
    AuthMoreData(AuthMoreData),
    RequestPublicKey(AuthData),
    EncryptedPassword(AuthData),
    Ok(OkPacket),
    Err(ErrPacket),
    Eof(EofPacket),
    Quit(UtilityCommand),
    InitDb(InitDb),
    Query(QueryCommand),
    Statistics(UtilityCommand),
    Debug(UtilityCommand),
    Ping(UtilityCommand),
    ChangeUser(ChangeUser),
    ResetConnection(UtilityCommand),
    StmtPrepare(QueryCommand),
    StmtPrepareOk(StmtPrepareOk),
    StmtExecute(StmtExecute),
    StmtSendLongData(StmtSendLongData),
    StmtClose(StatementCommand),
    StmtReset(StatementCommand),
    TextResultSet(ResultSet),
    BinaryResultSet(ResultSet),
    Unknown(Bytes),
}

impl Message {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Message::HandshakeV10(_) => PacketType::HandshakeV10,
            Message::HandshakeResponse41(_) => PacketType::HandshakeResponse41,
            Message::SslRequest(_) => PacketType::SslRequest,
            Message::AuthSwitchRequest(_) => PacketType::AuthSwitchRequest,
            Message::AuthSwitchResponse(_) => PacketType::AuthSwitchResponse,
            Message::AuthMoreData(_) => PacketType::AuthMoreData,
            Message::RequestPublicKey(_) => PacketType::RequestPublicKey,
            Message::EncryptedPassword(_) => PacketType::EncryptedPassword,
            Message::Ok(_) => PacketType::Ok,
            Message::Err(_) => PacketType::Err,
            Message::Eof(_) => PacketType::Eof,
            Message::Quit(_) => PacketType::ComQuit,
            Message::InitDb(_) => PacketType::ComInitDb,
            Message::Query(_) => PacketType::ComQuery,
            Message::Statistics(_) => PacketType::ComStatistics,
            Message::Debug(_) => PacketType::ComDebug,
            Message::Ping(_) => PacketType::ComPing,
            Message::ChangeUser(_) => PacketType::ComChangeUser,
            Message::ResetConnection(_) => PacketType::ComResetConnection,
            Message::StmtPrepare(_) => PacketType::ComStmtPrepare,
            Message::StmtPrepareOk(_) => PacketType::ComStmtPrepareOk,
            Message::StmtExecute(_) => PacketType::ComStmtExecute,
            Message::StmtSendLongData(_) => PacketType::ComStmtSendLongData,
            Message::StmtClose(_) => PacketType::ComStmtClose,
            Message::StmtReset(_) => PacketType::ComStmtReset,
            Message::TextResultSet(_) => PacketType::TextResultSet,
            Message::BinaryResultSet(_) => PacketType::BinaryResultSet,
            Message::Unknown(_) => PacketType::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketHeader {
    /// Payload length of the first logical packet of the message.
    pub payload_length: u32,
    pub sequence_id: u8,
    pub packet_type: PacketType,
}

/// A decoded message with its header and free-form annotations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketBundle {
    pub header: PacketHeader,
    pub message: Message,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl PacketBundle {
    /// Build a bundle, rejecting a header tag that disagrees with the message.
    pub fn new(header: PacketHeader, message: Message) -> Result<Self, DecodeError> {
        let bundle = Self {
            header,
            message,
            metadata: BTreeMap::new(),
        };
        bundle.validate()?;
        Ok(bundle)
    }

    pub fn validate(&self) -> Result<(), DecodeError> {
        let message = self.message.packet_type();
        if self.header.packet_type != message {
            return Err(DecodeError::TagMismatch {
                header: self.header.packet_type,
                message,
            });
        }
        Ok(())
    }

    pub fn packet_type(&self) -> PacketType {
        self.header.packet_type
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Client -> server bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Request(pub PacketBundle);

/// Server -> client bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Response(pub PacketBundle);

impl Deref for Request {
    type Target = PacketBundle;

    fn deref(&self) -> &PacketBundle {
        &self.0
    }
}

impl Deref for Response {
    type Target = PacketBundle;

    fn deref(&self) -> &PacketBundle {
        &self.0
    }
}

impl From<PacketBundle> for Request {
    fn from(bundle: PacketBundle) -> Self {
        Request(bundle)
    }
}

impl From<PacketBundle> for Response {
    fn from(bundle: PacketBundle) -> Self {
        Response(bundle)
    }
}
