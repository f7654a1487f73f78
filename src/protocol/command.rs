//! Command-phase client packets other than COM_STMT_EXECUTE.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use super::buf::{lossy, Reader};
use super::error::DecodeError;
use super::packet::Command;

/// COM_QUERY and COM_STMT_PREPARE: opcode followed by the statement text.
///
/// The text is kept as raw bytes; any query-attribute prefix a client sends is
/// part of it and compared verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryCommand {
    pub command: u8,
    pub query: Bytes,
}

impl QueryCommand {
    pub fn new(command: Command, query: impl Into<Bytes>) -> Self {
        Self {
            command: command as u8,
            query: query.into(),
        }
    }

    pub fn parse(payload: &Bytes) -> Result<Self, DecodeError> {
        let mut r = Reader::new(payload);
        Ok(Self {
            command: r.u8("command")?,
            query: r.rest(),
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.command);
        buf.extend_from_slice(&self.query);
    }

    /// Statement text for logging.
    pub fn text(&self) -> String {
        lossy(&self.query)
    }
}

/// COM_INIT_DB
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitDb {
    pub command: u8,
    pub schema: String,
}

impl InitDb {
    pub fn parse(payload: &Bytes) -> Result<Self, DecodeError> {
        let mut r = Reader::new(payload);
        Ok(Self {
            command: r.u8("command")?,
            schema: lossy(&r.rest()),
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.command);
        buf.extend_from_slice(self.schema.as_bytes());
    }
}

/// Commands without arguments: COM_QUIT, COM_PING, COM_STATISTICS, COM_DEBUG,
/// COM_RESET_CONNECTION.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtilityCommand {
    pub command: u8,
}

impl UtilityCommand {
    pub fn new(command: Command) -> Self {
        Self {
            command: command as u8,
        }
    }

    pub fn parse(payload: &Bytes) -> Result<Self, DecodeError> {
        let mut r = Reader::new(payload);
        let command = r.u8("command")?;
        if !r.is_empty() {
            return Err(DecodeError::malformed(
                "utility command",
                format!("{} unexpected trailing bytes", r.remaining()),
            ));
        }
        Ok(Self { command })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.command);
    }
}

/// COM_CHANGE_USER, kept opaque.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeUser {
    pub data: Bytes,
}

impl ChangeUser {
    pub fn parse(payload: &Bytes) -> Result<Self, DecodeError> {
        let mut r = Reader::new(payload);
        r.u8("command")?;
        Ok(Self { data: r.rest() })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(Command::ChangeUser as u8);
        buf.extend_from_slice(&self.data);
    }
}

/// COM_STMT_CLOSE and COM_STMT_RESET
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementCommand {
    pub command: u8,
    pub statement_id: u32,
}

impl StatementCommand {
    pub fn new(command: Command, statement_id: u32) -> Self {
        Self {
            command: command as u8,
            statement_id,
        }
    }

    pub fn parse(payload: &Bytes) -> Result<Self, DecodeError> {
        let mut r = Reader::new(payload);
        Ok(Self {
            command: r.u8("command")?,
            statement_id: r.u32("statement_id")?,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.command);
        buf.put_u32_le(self.statement_id);
    }
}

/// COM_STMT_SEND_LONG_DATA
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StmtSendLongData {
    pub statement_id: u32,
    pub parameter_id: u16,
    pub data: Bytes,
}

impl StmtSendLongData {
    pub fn parse(payload: &Bytes) -> Result<Self, DecodeError> {
        let mut r = Reader::new(payload);
        r.u8("command")?;
        Ok(Self {
            statement_id: r.u32("statement_id")?,
            parameter_id: r.u16("parameter_id")?,
            data: r.rest(),
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(Command::StmtSendLongData as u8);
        buf.put_u32_le(self.statement_id);
        buf.put_u16_le(self.parameter_id);
        buf.extend_from_slice(&self.data);
    }
}
