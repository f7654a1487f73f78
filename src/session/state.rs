use std::fmt;

use thiserror::Error;

use crate::protocol::{AuthMoreDataKind, Command, Message, PacketType};

/// Connection lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    Fresh,
    GreetingSent,
    AuthNegotiating,
    Authenticated,
    CommandPhase,
    Closed,
}

impl SessionPhase {
    /// Whether `self -> next` is a legal step. Any phase may close.
    pub fn can_advance_to(self, next: SessionPhase) -> bool {
        use SessionPhase::*;
        matches!(
            (self, next),
            (Fresh, GreetingSent)
                | (GreetingSent, AuthNegotiating)
                | (AuthNegotiating, Authenticated)
                | (Authenticated, CommandPhase)
                | (_, Closed)
        )
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionPhase::Fresh => "fresh",
            SessionPhase::GreetingSent => "greeting-sent",
            SessionPhase::AuthNegotiating => "auth-negotiating",
            SessionPhase::Authenticated => "authenticated",
            SessionPhase::CommandPhase => "command-phase",
            SessionPhase::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("illegal phase transition {from} -> {to}")]
pub struct PhaseError {
    pub from: SessionPhase,
    pub to: SessionPhase,
}

/// The last packet seen or sent on a connection; drives decode dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LastOp {
    #[default]
    None,
    Greeting,
    HandshakeResponse,
    SslRequest,
    AuthSwitchRequest,
    AuthSwitchResponse,
    AuthMoreData(AuthMoreDataKind),
    RequestPublicKey,
    EncryptedPassword,
    Ok,
    Err,
    Eof,
    Command(Command),
    ResultSet,
    Unknown,
}

impl LastOp {
    pub(crate) fn after(message: &Message) -> Self {
        match message {
            Message::HandshakeV10(_) => LastOp::Greeting,
            Message::HandshakeResponse41(_) => LastOp::HandshakeResponse,
            Message::SslRequest(_) => LastOp::SslRequest,
            Message::AuthSwitchRequest(_) => LastOp::AuthSwitchRequest,
            Message::AuthSwitchResponse(_) => LastOp::AuthSwitchResponse,
            Message::AuthMoreData(more) => LastOp::AuthMoreData(more.kind()),
            Message::RequestPublicKey(_) => LastOp::RequestPublicKey,
            Message::EncryptedPassword(_) => LastOp::EncryptedPassword,
            Message::Ok(_) => LastOp::Ok,
            Message::Err(_) => LastOp::Err,
            Message::Eof(_) => LastOp::Eof,
            Message::Quit(_) => LastOp::Command(Command::Quit),
            Message::InitDb(_) => LastOp::Command(Command::InitDb),
            Message::Query(_) => LastOp::Command(Command::Query),
            Message::Statistics(_) => LastOp::Command(Command::Statistics),
            Message::Debug(_) => LastOp::Command(Command::Debug),
            Message::Ping(_) => LastOp::Command(Command::Ping),
            Message::ChangeUser(_) => LastOp::Command(Command::ChangeUser),
            Message::ResetConnection(_) => LastOp::Command(Command::ResetConnection),
            Message::StmtPrepare(_) => LastOp::Command(Command::StmtPrepare),
            Message::StmtExecute(_) => LastOp::Command(Command::StmtExecute),
            Message::StmtSendLongData(_) => LastOp::Command(Command::StmtSendLongData),
            Message::StmtClose(_) => LastOp::Command(Command::StmtClose),
            Message::StmtReset(_) => LastOp::Command(Command::StmtReset),
            Message::StmtPrepareOk(_) | Message::TextResultSet(_) | Message::BinaryResultSet(_) => {
                LastOp::ResultSet
            }
            Message::Unknown(_) => LastOp::Unknown,
        }
    }

    /// Response type a command of this kind produces when it opens a result set.
    pub(crate) fn result_set_type(self) -> Option<PacketType> {
        match self {
            LastOp::Command(Command::Query) => Some(PacketType::TextResultSet),
            LastOp::Command(Command::StmtExecute) => Some(PacketType::BinaryResultSet),
            _ => None,
        }
    }
}
