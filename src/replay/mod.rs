//! Replay of recorded MySQL sessions.

mod command;
mod handshake;
mod io;
pub mod matcher;

pub use handshake::{AuthMechanism, HandshakeOutcome};
pub use io::PacketStream;

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::mock::MockStore;
use crate::protocol::{DecodeError, EncodeError, PacketType};
use crate::session::{ConnectionId, DecodeContext, PhaseError};

use command::simulate_command_phase;
use handshake::simulate_handshake;

/// How a replayed session ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The client closed the connection.
    Disconnected,
    /// The client sent COM_QUIT.
    Quit,
    /// The recorded server rejected the login.
    Rejected,
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionEnd::Disconnected => "disconnected",
            SessionEnd::Quit => "quit",
            SessionEnd::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cancelled")]
    Cancelled,

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),

    #[error("{stage} verification failed: expected {expected}, got {actual}")]
    Verification {
        stage: &'static str,
        expected: String,
        actual: String,
    },

    #[error("no MySQL handshake mock available")]
    NoHandshakeMock,

    #[error("mock {name} is malformed: {reason}")]
    MalformedMock { name: String, reason: String },

    #[error("no matching mock for {command}")]
    NoMatchingMock { command: PacketType },

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Phase(#[from] PhaseError),
}

/// One client connection served from the mock store.
pub struct ReplaySession {
    id: ConnectionId,
    store: Arc<MockStore>,
    cancel: CancellationToken,
}

impl ReplaySession {
    pub fn new(id: ConnectionId, store: Arc<MockStore>, cancel: CancellationToken) -> Self {
        Self { id, store, cancel }
    }

    /// Serve the connection until the client leaves, an error occurs or the
    /// token is cancelled.
    #[instrument(skip_all, fields(conn_id = %self.id))]
    pub async fn run<S>(self, stream: S) -> Result<SessionEnd, ReplayError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut ctx = DecodeContext::new(self.id);
        let mut stream = PacketStream::new(stream, self.cancel.clone());
        let result = self.drive(&mut stream, &mut ctx).await;
        ctx.close();
        result
    }

    async fn drive<S>(
        &self,
        stream: &mut PacketStream<S>,
        ctx: &mut DecodeContext,
    ) -> Result<SessionEnd, ReplayError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match simulate_handshake(stream, ctx, &self.store).await? {
            HandshakeOutcome::Authenticated(_) => {}
            HandshakeOutcome::Rejected(_) => return Ok(SessionEnd::Rejected),
            HandshakeOutcome::Disconnected => {
                info!(conn_id = %self.id, "Client disconnected during handshake");
                return Ok(SessionEnd::Disconnected);
            }
        }
        simulate_command_phase(stream, ctx, &self.store, &self.cancel).await
    }
}
