//! Per-connection decode state.

mod state;

pub use state::{LastOp, PhaseError, SessionPhase};

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::protocol::{capabilities, HandshakeV10, ParamType, StmtPrepareOk};

static CONNECTION_COUNTER: AtomicU32 = AtomicU32::new(1);

/// Identifier of one client connection, unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u32);

impl ConnectionId {
    pub fn next() -> Self {
        ConnectionId(CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// State the codec needs to interpret packets on one connection.
///
/// Owned by the connection's task; never shared. Phase transitions are
/// reserved to the replay simulators.
#[derive(Debug)]
pub struct DecodeContext {
    conn_id: ConnectionId,
    phase: SessionPhase,
    last_op: LastOp,
    server_greeting: Option<HandshakeV10>,
    client_capabilities: u32,
    plugin_name: String,
    prepared_statements: HashMap<u32, StmtPrepareOk>,
    bound_types: HashMap<u32, Vec<ParamType>>,
}

impl DecodeContext {
    pub fn new(conn_id: ConnectionId) -> Self {
        Self {
            conn_id,
            phase: SessionPhase::Fresh,
            last_op: LastOp::None,
            server_greeting: None,
            client_capabilities: 0,
            plugin_name: String::new(),
            prepared_statements: HashMap::new(),
            bound_types: HashMap::new(),
        }
    }

    pub fn conn_id(&self) -> ConnectionId {
        self.conn_id
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub(crate) fn advance(&mut self, next: SessionPhase) -> Result<(), PhaseError> {
        if !self.phase.can_advance_to(next) {
            return Err(PhaseError {
                from: self.phase,
                to: next,
            });
        }
        debug!(conn_id = %self.conn_id, from = %self.phase, to = %next, "Phase transition");
        self.phase = next;
        Ok(())
    }

    /// Move to `Closed`; always legal.
    pub(crate) fn close(&mut self) {
        self.phase = SessionPhase::Closed;
    }

    pub fn last_op(&self) -> LastOp {
        self.last_op
    }

    pub(crate) fn set_last_op(&mut self, op: LastOp) {
        self.last_op = op;
    }

    pub fn server_greeting(&self) -> Option<&HandshakeV10> {
        self.server_greeting.as_ref()
    }

    pub(crate) fn set_server_greeting(&mut self, greeting: HandshakeV10) {
        self.plugin_name = greeting.auth_plugin_name.clone();
        self.server_greeting = Some(greeting);
    }

    pub fn server_capabilities(&self) -> Option<u32> {
        self.server_greeting.as_ref().map(|g| g.capability_flags)
    }

    pub fn client_capabilities(&self) -> u32 {
        self.client_capabilities
    }

    pub(crate) fn set_client_capabilities(&mut self, flags: u32) {
        self.client_capabilities = flags;
    }

    /// Capabilities both sides agreed on. Before the client has answered the
    /// server's flags stand alone.
    pub fn negotiated_capabilities(&self) -> u32 {
        let server = self.server_capabilities().unwrap_or(0);
        if self.client_capabilities == 0 {
            server
        } else {
            server & self.client_capabilities
        }
    }

    pub fn deprecate_eof(&self) -> bool {
        self.negotiated_capabilities() & capabilities::CLIENT_DEPRECATE_EOF != 0
    }

    pub fn query_attributes(&self) -> bool {
        self.negotiated_capabilities() & capabilities::CLIENT_QUERY_ATTRIBUTES != 0
    }

    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    pub(crate) fn set_plugin_name(&mut self, name: impl Into<String>) {
        self.plugin_name = name.into();
    }

    pub fn prepared_statement(&self, statement_id: u32) -> Option<&StmtPrepareOk> {
        self.prepared_statements.get(&statement_id)
    }

    pub(crate) fn insert_prepared_statement(&mut self, ok: StmtPrepareOk) {
        self.prepared_statements.insert(ok.statement_id, ok);
    }

    pub(crate) fn remove_prepared_statement(&mut self, statement_id: u32) -> Option<StmtPrepareOk> {
        self.bound_types.remove(&statement_id);
        self.prepared_statements.remove(&statement_id)
    }

    pub(crate) fn bound_types(&self, statement_id: u32) -> Option<&[ParamType]> {
        self.bound_types.get(&statement_id).map(Vec::as_slice)
    }

    pub(crate) fn set_bound_types(&mut self, statement_id: u32, types: Vec<ParamType>) {
        self.bound_types.insert(statement_id, types);
    }
}
