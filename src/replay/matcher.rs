//! Best-effort selection of a recorded command for a live one.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::ReplayError;
use crate::mock::{Mock, MockKind, MockStore};
use crate::protocol::{Command, Message, PacketBundle, StmtExecute};

/// Similarity of a recorded request to a live one. Zero means unrelated.
///
/// A matching header (payload length and sequence id) is worth 2, every
/// equal type-specific field 1. Different packet types always score 0.
pub fn score(expected: &PacketBundle, actual: &PacketBundle) -> u32 {
    if expected.packet_type() != actual.packet_type() {
        return 0;
    }

    let mut score = 0;
    if expected.header.payload_length == actual.header.payload_length
        && expected.header.sequence_id == actual.header.sequence_id
    {
        score += 2;
    }

    score += match (&expected.message, &actual.message) {
        (Message::Query(e), Message::Query(a)) | (Message::StmtPrepare(e), Message::StmtPrepare(a)) => {
            same(&e.query, &a.query)
        }
        (Message::StmtExecute(e), Message::StmtExecute(a)) => execute_score(e, a),
        (Message::StmtClose(e), Message::StmtClose(a))
        | (Message::StmtReset(e), Message::StmtReset(a)) => same(&e.statement_id, &a.statement_id),
        (Message::StmtSendLongData(e), Message::StmtSendLongData(a)) => {
            same(&e.statement_id, &a.statement_id)
                + same(&e.parameter_id, &a.parameter_id)
                + same(&e.data, &a.data)
        }
        (Message::InitDb(e), Message::InitDb(a)) => {
            same(&e.command, &a.command) + same(&e.schema, &a.schema)
        }
        (Message::Quit(e), Message::Quit(a))
        | (Message::Ping(e), Message::Ping(a))
        | (Message::Statistics(e), Message::Statistics(a))
        | (Message::Debug(e), Message::Debug(a))
        | (Message::ResetConnection(e), Message::ResetConnection(a)) => same(&e.command, &a.command),
        _ => 0,
    };
    score
}

fn same<T: PartialEq>(a: &T, b: &T) -> u32 {
    u32::from(a == b)
}

fn execute_score(e: &StmtExecute, a: &StmtExecute) -> u32 {
    let mut score = same(&e.status, &a.status)
        + same(&e.statement_id, &a.statement_id)
        + same(&e.flags, &a.flags)
        + same(&e.iteration_count, &a.iteration_count)
        + same(&e.parameters.len(), &a.parameters.len());

    // Only the overlapping prefix is compared when counts differ.
    for (ep, ap) in e.parameters.iter().zip(&a.parameters) {
        if ep.param_type.field_type == ap.param_type.field_type
            && ep.param_type.unsigned() == ap.param_type.unsigned()
            && ep.name == ap.name
            && ep.value == ap.value
        {
            score += 1;
        }
    }
    score
}

/// Pick the best filtered mock for `request` and take it out of the pool.
///
/// Ties go to the earliest mock in recording order. If another session
/// removes the winner first, the pool is scanned again.
pub fn find_best(
    request: &PacketBundle,
    store: &MockStore,
    cancel: &CancellationToken,
) -> Result<Option<Arc<Mock>>, ReplayError> {
    // commands the server never answers can match mocks without responses
    let requires_response = request
        .packet_type()
        .command()
        .map_or(true, Command::expects_response);
    loop {
        if cancel.is_cancelled() {
            return Err(ReplayError::Cancelled);
        }

        let mut best: Option<(u32, Arc<Mock>)> = None;
        for mock in store.filtered_by_kind(MockKind::MySql) {
            if requires_response && mock.responses.is_empty() {
                continue;
            }
            let top = mock
                .requests
                .iter()
                .map(|recorded| score(recorded, request))
                .max()
                .unwrap_or(0);
            let current = best.as_ref().map_or(0, |(s, _)| *s);
            if top > current {
                best = Some((top, mock));
            }
        }

        let Some((top, mock)) = best else {
            return Ok(None);
        };
        if store.delete_filtered(&mock) {
            debug!(mock = %mock.name, score = top, "Matched mock");
            return Ok(Some(mock));
        }
        debug!(mock = %mock.name, "Mock taken concurrently, rescanning");
    }
}
