//! Replays the command phase: one recorded response per live command.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::io::PacketStream;
use super::matcher::find_best;
use super::{ReplayError, SessionEnd};
use crate::metrics::metrics;
use crate::mock::MockStore;
use crate::protocol::{wire, Message, PacketType};
use crate::session::{DecodeContext, SessionPhase};

pub(crate) async fn simulate_command_phase<S>(
    stream: &mut PacketStream<S>,
    ctx: &mut DecodeContext,
    store: &MockStore,
    cancel: &CancellationToken,
) -> Result<SessionEnd, ReplayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    ctx.advance(SessionPhase::CommandPhase)?;

    loop {
        let Some(packet) = stream.read_packet().await? else {
            info!(conn_id = %ctx.conn_id(), "Client disconnected");
            return Ok(SessionEnd::Disconnected);
        };
        let request = wire::decode(&packet, ctx)?;
        let command = request.packet_type();
        debug!(conn_id = %ctx.conn_id(), %command, len = request.header.payload_length, "Command received");

        let Some(mock) = find_best(&request, store, cancel)? else {
            if command == PacketType::ComQuit {
                info!(conn_id = %ctx.conn_id(), "Client sent QUIT");
                return Ok(SessionEnd::Quit);
            }
            warn!(conn_id = %ctx.conn_id(), %command, "No matching mock");
            metrics().record_unmatched(command.as_str());
            return Err(ReplayError::NoMatchingMock { command });
        };
        metrics().record_matched(command.as_str());

        match &request.message {
            Message::Quit(_) => {
                info!(conn_id = %ctx.conn_id(), mock = %mock.name, "Client sent QUIT");
                return Ok(SessionEnd::Quit);
            }
            Message::StmtClose(close) => {
                ctx.remove_prepared_statement(close.statement_id);
                debug!(conn_id = %ctx.conn_id(), statement_id = close.statement_id, "Statement closed");
                continue;
            }
            Message::StmtSendLongData(_) => continue,
            _ => {}
        }

        let response = mock
            .responses
            .first()
            .ok_or_else(|| ReplayError::MalformedMock {
                name: mock.name.clone(),
                reason: format!("no response recorded for {command}"),
            })?;
        stream.send_bundle(response, ctx).await?;

        if let Message::StmtPrepareOk(ok) = &response.message {
            debug!(
                conn_id = %ctx.conn_id(),
                statement_id = ok.statement_id,
                num_params = ok.num_params,
                "Statement prepared"
            );
            ctx.insert_prepared_statement(ok.clone());
        }
    }
}
