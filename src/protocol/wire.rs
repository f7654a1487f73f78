//! Context-aware translation between logical packets and tagged bundles.

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use super::codec::split_packets;
use super::command::{ChangeUser, InitDb, QueryCommand, StatementCommand, StmtSendLongData, UtilityCommand};
use super::error::{DecodeError, EncodeError};
use super::handshake::{
    AuthData, AuthMoreData, AuthMoreDataKind, AuthSwitchRequest, EofPacket, ErrPacket,
    HandshakeResponse41, HandshakeV10, OkPacket, SslRequest, AUTH_MORE_DATA_HEADER,
    REQUEST_PUBLIC_KEY,
};
use super::message::{Message, PacketBundle, PacketHeader, PacketType};
use super::packet::{Command, Packet};
use super::prepared::{ExecuteLayout, StmtExecute, StmtPrepareOk};
use super::resultset::ResultSet;
use crate::session::{DecodeContext, LastOp};

/// Decode one logical packet.
///
/// Dispatch depends on the last operation recorded in `ctx` and on the first
/// payload byte. Decoding a greeting, a client handshake response or a
/// COM_STMT_PREPARE_OK updates `ctx` accordingly.
pub fn decode(packet: &Packet, ctx: &mut DecodeContext) -> Result<PacketBundle, DecodeError> {
    let payload = &packet.payload;
    let first = *payload.first().ok_or(DecodeError::EmptyPayload)?;

    let message = match ctx.last_op() {
        LastOp::Greeting if SslRequest::matches(payload) => {
            Message::SslRequest(SslRequest::parse(payload)?)
        }
        LastOp::Greeting => Message::HandshakeResponse41(HandshakeResponse41::parse(payload)?),
        LastOp::AuthSwitchRequest => Message::AuthSwitchResponse(AuthData::new(payload.clone())),
        LastOp::AuthMoreData(AuthMoreDataKind::PerformFullAuthentication) => {
            if payload[..] == [REQUEST_PUBLIC_KEY] {
                Message::RequestPublicKey(AuthData::new(payload.clone()))
            } else {
                Message::EncryptedPassword(AuthData::new(payload.clone()))
            }
        }
        // The server answers a key request with AuthMoreData; the client
        // answers the key with its encrypted password.
        LastOp::RequestPublicKey if first == AUTH_MORE_DATA_HEADER => {
            Message::AuthMoreData(AuthMoreData::parse(payload)?)
        }
        LastOp::RequestPublicKey | LastOp::AuthMoreData(AuthMoreDataKind::Data) => {
            Message::EncryptedPassword(AuthData::new(payload.clone()))
        }
        _ => decode_by_opcode(first, packet, ctx)?,
    };

    match &message {
        Message::HandshakeV10(greeting) => ctx.set_server_greeting(greeting.clone()),
        Message::HandshakeResponse41(response) => {
            ctx.set_client_capabilities(response.capability_flags)
        }
        Message::SslRequest(request) => ctx.set_client_capabilities(request.capability_flags),
        Message::AuthSwitchRequest(switch) => ctx.set_plugin_name(switch.plugin_name.clone()),
        Message::StmtPrepareOk(ok) => ctx.insert_prepared_statement(ok.clone()),
        _ => {}
    }
    ctx.set_last_op(LastOp::after(&message));

    bundle_for(packet, message)
}

fn decode_by_opcode(
    first: u8,
    packet: &Packet,
    ctx: &mut DecodeContext,
) -> Result<Message, DecodeError> {
    let payload = &packet.payload;
    let message = match first {
        0x0a if ctx.server_greeting().is_none() => {
            Message::HandshakeV10(HandshakeV10::parse(payload)?)
        }
        0x00 if ctx.last_op() == LastOp::Command(Command::StmtPrepare) => {
            Message::StmtPrepareOk(StmtPrepareOk::parse(std::slice::from_ref(packet))?)
        }
        0x00 => {
            let caps = ctx.server_capabilities().ok_or(DecodeError::MissingGreeting)?;
            Message::Ok(OkPacket::parse(payload, caps)?)
        }
        0xff => Message::Err(ErrPacket::parse(payload)?),
        0xfe if payload.len() < 9 => Message::Eof(EofPacket::parse(payload)?),
        0xfe => Message::AuthSwitchRequest(AuthSwitchRequest::parse(payload)?),
        0x01 if payload.len() == 1 => Message::Quit(UtilityCommand::parse(payload)?),
        0x01 => Message::AuthMoreData(AuthMoreData::parse(payload)?),
        _ => decode_command(first, payload, ctx)?,
    };
    Ok(message)
}

fn decode_command(
    first: u8,
    payload: &Bytes,
    ctx: &mut DecodeContext,
) -> Result<Message, DecodeError> {
    let message = match Command::from(first) {
        Command::InitDb => Message::InitDb(InitDb::parse(payload)?),
        Command::Query => Message::Query(QueryCommand::parse(payload)?),
        Command::Statistics => Message::Statistics(UtilityCommand::parse(payload)?),
        Command::Debug => Message::Debug(UtilityCommand::parse(payload)?),
        Command::Ping => Message::Ping(UtilityCommand::parse(payload)?),
        Command::ChangeUser => Message::ChangeUser(ChangeUser::parse(payload)?),
        Command::ResetConnection => Message::ResetConnection(UtilityCommand::parse(payload)?),
        Command::StmtPrepare => Message::StmtPrepare(QueryCommand::parse(payload)?),
        Command::StmtExecute => Message::StmtExecute(decode_execute(payload, ctx)?),
        Command::StmtSendLongData => Message::StmtSendLongData(StmtSendLongData::parse(payload)?),
        Command::StmtClose => Message::StmtClose(StatementCommand::parse(payload)?),
        Command::StmtReset => Message::StmtReset(StatementCommand::parse(payload)?),
        _ => {
            warn!(
                conn_id = %ctx.conn_id(),
                opcode = first,
                len = payload.len(),
                "Unknown packet, keeping raw bytes"
            );
            Message::Unknown(payload.clone())
        }
    };
    Ok(message)
}

fn decode_execute(payload: &Bytes, ctx: &mut DecodeContext) -> Result<StmtExecute, DecodeError> {
    let statement_id = StmtExecute::peek_statement_id(payload)?;
    let execute = {
        let prepared = ctx
            .prepared_statement(statement_id)
            .ok_or(DecodeError::UnknownStatement(statement_id))?;
        let layout = ExecuteLayout {
            num_params: prepared.num_params,
            query_attributes: ctx.query_attributes(),
            previous_types: ctx.bound_types(statement_id),
        };
        StmtExecute::parse(payload, layout)?
    };
    if execute.new_params_bind_flag != 0 && !execute.parameters.is_empty() {
        ctx.set_bound_types(statement_id, execute.bound_types());
    }
    Ok(execute)
}

fn bundle_for(first: &Packet, message: Message) -> Result<PacketBundle, DecodeError> {
    let header = PacketHeader {
        payload_length: first.payload.len() as u32,
        sequence_id: first.sequence_id,
        packet_type: message.packet_type(),
    };
    PacketBundle::new(header, message)
}

/// Frame raw bytes (reassembling continuations) and decode every packet.
pub fn decode_bytes(raw: &[u8], ctx: &mut DecodeContext) -> Result<Vec<PacketBundle>, DecodeError> {
    split_packets(raw)?
        .iter()
        .map(|packet| decode(packet, ctx))
        .collect()
}

/// Decode a complete server response, which may span several packets.
///
/// After COM_QUERY or COM_STMT_EXECUTE a response that does not start with
/// OK/ERR is a result set; after COM_STMT_PREPARE an OK header introduces
/// COM_STMT_PREPARE_OK with its definitions. Anything else must be a single
/// packet.
pub fn decode_response(
    packets: &[Packet],
    ctx: &mut DecodeContext,
) -> Result<PacketBundle, DecodeError> {
    let first = packets.first().ok_or(DecodeError::EmptyPayload)?;
    let last_op = ctx.last_op();

    let message = if last_op == LastOp::Command(Command::StmtPrepare)
        && first.first_byte() == Some(0x00)
    {
        let ok = StmtPrepareOk::parse(packets)?;
        ctx.insert_prepared_statement(ok.clone());
        Message::StmtPrepareOk(ok)
    } else if let (Some(kind), true) = (
        last_op.result_set_type(),
        ResultSet::opens_result_set(first),
    ) {
        let result_set = ResultSet::parse(packets, ctx.deprecate_eof())?;
        match kind {
            PacketType::BinaryResultSet => Message::BinaryResultSet(result_set),
            _ => Message::TextResultSet(result_set),
        }
    } else if packets.len() == 1 {
        return decode(first, ctx);
    } else {
        return Err(DecodeError::malformed(
            "response",
            format!("{} packets after {:?}", packets.len(), last_op),
        ));
    };

    debug!(
        conn_id = %ctx.conn_id(),
        packet_type = %message.packet_type(),
        packets = packets.len(),
        "Decoded multi-packet response"
    );
    ctx.set_last_op(LastOp::after(&message));
    bundle_for(first, message)
}

/// Encode a bundle into framed wire bytes.
///
/// Multi-packet messages produce every packet of the response. The first
/// packet carries the header's sequence id; nested definitions and rows keep
/// their own.
pub fn encode(bundle: &PacketBundle, ctx: &mut DecodeContext) -> Result<Bytes, EncodeError> {
    let message_type = bundle.message.packet_type();
    if bundle.header.packet_type != message_type {
        return Err(EncodeError::TagMismatch {
            header: bundle.header.packet_type,
            message: message_type,
        });
    }

    let seq = bundle.header.sequence_id;
    let packets = match &bundle.message {
        Message::StmtPrepareOk(ok) => {
            if ok.param_defs.len() != ok.num_params as usize
                || ok.column_defs.len() != ok.num_columns as usize
            {
                return Err(EncodeError::Invalid {
                    packet_type: message_type,
                    reason: "definition count disagrees with header".into(),
                });
            }
            ok.to_packets(seq)
        }
        Message::TextResultSet(rs) | Message::BinaryResultSet(rs) => {
            if rs.columns.len() as u64 != rs.column_count {
                return Err(EncodeError::Invalid {
                    packet_type: message_type,
                    reason: format!(
                        "{} column definitions for {} columns",
                        rs.columns.len(),
                        rs.column_count
                    ),
                });
            }
            rs.to_packets(seq)
        }
        message => vec![Packet::new(seq, encode_payload(message))],
    };

    let mut out = BytesMut::with_capacity(packets.iter().map(Packet::wire_len).sum());
    for packet in &packets {
        packet.encode(&mut out);
    }

    match &bundle.message {
        Message::HandshakeV10(greeting) => ctx.set_server_greeting(greeting.clone()),
        Message::AuthSwitchRequest(switch) => ctx.set_plugin_name(switch.plugin_name.clone()),
        _ => {}
    }
    ctx.set_last_op(LastOp::after(&bundle.message));

    Ok(out.freeze())
}

fn encode_payload(message: &Message) -> Bytes {
    let mut buf = BytesMut::new();
    match message {
        Message::HandshakeV10(m) => m.encode(&mut buf),
        Message::HandshakeResponse41(m) => m.encode(&mut buf),
        Message::SslRequest(m) => m.encode(&mut buf),
        Message::AuthSwitchRequest(m) => m.encode(&mut buf),
        Message::AuthMoreData(m) => m.encode(&mut buf),
        Message::AuthSwitchResponse(m)
        | Message::RequestPublicKey(m)
        | Message::EncryptedPassword(m) => buf.extend_from_slice(&m.data),
        Message::Ok(m) => m.encode(&mut buf),
        Message::Err(m) => m.encode(&mut buf),
        Message::Eof(m) => m.encode(&mut buf),
        Message::Quit(m)
        | Message::Statistics(m)
        | Message::Debug(m)
        | Message::Ping(m)
        | Message::ResetConnection(m) => m.encode(&mut buf),
        Message::InitDb(m) => m.encode(&mut buf),
        Message::Query(m) | Message::StmtPrepare(m) => m.encode(&mut buf),
        Message::ChangeUser(m) => m.encode(&mut buf),
        Message::StmtExecute(m) => m.encode(&mut buf),
        Message::StmtSendLongData(m) => m.encode(&mut buf),
        Message::StmtClose(m) | Message::StmtReset(m) => m.encode(&mut buf),
        Message::Unknown(raw) => buf.extend_from_slice(raw),
        // Multi-packet messages: only the leading packet's payload.
        Message::StmtPrepareOk(ok) => return leading_payload(ok.to_packets(0)),
        Message::TextResultSet(rs) | Message::BinaryResultSet(rs) => {
            return leading_payload(rs.to_packets(0))
        }
    }
    buf.freeze()
}

fn leading_payload(packets: Vec<Packet>) -> Bytes {
    packets.into_iter().next().map(|p| p.payload).unwrap_or_default()
}
