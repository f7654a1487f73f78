//! Multi-packet server responses: column definitions and result sets.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use super::buf::{put_lenenc_bytes, put_lenenc_int, Reader};
use super::error::DecodeError;
use super::handshake::{is_eof_packet, is_err_packet, EOF_HEADER};
use super::packet::{Packet, MAX_PACKET_SIZE};

/// Column definition (Protocol::ColumnDefinition41)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub sequence_id: u8,
    pub catalog: String,
    pub schema: String,
    pub table: String,
    pub org_table: String,
    pub name: String,
    pub org_name: String,
    pub fixed_length: u64,
    pub character_set: u16,
    pub column_length: u32,
    pub column_type: u8,
    pub flags: u16,
    pub decimals: u8,
    /// Filler and the optional COM_FIELD_LIST default value.
    pub trailing: Bytes,
}

impl ColumnDefinition {
    pub fn parse(packet: &Packet) -> Result<Self, DecodeError> {
        let mut r = Reader::new(&packet.payload);
        Ok(Self {
            sequence_id: packet.sequence_id,
            catalog: r.lenenc_string("catalog")?,
            schema: r.lenenc_string("schema")?,
            table: r.lenenc_string("table")?,
            org_table: r.lenenc_string("org_table")?,
            name: r.lenenc_string("name")?,
            org_name: r.lenenc_string("org_name")?,
            fixed_length: r.lenenc_int("fixed_length")?,
            character_set: r.u16("character_set")?,
            column_length: r.u32("column_length")?,
            column_type: r.u8("column_type")?,
            flags: r.u16("flags")?,
            decimals: r.u8("decimals")?,
            trailing: r.rest(),
        })
    }

    pub fn to_packet(&self) -> Packet {
        let mut buf = BytesMut::new();
        for field in [
            &self.catalog,
            &self.schema,
            &self.table,
            &self.org_table,
            &self.name,
            &self.org_name,
        ] {
            put_lenenc_bytes(&mut buf, field.as_bytes());
        }
        put_lenenc_int(&mut buf, self.fixed_length);
        buf.put_u16_le(self.character_set);
        buf.put_u32_le(self.column_length);
        buf.put_u8(self.column_type);
        buf.put_u16_le(self.flags);
        buf.put_u8(self.decimals);
        buf.extend_from_slice(&self.trailing);
        Packet::new(self.sequence_id, buf.freeze())
    }
}

/// A text (COM_QUERY) or binary (COM_STMT_EXECUTE) result set. Rows are kept
/// as raw packets; only the metadata is decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSet {
    pub column_count: u64,
    pub metadata_follows: Option<u8>,
    pub columns: Vec<ColumnDefinition>,
    pub eof_after_columns: Option<Packet>,
    pub rows: Vec<Packet>,
    /// EOF, OK-as-EOF or ERR closing the row stream.
    pub terminator: Option<Packet>,
}

impl ResultSet {
    /// Whether the first packet of a response opens a result set rather than
    /// being a single OK/ERR/LOCAL INFILE packet.
    pub fn opens_result_set(first: &Packet) -> bool {
        !matches!(first.first_byte(), None | Some(0x00) | Some(0xff) | Some(0xfb))
    }

    pub fn parse(packets: &[Packet], deprecate_eof: bool) -> Result<Self, DecodeError> {
        let (first, rest) = packets.split_first().ok_or(DecodeError::EmptyPayload)?;
        let mut r = Reader::new(&first.payload);
        let column_count = r.lenenc_int("column_count")?;
        let metadata_follows = if r.is_empty() {
            None
        } else {
            Some(r.u8("metadata_follows")?)
        };

        let width = usize::try_from(column_count)
            .ok()
            .filter(|&n| n <= rest.len())
            .ok_or(DecodeError::Truncated {
                what: "column definitions",
                needed: column_count as usize,
                available: rest.len(),
            })?;
        let columns = rest[..width]
            .iter()
            .map(ColumnDefinition::parse)
            .collect::<Result<Vec<_>, _>>()?;

        let mut remaining = rest[width..].iter().peekable();
        let eof_after_columns = remaining
            .next_if(|p| is_eof_packet(&p.payload))
            .cloned();

        let mut rows = Vec::new();
        let mut terminator = None;
        for packet in remaining.by_ref() {
            if is_row_terminator(&packet.payload, deprecate_eof) {
                terminator = Some(packet.clone());
                break;
            }
            rows.push(packet.clone());
        }

        let trailing = remaining.count();
        if trailing > 0 {
            return Err(DecodeError::malformed(
                "result set",
                format!("{trailing} packets after the terminator"),
            ));
        }

        Ok(Self {
            column_count,
            metadata_follows,
            columns,
            eof_after_columns,
            rows,
            terminator,
        })
    }

    pub fn to_packets(&self, sequence_id: u8) -> Vec<Packet> {
        let mut head = BytesMut::new();
        put_lenenc_int(&mut head, self.column_count);
        if let Some(flag) = self.metadata_follows {
            head.put_u8(flag);
        }

        let mut packets = Vec::with_capacity(self.columns.len() + self.rows.len() + 3);
        packets.push(Packet::new(sequence_id, head.freeze()));
        packets.extend(self.columns.iter().map(ColumnDefinition::to_packet));
        packets.extend(self.eof_after_columns.iter().cloned());
        packets.extend(self.rows.iter().cloned());
        packets.extend(self.terminator.iter().cloned());
        packets
    }
}

fn is_row_terminator(payload: &[u8], deprecate_eof: bool) -> bool {
    if is_err_packet(payload) || is_eof_packet(payload) {
        return true;
    }
    deprecate_eof && payload.first() == Some(&EOF_HEADER) && payload.len() < MAX_PACKET_SIZE
}
