//! Prepared-statement packets: COM_STMT_PREPARE_OK and COM_STMT_EXECUTE.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use super::buf::{put_lenenc_bytes, put_lenenc_int, Reader};
use super::error::DecodeError;
use super::handshake::is_eof_packet;
use super::packet::{Command, Packet};
use super::resultset::ColumnDefinition;

/// COM_STMT_EXECUTE flag: parameter count is sent explicitly.
pub const PARAMETER_COUNT_AVAILABLE: u8 = 0x08;

/// Unsigned bit in the second byte of a bound parameter type.
pub const UNSIGNED_FLAG: u8 = 0x80;

/// COM_STMT_PREPARE_OK with its parameter and column definitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StmtPrepareOk {
    pub status: u8,
    pub statement_id: u32,
    pub num_columns: u16,
    pub num_params: u16,
    pub filler: u8,
    pub warning_count: u16,
    pub trailing: Bytes,
    pub param_defs: Vec<ColumnDefinition>,
    pub eof_after_params: Option<Packet>,
    pub column_defs: Vec<ColumnDefinition>,
    pub eof_after_columns: Option<Packet>,
}

impl StmtPrepareOk {
    pub fn parse(packets: &[Packet]) -> Result<Self, DecodeError> {
        let (first, rest) = packets.split_first().ok_or(DecodeError::EmptyPayload)?;
        let mut r = Reader::new(&first.payload);
        let status = r.u8("status")?;
        let statement_id = r.u32("statement_id")?;
        let num_columns = r.u16("num_columns")?;
        let num_params = r.u16("num_params")?;
        let filler = r.u8("filler")?;
        let warning_count = r.u16("warning_count")?;
        let trailing = r.rest();

        let mut remaining = rest.iter().peekable();
        let mut take_defs = |count: u16,
                             what: &'static str|
         -> Result<(Vec<ColumnDefinition>, Option<Packet>), DecodeError> {
            let mut defs = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let packet = remaining.next().ok_or(DecodeError::Truncated {
                    what,
                    needed: count as usize,
                    available: defs.len(),
                })?;
                defs.push(ColumnDefinition::parse(packet)?);
            }
            let eof = remaining.next_if(|p| is_eof_packet(&p.payload)).cloned();
            Ok((defs, eof))
        };

        let (param_defs, eof_after_params) = take_defs(num_params, "parameter definitions")?;
        let (column_defs, eof_after_columns) = take_defs(num_columns, "column definitions")?;

        let trailing_packets = remaining.count();
        if trailing_packets > 0 {
            return Err(DecodeError::malformed(
                "COM_STMT_PREPARE_OK",
                format!("{trailing_packets} unexpected packets after definitions"),
            ));
        }

        Ok(Self {
            status,
            statement_id,
            num_columns,
            num_params,
            filler,
            warning_count,
            trailing,
            param_defs,
            eof_after_params,
            column_defs,
            eof_after_columns,
        })
    }

    /// Response packets, the first carrying `sequence_id`.
    pub fn to_packets(&self, sequence_id: u8) -> Vec<Packet> {
        let mut head = BytesMut::with_capacity(12 + self.trailing.len());
        head.put_u8(self.status);
        head.put_u32_le(self.statement_id);
        head.put_u16_le(self.num_columns);
        head.put_u16_le(self.num_params);
        head.put_u8(self.filler);
        head.put_u16_le(self.warning_count);
        head.extend_from_slice(&self.trailing);

        let mut packets = vec![Packet::new(sequence_id, head.freeze())];
        packets.extend(self.param_defs.iter().map(ColumnDefinition::to_packet));
        packets.extend(self.eof_after_params.iter().cloned());
        packets.extend(self.column_defs.iter().map(ColumnDefinition::to_packet));
        packets.extend(self.eof_after_columns.iter().cloned());
        packets
    }
}

/// Wire type of a bound parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamType {
    pub field_type: u8,
    pub flags: u8,
}

impl ParamType {
    pub fn unsigned(self) -> bool {
        self.flags & UNSIGNED_FLAG != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub param_type: ParamType,
    /// Query attribute name; empty for positional parameters.
    pub name: String,
    /// Raw value bytes including any length prefix; `None` when NULL.
    pub value: Option<Bytes>,
}

/// Statement metadata needed to decode a COM_STMT_EXECUTE.
#[derive(Debug, Clone, Copy)]
pub struct ExecuteLayout<'a> {
    pub num_params: u16,
    pub query_attributes: bool,
    /// Types bound by a previous execution, used when the client does not
    /// resend them.
    pub previous_types: Option<&'a [ParamType]>,
}

/// COM_STMT_EXECUTE
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StmtExecute {
    pub status: u8,
    pub statement_id: u32,
    pub flags: u8,
    pub iteration_count: u32,
    /// Explicit parameter count, present with CLIENT_QUERY_ATTRIBUTES.
    pub parameter_count: Option<u64>,
    pub null_bitmap: Bytes,
    pub new_params_bind_flag: u8,
    pub parameters: Vec<Parameter>,
}

impl StmtExecute {
    /// Statement id without decoding the rest, for prepared-statement lookup.
    pub fn peek_statement_id(payload: &Bytes) -> Result<u32, DecodeError> {
        let mut r = Reader::new(payload);
        r.u8("command")?;
        r.u32("statement_id")
    }

    pub fn parse(payload: &Bytes, layout: ExecuteLayout<'_>) -> Result<Self, DecodeError> {
        let mut r = Reader::new(payload);
        let status = r.u8("command")?;
        let statement_id = r.u32("statement_id")?;
        let flags = r.u8("flags")?;
        let iteration_count = r.u32("iteration_count")?;

        let params_present = layout.num_params > 0
            || (layout.query_attributes && flags & PARAMETER_COUNT_AVAILABLE != 0);
        let mut parameter_count = None;
        let mut count = layout.num_params as u64;
        if params_present && layout.query_attributes {
            count = r.lenenc_int("parameter_count")?;
            parameter_count = Some(count);
        }
        if count > u16::MAX as u64 {
            return Err(DecodeError::malformed(
                "COM_STMT_EXECUTE",
                format!("parameter count {count} out of range"),
            ));
        }
        let count = count as usize;

        if !params_present || count == 0 {
            return Ok(Self {
                status,
                statement_id,
                flags,
                iteration_count,
                parameter_count,
                null_bitmap: Bytes::new(),
                new_params_bind_flag: 0,
                parameters: Vec::new(),
            });
        }

        let null_bitmap = r.take("null_bitmap", count.div_ceil(8))?;
        let new_params_bind_flag = r.u8("new_params_bind_flag")?;

        let mut bound = Vec::with_capacity(count);
        if new_params_bind_flag != 0 {
            for _ in 0..count {
                let param_type = ParamType {
                    field_type: r.u8("parameter type")?,
                    flags: r.u8("parameter flags")?,
                };
                let name = if layout.query_attributes {
                    r.lenenc_string("parameter name")?
                } else {
                    String::new()
                };
                bound.push((param_type, name));
            }
        } else {
            let previous = layout
                .previous_types
                .filter(|types| types.len() == count)
                .ok_or_else(|| {
                    DecodeError::malformed("COM_STMT_EXECUTE", "no bound parameter types")
                })?;
            bound.extend(previous.iter().map(|&t| (t, String::new())));
        }

        let mut parameters = Vec::with_capacity(count);
        for (i, (param_type, name)) in bound.into_iter().enumerate() {
            let is_null = null_bitmap[i / 8] & (1 << (i % 8)) != 0;
            let value = if is_null {
                None
            } else {
                Some(read_value(&mut r, param_type.field_type)?)
            };
            parameters.push(Parameter {
                param_type,
                name,
                value,
            });
        }

        Ok(Self {
            status,
            statement_id,
            flags,
            iteration_count,
            parameter_count,
            null_bitmap,
            new_params_bind_flag,
            parameters,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.status);
        buf.put_u32_le(self.statement_id);
        buf.put_u8(self.flags);
        buf.put_u32_le(self.iteration_count);
        if let Some(count) = self.parameter_count {
            put_lenenc_int(buf, count);
        }
        if self.parameters.is_empty() {
            return;
        }
        buf.extend_from_slice(&self.null_bitmap);
        buf.put_u8(self.new_params_bind_flag);
        if self.new_params_bind_flag != 0 {
            for param in &self.parameters {
                buf.put_u8(param.param_type.field_type);
                buf.put_u8(param.param_type.flags);
                if self.parameter_count.is_some() {
                    put_lenenc_bytes(buf, param.name.as_bytes());
                }
            }
        }
        for value in self.parameters.iter().filter_map(|p| p.value.as_ref()) {
            buf.extend_from_slice(value);
        }
    }

    pub fn bound_types(&self) -> Vec<ParamType> {
        self.parameters.iter().map(|p| p.param_type).collect()
    }

    pub fn command(&self) -> Command {
        Command::from(self.status)
    }
}

/// Read one binary-protocol value, returning its raw bytes.
fn read_value(r: &mut Reader<'_>, field_type: u8) -> Result<Bytes, DecodeError> {
    match field_type {
        // NULL
        0x06 => Ok(Bytes::new()),
        // TINY
        0x01 => r.take("TINY value", 1),
        // SHORT, YEAR
        0x02 | 0x0d => r.take("SHORT value", 2),
        // LONG, FLOAT, INT24
        0x03 | 0x04 | 0x09 => r.take("LONG value", 4),
        // LONGLONG, DOUBLE
        0x08 | 0x05 => r.take("LONGLONG value", 8),
        // TIMESTAMP, DATE, TIME, DATETIME and their fractional variants
        0x07 | 0x0a | 0x0b | 0x0c | 0x11 | 0x12 | 0x13 => {
            let len = r.peek().ok_or(DecodeError::Truncated {
                what: "temporal value",
                needed: 1,
                available: 0,
            })? as usize;
            r.take("temporal value", len + 1)
        }
        // DECIMAL, VARCHAR, BIT, JSON, NEWDECIMAL, ENUM, SET, BLOBs, strings, GEOMETRY
        0x00 | 0x0f | 0x10 | 0xf5..=0xff => r.lenenc_raw("string value"),
        other => Err(DecodeError::UnsupportedParameterType(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn execute_payload() -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(0x17);
        buf.put_u32_le(1);
        buf.put_u8(0);
        buf.put_u32_le(1);
        // two params, second is NULL
        buf.put_u8(0b10);
        buf.put_u8(1);
        buf.extend_from_slice(&[0x08, 0x80, 0xfd, 0x00]);
        buf.put_u64_le(42);
        buf.freeze()
    }

    #[test]
    fn test_parse_execute() {
        let payload = execute_payload();
        let layout = ExecuteLayout {
            num_params: 2,
            query_attributes: false,
            previous_types: None,
        };
        let exec = StmtExecute::parse(&payload, layout).unwrap();
        assert_eq!(exec.statement_id, 1);
        assert_eq!(exec.parameters.len(), 2);
        assert!(exec.parameters[0].param_type.unsigned());
        assert_eq!(exec.parameters[0].value.as_deref(), Some(&42u64.to_le_bytes()[..]));
        assert!(exec.parameters[1].value.is_none());

        let mut out = BytesMut::new();
        exec.encode(&mut out);
        assert_eq!(out.freeze(), payload);
    }

    #[test]
    fn test_parse_execute_with_query_attributes() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x17);
        buf.put_u32_le(3);
        buf.put_u8(PARAMETER_COUNT_AVAILABLE);
        buf.put_u32_le(1);
        buf.put_u8(1); // parameter_count
        buf.put_u8(0); // null bitmap
        buf.put_u8(1);
        buf.extend_from_slice(&[0xfd, 0x00]);
        put_lenenc_bytes(&mut buf, b"tag");
        put_lenenc_bytes(&mut buf, b"abc");
        let payload = buf.freeze();

        let layout = ExecuteLayout {
            num_params: 1,
            query_attributes: true,
            previous_types: None,
        };
        let exec = StmtExecute::parse(&payload, layout).unwrap();
        assert_eq!(exec.parameter_count, Some(1));
        assert_eq!(exec.parameters[0].name, "tag");
        assert_eq!(exec.parameters[0].value.as_deref(), Some(&b"\x03abc"[..]));

        let mut out = BytesMut::new();
        exec.encode(&mut out);
        assert_eq!(out.freeze(), payload);
    }

    #[test]
    fn test_execute_reuses_previous_types() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x17);
        buf.put_u32_le(1);
        buf.put_u8(0);
        buf.put_u32_le(1);
        buf.put_u8(0);
        buf.put_u8(0); // types not resent
        buf.put_u32_le(9);
        let payload = buf.freeze();

        let types = [ParamType {
            field_type: 0x03,
            flags: 0,
        }];
        let mut layout = ExecuteLayout {
            num_params: 1,
            query_attributes: false,
            previous_types: Some(&types),
        };
        let exec = StmtExecute::parse(&payload, layout).unwrap();
        assert_eq!(exec.parameters[0].value.as_deref(), Some(&9u32.to_le_bytes()[..]));

        layout.previous_types = None;
        assert!(StmtExecute::parse(&payload, layout).is_err());
    }

    #[test]
    fn test_prepare_ok_with_definitions() {
        let def = ColumnDefinition {
            sequence_id: 2,
            catalog: "def".into(),
            schema: String::new(),
            table: String::new(),
            org_table: String::new(),
            name: "?".into(),
            org_name: String::new(),
            fixed_length: 0x0c,
            character_set: 0x3f,
            column_length: 0,
            column_type: 0xfd,
            flags: 0x80,
            decimals: 0,
            trailing: Bytes::from_static(&[0, 0]),
        };
        let packets = vec![
            Packet::new(1, &[0x00, 5, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0][..]),
            def.to_packet(),
            Packet::new(3, &[0xfe, 0, 0, 2, 0][..]),
        ];
        let ok = StmtPrepareOk::parse(&packets).unwrap();
        assert_eq!(ok.statement_id, 5);
        assert_eq!(ok.num_params, 1);
        assert_eq!(ok.param_defs.len(), 1);
        assert!(ok.eof_after_params.is_some());
        assert!(ok.column_defs.is_empty());
        assert_eq!(ok.to_packets(1), packets);
    }

    #[test]
    fn test_unsupported_parameter_type() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x17);
        buf.put_u32_le(1);
        buf.put_u8(0);
        buf.put_u32_le(1);
        buf.put_u8(0);
        buf.put_u8(1);
        buf.extend_from_slice(&[0x20, 0x00]);
        let layout = ExecuteLayout {
            num_params: 1,
            query_attributes: false,
            previous_types: None,
        };
        assert!(matches!(
            StmtExecute::parse(&buf.freeze(), layout),
            Err(DecodeError::UnsupportedParameterType(0x20))
        ));
    }
}
