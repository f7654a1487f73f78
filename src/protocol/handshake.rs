//! Connection-phase and status packets.
//!
//! Every type keeps enough of the received layout (fillers, optional
//! trailing fields) that `encode(parse(p)) == p`.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use super::buf::{lossy, put_lenenc_bytes, put_lenenc_int, put_null_terminated, Reader};
use super::error::DecodeError;
use super::packet::capabilities::*;

pub const OK_HEADER: u8 = 0x00;
pub const ERR_HEADER: u8 = 0xff;
pub const EOF_HEADER: u8 = 0xfe;
pub const AUTH_MORE_DATA_HEADER: u8 = 0x01;
pub const AUTH_SWITCH_HEADER: u8 = 0xfe;
pub const REQUEST_PUBLIC_KEY: u8 = 0x02;

/// caching_sha2_password fast-auth success marker.
pub const FAST_AUTH_SUCCESS: u8 = 0x03;
/// caching_sha2_password full-authentication marker.
pub const PERFORM_FULL_AUTHENTICATION: u8 = 0x04;

/// HandshakeV10 (server -> client greeting)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeV10 {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub auth_plugin_data_part1: Bytes,
    pub filler: u8,
    pub capability_flags: u32,
    pub character_set: u8,
    pub status_flags: u16,
    pub auth_plugin_data_len: u8,
    pub reserved: Bytes,
    pub auth_plugin_data_part2: Bytes,
    pub auth_plugin_name: String,
}

impl HandshakeV10 {
    pub fn parse(payload: &Bytes) -> Result<Self, DecodeError> {
        let mut r = Reader::new(payload);
        let protocol_version = r.u8("protocol_version")?;
        let server_version = lossy(&r.null_terminated("server_version")?);
        let connection_id = r.u32("connection_id")?;
        let auth_plugin_data_part1 = r.take("auth_plugin_data_part1", 8)?;
        let filler = r.u8("filler")?;
        let lower = r.u16("capability_flags")? as u32;
        let character_set = r.u8("character_set")?;
        let status_flags = r.u16("status_flags")?;
        let upper = r.u16("capability_flags")? as u32;
        let capability_flags = lower | (upper << 16);
        let auth_plugin_data_len = r.u8("auth_plugin_data_len")?;
        let reserved = r.take("reserved", 10)?;

        let auth_plugin_data_part2 = if capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            let len = std::cmp::max(13, (auth_plugin_data_len as usize).saturating_sub(8));
            r.take("auth_plugin_data_part2", len)?
        } else {
            Bytes::new()
        };

        let auth_plugin_name = if capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            lossy(&r.null_terminated_or_rest())
        } else {
            String::new()
        };

        Ok(Self {
            protocol_version,
            server_version,
            connection_id,
            auth_plugin_data_part1,
            filler,
            capability_flags,
            character_set,
            status_flags,
            auth_plugin_data_len,
            reserved,
            auth_plugin_data_part2,
            auth_plugin_name,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.protocol_version);
        put_null_terminated(buf, self.server_version.as_bytes());
        buf.put_u32_le(self.connection_id);
        buf.extend_from_slice(&self.auth_plugin_data_part1);
        buf.put_u8(self.filler);
        buf.put_u16_le((self.capability_flags & 0xFFFF) as u16);
        buf.put_u8(self.character_set);
        buf.put_u16_le(self.status_flags);
        buf.put_u16_le(((self.capability_flags >> 16) & 0xFFFF) as u16);
        buf.put_u8(self.auth_plugin_data_len);
        buf.extend_from_slice(&self.reserved);
        if self.capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            buf.extend_from_slice(&self.auth_plugin_data_part2);
        }
        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            put_null_terminated(buf, self.auth_plugin_name.as_bytes());
        }
    }
}

/// HandshakeResponse41 (client -> server)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse41 {
    pub capability_flags: u32,
    pub max_packet_size: u32,
    pub character_set: u8,
    pub filler: Bytes,
    pub username: String,
    pub auth_response: Bytes,
    pub database: Option<String>,
    pub auth_plugin_name: Option<String>,
    pub connection_attributes: Option<Vec<(String, String)>>,
    pub zstd_compression_level: Option<u8>,
}

impl HandshakeResponse41 {
    pub fn parse(payload: &Bytes) -> Result<Self, DecodeError> {
        let mut r = Reader::new(payload);
        let capability_flags = r.u32("capability_flags")?;
        let max_packet_size = r.u32("max_packet_size")?;
        let character_set = r.u8("character_set")?;
        let filler = r.take("filler", 23)?;
        let username = lossy(&r.null_terminated("username")?);

        let auth_response = if capability_flags & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            r.lenenc_bytes("auth_response")?
        } else if capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            let len = r.u8("auth_response")? as usize;
            r.take("auth_response", len)?
        } else {
            r.null_terminated("auth_response")?
        };

        let database = if capability_flags & CLIENT_CONNECT_WITH_DB != 0 && !r.is_empty() {
            Some(lossy(&r.null_terminated_or_rest()))
        } else {
            None
        };

        let auth_plugin_name = if capability_flags & CLIENT_PLUGIN_AUTH != 0 && !r.is_empty() {
            Some(lossy(&r.null_terminated_or_rest()))
        } else {
            None
        };

        let connection_attributes = if capability_flags & CLIENT_CONNECT_ATTRS != 0 && !r.is_empty()
        {
            let block = r.lenenc_bytes("connection_attributes")?;
            let mut attrs = Reader::new(&block);
            let mut pairs = Vec::new();
            while !attrs.is_empty() {
                let key = attrs.lenenc_string("attribute key")?;
                let value = attrs.lenenc_string("attribute value")?;
                pairs.push((key, value));
            }
            Some(pairs)
        } else {
            None
        };

        let zstd_compression_level =
            if capability_flags & CLIENT_ZSTD_COMPRESSION_ALGORITHM != 0 && !r.is_empty() {
                Some(r.u8("zstd_compression_level")?)
            } else {
                None
            };

        Ok(Self {
            capability_flags,
            max_packet_size,
            character_set,
            filler,
            username,
            auth_response,
            database,
            auth_plugin_name,
            connection_attributes,
            zstd_compression_level,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.capability_flags);
        buf.put_u32_le(self.max_packet_size);
        buf.put_u8(self.character_set);
        buf.extend_from_slice(&self.filler);
        put_null_terminated(buf, self.username.as_bytes());

        if self.capability_flags & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            put_lenenc_bytes(buf, &self.auth_response);
        } else if self.capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            buf.put_u8(self.auth_response.len() as u8);
            buf.extend_from_slice(&self.auth_response);
        } else {
            put_null_terminated(buf, &self.auth_response);
        }

        if let Some(db) = &self.database {
            put_null_terminated(buf, db.as_bytes());
        }
        if let Some(plugin) = &self.auth_plugin_name {
            put_null_terminated(buf, plugin.as_bytes());
        }
        if let Some(attrs) = &self.connection_attributes {
            let mut block = BytesMut::new();
            for (key, value) in attrs {
                put_lenenc_bytes(&mut block, key.as_bytes());
                put_lenenc_bytes(&mut block, value.as_bytes());
            }
            put_lenenc_int(buf, block.len() as u64);
            buf.extend_from_slice(&block);
        }
        if let Some(level) = self.zstd_compression_level {
            buf.put_u8(level);
        }
    }
}

/// SSLRequest: the 32-byte prefix of a HandshakeResponse41 with CLIENT_SSL set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SslRequest {
    pub capability_flags: u32,
    pub max_packet_size: u32,
    pub character_set: u8,
    pub filler: Bytes,
}

impl SslRequest {
    pub const LEN: usize = 32;

    /// Whether a post-greeting client payload is an SSLRequest.
    pub fn matches(payload: &[u8]) -> bool {
        payload.len() == Self::LEN
            && u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]) & CLIENT_SSL
                != 0
    }

    pub fn parse(payload: &Bytes) -> Result<Self, DecodeError> {
        let mut r = Reader::new(payload);
        Ok(Self {
            capability_flags: r.u32("capability_flags")?,
            max_packet_size: r.u32("max_packet_size")?,
            character_set: r.u8("character_set")?,
            filler: r.take("filler", 23)?,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.capability_flags);
        buf.put_u32_le(self.max_packet_size);
        buf.put_u8(self.character_set);
        buf.extend_from_slice(&self.filler);
    }
}

/// AuthSwitchRequest (0xfe followed by plugin name and data)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSwitchRequest {
    pub plugin_name: String,
    pub plugin_data: Bytes,
}

impl AuthSwitchRequest {
    pub fn parse(payload: &Bytes) -> Result<Self, DecodeError> {
        let mut r = Reader::new(payload);
        r.u8("auth switch header")?;
        let plugin_name = lossy(&r.null_terminated_or_rest());
        Ok(Self {
            plugin_name,
            plugin_data: r.rest(),
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(AUTH_SWITCH_HEADER);
        put_null_terminated(buf, self.plugin_name.as_bytes());
        buf.extend_from_slice(&self.plugin_data);
    }
}

/// What an AuthMoreData packet tells the client to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthMoreDataKind {
    FastAuthSuccess,
    PerformFullAuthentication,
    /// Public key or other plugin data.
    Data,
}

/// AuthMoreData (0x01 followed by plugin data)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthMoreData {
    pub data: Bytes,
}

impl AuthMoreData {
    pub fn parse(payload: &Bytes) -> Result<Self, DecodeError> {
        let mut r = Reader::new(payload);
        r.u8("auth more data header")?;
        Ok(Self { data: r.rest() })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(AUTH_MORE_DATA_HEADER);
        buf.extend_from_slice(&self.data);
    }

    pub fn kind(&self) -> AuthMoreDataKind {
        // PEM key data starts with '-', never with a status marker
        match self.data.first() {
            Some(&FAST_AUTH_SUCCESS) => AuthMoreDataKind::FastAuthSuccess,
            Some(&PERFORM_FULL_AUTHENTICATION) => AuthMoreDataKind::PerformFullAuthentication,
            _ => AuthMoreDataKind::Data,
        }
    }
}

/// Opaque client auth payload: AuthSwitchResponse, RequestPublicKey or
/// EncryptedPassword.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthData {
    pub data: Bytes,
}

impl AuthData {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    pub fn to_base64(&self) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(&self.data)
    }
}

/// OK packet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OkPacket {
    /// 0x00, or 0xfe when it stands in for an EOF.
    pub header: u8,
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: Option<u16>,
    pub warnings: Option<u16>,
    /// Human readable info and session state changes, kept raw.
    pub info: Bytes,
}

impl OkPacket {
    pub fn parse(payload: &Bytes, capabilities: u32) -> Result<Self, DecodeError> {
        let mut r = Reader::new(payload);
        let header = r.u8("ok header")?;
        let affected_rows = r.lenenc_int("affected_rows")?;
        let last_insert_id = r.lenenc_int("last_insert_id")?;
        let (status_flags, warnings) = if capabilities & CLIENT_PROTOCOL_41 != 0 {
            (Some(r.u16("status_flags")?), Some(r.u16("warnings")?))
        } else if capabilities & CLIENT_TRANSACTIONS != 0 {
            (Some(r.u16("status_flags")?), None)
        } else {
            (None, None)
        };
        Ok(Self {
            header,
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
            info: r.rest(),
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.header);
        put_lenenc_int(buf, self.affected_rows);
        put_lenenc_int(buf, self.last_insert_id);
        if let Some(status) = self.status_flags {
            buf.put_u16_le(status);
        }
        if let Some(warnings) = self.warnings {
            buf.put_u16_le(warnings);
        }
        buf.extend_from_slice(&self.info);
    }
}

/// ERR packet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrPacket {
    pub error_code: u16,
    pub sql_state: Option<String>,
    pub error_message: String,
}

impl ErrPacket {
    pub fn parse(payload: &Bytes) -> Result<Self, DecodeError> {
        let mut r = Reader::new(payload);
        r.u8("err header")?;
        let error_code = r.u16("error_code")?;
        let sql_state = if r.peek() == Some(b'#') {
            r.u8("sql_state_marker")?;
            Some(lossy(&r.take("sql_state", 5)?))
        } else {
            None
        };
        Ok(Self {
            error_code,
            sql_state,
            error_message: lossy(&r.rest()),
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(ERR_HEADER);
        buf.put_u16_le(self.error_code);
        if let Some(state) = &self.sql_state {
            buf.put_u8(b'#');
            buf.extend_from_slice(state.as_bytes());
        }
        buf.extend_from_slice(self.error_message.as_bytes());
    }
}

/// EOF packet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EofPacket {
    pub warnings: Option<u16>,
    pub status_flags: Option<u16>,
}

impl EofPacket {
    pub fn parse(payload: &Bytes) -> Result<Self, DecodeError> {
        let mut r = Reader::new(payload);
        r.u8("eof header")?;
        if r.remaining() >= 4 {
            Ok(Self {
                warnings: Some(r.u16("warnings")?),
                status_flags: Some(r.u16("status_flags")?),
            })
        } else {
            Ok(Self {
                warnings: None,
                status_flags: None,
            })
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(EOF_HEADER);
        if let (Some(warnings), Some(status)) = (self.warnings, self.status_flags) {
            buf.put_u16_le(warnings);
            buf.put_u16_le(status);
        }
    }
}

/// 0xfe with a short payload is an EOF; longer ones are AuthSwitchRequest or
/// OK-as-EOF depending on context.
pub fn is_eof_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&EOF_HEADER) && payload.len() < 9
}

pub fn is_err_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&ERR_HEADER)
}

pub fn is_ok_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&OK_HEADER)
}
