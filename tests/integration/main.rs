//! Integration test entry point
//!
//! Sessions are driven end to end: mocks are built the way a recorder would
//! build them (by decoding captured packets), then a raw packet client talks to
//! the replay over an in-memory duplex stream or a loopback socket.

mod command;
mod concurrency;
mod handshake;
mod teardown;

use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use mysql_replay::mock::{Mock, MockStore, MOCK_TYPE_CONFIG, MOCK_TYPE_KEY};
use mysql_replay::protocol::capabilities::*;
use mysql_replay::protocol::{decode, decode_response, Packet, PacketCodec};
use mysql_replay::session::{ConnectionId, DecodeContext};

pub const SELECT_1: &[u8] = b"\x03SELECT 1";
pub const OK: &[u8] = &[0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00];
pub const PUBLIC_KEY: &[u8] = b"\x01-----BEGIN PUBLIC KEY-----\nMIIBIjANBgkqhkiG9w0BAQEFAAOCAQ8A\n-----END PUBLIC KEY-----\n";

/// Server capabilities advertised by the recorded greeting.
pub const SERVER_CAPS: u32 = CLIENT_LONG_PASSWORD
    | CLIENT_PROTOCOL_41
    | CLIENT_SECURE_CONNECTION
    | CLIENT_PLUGIN_AUTH
    | CLIENT_TRANSACTIONS;

/// Client capabilities sent in the recorded handshake response.
pub const CLIENT_CAPS: u32 =
    CLIENT_LONG_PASSWORD | CLIENT_PROTOCOL_41 | CLIENT_SECURE_CONNECTION | CLIENT_PLUGIN_AUTH;

/// How the recorded server authenticated the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Auth {
    Native,
    Switch,
    FastAuth,
    FullAuth,
}

pub fn greeting() -> Packet {
    let mut buf = BytesMut::new();
    buf.put_u8(10);
    buf.extend_from_slice(b"8.0.36\0");
    buf.put_u32_le(42);
    buf.extend_from_slice(b"abcdefgh");
    buf.put_u8(0);
    buf.put_u16_le((SERVER_CAPS & 0xffff) as u16);
    buf.put_u8(0xff);
    buf.put_u16_le(0x0002);
    buf.put_u16_le((SERVER_CAPS >> 16) as u16);
    buf.put_u8(21);
    buf.extend_from_slice(&[0u8; 10]);
    buf.extend_from_slice(b"ijklmnopqrst\0");
    buf.extend_from_slice(b"caching_sha2_password\0");
    Packet::new(0, buf.freeze())
}

pub fn handshake_response(user: &str) -> Packet {
    let mut buf = BytesMut::new();
    buf.put_u32_le(CLIENT_CAPS);
    buf.put_u32_le(16 * 1024 * 1024);
    buf.put_u8(0xff);
    buf.extend_from_slice(&[0u8; 23]);
    buf.extend_from_slice(user.as_bytes());
    buf.put_u8(0);
    buf.put_u8(32);
    buf.extend_from_slice(&[0x11; 32]);
    buf.extend_from_slice(b"caching_sha2_password\0");
    Packet::new(1, buf.freeze())
}

pub fn auth_switch_request() -> Packet {
    let mut buf = BytesMut::new();
    buf.put_u8(0xfe);
    buf.extend_from_slice(b"mysql_native_password\0");
    buf.extend_from_slice(b"01234567890123456789\0");
    Packet::new(2, buf.freeze())
}

pub fn encrypted_password(fill: u8) -> Bytes {
    Bytes::from(vec![fill; 256])
}

/// Server then client packets of one recorded login, in wire order.
pub fn login_packets(auth: Auth) -> Vec<(bool, Packet)> {
    let server = |p: Packet| (true, p);
    let client = |p: Packet| (false, p);
    let mut packets = vec![server(greeting()), client(handshake_response("app"))];
    match auth {
        Auth::Native => packets.push(server(Packet::new(2, OK))),
        Auth::Switch => {
            packets.push(server(auth_switch_request()));
            packets.push(client(Packet::new(3, vec![0x22u8; 20])));
            packets.push(server(Packet::new(4, OK)));
        }
        Auth::FastAuth => {
            packets.push(server(Packet::new(2, &[0x01, 0x03][..])));
            packets.push(server(Packet::new(3, OK)));
        }
        Auth::FullAuth => {
            packets.push(server(Packet::new(2, &[0x01, 0x04][..])));
            packets.push(client(Packet::new(3, &[0x02][..])));
            packets.push(server(Packet::new(4, PUBLIC_KEY)));
            packets.push(client(Packet::new(5, encrypted_password(0x5a))));
            packets.push(server(Packet::new(6, OK)));
        }
    }
    packets
}

/// Decode a captured login into a handshake mock.
pub fn handshake_mock(name: &str, auth: Auth) -> Mock {
    let mut ctx = DecodeContext::new(ConnectionId(0));
    let mut requests = Vec::new();
    let mut responses = Vec::new();
    for (from_server, packet) in login_packets(auth) {
        let bundle = decode(&packet, &mut ctx).unwrap();
        if from_server {
            responses.push(bundle);
        } else {
            requests.push(bundle);
        }
    }
    Mock::new(name, requests, responses).with_metadata(MOCK_TYPE_KEY, MOCK_TYPE_CONFIG)
}

/// Context positioned where a recorder would be after a native login.
pub fn recorder() -> DecodeContext {
    let mut ctx = DecodeContext::new(ConnectionId(0));
    for (_, packet) in login_packets(Auth::Native) {
        decode(&packet, &mut ctx).unwrap();
    }
    ctx
}

/// Decode one captured command and its response packets into a mock.
pub fn command_mock(ctx: &mut DecodeContext, name: &str, request: Packet, response: &[Packet]) -> Mock {
    let request = decode(&request, ctx).unwrap();
    let responses = if response.is_empty() {
        vec![]
    } else {
        vec![decode_response(response, ctx).unwrap()]
    };
    Mock::new(name, vec![request], responses)
}

pub fn store(handshake: Mock, commands: Vec<Mock>) -> Arc<MockStore> {
    let store = MockStore::new();
    store.set_unfiltered(vec![handshake]);
    store.set_filtered(commands);
    Arc::new(store)
}

/// A client speaking raw MySQL packets.
pub struct TestClient<S> {
    framed: Framed<S, PacketCodec>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> TestClient<S> {
    pub fn new(stream: S) -> Self {
        Self {
            framed: Framed::new(stream, PacketCodec::new()),
        }
    }

    pub async fn send(&mut self, packet: Packet) {
        self.framed.send(packet).await.unwrap();
    }

    /// Next packet, or `None` once the server closed the connection.
    pub async fn recv(&mut self) -> Option<Packet> {
        tokio::time::timeout(Duration::from_secs(5), self.framed.next())
            .await
            .expect("timed out waiting for server")
            .and_then(Result::ok)
    }

    /// Walk through a recorded login, sending the recorded client packets.
    pub async fn login(&mut self, auth: Auth) {
        for (from_server, packet) in login_packets(auth) {
            if from_server {
                assert_eq!(self.recv().await, Some(packet));
            } else {
                self.send(packet).await;
            }
        }
    }
}
