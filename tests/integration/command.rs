//! Command-phase replay over an in-memory stream.

use bytes::{BufMut, BytesMut};
use tokio_util::sync::CancellationToken;

use mysql_replay::protocol::{Packet, PacketType};
use mysql_replay::replay::{ReplayError, ReplaySession, SessionEnd};
use mysql_replay::session::ConnectionId;

use crate::{command_mock, handshake_mock, recorder, store, Auth, TestClient, OK, SELECT_1};

const PARAM_DEF: &[u8] =
    b"\x03def\x00\x00\x00\x01?\x00\x0c\x3f\x00\x00\x00\x00\x00\x08\x80\x00\x00\x00\x00";
const EOF: &[u8] = &[0xfe, 0x00, 0x00, 0x02, 0x00];

fn prepare_ok(statement_id: u32) -> Vec<Packet> {
    let mut head = BytesMut::new();
    head.put_u8(0x00);
    head.put_u32_le(statement_id);
    head.put_u16_le(0); // columns
    head.put_u16_le(1); // params
    head.put_u8(0);
    head.put_u16_le(0);
    vec![
        Packet::new(1, head.freeze()),
        Packet::new(2, PARAM_DEF),
        Packet::new(3, EOF),
    ]
}

fn execute(statement_id: u32, value: i64) -> Packet {
    let mut buf = BytesMut::new();
    buf.put_u8(0x17);
    buf.put_u32_le(statement_id);
    buf.put_u8(0);
    buf.put_u32_le(1);
    buf.put_u8(0); // null bitmap
    buf.put_u8(1); // new params bound
    buf.put_u8(0x08);
    buf.put_u8(0x00);
    buf.put_i64_le(value);
    Packet::new(0, buf.freeze())
}

fn close(statement_id: u32) -> Packet {
    let mut buf = BytesMut::new();
    buf.put_u8(0x19);
    buf.put_u32_le(statement_id);
    Packet::new(0, buf.freeze())
}

fn text_result_set() -> Vec<Packet> {
    vec![
        Packet::new(1, &[0x01][..]),
        Packet::new(
            2,
            &b"\x03def\x00\x00\x00\x011\x00\x0c\x3f\x00\x01\x00\x00\x00\x08\x81\x00\x00\x00\x00"[..],
        ),
        Packet::new(3, EOF),
        Packet::new(4, &b"\x011"[..]),
        Packet::new(5, EOF),
    ]
}

fn start(store: std::sync::Arc<mysql_replay::mock::MockStore>) -> (
    TestClient<tokio::io::DuplexStream>,
    tokio::task::JoinHandle<Result<SessionEnd, ReplayError>>,
) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let session = ReplaySession::new(ConnectionId::next(), store, CancellationToken::new());
    (TestClient::new(client), tokio::spawn(session.run(server)))
}

#[tokio::test]
async fn test_select_1_replays_recorded_ok() {
    let mut ctx = recorder();
    let mock = command_mock(&mut ctx, "select-1", Packet::new(0, SELECT_1), &[Packet::new(1, OK)]);
    let store = store(handshake_mock("login", Auth::Native), vec![mock]);
    let (mut client, task) = start(store.clone());

    client.login(Auth::Native).await;
    client.send(Packet::new(0, SELECT_1)).await;
    assert_eq!(client.recv().await, Some(Packet::new(1, OK)));
    assert_eq!(store.filtered_len(), 0);

    drop(client);
    assert_eq!(task.await.unwrap().unwrap(), SessionEnd::Disconnected);
}

#[tokio::test]
async fn test_result_set_is_byte_exact() {
    let mut ctx = recorder();
    let mock = command_mock(&mut ctx, "select-1", Packet::new(0, SELECT_1), &text_result_set());
    let store = store(handshake_mock("login", Auth::Native), vec![mock]);
    let (mut client, task) = start(store);

    client.login(Auth::Native).await;
    client.send(Packet::new(0, SELECT_1)).await;
    for expected in text_result_set() {
        assert_eq!(client.recv().await, Some(expected));
    }

    client.send(Packet::new(0, &[0x01][..])).await;
    assert_eq!(task.await.unwrap().unwrap(), SessionEnd::Quit);
}

#[tokio::test]
async fn test_unmatched_query_writes_nothing() {
    let mut ctx = recorder();
    let mock = command_mock(&mut ctx, "select-1", Packet::new(0, SELECT_1), &[Packet::new(1, OK)]);
    let store = store(handshake_mock("login", Auth::Native), vec![mock]);
    let (mut client, task) = start(store.clone());

    client.login(Auth::Native).await;
    client.send(Packet::new(0, &b"\x03SELECT 42"[..])).await;

    match task.await.unwrap() {
        Err(ReplayError::NoMatchingMock { command }) => assert_eq!(command, PacketType::ComQuery),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(client.recv().await, None);
    assert_eq!(store.filtered_len(), 1);
}

#[tokio::test]
async fn test_prepared_statement_lifecycle() {
    let mut ctx = recorder();
    let prepare = command_mock(
        &mut ctx,
        "prepare",
        Packet::new(0, &b"\x16SELECT ?"[..]),
        &prepare_ok(1),
    );
    let exec = command_mock(&mut ctx, "execute", execute(1, 7), &[Packet::new(1, OK)]);
    let close_mock = command_mock(&mut ctx, "close", close(1), &[]);
    let store = store(handshake_mock("login", Auth::Native), vec![prepare, exec, close_mock]);
    let (mut client, task) = start(store.clone());

    client.login(Auth::Native).await;

    client.send(Packet::new(0, &b"\x16SELECT ?"[..])).await;
    for expected in prepare_ok(1) {
        assert_eq!(client.recv().await, Some(expected));
    }

    // decoding needs the statement registered by the prepare response
    client.send(execute(1, 7)).await;
    assert_eq!(client.recv().await, Some(Packet::new(1, OK)));

    // no reply to COM_STMT_CLOSE, but the mock is consumed
    client.send(close(1)).await;
    client.send(Packet::new(0, &[0x0e][..])).await;

    assert!(matches!(
        task.await.unwrap(),
        Err(ReplayError::NoMatchingMock {
            command: PacketType::ComPing
        })
    ));
    assert_eq!(store.filtered_len(), 0);
    let names: Vec<_> = store.consumed().into_iter().map(|u| u.name).collect();
    assert_eq!(names, ["login", "prepare", "execute", "close"]);
}

#[tokio::test]
async fn test_execute_without_prepare_fails_decoding() {
    let store = store(handshake_mock("login", Auth::Native), vec![]);
    let (mut client, task) = start(store);

    client.login(Auth::Native).await;
    client.send(execute(9, 1)).await;

    assert!(matches!(task.await.unwrap(), Err(ReplayError::Decode(_))));
}

#[tokio::test]
async fn test_quit_without_mock_ends_session() {
    let store = store(handshake_mock("login", Auth::Native), vec![]);
    let (mut client, task) = start(store);

    client.login(Auth::Native).await;
    client.send(Packet::new(0, &[0x01][..])).await;

    assert_eq!(task.await.unwrap().unwrap(), SessionEnd::Quit);
    assert_eq!(client.recv().await, None);
}

#[tokio::test]
async fn test_utility_commands_replay() {
    let mut ctx = recorder();
    let ping = command_mock(&mut ctx, "ping", Packet::new(0, &[0x0e][..]), &[Packet::new(1, OK)]);
    let init_db = command_mock(
        &mut ctx,
        "init-db",
        Packet::new(0, &b"\x02orders"[..]),
        &[Packet::new(1, OK)],
    );
    let store = store(handshake_mock("login", Auth::FastAuth), vec![ping, init_db]);
    let (mut client, task) = start(store.clone());

    client.login(Auth::FastAuth).await;
    client.send(Packet::new(0, &b"\x02orders"[..])).await;
    assert_eq!(client.recv().await, Some(Packet::new(1, OK)));
    client.send(Packet::new(0, &[0x0e][..])).await;
    assert_eq!(client.recv().await, Some(Packet::new(1, OK)));

    drop(client);
    assert_eq!(task.await.unwrap().unwrap(), SessionEnd::Disconnected);
    assert_eq!(store.unused_filtered(), Vec::<String>::new());
}

#[tokio::test]
async fn test_cancel_interrupts_idle_session() {
    let store = store(handshake_mock("login", Auth::Native), vec![]);
    let (client, server) = tokio::io::duplex(64 * 1024);
    let cancel = CancellationToken::new();
    let session = ReplaySession::new(ConnectionId::next(), store, cancel.clone());
    let task = tokio::spawn(session.run(server));

    let mut client = TestClient::new(client);
    client.login(Auth::Native).await;
    cancel.cancel();

    assert!(matches!(task.await.unwrap(), Err(ReplayError::Cancelled)));
}
