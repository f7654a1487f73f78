//! Connection-phase replay: each auth path and what it does to the handshake mock.

use tokio_util::sync::CancellationToken;

use mysql_replay::mock::{MockKind, UsageKind};
use mysql_replay::protocol::{capabilities::CLIENT_SSL, Packet};
use mysql_replay::replay::{ReplayError, ReplaySession, SessionEnd};
use mysql_replay::session::ConnectionId;

use crate::{
    encrypted_password, greeting, handshake_mock, handshake_response, store, Auth, TestClient,
    PUBLIC_KEY,
};

#[tokio::test]
async fn test_native_login_then_disconnect() {
    let store = store(handshake_mock("login", Auth::Native), vec![]);
    let (client, server) = tokio::io::duplex(64 * 1024);
    let session = ReplaySession::new(ConnectionId::next(), store.clone(), CancellationToken::new());
    let task = tokio::spawn(session.run(server));

    let mut client = TestClient::new(client);
    client.login(Auth::Native).await;
    drop(client);

    assert_eq!(task.await.unwrap().unwrap(), SessionEnd::Disconnected);
    // native logins leave the mock in place for the next connection
    let remaining = store.unfiltered_by_kind(MockKind::MySql);
    assert_eq!(remaining.len(), 1);
    assert!(remaining[0].is_used);
    assert!(!remaining[0].is_filtered);
    assert_eq!(remaining[0].sort_order, i64::MAX);
}

#[tokio::test]
async fn test_fast_auth_reuses_handshake_mock() {
    let store = store(handshake_mock("login", Auth::FastAuth), vec![]);

    for _ in 0..2 {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let session =
            ReplaySession::new(ConnectionId::next(), store.clone(), CancellationToken::new());
        let task = tokio::spawn(session.run(server));

        let mut client = TestClient::new(client);
        client.login(Auth::FastAuth).await;
        drop(client);
        assert_eq!(task.await.unwrap().unwrap(), SessionEnd::Disconnected);
    }

    assert_eq!(store.unfiltered_len(), 1);
    let usage = store.consumed();
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].kind, UsageKind::Reused);
    assert_eq!(usage[0].uses, 2);
    assert_eq!(store.consumed_count(), 2);
}

#[tokio::test]
async fn test_full_auth_deletes_handshake_mock() {
    let store = store(handshake_mock("login", Auth::FullAuth), vec![]);
    let (client, server) = tokio::io::duplex(64 * 1024);
    let session = ReplaySession::new(ConnectionId::next(), store.clone(), CancellationToken::new());
    let task = tokio::spawn(session.run(server));

    let mut client = TestClient::new(client);
    client.login(Auth::FullAuth).await;
    drop(client);

    assert_eq!(task.await.unwrap().unwrap(), SessionEnd::Disconnected);
    assert_eq!(store.unfiltered_len(), 0);
    assert_eq!(store.consumed()[0].kind, UsageKind::Deleted);
}

#[tokio::test]
async fn test_full_auth_rejects_different_password() {
    let store = store(handshake_mock("login", Auth::FullAuth), vec![]);
    let (client, server) = tokio::io::duplex(64 * 1024);
    let session = ReplaySession::new(ConnectionId::next(), store.clone(), CancellationToken::new());
    let task = tokio::spawn(session.run(server));

    let mut client = TestClient::new(client);
    assert_eq!(client.recv().await, Some(greeting()));
    client.send(handshake_response("app")).await;
    assert_eq!(client.recv().await, Some(Packet::new(2, &[0x01, 0x04][..])));
    client.send(Packet::new(3, &[0x02][..])).await;
    assert_eq!(client.recv().await, Some(Packet::new(4, PUBLIC_KEY)));
    client.send(Packet::new(5, encrypted_password(0x5b))).await;

    match task.await.unwrap() {
        Err(ReplayError::Verification { stage, .. }) => assert_eq!(stage, "encrypted password"),
        other => panic!("unexpected {other:?}"),
    }
    // nothing past the key, and the mock survives a failed login
    assert_eq!(client.recv().await, None);
    assert_eq!(store.unfiltered_len(), 1);
}

#[tokio::test]
async fn test_auth_switch_path() {
    let store = store(handshake_mock("login", Auth::Switch), vec![]);
    let (client, server) = tokio::io::duplex(64 * 1024);
    let session = ReplaySession::new(ConnectionId::next(), store.clone(), CancellationToken::new());
    let task = tokio::spawn(session.run(server));

    let mut client = TestClient::new(client);
    client.login(Auth::Switch).await;
    drop(client);

    assert_eq!(task.await.unwrap().unwrap(), SessionEnd::Disconnected);
    assert_eq!(store.consumed()[0].kind, UsageKind::Reused);
}

#[tokio::test]
async fn test_handshake_response_length_mismatch() {
    let store = store(handshake_mock("login", Auth::Native), vec![]);
    let (client, server) = tokio::io::duplex(64 * 1024);
    let session = ReplaySession::new(ConnectionId::next(), store.clone(), CancellationToken::new());
    let task = tokio::spawn(session.run(server));

    let mut client = TestClient::new(client);
    assert_eq!(client.recv().await, Some(greeting()));
    client.send(handshake_response("someone_else")).await;

    match task.await.unwrap() {
        Err(ReplayError::Verification {
            stage,
            expected,
            actual,
        }) => {
            assert_eq!(stage, "handshake response");
            assert_ne!(expected, actual);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(client.recv().await, None);
    assert!(store.consumed().is_empty());
}

#[tokio::test]
async fn test_tls_request_is_unsupported() {
    let store = store(handshake_mock("login", Auth::Native), vec![]);
    let (client, server) = tokio::io::duplex(64 * 1024);
    let session = ReplaySession::new(ConnectionId::next(), store, CancellationToken::new());
    let task = tokio::spawn(session.run(server));

    let mut client = TestClient::new(client);
    assert_eq!(client.recv().await, Some(greeting()));
    let mut ssl = vec![0u8; 32];
    ssl[..4].copy_from_slice(&(crate::CLIENT_CAPS | CLIENT_SSL).to_le_bytes());
    client.send(Packet::new(1, ssl)).await;

    assert!(matches!(task.await.unwrap(), Err(ReplayError::Unsupported(_))));
}

#[tokio::test]
async fn test_no_handshake_mock() {
    let store = store(handshake_mock("login", Auth::Native), vec![]);
    store.set_unfiltered(vec![]);
    let (_client, server) = tokio::io::duplex(1024);
    let session = ReplaySession::new(ConnectionId::next(), store, CancellationToken::new());
    assert!(matches!(
        session.run(server).await,
        Err(ReplayError::NoHandshakeMock)
    ));
}

#[tokio::test]
async fn test_disconnect_after_greeting_is_silent() {
    let store = store(handshake_mock("login", Auth::Native), vec![]);
    let (client, server) = tokio::io::duplex(64 * 1024);
    let session = ReplaySession::new(ConnectionId::next(), store.clone(), CancellationToken::new());
    let task = tokio::spawn(session.run(server));

    let mut client = TestClient::new(client);
    assert_eq!(client.recv().await, Some(greeting()));
    drop(client);

    assert_eq!(task.await.unwrap().unwrap(), SessionEnd::Disconnected);
    assert!(store.consumed().is_empty());
}

#[tokio::test]
async fn test_recorded_rejection_is_replayed() {
    let mut mock = handshake_mock("login", Auth::Native);
    let err = Packet::new(2, &b"\xff\x15\x04#28000Access denied"[..]);
    let mut ctx = mysql_replay::session::DecodeContext::new(ConnectionId(0));
    mysql_replay::protocol::decode(&greeting(), &mut ctx).unwrap();
    mysql_replay::protocol::decode(&handshake_response("app"), &mut ctx).unwrap();
    mock.responses[1] = mysql_replay::protocol::decode(&err, &mut ctx).unwrap().into();

    let store = store(mock, vec![]);
    let (client, server) = tokio::io::duplex(64 * 1024);
    let session = ReplaySession::new(ConnectionId::next(), store, CancellationToken::new());
    let task = tokio::spawn(session.run(server));

    let mut client = TestClient::new(client);
    assert_eq!(client.recv().await, Some(greeting()));
    client.send(handshake_response("app")).await;
    assert_eq!(client.recv().await, Some(err));
    assert_eq!(task.await.unwrap().unwrap(), SessionEnd::Rejected);
}
