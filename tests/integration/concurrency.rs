//! Many sessions racing for the same mocks through a real listener.

use std::collections::HashSet;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use mysql_replay::mock::UsageKind;
use mysql_replay::protocol::Packet;
use mysql_replay::proxy::{ReplayProxy, SessionOutcome};
use mysql_replay::replay::SessionEnd;

use crate::{command_mock, handshake_mock, recorder, store, Auth, TestClient, OK, SELECT_1};

const CLIENTS: usize = 16;
const MOCKS: usize = 10;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_each_mock_served_at_most_once() {
    let mut ctx = recorder();
    let commands = (0..MOCKS)
        .map(|i| {
            command_mock(
                &mut ctx,
                &format!("select-{i}"),
                Packet::new(0, SELECT_1),
                &[Packet::new(1, OK)],
            )
        })
        .collect();
    let store = store(handshake_mock("login", Auth::FastAuth), commands);

    let cancel = CancellationToken::new();
    let mut proxy = ReplayProxy::bind("127.0.0.1:0", store.clone(), cancel.clone())
        .await
        .unwrap();
    let addr = proxy.local_addr();
    let mut events = proxy.subscribe().unwrap();
    let server = tokio::spawn(async move {
        proxy.run().await.unwrap();
        proxy.shutdown().await
    });

    let clients: Vec<_> = (0..CLIENTS)
        .map(|_| {
            tokio::spawn(async move {
                let mut client = TestClient::new(TcpStream::connect(addr).await.unwrap());
                client.login(Auth::FastAuth).await;
                client.send(Packet::new(0, SELECT_1)).await;
                client.recv().await
            })
        })
        .collect();

    let mut answered = 0;
    for client in clients {
        if let Some(packet) = client.await.unwrap() {
            assert_eq!(packet, Packet::new(1, OK));
            answered += 1;
        }
    }
    assert_eq!(answered, MOCKS);

    let mut ended = 0;
    let mut failed = 0;
    let mut seen = HashSet::new();
    while ended + failed < CLIENTS {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(seen.insert(event.conn_id));
        match event.outcome {
            SessionOutcome::Ended(SessionEnd::Disconnected) => ended += 1,
            SessionOutcome::Failed(_) => failed += 1,
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert_eq!(failed, CLIENTS - MOCKS);

    // every command mock deleted exactly once
    let usage = store.consumed();
    let deleted: Vec<_> = usage
        .iter()
        .filter(|u| u.kind == UsageKind::Deleted)
        .collect();
    assert_eq!(deleted.len(), MOCKS);
    assert!(deleted.iter().all(|u| u.uses == 1));
    // the handshake mock served every client
    let logins: Vec<_> = usage.iter().filter(|u| u.kind == UsageKind::Reused).collect();
    assert_eq!(logins.len(), 1);
    assert_eq!(logins[0].uses, CLIENTS as u64);
    assert_eq!(store.filtered_len(), 0);
    assert_eq!(store.unfiltered_len(), 1);

    cancel.cancel();
    let report = server.await.unwrap();
    assert!(report.is_clean(), "{:?}", report.failures);
}
