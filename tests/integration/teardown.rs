//! Shutdown releases every resource even when some releases fail.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use mysql_replay::proxy::{AuxiliaryService, ConnectionHandle, ReplayProxy, TaskService};
use mysql_replay::session::ConnectionId;

use crate::{handshake_mock, store, Auth, TestClient};

struct BrokenHandle {
    tried: Arc<AtomicBool>,
}

impl ConnectionHandle for BrokenHandle {
    fn close(&self) -> io::Result<()> {
        self.tried.store(true, Ordering::SeqCst);
        Err(io::Error::other("socket already poisoned"))
    }
}

struct StubbornService {
    stopped: Arc<AtomicBool>,
}

impl AuxiliaryService for StubbornService {
    fn name(&self) -> &str {
        "stubborn"
    }

    fn stop(&mut self) -> io::Result<()> {
        self.stopped.store(true, Ordering::SeqCst);
        Err(io::Error::other("refused to stop"))
    }
}

async fn wait_for_registrations(proxy_registry: &mysql_replay::proxy::ConnectionRegistry, n: usize) {
    for _ in 0..100 {
        if proxy_registry.len() >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("connections never registered");
}

#[tokio::test]
async fn test_cleanup_completes_when_a_release_fails() {
    let store = store(handshake_mock("login", Auth::Native), vec![]);
    let cancel = CancellationToken::new();
    let mut proxy = ReplayProxy::bind("127.0.0.1:0", store, cancel.clone())
        .await
        .unwrap()
        .with_shutdown_grace(Duration::from_secs(2));
    let addr = proxy.local_addr();
    let registry = proxy.registry();
    let mut events = proxy.subscribe().unwrap();

    let tried = Arc::new(AtomicBool::new(false));
    registry.register(
        ConnectionId(u32::MAX),
        "127.0.0.1:1".parse().unwrap(),
        Box::new(BrokenHandle {
            tried: tried.clone(),
        }),
    );
    let stopped = Arc::new(AtomicBool::new(false));
    proxy.add_service(StubbornService {
        stopped: stopped.clone(),
    });
    let healthy = Arc::new(AtomicBool::new(false));
    let flag = healthy.clone();
    proxy.add_service(TaskService::spawn("healthy", async move {
        flag.store(true, Ordering::SeqCst);
        std::future::pending::<()>().await;
    }));

    // stop accepting without touching the token; shutdown has to cancel it
    let (stop, stopped_accepting) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        tokio::select! {
            result = proxy.run() => result.unwrap(),
            _ = stopped_accepting => {}
        }
        proxy.shutdown().await
    });

    // one live session parked in the command phase
    let mut client = TestClient::new(TcpStream::connect(addr).await.unwrap());
    client.login(Auth::Native).await;
    wait_for_registrations(&registry, 2).await;

    assert!(!cancel.is_cancelled());
    stop.send(()).unwrap();
    let report = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap();

    assert!(cancel.is_cancelled());
    assert!(tried.load(Ordering::SeqCst));
    assert!(stopped.load(Ordering::SeqCst));
    assert!(healthy.load(Ordering::SeqCst));
    let resources: Vec<_> = report.failures.iter().map(|f| f.resource.as_str()).collect();
    assert_eq!(
        resources,
        [
            format!("connection {}", ConnectionId(u32::MAX)).as_str(),
            "service stubborn"
        ]
    );

    // the live client was closed and the registry is empty
    assert_eq!(client.recv().await, None);
    assert!(registry.is_empty());
    // the listener is gone
    assert!(TcpStream::connect(addr).await.is_err());

    // the parked session reported once, then the event channel closed
    let mut reported = 0;
    loop {
        match events.recv().await {
            Ok(_) => reported += 1,
            Err(RecvError::Closed) => break,
            Err(e) => panic!("unexpected {e:?}"),
        }
    }
    assert_eq!(reported, 1);
}

#[tokio::test]
async fn test_clean_shutdown_with_idle_proxy() {
    let store = store(handshake_mock("login", Auth::Native), vec![]);
    let cancel = CancellationToken::new();
    let mut proxy = ReplayProxy::bind("127.0.0.1:0", store, cancel.clone())
        .await
        .unwrap();

    cancel.cancel();
    proxy.run().await.unwrap();
    let report = proxy.shutdown().await;
    assert!(report.is_clean());
}
