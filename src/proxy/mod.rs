//! TCP front end: accepts clients, runs one replay session per connection and
//! tears everything down on shutdown.

mod registry;
mod service;

pub use registry::{ConnectionHandle, ConnectionRegistry};
pub use service::{usage_reporter, AuxiliaryService, TaskService};

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::metrics::metrics;
use crate::mock::MockStore;
use crate::replay::{ReplayError, ReplaySession, SessionEnd};
use crate::session::ConnectionId;
use registry::Registration;

const EVENT_CAPACITY: usize = 256;
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Ended(SessionEnd),
    Cancelled,
    Failed(String),
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionOutcome::Ended(end) => write!(f, "{end}"),
            SessionOutcome::Cancelled => f.write_str("cancelled"),
            SessionOutcome::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Published once per finished connection.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub conn_id: ConnectionId,
    pub peer: SocketAddr,
    pub outcome: SessionOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseFailure {
    pub resource: String,
    pub error: String,
}

/// Everything that failed to release during shutdown. Empty means clean.
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub failures: Vec<ReleaseFailure>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, kind: &str, resource: String, error: impl fmt::Display) {
        warn!(resource = %resource, error = %error, "Failed to release resource");
        metrics().record_release_failure(kind);
        self.failures.push(ReleaseFailure {
            resource,
            error: error.to_string(),
        });
    }
}

pub struct ReplayProxy {
    listener: Option<Arc<TcpListener>>,
    local_addr: SocketAddr,
    store: Arc<MockStore>,
    cancel: CancellationToken,
    registry: Arc<ConnectionRegistry>,
    services: Vec<Box<dyn AuxiliaryService>>,
    workers: JoinSet<()>,
    events: Option<broadcast::Sender<SessionEvent>>,
    shutdown_grace: Duration,
}

impl ReplayProxy {
    pub async fn bind<A: ToSocketAddrs>(
        addr: A,
        store: Arc<MockStore>,
        cancel: CancellationToken,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        info!(addr = %local_addr, "Replay proxy listening");

        Ok(Self {
            listener: Some(Arc::new(listener)),
            local_addr,
            store,
            cancel,
            registry: Arc::new(ConnectionRegistry::new()),
            services: Vec::new(),
            workers: JoinSet::new(),
            events: Some(events),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        })
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.registry.clone()
    }

    pub fn store(&self) -> Arc<MockStore> {
        self.store.clone()
    }

    pub fn subscribe(&self) -> Option<broadcast::Receiver<SessionEvent>> {
        self.events.as_ref().map(broadcast::Sender::subscribe)
    }

    pub fn add_service(&mut self, service: impl AuxiliaryService + 'static) {
        self.services.push(Box::new(service));
    }

    /// Accept connections until the token is cancelled.
    pub async fn run(&mut self) -> io::Result<()> {
        let Some(listener) = self.listener.clone() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "listener closed"));
        };

        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = self.spawn_session(stream, peer) {
                        warn!(peer = %peer, error = %e, "Failed to set up connection");
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }

            // Reap finished workers so the set stays small on long runs.
            while self.workers.try_join_next().is_some() {}
        }

        info!(active = self.registry.len(), "Accept loop stopped");
        Ok(())
    }

    fn spawn_session(&mut self, stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
        let id = ConnectionId::next();

        // Keep a second handle on the socket so teardown can close it.
        let std_stream = stream.into_std()?;
        let handle = std_stream.try_clone()?;
        let stream = TcpStream::from_std(std_stream)?;

        self.registry.register(id, peer, Box::new(handle));
        let registration = Registration::new(id, self.registry.clone());
        info!(conn_id = %id, peer = %peer, "New connection");

        let session = ReplaySession::new(id, self.store.clone(), self.cancel.clone());
        let events = self.events.clone();

        self.workers.spawn(async move {
            let _registration = registration;
            let outcome = match session.run(stream).await {
                Ok(end) => {
                    info!(conn_id = %id, end = %end, "Session ended");
                    SessionOutcome::Ended(end)
                }
                Err(ReplayError::Cancelled) => {
                    debug!(conn_id = %id, "Session cancelled");
                    SessionOutcome::Cancelled
                }
                Err(e) => {
                    warn!(conn_id = %id, error = %e, "Session ended with error");
                    SessionOutcome::Failed(e.to_string())
                }
            };
            if let Some(events) = events {
                // No subscribers is fine.
                let _ = events.send(SessionEvent {
                    conn_id: id,
                    peer,
                    outcome,
                });
            }
        });
        Ok(())
    }

    /// Release everything the proxy holds. Every step runs even if an
    /// earlier one failed.
    pub async fn shutdown(mut self) -> TeardownReport {
        let mut report = TeardownReport::default();

        self.cancel.cancel();

        for (id, e) in self.registry.close_all() {
            report.record("connection", format!("connection {id}"), e);
        }

        if let Some(listener) = self.listener.take() {
            drop(listener);
            debug!(addr = %self.local_addr, "Listener closed");
        }

        for mut service in self.services.drain(..) {
            if let Err(e) = service.stop() {
                report.record("service", format!("service {}", service.name()), e);
            }
        }

        self.events.take();

        let workers = &mut self.workers;
        let joined = tokio::time::timeout(self.shutdown_grace, async {
            let mut panicked = Vec::new();
            while let Some(result) = workers.join_next().await {
                if let Err(e) = result {
                    if e.is_panic() {
                        panicked.push(e.to_string());
                    }
                }
            }
            panicked
        })
        .await;

        match joined {
            Ok(panicked) => {
                for e in panicked {
                    report.record("worker", "session worker".to_string(), e);
                }
            }
            Err(_) => {
                let remaining = self.workers.len();
                self.workers.abort_all();
                while self.workers.join_next().await.is_some() {}
                report.record(
                    "worker",
                    "session workers".to_string(),
                    format!("{remaining} still running after {:?}, aborted", self.shutdown_grace),
                );
            }
        }

        info!(
            failures = report.failures.len(),
            unused_mocks = self.store.filtered_len(),
            "Replay proxy stopped"
        );
        report
    }
}
