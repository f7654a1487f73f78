//! Prometheus metrics for the replay proxy
//!
//! Exposed in text format over HTTP when a metrics address is configured.

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::OnceLock;

/// Global metrics registry
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Get the global metrics instance
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

pub struct Metrics {
    pub registry: Registry,

    // Connection metrics
    pub connections_accepted: IntCounter,
    pub connections_active: IntGauge,
    pub connections_closed: IntCounter,

    // Replay metrics
    /// Completed handshakes by auth mechanism
    pub handshakes_total: IntCounterVec,
    /// Commands answered from a mock, by packet type
    pub commands_matched_total: IntCounterVec,
    /// Commands with no usable mock, by packet type
    pub commands_unmatched_total: IntCounterVec,
    /// Handshake verification failures by stage
    pub verification_failures_total: IntCounterVec,

    // Teardown
    pub release_failures_total: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Self {
        // Names and labels below are static; registration only fails on duplicates.
        Self::try_new().expect("metric definitions are valid")
    }

    fn try_new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let connections_accepted = IntCounter::new(
            "replay_connections_accepted_total",
            "Total number of client connections accepted",
        )?;
        let connections_active = IntGauge::new(
            "replay_connections_active",
            "Current number of client connections being replayed",
        )?;
        let connections_closed = IntCounter::new(
            "replay_connections_closed_total",
            "Total number of client connections closed",
        )?;

        let handshakes_total = IntCounterVec::new(
            Opts::new("replay_handshakes_total", "Replayed handshakes by auth mechanism"),
            &["mechanism"], // native, fast_auth, full_auth
        )?;
        let commands_matched_total = IntCounterVec::new(
            Opts::new(
                "replay_commands_matched_total",
                "Commands answered from a recorded mock",
            ),
            &["command"],
        )?;
        let commands_unmatched_total = IntCounterVec::new(
            Opts::new(
                "replay_commands_unmatched_total",
                "Commands for which no recorded mock matched",
            ),
            &["command"],
        )?;
        let verification_failures_total = IntCounterVec::new(
            Opts::new(
                "replay_verification_failures_total",
                "Handshake packets that disagreed with the recording",
            ),
            &["stage"],
        )?;
        let release_failures_total = IntCounterVec::new(
            Opts::new(
                "replay_release_failures_total",
                "Resources that failed to release during shutdown",
            ),
            &["resource"],
        )?;

        registry.register(Box::new(connections_accepted.clone()))?;
        registry.register(Box::new(connections_active.clone()))?;
        registry.register(Box::new(connections_closed.clone()))?;
        registry.register(Box::new(handshakes_total.clone()))?;
        registry.register(Box::new(commands_matched_total.clone()))?;
        registry.register(Box::new(commands_unmatched_total.clone()))?;
        registry.register(Box::new(verification_failures_total.clone()))?;
        registry.register(Box::new(release_failures_total.clone()))?;

        Ok(Self {
            registry,
            connections_accepted,
            connections_active,
            connections_closed,
            handshakes_total,
            commands_matched_total,
            commands_unmatched_total,
            verification_failures_total,
            release_failures_total,
        })
    }

    pub fn record_connection_accepted(&self) {
        self.connections_accepted.inc();
        self.connections_active.inc();
    }

    pub fn record_connection_closed(&self) {
        self.connections_active.dec();
        self.connections_closed.inc();
    }

    pub fn record_handshake(&self, mechanism: &str) {
        self.handshakes_total.with_label_values(&[mechanism]).inc();
    }

    pub fn record_matched(&self, command: &str) {
        self.commands_matched_total
            .with_label_values(&[command])
            .inc();
    }

    pub fn record_unmatched(&self, command: &str) {
        self.commands_unmatched_total
            .with_label_values(&[command])
            .inc();
    }

    pub fn record_verification_failure(&self, stage: &str) {
        self.verification_failures_total
            .with_label_values(&[stage])
            .inc();
    }

    pub fn record_release_failure(&self, resource: &str) {
        self.release_failures_total
            .with_label_values(&[resource])
            .inc();
    }

    /// Get metrics as Prometheus text format
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Serve `/metrics` and `/health` on `listener` until `cancel` fires.
pub async fn serve_metrics(
    listener: tokio::net::TcpListener,
    cancel: tokio_util::sync::CancellationToken,
) -> std::io::Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use tracing::{debug, info};

    async fn handle_request(
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        let (status, body) = match req.uri().path() {
            "/metrics" => (StatusCode::OK, metrics().gather()),
            "/health" => (StatusCode::OK, "OK".to_string()),
            _ => (StatusCode::NOT_FOUND, "Not Found".to_string()),
        };
        let mut response = Response::new(Full::new(Bytes::from(body)));
        *response.status_mut() = status;
        Ok(response)
    }

    info!(addr = ?listener.local_addr().ok(), "Metrics server listening");

    loop {
        let (stream, _) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted?,
        };
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_request))
                .await
            {
                debug!(error = %e, "Metrics server connection error");
            }
        });
    }
}
