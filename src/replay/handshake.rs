//! Replays the connection phase from the first handshake mock.

use std::fmt;
use std::slice::Iter;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use super::io::PacketStream;
use super::ReplayError;
use crate::metrics::metrics;
use crate::mock::{Mock, MockKind, MockStore};
use crate::protocol::{
    wire, AuthMoreDataKind, Message, PacketBundle, PacketType, Request, Response,
};
use crate::session::{DecodeContext, SessionPhase};

/// Authentication path the recorded handshake took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMechanism {
    /// Plain OK/ERR after the client's response.
    Native,
    /// caching_sha2_password fast-auth success.
    FastAuth,
    /// caching_sha2_password full authentication with RSA key exchange.
    FullAuth,
}

impl AuthMechanism {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthMechanism::Native => "native",
            AuthMechanism::FastAuth => "fast_auth",
            AuthMechanism::FullAuth => "full_auth",
        }
    }
}

impl fmt::Display for AuthMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
    Authenticated(AuthMechanism),
    /// The recorded server refused the login; the ERR was replayed.
    Rejected(AuthMechanism),
    /// The client went away mid-handshake.
    Disconnected,
}

/// Cursor over one handshake mock.
struct Transcript<'a> {
    mock: &'a Mock,
    requests: Iter<'a, Request>,
    responses: Iter<'a, Response>,
}

impl<'a> Transcript<'a> {
    fn new(mock: &'a Mock) -> Self {
        Self {
            mock,
            requests: mock.requests.iter(),
            responses: mock.responses.iter(),
        }
    }

    fn next_request(&mut self, stage: &'static str) -> Result<&'a PacketBundle, ReplayError> {
        self.requests
            .next()
            .map(|r| &r.0)
            .ok_or_else(|| self.malformed(format!("no recorded request for {stage}")))
    }

    fn next_response(&mut self, stage: &'static str) -> Result<&'a PacketBundle, ReplayError> {
        self.responses
            .next()
            .map(|r| &r.0)
            .ok_or_else(|| self.malformed(format!("no recorded response for {stage}")))
    }

    fn peek_request_type(&self) -> Option<PacketType> {
        self.requests.clone().next().map(|r| r.packet_type())
    }

    fn malformed(&self, reason: String) -> ReplayError {
        ReplayError::MalformedMock {
            name: self.mock.name.clone(),
            reason,
        }
    }
}

/// Drive the connection phase against the first unfiltered MySQL mock.
pub(crate) async fn simulate_handshake<S>(
    stream: &mut PacketStream<S>,
    ctx: &mut DecodeContext,
    store: &MockStore,
) -> Result<HandshakeOutcome, ReplayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mock = store
        .unfiltered_by_kind(MockKind::MySql)
        .into_iter()
        .next()
        .ok_or(ReplayError::NoHandshakeMock)?;
    let mut transcript = Transcript::new(&mock);
    debug!(conn_id = %ctx.conn_id(), mock = %mock.name, "Using handshake mock");

    // Greeting
    let greeting = transcript.next_response("greeting")?;
    if greeting.packet_type() != PacketType::HandshakeV10 {
        return Err(transcript.malformed(format!(
            "first response is {}, expected HandshakeV10",
            greeting.packet_type()
        )));
    }
    stream.send_bundle(greeting, ctx).await?;
    ctx.advance(SessionPhase::GreetingSent)?;

    // Client handshake response
    let Some(live) = read_bundle(stream, ctx).await? else {
        return Ok(HandshakeOutcome::Disconnected);
    };
    if live.packet_type() == PacketType::SslRequest {
        return Err(ReplayError::Unsupported(
            "client requested TLS; replay serves plaintext only".into(),
        ));
    }
    let expected = transcript.next_request("handshake response")?;
    verify_header(ctx, "handshake response", expected, &live)?;
    ctx.advance(SessionPhase::AuthNegotiating)?;

    // Optional plugin switch
    let mut response = transcript.next_response("authentication")?;
    if let Message::AuthSwitchRequest(switch) = &response.message {
        debug!(conn_id = %ctx.conn_id(), plugin = %switch.plugin_name, "Replaying auth switch");
        stream.send_bundle(response, ctx).await?;
        let Some(live) = read_bundle(stream, ctx).await? else {
            return Ok(HandshakeOutcome::Disconnected);
        };
        let expected = transcript.next_request("auth switch response")?;
        verify_sequence(ctx, "auth switch response", expected, &live)?;
        response = transcript.next_response("authentication")?;
    }

    let (mechanism, final_response) = match &response.message {
        Message::Ok(_) | Message::Err(_) => (AuthMechanism::Native, response),
        Message::AuthMoreData(more) => match more.kind() {
            AuthMoreDataKind::FastAuthSuccess => {
                stream.send_bundle(response, ctx).await?;
                let done = transcript.next_response("fast auth result")?;
                (AuthMechanism::FastAuth, done)
            }
            AuthMoreDataKind::PerformFullAuthentication => {
                stream.send_bundle(response, ctx).await?;
                match full_authentication(stream, ctx, &mut transcript).await? {
                    Some(done) => (AuthMechanism::FullAuth, done),
                    None => return Ok(HandshakeOutcome::Disconnected),
                }
            }
            AuthMoreDataKind::Data => {
                return Err(verification_failed(
                    ctx,
                    "auth more data",
                    "fast auth or full authentication marker".into(),
                    format!("{:02x?}", &more.data[..]),
                ));
            }
        },
        other => {
            return Err(transcript.malformed(format!(
                "unexpected {} during authentication",
                other.packet_type()
            )));
        }
    };

    if !matches!(
        final_response.packet_type(),
        PacketType::Ok | PacketType::Err
    ) {
        return Err(transcript.malformed(format!(
            "authentication ends with {}, expected OK or ERR",
            final_response.packet_type()
        )));
    }
    stream.send_bundle(final_response, ctx).await?;

    match mechanism {
        AuthMechanism::FullAuth => {
            store.delete_unfiltered(&mock);
        }
        AuthMechanism::Native | AuthMechanism::FastAuth => {
            store.reuse_unfiltered(&mock);
        }
    }
    metrics().record_handshake(mechanism.as_str());

    if final_response.packet_type() == PacketType::Err {
        info!(conn_id = %ctx.conn_id(), %mechanism, "Replayed authentication failure");
        return Ok(HandshakeOutcome::Rejected(mechanism));
    }
    ctx.advance(SessionPhase::Authenticated)?;
    info!(conn_id = %ctx.conn_id(), %mechanism, "Handshake replayed");
    Ok(HandshakeOutcome::Authenticated(mechanism))
}

/// RSA key exchange (when recorded) followed by the encrypted password.
/// Returns the final OK/ERR to send, or `None` if the client disconnected.
async fn full_authentication<'a, S>(
    stream: &mut PacketStream<S>,
    ctx: &mut DecodeContext,
    transcript: &mut Transcript<'a>,
) -> Result<Option<&'a PacketBundle>, ReplayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if transcript.peek_request_type() == Some(PacketType::RequestPublicKey) {
        let Some(live) = read_bundle(stream, ctx).await? else {
            return Ok(None);
        };
        let expected = transcript.next_request("public key request")?;
        verify_header(ctx, "public key request", expected, &live)?;
        let public_key = transcript.next_response("public key")?;
        stream.send_bundle(public_key, ctx).await?;
    }

    let Some(live) = read_bundle(stream, ctx).await? else {
        return Ok(None);
    };
    let expected = transcript.next_request("encrypted password")?;
    verify_header(ctx, "encrypted password", expected, &live)?;
    match (&expected.message, &live.message) {
        (Message::EncryptedPassword(recorded), Message::EncryptedPassword(actual)) => {
            let (recorded, actual) = (recorded.to_base64(), actual.to_base64());
            if recorded != actual {
                return Err(verification_failed(ctx, "encrypted password", recorded, actual));
            }
        }
        _ => {
            return Err(transcript.malformed(format!(
                "recorded {} where an encrypted password was expected",
                expected.packet_type()
            )));
        }
    }

    transcript.next_response("full auth result").map(Some)
}

async fn read_bundle<S>(
    stream: &mut PacketStream<S>,
    ctx: &mut DecodeContext,
) -> Result<Option<PacketBundle>, ReplayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match stream.read_packet().await? {
        Some(packet) => Ok(Some(wire::decode(&packet, ctx)?)),
        None => {
            debug!(conn_id = %ctx.conn_id(), phase = %ctx.phase(), "Client closed during handshake");
            Ok(None)
        }
    }
}

/// Packet type, payload length and sequence id must all agree.
fn verify_header(
    ctx: &DecodeContext,
    stage: &'static str,
    expected: &PacketBundle,
    actual: &PacketBundle,
) -> Result<(), ReplayError> {
    if expected.packet_type() != actual.packet_type()
        || expected.header.payload_length != actual.header.payload_length
        || expected.header.sequence_id != actual.header.sequence_id
    {
        return Err(verification_failed(
            ctx,
            stage,
            describe(expected),
            describe(actual),
        ));
    }
    Ok(())
}

/// Packet type and sequence id must agree; the payload is opaque.
fn verify_sequence(
    ctx: &DecodeContext,
    stage: &'static str,
    expected: &PacketBundle,
    actual: &PacketBundle,
) -> Result<(), ReplayError> {
    if expected.packet_type() != actual.packet_type()
        || expected.header.sequence_id != actual.header.sequence_id
    {
        return Err(verification_failed(
            ctx,
            stage,
            describe(expected),
            describe(actual),
        ));
    }
    Ok(())
}

fn describe(bundle: &PacketBundle) -> String {
    format!(
        "{} (len {}, seq {})",
        bundle.packet_type(),
        bundle.header.payload_length,
        bundle.header.sequence_id
    )
}

fn verification_failed(
    ctx: &DecodeContext,
    stage: &'static str,
    expected: String,
    actual: String,
) -> ReplayError {
    warn!(
        conn_id = %ctx.conn_id(),
        stage,
        expected = %expected,
        actual = %actual,
        "Handshake verification failed"
    );
    metrics().record_verification_failure(stage);
    ReplayError::Verification {
        stage,
        expected,
        actual,
    }
}
