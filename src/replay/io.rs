use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::ReplayError;
use crate::protocol::{wire, Packet, PacketBundle, PacketCodec};
use crate::session::DecodeContext;

/// Client connection framed into logical packets. Every read and write gives
/// up as soon as the token is cancelled.
pub struct PacketStream<S> {
    framed: Framed<S, PacketCodec>,
    cancel: CancellationToken,
}

impl<S> PacketStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, cancel: CancellationToken) -> Self {
        Self {
            framed: Framed::new(stream, PacketCodec::new()),
            cancel,
        }
    }

    /// Next packet, or `None` once the client has closed its side.
    pub async fn read_packet(&mut self) -> Result<Option<Packet>, ReplayError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ReplayError::Cancelled),
            next = self.framed.next() => match next {
                Some(Ok(packet)) => {
                    trace!(seq = packet.sequence_id, len = packet.payload.len(), "Packet in");
                    Ok(Some(packet))
                }
                Some(Err(e)) => Err(e.into()),
                None => Ok(None),
            },
        }
    }

    /// Write pre-framed bytes and flush.
    pub async fn write_bytes(&mut self, bytes: Bytes) -> Result<(), ReplayError> {
        let len = bytes.len();
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ReplayError::Cancelled),
            sent = self.framed.send(bytes) => {
                sent?;
                trace!(len, "Bytes out");
                Ok(())
            }
        }
    }

    /// Encode a recorded bundle against the context and write it.
    pub async fn send_bundle(
        &mut self,
        bundle: &PacketBundle,
        ctx: &mut DecodeContext,
    ) -> Result<(), ReplayError> {
        let bytes = wire::encode(bundle, ctx)?;
        self.write_bytes(bytes).await
    }
}
