use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::packet::{Packet, MAX_PACKET_SIZE};

/// Upper bound on a reassembled payload (MySQL's max_allowed_packet ceiling).
const MAX_REASSEMBLED_SIZE: usize = 1 << 30;

/// MySQL packet codec for use with tokio Framed.
///
/// Yields logical packets: fragments of exactly `MAX_PACKET_SIZE` bytes are
/// buffered and joined with their continuation before being returned.
#[derive(Debug, Default)]
pub struct PacketCodec {
    partial: Option<(u8, BytesMut)>,
}

impl PacketCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while let Some(fragment) = Packet::decode(src) {
            let continued = fragment.payload.len() == MAX_PACKET_SIZE;

            let Some((first_seq, mut buf)) = self.partial.take() else {
                if continued {
                    let mut buf = BytesMut::with_capacity(MAX_PACKET_SIZE * 2);
                    buf.extend_from_slice(&fragment.payload);
                    self.partial = Some((fragment.sequence_id, buf));
                    continue;
                }
                return Ok(Some(fragment));
            };

            if buf.len() + fragment.payload.len() > MAX_REASSEMBLED_SIZE {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "reassembled packet exceeds maximum size",
                ));
            }
            buf.extend_from_slice(&fragment.payload);
            if continued {
                self.partial = Some((first_seq, buf));
                continue;
            }
            return Ok(Some(Packet::new(first_seq, buf.freeze())));
        }
        Ok(None)
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst);
        Ok(())
    }
}

/// Pre-framed bytes (already carrying packet headers) are written verbatim.
impl Encoder<Bytes> for PacketCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}

/// Split a raw byte buffer into logical packets. Trailing partial data is an error.
pub fn split_packets(raw: &[u8]) -> std::io::Result<Vec<Packet>> {
    let mut codec = PacketCodec::new();
    let mut buf = BytesMut::from(raw);
    let mut packets = Vec::new();
    while let Some(packet) = codec.decode(&mut buf)? {
        packets.push(packet);
    }
    if !buf.is_empty() || codec.partial.is_some() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "truncated packet",
        ));
    }
    Ok(packets)
}
