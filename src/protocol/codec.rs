use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::packet::{Packet, MAX_PACKET_SIZE, PACKET_HEADER_SIZE};

/// MySQL packet codec for use with tokio Framed.
///
/// Wire format: 3-byte little-endian payload length, 1-byte sequence
/// number, payload. The decoder remembers a header whose payload has not
/// arrived yet, so repeated wakeups skip re-parsing it, and reserves read
/// buffer capacity for the frame it is waiting on. Continuation packets
/// (payload length exactly 2^24-1) are surfaced individually and
/// reassembled by `PacketAccumulator` where a contiguous logical message
/// is needed.
#[derive(Debug, Default)]
pub struct PacketCodec {
    /// Payload length promised by a parsed header, until it all arrives
    awaiting: Option<usize>,
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
        let payload_len = match self.awaiting {
            Some(len) => len,
            None => {
                if src.len() < PACKET_HEADER_SIZE {
                    src.reserve(PACKET_HEADER_SIZE - src.len());
                    return Ok(None);
                }
                let len = u32::from_le_bytes([src[0], src[1], src[2], 0]) as usize;
                self.awaiting = Some(len);
                len
            }
        };

        let frame_len = PACKET_HEADER_SIZE + payload_len;
        if src.len() < frame_len {
            // Partial payload stays queued until the rest arrives
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let sequence_id = src[3];
        src.advance(PACKET_HEADER_SIZE);
        let payload = src.split_to(payload_len).freeze();
        self.awaiting = None;

        Ok(Some(Packet::new(sequence_id, payload)))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        debug_assert!(item.payload.len() <= MAX_PACKET_SIZE, "oversized frame");
        dst.reserve(PACKET_HEADER_SIZE + item.payload.len());
        dst.put_uint_le(item.payload.len() as u64, 3);
        dst.put_u8(item.sequence_id);
        dst.extend_from_slice(&item.payload);
        Ok(())
    }
}

/// Encoder that can encode raw bytes directly
impl Encoder<&[u8]> for PacketCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: &[u8], dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_roundtrip() {
        let mut codec = PacketCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Packet::new(3, vec![1u8, 2, 3, 4]), &mut buf)
            .unwrap();
        assert_eq!(&buf[..4], &[4, 0, 0, 3]);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.sequence_id, 3);
        assert_eq!(&decoded.payload[..], &[1, 2, 3, 4]);
        assert!(buf.is_empty());
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_codec_empty_payload() {
        let mut codec = PacketCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Packet::new(1, Vec::<u8>::new()), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.sequence_id, 1);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_codec_partial_header() {
        let mut codec = PacketCodec::new();
        let mut buf = BytesMut::from(&[4u8, 0][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        // Bytes stay queued until the header completes
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn test_codec_partial_payload() {
        let mut codec = PacketCodec::new();
        // Header promises 4 payload bytes, only 2 present
        let mut buf = BytesMut::from(&[4u8, 0, 0, 0, 1, 2][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 6);

        // The rest arrives; the remembered header is not re-parsed
        buf.extend_from_slice(&[3, 4]);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&decoded.payload[..], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_codec_back_to_back_frames() {
        let mut codec = PacketCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Packet::new(0, vec![0x03, b'A']), &mut buf).unwrap();
        codec.encode(Packet::new(1, vec![0x03, b'B']), &mut buf).unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.sequence_id, 0);
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.sequence_id, 1);
        assert_eq!(&second.payload[..], &[0x03, b'B']);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_codec_reserves_for_pending_frame() {
        let mut codec = PacketCodec::new();
        let mut buf = BytesMut::from(&[0u8, 1, 0, 0][..]); // 256-byte payload promised
        assert!(codec.decode(&mut buf).unwrap().is_none());
        // Enough room for the whole frame without another allocation
        assert!(buf.capacity() >= PACKET_HEADER_SIZE + 256);
    }

    #[test]
    fn test_codec_raw_bytes_encoder() {
        let mut codec = PacketCodec::new();
        let mut buf = BytesMut::new();
        Encoder::<&[u8]>::encode(&mut codec, &[9u8, 8, 7][..], &mut buf).unwrap();
        assert_eq!(&buf[..], &[9, 8, 7]);
    }
}
