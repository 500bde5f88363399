use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use super::PeerError;

pub const PROTOCOL: [u8; 19] = *b"BitTorrent protocol";

// Reserved byte 5, bit 0x10: BEP-10 extension protocol.
const EXTENSION_BIT: u8 = 0x10;

// The fixed 68-byte opening exchange:
// [19][b"BitTorrent protocol"][8 reserved][20 info_hash][20 peer_id]
pub struct Handshake {
    pub protocol:   [u8; 19],
    pub reserved:   [u8; 8],
    pub info_hash:  [u8; 20],
    pub peer_id:    [u8; 20],
}

impl Handshake {

    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        let mut reserved = [0; 8];
        reserved[5] |= EXTENSION_BIT;
        Self {
            protocol: PROTOCOL,
            reserved,
            info_hash,
            peer_id,
        }
    }

    // Whether the remote advertises BEP-10. DHT and Fast bits in byte 7 are
    // tolerated but never inspected.
    pub fn supports_extensions(&self) -> bool {
        self.reserved[5] & EXTENSION_BIT != 0
    }
}

pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {

    type Error = PeerError;

    fn encode(&mut self, item: Handshake, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.put_u8(19);
        dst.extend_from_slice(&item.protocol);
        dst.extend_from_slice(&item.reserved);
        dst.extend_from_slice(&item.info_hash);
        dst.extend_from_slice(&item.peer_id);
        debug_assert_eq!(dst.len(), 68, "encoded handshake length is not 68 bytes");
        Ok(())
    }
}

impl Decoder for HandshakeCodec {

    type Item = Handshake;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {

        if src.is_empty() {
            return Ok(None);
        }

        if src[0] != 19 {
            return Err(PeerError::IncorrectProtocol);
        }

        // 1 + 19 + 8 + 20 + 20 bytes.
        if src.remaining() < 68 {
            return Ok(None);
        }
        src.advance(1);

        let mut protocol = [0; 19];
        src.copy_to_slice(&mut protocol);

        let mut reserved = [0; 8];
        src.copy_to_slice(&mut reserved);

        let mut info_hash = [0; 20];
        src.copy_to_slice(&mut info_hash);

        let mut peer_id = [0; 20];
        src.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            protocol,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("protocol", &String::from_utf8_lossy(&self.protocol))
            .field("reserved", &self.reserved)
            .field("info_hash", &hex::encode(self.info_hash))
            .field("peer_id", &String::from_utf8_lossy(&self.peer_id))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_round_trip() {
        let sent = Handshake::new([7; 20], *b"-PC0001-123456789012");
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(sent, &mut buf).unwrap();
        assert_eq!(buf.len(), 68);

        let received = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(received.protocol, PROTOCOL);
        assert_eq!(received.info_hash, [7; 20]);
        assert_eq!(received.peer_id, *b"-PC0001-123456789012");
        assert!(received.supports_extensions());
    }

    #[test]
    fn test_handshake_decoding_with_incomplete_data() {
        let mut src = BytesMut::new();
        src.put_u8(19);
        src.extend_from_slice(b"BitTorrent protocol");
        let handshake = HandshakeCodec.decode(&mut src);
        assert!(handshake.unwrap().is_none());
    }

    #[test]
    fn test_handshake_decoding_with_invalid_protocol_len() {
        let mut src = BytesMut::new();
        src.put_u8(20);
        src.extend_from_slice(b"Invalid protocol");
        src.extend_from_slice(&[0; 48]);
        assert!(HandshakeCodec.decode(&mut src).is_err());
    }

    #[test]
    fn test_handshake_tolerates_dht_and_fast_bits() {
        let mut src = BytesMut::new();
        src.put_u8(19);
        src.extend_from_slice(b"BitTorrent protocol");
        let mut reserved = [0u8; 8];
        reserved[7] = 0x01 | 0x04;
        src.extend_from_slice(&reserved);
        src.extend_from_slice(&[1; 20]);
        src.extend_from_slice(&[2; 20]);

        let handshake = HandshakeCodec.decode(&mut src).unwrap().unwrap();
        assert!(!handshake.supports_extensions());
        assert_eq!(handshake.info_hash, [1; 20]);
    }
}
