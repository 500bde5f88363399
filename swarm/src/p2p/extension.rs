use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use bencode::{Decoder, Dict, Value};
use super::{PeerError, Result};

// The extension handshake itself always travels as extended message 0.
pub const EXT_HANDSHAKE_ID: u8 = 0;

// Ids we assign in our `m` map. The remote addresses us with these; we
// address the remote with whatever its own map advertised.
pub const LOCAL_UT_PEX_ID: u8 = 1;
pub const LOCAL_UT_METADATA_ID: u8 = 2;

pub const UT_PEX: &[u8] = b"ut_pex";
pub const UT_METADATA: &[u8] = b"ut_metadata";

// Decoded remote extension handshake. Only `m` and `metadata_size` are
// consumed; the rest of the dictionary is ignored.
#[derive(Debug, Default)]
pub struct ExtensionHandshake {
    ids: HashMap<Vec<u8>, u8>,
    pub metadata_size: Option<usize>,
}

impl ExtensionHandshake {

    // Our handshake payload: {m: {ut_metadata: 2, ut_pex: 1}}.
    pub fn ours() -> Vec<u8> {
        let mut m = Dict::new();
        m.insert(UT_PEX.to_vec(), LOCAL_UT_PEX_ID as i64);
        m.insert(UT_METADATA.to_vec(), LOCAL_UT_METADATA_ID as i64);
        let mut handshake = Dict::new();
        handshake.insert("m", m);
        bencode::encode(&Value::from(handshake))
    }

    pub fn parse(payload: &[u8]) -> Result<Self> {
        let value = bencode::decode(payload)?;
        let dict = value.as_dict().ok_or(PeerError::InvalidMessage)?;

        let mut ids = HashMap::new();
        if let Some(m) = dict.get(b"m").and_then(Value::as_dict) {
            for (name, id) in m.iter() {
                match id.as_int() {
                    Some(id @ 0..=255) => {
                        ids.insert(name.to_vec(), id as u8);
                    },
                    _ => return Err(PeerError::InvalidMessage),
                }
            }
        }

        let metadata_size = dict
            .get(b"metadata_size")
            .and_then(Value::as_int)
            .filter(|size| *size > 0)
            .map(|size| size as usize);

        Ok(Self { ids, metadata_size })
    }

    // Id the remote assigned to one of its extensions.
    pub fn id_for(&self, name: &[u8]) -> Option<u8> {
        self.ids.get(name).copied()
    }

    // Reverse lookup into the remote's map, how inbound extended messages
    // are dispatched.
    pub fn name_for(&self, id: u8) -> Option<&[u8]> {
        self.ids
            .iter()
            .find(|(_, v)| **v == id)
            .map(|(k, _)| k.as_slice())
    }
}

// A ut_metadata header; data messages carry the raw piece bytes directly
// after the bencoded part.
#[derive(Debug, PartialEq, Eq)]
pub struct MetadataHeader {
    pub msg_type: i64,
    pub piece: usize,
    pub total_size: Option<usize>,
}

pub const METADATA_MSG_REQUEST: i64 = 0;
pub const METADATA_MSG_DATA: i64 = 1;

// {msg_type: 0, piece: i}
pub fn metadata_request(piece: usize) -> Vec<u8> {
    let mut req = Dict::new();
    req.insert("msg_type", METADATA_MSG_REQUEST);
    req.insert("piece", piece as i64);
    bencode::encode(&Value::from(req))
}

// Splits a ut_metadata message into its header and the raw tail. The tail
// starts exactly where the bencode cursor stops; guessing from total_size is
// wrong whenever that field is absent.
pub fn parse_metadata_message(payload: &[u8]) -> Result<(MetadataHeader, &[u8])> {
    let mut decoder = Decoder::new(payload);
    let value = decoder.decode_value()?;
    let dict = value.as_dict().ok_or(PeerError::InvalidMessage)?;

    let msg_type = dict
        .get(b"msg_type")
        .and_then(Value::as_int)
        .ok_or(PeerError::InvalidMessage)?;
    let piece = dict
        .get(b"piece")
        .and_then(Value::as_int)
        .filter(|piece| *piece >= 0)
        .ok_or(PeerError::InvalidMessage)? as usize;
    let total_size = dict
        .get(b"total_size")
        .and_then(Value::as_int)
        .filter(|size| *size >= 0)
        .map(|size| size as usize);

    Ok((MetadataHeader { msg_type, piece, total_size }, decoder.remainder()))
}

// Addresses in a ut_pex `added` field: packed 6-byte IPv4 + big-endian port
// records. Anything else in the payload is ignored.
pub fn parse_pex_added(payload: &[u8]) -> Result<Vec<SocketAddr>> {
    let value = bencode::decode(payload)?;
    let dict = value.as_dict().ok_or(PeerError::InvalidMessage)?;

    let added = match dict.get(b"added").and_then(Value::as_bytes) {
        Some(added) if added.len() % 6 == 0 => added,
        Some(_) => return Err(PeerError::InvalidMessage),
        None => return Ok(Vec::new()),
    };

    Ok(added
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::V4(SocketAddrV4::new(ip, port))
        })
        .collect())
}

// {added: <6N bytes>, added.f: <N zero bytes>}. We have no flags worth
// advertising, so added.f is all zeroes.
pub fn pex_message(peers: &[SocketAddr]) -> Vec<u8> {
    let mut added = Vec::new();
    let mut count = 0usize;
    for peer in peers {
        if let SocketAddr::V4(addr) = peer {
            added.extend_from_slice(&addr.ip().octets());
            added.extend_from_slice(&addr.port().to_be_bytes());
            count += 1;
        }
    }

    let mut payload = Dict::new();
    payload.insert("added", added);
    payload.insert("added.f", vec![0u8; count]);
    bencode::encode(&Value::from(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_our_handshake_payload() {
        assert_eq!(
            ExtensionHandshake::ours(),
            b"d1:md11:ut_metadatai2e6:ut_pexi1eee",
        );
    }

    #[test]
    fn test_parse_handshake() {
        let hs = ExtensionHandshake::parse(
            b"d1:md6:ut_pexi3e11:ut_metadatai7ee13:metadata_sizei31235e1:v4:demoe",
        )
        .unwrap();
        assert_eq!(hs.id_for(UT_PEX), Some(3));
        assert_eq!(hs.id_for(UT_METADATA), Some(7));
        assert_eq!(hs.name_for(3), Some(UT_PEX));
        assert_eq!(hs.metadata_size, Some(31235));
        assert_eq!(hs.name_for(9), None);
    }

    #[test]
    fn test_metadata_request_payload() {
        assert_eq!(metadata_request(4), b"d8:msg_typei0e5:piecei4ee");
    }

    #[test]
    fn test_parse_metadata_data_message() {
        let mut payload = b"d8:msg_typei1e5:piecei0e10:total_sizei6ee".to_vec();
        payload.extend_from_slice(b"abcdef");

        let (header, tail) = parse_metadata_message(&payload).unwrap();
        assert_eq!(header.msg_type, METADATA_MSG_DATA);
        assert_eq!(header.piece, 0);
        assert_eq!(header.total_size, Some(6));
        assert_eq!(tail, b"abcdef");
    }

    #[test]
    fn test_parse_metadata_without_total_size() {
        // The cursor, not total_size, decides where the tail starts.
        let mut payload = b"d8:msg_typei1e5:piecei2ee".to_vec();
        payload.extend_from_slice(&[9u8; 100]);

        let (header, tail) = parse_metadata_message(&payload).unwrap();
        assert_eq!(header.piece, 2);
        assert_eq!(header.total_size, None);
        assert_eq!(tail.len(), 100);
    }

    #[test]
    fn test_parse_pex_added() {
        let payload = b"d5:added6:\x01\x02\x03\x04\x15\xb3e";
        let peers = parse_pex_added(payload).unwrap();
        assert_eq!(peers, vec!["1.2.3.4:5555".parse().unwrap()]);
    }

    #[test]
    fn test_pex_round_trip() {
        let peers: Vec<SocketAddr> = vec![
            "10.0.0.1:6881".parse().unwrap(),
            "192.168.1.9:51413".parse().unwrap(),
        ];
        let parsed = parse_pex_added(&pex_message(&peers)).unwrap();
        assert_eq!(parsed, peers);
    }

    #[test]
    fn test_pex_rejects_ragged_added() {
        assert!(parse_pex_added(b"d5:added5:\x01\x02\x03\x04\x15e").is_err());
    }
}
