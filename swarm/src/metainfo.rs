use std::path::PathBuf;
use sha1::{Digest, Sha1};
use bencode::{Dict, Value};
use crate::store::FileSpan;

#[derive(Debug, thiserror::Error)]
pub enum MetaInfoError {

    #[error("bencode error whilst decoding metainfo: {0}")]
    Bencode(#[from] bencode::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid file extension, expected .torrent")]
    InvalidExtension,

    #[error("missing or invalid metainfo field: {0}")]
    InvalidField(&'static str),

    #[error("invalid pieces length, must be divisible by 20")]
    InvalidPiecesLength,

    #[error("invalid magnet uri: {0}")]
    InvalidMagnet(&'static str),

    #[error("metadata does not hash to the expected info-hash")]
    InfoHashMismatch,
}

pub type Result<T> = std::result::Result<T, MetaInfoError>;

// The torrent descriptor. Built either from a .torrent file, in which case
// everything is known up front, or from a magnet URI, in which case only the
// info-hash and trackers are known until the swarm supplies the metadata.
#[derive(Debug, Clone)]
pub struct MetaInfo {

    // SHA-1 of the bencoded info dictionary; the torrent's identity.
    pub info_hash: [u8; 20],

    pub name: String,

    pub piece_len: usize,

    // One 20-byte digest per piece.
    pub piece_hashes: Vec<[u8; 20]>,

    // Files in declaration order covering [0, total_len).
    pub files: Vec<FileSpan>,

    pub total_len: u64,

    pub trackers: Vec<url::Url>,

    // False until the info dictionary is known.
    pub loaded: bool,

}

impl MetaInfo {

    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        if path.as_ref().extension().unwrap_or_default() != "torrent" {
            return Err(MetaInfoError::InvalidExtension);
        }
        Self::from_bytes(&std::fs::read(path)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let root = bencode::decode(data)?;
        let root = root.as_dict().ok_or(MetaInfoError::InvalidField("root"))?;
        let info = root.get(b"info").ok_or(MetaInfoError::InvalidField("info"))?;

        // Re-encode the info dictionary alone; the decoder preserved its key
        // order so the digest matches whatever produced the file.
        let info_hash: [u8; 20] = Sha1::digest(bencode::encode(info)).into();
        let info = info.as_dict().ok_or(MetaInfoError::InvalidField("info"))?;

        let mut meta = MetaInfo {
            info_hash,
            name: String::new(),
            piece_len: 0,
            piece_hashes: Vec::new(),
            files: Vec::new(),
            total_len: 0,
            trackers: trackers_of(root),
            loaded: false,
        };
        meta.populate_info(info)?;
        Ok(meta)
    }

    // magnet:?xt=urn:btih:<hex40>&dn=<name>&tr=<url>[&tr=...]
    pub fn from_magnet(uri: &str) -> Result<Self> {
        let url = url::Url::parse(uri).map_err(|_| MetaInfoError::InvalidMagnet("not a url"))?;
        if url.scheme() != "magnet" {
            return Err(MetaInfoError::InvalidMagnet("scheme is not magnet"));
        }

        let mut info_hash = None;
        let mut name = String::new();
        let mut trackers = Vec::new();

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" => {
                    let digest = value
                        .strip_prefix("urn:btih:")
                        .ok_or(MetaInfoError::InvalidMagnet("xt is not urn:btih"))?;
                    let digest = hex::decode(digest)
                        .map_err(|_| MetaInfoError::InvalidMagnet("info-hash is not hex"))?;
                    let digest: [u8; 20] = digest
                        .try_into()
                        .map_err(|_| MetaInfoError::InvalidMagnet("info-hash is not 20 bytes"))?;
                    info_hash = Some(digest);
                },
                "dn" => name = value.into_owned(),
                "tr" => match url::Url::parse(&value) {
                    Ok(tracker) => trackers.push(tracker),
                    Err(e) => tracing::warn!("skipping bad tracker url {}: {}", value, e),
                },
                _ => {},
            }
        }

        Ok(MetaInfo {
            info_hash: info_hash.ok_or(MetaInfoError::InvalidMagnet("missing xt parameter"))?,
            name,
            piece_len: 0,
            piece_hashes: Vec::new(),
            files: Vec::new(),
            total_len: 0,
            trackers,
            loaded: false,
        })
    }

    // Installs an info dictionary fetched out-of-band. The bytes must hash to
    // the info-hash this descriptor was created with.
    pub fn load_metadata(&mut self, metadata: &[u8]) -> Result<()> {
        let digest: [u8; 20] = Sha1::digest(metadata).into();
        if digest != self.info_hash {
            return Err(MetaInfoError::InfoHashMismatch);
        }
        let info = bencode::decode(metadata)?;
        let info = info.as_dict().ok_or(MetaInfoError::InvalidField("info"))?;
        self.populate_info(info)
    }

    pub fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    pub fn is_multi_file(&self) -> bool {
        self.files.len() > 1
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    fn populate_info(&mut self, info: &Dict) -> Result<()> {
        let name = info
            .get(b"name")
            .and_then(Value::as_str)
            .ok_or(MetaInfoError::InvalidField("name"))?
            .to_owned();

        let piece_len = info
            .get(b"piece length")
            .and_then(Value::as_int)
            .filter(|len| *len > 0)
            .ok_or(MetaInfoError::InvalidField("piece length"))? as usize;

        let pieces = info
            .get(b"pieces")
            .and_then(Value::as_bytes)
            .ok_or(MetaInfoError::InvalidField("pieces"))?;
        if pieces.is_empty() || pieces.len() % 20 != 0 {
            return Err(MetaInfoError::InvalidPiecesLength);
        }
        let piece_hashes = pieces
            .chunks_exact(20)
            .map(|chunk| chunk.try_into().expect("chunks are 20 bytes"))
            .collect();

        let (files, total_len) = files_of(info, &name)?;

        self.name = name;
        self.piece_len = piece_len;
        self.piece_hashes = piece_hashes;
        self.files = files;
        self.total_len = total_len;
        self.loaded = true;
        tracing::debug!(
            "metainfo loaded: {} ({} pieces, {} bytes, {} files)",
            self.name, self.num_pieces(), self.total_len, self.files.len(),
        );
        Ok(())
    }
}

// Normalizes single and multi-file layouts into one sequential span list.
fn files_of(info: &Dict, name: &str) -> Result<(Vec<FileSpan>, u64)> {

    if let Some(files) = info.get(b"files") {
        let files = files.as_list().ok_or(MetaInfoError::InvalidField("files"))?;
        let mut spans = Vec::with_capacity(files.len());
        let mut offset = 0u64;

        for file in files {
            let file = file.as_dict().ok_or(MetaInfoError::InvalidField("files"))?;
            let length = file
                .get(b"length")
                .and_then(Value::as_int)
                .filter(|len| *len >= 0)
                .ok_or(MetaInfoError::InvalidField("length"))? as u64;
            let parts = file
                .get(b"path")
                .and_then(Value::as_list)
                .filter(|parts| !parts.is_empty())
                .ok_or(MetaInfoError::InvalidField("path"))?;

            // Multi-file layouts live under the root name.
            let mut path = PathBuf::from(name);
            for part in parts {
                let part = part.as_str().ok_or(MetaInfoError::InvalidField("path"))?;
                path.push(part);
            }

            spans.push(FileSpan { path, length, start: offset, end: offset + length });
            offset += length;
        }
        Ok((spans, offset))

    } else {
        let length = info
            .get(b"length")
            .and_then(Value::as_int)
            .filter(|len| *len >= 0)
            .ok_or(MetaInfoError::InvalidField("length"))? as u64;
        let span = FileSpan { path: name.into(), length, start: 0, end: length };
        Ok((vec![span], length))
    }
}

// Collects announce-list tiers then the plain announce key, deduplicated in
// order of appearance.
fn trackers_of(root: &Dict) -> Vec<url::Url> {
    let mut raw: Vec<&str> = Vec::new();

    if let Some(tiers) = root.get(b"announce-list").and_then(Value::as_list) {
        for tier in tiers {
            if let Some(tier) = tier.as_list() {
                raw.extend(tier.iter().filter_map(Value::as_str));
            }
        }
    }
    if let Some(announce) = root.get(b"announce").and_then(Value::as_str) {
        raw.push(announce);
    }

    let mut seen = std::collections::HashSet::new();
    raw.into_iter()
        .filter(|url| seen.insert(*url))
        .filter_map(|url| match url::Url::parse(url) {
            Ok(url) => Some(url),
            Err(e) => {
                tracing::warn!("skipping bad tracker url {}: {}", url, e);
                None
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bencode::Dict;

    // A two-file torrent assembled by hand.
    fn sample_torrent() -> (Vec<u8>, Vec<u8>) {
        let mut file_a = Dict::new();
        file_a.insert("length", 10i64);
        file_a.insert("path", vec![Value::from("a.bin")]);
        let mut file_b = Dict::new();
        file_b.insert("length", 5i64);
        file_b.insert("path", vec![Value::from("sub"), Value::from("b.bin")]);

        let mut info = Dict::new();
        info.insert("files", vec![Value::from(file_a), Value::from(file_b)]);
        info.insert("name", "demo");
        info.insert("piece length", 16_384i64);
        info.insert("pieces", &[0xAA; 20][..]);
        let info_bytes = bencode::encode(&Value::from(info.clone()));

        let mut root = Dict::new();
        root.insert("announce", "http://tracker.example/announce");
        root.insert("info", info);
        (bencode::encode(&Value::from(root)), info_bytes)
    }

    #[test]
    fn test_parse_multi_file() {
        let (torrent, info_bytes) = sample_torrent();
        let meta = MetaInfo::from_bytes(&torrent).unwrap();

        assert!(meta.loaded);
        assert_eq!(meta.name, "demo");
        assert_eq!(meta.total_len, 15);
        assert_eq!(meta.num_pieces(), 1);
        assert_eq!(meta.files.len(), 2);
        assert_eq!(meta.files[0].path, PathBuf::from("demo/a.bin"));
        assert_eq!(meta.files[0].byte_range(), 0..10);
        assert_eq!(meta.files[1].path, PathBuf::from("demo/sub/b.bin"));
        assert_eq!(meta.files[1].byte_range(), 10..15);
        assert_eq!(meta.trackers.len(), 1);

        // The descriptor's hash must equal hashing the embedded dictionary.
        let expected: [u8; 20] = Sha1::digest(&info_bytes).into();
        assert_eq!(meta.info_hash, expected);
    }

    #[test]
    fn test_parse_single_file() {
        let mut info = Dict::new();
        info.insert("length", 50_000i64);
        info.insert("name", "data.bin");
        info.insert("piece length", 32_768i64);
        info.insert("pieces", &[0u8; 40][..]);
        let mut root = Dict::new();
        root.insert("info", info);

        let meta = MetaInfo::from_bytes(&bencode::encode(&Value::from(root))).unwrap();
        assert_eq!(meta.files.len(), 1);
        assert_eq!(meta.files[0].path, PathBuf::from("data.bin"));
        assert_eq!(meta.files[0].byte_range(), 0..50_000);
        assert_eq!(meta.num_pieces(), 2);
        assert!(!meta.is_multi_file());
    }

    #[test]
    fn test_parse_magnet() {
        let hash = "aabbccddeeff00112233445566778899aabbccdd";
        let uri = format!(
            "magnet:?xt=urn:btih:{}&dn=demo&tr=http://a.example/ann&tr=udp://b.example:80",
            hash,
        );
        let meta = MetaInfo::from_magnet(&uri).unwrap();

        assert!(!meta.loaded);
        assert_eq!(
            meta.info_hash,
            hex_literal::hex!("aabbccddeeff00112233445566778899aabbccdd"),
        );
        assert_eq!(meta.info_hash_hex(), hash);
        assert_eq!(meta.name, "demo");
        assert_eq!(meta.trackers.len(), 2);
        assert!(meta.piece_hashes.is_empty());
    }

    #[test]
    fn test_magnet_rejects_bad_hash() {
        assert!(MetaInfo::from_magnet("magnet:?xt=urn:btih:zzzz").is_err());
        assert!(MetaInfo::from_magnet("magnet:?dn=nothing").is_err());
        assert!(MetaInfo::from_magnet("http://not.magnet/").is_err());
    }

    #[test]
    fn test_load_metadata() {
        let (_, info_bytes) = sample_torrent();
        let digest: [u8; 20] = Sha1::digest(&info_bytes).into();
        let uri = format!("magnet:?xt=urn:btih:{}", hex::encode(digest));

        let mut meta = MetaInfo::from_magnet(&uri).unwrap();
        meta.load_metadata(&info_bytes).unwrap();
        assert!(meta.loaded);
        assert_eq!(meta.name, "demo");
        assert_eq!(meta.total_len, 15);
    }

    #[test]
    fn test_load_metadata_rejects_mismatch() {
        let (_, info_bytes) = sample_torrent();
        let mut meta = MetaInfo::from_magnet(
            "magnet:?xt=urn:btih:0000000000000000000000000000000000000000",
        )
        .unwrap();
        assert!(matches!(
            meta.load_metadata(&info_bytes),
            Err(MetaInfoError::InfoHashMismatch),
        ));
        assert!(!meta.loaded);
    }
}
