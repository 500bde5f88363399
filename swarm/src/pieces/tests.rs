use std::net::SocketAddr;
use tokio::sync::mpsc;
use bencode::{Dict, Value};
use crate::{config::Config, p2p::PeerCommand, torrent::TorrentRx, PeerId, BLOCK_SIZE};
use super::*;

fn meta_for(name: &str, data: &[u8], piece_len: usize) -> MetaInfo {
    let hashes: Vec<u8> = data
        .chunks(piece_len)
        .flat_map(|piece| <[u8; 20]>::from(Sha1::digest(piece)))
        .collect();

    let mut info = Dict::new();
    info.insert("length", data.len() as i64);
    info.insert("name", name);
    info.insert("piece length", piece_len as i64);
    info.insert("pieces", hashes);
    let mut root = Dict::new();
    root.insert("info", info);
    MetaInfo::from_bytes(&bencode::encode(&Value::from(root))).unwrap()
}

fn config_for(dir: &tempfile::TempDir) -> Config {
    Config {
        output_dir: dir.path().to_path_buf(),
        ..Config::default()
    }
}

fn store_for(meta: &MetaInfo, config: &Config) -> (PieceStore, TorrentRx) {
    let (torrent_tx, torrent_rx) = mpsc::unbounded_channel();
    (PieceStore::new(meta, config, torrent_tx).unwrap(), torrent_rx)
}

fn sample_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn peer(n: u8) -> PeerId {
    [n; 20]
}

fn addr(n: u8) -> SocketAddr {
    format!("10.0.0.{}:6881", n).parse().unwrap()
}

fn full_bitfield(bytes: usize) -> Bitfield {
    Bitfield::from_vec(vec![0xFF; bytes])
}

// Scenario: 50 000 bytes over two 32 768-byte pieces. Two good blocks walk
// piece 0 through missing -> ongoing -> have.
#[tokio::test(flavor = "multi_thread")]
async fn test_piece_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let data = sample_data(50_000);
    let meta = meta_for("t.bin", &data, 32_768);
    let (store, _torrent_rx) = store_for(&meta, &config_for(&dir));

    let p = peer(1);
    store.add_peer(p, &full_bitfield(1), addr(1));

    let (missing, ongoing, have) = store.lists();
    assert_eq!((missing.len(), ongoing.len(), have.len()), (2, 0, 0));

    let first = store.next_request(&p).unwrap();
    assert_eq!((first.piece_idx, first.offset, first.len), (0, 0, BLOCK_SIZE));
    let (missing, ongoing, _) = store.lists();
    assert_eq!(missing, vec![1]);
    assert_eq!(ongoing, vec![0]);

    let receipt = store.block_received(&p, 0, 0, data[..BLOCK_SIZE].to_vec());
    assert_eq!(receipt, BlockReceipt::Accepted);

    let second = store.next_request(&p).unwrap();
    assert_eq!((second.piece_idx, second.offset), (0, BLOCK_SIZE));

    let receipt = store.block_received(&p, 0, BLOCK_SIZE, data[BLOCK_SIZE..32_768].to_vec());
    assert_eq!(receipt, BlockReceipt::PieceComplete(0));

    // The three lists partition the pieces.
    let (missing, ongoing, have) = store.lists();
    assert_eq!(missing, vec![1]);
    assert!(ongoing.is_empty());
    assert_eq!(have, vec![0]);
    assert_eq!(store.downloaded_bytes(), 32_768);
    assert!(!store.complete());

    // A verified block reads back through the disk worker.
    let (tx, mut rx) = mpsc::unbounded_channel();
    store.read_block(BlockInfo { piece_idx: 0, offset: 0, len: BLOCK_SIZE }, tx);
    match rx.recv().await {
        Some(PeerCommand::BlockRead(block)) => {
            assert_eq!(block.piece_idx, 0);
            assert_eq!(block.offset, 0);
            assert_eq!(block.data, &data[..BLOCK_SIZE]);
        },
        _ => panic!("expected a block read reply"),
    }
}

// Scenario: a corrupted first block. The piece must return to missing with
// every block reset and nothing counted as downloaded.
#[tokio::test(flavor = "multi_thread")]
async fn test_hash_mismatch_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let data = sample_data(50_000);
    let meta = meta_for("t.bin", &data, 32_768);
    let (store, _torrent_rx) = store_for(&meta, &config_for(&dir));

    let p = peer(1);
    store.add_peer(p, &full_bitfield(1), addr(1));

    store.next_request(&p).unwrap();
    let receipt = store.block_received(&p, 0, 0, vec![b'X'; BLOCK_SIZE]);
    assert_eq!(receipt, BlockReceipt::Accepted);

    store.next_request(&p).unwrap();
    let receipt = store.block_received(&p, 0, BLOCK_SIZE, data[BLOCK_SIZE..32_768].to_vec());
    assert_eq!(receipt, BlockReceipt::PieceFailed(0));

    let (missing, ongoing, have) = store.lists();
    // Requeued at the head of missing.
    assert_eq!(missing, vec![0, 1]);
    assert!(ongoing.is_empty());
    assert!(have.is_empty());
    assert_eq!(store.downloaded_bytes(), 0);

    // Every block is wanted again from scratch.
    let retry = store.next_request(&p).unwrap();
    assert_eq!((retry.piece_idx, retry.offset), (0, 0));
}

// A returned block always comes from a piece the peer claims.
#[tokio::test(flavor = "multi_thread")]
async fn test_no_wasted_request() {
    let dir = tempfile::tempdir().unwrap();
    let data = sample_data(50_000);
    let meta = meta_for("t.bin", &data, 32_768);
    let (store, _torrent_rx) = store_for(&meta, &config_for(&dir));

    // Unknown peers have nothing useful.
    assert_eq!(store.next_request(&peer(9)), None);

    // Claims only piece 1 (bit 1, MSB first).
    let p = peer(1);
    store.add_peer(p, &Bitfield::from_vec(vec![0b0100_0000]), addr(1));

    let block = store.next_request(&p).unwrap();
    assert_eq!(block.piece_idx, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rarest_first_with_index_tiebreak() {
    let dir = tempfile::tempdir().unwrap();
    let data = sample_data(BLOCK_SIZE * 2 + 100);
    let meta = meta_for("t.bin", &data, BLOCK_SIZE);
    let (store, _torrent_rx) = store_for(&meta, &config_for(&dir));
    assert_eq!(store.num_pieces(), 3);

    let a = peer(1);
    store.add_peer(a, &full_bitfield(1), addr(1));
    // Two more peers hold only piece 2, making it the most common.
    for n in [2, 3] {
        store.add_peer(peer(n), &Bitfield::from_vec(vec![0b0010_0000]), addr(n));
    }

    // Pieces 0 and 1 tie on rarity; the lower index wins.
    let block = store.next_request(&a).unwrap();
    assert_eq!(block.piece_idx, 0);
}

// update_peer is idempotent and implicitly creates unknown peers.
#[tokio::test(flavor = "multi_thread")]
async fn test_update_peer() {
    let dir = tempfile::tempdir().unwrap();
    let data = sample_data(50_000);
    let meta = meta_for("t.bin", &data, 32_768);
    let (store, _torrent_rx) = store_for(&meta, &config_for(&dir));

    let p = peer(1);
    store.update_peer(&p, 0);
    store.update_peer(&p, 0);
    store.update_peer(&p, 99); // past the end, ignored

    let block = store.next_request(&p).unwrap();
    assert_eq!(block.piece_idx, 0);
}

// Scenario: 100 pieces, 99 already have. Five peers all get handed blocks of
// the one missing piece without waiting for any timeout.
#[tokio::test(flavor = "multi_thread")]
async fn test_endgame_duplicates_pending_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let piece_len = BLOCK_SIZE * 4;
    let meta = meta_for("big.bin", &vec![0u8; piece_len * 100], piece_len);

    // Resume bitfield claiming everything but piece 10.
    let mut bitfield = vec![0xFFu8; 13];
    bitfield[10 / 8] &= !(1 << (7 - 10 % 8));
    std::fs::write(
        dir.path().join(format!("{}.resume", meta.info_hash_hex())),
        &bitfield,
    )
    .unwrap();

    let (store, _torrent_rx) = store_for(&meta, &config_for(&dir));
    let (missing, _, have) = store.lists();
    assert_eq!(missing, vec![10]);
    assert_eq!(have.len(), 99);

    let peers: Vec<PeerId> = (1..=5).map(peer).collect();
    for (n, p) in peers.iter().enumerate() {
        store.add_peer(*p, &full_bitfield(13), addr(n as u8 + 1));
    }

    // Four peers drain the four fresh blocks of piece 10.
    let mut offsets = Vec::new();
    for p in peers.iter().take(4) {
        let block = store.next_request(p).unwrap();
        assert_eq!(block.piece_idx, 10);
        offsets.push(block.offset);
    }
    assert_eq!(offsets, vec![0, BLOCK_SIZE, BLOCK_SIZE * 2, BLOCK_SIZE * 3]);

    // The fifth duplicates the first pending block instead of idling.
    let dup = store.next_request(&peers[4]).unwrap();
    assert_eq!((dup.piece_idx, dup.offset), (10, 0));

    // And the first peer, asking again, duplicates a block it has not been
    // issued rather than its own.
    let dup = store.next_request(&peers[0]).unwrap();
    assert_eq!((dup.piece_idx, dup.offset), (10, BLOCK_SIZE));
}

// A pending block whose timer expired is re-issued to another holder.
#[tokio::test(flavor = "multi_thread")]
async fn test_stale_pending_block_is_retried() {
    let dir = tempfile::tempdir().unwrap();
    let data = sample_data(50_000);
    let meta = meta_for("t.bin", &data, 32_768);
    let config = Config {
        request_timeout: Duration::ZERO,
        ..config_for(&dir)
    };
    let (store, _torrent_rx) = store_for(&meta, &config);

    let (a, b) = (peer(1), peer(2));
    store.add_peer(a, &full_bitfield(1), addr(1));
    store.add_peer(b, &full_bitfield(1), addr(2));

    let first = store.next_request(&a).unwrap();
    // Everything times out instantly, so b is handed the same block.
    let retry = store.next_request(&b).unwrap();
    assert_eq!(first, retry);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resume_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let data = sample_data(50_000);
    let meta = meta_for("t.bin", &data, 32_768);
    let config = config_for(&dir);

    {
        let (store, _torrent_rx) = store_for(&meta, &config);
        let p = peer(1);
        store.add_peer(p, &full_bitfield(1), addr(1));
        store.next_request(&p).unwrap();
        store.block_received(&p, 0, 0, data[..BLOCK_SIZE].to_vec());
        store.next_request(&p).unwrap();
        let receipt = store.block_received(&p, 0, BLOCK_SIZE, data[BLOCK_SIZE..32_768].to_vec());
        assert_eq!(receipt, BlockReceipt::PieceComplete(0));
        store.close().await;
    }

    // Piece 0 is on disk and bit 0 of the resume bitfield is set, MSB first.
    let file = std::fs::read(dir.path().join("t.bin")).unwrap();
    assert_eq!(&file[..32_768], &data[..32_768]);
    let resume = std::fs::read(dir.path().join(format!("{}.resume", meta.info_hash_hex()))).unwrap();
    assert_eq!(resume.len(), 1);
    assert_eq!(resume[0], 0b1000_0000);

    // Reopening trusts the bitfield without touching the data.
    let (store, _torrent_rx) = store_for(&meta, &config);
    let (missing, ongoing, have) = store.lists();
    assert_eq!(missing, vec![1]);
    assert!(ongoing.is_empty());
    assert_eq!(have, vec![0]);
    assert_eq!(store.downloaded_bytes(), 32_768);
}

// Without a resume file the store falls back to hashing what is on disk.
#[tokio::test(flavor = "multi_thread")]
async fn test_hash_check_fallback() {
    let dir = tempfile::tempdir().unwrap();
    let data = sample_data(50_000);
    let meta = meta_for("t.bin", &data, 32_768);
    std::fs::write(dir.path().join("t.bin"), &data).unwrap();

    let (store, _torrent_rx) = store_for(&meta, &config_for(&dir));
    assert!(store.complete());
    assert_eq!(store.downloaded_bytes(), 50_000);
}

// A malformed (short) resume file is recoverable via the hash check.
#[tokio::test(flavor = "multi_thread")]
async fn test_malformed_resume_falls_back_to_hash_check() {
    let dir = tempfile::tempdir().unwrap();
    let data = sample_data(50_000);
    let meta = meta_for("t.bin", &data, 32_768);
    std::fs::write(dir.path().join("t.bin"), &data).unwrap();
    std::fs::write(dir.path().join(format!("{}.resume", meta.info_hash_hex())), b"").unwrap();

    let (store, _torrent_rx) = store_for(&meta, &config_for(&dir));
    assert!(store.complete());
}

// Late or duplicate blocks are dropped without side effects.
#[tokio::test(flavor = "multi_thread")]
async fn test_late_block_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let data = sample_data(50_000);
    let meta = meta_for("t.bin", &data, 32_768);
    let (store, _torrent_rx) = store_for(&meta, &config_for(&dir));

    let p = peer(1);
    store.add_peer(p, &full_bitfield(1), addr(1));

    // Piece 1 was never started.
    let receipt = store.block_received(&p, 1, 0, vec![0; BLOCK_SIZE]);
    assert_eq!(receipt, BlockReceipt::Ignored);
    assert_eq!(store.downloaded_bytes(), 0);

    // Bad geometry inside an ongoing piece.
    store.next_request(&p).unwrap();
    let receipt = store.block_received(&p, 0, 3, vec![0; BLOCK_SIZE]);
    assert_eq!(receipt, BlockReceipt::Ignored);
}

// Reads are only served out of verified pieces.
#[tokio::test(flavor = "multi_thread")]
async fn test_read_block_requires_have() {
    let dir = tempfile::tempdir().unwrap();
    let data = sample_data(50_000);
    let meta = meta_for("t.bin", &data, 32_768);
    let (store, _torrent_rx) = store_for(&meta, &config_for(&dir));

    let (tx, mut rx) = mpsc::unbounded_channel();
    store.read_block(BlockInfo { piece_idx: 0, offset: 0, len: BLOCK_SIZE }, tx);
    // Dropped: the sender went nowhere, so the channel is already closed.
    assert!(rx.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_remove_peer_clears_claims() {
    let dir = tempfile::tempdir().unwrap();
    let data = sample_data(50_000);
    let meta = meta_for("t.bin", &data, 32_768);
    let (store, _torrent_rx) = store_for(&meta, &config_for(&dir));

    let p = peer(1);
    store.add_peer(p, &full_bitfield(1), addr(1));
    assert_eq!(store.active_peers(), vec![addr(1)]);

    store.remove_peer(&p);
    assert!(store.active_peers().is_empty());
    assert_eq!(store.next_request(&p), None);
}
