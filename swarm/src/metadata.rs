use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Mutex,
};
use sha1::{Digest, Sha1};
use crate::{
    block::BlockInfo,
    manager::{BlockReceipt, Manager},
    p2p::PeerTx,
    Bitfield, PeerId,
};

// Metadata travels in 16 KiB pieces over the extension protocol.
pub const METADATA_PIECE_LEN: usize = 0x4000;

// An absurd info dictionary size is a hostile peer, not a torrent.
const MAX_METADATA_SIZE: usize = 8 * 1024 * 1024;

#[derive(Debug, Default)]
struct FetchState {
    size: usize,
    pieces: Vec<Option<Vec<u8>>>,
    active: bool,
    complete: bool,
    raw: Option<Vec<u8>>,
    // Addresses only; bitfields are meaningless before the metadata exists.
    peers: HashMap<PeerId, Option<SocketAddr>>,
}

// Assembles the info dictionary out-of-band when the torrent started from a
// magnet URI. Stands in for the piece store behind the same manager contract;
// the block operations are deliberate no-ops.
#[derive(Debug)]
pub struct MetadataFetcher {
    info_hash: [u8; 20],
    state: Mutex<FetchState>,
}

impl MetadataFetcher {

    pub fn new(info_hash: [u8; 20]) -> Self {
        Self {
            info_hash,
            state: Mutex::new(FetchState::default()),
        }
    }

    // The verified info dictionary, once complete.
    pub fn take_raw(&self) -> Option<Vec<u8>> {
        self.state.lock().expect("fetcher poisoned").raw.take()
    }

    fn verify(state: &mut FetchState, info_hash: &[u8; 20]) {
        let raw: Vec<u8> = state
            .pieces
            .iter()
            .flat_map(|piece| piece.as_deref().expect("all pieces present"))
            .copied()
            .collect();

        let digest: [u8; 20] = Sha1::digest(&raw).into();
        if digest == *info_hash {
            tracing::info!("metadata verified, {} bytes", raw.len());
            state.complete = true;
            state.raw = Some(raw);
        } else {
            tracing::warn!("metadata hash mismatch, restarting");
            let num_pieces = state.pieces.len();
            state.pieces = vec![None; num_pieces];
        }
    }
}

impl Manager for MetadataFetcher {

    fn next_request(&self, _peer: &PeerId) -> Option<BlockInfo> {
        None
    }

    fn add_peer(&self, peer: PeerId, _bitfield: &Bitfield, addr: SocketAddr) {
        let mut state = self.state.lock().expect("fetcher poisoned");
        state.peers.insert(peer, Some(addr));
    }

    fn update_peer(&self, _peer: &PeerId, _piece_idx: usize) {}

    fn remove_peer(&self, peer: &PeerId) {
        self.state.lock().expect("fetcher poisoned").peers.remove(peer);
    }

    fn block_received(
        &self,
        _peer: &PeerId,
        _piece_idx: usize,
        _offset: usize,
        _data: Vec<u8>,
    ) -> BlockReceipt {
        BlockReceipt::Ignored
    }

    fn active_peers(&self) -> Vec<SocketAddr> {
        self.state
            .lock()
            .expect("fetcher poisoned")
            .peers
            .values()
            .filter_map(|addr| *addr)
            .collect()
    }

    fn read_block(&self, _block: BlockInfo, _tx: PeerTx) {}

    fn complete(&self) -> bool {
        self.state.lock().expect("fetcher poisoned").complete
    }

    // Total size arrives in the extension handshake; first one wins.
    fn set_metadata_size(&self, size: usize) {
        let mut state = self.state.lock().expect("fetcher poisoned");
        if state.size > 0 || size == 0 {
            return;
        }
        if size > MAX_METADATA_SIZE {
            tracing::warn!("ignoring absurd metadata size: {}", size);
            return;
        }
        let num_pieces = (size + METADATA_PIECE_LEN - 1) / METADATA_PIECE_LEN;
        state.size = size;
        state.pieces = vec![None; num_pieces];
        state.active = true;
        tracing::info!("metadata download started: {} bytes, {} pieces", size, num_pieces);
    }

    // Sequential scan; metadata is small enough that rarity never matters.
    fn next_metadata_request(&self) -> Option<usize> {
        let state = self.state.lock().expect("fetcher poisoned");
        if !state.active || state.complete {
            return None;
        }
        state.pieces.iter().position(Option::is_none)
    }

    fn metadata_received(&self, piece_idx: usize, data: &[u8]) {
        let mut state = self.state.lock().expect("fetcher poisoned");
        if !state.active || state.complete || piece_idx >= state.pieces.len() {
            return;
        }
        state.pieces[piece_idx] = Some(data.to_vec());

        if state.pieces.iter().all(Option::is_some) {
            Self::verify(&mut state, &self.info_hash);
        }
    }
}
