use std::{
    collections::{HashMap, HashSet, VecDeque},
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Mutex,
    time::{Duration, Instant},
};
use sha1::{Digest, Sha1};
use tokio::sync::oneshot;
use crate::{
    block::BlockInfo,
    config::Config,
    fs::{self, disk::{CommandToDisk, DiskTx}, FileMapper},
    manager::{BlockReceipt, Manager},
    metainfo::MetaInfo,
    p2p::PeerTx,
    store::StoreInfo,
    torrent::TorrentTx,
    Bitfield, PeerId,
};
use piece::{BlockState, Piece};

mod piece;
#[cfg(test)]
mod tests;

// A block handed to some peer, awaiting its data. Endgame may issue the same
// block to several peers; they all ride on the one timer.
#[derive(Debug)]
struct PendingBlock {
    block: BlockInfo,
    issued_at: Instant,
    issued_to: Vec<PeerId>,
}

#[derive(Debug, Default)]
struct PeerRecord {
    addr: Option<SocketAddr>,
    pieces: HashSet<usize>,
}

// Mutable scheduler state, all behind one lock. Every piece is on exactly one
// of the three lists.
#[derive(Debug)]
struct State {
    pieces: Vec<Piece>,
    missing: VecDeque<usize>,
    ongoing: Vec<usize>,
    have: Vec<usize>,
    pending: Vec<PendingBlock>,
    peers: HashMap<PeerId, PeerRecord>,
    downloaded: u64,
}

// Owns the piece/block inventory, schedules requests (rarest first with an
// endgame), verifies completed pieces and persists them through the disk
// worker. Restores earlier progress from the resume bitfield, or a full hash
// check when that is missing or malformed.
#[derive(Debug)]
pub struct PieceStore {

    info: StoreInfo,

    resume_path: PathBuf,

    disk_tx: DiskTx,

    disk_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,

    request_timeout: Duration,

    endgame_min_pieces: usize,

    endgame_percent: usize,

    state: Mutex<State>,

}

impl PieceStore {

    pub fn new(meta: &MetaInfo, config: &Config, torrent_tx: TorrentTx) -> fs::Result<Self> {

        let info = StoreInfo::new(meta, config.output_dir.clone());
        let mut mapper = FileMapper::new(&info, config.write_cache_limit)?;

        let pieces = meta
            .piece_hashes
            .iter()
            .enumerate()
            .map(|(idx, hash)| Piece::new(idx, info.piece_length(idx), *hash))
            .collect();
        let mut state = State {
            pieces,
            missing: (0..info.num_pieces).collect(),
            ongoing: Vec::new(),
            have: Vec::new(),
            pending: Vec::new(),
            peers: HashMap::new(),
            downloaded: 0,
        };

        let resume_path = config.output_dir.join(format!("{}.resume", meta.info_hash_hex()));
        restore_state(&mut state, &mut mapper, &resume_path, &info);

        let (disk_handle, disk_tx) = fs::disk::spawn(mapper, config.read_cache_pieces, torrent_tx);

        Ok(Self {
            info,
            resume_path,
            disk_tx,
            disk_handle: Mutex::new(Some(disk_handle)),
            request_timeout: config.request_timeout,
            endgame_min_pieces: config.endgame_min_pieces,
            endgame_percent: config.endgame_percent,
            state: Mutex::new(state),
        })
    }

    // Flushes buffered writes, closes the files and saves the resume
    // bitfield. The bitfield is only trustworthy once this returns.
    pub async fn close(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.disk_tx.send(CommandToDisk::Shutdown(ack_tx)).is_ok() {
            ack_rx.await.ok();
        }
        let handle = self.disk_handle.lock().expect("piece store poisoned").take();
        if let Some(handle) = handle {
            handle.await.ok();
        }
        self.save_resume();
    }

    pub fn num_pieces(&self) -> usize {
        self.info.num_pieces
    }

    pub fn total_len(&self) -> u64 {
        self.info.total_len
    }

    fn save_resume(&self) {
        let state = self.state.lock().expect("piece store poisoned");
        let mut bitfield = vec![0u8; (state.pieces.len() + 7) / 8];
        for &idx in state.have.iter() {
            bitfield[idx / 8] |= 1 << (7 - idx % 8);
        }
        match std::fs::write(&self.resume_path, &bitfield) {
            Ok(()) => tracing::info!("resume data saved"),
            Err(e) => tracing::error!("failed to save resume data: {}", e),
        }
    }

    #[cfg(test)]
    fn lists(&self) -> (Vec<usize>, Vec<usize>, Vec<usize>) {
        let state = self.state.lock().unwrap();
        (
            state.missing.iter().copied().collect(),
            state.ongoing.clone(),
            state.have.clone(),
        )
    }
}

impl Manager for PieceStore {

    // Strict priority: stale pending retry, then open blocks of in-flight
    // pieces, then endgame duplication, then the rarest untouched piece.
    fn next_request(&self, peer: &PeerId) -> Option<BlockInfo> {
        let mut guard = self.state.lock().expect("piece store poisoned");
        let state = &mut *guard;
        let now = Instant::now();

        let State { pieces, missing, ongoing, have, pending, peers, .. } = state;
        let record = peers.get(peer)?;

        // 1. A block nobody delivered within the timeout; refresh its clock.
        if let Some(entry) = pending.iter_mut().find(|p| {
            now.duration_since(p.issued_at) >= self.request_timeout
                && record.pieces.contains(&p.block.piece_idx)
        }) {
            entry.issued_at = now;
            if !entry.issued_to.contains(peer) {
                entry.issued_to.push(*peer);
            }
            tracing::trace!("re-issuing stale block {:?}", entry.block);
            return Some(entry.block);
        }

        // 2. First missing block inside a piece already in flight.
        for &idx in ongoing.iter() {
            if !record.pieces.contains(&idx) {
                continue;
            }
            if let Some(block) = pieces[idx]
                .blocks
                .iter_mut()
                .find(|b| b.state == BlockState::Missing)
            {
                block.state = BlockState::Pending;
                let info = BlockInfo { piece_idx: idx, offset: block.offset, len: block.len };
                pending.push(PendingBlock { block: info, issued_at: now, issued_to: vec![*peer] });
                return Some(info);
            }
        }

        // 3. Endgame: duplicate an in-flight block across peers. Duplicates
        // ride on the original timer.
        let remaining = pieces.len() - have.len();
        let threshold = self
            .endgame_min_pieces
            .max(pieces.len() * self.endgame_percent / 100);
        if remaining < threshold {
            if let Some(entry) = pending.iter_mut().find(|p| {
                record.pieces.contains(&p.block.piece_idx) && !p.issued_to.contains(peer)
            }) {
                entry.issued_to.push(*peer);
                tracing::trace!("endgame duplicate of {:?}", entry.block);
                return Some(entry.block);
            }
        }

        // 4. Rarest first among untouched pieces, ties to the lower index.
        let mut candidates: Vec<usize> = missing
            .iter()
            .copied()
            .filter(|idx| record.pieces.contains(idx))
            .collect();
        if candidates.is_empty() {
            return None;
        }
        candidates.sort_by_key(|idx| {
            let rarity = peers.values().filter(|r| r.pieces.contains(idx)).count();
            (rarity, *idx)
        });
        let idx = candidates[0];
        missing.retain(|i| *i != idx);
        ongoing.push(idx);

        let block = &mut pieces[idx].blocks[0];
        block.state = BlockState::Pending;
        let info = BlockInfo { piece_idx: idx, offset: block.offset, len: block.len };
        pending.push(PendingBlock { block: info, issued_at: now, issued_to: vec![*peer] });
        Some(info)
    }

    fn add_peer(&self, peer: PeerId, bitfield: &Bitfield, addr: SocketAddr) {
        let mut state = self.state.lock().expect("piece store poisoned");
        let num_pieces = state.pieces.len();
        let record = state.peers.entry(peer).or_default();
        record.addr = Some(addr);
        // Claims accumulate; indices past the end of the torrent are ignored.
        for idx in bitfield.iter_ones().filter(|idx| *idx < num_pieces) {
            record.pieces.insert(idx);
        }
    }

    fn update_peer(&self, peer: &PeerId, piece_idx: usize) {
        let mut state = self.state.lock().expect("piece store poisoned");
        if piece_idx >= state.pieces.len() {
            return;
        }
        state.peers.entry(*peer).or_default().pieces.insert(piece_idx);
    }

    fn remove_peer(&self, peer: &PeerId) {
        self.state
            .lock()
            .expect("piece store poisoned")
            .peers
            .remove(peer);
    }

    fn block_received(
        &self,
        _peer: &PeerId,
        piece_idx: usize,
        offset: usize,
        data: Vec<u8>,
    ) -> BlockReceipt {
        let mut guard = self.state.lock().expect("piece store poisoned");
        let state = &mut *guard;

        if let Some(at) = state
            .pending
            .iter()
            .position(|p| p.block.piece_idx == piece_idx && p.block.offset == offset)
        {
            state.pending.remove(at);
        }

        // Late or duplicate data for a piece that is not in flight.
        if !state.ongoing.contains(&piece_idx) {
            tracing::trace!("dropping block for piece {} not in flight", piece_idx);
            return BlockReceipt::Ignored;
        }

        let piece = &mut state.pieces[piece_idx];
        match piece.block_at(offset) {
            Some(block) if block.len == data.len() => {
                block.state = BlockState::Retrieved;
                block.data = Some(data);
            },
            _ => {
                tracing::warn!(
                    "dropping block with bad geometry: piece {} offset {} len {}",
                    piece_idx, offset, data.len(),
                );
                return BlockReceipt::Ignored;
            },
        }

        if !piece.all_retrieved() {
            return BlockReceipt::Accepted;
        }

        let assembled = piece.assemble();
        let digest: [u8; 20] = Sha1::digest(&assembled).into();
        let verified = digest == piece.hash;
        if verified {
            piece.clear_data();
        } else {
            piece.reset();
        }

        state.ongoing.retain(|i| *i != piece_idx);
        state.pending.retain(|p| p.block.piece_idx != piece_idx);

        if verified {
            state.have.push(piece_idx);
            state.downloaded += assembled.len() as u64;
            tracing::info!(
                "piece {} verified, {}/{} pieces have",
                piece_idx,
                state.have.len(),
                state.pieces.len(),
            );
            self.disk_tx
                .send(CommandToDisk::WritePiece {
                    offset: self.info.piece_offset(piece_idx),
                    data: assembled,
                })
                .ok();
            BlockReceipt::PieceComplete(piece_idx)
        } else {
            tracing::warn!("piece {} failed hash verification, retrying", piece_idx);
            state.missing.push_front(piece_idx);
            BlockReceipt::PieceFailed(piece_idx)
        }
    }

    fn active_peers(&self) -> Vec<SocketAddr> {
        self.state
            .lock()
            .expect("piece store poisoned")
            .peers
            .values()
            .filter_map(|record| record.addr)
            .collect()
    }

    // Only verified pieces are served; the disk worker replies on the
    // session's channel.
    fn read_block(&self, block: BlockInfo, tx: PeerTx) {
        if block.piece_idx >= self.info.num_pieces {
            tracing::warn!("request for block in non-existent piece: {:?}", block);
            return;
        }
        {
            let state = self.state.lock().expect("piece store poisoned");
            if !state.have.contains(&block.piece_idx) {
                tracing::warn!("request for block in unverified piece: {:?}", block);
                return;
            }
        }
        let piece_len = self.info.piece_length(block.piece_idx);
        if block.offset + block.len > piece_len {
            tracing::warn!("request past end of piece: {:?}", block);
            return;
        }
        self.disk_tx
            .send(CommandToDisk::ReadBlock {
                block,
                piece_offset: self.info.piece_offset(block.piece_idx),
                piece_len,
                tx,
            })
            .ok();
    }

    fn complete(&self) -> bool {
        let state = self.state.lock().expect("piece store poisoned");
        state.have.len() == state.pieces.len()
    }

    fn downloaded_bytes(&self) -> u64 {
        self.state.lock().expect("piece store poisoned").downloaded
    }
}

// Resume: trust the bitfield when it covers every piece, otherwise fall back
// to hashing whatever is on disk.
fn restore_state(state: &mut State, mapper: &mut FileMapper, resume_path: &Path, info: &StoreInfo) {
    match std::fs::read(resume_path) {
        Ok(bitfield) if bitfield.len() * 8 >= info.num_pieces => {
            let found: Vec<usize> = (0..info.num_pieces)
                .filter(|idx| bitfield[idx / 8] >> (7 - idx % 8) & 1 == 1)
                .collect();
            tracing::info!("fast resume: {}/{} pieces", found.len(), info.num_pieces);
            mark_have(state, info, found);
        },
        Ok(_) => {
            tracing::warn!("resume file too short, falling back to hash check");
            hash_check(state, mapper, info);
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            hash_check(state, mapper, info);
        },
        Err(e) => {
            tracing::warn!("failed to read resume file: {}, falling back to hash check", e);
            hash_check(state, mapper, info);
        },
    }
}

fn hash_check(state: &mut State, mapper: &mut FileMapper, info: &StoreInfo) {
    tracing::info!("checking existing data on disk, this may take a while");
    let mut found = Vec::new();
    for idx in 0..info.num_pieces {
        let data = match mapper.read(info.piece_offset(idx), info.piece_length(idx)) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!("hash check read failed for piece {}: {}", idx, e);
                continue;
            },
        };
        let digest: [u8; 20] = Sha1::digest(&data).into();
        if digest == state.pieces[idx].hash {
            found.push(idx);
        }
    }
    tracing::info!("recheck complete, resuming {}/{} pieces", found.len(), info.num_pieces);
    mark_have(state, info, found);
}

fn mark_have(state: &mut State, info: &StoreInfo, found: Vec<usize>) {
    let found_set: HashSet<usize> = found.iter().copied().collect();
    state.missing.retain(|idx| !found_set.contains(idx));
    for idx in found {
        state.pieces[idx].mark_retrieved();
        state.have.push(idx);
        state.downloaded += info.piece_length(idx) as u64;
    }
}
