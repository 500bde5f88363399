use std::net::SocketAddr;
use crate::{block::BlockInfo, p2p::PeerTx, Bitfield, PeerId};

// Outcome of depositing a block, so the session can fan out Have/Cancel
// messages through the orchestrator when a piece completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReceipt {

    // Stored; the piece is still incomplete.
    Accepted,

    // The piece assembled and verified.
    PieceComplete(usize),

    // The piece assembled but failed verification and was reset.
    PieceFailed(usize),

    // Late, duplicate or unknown; dropped silently.
    Ignored,

}

// The capability surface a peer session needs from whatever is driving the
// torrent. The piece store implements the block operations and ignores the
// metadata ones; the metadata fetcher is the mirror image, so sessions run
// identically in both phases.
pub trait Manager: Send + Sync {

    // Next block worth requesting from this peer, or None if the peer has
    // nothing useful right now.
    fn next_request(&self, peer: &PeerId) -> Option<BlockInfo>;

    // Registers a peer and the pieces it claims. Claims accumulate: calling
    // this again unions into the existing set.
    fn add_peer(&self, peer: PeerId, bitfield: &Bitfield, addr: SocketAddr);

    // The peer announced one more piece. Unknown peers get an empty record.
    fn update_peer(&self, peer: &PeerId, piece_idx: usize);

    fn remove_peer(&self, peer: &PeerId);

    fn block_received(
        &self,
        peer: &PeerId,
        piece_idx: usize,
        offset: usize,
        data: Vec<u8>,
    ) -> BlockReceipt;

    // Addresses of peers this manager knows about, for PEX.
    fn active_peers(&self) -> Vec<SocketAddr>;

    // Serves a verified block; the reply arrives on the session's command
    // channel once the disk worker gets to it.
    fn read_block(&self, block: BlockInfo, tx: PeerTx);

    fn complete(&self) -> bool;

    fn downloaded_bytes(&self) -> u64 {
        0
    }

    // Metadata-mode operations; no-ops outside of magnet startup.

    fn set_metadata_size(&self, _size: usize) {}

    fn next_metadata_request(&self) -> Option<usize> {
        None
    }

    fn metadata_received(&self, _piece_idx: usize, _data: &[u8]) {}
}
