use crate::block::{block_len, num_blocks};
use crate::BLOCK_SIZE;

#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub enum BlockState {

    // Not yet requested from anybody.
    #[default]
    Missing,

    // Requested from at least one peer.
    Pending,

    // Data is in hand (or on disk, for verified pieces).
    Retrieved,

}

#[derive(Debug)]
pub struct Block {

    // Offset in bytes within the piece.
    pub offset: usize,

    pub len: usize,

    pub state: BlockState,

    // Present only between retrieval and piece verification.
    pub data: Option<Vec<u8>>,

}

// A piece and its blocks. The piece is complete only once every block is
// retrieved and the assembled bytes hash to `hash`.
#[derive(Debug)]
pub struct Piece {

    pub idx: usize,

    pub len: usize,

    // Expected SHA-1 of the assembled piece.
    pub hash: [u8; 20],

    // Ordered by offset.
    pub blocks: Vec<Block>,

}

impl Piece {

    pub fn new(idx: usize, len: usize, hash: [u8; 20]) -> Self {
        let blocks = (0..num_blocks(len))
            .map(|i| Block {
                offset: i * BLOCK_SIZE,
                len: block_len(len, i),
                state: BlockState::Missing,
                data: None,
            })
            .collect();
        Self { idx, len, hash, blocks }
    }

    // The block starting exactly at `offset`, if there is one.
    pub fn block_at(&mut self, offset: usize) -> Option<&mut Block> {
        if offset % BLOCK_SIZE != 0 {
            return None;
        }
        self.blocks.get_mut(offset / BLOCK_SIZE)
    }

    pub fn all_retrieved(&self) -> bool {
        self.blocks.iter().all(|b| b.state == BlockState::Retrieved)
    }

    // Concatenates block data in offset order. Only valid when every block
    // holds data.
    pub fn assemble(&self) -> Vec<u8> {
        debug_assert!(self.blocks.iter().all(|b| b.data.is_some()));
        let mut out = Vec::with_capacity(self.len);
        for block in self.blocks.iter() {
            if let Some(data) = &block.data {
                out.extend_from_slice(data);
            }
        }
        out
    }

    // Hash failure: every block goes back to Missing.
    pub fn reset(&mut self) {
        for block in self.blocks.iter_mut() {
            block.state = BlockState::Missing;
            block.data = None;
        }
    }

    // The bytes went to disk; keep the states, drop the copies.
    pub fn clear_data(&mut self) {
        for block in self.blocks.iter_mut() {
            block.data = None;
        }
    }

    // Used when restoring verified pieces: states only, no data in memory.
    pub fn mark_retrieved(&mut self) {
        for block in self.blocks.iter_mut() {
            block.state = BlockState::Retrieved;
            block.data = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_piece_blocks() {
        let piece = Piece::new(0, BLOCK_SIZE * 2 + 100, [0; 20]);
        assert_eq!(piece.blocks.len(), 3);
        assert_eq!(piece.blocks[0].len, BLOCK_SIZE);
        assert_eq!(piece.blocks[2].offset, BLOCK_SIZE * 2);
        assert_eq!(piece.blocks[2].len, 100);
    }

    #[test]
    fn test_block_at_rejects_misaligned_offsets() {
        let mut piece = Piece::new(0, BLOCK_SIZE * 2, [0; 20]);
        assert!(piece.block_at(0).is_some());
        assert!(piece.block_at(BLOCK_SIZE).is_some());
        assert!(piece.block_at(7).is_none());
        assert!(piece.block_at(BLOCK_SIZE * 2).is_none());
    }

    #[test]
    fn test_reset_clears_blocks() {
        let mut piece = Piece::new(0, BLOCK_SIZE, [0; 20]);
        piece.blocks[0].state = BlockState::Retrieved;
        piece.blocks[0].data = Some(vec![1, 2, 3]);
        piece.reset();
        assert_eq!(piece.blocks[0].state, BlockState::Missing);
        assert!(piece.blocks[0].data.is_none());
    }
}
