use std::{ops::Range, path::PathBuf};
use crate::metainfo::MetaInfo;

// A single file in the torrent with its span in the global byte space the
// pieces are laid over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSpan {

    // Path relative to the output directory; the root name is already
    // prefixed in multi-file mode.
    pub path: PathBuf,

    pub length: u64,

    // Global offset of the first byte.
    pub start: u64,

    // Global offset one past the last byte.
    pub end: u64,

}

impl FileSpan {
    pub fn byte_range(&self) -> Range<u64> {
        self.start..self.end
    }
}

// Storage geometry shared by the file mapper and the piece store.
#[derive(Debug, Clone)]
pub struct StoreInfo {

    pub total_len: u64,

    pub piece_len: usize,

    // Length of the last piece, <= piece_len.
    pub last_piece_len: usize,

    pub num_pieces: usize,

    pub files: Vec<FileSpan>,

    pub output_dir: PathBuf,

}

impl StoreInfo {

    pub fn new(meta: &MetaInfo, output_dir: PathBuf) -> Self {
        debug_assert!(meta.loaded, "storage geometry needs the info dictionary");
        let num_pieces = meta.piece_hashes.len();
        let last_piece_len =
            (meta.total_len - meta.piece_len as u64 * (num_pieces as u64 - 1)) as usize;

        Self {
            total_len: meta.total_len,
            piece_len: meta.piece_len,
            last_piece_len,
            num_pieces,
            files: meta.files.clone(),
            output_dir,
        }
    }

    // Length of a piece given its index; only the last one may be short.
    pub fn piece_length(&self, idx: usize) -> usize {
        if idx == self.num_pieces - 1 {
            self.last_piece_len
        } else {
            self.piece_len
        }
    }

    pub fn piece_offset(&self, idx: usize) -> u64 {
        idx as u64 * self.piece_len as u64
    }
}
