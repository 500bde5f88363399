use std::{num::NonZeroUsize, sync::Arc};
use tokio::{sync::{mpsc, oneshot}, task};
use crate::{
    block::{BlockData, BlockInfo},
    p2p::{PeerCommand, PeerTx},
    torrent::{TorrentCommand, TorrentTx},
};
use super::FileMapper;

pub type DiskTx = mpsc::UnboundedSender<CommandToDisk>;
type DiskRx = mpsc::UnboundedReceiver<CommandToDisk>;

pub enum CommandToDisk {

    // Verified piece to persist. Accepted once it reaches the write cache.
    WritePiece {
        offset: u64,
        data: Vec<u8>,
    },

    // Read a block out of a verified piece and hand it to the session that
    // is serving the upload.
    ReadBlock {
        block: BlockInfo,
        piece_offset: u64,
        piece_len: usize,
        tx: PeerTx,
    },

    // Flush, close the files and acknowledge.
    Shutdown(oneshot::Sender<()>),

}

// The single disk worker. One blocking thread drains the channel in
// submission order, which keeps flushes and reads sequenced.
struct Disk {
    mapper: FileMapper,
    // Whole verified pieces kept around for serving further blocks of the
    // same piece without another disk pass.
    read_cache: lru::LruCache<usize, Arc<Vec<u8>>>,
    disk_rx: DiskRx,
    torrent_tx: TorrentTx,
}

pub fn spawn(
    mapper: FileMapper,
    read_cache_pieces: usize,
    torrent_tx: TorrentTx,
) -> (task::JoinHandle<()>, DiskTx) {
    let (disk_tx, disk_rx) = mpsc::unbounded_channel();
    let cache_size = NonZeroUsize::new(read_cache_pieces.max(1)).expect("non-zero");
    let mut disk = Disk {
        mapper,
        read_cache: lru::LruCache::new(cache_size),
        disk_rx,
        torrent_tx,
    };
    let handle = task::spawn_blocking(move || disk.run());
    (handle, disk_tx)
}

impl Disk {

    fn run(&mut self) {
        tracing::debug!("disk worker running");
        while let Some(cmd) = self.disk_rx.blocking_recv() {
            match cmd {

                CommandToDisk::WritePiece { offset, data } => {
                    if let Err(e) = self.mapper.write(offset, data) {
                        tracing::error!("disk write failed: {}", e);
                        self.torrent_tx.send(TorrentCommand::DiskError(e)).ok();
                    }
                },

                CommandToDisk::ReadBlock { block, piece_offset, piece_len, tx } => {
                    self.read_block(block, piece_offset, piece_len, tx);
                },

                CommandToDisk::Shutdown(ack) => {
                    tracing::debug!("disk worker shutting down");
                    if let Err(e) = self.mapper.close() {
                        tracing::error!("disk close failed: {}", e);
                        self.torrent_tx.send(TorrentCommand::DiskError(e)).ok();
                    }
                    ack.send(()).ok();
                    break;
                },
            }
        }
    }

    fn read_block(&mut self, block: BlockInfo, piece_offset: u64, piece_len: usize, tx: PeerTx) {

        let piece = if let Some(piece) = self.read_cache.get(&block.piece_idx) {
            Arc::clone(piece)
        } else {
            match self.mapper.read(piece_offset, piece_len) {
                Ok(data) => {
                    let data = Arc::new(data);
                    self.read_cache.put(block.piece_idx, Arc::clone(&data));
                    data
                },
                Err(e) => {
                    tracing::warn!("block read failed: {}", e);
                    return;
                },
            }
        };

        if block.offset + block.len > piece.len() {
            tracing::warn!("block read out of piece bounds: {:?}", block);
            return;
        }

        let data = piece[block.offset..block.offset + block.len].to_vec();
        tx.send(PeerCommand::BlockRead(BlockData {
            piece_idx: block.piece_idx,
            offset: block.offset,
            data,
        }))
        .ok();
    }
}
