mod block;
mod choker;
mod config;
mod fs;
mod manager;
mod metadata;
mod metainfo;
mod p2p;
mod pieces;
mod sources;
mod store;
mod torrent;

// Peer-protocol requests move data in 16 KiB blocks.
const BLOCK_SIZE: usize = 0x4000;

type Bitfield = bitvec::vec::BitVec<u8, bitvec::order::Msb0>;

// 20-byte identifier, ours and the remote's.
pub type PeerId = [u8; 20];

pub use config::{generate_peer_id, Config};
pub use fs::DiskError;
pub use metainfo::{MetaInfo, MetaInfoError};
pub use sources::{Announce, AnnounceParams, PeerSource, SourceError};
pub use torrent::{Torrent, TorrentCommand, TorrentError, TorrentTx};
