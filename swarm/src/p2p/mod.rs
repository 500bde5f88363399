use tokio::sync::mpsc;
use crate::block::BlockData;

pub mod extension;
mod handshake;
mod message;
mod session;
mod state;

pub use session::{PeerSession, SessionMode};
pub use state::SessionStats;

type Result<T> = std::result::Result<T, PeerError>;
pub type PeerRx = mpsc::UnboundedReceiver<PeerCommand>;
pub type PeerTx = mpsc::UnboundedSender<PeerCommand>;

#[derive(thiserror::Error, Debug)]
pub enum PeerError {

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake provided incorrect protocol")]
    IncorrectProtocol,

    #[error("handshake provided incorrect info-hash")]
    IncorrectInfoHash,

    #[error("no handshake received")]
    NoHandshake,

    #[error("invalid message ID: {0}")]
    InvalidMessageId(u8),

    #[error("frame of {0} bytes exceeds maximum")]
    FrameTooLarge(usize),

    #[error("invalid message payload")]
    InvalidMessage,

    #[error("bencode error: {0}")]
    Bencode(#[from] bencode::Error),

    #[error("connection timeout")]
    Timeout,
}

// Commands delivered to a running session from the rest of the engine.
pub enum PeerCommand {

    // A piece was verified; advertise it or cancel requests for it.
    PieceWritten(usize),

    // Block read from disk, ready to go out on the wire.
    BlockRead(BlockData),

    // Choke controller decisions.
    Choke,
    Unchoke,

    Shutdown,

}
