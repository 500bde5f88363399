use std::{net::SocketAddr, time::Duration};
use futures::future::BoxFuture;
use crate::PeerId;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {

    #[error("peer source unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

}

// What the engine reports about itself on every poll.
#[derive(Debug, Clone)]
pub struct AnnounceParams {

    pub info_hash: [u8; 20],

    pub peer_id: PeerId,

    pub port: u16,

    pub uploaded: u64,

    pub downloaded: u64,

    // Zero once seeding (and before the metadata is known).
    pub left: u64,

}

// One round of candidates from a source.
#[derive(Debug, Default)]
pub struct Announce {

    // When the source wants to be asked again; the engine falls back to the
    // source's own poll interval otherwise.
    pub interval: Option<Duration>,

    pub peers: Vec<SocketAddr>,

}

// Contract with the external collaborators that find peers: trackers (HTTP
// or UDP), the DHT, anything else that can turn announce state into
// addresses. Implementations live outside this crate; the engine only drains
// candidates into its queue.
pub trait PeerSource: Send + Sync {

    // For logs.
    fn name(&self) -> &str;

    // Poll cadence when the source does not dictate one. Trackers usually
    // override via Announce::interval; DHT-style sources are polled briskly.
    fn poll_interval(&self) -> Duration;

    fn fetch(&self, params: AnnounceParams) -> BoxFuture<'_, Result<Announce, SourceError>>;

}
