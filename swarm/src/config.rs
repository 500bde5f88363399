use std::{path::PathBuf, time::Duration};
use rand::Rng;
use crate::PeerId;

// Every tunable the engine consults. Defaults follow the original
// tit-for-tat parameters where one exists.
#[derive(Debug, Clone)]
pub struct Config {

    // Directory the torrent writes into; also holds the resume file.
    pub output_dir: PathBuf,

    // Port advertised to peer sources.
    pub port: u16,

    // Size of the peer worker pool.
    pub workers: usize,

    // Upper bound on half-open sockets across all workers.
    pub dial_limit: usize,

    // Capacity of the peer candidate queue.
    pub peer_queue_capacity: usize,

    pub dial_timeout: Duration,

    pub handshake_timeout: Duration,

    // A session is dropped if no frame arrives within this window.
    pub inactivity_timeout: Duration,

    // Pending block requests older than this are handed out again.
    pub request_timeout: Duration,

    // Outstanding requests kept in flight per session.
    pub request_pipeline: usize,

    // Endgame starts when fewer than max(endgame_min_pieces,
    // num_pieces * endgame_percent / 100) pieces are unverified.
    pub endgame_min_pieces: usize,
    pub endgame_percent: usize,

    pub choke_interval: Duration,

    // Regular unchoke slots.
    pub upload_slots: usize,

    // The optimistic slot rotates every this many choke ticks.
    pub optimistic_rotation: u32,

    // A peer that has sent no data for this long is snubbed.
    pub snub_threshold: Duration,

    pub pex_interval: Duration,

    // Peers sent per PEX message at most.
    pub pex_batch: usize,

    // Buffered writes are flushed to disk past this many bytes.
    pub write_cache_limit: usize,

    // Verified pieces kept in memory for serving uploads.
    pub read_cache_pieces: usize,

}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("downloads"),
            port: 6881,
            workers: 50,
            dial_limit: 10,
            peer_queue_capacity: 512,
            dial_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            inactivity_timeout: Duration::from_secs(120),
            request_timeout: Duration::from_secs(5),
            request_pipeline: 4,
            endgame_min_pieces: 5,
            endgame_percent: 1,
            choke_interval: Duration::from_secs(10),
            upload_slots: 4,
            optimistic_rotation: 3,
            snub_threshold: Duration::from_secs(60),
            pex_interval: Duration::from_secs(60),
            pex_batch: 50,
            write_cache_limit: 64 * 1024 * 1024,
            read_cache_pieces: 64,
        }
    }
}

// Client identifier: ASCII prefix followed by twelve random digits.
pub fn generate_peer_id() -> PeerId {
    let mut id = *b"-PC0001-000000000000";
    let mut rng = rand::thread_rng();
    for byte in id[8..].iter_mut() {
        *byte = b'0' + rng.gen_range(0..10u8);
    }
    id
}
