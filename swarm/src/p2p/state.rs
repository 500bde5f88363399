use std::{
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    sync::Mutex,
    time::{Duration, Instant},
};

// Where a session is in its lifecycle; only used for logging and sanity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Handshaking,
    // Exchanging bitfields and extension handshakes.
    Introducing,
    Connected,
    Disconnected,
}

// Counters shared between a session and the choke controller. The session
// writes; the controller reads at tick time and is authoritative only for
// `am_choking` (which it flips by sending the session a command).
#[derive(Debug)]
pub struct SessionStats {

    // Whether we are answering the peer's requests.
    pub am_choking: AtomicBool,

    // Whether we want the peer's pieces.
    pub am_interested: AtomicBool,

    // Whether the peer is answering our requests.
    pub peer_choking: AtomicBool,

    // Whether the peer wants our pieces.
    pub peer_interested: AtomicBool,

    // Bytes moved since the last choke tick.
    pub download_window: AtomicU64,
    pub upload_window: AtomicU64,

    // Bytes per second over the previous tick.
    pub download_rate: AtomicU64,
    pub upload_rate: AtomicU64,

    // Set at tick time when the peer has been silent too long.
    pub snubbed: AtomicBool,

    last_data_received: Mutex<Instant>,

}

impl Default for SessionStats {
    fn default() -> Self {
        Self {
            am_choking: AtomicBool::new(true),
            am_interested: AtomicBool::new(false),
            peer_choking: AtomicBool::new(true),
            peer_interested: AtomicBool::new(false),
            download_window: AtomicU64::new(0),
            upload_window: AtomicU64::new(0),
            download_rate: AtomicU64::new(0),
            upload_rate: AtomicU64::new(0),
            snubbed: AtomicBool::new(false),
            last_data_received: Mutex::new(Instant::now()),
        }
    }
}

impl SessionStats {

    pub fn record_download(&self, bytes: u64) {
        self.download_window.fetch_add(bytes, Ordering::Relaxed);
        *self.last_data_received.lock().expect("stats poisoned") = Instant::now();
    }

    pub fn record_upload(&self, bytes: u64) {
        self.upload_window.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn last_data_received(&self) -> Instant {
        *self.last_data_received.lock().expect("stats poisoned")
    }

    #[cfg(test)]
    pub fn set_last_data_received(&self, at: Instant) {
        *self.last_data_received.lock().expect("stats poisoned") = at;
    }

    // Folds the windows into rates and refreshes the snub flag. Called by
    // the choke controller once per tick.
    pub fn tick(&self, interval: Duration, snub_threshold: Duration) {
        let secs = interval.as_secs().max(1);
        let down = self.download_window.swap(0, Ordering::Relaxed);
        let up = self.upload_window.swap(0, Ordering::Relaxed);
        self.download_rate.store(down / secs, Ordering::Relaxed);
        self.upload_rate.store(up / secs, Ordering::Relaxed);

        let silent = self.last_data_received().elapsed() > snub_threshold;
        self.snubbed.store(silent, Ordering::Relaxed);
    }
}
