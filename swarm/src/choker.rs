use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};
use rand::seq::SliceRandom;
use tokio::sync::watch;
use crate::{
    config::Config,
    manager::Manager,
    p2p::{PeerCommand, PeerTx, SessionStats},
};

// Live sessions as the choke controller sees them. Sessions register after
// their handshake and the guard deregisters them on any exit path; the weak
// reference catches anything that slips through.
pub struct ChokeRegistry {
    entries: Mutex<HashMap<u64, RegistryEntry>>,
    next_id: AtomicU64,
}

struct RegistryEntry {
    stats: Weak<SessionStats>,
    tx: PeerTx,
}

// Removes its session from the registry when dropped.
pub struct ChokeGuard {
    registry: Arc<ChokeRegistry>,
    id: u64,
}

impl Drop for ChokeGuard {
    fn drop(&mut self) {
        self.registry.entries.lock().expect("registry poisoned").remove(&self.id);
    }
}

impl ChokeRegistry {

    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn register(self: &Arc<Self>, stats: &Arc<SessionStats>, tx: PeerTx) -> ChokeGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().expect("registry poisoned").insert(
            id,
            RegistryEntry { stats: Arc::downgrade(stats), tx },
        );
        ChokeGuard { registry: Arc::clone(self), id }
    }

    // Tells every live session that a piece landed on disk.
    pub fn broadcast_piece(&self, piece_idx: usize) {
        for entry in self.entries.lock().expect("registry poisoned").values() {
            entry.tx.send(PeerCommand::PieceWritten(piece_idx)).ok();
        }
    }

    pub fn shutdown_sessions(&self) {
        for entry in self.entries.lock().expect("registry poisoned").values() {
            entry.tx.send(PeerCommand::Shutdown).ok();
        }
    }

    // Upgraded live entries; dead weak refs are dropped on the way.
    fn live(&self) -> Vec<(u64, Arc<SessionStats>, PeerTx)> {
        let mut entries = self.entries.lock().expect("registry poisoned");
        entries.retain(|_, entry| entry.stats.strong_count() > 0);
        entries
            .iter()
            .filter_map(|(id, entry)| {
                entry.stats.upgrade().map(|stats| (*id, stats, entry.tx.clone()))
            })
            .collect()
    }
}

// Tit-for-tat upload slot allocation. Every 10 seconds the controller ranks
// interested peers by observed rate and unchokes the top four, plus one
// optimistic pick rotated every third tick so new peers get a chance to
// prove themselves.
pub struct Choker {

    registry: Arc<ChokeRegistry>,

    manager: Arc<dyn Manager>,

    interval: Duration,

    upload_slots: usize,

    optimistic_rotation: u32,

    snub_threshold: Duration,

    round: u32,

    // Registry id of the current optimistic unchoke.
    optimistic: Option<u64>,

}

impl Choker {

    pub fn new(registry: Arc<ChokeRegistry>, manager: Arc<dyn Manager>, config: &Config) -> Self {
        Self {
            registry,
            manager,
            interval: config.choke_interval,
            upload_slots: config.upload_slots,
            optimistic_rotation: config.optimistic_rotation,
            snub_threshold: config.snub_threshold,
            round: 0,
            optimistic: None,
        }
    }

    pub fn spawn(mut self, mut abort: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(
                tokio::time::Instant::now() + self.interval,
                self.interval,
            );
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.tick(),
                    _ = abort.changed() => {
                        tracing::debug!("choke controller stopped");
                        break;
                    },
                }
            }
        })
    }

    pub fn tick(&mut self) {
        self.round += 1;
        let entries = self.registry.live();
        let seeding = self.manager.complete();

        // 1. Fold windows into rates and refresh snub flags.
        for (_, stats, _) in entries.iter() {
            stats.tick(self.interval, self.snub_threshold);
        }

        // 2. Candidates want our data; snubbed peers are out unless seeding.
        let mut candidates: Vec<&(u64, Arc<SessionStats>, PeerTx)> = entries
            .iter()
            .filter(|(_, stats, _)| {
                stats.peer_interested.load(Ordering::Relaxed)
                    && (seeding || !stats.snubbed.load(Ordering::Relaxed))
            })
            .collect();

        // 3. Reciprocity when leeching, throughput when seeding.
        candidates.sort_by_key(|(_, stats, _)| {
            let rate = if seeding {
                stats.upload_rate.load(Ordering::Relaxed)
            } else {
                stats.download_rate.load(Ordering::Relaxed)
            };
            std::cmp::Reverse(rate)
        });

        let top: Vec<u64> = candidates
            .iter()
            .take(self.upload_slots)
            .map(|(id, _, _)| *id)
            .collect();

        // 4. Rotate the optimistic slot every third tick; otherwise keep it
        // while the peer stays connected and interested.
        if self.round % self.optimistic_rotation == 0 {
            let outside_top: Vec<u64> = candidates
                .iter()
                .map(|(id, _, _)| *id)
                .filter(|id| !top.contains(id))
                .collect();
            self.optimistic = outside_top.choose(&mut rand::thread_rng()).copied();
            if let Some(id) = self.optimistic {
                tracing::debug!("optimistic unchoke rotated to session {}", id);
            }
        } else if let Some(id) = self.optimistic {
            let keep = entries.iter().any(|(entry_id, stats, _)| {
                *entry_id == id && stats.peer_interested.load(Ordering::Relaxed)
            });
            if !keep {
                self.optimistic = None;
            }
        }

        // 5. Apply the decisions; sessions that are already in the right
        // state ignore the command.
        for (id, stats, tx) in entries.iter() {
            let allowed = top.contains(id) || self.optimistic == Some(*id);
            let choking = stats.am_choking.load(Ordering::Relaxed);
            if allowed && choking {
                tx.send(PeerCommand::Unchoke).ok();
            } else if !allowed && !choking {
                tx.send(PeerCommand::Choke).ok();
            }
        }
    }
}
