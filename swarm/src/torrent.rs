use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::{
    sync::{mpsc, watch, Mutex, Semaphore},
    task::JoinHandle,
    time,
};
use crate::{
    choker::{ChokeRegistry, Choker},
    config::{generate_peer_id, Config},
    fs::DiskError,
    manager::Manager,
    metadata::MetadataFetcher,
    metainfo::{MetaInfo, MetaInfoError},
    p2p::{PeerSession, SessionMode},
    pieces::PieceStore,
    sources::{AnnounceParams, PeerSource},
    PeerId,
};

#[derive(Debug, thiserror::Error)]
pub enum TorrentError {

    #[error("disk failure: {0}")]
    Disk(#[from] DiskError),

    #[error(transparent)]
    MetaInfo(#[from] MetaInfoError),

    #[error("internal error: {0}")]
    Internal(String),

}

pub type Result<T> = std::result::Result<T, TorrentError>;
pub type TorrentTx = mpsc::UnboundedSender<TorrentCommand>;
pub type TorrentRx = mpsc::UnboundedReceiver<TorrentCommand>;

// Commands that reach the orchestrator from sessions, the disk worker and
// the outside world.
pub enum TorrentCommand {

    // A piece verified and went to the disk worker; fan Have/Cancel out to
    // the sessions.
    PieceWritten(usize),

    // The metadata fetcher assembled and verified the info dictionary.
    MetadataComplete,

    // Disk writes are fatal when they fail.
    DiskError(DiskError),

    Shutdown,

}

// Read-only state a session needs, shared across the worker pool.
pub struct TorrentContext {

    pub info_hash: [u8; 20],

    pub client_id: PeerId,

    pub mode: SessionMode,

    // The piece store, or the metadata fetcher during magnet startup.
    pub manager: Arc<dyn Manager>,

    // Producer side of the peer candidate queue (PEX feeds it too).
    pub queue_tx: mpsc::Sender<SocketAddr>,

    pub choker: Arc<ChokeRegistry>,

    // Bounds half-open sockets across the swarm.
    pub dial_gate: Arc<Semaphore>,

    pub torrent_tx: TorrentTx,

    // Bytes served to peers, for announce parameters.
    pub uploaded: Arc<AtomicU64>,

    // Zero until the metadata is known.
    pub total_len: u64,

    pub config: Config,

}

// The swarm orchestrator. Owns the peer queue, the worker pool, the dial
// semaphore and the phase machine: magnet torrents fetch their metadata
// first, then the piece store takes over until the download completes and
// seeding carries on.
pub struct Torrent {
    meta: MetaInfo,
    config: Config,
    client_id: PeerId,
    sources: Vec<Arc<dyn PeerSource>>,
    uploaded: Arc<AtomicU64>,
    torrent_tx: TorrentTx,
    torrent_rx: TorrentRx,
}

// One phase's moving parts: its queue, its workers, its source pollers.
struct Phase {
    ctx: Arc<TorrentContext>,
    abort_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    source_tasks: Vec<JoinHandle<()>>,
}

impl Phase {
    // Cooperative teardown: flag the abort, then wait everything out.
    async fn shutdown(self) {
        self.abort_tx.send(true).ok();
        self.ctx.choker.shutdown_sessions();
        for task in self.source_tasks {
            task.await.ok();
        }
        for worker in self.workers {
            worker.await.ok();
        }
    }
}

impl Torrent {

    pub fn new(meta: MetaInfo, sources: Vec<Arc<dyn PeerSource>>, config: Config) -> Self {
        let (torrent_tx, torrent_rx) = mpsc::unbounded_channel();
        Self {
            meta,
            config,
            client_id: generate_peer_id(),
            sources,
            uploaded: Arc::new(AtomicU64::new(0)),
            torrent_tx,
            torrent_rx,
        }
    }

    // Handle for sending commands (Shutdown in particular) from outside.
    pub fn command_tx(&self) -> TorrentTx {
        self.torrent_tx.clone()
    }

    #[tracing::instrument(name = "torrent", skip(self), fields(info_hash = %self.meta.info_hash_hex()))]
    pub async fn run(&mut self) -> Result<()> {
        tracing::info!("starting torrent");

        if !self.meta.loaded {
            if !self.fetch_metadata().await? {
                tracing::info!("shut down during metadata fetch");
                return Ok(());
            }
        }

        let store = Arc::new(PieceStore::new(&self.meta, &self.config, self.torrent_tx.clone())?);
        let result = self.download(Arc::clone(&store)).await;

        // Flushes the write cache and saves the resume bitfield.
        store.close().await;
        result
    }

    // Magnet startup: sessions run against the metadata fetcher until the
    // info dictionary verifies. Returns false on shutdown.
    async fn fetch_metadata(&mut self) -> Result<bool> {
        tracing::info!("metadata phase: fetching info dictionary from the swarm");
        let fetcher = Arc::new(MetadataFetcher::new(self.meta.info_hash));
        let phase = self.start_phase(SessionMode::Metadata, Arc::clone(&fetcher) as Arc<dyn Manager>);

        let keep_going = loop {
            match self.torrent_rx.recv().await {
                Some(TorrentCommand::MetadataComplete) => break true,
                Some(TorrentCommand::Shutdown) | None => break false,
                Some(TorrentCommand::DiskError(e)) => {
                    phase.shutdown().await;
                    return Err(TorrentError::Disk(e));
                },
                Some(TorrentCommand::PieceWritten(_)) => {},
            }
        };

        // Transition: stop the workers and drop this phase's queue before
        // the piece store takes over.
        phase.shutdown().await;
        if !keep_going {
            return Ok(false);
        }

        let raw = fetcher
            .take_raw()
            .ok_or_else(|| TorrentError::Internal("metadata complete but empty".into()))?;
        self.meta.load_metadata(&raw)?;
        tracing::info!("metadata acquired: {} pieces", self.meta.num_pieces());
        Ok(true)
    }

    // Download and seed phases; one loop, the announce parameters make the
    // difference.
    async fn download(&mut self, store: Arc<PieceStore>) -> Result<()> {
        let phase = self.start_phase(SessionMode::Download, Arc::clone(&store) as Arc<dyn Manager>);
        let choker = Choker::new(
            Arc::clone(&phase.ctx.choker),
            Arc::clone(&store) as Arc<dyn Manager>,
            &self.config,
        )
        .spawn(phase.abort_tx.subscribe());

        tracing::info!(
            "download phase: {} pieces, {} bytes",
            store.num_pieces(),
            store.total_len(),
        );
        if store.complete() {
            tracing::info!("all pieces already verified, seeding");
        }

        let result = loop {
            match self.torrent_rx.recv().await {
                Some(TorrentCommand::PieceWritten(idx)) => {
                    phase.ctx.choker.broadcast_piece(idx);
                    if store.complete() {
                        tracing::info!("download complete, seeding");
                    }
                },
                Some(TorrentCommand::DiskError(e)) => break Err(TorrentError::Disk(e)),
                Some(TorrentCommand::Shutdown) | None => break Ok(()),
                Some(TorrentCommand::MetadataComplete) => {},
            }
        };

        phase.shutdown().await;
        choker.await.ok();
        result
    }

    fn start_phase(&self, mode: SessionMode, manager: Arc<dyn Manager>) -> Phase {
        let (queue_tx, queue_rx) = mpsc::channel(self.config.peer_queue_capacity);
        let queue_rx = Arc::new(Mutex::new(queue_rx));
        let (abort_tx, abort_rx) = watch::channel(false);

        let ctx = Arc::new(TorrentContext {
            info_hash: self.meta.info_hash,
            client_id: self.client_id,
            mode,
            manager,
            queue_tx,
            choker: Arc::new(ChokeRegistry::new()),
            dial_gate: Arc::new(Semaphore::new(self.config.dial_limit)),
            torrent_tx: self.torrent_tx.clone(),
            uploaded: Arc::clone(&self.uploaded),
            total_len: if self.meta.loaded { self.meta.total_len } else { 0 },
            config: self.config.clone(),
        });

        let workers = (0..self.config.workers)
            .map(|_| {
                tokio::spawn(worker(
                    Arc::clone(&ctx),
                    Arc::clone(&queue_rx),
                    abort_rx.clone(),
                ))
            })
            .collect();

        let source_tasks = self
            .sources
            .iter()
            .map(|source| {
                tokio::spawn(poll_source(
                    Arc::clone(source),
                    Arc::clone(&ctx),
                    abort_rx.clone(),
                ))
            })
            .collect();

        Phase { ctx, abort_tx, workers, source_tasks }
    }
}

// One worker: pop a candidate, run a session to completion, loop. Workers
// only ever terminate on global cancellation.
async fn worker(
    ctx: Arc<TorrentContext>,
    queue: Arc<Mutex<mpsc::Receiver<SocketAddr>>>,
    mut abort: watch::Receiver<bool>,
) {
    loop {
        let address = tokio::select! {
            _ = abort.changed() => return,
            candidate = async { queue.lock().await.recv().await } => match candidate {
                Some(address) => address,
                None => return,
            },
        };

        let mut session = PeerSession::new(address, Arc::clone(&ctx));
        tokio::select! {
            _ = abort.changed() => return,
            result = session.run() => {
                if let Err(e) = result {
                    tracing::debug!("peer session {} ended: {}", address, e);
                }
            },
        }
    }
}

// Polls one peer source on its own cadence; the first announce goes out
// immediately, candidates drain into the queue best-effort.
async fn poll_source(
    source: Arc<dyn PeerSource>,
    ctx: Arc<TorrentContext>,
    mut abort: watch::Receiver<bool>,
) {
    loop {
        let downloaded = ctx.manager.downloaded_bytes();
        let params = AnnounceParams {
            info_hash: ctx.info_hash,
            peer_id: ctx.client_id,
            port: ctx.config.port,
            uploaded: ctx.uploaded.load(Ordering::Relaxed),
            downloaded,
            left: ctx.total_len.saturating_sub(downloaded),
        };

        let wait = tokio::select! {
            _ = abort.changed() => return,
            outcome = source.fetch(params) => match outcome {
                Ok(announce) => {
                    tracing::debug!(
                        "{} returned {} peers",
                        source.name(),
                        announce.peers.len(),
                    );
                    for peer in announce.peers {
                        ctx.queue_tx.try_send(peer).ok();
                    }
                    announce.interval.unwrap_or_else(|| source.poll_interval())
                },
                Err(e) => {
                    tracing::warn!("{} announce failed: {}", source.name(), e);
                    source.poll_interval()
                },
            },
        };

        tokio::select! {
            _ = abort.changed() => return,
            _ = time::sleep(wait) => {},
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use futures::future::BoxFuture;
    use bencode::{Dict, Value};
    use crate::sources::{Announce, SourceError};

    fn single_file_meta(name: &str, piece_len: i64, data_len: i64) -> MetaInfo {
        let mut info = Dict::new();
        info.insert("length", data_len);
        info.insert("name", name);
        info.insert("piece length", piece_len);
        let num_pieces = (data_len + piece_len - 1) / piece_len;
        info.insert("pieces", vec![0u8; num_pieces as usize * 20]);
        let mut root = Dict::new();
        root.insert("info", info);
        MetaInfo::from_bytes(&bencode::encode(&Value::from(root))).unwrap()
    }

    struct StaticSource;

    impl PeerSource for StaticSource {
        fn name(&self) -> &str {
            "static"
        }
        fn poll_interval(&self) -> Duration {
            Duration::from_secs(3600)
        }
        fn fetch(&self, params: AnnounceParams) -> BoxFuture<'_, std::result::Result<Announce, SourceError>> {
            Box::pin(async move {
                assert_eq!(&params.peer_id[..8], b"-PC0001-");
                Ok(Announce { interval: None, peers: vec!["127.0.0.1:1".parse().unwrap()] })
            })
        }
    }

    // The orchestrator spins up a phase and tears it down cleanly on
    // Shutdown, leaving a resume file behind.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_and_shutdown() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let meta = single_file_meta("t.bin", 16_384, 20_000);
        let hash_hex = meta.info_hash_hex();
        let config = Config {
            output_dir: dir.path().to_path_buf(),
            workers: 2,
            ..Config::default()
        };

        let sources: Vec<Arc<dyn PeerSource>> = vec![Arc::new(StaticSource)];
        let mut torrent = Torrent::new(meta, sources, config);
        let tx = torrent.command_tx();
        tx.send(TorrentCommand::Shutdown).ok();
        torrent.run().await?;

        let resume = dir.path().join(format!("{}.resume", hash_hex));
        assert!(resume.exists());
        Ok(())
    }
}
