use std::{
    collections::HashSet,
    net::SocketAddr,
    sync::{atomic::Ordering, Arc},
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use tokio::{net::TcpStream, sync::mpsc, time};
use tokio_util::codec::{Framed, FramedParts};
use crate::{
    block::{BlockData, BlockInfo},
    manager::{BlockReceipt, Manager},
    torrent::{TorrentCommand, TorrentContext},
    Bitfield,
};
use super::{
    extension::{self, ExtensionHandshake},
    handshake::{Handshake, HandshakeCodec, PROTOCOL},
    message::{Message, MessageCodec},
    state::{ConnState, SessionStats},
    PeerCommand, PeerError, PeerRx, PeerTx, Result,
};

type MessageSink = SplitSink<Framed<TcpStream, MessageCodec>, Message>;

// Requests larger than 32 KiB are hostile and dropped on the floor.
const MAX_REQUEST_LEN: usize = 0x8000;

// Whether the session feeds the piece store or the metadata fetcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Download,
    Metadata,
}

// Removes the peer from the manager's records on any exit path, including
// cancellation by the worker.
struct PeerRegistration {
    manager: Arc<dyn Manager>,
    peer_id: crate::PeerId,
}

impl Drop for PeerRegistration {
    fn drop(&mut self) {
        self.manager.remove_peer(&self.peer_id);
    }
}

// One peer, dial to death. The session owns its socket and statistics and
// holds non-owning handles to the manager and the peer queue.
pub struct PeerSession {

    // The peer's address.
    address: SocketAddr,

    // Shared swarm state: manager, queue, choker, limits.
    ctx: Arc<TorrentContext>,

    // Commands from the choke controller, the disk worker and the torrent.
    peer_rx: PeerRx,
    peer_tx: PeerTx,

    // Shared with the choke controller.
    stats: Arc<SessionStats>,

    conn_state: ConnState,

    // Valid once the handshake completes.
    remote_id: crate::PeerId,

    // Pieces the peer claims, for deciding between Have and Cancel. The
    // manager keeps the authoritative copy.
    bitfield: Bitfield,

    // Requests we sent that have not been answered.
    requests_out: HashSet<BlockInfo>,

    // Requests the peer sent that the disk has not served yet.
    requests_in: HashSet<BlockInfo>,

    extensions_supported: bool,

    // The remote's extension handshake; outgoing extended messages use its
    // id assignments.
    remote_extensions: ExtensionHandshake,

    // Peers already exchanged over PEX, never to repeat.
    sent_pex: HashSet<SocketAddr>,

}

impl PeerSession {

    pub fn new(address: SocketAddr, ctx: Arc<TorrentContext>) -> Self {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        Self {
            address,
            ctx,
            peer_rx,
            peer_tx,
            stats: Arc::new(SessionStats::default()),
            conn_state: ConnState::Disconnected,
            remote_id: [0; 20],
            bitfield: Bitfield::new(),
            requests_out: HashSet::new(),
            requests_in: HashSet::new(),
            extensions_supported: false,
            remote_extensions: ExtensionHandshake::default(),
            sent_pex: HashSet::new(),
        }
    }

    #[tracing::instrument(name = "peer", skip(self), fields(addr = %self.address))]
    pub async fn run(&mut self) -> Result<()> {

        self.set_state(ConnState::Connecting);
        let stream = {
            // Bounds the number of half-open sockets across the swarm. A
            // closed gate means the torrent is shutting down.
            let permit = match self.ctx.dial_gate.acquire().await {
                Ok(permit) => permit,
                Err(_) => return Ok(()),
            };
            let stream = time::timeout(
                self.ctx.config.dial_timeout,
                TcpStream::connect(self.address),
            )
            .await
            .map_err(|_| PeerError::Timeout)??;
            drop(permit);
            stream
        };
        tracing::trace!("outbound connection successful");

        self.set_state(ConnState::Handshaking);
        let mut socket = Framed::new(stream, HandshakeCodec);
        time::timeout(
            self.ctx.config.handshake_timeout,
            self.exchange_handshake(&mut socket),
        )
        .await
        .map_err(|_| PeerError::Timeout)??;

        // Deregistration on every exit path, including cancellation.
        let _choke_guard = self.ctx.choker.register(&self.stats, self.peer_tx.clone());
        let _peer_guard = PeerRegistration {
            manager: Arc::clone(&self.ctx.manager),
            peer_id: self.remote_id,
        };

        // Switch codecs without losing bytes the peer sent right behind its
        // handshake (bitfields and extension handshakes usually do).
        let old_parts = socket.into_parts();
        let mut parts = FramedParts::new(old_parts.io, MessageCodec);
        parts.read_buf = old_parts.read_buf;
        let socket = Framed::from_parts(parts);

        let result = self.drive(socket).await;
        self.set_state(ConnState::Disconnected);
        result
    }

    async fn exchange_handshake(
        &mut self,
        socket: &mut Framed<TcpStream, HandshakeCodec>,
    ) -> Result<()> {
        tracing::trace!("send handshake");
        socket
            .send(Handshake::new(self.ctx.info_hash, self.ctx.client_id))
            .await?;

        match socket.next().await {
            Some(handshake) => {
                let handshake = handshake?;
                if handshake.protocol != PROTOCOL {
                    return Err(PeerError::IncorrectProtocol);
                }
                if handshake.info_hash != self.ctx.info_hash {
                    return Err(PeerError::IncorrectInfoHash);
                }
                self.extensions_supported = handshake.supports_extensions();
                self.remote_id = handshake.peer_id;
                tracing::debug!("handshake successful, peer connected");
                Ok(())
            },
            None => Err(PeerError::NoHandshake),
        }
    }

    async fn drive(&mut self, socket: Framed<TcpStream, MessageCodec>) -> Result<()> {

        self.set_state(ConnState::Introducing);
        let (mut sink, mut stream) = socket.split();

        if self.extensions_supported {
            self.send_message(&mut sink, Message::Extended {
                ext_id: extension::EXT_HANDSHAKE_ID,
                payload: ExtensionHandshake::ours(),
            })
            .await?;
        }

        // No blocks exist yet in metadata mode, so interest would be a lie.
        if self.ctx.mode == SessionMode::Download {
            self.send_message(&mut sink, Message::Interested).await?;
            self.stats.am_interested.store(true, Ordering::Relaxed);
        }
        self.set_state(ConnState::Connected);

        let mut pex_timer = time::interval_at(
            time::Instant::now() + self.ctx.config.pex_interval,
            self.ctx.config.pex_interval,
        );

        loop { tokio::select! {

            // Frames from the peer, under the inactivity deadline.
            frame = time::timeout(self.ctx.config.inactivity_timeout, stream.next()) => {
                match frame {
                    Err(_) => return Err(PeerError::Timeout),
                    Ok(None) => {
                        tracing::debug!("peer closed the connection");
                        return Ok(());
                    },
                    Ok(Some(msg)) => self.handle_msg(&mut sink, msg?).await?,
                }
            }

            // Commands from elsewhere in the engine.
            Some(cmd) = self.peer_rx.recv() => {
                match cmd {

                    PeerCommand::BlockRead(block) => self.send_block(&mut sink, block).await?,

                    PeerCommand::PieceWritten(idx) => {
                        self.handle_written_piece(&mut sink, idx).await?
                    },

                    PeerCommand::Unchoke => {
                        if self.stats.am_choking.load(Ordering::Relaxed) {
                            self.send_message(&mut sink, Message::Unchoke).await?;
                            self.stats.am_choking.store(false, Ordering::Relaxed);
                        }
                    },

                    PeerCommand::Choke => {
                        if !self.stats.am_choking.load(Ordering::Relaxed) {
                            self.send_message(&mut sink, Message::Choke).await?;
                            self.stats.am_choking.store(true, Ordering::Relaxed);
                        }
                    },

                    PeerCommand::Shutdown => {
                        tracing::debug!("session shutdown");
                        return Ok(());
                    },
                }
            }

            _ = pex_timer.tick() => self.send_pex(&mut sink).await?,

        }}
    }

    #[inline]
    async fn send_message(&mut self, sink: &mut MessageSink, msg: Message) -> Result<()> {
        tracing::trace!("send: {}", msg);
        sink.send(msg).await
    }

    async fn handle_msg(&mut self, sink: &mut MessageSink, msg: Message) -> Result<()> {
        tracing::trace!("read: {}", msg);

        match msg {

            Message::KeepAlive => {},

            Message::Choke => {
                self.stats.peer_choking.store(true, Ordering::Relaxed);
                // In-flight requests are lost; the scheduler's timeout will
                // hand them to somebody else.
                self.requests_out.clear();
            },

            Message::Unchoke => {
                self.stats.peer_choking.store(false, Ordering::Relaxed);
                self.request_blocks(sink).await?;
            },

            Message::Interested => {
                self.stats.peer_interested.store(true, Ordering::Relaxed);
            },

            Message::NotInterested => {
                self.stats.peer_interested.store(false, Ordering::Relaxed);
            },

            Message::Have { idx } => {
                let idx = idx as usize;
                if idx >= self.bitfield.len() {
                    self.bitfield.resize(idx + 1, false);
                }
                self.bitfield.set(idx, true);
                self.ctx.manager.update_peer(&self.remote_id, idx);
            },

            // The protocol wants this first after the handshake, but clients
            // that send it later are everywhere; accept it at any point.
            Message::Bitfield(bitfield) => {
                tracing::debug!("peer claims {} pieces", bitfield.count_ones());
                self.ctx.manager.add_peer(self.remote_id, &bitfield, self.address);
                self.bitfield = bitfield;
                self.request_blocks(sink).await?;
            },

            Message::Request(block) => self.handle_request(block),

            Message::Block(block) => self.handle_block(sink, block).await?,

            Message::Cancel(block) => {
                self.requests_in.remove(&block);
            },

            // DHT port announcements are tolerated, nothing more.
            Message::Port { .. } => {},

            Message::Extended { ext_id, payload } => {
                self.handle_extended(sink, ext_id, payload).await?
            },
        }

        Ok(())
    }

    fn handle_request(&mut self, block: BlockInfo) {
        // Silently dropped while we are choking the peer.
        if self.stats.am_choking.load(Ordering::Relaxed) {
            tracing::debug!("dropping request whilst choking: {:?}", block);
            return;
        }
        if block.len > MAX_REQUEST_LEN {
            tracing::warn!("dropping oversized request: {:?}", block);
            return;
        }
        if !self.requests_in.insert(block) {
            tracing::debug!("duplicate request: {:?}", block);
            return;
        }
        // The disk worker answers on our command channel.
        self.ctx.manager.read_block(block, self.peer_tx.clone());
    }

    async fn handle_block(&mut self, sink: &mut MessageSink, block: BlockData) -> Result<()> {
        self.stats.record_download(block.data.len() as u64);
        self.requests_out.remove(&BlockInfo::from(&block));

        let receipt = self.ctx.manager.block_received(
            &self.remote_id,
            block.piece_idx,
            block.offset,
            block.data,
        );
        if let BlockReceipt::PieceComplete(idx) = receipt {
            self.ctx.torrent_tx.send(TorrentCommand::PieceWritten(idx)).ok();
        }

        self.request_blocks(sink).await
    }

    // Keeps the request pipeline full while the peer lets us.
    async fn request_blocks(&mut self, sink: &mut MessageSink) -> Result<()> {
        if self.ctx.mode != SessionMode::Download
            || self.stats.peer_choking.load(Ordering::Relaxed)
            || !self.stats.am_interested.load(Ordering::Relaxed)
        {
            return Ok(());
        }

        while self.requests_out.len() < self.ctx.config.request_pipeline {
            let block = match self.ctx.manager.next_request(&self.remote_id) {
                Some(block) => block,
                None => break,
            };
            self.requests_out.insert(block);
            self.send_message(sink, Message::Request(block)).await?;
        }
        Ok(())
    }

    async fn send_block(&mut self, sink: &mut MessageSink, block: BlockData) -> Result<()> {
        let info = BlockInfo::from(&block);
        if !self.requests_in.remove(&info) {
            // Cancelled while the disk read was in flight.
            tracing::trace!("block read but no request: {:?}", info);
            return Ok(());
        }
        let len = block.data.len() as u64;
        self.send_message(sink, Message::Block(block)).await?;
        self.stats.record_upload(len);
        self.ctx.uploaded.fetch_add(len, Ordering::Relaxed);
        Ok(())
    }

    // When a piece lands on disk: advertise it to peers that lack it, cancel
    // outstanding duplicates at peers that have it.
    async fn handle_written_piece(&mut self, sink: &mut MessageSink, idx: usize) -> Result<()> {
        if self.ctx.mode != SessionMode::Download {
            return Ok(());
        }

        if !self.peer_has(idx) {
            self.send_message(sink, Message::Have { idx: idx as u32 }).await?;
        } else {
            let stale: Vec<BlockInfo> = self
                .requests_out
                .iter()
                .filter(|block| block.piece_idx == idx)
                .copied()
                .collect();
            for block in stale {
                self.requests_out.remove(&block);
                self.send_message(sink, Message::Cancel(block)).await?;
            }
        }
        Ok(())
    }

    async fn handle_extended(
        &mut self,
        sink: &mut MessageSink,
        ext_id: u8,
        payload: Vec<u8>,
    ) -> Result<()> {

        if ext_id == extension::EXT_HANDSHAKE_ID {
            let handshake = match ExtensionHandshake::parse(&payload) {
                Ok(handshake) => handshake,
                Err(e) => {
                    tracing::warn!("bad extension handshake: {}", e);
                    return Ok(());
                },
            };
            // The manager learns the address even before any bitfield, so
            // PEX can pass this peer along.
            self.ctx.manager.add_peer(self.remote_id, &Bitfield::new(), self.address);
            if let Some(size) = handshake.metadata_size {
                self.ctx.manager.set_metadata_size(size);
            }
            let has_metadata = handshake.id_for(extension::UT_METADATA).is_some();
            self.remote_extensions = handshake;

            if self.ctx.mode == SessionMode::Metadata && has_metadata {
                self.request_metadata(sink).await?;
            }
            return Ok(());
        }

        // Inbound ids are resolved through the remote's name map.
        let name = self.remote_extensions.name_for(ext_id).map(<[u8]>::to_vec);
        match name.as_deref() {
            Some(extension::UT_PEX) => self.handle_pex(&payload),
            Some(extension::UT_METADATA) => self.handle_ut_metadata(sink, &payload).await?,
            _ => tracing::debug!("unknown extended message id {}", ext_id),
        }
        Ok(())
    }

    fn handle_pex(&mut self, payload: &[u8]) {
        match extension::parse_pex_added(payload) {
            Ok(peers) => {
                tracing::debug!("pex delivered {} peers", peers.len());
                for addr in peers {
                    // Best effort; a full queue just drops the candidate.
                    self.ctx.queue_tx.try_send(addr).ok();
                }
            },
            Err(e) => tracing::warn!("bad pex payload: {}", e),
        }
    }

    async fn handle_ut_metadata(&mut self, sink: &mut MessageSink, payload: &[u8]) -> Result<()> {
        let (header, tail) = match extension::parse_metadata_message(payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!("bad ut_metadata payload: {}", e);
                return Ok(());
            },
        };

        match header.msg_type {
            extension::METADATA_MSG_DATA => {
                if self.ctx.mode != SessionMode::Metadata {
                    return Ok(());
                }
                self.ctx.manager.metadata_received(header.piece, tail);
                if self.ctx.manager.complete() {
                    self.ctx.torrent_tx.send(TorrentCommand::MetadataComplete).ok();
                } else {
                    self.request_metadata(sink).await?;
                }
            },
            // We never serve metadata; requests and rejects are ignored.
            _ => {},
        }
        Ok(())
    }

    async fn request_metadata(&mut self, sink: &mut MessageSink) -> Result<()> {
        let ext_id = match self.remote_extensions.id_for(extension::UT_METADATA) {
            Some(id) => id,
            None => return Ok(()),
        };
        if let Some(piece) = self.ctx.manager.next_metadata_request() {
            self.send_message(sink, Message::Extended {
                ext_id,
                payload: extension::metadata_request(piece),
            })
            .await?;
        }
        Ok(())
    }

    // Sixty-second heartbeat: up to a batch of live peers this session has
    // never told the remote about.
    async fn send_pex(&mut self, sink: &mut MessageSink) -> Result<()> {
        let ext_id = match self.remote_extensions.id_for(extension::UT_PEX) {
            Some(id) => id,
            None => return Ok(()),
        };

        let batch: Vec<SocketAddr> = self
            .ctx
            .manager
            .active_peers()
            .into_iter()
            .filter(|addr| *addr != self.address && !self.sent_pex.contains(addr))
            .take(self.ctx.config.pex_batch)
            .collect();
        if batch.is_empty() {
            return Ok(());
        }

        tracing::debug!("pex: sending {} peers", batch.len());
        self.sent_pex.extend(batch.iter().copied());
        self.send_message(sink, Message::Extended {
            ext_id,
            payload: extension::pex_message(&batch),
        })
        .await
    }

    fn peer_has(&self, idx: usize) -> bool {
        idx < self.bitfield.len() && self.bitfield[idx]
    }

    fn set_state(&mut self, state: ConnState) {
        tracing::trace!("connection state: {:?} -> {:?}", self.conn_state, state);
        self.conn_state = state;
    }
}
