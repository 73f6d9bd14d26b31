//! A peer session: one task per remote peer, driving the handshake, the
//! message exchange and this peer's share of the download and upload.
//!
//! The session owns the socket and its codecs; everything the torrent's
//! scheduler tick needs to know about the peer (timestamps, rates, status
//! flags, the remote bitfield) lives in the shared [`PeerState`]. The tick
//! talks back through the session's command channel.

mod codec;

use {
    futures::{
        select,
        stream::{Fuse, SplitSink},
        SinkExt, StreamExt,
    },
    std::{
        collections::VecDeque,
        net::SocketAddr,
        sync::{
            atomic::{AtomicBool, AtomicU64, Ordering},
            Arc, Mutex,
        },
        time::Duration,
    },
    tokio::{
        net::TcpStream,
        sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
        time,
    },
    tokio_util::codec::{Framed, FramedParts},
};

use {
    crate::{
        error::*, scheduler::BlockReceipt, torrent::TorrentContext, Bitfield,
        BlockInfo, PieceIndex, BLOCK_LEN,
    },
    codec::*,
};

/// The longest a request message may ask for. Larger requests are a protocol
/// violation.
const MAX_REQUEST_LEN: u32 = 8 * BLOCK_LEN;

/// The most requests we keep outstanding towards a single peer.
const MAX_REQUEST_QUEUE_LEN: usize = 100;

/// Each 10 KiB/s of measured download speed adds one outstanding request to
/// the pipeline.
const REQUEST_QUEUE_RATE_DIVISOR: u64 = 10240;

/// How long we wait for the remote handshake before giving up on the peer.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// The channel on which the torrent sends commands to a peer session.
pub(crate) type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

/// The commands a peer session can receive from its torrent.
#[derive(Debug)]
pub(crate) enum Command {
    /// The once-a-second scheduler tick: serve at most one queued upload and
    /// refill the request pipeline.
    Tick,
    /// Stop letting this peer download from us.
    Choke,
    /// Start serving this peer's requests.
    Unchoke,
    /// Announce a freshly verified piece to this peer.
    Have { piece_index: PieceIndex },
    /// Send a request the torrent queued on this session (endgame
    /// duplicates).
    Request(BlockInfo),
    /// Eventually shut down the peer session.
    Shutdown,
}

/// Whether we or the remote initiated the connection. The state machines are
/// identical; the only asymmetry is who sends the handshake first.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Direction {
    Outbound,
    Inbound,
}

/// At any given time, a connection with a peer is in one of the below
/// states.
#[derive(Clone, Copy, Debug, PartialEq)]
enum State {
    /// The peer connection has not yet been connected.
    Disconnected,
    /// The state during which the TCP connection is established.
    Connecting,
    /// The state after establishing the TCP connection and exchanging the
    /// initial BitTorrent handshake.
    Handshaking,
    /// The handshakes are exchanged; the peer may send a bitfield as its
    /// first message. The state is left when the bitfield, or the first
    /// piece announcement, arrives.
    AvailabilityExchange,
    /// The normal state of a peer session, in which any message apart from
    /// the handshake and the bitfield may be exchanged.
    Connected,
}

impl Default for State {
    fn default() -> Self {
        Self::Disconnected
    }
}

/// The session's own status flags. By default both sides of the connection
/// start off as choked and not interested in the other.
#[derive(Clone, Copy, Debug)]
struct Status {
    state: State,
    /// If we're choked, peer doesn't allow us to download pieces from them.
    is_choked: bool,
    /// If we're interested, peer has pieces that we don't have.
    is_interested: bool,
    /// If peer is choked, we don't allow them to download pieces from us.
    is_peer_choked: bool,
    /// If peer is interested in us, they mean to download pieces that we
    /// have.
    is_peer_interested: bool,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            state: State::default(),
            is_choked: true,
            is_interested: false,
            is_peer_choked: true,
            is_peer_interested: false,
        }
    }
}

/// The part of a peer's state that the torrent's scheduler tick reads while
/// the session task is running: liveness timestamps, traffic counters,
/// status flags and the remote bitfield.
///
/// Timestamps are milliseconds since the torrent started, so they fit in
/// atomics.
pub(crate) struct PeerState {
    pub connected_at: AtomicU64,
    pub last_recv: AtomicU64,
    /// The total number of wire bytes received from this peer.
    pub total_rx: AtomicU64,
    /// Set by the session when its connection is gone; the tick reaps the
    /// peer when it sees this.
    pub is_dead: AtomicBool,
    /// Whether the remote declared interest in our pieces.
    pub is_peer_interested: AtomicBool,
    /// Whether the remote is choking us.
    pub is_peer_choking: AtomicBool,
    /// Whether we are choking the remote.
    pub am_choking: AtomicBool,
    /// The pieces the remote has announced, lazily allocated on the first
    /// bitfield or have message.
    pub pieces: Mutex<Option<Bitfield>>,
}

impl PeerState {
    fn new() -> Self {
        Self {
            connected_at: AtomicU64::new(0),
            last_recv: AtomicU64::new(0),
            total_rx: AtomicU64::new(0),
            is_dead: AtomicBool::new(false),
            is_peer_interested: AtomicBool::new(false),
            is_peer_choking: AtomicBool::new(true),
            am_choking: AtomicBool::new(true),
            pieces: Mutex::new(None),
        }
    }

    /// The peer's average download speed in bytes per second. The elapsed
    /// time is clamped to at least a second, as within the first second of
    /// a connection the rate would be undefined.
    pub fn download_rate(&self, now_ms: u64) -> u64 {
        let connected_at = self.connected_at.load(Ordering::Relaxed);
        let secs = (now_ms.saturating_sub(connected_at) / 1000).max(1);
        self.total_rx.load(Ordering::Relaxed) / secs
    }

    /// Milliseconds since the last message arrived from this peer.
    pub fn idle_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_recv.load(Ordering::Relaxed))
    }
}

type Sink = SplitSink<Framed<TcpStream, PeerCodec>, Message>;

pub(crate) struct PeerSession {
    /// Shared information and handles of the torrent.
    torrent: Arc<TorrentContext>,
    /// The port on which the peer session receives commands.
    cmd_port: Fuse<Receiver>,
    /// The remote address of the peer.
    addr: SocketAddr,
    direction: Direction,
    /// State shared with the torrent's tick.
    state: Arc<PeerState>,
    /// Session local status flags.
    status: Status,
    /// Our copy of the remote bitfield (the shared copy in `state` is kept
    /// in sync).
    pieces: Option<Bitfield>,
    /// The number of requests we have sent and not yet seen answered. The
    /// spawned request volleys of the pipeline are bounded by this.
    outgoing_requests: usize,
    /// Block requests the remote made and we haven't served yet. One is
    /// served per tick.
    upload_queue: VecDeque<BlockInfo>,
}

impl PeerSession {
    /// Creates a new session with the peer at the given address, returning
    /// the session, its command channel and the state the torrent tick
    /// observes.
    pub fn new(
        torrent: Arc<TorrentContext>,
        addr: SocketAddr,
        direction: Direction,
    ) -> (Self, Sender, Arc<PeerState>) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let state = Arc::new(PeerState::new());
        (
            Self {
                torrent,
                cmd_port: cmd_port.fuse(),
                addr,
                direction,
                state: Arc::clone(&state),
                status: Status::default(),
                pieces: None,
                outgoing_requests: 0,
                upload_queue: VecDeque::new(),
            },
            cmd_chan,
            state,
        )
    }

    /// Runs the session until the connection is closed, the torrent shuts it
    /// down, or the peer violates the protocol. Whatever the cause, the
    /// shared state is flagged dead on return so the next tick reaps the
    /// peer.
    ///
    /// For inbound peers the already accepted socket is passed in; outbound
    /// sessions connect themselves.
    pub async fn start(&mut self, socket: Option<TcpStream>) -> Result<()> {
        let result = self.run(socket).await;
        if let Err(e) = &result {
            log::info!("Peer {} session ended: {}", self.addr, e);
        }
        self.state.is_dead.store(true, Ordering::Release);
        result
    }

    async fn run(&mut self, socket: Option<TcpStream>) -> Result<()> {
        let now = self.torrent.now_ms();
        self.state.connected_at.store(now, Ordering::Relaxed);
        // the connection itself counts as activity, the inactivity clock
        // starts now
        self.state.last_recv.store(now, Ordering::Relaxed);

        let socket = match socket {
            Some(socket) => socket,
            None => {
                log::info!("Connecting to peer {}", self.addr);
                self.status.state = State::Connecting;
                TcpStream::connect(self.addr).await?
            }
        };
        log::info!("Connected to peer {}", self.addr);

        let mut socket = Framed::new(socket, HandshakeCodec);
        self.status.state = State::Handshaking;

        // the outbound side sends the first handshake; the inbound side
        // replies after seeing the remote one
        if self.direction == Direction::Outbound {
            let handshake = Handshake::new(
                self.torrent.info_hash,
                self.torrent.client_id,
            );
            log::debug!("Sending handshake to peer {}", self.addr);
            socket.send(handshake).await?;
        }

        let peer_handshake =
            match time::timeout(HANDSHAKE_TIMEOUT, socket.next()).await {
                Err(_) | Ok(None) => {
                    return Err(Error::ProtocolViolation(
                        "no handshake received",
                    ));
                }
                Ok(Some(handshake)) => handshake?,
            };
        log::debug!("Peer {} handshake: {:?}", self.addr, peer_handshake);
        // the codec only returns handshakes whose protocol string is valid
        debug_assert_eq!(peer_handshake.prot, PROTOCOL_STRING.as_bytes());

        // verify that the advertised torrent info hash is the same as ours
        if peer_handshake.info_hash != self.torrent.info_hash {
            log::info!("Peer {} handshake invalid info hash", self.addr);
            return Err(Error::InvalidPeerInfoHash);
        }

        if self.direction == Direction::Inbound {
            let handshake = Handshake::new(
                self.torrent.info_hash,
                self.torrent.client_id,
            );
            log::debug!("Sending handshake to peer {}", self.addr);
            socket.send(handshake).await?;
        }

        // now that we have the handshake, we need to switch to the peer
        // message codec and keep the buffers of the original codec, as they
        // may contain bytes of messages the peer sent after its handshake
        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let socket = Framed::from_parts(new_parts);

        self.status.state = State::AvailabilityExchange;
        log::info!("Peer {} session state: {:?}", self.addr, self.status.state);

        self.run_loop(socket).await
    }

    /// The main loop of the session: receiving messages from the peer and
    /// commands from the torrent.
    async fn run_loop(
        &mut self,
        socket: Framed<TcpStream, PeerCodec>,
    ) -> Result<()> {
        let (mut sink, stream) = socket.split();
        let mut stream = stream.fuse();

        // if we have pieces, the peer needs to know about them right after
        // the handshake
        let own_pieces =
            self.torrent.scheduler.read().await.own_pieces().clone();
        if own_pieces.any() {
            log::debug!("Sending bitfield to peer {}", self.addr);
            let mut bitfield = own_pieces;
            // pad out to a byte boundary for the wire
            bitfield.resize((bitfield.len() + 7) / 8 * 8, false);
            sink.send(Message::Bitfield(bitfield)).await?;
        }

        loop {
            select! {
                msg = stream.next() => {
                    let msg = match msg {
                        Some(msg) => msg?,
                        None => {
                            log::info!("Peer {} closed the connection", self.addr);
                            break;
                        }
                    };
                    log::trace!(
                        "Received message {:?} from peer {}",
                        msg.id(),
                        self.addr
                    );
                    let now = self.torrent.now_ms();
                    self.state.last_recv.store(now, Ordering::Relaxed);
                    self.state
                        .total_rx
                        .fetch_add(msg.frame_len(), Ordering::Relaxed);

                    // the bitfield message may only be received right after
                    // the handshake
                    if self.status.state == State::AvailabilityExchange {
                        if let Message::Bitfield(bitfield) = msg {
                            self.handle_bitfield_msg(&mut sink, bitfield)
                                .await?;
                            continue;
                        }
                    }
                    self.handle_msg(msg).await?;
                }
                cmd = self.cmd_port.select_next_some() => {
                    match cmd {
                        Command::Tick => {
                            self.tick(&mut sink).await?;
                        }
                        Command::Choke => {
                            if !self.status.is_peer_choked {
                                log::debug!("Choking peer {}", self.addr);
                                sink.send(Message::Choke).await?;
                                self.status.is_peer_choked = true;
                                self.state
                                    .am_choking
                                    .store(true, Ordering::Relaxed);
                            }
                        }
                        Command::Unchoke => {
                            if self.status.is_peer_choked {
                                log::debug!("Unchoking peer {}", self.addr);
                                sink.send(Message::Unchoke).await?;
                                self.status.is_peer_choked = false;
                                self.state
                                    .am_choking
                                    .store(false, Ordering::Relaxed);
                            }
                        }
                        Command::Have { piece_index } => {
                            sink.send(Message::Have { piece_index }).await?;
                        }
                        Command::Request(block) => {
                            sink.send(Message::Request(block)).await?;
                            self.outgoing_requests += 1;
                        }
                        Command::Shutdown => {
                            log::info!(
                                "Shutting down peer {} session",
                                self.addr
                            );
                            break;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// One scheduler tick's worth of session work: honour one queued upload
    /// and refill the request pipeline.
    async fn tick(&mut self, sink: &mut Sink) -> Result<()> {
        if let Some(block) = self.upload_queue.pop_front() {
            log::debug!("Uploading block {:?} to peer {}", block, self.addr);
            match self
                .torrent
                .disk
                .read_block(self.torrent.id, block)
                .await?
            {
                Ok(data) => {
                    sink.send(Message::Block {
                        piece_index: block.piece_index,
                        offset: block.offset,
                        data,
                    })
                    .await?;
                    self.torrent
                        .scheduler
                        .write()
                        .await
                        .add_uploaded(block.len as u64);
                }
                Err(e) => {
                    // a request for data we don't have is dropped, the
                    // remote can re-request
                    log::warn!(
                        "Can't serve block {:?} to {}: {}",
                        block,
                        self.addr,
                        e
                    );
                }
            }
        }

        self.make_requests(sink).await
    }

    /// Fills the session's download pipeline with the optimal number of
    /// requests: one outstanding request per 10 KiB/s of throughput, no
    /// fewer than two and no more than [`MAX_REQUEST_QUEUE_LEN`].
    async fn make_requests(&mut self, sink: &mut Sink) -> Result<()> {
        if self.status.is_choked {
            return Ok(());
        }
        let pieces = match &self.pieces {
            Some(pieces) => pieces,
            // no bitfield or piece announcement from this peer yet
            None => return Ok(()),
        };

        let rate = self.state.download_rate(self.torrent.now_ms());
        let queue_len = ((rate / REQUEST_QUEUE_RATE_DIVISOR) as usize)
            .max(2)
            .min(MAX_REQUEST_QUEUE_LEN);

        let mut blocks = Vec::new();
        {
            let mut scheduler = self.torrent.scheduler.write().await;
            if scheduler.is_complete() {
                return Ok(());
            }
            while self.outgoing_requests + blocks.len() < queue_len {
                match scheduler.pick_block(
                    self.addr,
                    pieces,
                    std::time::Instant::now(),
                ) {
                    Some(block) => blocks.push(block),
                    // all the work this peer could do is already handed out
                    None => break,
                }
            }
        }

        for block in blocks {
            log::debug!("Requesting block {:?} from {}", block, self.addr);
            sink.send(Message::Request(block)).await?;
            self.outgoing_requests += 1;
        }

        Ok(())
    }

    /// Handles the bitfield message, which is only expected right after the
    /// handshake.
    async fn handle_bitfield_msg(
        &mut self,
        sink: &mut Sink,
        mut bitfield: Bitfield,
    ) -> Result<()> {
        debug_assert_eq!(self.status.state, State::AvailabilityExchange);
        log::debug!("Handling peer {} bitfield message", self.addr);

        // The bitfield over the wire must be exactly as long as the piece
        // count rounded up to a byte boundary; anything else means the peer
        // is talking about a different torrent.
        let piece_count = self.torrent.storage.piece_count;
        let expected_len = (piece_count + 7) / 8 * 8;
        if bitfield.len() != expected_len {
            log::warn!(
                "Peer {} sent a bitfield of {} bits, expected {}",
                self.addr,
                bitfield.len(),
                expected_len
            );
            return Err(Error::ProtocolViolation("bitfield length mismatch"));
        }
        // slice off the padding; its contents are ignored
        bitfield.resize(piece_count, false);

        self.torrent
            .scheduler
            .write()
            .await
            .register_availability(&bitfield);
        match self.state.pieces.lock() {
            Ok(mut shared) => *shared = Some(bitfield.clone()),
            Err(_) => return Err(Error::ChannelClosed),
        }
        self.pieces = Some(bitfield);

        self.status.state = State::Connected;
        log::info!("Peer {} session state: {:?}", self.addr, self.status.state);

        // a peer with pieces is worth downloading from
        log::debug!("Interested in peer {}", self.addr);
        sink.send(Message::Interested).await?;
        self.status.is_interested = true;

        Ok(())
    }

    /// Handles messages expected in the `Connected` state.
    async fn handle_msg(&mut self, msg: Message) -> Result<()> {
        match msg {
            Message::KeepAlive => {
                log::trace!("Peer {} sent keep alive", self.addr);
            }
            Message::Bitfield(_) => {
                // a late bitfield is ignored rather than trusted
                log::debug!(
                    "Peer {} sent bitfield not after handshake, ignoring",
                    self.addr
                );
            }
            Message::Choke => {
                if !self.status.is_choked {
                    log::info!("Peer {} choked us", self.addr);
                    self.status.is_choked = true;
                    self.state.is_peer_choking.store(true, Ordering::Relaxed);
                }
            }
            Message::Unchoke => {
                if self.status.is_choked {
                    log::info!("Peer {} unchoked us", self.addr);
                    self.status.is_choked = false;
                    self.state
                        .is_peer_choking
                        .store(false, Ordering::Relaxed);
                    // the next tick's pipeline refill puts this peer to work
                }
            }
            Message::Interested => {
                if !self.status.is_peer_interested {
                    log::info!("Peer {} is interested", self.addr);
                    self.status.is_peer_interested = true;
                    self.state
                        .is_peer_interested
                        .store(true, Ordering::Relaxed);
                }
            }
            Message::NotInterested => {
                if self.status.is_peer_interested {
                    log::info!("Peer {} is not interested", self.addr);
                    self.status.is_peer_interested = false;
                    self.state
                        .is_peer_interested
                        .store(false, Ordering::Relaxed);
                }
            }
            Message::Have { piece_index } => {
                self.handle_have_msg(piece_index).await?;
            }
            Message::Request(block) => {
                self.handle_request_msg(block)?;
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                self.handle_block_msg(piece_index, offset, data).await?;
            }
            Message::Cancel(block) => {
                // remove the pending upload if we haven't served it yet;
                // an upload already being written is not aborted
                if let Some(pos) =
                    self.upload_queue.iter().position(|b| *b == block)
                {
                    log::debug!(
                        "Peer {} cancelled block {:?}",
                        self.addr,
                        block
                    );
                    self.upload_queue.remove(pos);
                }
            }
        }
        Ok(())
    }

    /// Registers a piece announcement. An out of range index is ignored and
    /// the peer stays alive.
    async fn handle_have_msg(&mut self, piece_index: PieceIndex) -> Result<()> {
        let piece_count = self.torrent.storage.piece_count;
        if piece_index >= piece_count {
            log::debug!(
                "Peer {} announced invalid piece {}, ignoring",
                self.addr,
                piece_index
            );
            return Ok(());
        }

        let pieces = self
            .pieces
            .get_or_insert_with(|| Bitfield::repeat(false, piece_count));
        if !pieces[piece_index] {
            pieces.set(piece_index, true);
            match self.state.pieces.lock() {
                Ok(mut shared) => match &mut *shared {
                    Some(shared) => shared.set(piece_index, true),
                    None => *shared = Some(pieces.clone()),
                },
                Err(_) => return Err(Error::ChannelClosed),
            }
            self.torrent
                .scheduler
                .write()
                .await
                .register_have(piece_index);
        }

        // a piece announcement from a peer that never sent a bitfield ends
        // the availability exchange
        if self.status.state == State::AvailabilityExchange {
            self.status.state = State::Connected;
            log::info!(
                "Peer {} session state: {:?}",
                self.addr,
                self.status.state
            );
        }

        Ok(())
    }

    /// Bounds checks an incoming request and queues it for upload, unless we
    /// are choking the peer.
    fn handle_request_msg(&mut self, block: BlockInfo) -> Result<()> {
        let piece_len = self
            .torrent
            .storage
            .piece_len(block.piece_index)
            .map_err(|_| {
                Error::ProtocolViolation("request for invalid piece")
            })?;
        if block.len == 0
            || block.len > MAX_REQUEST_LEN
            || block.offset as u64 + block.len as u64 > piece_len as u64
        {
            return Err(Error::ProtocolViolation(
                "request for invalid block range",
            ));
        }

        if self.status.is_peer_choked {
            log::debug!(
                "Choked peer {} requested a block, dropping",
                self.addr
            );
            return Ok(());
        }

        log::debug!("Peer {} requested block {:?}", self.addr, block);
        self.upload_queue.push_back(block);
        Ok(())
    }

    /// Verifies block validity, registers it with the scheduler and hands
    /// its bytes to the piece store.
    async fn handle_block_msg(
        &mut self,
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    ) -> Result<()> {
        let piece_len = self
            .torrent
            .storage
            .piece_len(piece_index)
            .map_err(|_| Error::ProtocolViolation("block in invalid piece"))?;
        if data.is_empty()
            || offset as u64 + data.len() as u64 > piece_len as u64
        {
            return Err(Error::ProtocolViolation("block range out of piece"));
        }

        let block = BlockInfo {
            piece_index,
            offset,
            len: data.len() as u32,
        };
        debug_assert!(
            block.index_in_piece() < crate::block_count(piece_len)
        );
        log::debug!("Received block {:?} from peer {}", block, self.addr);
        self.outgoing_requests = self.outgoing_requests.saturating_sub(1);

        let receipt =
            self.torrent.scheduler.write().await.record_block(block);
        match receipt {
            BlockReceipt::Ignored => {
                // a cancelled request or an endgame duplicate that lost the
                // race; the bytes still counted towards the traffic stats
                log::debug!(
                    "Dropping unneeded block {:?} from peer {}",
                    block,
                    self.addr
                );
            }
            BlockReceipt::Accepted { piece_complete } => {
                self.torrent.disk.write_block(
                    self.torrent.id,
                    block,
                    data,
                )?;
                if piece_complete {
                    log::info!(
                        "Piece {} completed via peer {}",
                        piece_index,
                        self.addr
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, path::PathBuf, time::Instant};

    use sha1::Digest;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
        sync::RwLock,
    };

    use super::*;
    use crate::{
        disk,
        scheduler::Scheduler,
        storage_info::{FileInfo, StorageInfo},
        Sha1Hash,
    };

    const INFO_HASH: Sha1Hash = [0x21; 20];
    const CLIENT_ID: crate::PeerId = *b"spt-0000000000000000";
    const PIECE: &[u8; 16] = b"sixteen sweet bs";

    struct TempDir(PathBuf);

    impl TempDir {
        fn new(name: &str) -> Self {
            let path = std::env::temp_dir().join(format!(
                "spate-peer-test-{}-{}",
                name,
                std::process::id()
            ));
            let _ = fs::remove_dir_all(&path);
            fs::create_dir_all(&path).unwrap();
            Self(path)
        }
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.0);
        }
    }

    /// A single piece, single block torrent backed by a real disk task.
    async fn make_torrent(
        dir: &TempDir,
    ) -> (Arc<TorrentContext>, disk::TorrentAlertReceiver) {
        let storage = StorageInfo {
            piece_count: 1,
            piece_len: PIECE.len() as u32,
            last_piece_len: PIECE.len() as u32,
            download_len: PIECE.len() as u64,
            download_dir: dir.0.clone(),
            files: vec![FileInfo {
                path: PathBuf::from("single.bin"),
                len: PIECE.len() as u64,
                torrent_offset: 0,
            }],
        };

        let (disk_handle, mut alert_port) = disk::spawn().unwrap();
        let piece_hashes =
            sha1::Sha1::digest(&PIECE[..]).as_slice().to_vec();
        disk_handle
            .allocate_new_torrent(0, storage.clone(), piece_hashes)
            .unwrap();
        let torrent_alert_port = match alert_port.recv().await.unwrap() {
            disk::Alert::TorrentAllocation(allocation) => {
                allocation.unwrap().alert_port
            }
        };

        let ctx = Arc::new(TorrentContext {
            id: 0,
            info_hash: INFO_HASH,
            client_id: CLIENT_ID,
            scheduler: RwLock::new(Scheduler::new(&storage)),
            storage,
            disk: disk_handle,
            run_started: Instant::now(),
        });
        (ctx, torrent_alert_port)
    }

    async fn read_frame(socket: &mut tokio::net::TcpStream) -> Vec<u8> {
        let mut prefix = [0; 4];
        socket.read_exact(&mut prefix).await.unwrap();
        let len = u32::from_be_bytes(prefix) as usize;
        let mut payload = vec![0; len];
        socket.read_exact(&mut payload).await.unwrap();
        payload
    }

    /// The single piece download of the protocol documentation: handshake,
    /// bitfield `0x80`, interested, unchoke, one request and one block.
    #[tokio::test(threaded_scheduler)]
    async fn test_scripted_seed_single_piece_download() {
        let tmp = TempDir::new("scripted");
        let (ctx, mut torrent_alerts) = make_torrent(&tmp).await;

        // the scripted remote seed
        let mut listener =
            TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote_addr = listener.local_addr().unwrap();
        let script = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();

            // handshakes: ours must come in first, then we reply
            let mut handshake = [0; 68];
            socket.read_exact(&mut handshake).await.unwrap();
            assert_eq!(handshake[0], 19);
            assert_eq!(&handshake[1..20], PROTOCOL_STRING.as_bytes());
            assert_eq!(&handshake[28..48], &INFO_HASH[..]);

            let mut reply = handshake;
            reply[48..68].copy_from_slice(b"seed-meister12345678");
            socket.write_all(&reply).await.unwrap();

            // bitfield: we have the piece
            socket.write_all(&[0, 0, 0, 2, 5, 0x80]).await.unwrap();

            // the leech must declare interest
            let frame = read_frame(&mut socket).await;
            assert_eq!(frame, vec![2]);

            // unchoke them and serve the one request
            socket.write_all(&[0, 0, 0, 1, 1]).await.unwrap();

            let frame = read_frame(&mut socket).await;
            assert_eq!(frame.len(), 13);
            assert_eq!(frame[0], 6);
            assert_eq!(&frame[1..5], &[0, 0, 0, 0]);
            assert_eq!(&frame[5..9], &[0, 0, 0, 0]);
            assert_eq!(&frame[9..13], &(PIECE.len() as u32).to_be_bytes());

            let mut block = vec![0, 0, 0, 9 + PIECE.len() as u8, 7];
            block.extend_from_slice(&[0; 8]);
            block.extend_from_slice(PIECE);
            socket.write_all(&block).await.unwrap();

            socket
        });

        let (mut session, cmd_chan, state) =
            PeerSession::new(Arc::clone(&ctx), remote_addr, Direction::Outbound);
        let session_task =
            tokio::spawn(async move { session.start(None).await });

        // let the handshake and availability exchange happen, then drive the
        // scheduler tick until the request pipeline is filled
        time::delay_for(Duration::from_millis(200)).await;
        cmd_chan.send(Command::Tick).unwrap();

        // the piece flows through the session into the disk task, which
        // reports the hash check
        match torrent_alerts.recv().await.unwrap() {
            disk::TorrentAlert::PieceCompletion { index, is_valid } => {
                assert_eq!(index, 0);
                assert!(is_valid);
            }
        }

        // what the torrent task would do on that alert
        {
            let mut scheduler = ctx.scheduler.write().await;
            scheduler.piece_verified(0);
            assert!(scheduler.is_complete());
            assert_eq!(scheduler.good_pieces(), 1);
            assert_eq!(scheduler.left(), 0);
            assert_eq!(scheduler.downloaded(), PIECE.len() as u64);
        }

        assert_eq!(
            fs::read(tmp.0.join("single.bin")).unwrap(),
            PIECE.to_vec()
        );

        // the peer stayed alive throughout and dies on shutdown
        assert!(!state.is_dead.load(Ordering::Acquire));
        cmd_chan.send(Command::Shutdown).unwrap();
        session_task.await.unwrap().unwrap();
        assert!(state.is_dead.load(Ordering::Acquire));
        drop(script);
    }

    /// A peer announcing a 16 MiB frame is cut off without the frame being
    /// buffered.
    #[tokio::test(threaded_scheduler)]
    async fn test_oversized_frame_kills_peer() {
        let tmp = TempDir::new("oversize");
        let (ctx, _torrent_alerts) = make_torrent(&tmp).await;

        let mut listener =
            TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote_addr = listener.local_addr().unwrap();
        let script = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut handshake = [0; 68];
            socket.read_exact(&mut handshake).await.unwrap();
            socket.write_all(&handshake).await.unwrap();
            // 16 MiB + 1 length prefix
            socket.write_all(&[0x01, 0, 0, 0]).await.unwrap();
            socket
        });

        let (mut session, _cmd_chan, state) =
            PeerSession::new(Arc::clone(&ctx), remote_addr, Direction::Outbound);
        let result = session.start(None).await;

        assert!(result.is_err());
        assert!(state.is_dead.load(Ordering::Acquire));
        drop(script);
    }

    /// A bitfield whose byte length doesn't match the torrent's piece count
    /// kills the peer.
    #[tokio::test(threaded_scheduler)]
    async fn test_wrong_bitfield_length_kills_peer() {
        let tmp = TempDir::new("bitfield-len");
        let (ctx, _torrent_alerts) = make_torrent(&tmp).await;

        let mut listener =
            TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote_addr = listener.local_addr().unwrap();
        let script = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut handshake = [0; 68];
            socket.read_exact(&mut handshake).await.unwrap();
            socket.write_all(&handshake).await.unwrap();
            // two bitfield bytes for a one piece torrent
            socket
                .write_all(&[0, 0, 0, 3, 5, 0x80, 0x00])
                .await
                .unwrap();
            socket
        });

        let (mut session, _cmd_chan, state) =
            PeerSession::new(Arc::clone(&ctx), remote_addr, Direction::Outbound);
        let result = session.start(None).await;

        assert!(matches!(result, Err(Error::ProtocolViolation(_))));
        assert!(state.is_dead.load(Ordering::Acquire));
        drop(script);
    }

    /// A handshake advertising a foreign torrent is rejected.
    #[tokio::test(threaded_scheduler)]
    async fn test_wrong_info_hash_kills_peer() {
        let tmp = TempDir::new("wrong-hash");
        let (ctx, _torrent_alerts) = make_torrent(&tmp).await;

        let mut listener =
            TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote_addr = listener.local_addr().unwrap();
        let script = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut handshake = [0; 68];
            socket.read_exact(&mut handshake).await.unwrap();
            // flip the info hash before echoing the handshake back
            handshake[28] ^= 0xff;
            socket.write_all(&handshake).await.unwrap();
            socket
        });

        let (mut session, _cmd_chan, state) =
            PeerSession::new(Arc::clone(&ctx), remote_addr, Direction::Outbound);
        let result = session.start(None).await;

        assert!(matches!(result, Err(Error::InvalidPeerInfoHash)));
        assert!(state.is_dead.load(Ordering::Acquire));
        drop(script);
    }
}
