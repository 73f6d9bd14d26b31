//! The torrent coordinator: owns the peer sessions, the listener and the
//! announce state machine, and runs the once-a-second scheduler tick that
//! reaps dead peers, drives uploads and pipelines, runs the choke algorithm
//! and detects endgame.

use {
    futures::{select, StreamExt},
    rand::Rng,
    std::{
        net::SocketAddr,
        sync::{atomic::Ordering, Arc},
        time::{Duration, Instant},
    },
    tokio::{
        net::{TcpListener, TcpStream},
        sync::{mpsc, RwLock},
        task, time,
    },
};

use crate::{
    conf::TorrentConf,
    disk::{DiskHandle, TorrentAlert, TorrentAlertReceiver},
    error::*,
    peer::{self, Direction, PeerSession, PeerState},
    scheduler::Scheduler,
    storage_info::StorageInfo,
    tracker::{AnnounceParams, AnnounceResult, Event, Tracker},
    PeerId, PieceIndex, Sha1Hash, TorrentId,
};

/// How many peers the choke algorithm reciprocates to.
const UNCHOKE_SLOTS: usize = 3;

/// The choke algorithm runs on every tick whose number is divisible by
/// this.
const CHOKE_TICK_SECS: u64 = 10;

/// The optimistic unchoke runs on every tick whose number is divisible by
/// this.
const OPTIMISTIC_UNCHOKE_TICK_SECS: u64 = 30;

/// Information the torrent and all its peer sessions share.
pub(crate) struct TorrentContext {
    pub id: TorrentId,
    pub info_hash: Sha1Hash,
    pub client_id: PeerId,
    pub storage: StorageInfo,
    /// The block registry, piece selection state and session counters,
    /// locked by sessions when picking and recording blocks and by the
    /// torrent tick.
    pub scheduler: RwLock<Scheduler>,
    pub disk: DiskHandle,
    /// When this torrent's session started. The shared peer state keeps its
    /// timestamps as milliseconds since this instant so they fit in
    /// atomics.
    pub run_started: Instant,
}

impl TorrentContext {
    /// Milliseconds elapsed since the torrent session started.
    pub fn now_ms(&self) -> u64 {
        self.run_started.elapsed().as_millis() as u64
    }
}

/// The torrent side of a peer session: its address, its command channel and
/// the state the session shares with the tick.
struct PeerHandle {
    addr: SocketAddr,
    cmd: peer::Sender,
    state: Arc<PeerState>,
}

type AnnounceChan = mpsc::UnboundedSender<Result<AnnounceResult>>;

pub(crate) struct Torrent {
    ctx: Arc<TorrentContext>,
    conf: TorrentConf,
    tracker: Tracker,
    /// The address peers can reach us on, announced to the tracker. Peers
    /// equal to this address in tracker responses are ourselves.
    listen_addr: SocketAddr,
    /// The connected (and connecting) peers, in insertion order.
    peers: Vec<PeerHandle>,
    /// Whether an announce request is in flight.
    announce_underway: bool,
    /// When the last announce was sent, underpinning the supplementary
    /// announce rate limit.
    last_announce: Option<Instant>,
    /// When the next periodic announce is due.
    next_announce: Instant,
    /// The interval of periodic announces, as dictated by the tracker.
    announce_interval: Duration,
    /// The floor on supplementary announces, raised if the tracker states
    /// a higher one.
    min_announce_interval: Duration,
    /// The tracker id echoed back to the tracker, once one was handed out.
    tracker_id: Option<String>,
    /// The number of ticks run so far; the choke algorithm and the
    /// optimistic unchoke trigger on multiples of it.
    tick_no: u64,
    in_endgame: bool,
}

impl Torrent {
    pub fn new(
        ctx: Arc<TorrentContext>,
        conf: TorrentConf,
        tracker: Tracker,
        listen_addr: SocketAddr,
    ) -> Self {
        let announce_interval = conf.announce_interval;
        let min_announce_interval = conf.min_announce_interval;
        Self {
            ctx,
            conf,
            tracker,
            listen_addr,
            peers: Vec::new(),
            announce_underway: false,
            last_announce: None,
            next_announce: Instant::now(),
            announce_interval,
            min_announce_interval,
            tracker_id: None,
            tick_no: 0,
            in_endgame: false,
        }
    }

    /// Runs the torrent to completion: announces, accepts and connects
    /// peers, and ticks the scheduler once a second. Returns once every
    /// piece is downloaded and verified.
    pub async fn run(
        &mut self,
        listener: TcpListener,
        disk_port: TorrentAlertReceiver,
    ) -> Result<()> {
        log::info!(
            "Starting torrent (pieces: {}, piece len: {})",
            self.ctx.storage.piece_count,
            self.ctx.storage.piece_len
        );

        let (announce_chan, announce_port) = mpsc::unbounded_channel();
        self.start_announce(&announce_chan, Some(Event::Started));

        let mut listener = listener;
        let mut tick_timer = time::interval(Duration::from_secs(1)).fuse();
        let mut announce_port = announce_port.fuse();
        let mut disk_port = disk_port.fuse();
        let mut incoming = listener.incoming().fuse();

        loop {
            select! {
                _ = tick_timer.select_next_some() => {
                    self.tick(&announce_chan).await?;
                }
                result = announce_port.select_next_some() => {
                    self.handle_announce_result(result);
                }
                peer_conn = incoming.select_next_some() => {
                    match peer_conn {
                        Ok(socket) => self.accept_peer(socket),
                        Err(e) => log::warn!("Failed to accept peer: {}", e),
                    }
                }
                alert = disk_port.select_next_some() => {
                    if self.handle_disk_alert(alert).await? {
                        break;
                    }
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// A single scheduler tick. Per peer, in insertion order: reap if dead
    /// or inactive, otherwise serve one upload and refill the request
    /// pipeline (both on the session side of the command channel). Then the
    /// session wide concerns: choking, endgame, announces.
    async fn tick(&mut self, announce_chan: &AnnounceChan) -> Result<()> {
        self.tick_no += 1;
        let now_ms = self.ctx.now_ms();
        let threshold_ms =
            self.conf.peer_inactivity_threshold.as_millis() as u64;

        let mut choked = 0;
        let mut unchoked = 0;
        let peers = std::mem::replace(
            &mut self.peers,
            Vec::new(),
        );
        for handle in peers {
            if handle.state.am_choking.load(Ordering::Relaxed) {
                choked += 1;
            } else {
                unchoked += 1;
            }

            let is_dead = handle.state.is_dead.load(Ordering::Acquire);
            let timed_out =
                !is_dead && handle.state.idle_ms(now_ms) >= threshold_ms;
            if is_dead || timed_out {
                if timed_out {
                    log::info!(
                        "Comms threshold exceeded for peer {}",
                        handle.addr
                    );
                    let _ = handle.cmd.send(peer::Command::Shutdown);
                }
                self.reap_peer(handle).await;
                continue;
            }

            let _ = handle.cmd.send(peer::Command::Tick);
            self.peers.push(handle);
        }

        if self.tick_no % CHOKE_TICK_SECS == 0 {
            self.run_choke_algorithm();
        }

        let (is_complete, is_endgame, left, stats) = {
            let scheduler = self.ctx.scheduler.read().await;
            (
                scheduler.is_complete(),
                scheduler.is_endgame(),
                scheduler.left(),
                scheduler.request_stats(),
            )
        };
        if !is_complete && is_endgame {
            self.run_endgame().await;
        }

        // try to get some more peers
        let announce_allowed = self.last_announce.map_or(true, |at| {
            at.elapsed() >= self.min_announce_interval
        });
        if self.peers.len() < self.conf.wanted_peer_count
            && left > 0
            && !self.announce_underway
            && announce_allowed
        {
            self.start_announce(announce_chan, None);
        } else if !self.announce_underway
            && Instant::now() >= self.next_announce
        {
            self.start_announce(announce_chan, None);
        }

        log::debug!(
            "Peers: {} (c {}/u {}) Good pieces: {}/{} \
            Reqs outstanding/orphaned/completed: {}/{}/{}",
            self.peers.len(),
            choked,
            unchoked,
            self.ctx.scheduler.read().await.good_pieces(),
            self.ctx.storage.piece_count,
            stats.outstanding,
            stats.orphaned,
            stats.completed,
        );

        Ok(())
    }

    /// Removes a dead peer: its block records become orphans (they stay in
    /// the registry for recycling) and its pieces leave the availability
    /// counts.
    async fn reap_peer(&mut self, handle: PeerHandle) {
        log::info!("Reaping peer {}", handle.addr);
        let mut scheduler = self.ctx.scheduler.write().await;
        scheduler.orphan_peer(handle.addr);
        if let Ok(pieces) = handle.state.pieces.lock() {
            if let Some(pieces) = &*pieces {
                scheduler.unregister_availability(pieces);
            }
        }
    }

    /// Every 10 seconds: rank peers by download rate and unchoke the three
    /// fastest interested ones; every 30 seconds additionally unchoke one
    /// interested peer at random. Everyone else is choked. Sessions ignore
    /// choke commands that match their current state, so this is cheap to
    /// run repeatedly.
    fn run_choke_algorithm(&mut self) {
        let now_ms = self.ctx.now_ms();
        let ranks: Vec<(u64, bool)> = self
            .peers
            .iter()
            .map(|handle| {
                let interested = handle
                    .state
                    .is_peer_interested
                    .load(Ordering::Relaxed);
                (handle.state.download_rate(now_ms), interested)
            })
            .collect();

        let mut unchoke = fastest_interested(&ranks, UNCHOKE_SLOTS);

        if self.tick_no % OPTIMISTIC_UNCHOKE_TICK_SECS == 0 {
            let interested: Vec<usize> = ranks
                .iter()
                .enumerate()
                .filter(|(_, (_, interested))| *interested)
                .map(|(index, _)| index)
                .collect();
            if !interested.is_empty() {
                let pick = interested
                    [rand::thread_rng().gen_range(0..interested.len())];
                log::debug!(
                    "Opportunistic unchoke of peer {}",
                    self.peers[pick].addr
                );
                if !unchoke.contains(&pick) {
                    unchoke.push(pick);
                }
            }
        }

        for (index, handle) in self.peers.iter().enumerate() {
            let cmd = if unchoke.contains(&index) {
                peer::Command::Unchoke
            } else {
                peer::Command::Choke
            };
            let _ = handle.cmd.send(cmd);
        }
    }

    /// In endgame every block of every incomplete piece is queued on every
    /// peer that has the piece and isn't choking us. The first arriving
    /// copy of a block wins; the rest are dropped by the registry.
    async fn run_endgame(&mut self) {
        if !self.in_endgame {
            log::info!("Endgame: all remaining blocks are assigned");
            self.in_endgame = true;
        }
        for handle in self.peers.iter() {
            if handle.state.is_dead.load(Ordering::Acquire)
                || handle.state.is_peer_choking.load(Ordering::Relaxed)
            {
                continue;
            }
            let pieces = match handle.state.pieces.lock() {
                Ok(pieces) => pieces.clone(),
                Err(_) => continue,
            };
            let pieces = match pieces {
                Some(pieces) => pieces,
                None => continue,
            };
            let blocks = self
                .ctx
                .scheduler
                .write()
                .await
                .endgame_blocks_for(handle.addr, &pieces);
            for block in blocks {
                let _ = handle.cmd.send(peer::Command::Request(block));
            }
        }
    }

    /// Spawns an announce request. The response arrives back on the main
    /// loop through the announce channel.
    fn start_announce(
        &mut self,
        announce_chan: &AnnounceChan,
        event: Option<Event>,
    ) {
        if self.announce_underway {
            return;
        }
        self.announce_underway = true;
        log::info!("Announcing (event: {:?})", event);

        let ctx = Arc::clone(&self.ctx);
        let tracker = self.tracker.clone();
        let announce_chan = announce_chan.clone();
        let port = self.listen_addr.port();
        let peer_count = self.conf.wanted_peer_count.max(
            self.conf.max_connected_peer_count - self.peers.len(),
        );
        let tracker_id = self.tracker_id.clone();
        task::spawn(async move {
            let (uploaded, downloaded, left) = {
                let scheduler = ctx.scheduler.read().await;
                (
                    scheduler.uploaded(),
                    scheduler.downloaded(),
                    scheduler.left(),
                )
            };
            let params = AnnounceParams {
                info_hash: ctx.info_hash,
                peer_id: ctx.client_id,
                port,
                uploaded,
                downloaded,
                left,
                event,
                peer_count: Some(peer_count),
                ip: None,
                key: None,
                tracker_id,
            };
            let _ = announce_chan.send(tracker.announce(params).await);
        });
    }

    /// Applies a finished announce: reconciles the peer list with the
    /// tracker's, or logs the failure and schedules a retry.
    fn handle_announce_result(&mut self, result: Result<AnnounceResult>) {
        self.announce_underway = false;
        self.last_announce = Some(Instant::now());
        match result {
            Ok(announce) => {
                log::info!(
                    "Announce ok: {} peers, interval {:?}",
                    announce.peers.len(),
                    announce.interval
                );
                self.announce_interval = announce.interval;
                if let Some(min_interval) = announce.min_interval {
                    self.min_announce_interval =
                        self.min_announce_interval.max(min_interval);
                }
                if announce.tracker_id.is_some() {
                    self.tracker_id = announce.tracker_id;
                }
                self.next_announce = Instant::now() + self.announce_interval;
                self.update_peer_list(announce.peers);
            }
            Err(e) => {
                // not fatal: the next announce retries after the interval
                log::warn!("Announce failed: {}", e);
                self.next_announce = Instant::now() + self.announce_interval;
            }
        }
    }

    /// Connects to peers the tracker listed that we don't know, and drops
    /// peers that fell out of the tracker's list.
    fn update_peer_list(&mut self, peers: Vec<SocketAddr>) {
        // the tracker may list ourselves
        let peers: Vec<SocketAddr> = peers
            .into_iter()
            .filter(|addr| *addr != self.listen_addr)
            .collect();

        for addr in peers.iter() {
            if self.peers.iter().any(|handle| handle.addr == *addr) {
                continue;
            }
            if self.peers.len() >= self.conf.max_connected_peer_count {
                break;
            }
            self.spawn_peer(*addr, Direction::Outbound, None);
        }

        // peers absent from the new list are shut down; the next tick reaps
        // them once their sessions have wound down
        for handle in self.peers.iter() {
            if !peers.contains(&handle.addr) {
                log::info!(
                    "Peer {} no longer in the tracker's list, dropping",
                    handle.addr
                );
                let _ = handle.cmd.send(peer::Command::Shutdown);
            }
        }
    }

    /// Registers an inbound connection as a new peer session.
    fn accept_peer(&mut self, socket: TcpStream) {
        let addr = match socket.peer_addr() {
            Ok(addr) => addr,
            Err(e) => {
                log::warn!("Failed to read inbound peer address: {}", e);
                return;
            }
        };
        if self.peers.len() >= self.conf.max_connected_peer_count
            || self.peers.iter().any(|handle| handle.addr == addr)
        {
            log::info!("Dropping inbound connection from {}", addr);
            return;
        }
        log::info!("Inbound connection from {}", addr);
        self.spawn_peer(addr, Direction::Inbound, Some(socket));
    }

    fn spawn_peer(
        &mut self,
        addr: SocketAddr,
        direction: Direction,
        socket: Option<TcpStream>,
    ) {
        log::info!("Starting {:?} peer {} session", direction, addr);
        let (mut session, cmd, state) =
            PeerSession::new(Arc::clone(&self.ctx), addr, direction);
        task::spawn(async move {
            // session errors (protocol violations, transport failures) are
            // logged by the session itself; all that's left here is the
            // reaping, which the tick does via the dead flag
            let _ = session.start(socket).await;
        });
        self.peers.push(PeerHandle { addr, cmd, state });
    }

    /// Reacts to a piece finishing its hash check in the piece store.
    /// Returns true when the download is complete.
    async fn handle_disk_alert(&mut self, alert: TorrentAlert) -> Result<bool> {
        match alert {
            TorrentAlert::PieceCompletion { index, is_valid } => {
                if !is_valid {
                    // discard the piece's block records; the next tick's
                    // pipeline refills re-request them
                    self.ctx.scheduler.write().await.piece_failed(index);
                    return Ok(false);
                }

                let (good_pieces, is_complete) = {
                    let mut scheduler = self.ctx.scheduler.write().await;
                    scheduler.piece_verified(index);
                    (scheduler.good_pieces(), scheduler.is_complete())
                };
                log::info!(
                    "Piece {} verified ({}/{})",
                    index,
                    good_pieces,
                    self.ctx.storage.piece_count
                );

                self.broadcast_have(index);

                if is_complete {
                    log::info!("Download complete");
                    return Ok(true);
                }
                Ok(false)
            }
        }
    }

    /// Announces a freshly verified piece to every live peer.
    fn broadcast_have(&self, piece_index: PieceIndex) {
        for handle in self.peers.iter() {
            let _ = handle.cmd.send(peer::Command::Have { piece_index });
        }
    }

    /// Shuts the peer sessions down and sends the final announce.
    async fn shutdown(&mut self) {
        for handle in self.peers.drain(..) {
            let _ = handle.cmd.send(peer::Command::Shutdown);
        }

        let is_complete = self.ctx.scheduler.read().await.is_complete();
        let event = if is_complete {
            Event::Completed
        } else {
            Event::Stopped
        };
        let (uploaded, downloaded, left) = {
            let scheduler = self.ctx.scheduler.read().await;
            (scheduler.uploaded(), scheduler.downloaded(), scheduler.left())
        };
        let params = AnnounceParams {
            info_hash: self.ctx.info_hash,
            peer_id: self.ctx.client_id,
            port: self.listen_addr.port(),
            uploaded,
            downloaded,
            left,
            event: Some(event),
            peer_count: Some(0),
            ip: None,
            key: None,
            tracker_id: self.tracker_id.clone(),
        };
        // nothing depends on the response, but don't hang shutdown on
        // a dead tracker either
        let announce = self.tracker.announce(params);
        if let Ok(Err(e)) =
            time::timeout(Duration::from_secs(5), announce).await
        {
            log::warn!("Final announce failed: {}", e);
        }
    }
}

/// Returns the indices of the `slots` fastest interested peers, given
/// `(download rate, is interested)` pairs in peer list order.
///
/// Uninterested peers are never unchoked; among interested peers rates are
/// floored to one so a freshly connected interested peer still competes for
/// a slot.
fn fastest_interested(ranks: &[(u64, bool)], slots: usize) -> Vec<usize> {
    let mut interested: Vec<(usize, u64)> = ranks
        .iter()
        .enumerate()
        .filter(|(_, (_, interested))| *interested)
        .map(|(index, (rate, _))| (index, (*rate).max(1)))
        .collect();
    // fastest first; ties resolve towards the longer connected peer
    interested.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    interested
        .into_iter()
        .take(slots)
        .map(|(index, _)| index)
        .collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_fastest_interested_ranks_by_rate() {
        let ranks = vec![
            (100, true),
            (5000, true),
            (9000, false),
            (700, true),
            (800, true),
        ];
        assert_eq!(fastest_interested(&ranks, 3), vec![1, 4, 3]);
    }

    #[test]
    fn test_uninterested_peers_are_never_unchoked() {
        let ranks = vec![(9000, false), (0, false), (1, true)];
        assert_eq!(fastest_interested(&ranks, 3), vec![2]);
    }

    #[test]
    fn test_unchoke_set_is_bounded() {
        let ranks: Vec<(u64, bool)> =
            (0..10).map(|rate| (rate, true)).collect();
        let unchoked = fastest_interested(&ranks, UNCHOKE_SLOTS);
        // three reciprocal slots; the optimistic unchoke adds at most one
        assert_eq!(unchoked.len(), UNCHOKE_SLOTS);
    }

    #[test]
    fn test_zero_rate_interested_peers_still_compete() {
        let ranks = vec![(0, true), (0, true)];
        assert_eq!(fastest_interested(&ranks, 3), vec![0, 1]);
    }
}
