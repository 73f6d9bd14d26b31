//! The pure logic core of the download: the block download registry, piece
//! selection, endgame detection and the session counters.
//!
//! Everything in here is driven either by a peer session (picking and
//! recording blocks) or by the torrent's once-a-second tick (orphaning dead
//! peers, endgame assignment). The torrent wraps a single [`Scheduler`] in
//! a lock, so all methods take `&mut self` and no method does any I/O.

use std::{
    collections::{BTreeMap, HashMap},
    net::SocketAddr,
    time::Instant,
};

use rand::Rng;

use crate::{block_len, storage_info::StorageInfo, Bitfield, BlockInfo, PieceIndex, BLOCK_LEN};

/// How long a computed rarity ranking stays valid.
const RARITY_AGE_SECS: u64 = 5;

/// The number of pieces that are picked randomly before switching to rarest
/// first selection.
const WARMUP_PIECE_COUNT: usize = 4;

/// A single block download: who is working on it and how much of it has
/// arrived.
///
/// Records outlive the peer they are assigned to: when a peer dies its
/// records are orphaned (`peer` is cleared) and stay in the registry until
/// another peer recycles them or the containing piece completes.
#[derive(Clone, Debug)]
pub(crate) struct BlockDl {
    pub piece_index: PieceIndex,
    pub offset: u32,
    pub len: u32,
    /// How many bytes of this block have landed in the piece store.
    pub bytes: u32,
    /// The peer currently responsible for this block, if any.
    pub peer: Option<SocketAddr>,
}

impl BlockDl {
    pub fn is_complete(&self) -> bool {
        self.bytes == self.len
    }

    pub fn info(&self) -> BlockInfo {
        BlockInfo {
            piece_index: self.piece_index,
            offset: self.offset,
            len: self.len,
        }
    }
}

/// The outcome of recording a received block.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum BlockReceipt {
    /// The block was expected and its bytes should be written to the piece
    /// store. If this was the piece's last missing block the store can go on
    /// to verify the piece hash.
    Accepted { piece_complete: bool },
    /// The block was cancelled, already completed by another peer (endgame)
    /// or never requested. The bytes are dropped.
    Ignored,
}

/// Counts of block download records, for the tick trace line.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub(crate) struct RequestStats {
    pub outstanding: usize,
    pub orphaned: usize,
    pub completed: usize,
}

pub(crate) struct Scheduler {
    piece_count: usize,
    nominal_piece_len: u32,
    last_piece_len: u32,

    /// Bit `i` is set iff piece `i` has passed hash verification.
    own_pieces: Bitfield,
    /// For each piece, the number of connected peers advertising it.
    availability: Vec<u32>,
    /// Piece indices in ascending order of availability (ties broken by the
    /// piece index), rebuilt at most every [`RARITY_AGE_SECS`] seconds.
    rarity: Option<(Instant, Vec<PieceIndex>)>,

    /// The registry proper: block records keyed by `(piece, offset)`. The
    /// vector holds exactly one record outside endgame; during endgame it
    /// holds at most one extra record per peer working on the same block.
    registry: BTreeMap<(PieceIndex, u32), Vec<BlockDl>>,
    /// Per peer overlay of the registry, so a dying peer's records can be
    /// orphaned without scanning the whole map.
    peer_blocks: HashMap<SocketAddr, Vec<(PieceIndex, u32)>>,

    good_pieces: usize,
    uploaded: u64,
    downloaded: u64,
    left: u64,
}

impl Scheduler {
    pub fn new(storage: &StorageInfo) -> Self {
        Self {
            piece_count: storage.piece_count,
            nominal_piece_len: storage.piece_len,
            last_piece_len: storage.last_piece_len,
            own_pieces: Bitfield::repeat(false, storage.piece_count),
            availability: vec![0; storage.piece_count],
            rarity: None,
            registry: BTreeMap::new(),
            peer_blocks: HashMap::new(),
            good_pieces: 0,
            uploaded: 0,
            downloaded: 0,
            left: storage.download_len,
        }
    }

    /// The length of the piece at the given index. Only the last piece may
    /// differ from the nominal piece length.
    pub fn piece_len(&self, index: PieceIndex) -> u32 {
        debug_assert!(index < self.piece_count);
        if index + 1 == self.piece_count {
            self.last_piece_len
        } else {
            self.nominal_piece_len
        }
    }

    pub fn piece_count(&self) -> usize {
        self.piece_count
    }

    pub fn own_pieces(&self) -> &Bitfield {
        &self.own_pieces
    }

    pub fn good_pieces(&self) -> usize {
        self.good_pieces
    }

    pub fn left(&self) -> u64 {
        self.left
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded
    }

    pub fn add_uploaded(&mut self, bytes: u64) {
        self.uploaded += bytes;
    }

    /// True once every piece has been downloaded and hash verified.
    pub fn is_complete(&self) -> bool {
        self.good_pieces == self.piece_count
    }

    // ------------------------------------------------------------------
    // Piece availability

    /// Registers that a peer advertised all pieces in the given bitfield.
    pub fn register_availability(&mut self, pieces: &Bitfield) {
        debug_assert_eq!(pieces.len(), self.piece_count);
        for (index, count) in self.availability.iter_mut().enumerate() {
            if pieces[index] {
                *count += 1;
            }
        }
    }

    /// Registers a single `have` announcement. The caller must only invoke
    /// this on a piece the peer hasn't announced before.
    pub fn register_have(&mut self, index: PieceIndex) {
        if index < self.piece_count {
            self.availability[index] += 1;
        }
    }

    /// Removes a disconnected peer's pieces from the availability counts.
    pub fn unregister_availability(&mut self, pieces: &Bitfield) {
        debug_assert_eq!(pieces.len(), self.piece_count);
        for (index, count) in self.availability.iter_mut().enumerate() {
            if pieces[index] {
                *count = count.saturating_sub(1);
            }
        }
    }

    // ------------------------------------------------------------------
    // Block selection

    /// Hands the given peer the next block to download, according to the
    /// selection policy:
    ///
    /// 1. prefer completing a piece that already has blocks in the registry,
    /// 2. while we hold fewer than four verified pieces, pick among the
    ///    peer's pieces at random,
    /// 3. otherwise pick the rarest piece the peer has.
    ///
    /// Within the chosen piece the block at the lowest unassigned offset is
    /// used; an orphaned record is recycled in place instead of creating
    /// a duplicate. Returns `None` when the peer has nothing we currently
    /// need.
    pub fn pick_block(
        &mut self,
        peer: SocketAddr,
        pieces: &Bitfield,
        now: Instant,
    ) -> Option<BlockInfo> {
        debug_assert_eq!(pieces.len(), self.piece_count);

        // if we have some blocks in a piece, try to complete that same piece
        let mut candidate = None;
        for &(index, _) in self.registry.keys() {
            if !self.own_pieces[index]
                && pieces[index]
                && !self.piece_assigned(index)
            {
                candidate = Some(index);
                break;
            }
        }

        let index = match candidate {
            Some(index) => index,
            None if self.good_pieces < WARMUP_PIECE_COUNT
                && self.piece_count > WARMUP_PIECE_COUNT =>
            {
                // the first few pieces are chosen randomly to get complete
                // pieces on disk quickly; rarest first would make every
                // client in a young swarm gang up on the same pieces
                let candidates: Vec<_> = (0..self.piece_count)
                    .filter(|&index| {
                        pieces[index]
                            && !self.own_pieces[index]
                            && !self.piece_assigned(index)
                    })
                    .collect();
                if candidates.is_empty() {
                    return None;
                }
                candidates[rand::thread_rng().gen_range(0..candidates.len())]
            }
            None => self.find_rarest(pieces, now)?,
        };

        Some(self.assign_block(peer, index))
    }

    /// Scans pieces in ascending order of rarity and returns the first one
    /// that the peer has, that we don't have, and that is not already fully
    /// assigned.
    fn find_rarest(
        &mut self,
        pieces: &Bitfield,
        now: Instant,
    ) -> Option<PieceIndex> {
        let stale = match &self.rarity {
            Some((built_at, _)) => {
                now.duration_since(*built_at).as_secs() > RARITY_AGE_SECS
            }
            None => true,
        };
        if stale {
            let mut ranking: Vec<PieceIndex> = (0..self.piece_count).collect();
            // ascending availability, ties resolved towards the lower index
            ranking.sort_by_key(|&index| (self.availability[index], index));
            self.rarity = Some((now, ranking));
        }

        let (_, ranking) = self.rarity.as_ref().expect("rarity just built");
        let mut found = None;
        for &index in ranking.iter() {
            if !pieces[index] || self.own_pieces[index] {
                continue;
            }
            if self.piece_assigned(index) {
                continue;
            }
            found = Some(index);
            break;
        }
        found
    }

    /// Whether all of the piece's blocks are in the registry and either
    /// complete or assigned to a live peer.
    fn piece_assigned(&self, index: PieceIndex) -> bool {
        let piece_len = self.piece_len(index);
        let mut offset = 0;
        while offset < piece_len {
            match self
                .registry
                .get(&(index, offset))
                .and_then(|dls| dls.first())
            {
                // a missing or orphaned incomplete record means there is
                // still work to hand out in this piece
                None => return false,
                Some(dl) => {
                    if !dl.is_complete() && dl.peer.is_none() {
                        return false;
                    }
                }
            }
            offset += BLOCK_LEN;
        }
        true
    }

    /// Finds the lowest offset in the piece without a live record, recycling
    /// an orphan when one exists.
    fn assign_block(
        &mut self,
        peer: SocketAddr,
        index: PieceIndex,
    ) -> BlockInfo {
        let piece_len = self.piece_len(index);
        let mut offset = 0;
        loop {
            if offset >= piece_len {
                // the piece selection above only returns pieces that are not
                // fully assigned, so running off the end is a bookkeeping bug
                panic!(
                    "no assignable block in piece {} (len {})",
                    index, piece_len
                );
            }
            match self
                .registry
                .get_mut(&(index, offset))
                .and_then(|dls| dls.first_mut())
            {
                None => break,
                Some(dl) => {
                    if dl.peer.is_none() && !dl.is_complete() {
                        // recycle the orphaned record in place
                        dl.peer = Some(peer);
                        let info = dl.info();
                        log::trace!(
                            "Recycling orphaned block {:?} for {}",
                            info,
                            peer
                        );
                        self.peer_blocks
                            .entry(peer)
                            .or_default()
                            .push((index, offset));
                        return info;
                    }
                }
            }
            offset += BLOCK_LEN;
        }

        let len = block_len(piece_len, (offset / BLOCK_LEN) as usize);
        let dl = BlockDl {
            piece_index: index,
            offset,
            len,
            bytes: 0,
            peer: Some(peer),
        };
        let info = dl.info();
        log::trace!("Assigning block {:?} to {}", info, peer);
        self.registry.entry((index, offset)).or_default().push(dl);
        self.peer_blocks
            .entry(peer)
            .or_default()
            .push((index, offset));
        info
    }

    // ------------------------------------------------------------------
    // Block receipt and piece completion

    /// Records the arrival of (part of) a block. All records of the block
    /// are advanced together: in endgame the data satisfies every peer's
    /// copy of the request at once, and the slower copies are dropped here
    /// when they eventually arrive.
    pub fn record_block(&mut self, block: BlockInfo) -> BlockReceipt {
        let key = (block.piece_index, block.offset);
        let dls = match self.registry.get_mut(&key) {
            Some(dls) if !dls.is_empty() => dls,
            _ => {
                log::debug!("Received block {:?} without a record", block);
                return BlockReceipt::Ignored;
            }
        };
        if dls.iter().all(BlockDl::is_complete) {
            log::debug!("Received duplicate of completed block {:?}", block);
            return BlockReceipt::Ignored;
        }

        for dl in dls.iter_mut() {
            dl.bytes = dl.bytes.saturating_add(block.len).min(dl.len);
        }
        let block_complete = dls.iter().any(|dl| dl.is_complete());

        // the progress meter advances as soon as bytes land in the piece
        // store, before hash verification
        self.downloaded += block.len as u64;

        if !block_complete {
            return BlockReceipt::Accepted {
                piece_complete: false,
            };
        }
        BlockReceipt::Accepted {
            piece_complete: self.piece_complete(block.piece_index),
        }
    }

    /// Whether all of the piece's blocks have fully arrived.
    fn piece_complete(&self, index: PieceIndex) -> bool {
        let piece_len = self.piece_len(index);
        let mut offset = 0;
        while offset < piece_len {
            let complete = self
                .registry
                .get(&(index, offset))
                .map_or(false, |dls| dls.iter().any(BlockDl::is_complete));
            if !complete {
                return false;
            }
            offset += BLOCK_LEN;
        }
        true
    }

    /// Marks the piece as hash verified: the own bitfield gains the piece,
    /// the counters advance and every record of the piece is freed.
    pub fn piece_verified(&mut self, index: PieceIndex) {
        debug_assert!(!self.own_pieces[index]);
        self.own_pieces.set(index, true);
        self.good_pieces += 1;
        self.left -= self.piece_len(index) as u64;
        self.free_piece_records(index);
        debug_assert!(self.good_pieces <= self.piece_count);
    }

    /// Discards all records of a piece that failed hash verification so the
    /// selection policy hands its blocks out afresh.
    pub fn piece_failed(&mut self, index: PieceIndex) {
        log::warn!("Piece {} failed hash check, requeueing", index);
        self.free_piece_records(index);
    }

    fn free_piece_records(&mut self, index: PieceIndex) {
        let keys: Vec<_> = self
            .registry
            .range((index, 0)..(index + 1, 0))
            .map(|(key, _)| *key)
            .collect();
        for key in keys {
            if let Some(dls) = self.registry.remove(&key) {
                for dl in dls {
                    if let Some(peer) = dl.peer {
                        if let Some(blocks) = self.peer_blocks.get_mut(&peer)
                        {
                            blocks.retain(|k| *k != key);
                        }
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Peer lifecycle

    /// Orphans all records owned by the peer. The records stay in the
    /// registry so their blocks can be recycled by other peers.
    pub fn orphan_peer(&mut self, peer: SocketAddr) {
        let keys = match self.peer_blocks.remove(&peer) {
            Some(keys) => keys,
            None => return,
        };
        log::debug!("Orphaning {} block records of peer {}", keys.len(), peer);
        for key in keys {
            if let Some(dls) = self.registry.get_mut(&key) {
                for dl in dls.iter_mut() {
                    if dl.peer == Some(peer) {
                        dl.peer = None;
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Endgame

    /// We are in endgame once every piece is either verified or has all its
    /// blocks in the registry, complete or assigned to live peers.
    pub fn is_endgame(&self) -> bool {
        (0..self.piece_count)
            .all(|index| self.own_pieces[index] || self.piece_assigned(index))
    }

    /// Queues every block of every incomplete piece the given peer has and
    /// isn't already working on, returning the requests to put on the wire.
    /// Duplicate records across peers are expected in endgame; the first
    /// arriving copy of a block wins.
    pub fn endgame_blocks_for(
        &mut self,
        peer: SocketAddr,
        pieces: &Bitfield,
    ) -> Vec<BlockInfo> {
        debug_assert_eq!(pieces.len(), self.piece_count);
        let mut blocks = Vec::new();
        for index in 0..self.piece_count {
            if self.own_pieces[index] || !pieces[index] {
                continue;
            }
            let piece_len = self.piece_len(index);
            let mut offset = 0;
            while offset < piece_len {
                let key = (index, offset);
                let queued_on_peer = self
                    .peer_blocks
                    .get(&peer)
                    .map_or(false, |keys| keys.contains(&key));
                if !queued_on_peer {
                    let len =
                        block_len(piece_len, (offset / BLOCK_LEN) as usize);
                    let dl = BlockDl {
                        piece_index: index,
                        offset,
                        len,
                        bytes: 0,
                        peer: Some(peer),
                    };
                    blocks.push(dl.info());
                    self.registry.entry(key).or_default().push(dl);
                    self.peer_blocks.entry(peer).or_default().push(key);
                }
                offset += BLOCK_LEN;
            }
        }
        if !blocks.is_empty() {
            log::debug!(
                "Endgame: queueing {} duplicate blocks on {}",
                blocks.len(),
                peer
            );
        }
        blocks
    }

    // ------------------------------------------------------------------
    // Introspection

    /// Counts records for the tick trace line.
    pub fn request_stats(&self) -> RequestStats {
        let mut stats = RequestStats::default();
        for dls in self.registry.values() {
            for dl in dls {
                if dl.is_complete() {
                    stats.completed += 1;
                } else if dl.peer.is_none() {
                    stats.orphaned += 1;
                } else {
                    stats.outstanding += 1;
                }
            }
        }
        stats
    }
}
