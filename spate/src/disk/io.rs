use {
    lru::LruCache,
    nix::sys::uio::{pread, pwrite},
    sha1::{Digest, Sha1},
    std::{
        collections::{BTreeMap, HashMap},
        fs::{self, File, OpenOptions},
        ops::Range,
        os::unix::io::AsRawFd,
        sync::{Arc, Mutex},
    },
    tokio::{sync::mpsc, task},
};

use {
    super::{
        error::*, Alert, AlertReceiver, AlertSender, Command, CommandReceiver,
        CommandSender, TorrentAlert, TorrentAlertReceiver, TorrentAlertSender,
        TorrentAllocation,
    },
    crate::{
        block_count, error::Error, storage_info::StorageInfo, Bitfield,
        BlockInfo, FileIndex, PieceIndex, Sha1Hash, TorrentId,
    },
};

/// The number of whole pieces kept in memory to serve upload block reads
/// without hitting the file system every time.
const READ_CACHE_PIECE_COUNT: usize = 64;

/// The entity responsible for saving downloaded file blocks to disk,
/// verifying whether downloaded pieces are valid, and reading blocks back
/// for uploads.
pub(super) struct Disk {
    /// Each torrent in the engine has a corresponding entry in this hashmap,
    /// which includes various metadata about the torrent and the torrent
    /// specific alert channel.
    torrents: HashMap<TorrentId, Torrent>,
    /// Port on which disk IO commands are received.
    cmd_port: CommandReceiver,
    /// Channel on which `Disk` sends alerts to the torrent engine.
    alert_chan: AlertSender,
}

impl Disk {
    /// Creates a new `Disk` instance and returns a command sender and an
    /// alert receiver.
    pub(super) fn new() -> Result<(Self, CommandSender, AlertReceiver), Error>
    {
        let (alert_chan, alert_port) = mpsc::unbounded_channel();
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        Ok((
            Self {
                torrents: HashMap::new(),
                cmd_port,
                alert_chan,
            },
            cmd_chan,
            alert_port,
        ))
    }

    /// Starts the disk event loop which is run until shutdown or an
    /// unrecoverable error occurs (e.g. mpsc channel failure).
    pub(super) async fn start(&mut self) -> Result<(), Error> {
        log::info!("Starting disk IO event loop");
        while let Some(cmd) = self.cmd_port.recv().await {
            match cmd {
                Command::NewTorrent {
                    id,
                    storage,
                    piece_hashes,
                } => {
                    if self.torrents.contains_key(&id) {
                        log::warn!("Torrent {} already allocated", id);
                        self.alert_chan.send(Alert::TorrentAllocation(Err(
                            NewTorrentError::AlreadyExists,
                        )))?;
                        continue;
                    }

                    // NOTE: do _not_ return on failure, we don't want to
                    // kill the disk task due to disk IO errors: we just want
                    // to log it and notify the engine of it
                    match Torrent::new(storage, piece_hashes) {
                        Ok((torrent, alert_port)) => {
                            log::info!("Torrent {} successfully allocated", id);
                            self.torrents.insert(id, torrent);
                            self.alert_chan.send(Alert::TorrentAllocation(
                                Ok(TorrentAllocation { id, alert_port }),
                            ))?;
                        }
                        Err(e) => {
                            log::warn!(
                                "Torrent {} allocation failure: {}",
                                id,
                                e
                            );
                            self.alert_chan
                                .send(Alert::TorrentAllocation(Err(e)))?;
                        }
                    }
                }
                Command::WriteBlock { id, block, data } => {
                    let torrent = self
                        .torrents
                        .get_mut(&id)
                        .ok_or(Error::InvalidTorrentId)?;
                    torrent.write_block(block, data).await?;
                }
                Command::ReadBlock {
                    id,
                    block,
                    result_chan,
                } => {
                    let torrent = self
                        .torrents
                        .get_mut(&id)
                        .ok_or(Error::InvalidTorrentId)?;
                    let result = torrent.read_block(block).await;
                    // the requesting session may be gone by now, which is
                    // not this task's concern
                    let _ = result_chan.send(result);
                }
                Command::Shutdown => {
                    log::info!("Shutting down disk event loop");
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Torrent information related to disk IO.
///
/// Contains the in-progress pieces (i.e. the write buffer), metadata about
/// the torrent's geometry, its file handles and the upload read cache.
struct Torrent {
    /// All information concerning this torrent's storage.
    info: StorageInfo,
    /// The channel used to alert a torrent that a piece has been completed
    /// and hash checked.
    alert_chan: TorrentAlertSender,
    /// The in-progress piece downloads and disk writes. This is the
    /// torrent's disk write buffer. Each piece is mapped to its index for
    /// faster lookups.
    write_buf: HashMap<PieceIndex, Piece>,
    /// Handles of all files in the torrent, opened in advance during torrent
    /// creation.
    ///
    /// Writer and reader tasks get exclusive access to a file through the
    /// mutex around each handle (hence the arc).
    files: Arc<Vec<Mutex<TorrentFile>>>,
    /// The concatenation of all expected piece hashes.
    piece_hashes: Vec<u8>,
    /// Which pieces have been fully written to disk (and hash verified).
    /// Only these may be read back for uploads.
    written: Bitfield,
    /// Complete pieces recently written or read, so that endgame and busy
    /// upload phases don't re-read the same piece over and over.
    read_cache: LruCache<PieceIndex, Arc<Vec<u8>>>,
    /// Disk IO statistics.
    stats: Stats,
}

impl Torrent {
    /// Creates the file system structure of the torrent and opens the file
    /// handles.
    fn new(
        info: StorageInfo,
        piece_hashes: Vec<u8>,
    ) -> Result<(Self, TorrentAlertReceiver), NewTorrentError> {
        let mut files = Vec::with_capacity(info.files.len());
        for file in info.files.iter() {
            let path = info.download_dir.join(&file.path);
            if path.exists() {
                log::warn!("Download path {:?} exists", path);
                return Err(NewTorrentError::Io(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "download path already exists",
                )));
            }
            if let Some(subdir) = path.parent() {
                if !subdir.exists() {
                    log::info!("Creating torrent subdir {:?}", subdir);
                    fs::create_dir_all(&subdir)?;
                }
            }
            let handle = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&path)
                .map_err(|e| {
                    log::warn!("Failed to open file {:?}", path);
                    NewTorrentError::Io(e)
                })?;
            files.push(Mutex::new(TorrentFile {
                info: crate::FileInfo {
                    path,
                    len: file.len,
                    torrent_offset: file.torrent_offset,
                },
                handle,
            }));
        }

        let (alert_chan, alert_port) = mpsc::unbounded_channel();
        let written = Bitfield::repeat(false, info.piece_count);

        Ok((
            Self {
                info,
                alert_chan,
                write_buf: HashMap::new(),
                files: Arc::new(files),
                piece_hashes,
                written,
                read_cache: LruCache::new(READ_CACHE_PIECE_COUNT),
                stats: Stats::default(),
            },
            alert_port,
        ))
    }

    async fn write_block(
        &mut self,
        block: BlockInfo,
        data: Vec<u8>,
    ) -> Result<(), Error> {
        log::trace!("Saving block {:?} to disk", block);

        let piece_index = block.piece_index;
        if !self.write_buf.contains_key(&piece_index) {
            if let Err(e) = self.start_new_piece(block) {
                log::warn!("Dropping block {:?}: {}", block, e);
                // invalid input from a peer shouldn't abort the disk task
                return Ok(());
            }
        }
        let piece = match self.write_buf.get_mut(&piece_index) {
            Some(piece) => piece,
            None => return Ok(()),
        };

        piece.enqueue_block(block.offset, data);

        // if the piece has all its blocks, we can hash it, and if it's
        // valid, save it to disk and clear its write buffer
        if !piece.is_complete() {
            return Ok(());
        }
        let piece = match self.write_buf.remove(&piece_index) {
            Some(piece) => piece,
            None => return Ok(()),
        };

        let piece_torrent_offset =
            piece_index as u64 * self.info.piece_len as u64;
        let files = Arc::clone(&self.files);
        let file_range = piece.files.clone();
        let expected_hash = piece.expected_hash;
        let bytes = piece.into_bytes();

        // don't block the reactor with the expensive hashing and the
        // synchronous file writing
        let write_result = task::spawn_blocking(move || {
            let mut hasher = Sha1::new();
            hasher.update(&bytes);
            let hash = hasher.finalize();
            if hash.as_slice() != expected_hash {
                return Ok((false, bytes));
            }
            write_piece(
                &bytes,
                piece_torrent_offset,
                &files[file_range.clone()],
            )?;
            Ok::<_, WriteError>((true, bytes))
        })
        .await
        // our code doesn't panic in the task so until better strategies
        // are devised, unwrap here
        .expect("disk IO write task panicked");

        let is_valid = match write_result {
            Ok((is_valid, bytes)) => {
                if is_valid {
                    log::info!("Piece {} is valid", piece_index);
                    self.stats.write_count += bytes.len() as u64;
                    self.written.set(piece_index, true);
                    self.read_cache.put(piece_index, Arc::new(bytes));
                } else {
                    log::warn!("Piece {} is NOT valid", piece_index);
                }
                is_valid
            }
            Err(e) => {
                // an IO failure is reported as an invalid piece so that the
                // torrent re-requests it rather than waiting forever
                log::error!("Failed to write piece {}: {}", piece_index, e);
                self.stats.write_failure_count += 1;
                false
            }
        };

        self.alert_chan.send(TorrentAlert::PieceCompletion {
            index: piece_index,
            is_valid,
        })?;

        Ok(())
    }

    /// Starts a new in-progress piece, creating metadata for it in self.
    ///
    /// This involves getting the expected hash of the piece, its length, and
    /// calculating the files that it intersects.
    fn start_new_piece(&mut self, block: BlockInfo) -> Result<(), WriteError> {
        log::trace!("Creating piece {} write buffer", block.piece_index);

        // get the position of the piece in the concatenated hash string
        let hash_pos = block.piece_index * 20;
        if hash_pos + 20 > self.piece_hashes.len() {
            log::warn!("Piece index {} is invalid", block.piece_index);
            return Err(WriteError::InvalidPieceIndex);
        }

        let hash_slice = &self.piece_hashes[hash_pos..hash_pos + 20];
        let mut expected_hash: Sha1Hash = [0; 20];
        expected_hash.copy_from_slice(hash_slice);
        log::debug!(
            "Piece {} expected hash {}",
            block.piece_index,
            hex::encode(&expected_hash)
        );

        let len = self
            .info
            .piece_len(block.piece_index)
            .map_err(|_| WriteError::InvalidPieceIndex)?;
        let files = self
            .info
            .files_intersecting_piece(block.piece_index)
            .map_err(|_| WriteError::InvalidPieceIndex)?;
        log::debug!(
            "Piece {} is {} bytes long, intersects files {:?}",
            block.piece_index,
            len,
            files
        );

        self.write_buf.insert(
            block.piece_index,
            Piece {
                expected_hash,
                len,
                blocks: BTreeMap::new(),
                files,
            },
        );

        Ok(())
    }

    /// Reads a block of an already downloaded piece, from the read cache if
    /// possible.
    async fn read_block(
        &mut self,
        block: BlockInfo,
    ) -> Result<Vec<u8>, ReadError> {
        log::trace!("Reading block {:?} from disk", block);

        let piece_len = self
            .info
            .piece_len(block.piece_index)
            .map_err(|_| ReadError::InvalidBlock)?;
        if block.offset + block.len > piece_len || block.len == 0 {
            return Err(ReadError::InvalidBlock);
        }
        if !self.written[block.piece_index] {
            return Err(ReadError::MissingPiece);
        }

        let range = block.offset as usize..(block.offset + block.len) as usize;
        if let Some(piece) = self.read_cache.get(&block.piece_index) {
            return Ok(piece[range].to_vec());
        }

        // cache miss: read back the whole piece so neighbouring block
        // requests are served from memory
        let piece_torrent_offset =
            block.piece_index as u64 * self.info.piece_len as u64;
        let file_range = self
            .info
            .files_intersecting_piece(block.piece_index)
            .map_err(|_| ReadError::InvalidBlock)?;
        let files = Arc::clone(&self.files);
        let piece = task::spawn_blocking(move || {
            read_piece(
                piece_len as usize,
                piece_torrent_offset,
                &files[file_range],
            )
        })
        .await
        .expect("disk IO read task panicked")?;

        self.stats.read_count += piece.len() as u64;
        let piece = Arc::new(piece);
        self.read_cache.put(block.piece_index, Arc::clone(&piece));
        Ok(piece[range].to_vec())
    }
}

/// Writes a whole piece across the files it intersects.
///
/// # Important
///
/// This performs sync IO and is thus potentially blocking and should be
/// executed on a thread pool and not the executor.
fn write_piece(
    bytes: &[u8],
    piece_torrent_offset: u64,
    files: &[Mutex<TorrentFile>],
) -> Result<(), WriteError> {
    debug_assert!(!files.is_empty());
    let mut written = 0;
    for file in files.iter() {
        let file = match file.lock() {
            Ok(file) => file,
            Err(_) => {
                return Err(WriteError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "file lock poisoned",
                )))
            }
        };
        let slice = file.info.get_slice(
            piece_torrent_offset + written as u64,
            (bytes.len() - written) as u64,
        );
        debug_assert!(slice.len > 0);
        let chunk = &bytes[written..written + slice.len as usize];
        file.write_at(chunk, slice.offset)?;
        written += slice.len as usize;
    }
    // the piece to file intersection calculation guarantees the files cover
    // the piece exactly
    debug_assert_eq!(written, bytes.len());
    Ok(())
}

/// Reads a whole piece back from the files it intersects.
///
/// # Important
///
/// Like [`write_piece`], this must run on the blocking thread pool.
fn read_piece(
    piece_len: usize,
    piece_torrent_offset: u64,
    files: &[Mutex<TorrentFile>],
) -> Result<Vec<u8>, ReadError> {
    let mut piece = vec![0; piece_len];
    let mut read = 0;
    for file in files.iter() {
        let file = match file.lock() {
            Ok(file) => file,
            Err(_) => {
                return Err(ReadError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "file lock poisoned",
                )))
            }
        };
        let slice = file.info.get_slice(
            piece_torrent_offset + read as u64,
            (piece_len - read) as u64,
        );
        let chunk = &mut piece[read..read + slice.len as usize];
        file.read_at(chunk, slice.offset)?;
        read += slice.len as usize;
    }
    debug_assert_eq!(read, piece_len);
    Ok(piece)
}

struct TorrentFile {
    info: crate::FileInfo,
    handle: File,
}

impl TorrentFile {
    /// Writes the whole buffer at the given file offset. IO syscalls are not
    /// guaranteed to write the entire input in one go, so this loops until
    /// all bytes are confirmed written (or an error occurs).
    fn write_at(
        &self,
        mut buf: &[u8],
        mut offset: u64,
    ) -> Result<(), WriteError> {
        while !buf.is_empty() {
            let write_count =
                pwrite(self.handle.as_raw_fd(), buf, offset as i64).map_err(
                    |e| {
                        log::warn!(
                            "File {:?} write error: {}",
                            self.info.path,
                            e
                        );
                        WriteError::Io(std::io::Error::last_os_error())
                    },
                )?;
            if write_count == 0 {
                return Err(WriteError::Io(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "failed to write whole block",
                )));
            }
            buf = &buf[write_count..];
            offset += write_count as u64;
        }
        Ok(())
    }

    /// The read counterpart of [`TorrentFile::write_at`].
    fn read_at(
        &self,
        mut buf: &mut [u8],
        mut offset: u64,
    ) -> Result<(), ReadError> {
        while !buf.is_empty() {
            let read_count =
                pread(self.handle.as_raw_fd(), buf, offset as i64).map_err(
                    |e| {
                        log::warn!(
                            "File {:?} read error: {}",
                            self.info.path,
                            e
                        );
                        ReadError::Io(std::io::Error::last_os_error())
                    },
                )?;
            if read_count == 0 {
                return Err(ReadError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "file ended before the block",
                )));
            }
            let tmp = buf;
            buf = &mut tmp[read_count..];
            offset += read_count as u64;
        }
        Ok(())
    }
}

#[derive(Default)]
struct Stats {
    /// The number of bytes successfully written to disk.
    write_count: u64,
    /// The number of bytes read back from disk (cache misses only).
    read_count: u64,
    /// The number of times we failed to write to disk.
    write_failure_count: usize,
}

/// An in-progress piece download that keeps in memory the so far downloaded
/// blocks and the expected hash of the piece.
struct Piece {
    /// The expected hash of the whole piece.
    expected_hash: Sha1Hash,
    /// The length of the piece, in bytes.
    len: u32,
    /// The so far downloaded blocks. Once the size of this map reaches the
    /// number of blocks in piece, the piece is complete and, if the hash is
    /// correct, saved to disk.
    ///
    /// Blocks are mapped to their offset within piece, and we're using
    /// a BTreeMap to keep the keys sorted, which gives us the piece's bytes
    /// by simple concatenation.
    blocks: BTreeMap<u32, Vec<u8>>,
    /// The files that this piece overlaps with, as a left-inclusive range of
    /// file indices.
    files: Range<FileIndex>,
}

impl Piece {
    /// Places the block into the piece's write buffer if it doesn't exist.
    fn enqueue_block(&mut self, offset: u32, data: Vec<u8>) {
        if self.blocks.contains_key(&offset) {
            log::warn!("Duplicate piece block at offset {}", offset);
        } else {
            self.blocks.insert(offset, data);
        }
    }

    /// Returns true if the piece has all its blocks in its write buffer.
    fn is_complete(&self) -> bool {
        self.blocks.len() == block_count(self.len)
    }

    /// Concatenates the piece's blocks into its final byte string.
    fn into_bytes(self) -> Vec<u8> {
        debug_assert!(self.is_complete());
        let mut bytes = Vec::with_capacity(self.len as usize);
        for block in self.blocks.values() {
            bytes.extend_from_slice(block);
        }
        bytes
    }
}
