use std::io;

use thiserror::Error;

use crate::error::Error;

/// Error type returned on failed torrent allocations.
#[derive(Debug, Error)]
pub(crate) enum NewTorrentError {
    /// The torrent entry already exists in the disk task.
    #[error("torrent already allocated")]
    AlreadyExists,
    /// IO error while allocating the torrent's files.
    #[error("disk IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<NewTorrentError> for Error {
    fn from(e: NewTorrentError) -> Self {
        match e {
            NewTorrentError::AlreadyExists => Self::InvalidTorrentId,
            NewTorrentError::Io(e) => Self::Io(e),
        }
    }
}

/// Error type returned on failed block writes.
#[derive(Debug, Error)]
pub(crate) enum WriteError {
    /// The block is referring to an invalid piece.
    #[error("invalid piece index")]
    InvalidPieceIndex,
    /// IO error while writing the piece to disk.
    #[error("disk IO error: {0}")]
    Io(#[from] io::Error),
}

/// Error type returned on failed block reads.
#[derive(Debug, Error)]
pub(crate) enum ReadError {
    /// The block is referring to an invalid piece or an invalid range within
    /// a valid piece.
    #[error("invalid block")]
    InvalidBlock,
    /// The piece the block is in has not been downloaded yet.
    #[error("piece not on disk")]
    MissingPiece,
    /// IO error while reading the piece from disk.
    #[error("disk IO error: {0}")]
    Io(#[from] io::Error),
}
