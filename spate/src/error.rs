use std::io;

use thiserror::Error;

use crate::PieceIndex;

/// The result type used by the whole crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The crate wide error type.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The .torrent file could not be decoded or is missing required fields.
    #[error("invalid metainfo: {0}")]
    InvalidMetainfo(&'static str),

    /// Error while bencoding or bedecoding.
    #[error("bencode error: {0}")]
    Bencode(#[from] serde_bencode::Error),

    /// IO error on a socket or a torrent file.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The peer's handshake advertised a torrent we are not serving.
    #[error("peer handshake contains invalid info hash")]
    InvalidPeerInfoHash,

    /// The peer broke the wire protocol (bad frame length, bad message
    /// payload, out of range piece index or offset).
    #[error("peer protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// A piece index outside the torrent was used.
    #[error("invalid piece index {0}")]
    InvalidPieceIndex(PieceIndex),

    /// A disk command referred to a torrent the disk task doesn't know about.
    #[error("invalid torrent id")]
    InvalidTorrentId,

    /// The download path already exists, refusing to clobber it.
    #[error("download path {0} already exists")]
    DownloadPathExists(String),

    /// The announce url could not be parsed or the tracker's response was not
    /// usable.
    #[error("tracker error: {0}")]
    Tracker(String),

    /// HTTP level failure while talking to the tracker.
    #[error("tracker HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// One half of a channel between two tasks was dropped while the other
    /// side still needed it. This only happens during engine teardown.
    #[error("engine channel closed")]
    ChannelClosed,
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::ChannelClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Self::ChannelClosed
    }
}
