//! The piece store: a task that owns the torrent's file handles, buffers
//! in-progress pieces, verifies completed pieces against their expected
//! hashes, and serves block reads for uploads.
//!
//! Communication is over channels: commands flow in, a global alert channel
//! reports torrent allocations, and each allocated torrent gets its own
//! alert channel on which piece completions are reported.

pub(crate) mod error;
mod io;

use tokio::{
    sync::{mpsc, oneshot},
    task,
};

use {
    crate::{error::*, storage_info::StorageInfo, BlockInfo, TorrentId},
    error::*,
    io::Disk,
};

pub(crate) type CommandSender = mpsc::UnboundedSender<Command>;
pub(crate) type CommandReceiver = mpsc::UnboundedReceiver<Command>;

pub(crate) type AlertSender = mpsc::UnboundedSender<Alert>;
pub(crate) type AlertReceiver = mpsc::UnboundedReceiver<Alert>;

pub(crate) type TorrentAlertSender = mpsc::UnboundedSender<TorrentAlert>;
pub(crate) type TorrentAlertReceiver = mpsc::UnboundedReceiver<TorrentAlert>;

/// The commands the disk task accepts.
pub(crate) enum Command {
    /// Allocate a new torrent: create and open its files and set up its
    /// piece bookkeeping. Answered on the global alert channel.
    NewTorrent {
        id: TorrentId,
        storage: StorageInfo,
        piece_hashes: Vec<u8>,
    },
    /// Write a downloaded block to the torrent's write buffer, flushing and
    /// hash verifying the piece once all its blocks are present.
    WriteBlock {
        id: TorrentId,
        block: BlockInfo,
        data: Vec<u8>,
    },
    /// Read back a block of an already verified piece, for an upload.
    ReadBlock {
        id: TorrentId,
        block: BlockInfo,
        result_chan: oneshot::Sender<Result<Vec<u8>, ReadError>>,
    },
    /// Shut the disk task down.
    Shutdown,
}

/// Alerts the disk task sends the engine.
pub(crate) enum Alert {
    TorrentAllocation(Result<TorrentAllocation, NewTorrentError>),
}

/// The result of a successful torrent allocation.
pub(crate) struct TorrentAllocation {
    pub id: TorrentId,
    /// The channel on which the torrent receives its piece completions.
    pub alert_port: TorrentAlertReceiver,
}

/// Alerts the disk task sends a single torrent.
#[derive(Debug)]
pub(crate) enum TorrentAlert {
    /// All blocks of the piece arrived and the piece was hash checked. If
    /// the hash matched, the piece is on disk by the time this alert is
    /// sent.
    PieceCompletion {
        index: crate::PieceIndex,
        is_valid: bool,
    },
}

/// Spawns the disk task, returning a cloneable handle to it and the global
/// alert port.
pub(crate) fn spawn() -> Result<(DiskHandle, AlertReceiver)> {
    log::info!("Spawning disk IO task");
    let (mut disk, cmd_chan, alert_port) = Disk::new()?;
    task::spawn(async move {
        if let Err(e) = disk.start().await {
            log::error!("Disk task failed: {}", e);
        }
    });
    log::info!("Disk IO task spawned");
    Ok((DiskHandle(cmd_chan), alert_port))
}

/// The handle through which the rest of the engine talks to the disk task.
#[derive(Clone)]
pub(crate) struct DiskHandle(CommandSender);

impl DiskHandle {
    /// Instructs the disk task to set up everything needed for a new
    /// torrent. The result arrives on the global alert channel.
    pub fn allocate_new_torrent(
        &self,
        id: TorrentId,
        storage: StorageInfo,
        piece_hashes: Vec<u8>,
    ) -> Result<()> {
        self.0.send(Command::NewTorrent {
            id,
            storage,
            piece_hashes,
        })?;
        Ok(())
    }

    /// Queues a block for writing, without waiting for the write to go
    /// through. The eventual piece completion is reported on the torrent's
    /// alert channel.
    pub fn write_block(
        &self,
        id: TorrentId,
        block: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        self.0.send(Command::WriteBlock { id, block, data })?;
        Ok(())
    }

    /// Reads a block of a downloaded piece back from disk (or the read
    /// cache).
    pub async fn read_block(
        &self,
        id: TorrentId,
        block: BlockInfo,
    ) -> Result<std::result::Result<Vec<u8>, ReadError>> {
        let (result_chan, result_port) = oneshot::channel();
        self.0.send(Command::ReadBlock {
            id,
            block,
            result_chan,
        })?;
        Ok(result_port.await?)
    }

    /// Shuts the disk task down.
    pub fn shutdown(&self) -> Result<()> {
        self.0.send(Command::Shutdown)?;
        Ok(())
    }
}
