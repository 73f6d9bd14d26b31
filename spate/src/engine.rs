//! The engine ties the pieces together: it allocates the torrent on disk,
//! binds the peer listener, and drives the torrent session to a verified
//! complete download.

use std::{sync::Arc, time::Instant};

use tokio::{net::TcpListener, sync::RwLock};
use url::Url;

use crate::{
    conf::Conf,
    disk::{self, Alert},
    error::*,
    metainfo::Metainfo,
    scheduler::Scheduler,
    storage_info::StorageInfo,
    torrent::{Torrent, TorrentContext},
    tracker::Tracker,
    TorrentId,
};

/// Downloads the torrent described by the metainfo to completion, seeding
/// while it runs. Returns once every piece has been downloaded and hash
/// verified, or on a fatal startup error.
pub async fn download(conf: Conf, metainfo: Metainfo) -> Result<()> {
    let info_hash = metainfo.create_info_hash()?;
    log::info!(
        "Starting torrent {} (info hash {})",
        metainfo.info.name,
        hex::encode(&info_hash)
    );

    let announce_url = Url::parse(&metainfo.announce).map_err(|e| {
        Error::Tracker(format!(
            "invalid announce url {}: {}",
            metainfo.announce, e
        ))
    })?;

    let storage =
        StorageInfo::new(&metainfo, conf.torrent.download_dir.clone());
    log::info!(
        "Torrent geometry: {} bytes, {} pieces of {} bytes",
        storage.download_len,
        storage.piece_count,
        storage.piece_len
    );

    // the disk task and the torrent's on disk allocation
    let (disk, mut disk_alert_port) = disk::spawn()?;
    let id: TorrentId = 0;
    disk.allocate_new_torrent(
        id,
        storage.clone(),
        metainfo.info.pieces.to_vec(),
    )?;
    let torrent_alert_port = match disk_alert_port.recv().await {
        Some(Alert::TorrentAllocation(Ok(allocation))) => {
            debug_assert_eq!(allocation.id, id);
            allocation.alert_port
        }
        Some(Alert::TorrentAllocation(Err(e))) => return Err(e.into()),
        None => return Err(Error::ChannelClosed),
    };

    // bind before the first announce so the advertised port is already open
    // for inbound peers
    let listener = TcpListener::bind(conf.engine.listen_addr).await?;
    let listen_addr = listener.local_addr()?;
    log::info!("Listening for peers on {}", listen_addr);

    let ctx = Arc::new(TorrentContext {
        id,
        info_hash,
        client_id: conf.engine.client_id,
        scheduler: RwLock::new(Scheduler::new(&storage)),
        storage,
        disk: disk.clone(),
        run_started: Instant::now(),
    });

    let mut torrent =
        Torrent::new(ctx, conf.torrent, Tracker::new(announce_url), listen_addr);
    let result = torrent.run(listener, torrent_alert_port).await;

    let _ = disk.shutdown();
    result
}
