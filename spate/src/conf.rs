//! This module defines types used to configure the engine and its parts.

use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use crate::PeerId;

/// The default spate client id.
pub const SPATE_CLIENT_ID: &PeerId = b"spt-0000000000000000";

/// The port peers are accepted on when neither the environment nor the
/// configuration overrides it.
pub const DEFAULT_PORT: u16 = 6668;

/// The environment variable consulted for the listen port.
pub const PORT_ENV_VAR: &str = "SPATE_PORT";

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the configuration with reasonable defaults, except for the
    /// download directory, as it is not sensible to guess that for the user.
    /// It uses the default spate client id, [`SPATE_CLIENT_ID`].
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf {
                client_id: *SPATE_CLIENT_ID,
                listen_addr: SocketAddr::new(
                    Ipv4Addr::UNSPECIFIED.into(),
                    port_from_env(),
                ),
            },
            torrent: TorrentConf::new(download_dir),
        }
    }
}

/// Reads the listen port from the environment, falling back to
/// [`DEFAULT_PORT`] when unset or unparsable.
fn port_from_env() -> u16 {
    std::env::var(PORT_ENV_VAR)
        .ok()
        .and_then(|port| port.parse().ok())
        .unwrap_or(DEFAULT_PORT)
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,
    /// The address inbound peer connections are accepted on.
    pub listen_addr: SocketAddr,
}

/// Configuration for a torrent.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which a torrent's files are placed upon download and
    /// from which they are seeded.
    pub download_dir: PathBuf,

    /// The number of peers we try to keep connected to at all times. Falling
    /// under this triggers a supplementary tracker announce.
    pub wanted_peer_count: usize,

    /// The max number of connected peers the torrent should have.
    pub max_connected_peer_count: usize,

    /// If the tracker doesn't provide an announce interval, we default to
    /// announcing every 30 minutes.
    pub announce_interval: Duration,

    /// The floor on how often supplementary (peer top-up) announces may be
    /// sent.
    pub min_announce_interval: Duration,

    /// A peer that hasn't sent anything for this long is marked dead by the
    /// next scheduler tick.
    pub peer_inactivity_threshold: Duration,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            // We always want at least 10 peers as anything less is a waste
            // of a network round trip and it allows us to buffer up a bit more
            // than needed.
            wanted_peer_count: 10,
            // This value is mostly picked for performance while keeping in
            // mind not to overwhelm the host.
            max_connected_peer_count: 50,
            announce_interval: Duration::from_secs(30 * 60),
            min_announce_interval: Duration::from_secs(30),
            peer_inactivity_threshold: Duration::from_secs(10),
        }
    }
}
