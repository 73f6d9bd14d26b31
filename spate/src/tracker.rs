//! The announce client: builds the tracker GET request, decodes the
//! bencoded response and hands the torrent a fresh peer list.

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use reqwest::Client;
use url::Url;
use serde_bytes::ByteBuf;

use crate::{error::*, PeerId, Sha1Hash};

/// If the tracker response has no interval field, the next periodic
/// announce happens after this long.
pub(crate) const DEFAULT_ANNOUNCE_INTERVAL: Duration =
    Duration::from_secs(1800);

/// The optional announce event.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Event {
    /// The first announce of a download.
    Started,
    /// Sent once, when the download verifies complete.
    Completed,
    /// Sent when the client shuts down.
    Stopped,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Started => write!(f, "started"),
            Self::Completed => write!(f, "completed"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// The parameters of an announce.
#[derive(Clone, Debug)]
pub(crate) struct AnnounceParams {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
    /// The port we accept peer connections on.
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: Option<Event>,
    /// How many peers we'd like from the tracker.
    pub peer_count: Option<usize>,
    /// Our own address, if explicitly configured, for the `ip` parameter.
    pub ip: Option<IpAddr>,
    /// An opaque session key proving our identity across ip changes.
    pub key: Option<String>,
    /// The tracker id a previous response of this tracker handed us.
    pub tracker_id: Option<String>,
}

/// What the torrent consumes from a tracker response.
#[derive(Debug)]
pub(crate) struct AnnounceResult {
    /// How long to wait until the next periodic announce.
    pub interval: Duration,
    /// A floor on announce frequency, if the tracker states one.
    pub min_interval: Option<Duration>,
    /// The tracker id to echo in future announces, if any.
    pub tracker_id: Option<String>,
    /// The swarm as the tracker sees it.
    pub peers: Vec<SocketAddr>,
}

/// The deserialized announce response. Only the fields the engine consumes
/// are decoded; everything else in the dictionary is ignored.
#[derive(Deserialize)]
struct Response {
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    interval: Option<u64>,
    #[serde(rename = "min interval")]
    min_interval: Option<u64>,
    #[serde(rename = "tracker id")]
    tracker_id: Option<String>,
    peers: Option<Peers>,
}

/// Trackers send the swarm either in the compact form (6 bytes per peer) or
/// as a list of dictionaries.
#[derive(Deserialize)]
#[serde(untagged)]
enum Peers {
    Compact(ByteBuf),
    Dicts(Vec<DictPeer>),
}

#[derive(Deserialize)]
struct DictPeer {
    ip: String,
    port: u16,
}

#[derive(Clone)]
pub(crate) struct Tracker {
    client: Client,
    announce_url: Url,
}

impl Tracker {
    pub fn new(announce_url: Url) -> Self {
        Self {
            client: Client::new(),
            announce_url,
        }
    }

    /// Sends an announce to the tracker and decodes its response.
    ///
    /// Tracker failures are not fatal to the session: the caller logs them
    /// and retries after the announce interval.
    pub async fn announce(
        &self,
        params: AnnounceParams,
    ) -> Result<AnnounceResult> {
        // The info hash and peer id have to be escaped byte by byte, which
        // query parameter serializers get wrong (they would escape the
        // percent signs of pre-escaped input), so the two are baked into
        // the url by hand.
        let mut url = format!(
            "{url}{sep}info_hash={info_hash}&peer_id={peer_id}",
            url = self.announce_url,
            sep = if self.announce_url.query().is_some() {
                '&'
            } else {
                '?'
            },
            info_hash = urlencode_bytes(&params.info_hash),
            peer_id = urlencode_bytes(&params.peer_id),
        );

        let mut query = vec![
            ("port", params.port.to_string()),
            ("uploaded", params.uploaded.to_string()),
            ("downloaded", params.downloaded.to_string()),
            ("left", params.left.to_string()),
            ("compact", "1".to_string()),
        ];
        if let Some(event) = params.event {
            query.push(("event", event.to_string()));
        }
        if let Some(ip) = &params.ip {
            query.push(("ip", ip.to_string()));
        }
        if let Some(peer_count) = params.peer_count {
            query.push(("numwant", peer_count.to_string()));
        }
        if let Some(key) = &params.key {
            query.push(("key", key.clone()));
        }
        if let Some(tracker_id) = &params.tracker_id {
            query.push(("trackerid", tracker_id.clone()));
        }
        for (name, value) in query {
            url.push('&');
            url.push_str(name);
            url.push('=');
            url.push_str(&value);
        }

        log::debug!("Sending announce: {}", url);
        let resp = self.client.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Tracker(format!(
                "tracker returned HTTP {}",
                status
            )));
        }

        let body = resp.bytes().await?;
        let resp: Response = serde_bencode::from_bytes(&body)?;
        if let Some(reason) = resp.failure_reason {
            return Err(Error::Tracker(reason));
        }

        let peers = match resp.peers {
            Some(peers) => decode_peers(peers)?,
            None => {
                return Err(Error::Tracker(
                    "response has no peers field".to_string(),
                ));
            }
        };

        Ok(AnnounceResult {
            interval: resp
                .interval
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_ANNOUNCE_INTERVAL),
            min_interval: resp.min_interval.map(Duration::from_secs),
            tracker_id: resp.tracker_id,
            peers,
        })
    }
}

/// Escapes every byte as `%xx`, producing exactly three characters per
/// input byte.
fn urlencode_bytes(bytes: &[u8]) -> String {
    let mut encoded = String::with_capacity(3 * bytes.len());
    for byte in bytes {
        encoded.push('%');
        encoded.push_str(&hex::encode([*byte]));
    }
    encoded
}

/// Decodes either form of the tracker's peer list.
fn decode_peers(peers: Peers) -> Result<Vec<SocketAddr>> {
    match peers {
        Peers::Compact(bytes) => {
            if bytes.len() % 6 != 0 {
                return Err(Error::Tracker(format!(
                    "compact peer string of invalid length {}",
                    bytes.len()
                )));
            }
            Ok(bytes
                .chunks_exact(6)
                .map(|chunk| {
                    let ip = Ipv4Addr::new(
                        chunk[0], chunk[1], chunk[2], chunk[3],
                    );
                    let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                    SocketAddr::new(ip.into(), port)
                })
                .collect())
        }
        Peers::Dicts(dicts) => Ok(dicts
            .into_iter()
            .filter_map(|peer| match peer.ip.parse::<IpAddr>() {
                Ok(ip) => Some(SocketAddr::new(ip, peer.port)),
                Err(_) => {
                    log::warn!("Skipping unparsable peer ip {}", peer.ip);
                    None
                }
            })
            .collect()),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn params() -> AnnounceParams {
        AnnounceParams {
            info_hash: [0x01; 20],
            peer_id: *b"spt-0000000000000000",
            port: 6668,
            uploaded: 0,
            downloaded: 0,
            left: 1234,
            event: Some(Event::Started),
            peer_count: Some(50),
            ip: None,
            key: None,
            tracker_id: None,
        }
    }

    #[test]
    fn test_urlencode_escapes_every_byte() {
        let info_hash: Sha1Hash = [
            0x00, 0x01, 0x9f, 0xd2, 0x5a, 0x41, 0x61, 0x62, 0x7a, 0x30,
            0x39, 0xff, 0x20, 0x25, 0x26, 0x3d, 0x7e, 0x2d, 0x5f, 0x2e,
        ];
        let encoded = urlencode_bytes(&info_hash);
        // three ASCII characters per byte, no exceptions
        assert_eq!(encoded.len(), 60);
        assert!(encoded.is_ascii());
        assert!(encoded.starts_with("%00%01%9f"));
        assert!(encoded.ends_with("%2d%5f%2e"));
    }

    #[test]
    fn test_decode_compact_peers() {
        let blob: Vec<u8> = vec![
            10, 0, 0, 1, 0x1a, 0x0c, // 10.0.0.1:6668
            192, 168, 1, 9, 0x1a, 0xe1, // 192.168.1.9:6881
        ];
        let peers = decode_peers(Peers::Compact(ByteBuf::from(blob))).unwrap();
        assert_eq!(
            peers,
            vec![
                "10.0.0.1:6668".parse().unwrap(),
                "192.168.1.9:6881".parse().unwrap(),
            ]
        );

        // a truncated blob is rejected
        assert!(decode_peers(Peers::Compact(ByteBuf::from(vec![1, 2, 3])))
            .is_err());
    }

    #[tokio::test]
    async fn test_announce_with_compact_peers() {
        let mut body = Vec::new();
        body.extend_from_slice(b"d8:intervali900e5:peers12:");
        body.extend_from_slice(&[10, 0, 0, 1, 0x1a, 0x0c]);
        body.extend_from_slice(&[10, 0, 0, 2, 0x1a, 0x0c]);
        body.extend_from_slice(b"e");

        let mock = mockito::mock("GET", "/announce-compact")
            .match_query(mockito::Matcher::AllOf(vec![
                mockito::Matcher::Regex("info_hash=%01%01".to_string()),
                mockito::Matcher::Regex("compact=1".to_string()),
                mockito::Matcher::Regex("event=started".to_string()),
                mockito::Matcher::Regex("left=1234".to_string()),
            ]))
            .with_status(200)
            .with_body(body)
            .create();

        let url =
            Url::parse(&format!("{}/announce-compact", mockito::server_url()))
                .unwrap();
        let result = Tracker::new(url).announce(params()).await.unwrap();

        mock.assert();
        assert_eq!(result.interval, Duration::from_secs(900));
        assert_eq!(
            result.peers,
            vec![
                "10.0.0.1:6668".parse().unwrap(),
                "10.0.0.2:6668".parse().unwrap(),
            ]
        );
    }

    #[tokio::test]
    async fn test_announce_with_dict_peers_and_default_interval() {
        let body = b"d5:peersl\
            d2:ip8:10.0.0.34:porti6881ee\
            d2:ip8:10.0.0.44:porti6882ee\
            ee"
        .to_vec();

        let _mock = mockito::mock("GET", "/announce")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(body)
            .create();

        let url =
            Url::parse(&format!("{}/announce", mockito::server_url()))
                .unwrap();
        let result = Tracker::new(url).announce(params()).await.unwrap();

        // no interval field: the default applies
        assert_eq!(result.interval, DEFAULT_ANNOUNCE_INTERVAL);
        assert_eq!(
            result.peers,
            vec![
                "10.0.0.3:6881".parse().unwrap(),
                "10.0.0.4:6882".parse().unwrap(),
            ]
        );
    }

    #[tokio::test]
    async fn test_announce_failure_reason() {
        let _mock = mockito::mock("GET", "/announce")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(b"d14:failure reason12:unregisterede".to_vec())
            .create();

        let url =
            Url::parse(&format!("{}/announce", mockito::server_url()))
                .unwrap();
        let result = Tracker::new(url).announce(params()).await;
        assert!(matches!(result, Err(Error::Tracker(_))));
    }

    #[tokio::test]
    async fn test_announce_http_error() {
        let _mock = mockito::mock("GET", "/announce")
            .match_query(mockito::Matcher::Any)
            .with_status(500)
            .with_body("tracker exploded")
            .create();

        let url =
            Url::parse(&format!("{}/announce", mockito::server_url()))
                .unwrap();
        let result = Tracker::new(url).announce(params()).await;
        assert!(matches!(result, Err(Error::Tracker(_))));
    }
}
