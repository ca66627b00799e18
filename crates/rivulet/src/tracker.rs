//! A tracker is a server that knows which peers have which torrents.
//!
//! Only HTTP(S) trackers are supported: one GET announce with the info hash
//! returns a compact list of peer addresses.

use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    time::Duration,
};

use bendy::decoding::{self, FromBencode, Object, ResultExt};
use rand::{distributions::Alphanumeric, Rng};
use reqwest::Client;
use tracing::{debug, info, warn};

use crate::{error::Error, metainfo::InfoHash, peer::PeerId};

/// Prefix of our peer id, client code and version.
pub const CLIENT_PREFIX: &[u8; 8] = b"-RV0001-";

static ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(15);

/// Response of an announce request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AnnounceResponse {
    /// Seconds the tracker wants us to wait before the next announce.
    pub interval: u32,
    pub peers: Vec<SocketAddr>,
    /// Number of seeders.
    pub complete: Option<u32>,
    /// Number of leechers.
    pub incomplete: Option<u32>,
}

/// Raw decoded response, `peers` is still the compact string.
#[derive(Debug, Default)]
struct RawResponse {
    failure_reason: Option<String>,
    interval: Option<u32>,
    peers: Option<Vec<u8>>,
    complete: Option<u32>,
    incomplete: Option<u32>,
}

impl FromBencode for RawResponse {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error>
    where
        Self: Sized,
    {
        let mut res = RawResponse::default();

        let mut dict_dec = object.try_into_dictionary()?;
        while let Some(pair) = dict_dec.next_pair()? {
            match pair {
                (b"failure reason", value) => {
                    res.failure_reason = String::decode_bencode_object(value)
                        .context("failure reason")
                        .map(Some)?;
                }
                (b"interval", value) => {
                    res.interval = u32::decode_bencode_object(value)
                        .context("interval")
                        .map(Some)?;
                }
                (b"peers", value) => {
                    // the dictionary model of peers is not supported, we
                    // always ask for the compact one.
                    res.peers = value
                        .try_into_bytes()
                        .context("peers")
                        .map(|bytes| Some(bytes.to_vec()))?;
                }
                (b"complete", value) => {
                    res.complete = u32::decode_bencode_object(value)
                        .context("complete")
                        .map(Some)?;
                }
                (b"incomplete", value) => {
                    res.incomplete = u32::decode_bencode_object(value)
                        .context("incomplete")
                        .map(Some)?;
                }
                _ => {}
            }
        }

        Ok(res)
    }
}

impl AnnounceResponse {
    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        let raw = RawResponse::from_bencode(buf)?;

        if let Some(reason) = raw.failure_reason {
            return Err(Error::Tracker(reason));
        }

        let peers = parse_compact_peers(raw.peers.as_deref().unwrap_or_default())?
            .into_iter()
            .map(SocketAddr::V4)
            .collect();

        Ok(Self {
            interval: raw.interval.unwrap_or_default(),
            peers,
            complete: raw.complete,
            incomplete: raw.incomplete,
        })
    }
}

/// In the compact format each peer takes 6 bytes, 4 for the ip and 2 for
/// the port, both big-endian.
pub fn parse_compact_peers(buf: &[u8]) -> Result<Vec<SocketAddrV4>, Error> {
    let chunks = buf.chunks_exact(6);
    if !chunks.remainder().is_empty() {
        return Err(Error::TrackerCompactPeerList);
    }

    Ok(chunks
        .map(|hostport| {
            let (ip, port) = hostport.split_at(4);
            let ip = Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3]);
            let port = u16::from_be_bytes([port[0], port[1]]);
            SocketAddrV4::new(ip, port)
        })
        .collect())
}

#[derive(Debug, Clone)]
pub struct Tracker {
    client: Client,
    pub peer_id: PeerId,
    pub port: u16,
}

impl Tracker {
    pub fn new(peer_id: PeerId, port: u16) -> Result<Self, Error> {
        let client = Client::builder().timeout(ANNOUNCE_TIMEOUT).build()?;
        Ok(Self { client, peer_id, port })
    }

    /// A new peer id, [`CLIENT_PREFIX`] followed by 12 random alphanumeric
    /// characters.
    pub fn gen_peer_id() -> PeerId {
        let mut peer_id = [0u8; 20];
        peer_id[..8].copy_from_slice(CLIENT_PREFIX);

        for (byte, random) in peer_id[8..]
            .iter_mut()
            .zip(rand::thread_rng().sample_iter(&Alphanumeric))
        {
            *byte = random;
        }

        PeerId::from(peer_id)
    }

    /// Url of the announce request. Binary values are percent-encoded.
    pub fn announce_url(&self, url: &str, info_hash: &InfoHash, left: u64) -> String {
        let separator = if url.contains('?') { '&' } else { '?' };

        format!(
            "{url}{separator}info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&compact=1&left={left}",
            urlencoding::encode_binary(&info_hash.0),
            urlencoding::encode_binary(self.peer_id.as_ref()),
            self.port,
        )
    }

    /// Announce to one tracker that we want `left` bytes of the torrent.
    pub async fn announce(
        &self,
        url: &str,
        info_hash: &InfoHash,
        left: u64,
    ) -> Result<AnnounceResponse, Error> {
        debug!("announcing to {url}");

        let res = self
            .client
            .get(self.announce_url(url, info_hash, left))
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        let res = AnnounceResponse::from_bytes(&res)?;
        debug!("{url} answered with {} peers, interval {}", res.peers.len(), res.interval);

        Ok(res)
    }

    /// Try the trackers in order until one answers with at least one peer.
    pub async fn announce_any(
        &self,
        urls: &[String],
        info_hash: &InfoHash,
        left: u64,
    ) -> Result<AnnounceResponse, Error> {
        for url in urls {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                warn!("skipping tracker {url}, only http is supported");
                continue;
            }

            match self.announce(url, info_hash, left).await {
                Ok(res) if !res.peers.is_empty() => {
                    info!("tracker {url} gave {} peers", res.peers.len());
                    return Ok(res);
                }
                Ok(_) => warn!("tracker {url} has no peers"),
                Err(e) => warn!("tracker {url} failed: {e}"),
            }
        }

        Err(Error::TrackerNoPeers)
    }
}
