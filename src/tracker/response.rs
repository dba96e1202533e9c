use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// The lifecycle event carried by a tracker request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerEvent {
    None,
    Started,
    Stopped,
    Completed,
    Scrape,
}

impl TrackerEvent {
    /// The HTTP `event` query value; empty for events that send none.
    pub fn as_query_str(&self) -> &'static str {
        match self {
            TrackerEvent::Started => "started",
            TrackerEvent::Stopped => "stopped",
            TrackerEvent::Completed => "completed",
            TrackerEvent::None | TrackerEvent::Scrape => "",
        }
    }

    /// The BEP-15 announce event id.
    pub fn as_udp_id(&self) -> u32 {
        match self {
            TrackerEvent::None | TrackerEvent::Scrape => 0,
            TrackerEvent::Completed => 1,
            TrackerEvent::Started => 2,
            TrackerEvent::Stopped => 3,
        }
    }

    /// Bit index for event bitmaps (close/disown filtering).
    pub fn bit(&self) -> u32 {
        match self {
            TrackerEvent::None => 0,
            TrackerEvent::Started => 1,
            TrackerEvent::Stopped => 2,
            TrackerEvent::Completed => 3,
            TrackerEvent::Scrape => 4,
        }
    }
}

/// Everything a protocol client needs to issue one announce.
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub url: String,
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: TrackerEvent,
    pub key: u32,
    pub numwant: i32,
    pub tracker_id: Option<String>,
    /// Explicit address to report to the tracker, when configured.
    pub local_ip: Option<IpAddr>,
}

#[derive(Debug, Clone, Default)]
pub struct AnnounceResponse {
    pub interval: Option<u32>,
    pub min_interval: Option<u32>,
    pub tracker_id: Option<String>,
    /// Seeder count, when reported.
    pub complete: Option<u32>,
    /// Leecher count, when reported.
    pub incomplete: Option<u32>,
    pub downloaded: Option<u32>,
    pub peers: Vec<SocketAddr>,
    pub peers6: Vec<SocketAddr>,
}

impl AnnounceResponse {
    pub fn all_peers(&self) -> impl Iterator<Item = &SocketAddr> {
        self.peers.iter().chain(self.peers6.iter())
    }

    /// True when any adoptable field besides the peer lists is set.
    pub fn has_fields(&self) -> bool {
        self.interval.is_some()
            || self.min_interval.is_some()
            || self.tracker_id.is_some()
            || self.complete.is_some()
            || self.incomplete.is_some()
            || self.downloaded.is_some()
    }
}

/// Aggregate swarm statistics from a scrape.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScrapeResponse {
    pub complete: u32,
    pub incomplete: u32,
    pub downloaded: u32,
}

/// Parses 6-byte compact IPv4 peer tuples (BEP-23). A trailing partial
/// tuple is ignored.
pub fn parse_compact_peers(data: &[u8]) -> Vec<SocketAddr> {
    data.chunks_exact(6)
        .map(|c| {
            let ip = Ipv4Addr::new(c[0], c[1], c[2], c[3]);
            let port = u16::from_be_bytes([c[4], c[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .collect()
}

/// Parses 18-byte compact IPv6 peer tuples.
pub fn parse_compact_peers6(data: &[u8]) -> Vec<SocketAddr> {
    data.chunks_exact(18)
        .map(|c| {
            let mut ip = [0u8; 16];
            ip.copy_from_slice(&c[..16]);
            let port = u16::from_be_bytes([c[16], c[17]]);
            SocketAddr::new(IpAddr::V6(Ipv6Addr::from(ip)), port)
        })
        .collect()
}
