use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use rand::Rng as _;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::timeout_at;
use tracing::{debug, trace};

use super::error::TrackerError;
use super::response::{parse_compact_peers, AnnounceRequest, AnnounceResponse};
use crate::constants::{UDP_ANNOUNCE_SIZE, UDP_CONNECT_SIZE, UDP_TRACKER_MAGIC};

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

/// Runs one full BEP-15 exchange: resolve, connect, announce.
///
/// Each phase sends its packet and waits `timeout`; on expiry the packet is
/// resent until `tries` attempts are exhausted, which fails the tracker.
/// Replies with a foreign transaction id or action are ignored while the
/// clock runs.
pub async fn announce(
    req: &AnnounceRequest,
    bind_ip: Option<IpAddr>,
    timeout: Duration,
    tries: u32,
) -> Result<AnnounceResponse, TrackerError> {
    let (host, port) = parse_udp_url(&req.url)?;

    let addr = lookup_host((host.as_str(), port))
        .await
        .map_err(|_| TrackerError::Resolve(host.clone()))?
        .next()
        .ok_or_else(|| TrackerError::Resolve(host.clone()))?;

    debug!(%addr, url = %req.url, "udp announce");

    let bind: SocketAddr = match (bind_ip, addr) {
        (Some(ip), _) => (ip, 0).into(),
        (None, SocketAddr::V4(_)) => "0.0.0.0:0".parse().unwrap(),
        (None, SocketAddr::V6(_)) => "[::]:0".parse().unwrap(),
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(addr).await?;

    // Connect phase.
    let txid: u32 = rand::rng().random();
    let reply = exchange(
        &socket,
        &build_connect(txid),
        ACTION_CONNECT,
        txid,
        UDP_CONNECT_SIZE,
        timeout,
        tries,
    )
    .await?;
    let connection_id = u64::from_be_bytes(reply[8..16].try_into().unwrap());

    // Announce phase; the try budget starts over.
    let txid: u32 = rand::rng().random();
    let reply = exchange(
        &socket,
        &build_announce(connection_id, txid, req),
        ACTION_ANNOUNCE,
        txid,
        20,
        timeout,
        tries,
    )
    .await?;

    let interval = u32::from_be_bytes(reply[8..12].try_into().unwrap());
    let leechers = u32::from_be_bytes(reply[12..16].try_into().unwrap());
    let seeders = u32::from_be_bytes(reply[16..20].try_into().unwrap());

    Ok(AnnounceResponse {
        interval: Some(interval),
        complete: Some(seeders),
        incomplete: Some(leechers),
        peers: parse_compact_peers(&reply[20..]),
        ..AnnounceResponse::default()
    })
}

/// Accepts `udp://host:port` with an optional trailing path; IPv6 hosts are
/// bracketed.
pub(super) fn parse_udp_url(url: &str) -> Result<(String, u16), TrackerError> {
    let rest = url
        .strip_prefix("udp://")
        .ok_or_else(|| TrackerError::InvalidUrl(url.to_string()))?;
    let rest = rest.split('/').next().unwrap_or(rest);

    let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
        let (host, tail) = bracketed
            .split_once(']')
            .ok_or_else(|| TrackerError::InvalidUrl(url.to_string()))?;
        (host, tail.strip_prefix(':'))
    } else {
        let (host, port) = match rest.rsplit_once(':') {
            Some((h, p)) => (h, Some(p)),
            None => (rest, None),
        };
        (host, port)
    };

    let port: u16 = port
        .and_then(|p| p.parse().ok())
        .filter(|&p| p != 0)
        .ok_or_else(|| TrackerError::InvalidUrl(url.to_string()))?;

    if host.is_empty() {
        return Err(TrackerError::InvalidUrl(url.to_string()));
    }

    Ok((host.to_string(), port))
}

pub(super) fn build_connect(transaction_id: u32) -> Vec<u8> {
    let mut packet = Vec::with_capacity(UDP_CONNECT_SIZE);
    packet.extend_from_slice(&UDP_TRACKER_MAGIC.to_be_bytes());
    packet.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
    packet.extend_from_slice(&transaction_id.to_be_bytes());

    assert_eq!(packet.len(), UDP_CONNECT_SIZE);
    packet
}

pub(super) fn build_announce(
    connection_id: u64,
    transaction_id: u32,
    req: &AnnounceRequest,
) -> Vec<u8> {
    let mut packet = Vec::with_capacity(UDP_ANNOUNCE_SIZE);
    packet.extend_from_slice(&connection_id.to_be_bytes());
    packet.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
    packet.extend_from_slice(&transaction_id.to_be_bytes());
    packet.extend_from_slice(&req.info_hash);
    packet.extend_from_slice(&req.peer_id);
    packet.extend_from_slice(&req.downloaded.to_be_bytes());
    packet.extend_from_slice(&req.left.to_be_bytes());
    packet.extend_from_slice(&req.uploaded.to_be_bytes());
    packet.extend_from_slice(&req.event.as_udp_id().to_be_bytes());

    let ip = match req.local_ip {
        Some(IpAddr::V4(v4)) => u32::from(v4),
        _ => 0,
    };
    packet.extend_from_slice(&ip.to_be_bytes());
    packet.extend_from_slice(&req.key.to_be_bytes());
    packet.extend_from_slice(&req.numwant.to_be_bytes());
    packet.extend_from_slice(&req.port.to_be_bytes());

    assert_eq!(
        packet.len(),
        UDP_ANNOUNCE_SIZE,
        "udp announce packet ended up with the wrong size"
    );
    packet
}

// One request/reply round with resend-on-timeout. Returns the raw reply
// starting at the action field.
async fn exchange(
    socket: &UdpSocket,
    packet: &[u8],
    expect_action: u32,
    transaction_id: u32,
    min_size: usize,
    timeout: Duration,
    tries: u32,
) -> Result<Vec<u8>, TrackerError> {
    let mut buf = vec![0u8; 2048];

    for attempt in 0..tries {
        socket.send(packet).await?;
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let n = match timeout_at(deadline, socket.recv(&mut buf)).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(TrackerError::Io(e)),
                Err(_) => {
                    trace!(attempt, "udp tracker timed out");
                    break;
                }
            };

            if n < 8 {
                continue;
            }

            let action = u32::from_be_bytes(buf[0..4].try_into().unwrap());
            let txid = u32::from_be_bytes(buf[4..8].try_into().unwrap());

            if txid != transaction_id {
                continue;
            }

            if action == ACTION_ERROR {
                let reason = String::from_utf8_lossy(&buf[8..n]).into_owned();
                return Err(TrackerError::Failure {
                    reason: format!("received error message: {reason}"),
                    fields: None,
                });
            }

            if action == expect_action && n >= min_size {
                return Ok(buf[..n].to_vec());
            }
        }
    }

    Err(TrackerError::Unreachable)
}
