use std::net::SocketAddr;

use reqwest::Client;
use tracing::debug;

use super::error::TrackerError;
use super::response::{
    parse_compact_peers, parse_compact_peers6, AnnounceRequest, AnnounceResponse, ScrapeResponse,
};
use crate::bencode::{decode, Value};

/// True when the announce URL supports scrape derivation: its last path
/// segment starts with `announce` (BEP convention).
pub fn can_scrape(url: &str) -> bool {
    scrape_url_from(url).is_some()
}

/// Derives the scrape URL by replacing the trailing `/announce` path segment
/// with `/scrape`, keeping any suffix (passkeys, query strings).
pub fn scrape_url_from(url: &str) -> Option<String> {
    let slash = url.rfind('/')?;
    let rest = &url[slash + 1..];

    if !rest.starts_with("announce") {
        return None;
    }

    Some(format!(
        "{}/scrape{}",
        &url[..slash],
        &rest["announce".len()..]
    ))
}

/// Builds the full announce GET URL with every query parameter.
pub fn build_announce_url(req: &AnnounceRequest) -> String {
    // A URL that already carries query options gets '&', otherwise '?'.
    let has_options = match req.url.rfind('?') {
        Some(pos) => !req.url[pos..].contains('/'),
        None => false,
    };

    let mut url = format!(
        "{}{}info_hash={}&peer_id={}",
        req.url,
        if has_options { '&' } else { '?' },
        percent_encode(&req.info_hash),
        percent_encode(&req.peer_id),
    );

    if req.key != 0 {
        url.push_str(&format!("&key={:08x}", req.key));
    }

    if let Some(id) = &req.tracker_id {
        url.push_str(&format!("&trackerid={}", percent_encode(id.as_bytes())));
    }

    if let Some(ip) = req.local_ip {
        url.push_str(&format!("&ip={ip}"));
    }

    url.push_str("&compact=1");

    if req.numwant >= 0 && req.event != super::TrackerEvent::Stopped {
        url.push_str(&format!("&numwant={}", req.numwant));
    }

    if req.port != 0 {
        url.push_str(&format!("&port={}", req.port));
    }

    url.push_str(&format!(
        "&uploaded={}&downloaded={}&left={}",
        req.uploaded, req.downloaded, req.left
    ));

    let event = req.event.as_query_str();
    if !event.is_empty() {
        url.push_str(&format!("&event={event}"));
    }

    url
}

/// Issues one announce over HTTP and parses the bencoded reply.
pub async fn announce(client: &Client, req: &AnnounceRequest) -> Result<AnnounceResponse, TrackerError> {
    let url = build_announce_url(req);
    debug!(%url, "http announce");

    let body = client.get(&url).send().await?.bytes().await?;
    parse_announce(&body)
}

/// Issues one scrape over HTTP.
pub async fn scrape(
    client: &Client,
    announce_url: &str,
    info_hash: &[u8; 20],
) -> Result<ScrapeResponse, TrackerError> {
    let base = scrape_url_from(announce_url)
        .ok_or_else(|| TrackerError::InvalidUrl(announce_url.to_string()))?;
    let url = format!("{base}?info_hash={}", percent_encode(info_hash));
    debug!(%url, "http scrape");

    let body = client.get(&url).send().await?.bytes().await?;
    parse_scrape(&body, info_hash)
}

pub(super) fn parse_announce(body: &[u8]) -> Result<AnnounceResponse, TrackerError> {
    let root = decode(body)?;
    if root.as_dict().is_none() {
        return Err(TrackerError::InvalidResponse("root is not a dictionary"));
    }

    let mut resp = AnnounceResponse {
        interval: get_u32(&root, b"interval"),
        min_interval: get_u32(&root, b"min interval"),
        tracker_id: root
            .get(b"tracker id")
            .and_then(|v| v.as_str())
            .map(String::from),
        complete: get_u32(&root, b"complete"),
        incomplete: get_u32(&root, b"incomplete"),
        downloaded: get_u32(&root, b"downloaded"),
        ..AnnounceResponse::default()
    };

    if let Some(reason) = root.get(b"failure reason") {
        let reason = reason
            .as_str()
            .unwrap_or("failure reason not a string")
            .to_string();
        let fields = resp.has_fields().then(|| Box::new(resp));
        return Err(TrackerError::Failure { reason, fields });
    }

    let peers = root.get(b"peers");
    let peers6 = root.get(b"peers6");
    if peers.is_none() && peers6.is_none() {
        return Err(TrackerError::InvalidResponse("no peers returned"));
    }

    match peers {
        Some(Value::Bytes(data)) => resp.peers = parse_compact_peers(data),
        Some(Value::List(entries)) => resp.peers = parse_peer_list(entries),
        _ => {}
    }

    if let Some(data) = peers6.and_then(|v| v.as_bytes()) {
        resp.peers6 = parse_compact_peers6(data);
    }

    Ok(resp)
}

// The non-compact dictionary form some trackers still send.
fn parse_peer_list(entries: &[Value]) -> Vec<SocketAddr> {
    entries
        .iter()
        .filter_map(|peer| {
            let ip = peer.get(b"ip")?.as_str()?.parse().ok()?;
            let port = peer.get(b"port")?.as_integer()?;
            Some(SocketAddr::new(ip, port as u16))
        })
        .collect()
}

pub(super) fn parse_scrape(body: &[u8], info_hash: &[u8; 20]) -> Result<ScrapeResponse, TrackerError> {
    let root = decode(body)?;

    if let Some(reason) = root.get(b"failure reason").and_then(|v| v.as_str()) {
        return Err(TrackerError::Failure {
            reason: reason.to_string(),
            fields: None,
        });
    }

    let files = root
        .get(b"files")
        .and_then(|v| v.as_dict())
        .ok_or(TrackerError::InvalidResponse("scrape has no files entry"))?;

    let stats = files
        .get(info_hash.as_slice())
        .ok_or(TrackerError::InvalidResponse("scrape reply missing infohash"))?;

    Ok(ScrapeResponse {
        complete: get_u32(stats, b"complete").unwrap_or(0),
        incomplete: get_u32(stats, b"incomplete").unwrap_or(0),
        downloaded: get_u32(stats, b"downloaded").unwrap_or(0),
    })
}

fn get_u32(value: &Value, key: &[u8]) -> Option<u32> {
    value
        .get(key)
        .and_then(|v| v.as_integer())
        .map(|n| n.max(0) as u32)
}

fn percent_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for &b in bytes {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}
