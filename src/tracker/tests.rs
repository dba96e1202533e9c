use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::mpsc;

use super::{http, udp};
use super::*;

fn request(url: &str) -> AnnounceRequest {
    AnnounceRequest {
        url: url.to_string(),
        info_hash: [0x11; 20],
        peer_id: *b"-KP0010-abcdefghijkl",
        port: 6881,
        uploaded: 1,
        downloaded: 2,
        left: 3,
        event: TrackerEvent::Started,
        key: 0xdeadbeef,
        numwant: 50,
        tracker_id: None,
        local_ip: None,
    }
}

fn list_with_urls(urls: &[&str]) -> (TrackerList, Vec<TrackerId>) {
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut list = TrackerList::new([0x11; 20], *b"-KP0010-abcdefghijkl", 6881, tx);
    let ids = urls
        .iter()
        .map(|url| list.insert_url(0, url, false).unwrap().unwrap())
        .collect();
    (list, ids)
}

#[test]
fn test_event_mappings() {
    assert_eq!(TrackerEvent::Started.as_query_str(), "started");
    assert_eq!(TrackerEvent::Stopped.as_query_str(), "stopped");
    assert_eq!(TrackerEvent::Completed.as_query_str(), "completed");
    assert_eq!(TrackerEvent::None.as_query_str(), "");

    assert_eq!(TrackerEvent::None.as_udp_id(), 0);
    assert_eq!(TrackerEvent::Completed.as_udp_id(), 1);
    assert_eq!(TrackerEvent::Started.as_udp_id(), 2);
    assert_eq!(TrackerEvent::Stopped.as_udp_id(), 3);
}

#[test]
fn test_compact_peer_parsing() {
    let data = [
        192, 168, 1, 1, 0x1a, 0xe1, // 192.168.1.1:6881
        10, 0, 0, 1, 0x1a, 0xe2, // 10.0.0.1:6882
        99, // trailing partial tuple
    ];
    let peers = parse_compact_peers(&data);
    assert_eq!(peers.len(), 2);
    assert_eq!(peers[0], "192.168.1.1:6881".parse().unwrap());
    assert_eq!(peers[1], "10.0.0.1:6882".parse().unwrap());
}

#[test]
fn test_scrape_url_derivation() {
    assert_eq!(
        scrape_url_from("http://t.example/announce").as_deref(),
        Some("http://t.example/scrape")
    );
    assert_eq!(
        scrape_url_from("http://t.example/announce.php?passkey=abc").as_deref(),
        Some("http://t.example/scrape.php?passkey=abc")
    );
    assert_eq!(scrape_url_from("http://t.example/ann"), None);
    assert!(can_scrape("https://t.example/x/announce"));
    assert!(!can_scrape("https://t.example/x/update"));
}

#[test]
fn test_announce_url_parameters() {
    let url = build_announce_url(&request("http://t.example/announce"));

    assert!(url.starts_with("http://t.example/announce?info_hash=%11%11"));
    assert!(url.contains("&peer_id=-KP0010-abcdefghijkl"));
    assert!(url.contains("&key=deadbeef"));
    assert!(url.contains("&compact=1"));
    assert!(url.contains("&numwant=50"));
    assert!(url.contains("&port=6881"));
    assert!(url.contains("&uploaded=1&downloaded=2&left=3"));
    assert!(url.ends_with("&event=started"));
}

#[test]
fn test_announce_url_joins_existing_query() {
    let url = build_announce_url(&request("http://t.example/announce.php?passkey=s3cret"));
    assert!(url.starts_with("http://t.example/announce.php?passkey=s3cret&info_hash="));
}

#[test]
fn test_announce_url_omits_numwant_when_stopping() {
    let mut req = request("http://t.example/announce");
    req.event = TrackerEvent::Stopped;
    let url = build_announce_url(&req);
    assert!(!url.contains("numwant"));
    assert!(url.ends_with("&event=stopped"));
}

#[test]
fn test_http_response_parsing() {
    // Full field set with two compact peers.
    let mut body = Vec::new();
    body.extend_from_slice(b"d8:completei5e10:incompletei3e8:intervali1800e12:min intervali60e5:peers12:");
    body.extend_from_slice(&[127, 0, 0, 1, 0x1a, 0xe1]);
    body.extend_from_slice(&[127, 0, 0, 2, 0x1a, 0xe2]);
    body.extend_from_slice(b"e");

    let resp = http::parse_announce(&body).unwrap();
    assert_eq!(resp.interval, Some(1800));
    assert_eq!(resp.min_interval, Some(60));
    assert_eq!(resp.complete, Some(5));
    assert_eq!(resp.incomplete, Some(3));
    assert_eq!(resp.peers.len(), 2);
}

#[test]
fn test_http_failure_reason_carries_fields() {
    let body = b"d14:failure reason9:not found8:intervali600ee";
    match http::parse_announce(body) {
        Err(TrackerError::Failure { reason, fields }) => {
            assert_eq!(reason, "not found");
            assert_eq!(fields.unwrap().interval, Some(600));
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[test]
fn test_http_response_requires_peers() {
    let body = b"d8:intervali1800ee";
    assert!(matches!(
        http::parse_announce(body),
        Err(TrackerError::InvalidResponse(_))
    ));
}

#[test]
fn test_http_scrape_parsing() {
    let mut body = Vec::new();
    body.extend_from_slice(b"d5:filesd20:");
    body.extend_from_slice(&[0x11; 20]);
    body.extend_from_slice(b"d8:completei10e10:downloadedi99e10:incompletei4eeee");

    let resp = http::parse_scrape(&body, &[0x11; 20]).unwrap();
    assert_eq!(resp.complete, 10);
    assert_eq!(resp.incomplete, 4);
    assert_eq!(resp.downloaded, 99);

    assert!(matches!(
        http::parse_scrape(&body, &[0x22; 20]),
        Err(TrackerError::InvalidResponse(_))
    ));
}

#[test]
fn test_udp_url_parsing() {
    assert_eq!(
        udp::parse_udp_url("udp://tracker.example.org:6969").unwrap(),
        ("tracker.example.org".to_string(), 6969)
    );
    assert_eq!(
        udp::parse_udp_url("udp://tracker.example.org:6969/announce").unwrap(),
        ("tracker.example.org".to_string(), 6969)
    );
    assert_eq!(
        udp::parse_udp_url("udp://[2001:db8::1]:80").unwrap(),
        ("2001:db8::1".to_string(), 80)
    );

    assert!(udp::parse_udp_url("http://x:1").is_err());
    assert!(udp::parse_udp_url("udp://nohost").is_err());
    assert!(udp::parse_udp_url("udp://:42").is_err());
}

#[test]
fn test_udp_packet_layout() {
    let connect = udp::build_connect(0x0102_0304);
    assert_eq!(connect.len(), 16);
    assert_eq!(&connect[..8], &0x41727101980u64.to_be_bytes());
    assert_eq!(&connect[8..12], &[0, 0, 0, 0]);
    assert_eq!(&connect[12..], &[1, 2, 3, 4]);

    let announce = udp::build_announce(0xaabb, 7, &request("udp://t.example:6969"));
    assert_eq!(announce.len(), 98);
    assert_eq!(&announce[..8], &0xaabbu64.to_be_bytes());
    assert_eq!(&announce[8..12], &[0, 0, 0, 1]); // action: announce
    assert_eq!(&announce[12..16], &[0, 0, 0, 7]); // transaction id
    assert_eq!(&announce[16..36], &[0x11; 20]); // info hash
    assert_eq!(&announce[36..56], b"-KP0010-abcdefghijkl");
    assert_eq!(&announce[56..64], &2u64.to_be_bytes()); // downloaded
    assert_eq!(&announce[64..72], &3u64.to_be_bytes()); // left
    assert_eq!(&announce[72..80], &1u64.to_be_bytes()); // uploaded
    assert_eq!(&announce[80..84], &2u32.to_be_bytes()); // event: started
    assert_eq!(&announce[84..88], &[0, 0, 0, 0]); // ip
    assert_eq!(&announce[88..92], &0xdeadbeefu32.to_be_bytes()); // key
    assert_eq!(&announce[92..96], &50i32.to_be_bytes()); // numwant
    assert_eq!(&announce[96..98], &6881u16.to_be_bytes()); // port
}

// No reply from the tracker: the announce resends per phase try and then
// fails with the canonical message.
#[tokio::test(start_paused = true)]
async fn test_udp_announce_retries_then_fails() {
    let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = silent.local_addr().unwrap();

    let req = request(&format!("udp://{addr}"));
    let err = udp::announce(&req, None, Duration::from_secs(15), 2)
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "unable to connect to UDP tracker");
}

#[test]
fn test_insert_url_dispatch_and_grouping() {
    let (mut list, _) = list_with_urls(&["http://a.example/announce"]);

    let udp_id = list.insert_url(1, "udp://b.example:80", false).unwrap().unwrap();
    assert_eq!(list.get(udp_id).unwrap().kind(), TrackerKind::Udp);

    // Unknown scheme: skipped quietly unless user-added.
    assert!(list.insert_url(0, "wss://c.example", false).unwrap().is_none());
    assert!(matches!(
        list.insert_url(0, "wss://c.example", true),
        Err(TrackerError::UnsupportedScheme(_))
    ));

    // dht:// only counts when enabled.
    assert!(list.insert_url(2, "dht://", false).unwrap().is_none());
    list.set_dht_allowed(true);
    let dht_id = list.insert_url(2, "dht://", false).unwrap().unwrap();
    assert_eq!(list.get(dht_id).unwrap().kind(), TrackerKind::Dht);
    assert!(!list.get(dht_id).unwrap().is_usable());

    let groups: Vec<u32> = list.trackers().iter().map(|t| t.group()).collect();
    assert_eq!(groups, vec![0, 1, 2]);
    assert_eq!(list.size_group(), 3);
}

#[test]
fn test_http_tracker_is_scrape_capable() {
    let (list, ids) = list_with_urls(&["http://a.example/announce", "http://b.example/peers"]);
    assert!(list.get(ids[0]).unwrap().can_scrape());
    assert!(!list.get(ids[1]).unwrap().can_scrape());
}

// Scenario: [T0, T1, T2]; T1 announces successfully and swaps with the
// group front.
#[tokio::test(start_paused = true)]
async fn test_success_promotes_within_group() {
    let (mut list, ids) = list_with_urls(&[
        "http://t0.example/announce",
        "http://t1.example/announce",
        "http://t2.example/announce",
    ]);

    list.receive_success(ids[1], vec!["10.0.0.1:1".parse().unwrap()]);

    let order: Vec<&str> = list.trackers().iter().map(|t| t.url()).collect();
    assert_eq!(
        order,
        vec![
            "http://t1.example/announce",
            "http://t0.example/announce",
            "http://t2.example/announce",
        ]
    );

    let t1 = list.get(ids[1]).unwrap();
    assert_eq!(t1.success_counter(), 1);
    assert_eq!(t1.failed_counter(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_success_dedupes_peers_and_resets_failures() {
    let (mut list, ids) = list_with_urls(&["http://t.example/announce"]);

    let got = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = got.clone();
    list.set_slot_success(move |_, peers| {
        sink.lock().extend_from_slice(peers);
        peers.len() as u32
    });

    list.receive_failed(ids[0], "boom");
    assert_eq!(list.get(ids[0]).unwrap().failed_counter(), 1);

    let dup: std::net::SocketAddr = "10.0.0.1:1".parse().unwrap();
    list.receive_success(ids[0], vec![dup, "10.0.0.2:2".parse().unwrap(), dup]);

    assert_eq!(got.lock().len(), 2);
    let t = list.get(ids[0]).unwrap();
    assert_eq!(t.failed_counter(), 0);
    assert_eq!(t.latest_sum_peers(), 2);
    assert_eq!(t.latest_new_peers(), 2);
}

#[test]
fn test_cycle_group_rotates_left() {
    let (mut list, _) = list_with_urls(&[
        "http://a.example/announce",
        "http://b.example/announce",
        "http://c.example/announce",
    ]);
    list.insert_url(1, "udp://d.example:1", false).unwrap();

    list.cycle_group(0);
    let order: Vec<&str> = list.trackers().iter().map(|t| t.url()).collect();
    assert_eq!(
        order,
        vec![
            "http://b.example/announce",
            "http://c.example/announce",
            "http://a.example/announce",
            "udp://d.example:1",
        ]
    );

    // Rotating a single-entry group is a no-op.
    list.cycle_group(1);
    assert_eq!(list.trackers()[3].url(), "udp://d.example:1");
}

#[test]
fn test_randomize_keeps_group_partitions() {
    let (mut list, _) = list_with_urls(&["http://a.example/announce", "http://b.example/announce"]);
    list.insert_url(1, "udp://c.example:1", false).unwrap();
    list.insert_url(1, "udp://d.example:1", false).unwrap();

    let mut rng = StdRng::seed_from_u64(42);
    list.randomize_group_entries(&mut rng);

    let groups: Vec<u32> = list.trackers().iter().map(|t| t.group()).collect();
    assert_eq!(groups, vec![0, 0, 1, 1], "groups stay contiguous and sorted");
}

#[tokio::test(start_paused = true)]
async fn test_find_next_to_request_prefers_fresh_trackers() {
    let (mut list, ids) = list_with_urls(&[
        "http://a.example/announce",
        "http://b.example/announce",
        "http://c.example/announce",
    ]);

    // All fresh: the first usable wins.
    assert_eq!(list.find_next_to_request(0), Some(0));

    // The front keeps failing: a later fresh tracker is preferred.
    list.receive_failed(ids[0], "down");
    assert_eq!(list.find_next_to_request(0), Some(1));

    // Everyone failed: earliest retry time wins.
    tokio::time::advance(Duration::from_secs(1)).await;
    list.receive_failed(ids[1], "down");
    tokio::time::advance(Duration::from_secs(1)).await;
    list.receive_failed(ids[2], "down");

    // T0 failed earliest, so its backoff expires first.
    assert_eq!(list.find_next_to_request(0), Some(0));
}

// Scrape gating: a successful scrape suppresses the next one for ten
// minutes.
#[tokio::test(start_paused = true)]
async fn test_scrape_gating_window() {
    let (mut list, ids) = list_with_urls(&["http://127.0.0.1:1/announce"]);

    list.receive_scrape_success(
        ids[0],
        ScrapeResponse {
            complete: 1,
            incomplete: 2,
            downloaded: 3,
        },
    );
    assert_eq!(list.get(ids[0]).unwrap().scrape_counter(), 1);

    // Nine minutes later: gated, no request goes out.
    tokio::time::advance(Duration::from_secs(9 * 60)).await;
    list.send_scrape(ids[0]);
    assert!(!list.get(ids[0]).unwrap().is_busy());

    // Eleven minutes after the success: issued.
    tokio::time::advance(Duration::from_secs(2 * 60)).await;
    list.send_scrape(ids[0]);
    assert!(list.get(ids[0]).unwrap().is_busy());

    list.close(ids[0]);
    assert!(!list.get(ids[0]).unwrap().is_busy());
}

// close() aborts the request; disown() lets it finish into a discard sink.
#[tokio::test(start_paused = true)]
async fn test_stale_messages_are_discarded() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut list = TrackerList::new([0x11; 20], *b"-KP0010-abcdefghijkl", 6881, tx);
    list.set_udp_timing(Duration::from_secs(1), 1);

    let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = silent.local_addr().unwrap();
    let id = list
        .insert_url(0, &format!("udp://{addr}"), false)
        .unwrap()
        .unwrap();

    list.send_state(id, TrackerEvent::Started);
    assert!(list.get(id).unwrap().is_busy());
    assert!(list.has_active());

    list.disown(id);
    assert!(!list.get(id).unwrap().is_busy());

    // The disowned request eventually completes into the channel; routing
    // it back is a no-op on the tracker's counters.
    let message = rx.recv().await.expect("disowned request still completes");
    list.receive(message);

    let t = list.get(id).unwrap();
    assert_eq!(t.failed_counter(), 0);
    assert_eq!(t.success_counter(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_send_state_skips_busy_announce_but_replaces_scrape() {
    let (mut list, ids) = list_with_urls(&["http://127.0.0.1:1/announce"]);

    list.send_state(ids[0], TrackerEvent::Started);
    assert!(list.get(ids[0]).unwrap().is_busy());
    let first_event = list.get(ids[0]).unwrap().latest_event();
    assert_eq!(first_event, TrackerEvent::Started);

    // Busy announcing: a second send_state is ignored.
    list.send_state(ids[0], TrackerEvent::Completed);
    assert_eq!(list.get(ids[0]).unwrap().latest_event(), TrackerEvent::Started);
    assert_eq!(list.get(ids[0]).unwrap().request_counter(), 1);

    list.close(ids[0]);

    // Busy scraping: an announce cancels the scrape and takes over.
    list.send_scrape(ids[0]);
    assert_eq!(list.get(ids[0]).unwrap().latest_event(), TrackerEvent::Scrape);
    list.send_state(ids[0], TrackerEvent::Stopped);
    let t = list.get(ids[0]).unwrap();
    assert!(t.is_busy());
    assert_eq!(t.latest_event(), TrackerEvent::Stopped);

    list.clear();
}
