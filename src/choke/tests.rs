use std::sync::Arc;

use parking_lot::Mutex;

use super::*;
use crate::engine::DownloadId;

fn key(download: u64, peer: u8) -> ConnectionKey {
    ConnectionKey {
        download: DownloadId(download),
        peer: ([10, 0, 0, peer], 6881).into(),
    }
}

fn interested(download: u64, peer: u8, rate: u64) -> QueuedConnection {
    QueuedConnection {
        rate,
        interested: true,
        ..QueuedConnection::new(key(download, peer))
    }
}

#[test]
fn test_cycle_prefers_fast_interested_connections() {
    let mut q = ChokeQueue::new(Heuristics::UploadLeech);
    q.insert(interested(1, 1, 100));
    q.insert(interested(1, 2, 900));
    q.insert(interested(1, 3, 500));
    q.insert(QueuedConnection::new(key(1, 4))); // not interested

    assert_eq!(q.requested(), 3);
    assert_eq!(q.cycle(2), 2);
    assert_eq!(q.size_unchoked(), 2);

    let unchoked: Vec<u8> = q
        .connections()
        .iter()
        .filter(|c| c.unchoked)
        .map(|c| match c.key.peer.ip() {
            std::net::IpAddr::V4(ip) => ip.octets()[3],
            _ => unreachable!(),
        })
        .collect();
    assert_eq!(unchoked, vec![2, 3]);
}

#[test]
fn test_cycle_uncapped_unchokes_all_interested() {
    let mut q = ChokeQueue::new(Heuristics::DownloadLeech);
    for p in 1..=5 {
        q.insert(interested(1, p, p as u64));
    }
    q.insert(QueuedConnection::new(key(1, 9)));

    assert_eq!(q.cycle(u32::MAX), 5);
    assert_eq!(q.size_unchoked(), 5);
    assert_eq!(q.requested(), 0);
}

#[test]
fn test_cycle_revokes_slots_from_outranked_connections() {
    let mut q = ChokeQueue::new(Heuristics::UploadLeech);
    q.insert(interested(1, 1, 100));
    q.insert(interested(1, 2, 200));
    assert_eq!(q.cycle(2), 2);

    // A faster peer shows up; with one slot only it wins outright.
    q.insert(interested(1, 3, 999));
    assert_eq!(q.cycle(1), -1);
    assert_eq!(q.size_unchoked(), 1);
    assert!(q.connections()[2].unchoked);
}

#[test]
fn test_cycle_chokes_uninterested_holders() {
    let mut q = ChokeQueue::new(Heuristics::UploadLeech);
    q.insert(interested(1, 1, 10));
    q.cycle(1);
    assert_eq!(q.size_unchoked(), 1);

    q.set_interested(&key(1, 1), false);
    assert_eq!(q.cycle(1), -1);
    assert_eq!(q.size_unchoked(), 0);
}

#[test]
fn test_choke_decisions_reach_the_slot() {
    let applied = Arc::new(Mutex::new(Vec::new()));
    let sink = applied.clone();

    let mut q = ChokeQueue::new(Heuristics::UploadLeech);
    q.set_slot_connection(move |k, choke| sink.lock().push((k.peer, choke)));
    q.insert(interested(1, 1, 10));

    q.cycle(1);
    q.cycle(0);

    let log = applied.lock();
    assert_eq!(log.len(), 2);
    assert!(!log[0].1, "first decision is an unchoke");
    assert!(log[1].1, "second decision is a choke");
}

#[test]
fn test_manual_unchoke_and_choke_report_deltas() {
    let mut q = ChokeQueue::new(Heuristics::UploadLeech);
    q.insert(interested(1, 1, 10));

    assert_eq!(q.unchoke_manual(&key(1, 1)), 1);
    assert_eq!(q.unchoke_manual(&key(1, 1)), 0, "already unchoked");
    assert_eq!(q.choke_manual(&key(1, 1)), -1);
    assert_eq!(q.choke_manual(&key(1, 1)), 0);
    assert_eq!(q.unchoke_manual(&key(9, 9)), 0, "unknown connection");
}

#[test]
fn test_move_connections_between_queues() {
    let mut src = ChokeQueue::new(Heuristics::UploadLeech);
    let mut dst = ChokeQueue::new(Heuristics::UploadLeech);

    src.insert(interested(1, 1, 10));
    src.insert(interested(2, 2, 20));
    src.cycle(2);

    move_connections(Some(&mut src), Some(&mut dst), DownloadId(1));

    assert_eq!(src.len(), 1);
    assert_eq!(dst.len(), 1);
    assert!(dst.connections()[0].unchoked, "choke state survives the move");
    assert_eq!(src.size_unchoked() + dst.size_unchoked(), 2);
}

#[test]
fn test_group_cursors() {
    let mut g = ChokeGroup::new("seed");
    assert_eq!(g.name(), "seed");
    assert_eq!((g.first(), g.last()), (0, 0));

    g.set_range(2, 5);
    assert_eq!(g.entry_count(), 3);

    g.inc_cursors();
    assert_eq!((g.first(), g.last()), (3, 6));
    g.dec_cursors();
    assert_eq!((g.first(), g.last()), (2, 5));
}
