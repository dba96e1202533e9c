use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::*;

const BLOCK: u32 = 16384;

fn peer(n: u8) -> SocketAddr {
    ([127, 0, 0, n], 6881).into()
}

fn events() -> (Arc<Mutex<Vec<u32>>>, impl FnMut(u32) + Send + 'static) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    (log, move |i| sink.lock().push(i))
}

// Delegates every block of the piece to `peer` and reports them finished.
fn deliver_all(list: &mut TransferList, piece: u32, blocks: u32, from: SocketAddr) {
    for b in 0..blocks {
        let t = list.delegate(piece, b, from).unwrap();
        list.finished(&t).unwrap();
    }
}

#[test]
fn test_insert_fires_queued_and_rejects_duplicates() {
    let mut list = TransferList::new();
    let (queued, slot) = events();
    list.set_slot_queued(slot);

    list.insert(Piece::new(3, 0, 2 * BLOCK), BLOCK).unwrap();
    assert_eq!(*queued.lock(), vec![3]);
    assert_eq!(list.find(3).unwrap().len(), 2);

    assert_eq!(
        list.insert(Piece::new(3, 0, 2 * BLOCK), BLOCK),
        Err(TransferError::InvalidState("piece is already delegated"))
    );
}

#[test]
fn test_short_last_block() {
    let mut list = TransferList::new();
    list.insert(Piece::new(0, 0, BLOCK + 100), BLOCK).unwrap();

    let blocks = list.find(0).unwrap().blocks();
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[0].range().length, BLOCK);
    assert_eq!(blocks[1].range().length, 100);
}

#[test]
fn test_finished_completes_piece_and_rejects_stale_refs() {
    let mut list = TransferList::new();
    let (completed, slot) = events();
    list.set_slot_completed(slot);

    list.insert(Piece::new(0, 0, 2 * BLOCK), BLOCK).unwrap();

    let a = list.delegate(0, 0, peer(1)).unwrap();
    let b = list.delegate(0, 1, peer(2)).unwrap();

    assert_eq!(list.finished(&a), Ok(false));
    assert!(completed.lock().is_empty());
    assert_eq!(list.finished(&b), Ok(true));
    assert_eq!(*completed.lock(), vec![0]);

    // A spent ref must not be usable again.
    assert_eq!(
        list.finished(&b),
        Err(TransferError::InvalidState("stale transfer"))
    );
}

#[test]
fn test_duplicate_transfer_is_not_leader() {
    let mut list = TransferList::new();
    list.insert(Piece::new(0, 0, BLOCK), BLOCK).unwrap();

    let lead = list.delegate(0, 0, peer(1)).unwrap();
    let dup = list.delegate(0, 0, peer(2)).unwrap();

    let block = &list.find(0).unwrap().blocks()[0];
    assert!(block.transfers()[lead.transfer as usize].is_leader());
    assert!(!block.transfers()[dup.transfer as usize].is_leader());

    // The duplicate finishing does not finish the block.
    assert_eq!(list.finished(&dup), Ok(false));
    assert!(!list.find(0).unwrap().blocks()[0].is_finished());
    assert_eq!(list.finished(&lead), Ok(true));
}

#[test]
fn test_clear_fires_canceled() {
    let mut list = TransferList::new();
    let (canceled, slot) = events();
    list.set_slot_canceled(slot);

    list.insert(Piece::new(1, 0, BLOCK), BLOCK).unwrap();
    list.insert(Piece::new(4, 0, BLOCK), BLOCK).unwrap();
    list.clear();

    assert_eq!(*canceled.lock(), vec![1, 4]);
    assert!(list.is_empty());
}

#[test]
#[should_panic(expected = "finished blocks do not match size")]
fn test_hash_succeeded_requires_finished_blocks() {
    let mut list = TransferList::new();
    list.insert(Piece::new(0, 0, 2 * BLOCK), BLOCK).unwrap();
    let a = list.delegate(0, 0, peer(1)).unwrap();
    list.finished(&a).unwrap();

    list.hash_succeeded(0, &vec![0; 2 * BLOCK as usize]);
}

#[test]
#[should_panic(expected = "unknown piece")]
fn test_hash_failed_requires_known_piece() {
    let mut list = TransferList::new();
    list.hash_failed(9, &mut [0; 16]);
}

// One distinct variant per block on the first failure: no retry pass, every
// block is reset and re-requested.
#[test]
fn test_first_failure_single_variant_rerequests() {
    let mut list = TransferList::new();
    let (completed, slot) = events();
    list.set_slot_completed(slot);

    list.insert(Piece::new(0, 0, 2 * BLOCK), BLOCK).unwrap();
    deliver_all(&mut list, 0, 2, peer(1));
    assert_eq!(completed.lock().len(), 1);

    let mut chunk = vec![0xaau8; 2 * BLOCK as usize];
    list.hash_failed(0, &mut chunk);

    // No retry: completed did not fire again, blocks are idle again.
    assert_eq!(completed.lock().len(), 1);
    let bl = list.find(0).unwrap();
    assert_eq!(bl.attempt(), 0);
    assert_eq!(bl.failed(), 1);
    assert!(bl
        .blocks()
        .iter()
        .all(|b| b.state() == BlockState::Idle));
    assert!(bl.blocks().iter().all(|b| b.failed_list().len() == 1));
}

// After a reset, the old refs are stale and must not mutate anything.
#[test]
fn test_refs_go_stale_after_reset() {
    let mut list = TransferList::new();
    list.insert(Piece::new(0, 0, BLOCK), BLOCK).unwrap();

    let t = list.delegate(0, 0, peer(1)).unwrap();
    list.finished(&t).unwrap();

    let mut chunk = vec![0u8; BLOCK as usize];
    list.hash_failed(0, &mut chunk);

    assert_eq!(
        list.finished(&t),
        Err(TransferError::InvalidState("stale transfer"))
    );
}

// The end-to-end corruption vote: P1 poisons block A across two delivery
// rounds, the variant retry reassembles a good chunk without re-downloading,
// and the eventual hash success convicts exactly P1.
#[test]
fn test_bad_peer_vote() {
    let mut list = TransferList::new();
    let (completed, slot) = events();
    list.set_slot_completed(slot);
    let corrupt = Arc::new(Mutex::new(Vec::new()));
    let sink = corrupt.clone();
    list.set_slot_corrupt(move |p| sink.lock().push(p));

    let alpha = vec![0xaau8; BLOCK as usize];
    let beta = vec![0xbbu8; BLOCK as usize];
    let gamma = vec![0xccu8; BLOCK as usize];

    list.insert(Piece::new(7, 0, 2 * BLOCK), BLOCK).unwrap();

    // Round one: P1 delivers both blocks; block A's bytes are garbage.
    deliver_all(&mut list, 7, 2, peer(1));
    assert_eq!(completed.lock().len(), 1);

    let mut chunk: Vec<u8> = [alpha.clone(), gamma.clone()].concat();
    list.hash_failed(7, &mut chunk);
    assert_eq!(completed.lock().len(), 1, "no retry on a lone variant");

    // Round two: P2 re-delivers; its block A differs, block B agrees.
    deliver_all(&mut list, 7, 2, peer(2));
    assert_eq!(completed.lock().len(), 2);

    let mut chunk: Vec<u8> = [beta.clone(), gamma.clone()].concat();
    list.hash_failed(7, &mut chunk);

    // Block A now holds a tie-breaking second variant, so the retry pass
    // fires completed again instead of re-requesting.
    assert_eq!(completed.lock().len(), 3);
    let bl = list.find(7).unwrap();
    assert_eq!(bl.attempt(), 1);
    assert_eq!(bl.blocks()[0].failed_list().len(), 2);
    assert_eq!(bl.blocks()[1].failed_list().len(), 1);
    assert_eq!(bl.blocks()[1].failed_list()[0].count, 2);

    // The chunk now carries the winning combination.
    assert_eq!(&chunk[..BLOCK as usize], &beta[..]);
    assert_eq!(&chunk[BLOCK as usize..], &gamma[..]);

    // The hasher accepts the reassembled chunk; only P1 is convicted.
    list.hash_succeeded(7, &chunk);
    assert_eq!(*corrupt.lock(), vec![peer(1)]);
    assert!(list.find(7).is_none());
    assert_eq!(list.succeeded_count(), 1);
    assert_eq!(list.failed_count(), 2);
}

// When the chunk's current bytes are outvoted, restoring the most popular
// variant copies the majority bytes back in; a tie resolves to the most
// recently recorded variant.
#[test]
fn test_restore_most_popular_variant() {
    let mut bl = BlockList::new(Piece::new(0, 0, BLOCK), BLOCK);
    bl.blocks_mut()[0].push_transfer(peer(1));

    let alpha = vec![0x11u8; BLOCK as usize];
    let beta = vec![0x22u8; BLOCK as usize];

    // alpha seen twice, then beta once: alpha is the favourite.
    bl.blocks_mut()[0].record_failed_variant(&alpha);
    bl.blocks_mut()[0].record_failed_variant(&alpha);
    bl.blocks_mut()[0].record_failed_variant(&beta);

    let mut chunk = beta.clone();
    assert!(bl.blocks_mut()[0].restore_most_popular(&mut chunk));
    assert_eq!(chunk, alpha);
    assert_eq!(bl.blocks()[0].current_variant(), Some(0));

    // Already at the favourite: nothing to copy.
    assert!(!bl.blocks_mut()[0].restore_most_popular(&mut chunk));

    // A 2:2 tie goes to the more recently recorded variant.
    let mut bl = BlockList::new(Piece::new(0, 0, BLOCK), BLOCK);
    bl.blocks_mut()[0].push_transfer(peer(1));
    for data in [&alpha, &beta, &beta, &alpha] {
        bl.blocks_mut()[0].record_failed_variant(data);
    }
    let mut chunk = alpha.clone();
    assert!(bl.blocks_mut()[0].restore_most_popular(&mut chunk));
    assert_eq!(chunk, beta);
}

#[tokio::test(start_paused = true)]
async fn test_completed_log_retention() {
    let minutes = |m: u64| Duration::from_secs(m * 60);

    let mut list = TransferList::new();
    let mut complete_one = |list: &mut TransferList, index: u32| {
        list.insert(Piece::new(index, 0, BLOCK), BLOCK).unwrap();
        deliver_all(list, index, 1, peer(1));
        list.hash_succeeded(index, &vec![0u8; BLOCK as usize]);
    };

    let start = tokio::time::Instant::now();

    complete_one(&mut list, 0);
    tokio::time::advance(minutes(25)).await;
    complete_one(&mut list, 1);
    tokio::time::advance(minutes(20)).await;
    complete_one(&mut list, 2);
    tokio::time::advance(minutes(25)).await;
    complete_one(&mut list, 3);
    tokio::time::advance(minutes(5)).await;

    // At 75 minutes the 0-minute entry has aged out; everything else is
    // still observable.
    let seen: Vec<u32> = list.completed_log().map(|(_, i)| i).collect();
    assert_eq!(seen, vec![1, 2, 3]);

    // A poller that last checked at the 45-minute mark still sees both
    // newer completions.
    assert_eq!(list.completed_since(start + minutes(45)), vec![2, 3]);
}
