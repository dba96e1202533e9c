use std::collections::BTreeSet;
use std::collections::VecDeque;
use std::net::SocketAddr;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::constants::{COMPLETED_PRUNE_AGE, COMPLETED_RETAIN_AGE};

use super::block::{BlockList, Piece};
use super::TransferError;

type IndexSlot = Box<dyn FnMut(u32) + Send>;
type PeerSlot = Box<dyn FnMut(SocketAddr) + Send>;

/// A weak handle to one peer's in-flight delivery of one block.
///
/// Refs are plain copyable tokens; the referenced transfer carries a validity
/// flag that flips when the block moves on, so a stale ref can always be
/// detected (back-index pattern, no ownership cycle).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferRef {
    pub piece: u32,
    pub block: u32,
    pub transfer: u32,
}

/// The set of pieces currently being acquired.
///
/// Owns one [`BlockList`] per in-flight piece, keyed by unique piece index.
/// Progress and failure events fire through slots the embedder installs:
/// `queued` on insert, `completed` when a piece's blocks are all delivered
/// (or a variant retry is ready for re-hashing), `canceled` on [`clear`],
/// and `corrupt` once per peer the failure vote convicts.
///
/// [`clear`]: TransferList::clear
pub struct TransferList {
    lists: Vec<BlockList>,
    completed_log: VecDeque<(Instant, u32)>,
    succeeded_count: u64,
    failed_count: u64,
    slot_queued: IndexSlot,
    slot_completed: IndexSlot,
    slot_canceled: IndexSlot,
    slot_corrupt: PeerSlot,
}

impl TransferList {
    pub fn new() -> Self {
        Self {
            lists: Vec::new(),
            completed_log: VecDeque::new(),
            succeeded_count: 0,
            failed_count: 0,
            slot_queued: Box::new(|_| {}),
            slot_completed: Box::new(|_| {}),
            slot_canceled: Box::new(|_| {}),
            slot_corrupt: Box::new(|_| {}),
        }
    }

    pub fn set_slot_queued(&mut self, slot: impl FnMut(u32) + Send + 'static) {
        self.slot_queued = Box::new(slot);
    }

    pub fn set_slot_completed(&mut self, slot: impl FnMut(u32) + Send + 'static) {
        self.slot_completed = Box::new(slot);
    }

    pub fn set_slot_canceled(&mut self, slot: impl FnMut(u32) + Send + 'static) {
        self.slot_canceled = Box::new(slot);
    }

    pub fn set_slot_corrupt(&mut self, slot: impl FnMut(SocketAddr) + Send + 'static) {
        self.slot_corrupt = Box::new(slot);
    }

    pub fn len(&self) -> usize {
        self.lists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    pub fn succeeded_count(&self) -> u64 {
        self.succeeded_count
    }

    pub fn failed_count(&self) -> u64 {
        self.failed_count
    }

    pub fn find(&self, index: u32) -> Option<&BlockList> {
        self.lists.iter().find(|l| l.index() == index)
    }

    fn position(&self, index: u32) -> Option<usize> {
        self.lists.iter().position(|l| l.index() == index)
    }

    /// Starts acquiring a piece, splitting it into `block_size` blocks.
    ///
    /// Fails with [`TransferError::InvalidState`] if the piece is already in
    /// the list. Fires the `queued` slot.
    pub fn insert(&mut self, piece: Piece, block_size: u32) -> Result<(), TransferError> {
        if self.find(piece.index).is_some() {
            return Err(TransferError::InvalidState("piece is already delegated"));
        }

        self.lists.push(BlockList::new(piece, block_size));
        (self.slot_queued)(piece.index);
        Ok(())
    }

    /// Drops a piece's block list. The caller is responsible for having
    /// invalidated or finished its transfers; no callback fires.
    ///
    /// # Panics
    ///
    /// Panics if the piece is not in the list.
    pub fn erase(&mut self, index: u32) {
        let pos = self
            .position(index)
            .unwrap_or_else(|| panic!("TransferList::erase() unknown piece {index}"));
        self.lists.remove(pos);
    }

    /// Registers `peer` as delivering the given block. The first live
    /// transfer of a block becomes its leader; only the leader's bytes reach
    /// storage.
    pub fn delegate(
        &mut self,
        piece: u32,
        block: u32,
        peer: SocketAddr,
    ) -> Result<TransferRef, TransferError> {
        let pos = self
            .position(piece)
            .ok_or(TransferError::InvalidState("piece is not delegated"))?;
        let blocks = self.lists[pos].blocks_mut();
        let blk = blocks
            .get_mut(block as usize)
            .ok_or(TransferError::InvalidState("no such block"))?;

        if blk.is_finished() {
            return Err(TransferError::InvalidState("block already finished"));
        }

        let transfer = blk.push_transfer(peer) as u32;
        Ok(TransferRef {
            piece,
            block,
            transfer,
        })
    }

    /// Records that the peer behind `transfer` fully delivered its block.
    ///
    /// Fails with [`TransferError::InvalidState`] when the ref is stale (the
    /// block was reset or the piece erased). When the leader's delivery
    /// finishes the whole piece, fires the `completed` slot and returns
    /// `Ok(true)`.
    pub fn finished(&mut self, transfer: &TransferRef) -> Result<bool, TransferError> {
        let pos = self
            .position(transfer.piece)
            .ok_or(TransferError::InvalidState("transfer piece is gone"))?;
        let list = &mut self.lists[pos];
        let block = list
            .blocks_mut()
            .get_mut(transfer.block as usize)
            .ok_or(TransferError::InvalidState("no such block"))?;

        match block.transfer(transfer.transfer as usize) {
            Some(t) if t.is_valid() => {}
            _ => return Err(TransferError::InvalidState("stale transfer")),
        }

        let led = block.complete_transfer(transfer.transfer as usize);

        if led && self.lists[pos].is_all_finished() {
            (self.slot_completed)(transfer.piece);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Accepts the hasher's verdict that the assembled piece verified.
    ///
    /// When the piece had failed before, runs the corruption vote against the
    /// now-known-good bytes and fires `corrupt` once per convicted peer. The
    /// completion is logged with a timestamp so a resume checkpoint polling
    /// every 30 minutes observes every entry; the log is pruned once its head
    /// passes 60 minutes.
    ///
    /// # Panics
    ///
    /// Panics if the piece is unknown or any block is unfinished.
    pub fn hash_succeeded(&mut self, index: u32, chunk: &[u8]) {
        let pos = self
            .position(index)
            .unwrap_or_else(|| panic!("TransferList::hash_succeeded() unknown piece {index}"));
        assert!(
            self.lists[pos].is_all_finished(),
            "TransferList::hash_succeeded() finished blocks do not match size"
        );

        let mut bad = BTreeSet::new();
        if self.lists[pos].failed() != 0 {
            for block in self.lists[pos].blocks_mut() {
                bad.extend(block.failed_peers(chunk));
            }
        }

        for peer in bad {
            warn!(piece = index, %peer, "peer delivered corrupt data");
            (self.slot_corrupt)(peer);
        }

        self.completed_log.push_back((Instant::now(), index));
        self.prune_completed_log();

        self.succeeded_count += 1;
        self.lists.remove(pos);
    }

    /// Accepts the hasher's verdict that the assembled piece is corrupt.
    ///
    /// On the piece's first failed attempt the chunk's bytes are recorded as
    /// failed variants per block. If some block's variant thereby tied or
    /// overtook the previous favourite (and not every block did), the most
    /// popular combination is copied back into the chunk and `completed`
    /// fires so the hasher retries without any re-download. Otherwise every
    /// block goes back to idle for re-request.
    ///
    /// # Panics
    ///
    /// Panics if the piece is unknown or any block is unfinished.
    pub fn hash_failed(&mut self, index: u32, chunk: &mut [u8]) {
        let pos = self
            .position(index)
            .unwrap_or_else(|| panic!("TransferList::hash_failed() unknown piece {index}"));
        assert!(
            self.lists[pos].is_all_finished(),
            "TransferList::hash_failed() finished blocks do not match size"
        );

        self.failed_count += 1;

        let list = &mut self.lists[pos];
        if list.attempt() == 0 {
            let promoted = update_failed(list, chunk);

            if promoted > 0 && (promoted as usize) < list.len() {
                debug!(
                    piece = index,
                    promoted, "retrying hash with most popular block variants"
                );
                list.set_attempt(1);
                retry_most_popular(list, chunk);
                (self.slot_completed)(index);
                return;
            }
        }

        debug!(piece = index, "hash failed, re-requesting all blocks");
        self.lists[pos].do_all_failed();
    }

    /// Cancels every in-flight piece, firing `canceled` for each.
    pub fn clear(&mut self) {
        for list in &self.lists {
            (self.slot_canceled)(list.index());
        }
        self.lists.clear();
    }

    /// Completions recorded at or after `since`, oldest first.
    pub fn completed_since(&self, since: Instant) -> Vec<u32> {
        self.completed_log
            .iter()
            .filter(|(ts, _)| *ts >= since)
            .map(|&(_, index)| index)
            .collect()
    }

    pub fn completed_log(&self) -> impl Iterator<Item = (Instant, u32)> + '_ {
        self.completed_log.iter().copied()
    }

    // Prune only once the head has aged past the prune threshold; entries
    // younger than that always survive, which covers the retention window a
    // checkpoint consumer polling at that period relies on.
    fn prune_completed_log(&mut self) {
        // Entries live at least twice the retention window before the head
        // can trigger pruning.
        const _: () = assert!(COMPLETED_PRUNE_AGE.as_secs() >= 2 * COMPLETED_RETAIN_AGE.as_secs());

        let now = Instant::now();

        match self.completed_log.front() {
            Some(&(head, _)) if now.duration_since(head) > COMPLETED_PRUNE_AGE => {}
            _ => return,
        }

        while let Some(&(ts, _)) = self.completed_log.front() {
            if now.duration_since(ts) > COMPLETED_PRUNE_AGE {
                self.completed_log.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Default for TransferList {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TransferList {
    fn drop(&mut self) {
        if !self.lists.is_empty() {
            tracing::error!(
                pieces = self.lists.len(),
                "TransferList dropped while pieces are still in flight"
            );
        }
    }
}

// Records the chunk's bytes as failed variants on every block and counts how
// many blocks saw their matched variant tie or overtake the previous
// favourite.
fn update_failed(list: &mut BlockList, chunk: &[u8]) -> u32 {
    list.inc_failed();

    let mut promoted = 0;
    for block in list.blocks_mut() {
        if block.record_failed_variant(chunk) {
            promoted += 1;
        }
    }

    promoted
}

// Copies the most popular variant of each block back into the chunk, skipping
// blocks whose current variant already is the favourite.
fn retry_most_popular(list: &mut BlockList, chunk: &mut [u8]) {
    for block in list.blocks_mut() {
        block.restore_most_popular(chunk);
    }
}
