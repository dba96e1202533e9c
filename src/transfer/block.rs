use std::net::SocketAddr;

use bytes::Bytes;

/// A piece of the torrent payload: the unit of hash verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Piece {
    /// Piece index within the torrent.
    pub index: u32,
    /// Byte offset of the piece within the torrent payload.
    pub offset: u64,
    /// Piece length in bytes.
    pub length: u32,
}

impl Piece {
    pub fn new(index: u32, offset: u64, length: u32) -> Self {
        Self {
            index,
            offset,
            length,
        }
    }
}

/// A block's byte range within its piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub offset: u32,
    pub length: u32,
}

impl BlockRange {
    fn slice<'a>(&self, chunk: &'a [u8]) -> &'a [u8] {
        &chunk[self.offset as usize..(self.offset + self.length) as usize]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Idle,
    Outstanding,
    Finished,
}

/// A promise that a specific peer is delivering a specific block.
///
/// Transfers are appended to a block and never removed; past attempts stay
/// around carrying the index of the failed variant their peer delivered,
/// which is what the corruption vote runs on.
#[derive(Debug, Clone)]
pub struct BlockTransfer {
    pub peer: SocketAddr,
    /// Index into the block's failed-variant list of the data this peer
    /// delivered; `None` until a hash failure records it.
    pub failed_index: Option<u32>,
    pub(crate) leader: bool,
    pub(crate) valid: bool,
}

impl BlockTransfer {
    pub fn is_leader(&self) -> bool {
        self.leader
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

/// One distinct byte sequence seen for a block during hash failures, with
/// the number of times peers delivered it.
#[derive(Debug, Clone)]
pub struct FailedVariant {
    pub data: Bytes,
    pub count: u32,
}

#[derive(Debug)]
pub struct Block {
    range: BlockRange,
    state: BlockState,
    transfers: Vec<BlockTransfer>,
    failed_list: Vec<FailedVariant>,
    current: Option<usize>,
}

impl Block {
    fn new(range: BlockRange) -> Self {
        Self {
            range,
            state: BlockState::Idle,
            transfers: Vec::new(),
            failed_list: Vec::new(),
            current: None,
        }
    }

    pub fn range(&self) -> BlockRange {
        self.range
    }

    pub fn state(&self) -> BlockState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        self.state == BlockState::Finished
    }

    pub fn transfers(&self) -> &[BlockTransfer] {
        &self.transfers
    }

    pub fn failed_list(&self) -> &[FailedVariant] {
        &self.failed_list
    }

    pub fn current_variant(&self) -> Option<usize> {
        self.current
    }

    /// Adds a transfer for `peer`; the first live transfer leads. Returns the
    /// transfer's index within the block.
    pub(crate) fn push_transfer(&mut self, peer: SocketAddr) -> usize {
        let leader = !self.transfers.iter().any(|t| t.valid && t.leader);
        self.transfers.push(BlockTransfer {
            peer,
            failed_index: None,
            leader,
            valid: true,
        });
        if self.state == BlockState::Idle {
            self.state = BlockState::Outstanding;
        }
        self.transfers.len() - 1
    }

    pub(crate) fn transfer(&self, index: usize) -> Option<&BlockTransfer> {
        self.transfers.get(index)
    }

    /// Marks the transfer complete. The leader's completion finishes the
    /// block; a trailing duplicate just goes stale. Either way the transfer
    /// is spent and its ref no longer usable.
    pub(crate) fn complete_transfer(&mut self, index: usize) -> bool {
        let leader = self.transfers[index].leader;
        self.transfers[index].valid = false;
        if leader {
            self.state = BlockState::Finished;
        }
        leader
    }

    /// Invalidates every live transfer and resets the block for re-request.
    pub(crate) fn reset(&mut self) {
        for t in &mut self.transfers {
            t.valid = false;
        }
        self.state = BlockState::Idle;
    }

    // The transfer whose bytes are in the chunk for the current attempt:
    // the most recently appointed leader.
    fn leader_mut(&mut self) -> Option<&mut BlockTransfer> {
        self.transfers.iter_mut().rev().find(|t| t.leader)
    }

    fn max_count(&self) -> u32 {
        self.failed_list.iter().map(|v| v.count).max().unwrap_or(0)
    }

    fn find_variant(&self, data: &[u8]) -> Option<usize> {
        self.failed_list.iter().position(|v| v.data == data)
    }

    /// Records the chunk's bytes for this block as a failed variant, either
    /// bumping a matching entry or adding a new one, and points the leader's
    /// `failed_index` at it. Returns true when the variant came to tie or
    /// exceed the previous maximum refcount without already leading.
    pub(crate) fn record_failed_variant(&mut self, chunk: &[u8]) -> bool {
        let data = self.range.slice(chunk);
        let prev_max = self.max_count();

        let (index, promoted) = match self.find_variant(data) {
            Some(i) => {
                let was_current = self.current == Some(i);
                self.failed_list[i].count += 1;
                (i, !was_current && self.failed_list[i].count >= prev_max)
            }
            None => {
                self.failed_list.push(FailedVariant {
                    data: Bytes::copy_from_slice(data),
                    count: 1,
                });
                (self.failed_list.len() - 1, prev_max == 1)
            }
        };

        self.current = Some(index);
        if let Some(leader) = self.leader_mut() {
            leader.failed_index = Some(index as u32);
        }

        promoted
    }

    /// Copies the most popular variant into the chunk; ties resolve to the
    /// most recently recorded variant. Returns true when bytes moved.
    ///
    /// # Panics
    ///
    /// Panics if no variant has been recorded.
    pub(crate) fn restore_most_popular(&mut self, chunk: &mut [u8]) -> bool {
        let max = self.max_count();
        let best = self
            .failed_list
            .iter()
            .rposition(|v| v.count == max)
            .expect("restore_most_popular without any failed variant");

        if self.current == Some(best) {
            return false;
        }

        let dst = self.range.offset as usize;
        chunk[dst..dst + self.range.length as usize].copy_from_slice(&self.failed_list[best].data);
        self.current = Some(best);
        true
    }

    /// Points `current` at the variant matching the verified bytes, if any,
    /// and returns the peers whose recorded variant differs from it.
    pub(crate) fn failed_peers(&mut self, chunk: &[u8]) -> Vec<SocketAddr> {
        self.current = self.find_variant(self.range.slice(chunk));
        let good = self.current.map(|i| i as u32);

        self.transfers
            .iter()
            .filter_map(|t| match t.failed_index {
                Some(i) if Some(i) != good => Some(t.peer),
                _ => None,
            })
            .collect()
    }
}

/// The blocks of one in-flight piece, plus its failure bookkeeping.
#[derive(Debug)]
pub struct BlockList {
    piece: Piece,
    blocks: Vec<Block>,
    attempt: u32,
    failed: u32,
}

impl BlockList {
    pub(crate) fn new(piece: Piece, block_size: u32) -> Self {
        assert!(block_size > 0, "BlockList::new() with zero block size");

        let mut blocks = Vec::new();
        let mut offset = 0;
        while offset < piece.length {
            let length = block_size.min(piece.length - offset);
            blocks.push(Block::new(BlockRange { offset, length }));
            offset += length;
        }

        Self {
            piece,
            blocks,
            attempt: 0,
            failed: 0,
        }
    }

    pub fn piece(&self) -> Piece {
        self.piece
    }

    pub fn index(&self) -> u32 {
        self.piece.index
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub(crate) fn blocks_mut(&mut self) -> &mut [Block] {
        &mut self.blocks
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Which attempt this is: 0 until a hash failure promotes a variant
    /// retry, 1 afterwards.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub(crate) fn set_attempt(&mut self, attempt: u32) {
        self.attempt = attempt;
    }

    /// How many times this piece has failed verification.
    pub fn failed(&self) -> u32 {
        self.failed
    }

    pub(crate) fn inc_failed(&mut self) {
        self.failed += 1;
    }

    pub fn is_all_finished(&self) -> bool {
        self.blocks.iter().all(Block::is_finished)
    }

    /// Resets every block to idle for re-request, invalidating outstanding
    /// transfers but keeping their failed-variant history.
    pub(crate) fn do_all_failed(&mut self) {
        for block in &mut self.blocks {
            block.reset();
        }
    }
}
