use super::queue::{ChokeQueue, Heuristics};

/// A named bucket of downloads sharing a fairness allocation.
///
/// The group owns one queue per direction and remembers which slice of the
/// resource manager's entry array belongs to it as a half-open `[first,
/// last)` index range. The cursors are maintained incrementally on every
/// entry mutation and re-validated against a full scan each tick.
#[derive(Debug)]
pub struct ChokeGroup {
    name: String,
    up: ChokeQueue,
    down: ChokeQueue,
    first: usize,
    last: usize,
}

impl ChokeGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            up: ChokeQueue::new(Heuristics::UploadLeech),
            down: ChokeQueue::new(Heuristics::DownloadLeech),
            first: 0,
            last: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn up_queue(&self) -> &ChokeQueue {
        &self.up
    }

    pub fn up_queue_mut(&mut self) -> &mut ChokeQueue {
        &mut self.up
    }

    pub fn down_queue(&self) -> &ChokeQueue {
        &self.down
    }

    pub fn down_queue_mut(&mut self) -> &mut ChokeQueue {
        &mut self.down
    }

    pub fn first(&self) -> usize {
        self.first
    }

    pub fn last(&self) -> usize {
        self.last
    }

    pub fn set_range(&mut self, first: usize, last: usize) {
        debug_assert!(first <= last);
        self.first = first;
        self.last = last;
    }

    pub fn set_first(&mut self, first: usize) {
        self.first = first;
    }

    pub fn set_last(&mut self, last: usize) {
        self.last = last;
    }

    pub fn inc_cursors(&mut self) {
        self.first += 1;
        self.last += 1;
    }

    pub fn dec_cursors(&mut self) {
        self.first -= 1;
        self.last -= 1;
    }

    pub fn entry_count(&self) -> usize {
        self.last - self.first
    }

    pub fn up_unchoked(&self) -> u32 {
        self.up.size_unchoked()
    }

    pub fn down_unchoked(&self) -> u32 {
        self.down.size_unchoked()
    }

    pub fn up_requested(&self) -> u32 {
        self.up.requested()
    }

    pub fn down_requested(&self) -> u32 {
        self.down.requested()
    }
}
