use std::net::SocketAddr;

use crate::engine::DownloadId;

/// Identifies one peer connection of one download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionKey {
    pub download: DownloadId,
    pub peer: SocketAddr,
}

/// Ranking policy for a queue.
///
/// Both shipped heuristics order interested connections by the observed rate
/// the embedder feeds the queue; which rate that is depends on the queue's
/// direction (peers we download fastest from for upload reciprocation, peers
/// that serve us best for download interest).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Heuristics {
    UploadLeech,
    DownloadLeech,
}

/// A connection as the choke layer sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedConnection {
    pub key: ConnectionKey,
    /// Observed transfer rate in bytes per second, direction-appropriate.
    pub rate: u64,
    /// Whether the peer wants a slot.
    pub interested: bool,
    pub unchoked: bool,
}

impl QueuedConnection {
    pub fn new(key: ConnectionKey) -> Self {
        Self {
            key,
            rate: 0,
            interested: false,
            unchoked: false,
        }
    }
}

type ChokeSlot = Box<dyn FnMut(&ConnectionKey, bool) + Send>;

/// An ordered set of connections competing for unchoke slots.
pub struct ChokeQueue {
    heuristics: Heuristics,
    connections: Vec<QueuedConnection>,
    slot_connection: ChokeSlot,
}

impl ChokeQueue {
    pub fn new(heuristics: Heuristics) -> Self {
        Self {
            heuristics,
            connections: Vec::new(),
            slot_connection: Box::new(|_, _| {}),
        }
    }

    /// Installs the slot that applies a choke (`true`) or unchoke (`false`)
    /// to a connection.
    pub fn set_slot_connection(&mut self, slot: impl FnMut(&ConnectionKey, bool) + Send + 'static) {
        self.slot_connection = Box::new(slot);
    }

    pub fn heuristics(&self) -> Heuristics {
        self.heuristics
    }

    pub fn set_heuristics(&mut self, heuristics: Heuristics) {
        self.heuristics = heuristics;
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn connections(&self) -> &[QueuedConnection] {
        &self.connections
    }

    pub fn contains(&self, key: &ConnectionKey) -> bool {
        self.connections.iter().any(|c| c.key == *key)
    }

    pub fn insert(&mut self, connection: QueuedConnection) {
        debug_assert!(!self.contains(&connection.key));
        self.connections.push(connection);
    }

    pub fn remove(&mut self, key: &ConnectionKey) -> Option<QueuedConnection> {
        let pos = self.connections.iter().position(|c| c.key == *key)?;
        Some(self.connections.remove(pos))
    }

    /// Updates the observed rate used for ranking.
    pub fn set_rate(&mut self, key: &ConnectionKey, rate: u64) {
        if let Some(c) = self.connections.iter_mut().find(|c| c.key == *key) {
            c.rate = rate;
        }
    }

    /// Updates the peer's interest flag; the next cycle reconciles slots.
    pub fn set_interested(&mut self, key: &ConnectionKey, interested: bool) {
        if let Some(c) = self.connections.iter_mut().find(|c| c.key == *key) {
            c.interested = interested;
        }
    }

    pub fn size_unchoked(&self) -> u32 {
        self.connections.iter().filter(|c| c.unchoked).count() as u32
    }

    /// How many additional slots this queue could use right now.
    pub fn requested(&self) -> u32 {
        self.connections
            .iter()
            .filter(|c| c.interested && !c.unchoked)
            .count() as u32
    }

    /// Reshuffles the queue against a slot quota and returns the change in
    /// unchoked count.
    ///
    /// A quota of `u32::MAX` runs the pure heuristic pass: every interested
    /// connection is unchoked. Otherwise the `quota` best-ranked interested
    /// connections hold slots afterwards and everyone else is choked.
    pub fn cycle(&mut self, quota: u32) -> i32 {
        let before = self.size_unchoked() as i32;

        let mut ranked: Vec<usize> = (0..self.connections.len())
            .filter(|&i| self.connections[i].interested)
            .collect();
        // Stable by rate, so insertion order breaks ties.
        ranked.sort_by(|&a, &b| self.connections[b].rate.cmp(&self.connections[a].rate));

        if quota != u32::MAX {
            ranked.truncate(quota as usize);
        }

        let mut give = vec![false; self.connections.len()];
        for i in ranked {
            give[i] = true;
        }

        for (i, want) in give.into_iter().enumerate() {
            let c = &mut self.connections[i];
            if c.unchoked != want {
                c.unchoked = want;
                (self.slot_connection)(&c.key, !want);
            }
        }

        self.size_unchoked() as i32 - before
    }

    /// Unchokes one connection outside the tick, for instance when a slot
    /// frees up and an interested peer is waiting. Returns the delta to
    /// report to the resource manager.
    pub fn unchoke_manual(&mut self, key: &ConnectionKey) -> i32 {
        self.flip(key, true)
    }

    /// Chokes one connection outside the tick.
    pub fn choke_manual(&mut self, key: &ConnectionKey) -> i32 {
        self.flip(key, false)
    }

    fn flip(&mut self, key: &ConnectionKey, unchoke: bool) -> i32 {
        match self.connections.iter_mut().find(|c| c.key == *key) {
            Some(c) if c.unchoked != unchoke => {
                c.unchoked = unchoke;
                (self.slot_connection)(&c.key, !unchoke);
                if unchoke {
                    1
                } else {
                    -1
                }
            }
            _ => 0,
        }
    }

    /// Removes every connection belonging to `download`, choking the ones
    /// holding slots first. Returns the connections and the unchoke delta.
    pub(crate) fn evict_download(&mut self, download: DownloadId) -> (Vec<QueuedConnection>, i32) {
        let mut evicted = Vec::new();
        let mut delta = 0;

        let mut i = 0;
        while i < self.connections.len() {
            if self.connections[i].key.download == download {
                let mut c = self.connections.remove(i);
                if c.unchoked {
                    c.unchoked = false;
                    delta -= 1;
                    (self.slot_connection)(&c.key, true);
                }
                evicted.push(c);
            } else {
                i += 1;
            }
        }

        (evicted, delta)
    }

    /// Takes `download`'s connections out without touching their choke
    /// state, for a move between queues.
    pub(crate) fn take_download(&mut self, download: DownloadId) -> Vec<QueuedConnection> {
        let mut taken = Vec::new();
        let mut i = 0;
        while i < self.connections.len() {
            if self.connections[i].key.download == download {
                taken.push(self.connections.remove(i));
            } else {
                i += 1;
            }
        }
        taken
    }
}

impl std::fmt::Debug for ChokeQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChokeQueue")
            .field("heuristics", &self.heuristics)
            .field("connections", &self.connections)
            .finish_non_exhaustive()
    }
}

/// Moves a download's connections between queues, keeping their choke state.
///
/// Either side may be absent: moving out of `None` is a no-op, moving into
/// `None` drops the connections (the caller is expected to have evicted or
/// accounted for any held slots).
pub fn move_connections(
    src: Option<&mut ChokeQueue>,
    dst: Option<&mut ChokeQueue>,
    download: DownloadId,
) {
    let Some(src) = src else { return };
    let moved = src.take_download(download);

    if let Some(dst) = dst {
        for c in moved {
            dst.insert(c);
        }
    }
}
