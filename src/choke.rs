//! Choke queues and groups.
//!
//! A [`ChokeQueue`] holds the connections of one group in one direction and
//! decides which of them to unchoke when the resource manager hands it a slot
//! quota. A [`ChokeGroup`] pairs an upload and a download queue and carries
//! the cursors marking its slice of the resource manager's entry array.
//!
//! The queue does not talk to sockets: choke decisions are applied through a
//! slot the embedder installs, and rate/interest observations are pushed in
//! from the peer I/O layer.

mod group;
mod queue;

pub use group::ChokeGroup;
pub use queue::{move_connections, ChokeQueue, ConnectionKey, Heuristics, QueuedConnection};

#[cfg(test)]
mod tests;
