//! Tracker protocols and per-torrent tracker scheduling (BEP-3, BEP-12,
//! BEP-15, BEP-23).
//!
//! Each torrent owns a [`TrackerList`]: its trackers partitioned into
//! preference-ordered groups. Announces and scrapes run as spawned tasks
//! that complete into the list's message channel; the embedder drains the
//! channel on its main loop and hands each [`TrackerMessage`] back to
//! [`TrackerList::receive`], which updates counters, promotes the winning
//! tracker to the front of its group, and invokes the installed slots.
//!
//! A tracker that succeeds is asked again first next time; one that fails is
//! retried with exponential backoff while the rest of its group is rotated
//! in via [`TrackerList::cycle_group`] and [`TrackerList::find_next_to_request`].

mod error;
mod http;
mod list;
mod response;
mod tracker;
mod udp;

pub use error::TrackerError;
pub use http::{build_announce_url, can_scrape, scrape_url_from};
pub use list::{AnnounceStats, TrackerList, TrackerMessage, TrackerMessageBody};
pub use response::{
    parse_compact_peers, parse_compact_peers6, AnnounceRequest, AnnounceResponse, ScrapeResponse,
    TrackerEvent,
};
pub use tracker::{Tracker, TrackerId, TrackerKind, FLAG_CAN_SCRAPE, FLAG_ENABLED, FLAG_EXTRA_TRACKER};

#[cfg(test)]
mod tests;
