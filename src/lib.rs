//! kelpie - A BitTorrent engine library
//!
//! This library implements the coordinating core of a BitTorrent client:
//! piece-by-piece download progress, fair allocation of unchoke slots across
//! groups of torrents, and the tracker announce/scrape lifecycle. Peer wire
//! I/O, disk I/O and hashing, and the DHT are external collaborators that the
//! engine talks to through slots and channels.
//!
//! # Modules
//!
//! - [`transfer`] - Per-piece block bookkeeping, hash failure policy, and the
//!   failed-variant vote that identifies peers sending corrupt data
//! - [`choke`] - Choke queues and groups deciding which peers get slots
//! - [`resource`] - The global tick that budgets unchoke slots across groups
//! - [`tracker`] - BEP-3/12/15 HTTP and UDP tracker state machines
//! - [`engine`] - The embedder surface: downloads, priorities, throttles
//! - [`metainfo`] - Torrent metadata needed to register a download
//! - [`bencode`] - Bencode decoding for tracker responses and metadata
//! - [`throttle`] - Global upload/download rate limiting

pub mod bencode;
pub mod choke;
pub mod constants;
pub mod engine;
pub mod metainfo;
pub mod resource;
pub mod throttle;
pub mod tracker;
pub mod transfer;

pub use bencode::{decode, encode, BencodeError, Value};
pub use choke::{ChokeGroup, ChokeQueue, ConnectionKey, Heuristics, QueuedConnection};
pub use engine::{ConnectionBudget, Download, DownloadId, Engine, EngineConfig, EngineError};
pub use metainfo::{Metainfo, MetainfoError};
pub use resource::{ResourceEntry, ResourceManager};
pub use throttle::Throttle;
pub use tracker::{
    AnnounceRequest, AnnounceResponse, ScrapeResponse, Tracker, TrackerError, TrackerEvent,
    TrackerId, TrackerKind, TrackerList, TrackerMessage,
};
pub use transfer::{BlockList, Piece, TransferError, TransferList, TransferRef};
