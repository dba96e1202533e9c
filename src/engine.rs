//! The embedder-facing surface of the engine.
//!
//! An [`Engine`] is the context object tying the subsystems together:
//! registered downloads, the resource manager budgeting unchoke slots, the
//! global throttles, and the file-descriptor budget carved out of the
//! process's open-file limit. There is no global state; the embedder
//! constructs an engine, threads it through its main loop, and calls
//! [`Engine::receive_tick`] about once a second.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::distr::Alphanumeric;
use rand::Rng;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;

use crate::constants::{
    CLIENT_PREFIX, DEFAULT_NUMWANT, DEFAULT_PORT, MAX_DOWNLOAD_PRIORITY, UDP_TRACKER_TIMEOUT,
    UDP_TRACKER_TRIES,
};
use crate::metainfo::{Metainfo, MetainfoError};
use crate::resource::{ResourceEntry, ResourceManager};
use crate::throttle::Throttle;
use crate::tracker::{AnnounceStats, TrackerEvent, TrackerList, TrackerMessage};
use crate::transfer::TransferList;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid name for choke group: {0:?}")]
    DuplicateGroup(String),

    #[error("choke group not found")]
    UnknownGroup,

    #[error("download not found")]
    UnknownDownload,

    #[error("info hash already used by another download")]
    DuplicateInfoHash,

    #[error("priority must be between 0 and {MAX_DOWNLOAD_PRIORITY}")]
    InvalidPriority,

    #[error("max unchoked must be between 0 and 2^16")]
    InvalidMaxUnchoked,

    #[error("metainfo error: {0}")]
    Metainfo(#[from] MetainfoError),
}

/// Identifies a download within an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DownloadId(pub u64);

/// How the process's file-descriptor allowance is split between files,
/// reserved descriptors, and peer connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionBudget {
    pub max_files: u32,
    pub reserved: u32,
    pub connection_max: u32,
}

impl ConnectionBudget {
    /// Splits `open_max` descriptors. Anything not set aside for open files
    /// or the reserve is available for peer connections.
    pub fn from_open_max(open_max: u32) -> Self {
        let max_files = if open_max >= 8096 {
            256
        } else if open_max >= 1024 {
            128
        } else if open_max >= 512 {
            64
        } else if open_max >= 128 {
            16
        } else {
            // Assumes we are not run with fewer than 64.
            4
        };

        let reserved = if open_max >= 8096 {
            256
        } else if open_max >= 1024 {
            128
        } else if open_max >= 512 {
            64
        } else if open_max >= 128 {
            32
        } else {
            16
        };

        Self {
            max_files,
            reserved,
            connection_max: open_max.saturating_sub(max_files + reserved),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub port: u16,
    pub peer_id_prefix: String,
    /// Address UDP tracker sockets bind to.
    pub bind_ip: Option<IpAddr>,
    /// Address reported to trackers when not wildcard-bound.
    pub local_ip: Option<IpAddr>,
    pub numwant: i32,
    pub udp_timeout: Duration,
    pub udp_tries: u32,
    /// The process's open-file limit the connection budget is carved from.
    pub open_max: u32,
    pub max_upload_unchoked: u32,
    pub max_download_unchoked: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            peer_id_prefix: CLIENT_PREFIX.to_string(),
            bind_ip: None,
            local_ip: None,
            numwant: DEFAULT_NUMWANT,
            udp_timeout: UDP_TRACKER_TIMEOUT,
            udp_tries: UDP_TRACKER_TRIES,
            open_max: 1024,
            max_upload_unchoked: 0,
            max_download_unchoked: 0,
        }
    }
}

/// Shared transfer totals, readable from the announce path.
#[derive(Debug, Default)]
struct TransferTotals {
    uploaded: AtomicU64,
    downloaded: AtomicU64,
    left: AtomicU64,
}

/// One registered torrent: its identity, tracker list, and in-flight piece
/// bookkeeping.
pub struct Download {
    id: DownloadId,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    metainfo: Metainfo,
    trackers: TrackerList,
    transfers: TransferList,
    totals: Arc<TransferTotals>,
    rx: mpsc::UnboundedReceiver<TrackerMessage>,
    active: bool,
}

impl Download {
    fn new(id: DownloadId, metainfo: Metainfo, config: &EngineConfig) -> Self {
        let peer_id = generate_peer_id(&config.peer_id_prefix);
        let totals = Arc::new(TransferTotals {
            left: AtomicU64::new(metainfo.total_length),
            ..TransferTotals::default()
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let mut trackers = TrackerList::new(metainfo.info_hash, peer_id, config.port, tx);
        trackers.set_numwant(config.numwant);
        trackers.set_local_ip(config.local_ip);
        trackers.set_bind_ip(config.bind_ip);
        trackers.set_udp_timing(config.udp_timeout, config.udp_tries);

        let stats = totals.clone();
        trackers.set_slot_stats(move || AnnounceStats {
            uploaded: stats.uploaded.load(Ordering::Relaxed),
            downloaded: stats.downloaded.load(Ordering::Relaxed),
            left: stats.left.load(Ordering::Relaxed),
        });

        for (tier, urls) in metainfo.trackers.iter().enumerate() {
            for url in urls {
                let _ = trackers.insert_url(tier as u32, url, false);
            }
        }

        Self {
            id,
            info_hash: metainfo.info_hash,
            peer_id,
            metainfo,
            trackers,
            transfers: TransferList::new(),
            totals,
            rx,
            active: false,
        }
    }

    pub fn id(&self) -> DownloadId {
        self.id
    }

    pub fn info_hash(&self) -> &[u8; 20] {
        &self.info_hash
    }

    pub fn peer_id(&self) -> &[u8; 20] {
        &self.peer_id
    }

    pub fn metainfo(&self) -> &Metainfo {
        &self.metainfo
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn trackers(&self) -> &TrackerList {
        &self.trackers
    }

    pub fn trackers_mut(&mut self) -> &mut TrackerList {
        &mut self.trackers
    }

    pub fn transfers(&self) -> &TransferList {
        &self.transfers
    }

    pub fn transfers_mut(&mut self) -> &mut TransferList {
        &mut self.transfers
    }

    pub fn record_uploaded(&self, bytes: u64) {
        self.totals.uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_downloaded(&self, bytes: u64) {
        self.totals.downloaded.fetch_add(bytes, Ordering::Relaxed);
        let mut left = self.totals.left.load(Ordering::Relaxed);
        loop {
            let next = left.saturating_sub(bytes);
            match self.totals.left.compare_exchange_weak(
                left,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => left = actual,
            }
        }
    }

    pub fn uploaded(&self) -> u64 {
        self.totals.uploaded.load(Ordering::Relaxed)
    }

    pub fn downloaded(&self) -> u64 {
        self.totals.downloaded.load(Ordering::Relaxed)
    }

    pub fn left(&self) -> u64 {
        self.totals.left.load(Ordering::Relaxed)
    }

    /// Starts the download and announces `started` through the preferred
    /// tracker.
    pub fn start(&mut self) {
        if self.active {
            return;
        }
        self.active = true;
        self.announce(TrackerEvent::Started);
    }

    /// Stops the download: any non-stop announce in flight is cancelled and
    /// `stopped` goes out.
    pub fn stop(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        self.trackers
            .close_all_excluding(1 << TrackerEvent::Stopped.bit());
        self.announce(TrackerEvent::Stopped);
    }

    /// Announces `completed` once the payload verified fully.
    pub fn complete(&mut self) {
        self.announce(TrackerEvent::Completed);
    }

    fn announce(&mut self, event: TrackerEvent) {
        if let Some(index) = self.trackers.find_next_to_request(0) {
            let id = self.trackers.trackers()[index].id();
            self.trackers.send_state(id, event);
        }
    }

    /// Drains completed tracker requests into the list. Called from the
    /// main loop.
    pub fn process_tracker_messages(&mut self) {
        while let Ok(message) = self.rx.try_recv() {
            self.trackers.receive(message);
        }
    }
}

impl std::fmt::Debug for Download {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Download")
            .field("id", &self.id)
            .field("name", &self.metainfo.name)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

/// The engine context: downloads, slot budgeting, throttles.
pub struct Engine {
    config: EngineConfig,
    budget: ConnectionBudget,
    resource: ResourceManager,
    up_throttle: Throttle,
    down_throttle: Throttle,
    downloads: Vec<Download>,
    next_download_id: u64,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let budget = ConnectionBudget::from_open_max(config.open_max);

        let mut resource = ResourceManager::new();
        resource
            .push_group("default")
            .expect("fresh manager accepts the default group");
        resource
            .set_max_upload_unchoked(config.max_upload_unchoked)
            .expect("config validated by caller");
        resource
            .set_max_download_unchoked(config.max_download_unchoked)
            .expect("config validated by caller");

        info!(
            connection_max = budget.connection_max,
            max_files = budget.max_files,
            "engine initialized"
        );

        Self {
            config,
            budget,
            resource,
            up_throttle: Throttle::unlimited(),
            down_throttle: Throttle::unlimited(),
            downloads: Vec::new(),
            next_download_id: 0,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn connection_budget(&self) -> ConnectionBudget {
        self.budget
    }

    pub fn resource_manager(&self) -> &ResourceManager {
        &self.resource
    }

    pub fn resource_manager_mut(&mut self) -> &mut ResourceManager {
        &mut self.resource
    }

    pub fn up_throttle(&self) -> &Throttle {
        &self.up_throttle
    }

    pub fn down_throttle(&self) -> &Throttle {
        &self.down_throttle
    }

    /// True when no download is active.
    pub fn is_inactive(&self) -> bool {
        self.downloads.iter().all(|d| !d.is_active())
    }

    /// Registers a torrent from parsed metadata.
    pub fn add(&mut self, metainfo: Metainfo) -> Result<DownloadId, EngineError> {
        if self.find(&metainfo.info_hash).is_some() {
            return Err(EngineError::DuplicateInfoHash);
        }

        let id = DownloadId(self.next_download_id);
        self.next_download_id += 1;

        info!(name = %metainfo.name, "adding download");

        self.downloads.push(Download::new(id, metainfo, &self.config));
        self.resource
            .insert(ResourceEntry::new(id, 0, crate::constants::DEFAULT_DOWNLOAD_PRIORITY))
            .expect("default group always exists");

        Ok(id)
    }

    /// Unregisters a download, stopping it first.
    pub fn remove(&mut self, id: DownloadId) -> Result<(), EngineError> {
        let pos = self
            .downloads
            .iter()
            .position(|d| d.id() == id)
            .ok_or(EngineError::UnknownDownload)?;

        self.downloads[pos].stop();
        self.resource.erase(id);

        let mut download = self.downloads.remove(pos);
        // Let the stop announce finish on its own rather than aborting it
        // mid-request.
        download
            .trackers_mut()
            .disown_all_including(1 << TrackerEvent::Stopped.bit());
        download.transfers_mut().clear();

        Ok(())
    }

    pub fn downloads(&self) -> &[Download] {
        &self.downloads
    }

    pub fn get(&self, id: DownloadId) -> Option<&Download> {
        self.downloads.iter().find(|d| d.id() == id)
    }

    pub fn get_mut(&mut self, id: DownloadId) -> Option<&mut Download> {
        self.downloads.iter_mut().find(|d| d.id() == id)
    }

    pub fn find(&self, info_hash: &[u8; 20]) -> Option<&Download> {
        self.downloads.iter().find(|d| d.info_hash() == info_hash)
    }

    pub fn priority(&self, id: DownloadId) -> Result<u16, EngineError> {
        self.resource.priority(id)
    }

    pub fn set_priority(&mut self, id: DownloadId, priority: u16) -> Result<(), EngineError> {
        if priority > MAX_DOWNLOAD_PRIORITY {
            return Err(EngineError::InvalidPriority);
        }
        self.resource.set_priority(id, priority)
    }

    /// The once-per-second driver: delivers finished tracker requests and
    /// rebalances unchoke slots.
    pub fn receive_tick(&mut self) {
        for download in &mut self.downloads {
            download.process_tracker_messages();
        }
        self.resource.receive_tick();
    }

    /// Stops everything and consumes the engine. In-flight stop announces
    /// are left to finish detached.
    pub fn shutdown(mut self) {
        info!("engine shutting down");
        for download in &mut self.downloads {
            download.stop();
            download
                .trackers_mut()
                .disown_all_including(1 << TrackerEvent::Stopped.bit());
            download.transfers_mut().clear();
        }
    }
}

fn generate_peer_id(prefix: &str) -> [u8; 20] {
    let mut id = [0u8; 20];
    let prefix = prefix.as_bytes();
    let n = prefix.len().min(20);
    id[..n].copy_from_slice(&prefix[..n]);

    let mut rng = rand::rng();
    for byte in id.iter_mut().skip(n) {
        *byte = rng.sample(Alphanumeric);
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_metainfo(announce: &str) -> Metainfo {
        let pieces = "p".repeat(40);
        let data = format!(
            "d8:announce{}:{announce}4:infod6:lengthi65536e4:name4:demo12:piece lengthi32768e6:pieces40:{pieces}ee",
            announce.len()
        );
        Metainfo::from_bytes(data.as_bytes()).unwrap()
    }

    #[test]
    fn test_connection_budget_piecewise() {
        let budget = ConnectionBudget::from_open_max(16384);
        assert_eq!((budget.max_files, budget.reserved), (256, 256));
        assert_eq!(budget.connection_max, 16384 - 512);

        assert_eq!(
            ConnectionBudget::from_open_max(8096),
            ConnectionBudget {
                max_files: 256,
                reserved: 256,
                connection_max: 8096 - 512
            }
        );
        let b = ConnectionBudget::from_open_max(1024);
        assert_eq!((b.max_files, b.reserved), (128, 128));
        let b = ConnectionBudget::from_open_max(512);
        assert_eq!((b.max_files, b.reserved), (64, 64));
        let b = ConnectionBudget::from_open_max(128);
        assert_eq!((b.max_files, b.reserved), (16, 32));
        let b = ConnectionBudget::from_open_max(64);
        assert_eq!((b.max_files, b.reserved), (4, 16));
    }

    #[tokio::test]
    async fn test_add_and_find_downloads() {
        let mut engine = Engine::new(EngineConfig::default());
        let meta = sample_metainfo("http://t.example/announce");
        let hash = meta.info_hash;

        let id = engine.add(meta.clone()).unwrap();
        assert!(engine.find(&hash).is_some());
        assert_eq!(engine.get(id).unwrap().trackers().len(), 1);
        assert!(engine.is_inactive());

        assert!(matches!(
            engine.add(meta),
            Err(EngineError::DuplicateInfoHash)
        ));

        engine.remove(id).unwrap();
        assert!(engine.find(&hash).is_none());
        assert!(matches!(
            engine.remove(id),
            Err(EngineError::UnknownDownload)
        ));
    }

    #[tokio::test]
    async fn test_priority_bounds() {
        let mut engine = Engine::new(EngineConfig::default());
        let id = engine.add(sample_metainfo("http://t.example/announce")).unwrap();

        engine.set_priority(id, 1024).unwrap();
        assert_eq!(engine.priority(id).unwrap(), 1024);

        assert!(matches!(
            engine.set_priority(id, 1025),
            Err(EngineError::InvalidPriority)
        ));
    }

    #[tokio::test]
    async fn test_start_stop_toggles_activity() {
        let mut engine = Engine::new(EngineConfig::default());
        let id = engine.add(sample_metainfo("udp://127.0.0.1:1/announce")).unwrap();

        engine.get_mut(id).unwrap().start();
        assert!(!engine.is_inactive());
        assert!(engine.get(id).unwrap().trackers().has_active());

        engine.get_mut(id).unwrap().stop();
        assert!(engine.is_inactive());

        engine.receive_tick();
        engine.shutdown();
    }

    #[test]
    fn test_peer_id_has_prefix_and_full_length() {
        let id = generate_peer_id("-KP0010-");
        assert_eq!(&id[..8], b"-KP0010-");
        assert!(id[8..].iter().all(|b| b.is_ascii_alphanumeric()));

        let overlong = generate_peer_id("0123456789012345678901234");
        assert_eq!(&overlong, b"01234567890123456789");
    }

    #[tokio::test]
    async fn test_download_stats_feed_announces() {
        let mut engine = Engine::new(EngineConfig::default());
        let id = engine.add(sample_metainfo("http://t.example/announce")).unwrap();

        let d = engine.get(id).unwrap();
        assert_eq!(d.left(), 65536);

        d.record_downloaded(32768);
        d.record_uploaded(100);
        assert_eq!(d.left(), 32768);
        assert_eq!(d.downloaded(), 32768);
        assert_eq!(d.uploaded(), 100);
    }
}
