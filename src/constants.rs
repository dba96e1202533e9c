//! Protocol constants and tuning parameters.
//!
//! Defaults follow what established clients ship with, adjusted where a BEP
//! pins an exact number.

use std::time::Duration;

// ============================================================================
// Client identification
// ============================================================================

/// Peer ID prefix (Azureus-style).
pub const CLIENT_PREFIX: &str = "-KP0010-";

/// Default BitTorrent listen port.
pub const DEFAULT_PORT: u16 = 6881;

// ============================================================================
// Block and piece sizes
// ============================================================================

/// Standard block size (16 KiB); the unit of peer request.
pub const BLOCK_SIZE: u32 = 16384;

// ============================================================================
// Tracker protocol
// ============================================================================

/// Hard cap on an HTTP tracker request.
pub const HTTP_TRACKER_TIMEOUT: Duration = Duration::from_secs(120);

/// Base timeout for one UDP tracker exchange (BEP-15).
pub const UDP_TRACKER_TIMEOUT: Duration = Duration::from_secs(15);

/// Send attempts per UDP tracker phase before giving up.
pub const UDP_TRACKER_TRIES: u32 = 2;

/// UDP tracker protocol magic (BEP-15 connect request).
pub const UDP_TRACKER_MAGIC: u64 = 0x41727101980;

/// UDP tracker connect request/response size.
pub const UDP_CONNECT_SIZE: usize = 16;

/// UDP tracker announce request size; the packet must be exactly this long.
pub const UDP_ANNOUNCE_SIZE: usize = 98;

/// Default announce interval when the tracker does not supply one.
pub const TRACKER_NORMAL_INTERVAL: Duration = Duration::from_secs(1800);

/// Default minimum announce interval.
pub const TRACKER_MIN_INTERVAL: Duration = Duration::from_secs(600);

/// A scrape that succeeded more recently than this is not repeated.
pub const SCRAPE_INTERVAL: Duration = Duration::from_secs(600);

/// Base delay for announce retry backoff after a failure.
pub const TRACKER_RETRY_BASE: Duration = Duration::from_secs(5);

/// Default number of peers requested from a tracker.
pub const DEFAULT_NUMWANT: i32 = 50;

// ============================================================================
// Transfer bookkeeping
// ============================================================================

/// Completed-piece log entries older than this may be pruned.
pub const COMPLETED_PRUNE_AGE: Duration = Duration::from_secs(60 * 60);

/// Completed-piece log entries younger than this are always retained, so a
/// consumer polling at this period observes every completion.
pub const COMPLETED_RETAIN_AGE: Duration = Duration::from_secs(30 * 60);

// ============================================================================
// Resource manager
// ============================================================================

/// Upper bound on the max-unchoked settings.
pub const MAX_UNCHOKED_LIMIT: u32 = 1 << 16;

/// Upper bound on a download's priority as exposed by the engine surface.
pub const MAX_DOWNLOAD_PRIORITY: u16 = 1024;

/// Priority a freshly added download starts with.
pub const DEFAULT_DOWNLOAD_PRIORITY: u16 = 2;
