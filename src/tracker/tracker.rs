use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use super::http;
use super::response::TrackerEvent;
use crate::constants::{TRACKER_MIN_INTERVAL, TRACKER_NORMAL_INTERVAL, TRACKER_RETRY_BASE};

/// Stable identity of a tracker within its list, independent of the
/// preference reordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackerId(pub u32);

pub const FLAG_ENABLED: u32 = 1;
/// Added by the user after load rather than from the metadata.
pub const FLAG_EXTRA_TRACKER: u32 = 1 << 1;
pub const FLAG_CAN_SCRAPE: u32 = 1 << 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerKind {
    Http,
    Udp,
    /// Placeholder for swarms found through the DHT; never announced to
    /// directly.
    Dht,
}

pub(super) struct InFlight {
    pub request_id: u64,
    pub handle: JoinHandle<()>,
}

/// One remote tracker endpoint and its announce/scrape bookkeeping.
///
/// The network work itself runs in a spawned task; this object only tracks
/// whether one is in flight and accumulates the counters and intervals the
/// scheduling policy reads.
pub struct Tracker {
    id: TrackerId,
    url: String,
    group: u32,
    flags: u32,
    kind: TrackerKind,
    latest_event: TrackerEvent,
    success_counter: u32,
    failed_counter: u32,
    scrape_counter: u32,
    pub(super) success_time_last: Option<Instant>,
    pub(super) failed_time_last: Option<Instant>,
    pub(super) scrape_time_last: Option<Instant>,
    normal_interval: Duration,
    min_interval: Duration,
    tracker_id: Option<String>,
    pub(super) scrape_complete: u32,
    pub(super) scrape_incomplete: u32,
    pub(super) scrape_downloaded: u32,
    pub(super) latest_sum_peers: u32,
    pub(super) latest_new_peers: u32,
    request_counter: u32,
    pub(super) busy: Option<InFlight>,
}

impl Tracker {
    pub(super) fn new(id: TrackerId, url: String, group: u32, flags: u32, kind: TrackerKind) -> Self {
        let mut flags = flags;
        if kind == TrackerKind::Http && http::can_scrape(&url) {
            flags |= FLAG_CAN_SCRAPE;
        }

        Self {
            id,
            url,
            group,
            flags,
            kind,
            latest_event: TrackerEvent::None,
            success_counter: 0,
            failed_counter: 0,
            scrape_counter: 0,
            success_time_last: None,
            failed_time_last: None,
            scrape_time_last: None,
            normal_interval: TRACKER_NORMAL_INTERVAL,
            min_interval: TRACKER_MIN_INTERVAL,
            tracker_id: None,
            scrape_complete: 0,
            scrape_incomplete: 0,
            scrape_downloaded: 0,
            latest_sum_peers: 0,
            latest_new_peers: 0,
            request_counter: 0,
            busy: None,
        }
    }

    pub fn id(&self) -> TrackerId {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn group(&self) -> u32 {
        self.group
    }

    pub fn kind(&self) -> TrackerKind {
        self.kind
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn is_enabled(&self) -> bool {
        self.flags & FLAG_ENABLED != 0
    }

    pub fn is_extra(&self) -> bool {
        self.flags & FLAG_EXTRA_TRACKER != 0
    }

    pub fn can_scrape(&self) -> bool {
        self.flags & FLAG_CAN_SCRAPE != 0
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        if enabled {
            self.flags |= FLAG_ENABLED;
        } else {
            self.flags &= !FLAG_ENABLED;
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.is_some()
    }

    pub fn is_busy_not_scrape(&self) -> bool {
        self.is_busy() && self.latest_event != TrackerEvent::Scrape
    }

    /// Enabled and of a kind we can announce to.
    pub fn is_usable(&self) -> bool {
        self.is_enabled() && self.kind != TrackerKind::Dht
    }

    pub fn can_request_state(&self) -> bool {
        self.is_usable() && !self.is_busy()
    }

    pub fn latest_event(&self) -> TrackerEvent {
        self.latest_event
    }

    pub(super) fn set_latest_event(&mut self, event: TrackerEvent) {
        self.latest_event = event;
    }

    pub fn success_counter(&self) -> u32 {
        self.success_counter
    }

    pub fn failed_counter(&self) -> u32 {
        self.failed_counter
    }

    pub fn scrape_counter(&self) -> u32 {
        self.scrape_counter
    }

    pub fn request_counter(&self) -> u32 {
        self.request_counter
    }

    pub(super) fn inc_request_counter(&mut self) {
        self.request_counter += 1;
    }

    pub(super) fn record_success(&mut self, now: Instant) {
        self.success_time_last = Some(now);
        self.success_counter += 1;
        self.failed_counter = 0;
    }

    pub(super) fn record_failure(&mut self, now: Instant) {
        self.failed_time_last = Some(now);
        self.failed_counter += 1;
    }

    pub(super) fn record_scrape(&mut self, now: Instant) {
        self.scrape_time_last = Some(now);
        self.scrape_counter += 1;
    }

    pub fn normal_interval(&self) -> Duration {
        self.normal_interval
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub(super) fn set_normal_interval(&mut self, interval: Duration) {
        self.normal_interval = interval;
    }

    pub(super) fn set_min_interval(&mut self, interval: Duration) {
        self.min_interval = interval;
    }

    pub fn tracker_id(&self) -> Option<&str> {
        self.tracker_id.as_deref()
    }

    pub(super) fn set_tracker_id(&mut self, id: Option<String>) {
        if id.is_some() {
            self.tracker_id = id;
        }
    }

    /// Seeders last reported by this tracker.
    pub fn scrape_complete(&self) -> u32 {
        self.scrape_complete
    }

    /// Leechers last reported by this tracker.
    pub fn scrape_incomplete(&self) -> u32 {
        self.scrape_incomplete
    }

    /// Snatches last reported by this tracker.
    pub fn scrape_downloaded(&self) -> u32 {
        self.scrape_downloaded
    }

    pub fn latest_sum_peers(&self) -> u32 {
        self.latest_sum_peers
    }

    pub fn latest_new_peers(&self) -> u32 {
        self.latest_new_peers
    }

    /// When the next regular announce to this tracker is due. `None` means
    /// immediately.
    pub fn success_time_next(&self) -> Option<Instant> {
        self.success_time_last.map(|t| t + self.normal_interval)
    }

    /// When the next retry after a failure is due, backing off
    /// exponentially with consecutive failures up to the normal interval.
    pub fn failed_time_next(&self) -> Option<Instant> {
        self.failed_time_last.map(|t| {
            let exp = self.failed_counter.saturating_sub(1).min(6);
            t + (TRACKER_RETRY_BASE * (1 << exp)).min(self.normal_interval)
        })
    }

    pub fn scrape_time_last(&self) -> Option<Instant> {
        self.scrape_time_last
    }

    /// Aborts any in-flight request. Counters are untouched.
    pub fn close(&mut self) {
        if let Some(in_flight) = self.busy.take() {
            debug!(url = %self.url, "tracker request cancelled");
            in_flight.handle.abort();
        }
    }

    /// Detaches any in-flight request: the task keeps running and its
    /// eventual completion message is discarded as stale.
    pub fn disown(&mut self) {
        if let Some(_in_flight) = self.busy.take() {
            debug!(url = %self.url, "tracker request disowned");
        }
    }

    pub(super) fn clear_stats(&mut self) {
        self.success_counter = 0;
        self.failed_counter = 0;
        self.scrape_counter = 0;
        self.scrape_complete = 0;
        self.scrape_incomplete = 0;
        self.scrape_downloaded = 0;
        self.latest_sum_peers = 0;
        self.latest_new_peers = 0;
        self.request_counter = 0;
    }
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracker")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("group", &self.group)
            .field("kind", &self.kind)
            .field("busy", &self.busy.is_some())
            .field("success", &self.success_counter)
            .field("failed", &self.failed_counter)
            .finish_non_exhaustive()
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        // A dropped tracker must not leave its task free to send into the
        // channel under a recycled id.
        self.close();
    }
}
