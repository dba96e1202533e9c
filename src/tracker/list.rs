use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use reqwest::Client;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::error::TrackerError;
use super::response::{AnnounceRequest, AnnounceResponse, ScrapeResponse, TrackerEvent};
use super::tracker::{InFlight, Tracker, TrackerId, TrackerKind, FLAG_ENABLED, FLAG_EXTRA_TRACKER};
use super::{http, udp};
use crate::constants::{
    DEFAULT_NUMWANT, HTTP_TRACKER_TIMEOUT, SCRAPE_INTERVAL, TRACKER_MIN_INTERVAL,
    TRACKER_NORMAL_INTERVAL, UDP_TRACKER_TIMEOUT, UDP_TRACKER_TRIES,
};

/// Transfer totals reported with every announce.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnnounceStats {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

/// A completed tracker request, delivered through the list's channel.
#[derive(Debug)]
pub struct TrackerMessage {
    pub tracker: TrackerId,
    pub request_id: u64,
    pub body: TrackerMessageBody,
}

#[derive(Debug)]
pub enum TrackerMessageBody {
    Announce(Result<AnnounceResponse, TrackerError>),
    Scrape(Result<ScrapeResponse, TrackerError>),
}

type SuccessSlot = Box<dyn FnMut(&Tracker, &[SocketAddr]) -> u32 + Send>;
type FailedSlot = Box<dyn FnMut(&Tracker, &str) + Send>;
type ScrapeSuccessSlot = Box<dyn FnMut(&Tracker) + Send>;
type StatsSlot = Box<dyn Fn() -> AnnounceStats + Send>;

/// The ordered, group-partitioned trackers of one torrent.
///
/// Entries stay stable-sorted by group id; within a group the front is the
/// currently preferred tracker, and a successful announce promotes its
/// tracker there with a single swap.
pub struct TrackerList {
    trackers: Vec<Tracker>,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    port: u16,
    key: u32,
    numwant: i32,
    local_ip: Option<IpAddr>,
    bind_ip: Option<IpAddr>,
    udp_timeout: Duration,
    udp_tries: u32,
    dht_allowed: bool,
    next_tracker_id: u32,
    next_request_id: u64,
    client: Client,
    tx: mpsc::UnboundedSender<TrackerMessage>,
    slot_success: SuccessSlot,
    slot_failed: FailedSlot,
    slot_scrape_success: ScrapeSuccessSlot,
    slot_scrape_failed: FailedSlot,
    slot_stats: StatsSlot,
}

impl TrackerList {
    pub fn new(
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        port: u16,
        tx: mpsc::UnboundedSender<TrackerMessage>,
    ) -> Self {
        Self {
            trackers: Vec::new(),
            info_hash,
            peer_id,
            port,
            key: rand::rng().random(),
            numwant: DEFAULT_NUMWANT,
            local_ip: None,
            bind_ip: None,
            udp_timeout: UDP_TRACKER_TIMEOUT,
            udp_tries: UDP_TRACKER_TRIES,
            dht_allowed: false,
            next_tracker_id: 0,
            next_request_id: 0,
            client: Client::builder()
                .timeout(HTTP_TRACKER_TIMEOUT)
                .build()
                .expect("failed to build tracker HTTP client"),
            tx,
            slot_success: Box::new(|_, peers| peers.len() as u32),
            slot_failed: Box::new(|_, _| {}),
            slot_scrape_success: Box::new(|_| {}),
            slot_scrape_failed: Box::new(|_, _| {}),
            slot_stats: Box::new(AnnounceStats::default),
        }
    }

    pub fn set_slot_success(
        &mut self,
        slot: impl FnMut(&Tracker, &[SocketAddr]) -> u32 + Send + 'static,
    ) {
        self.slot_success = Box::new(slot);
    }

    pub fn set_slot_failed(&mut self, slot: impl FnMut(&Tracker, &str) + Send + 'static) {
        self.slot_failed = Box::new(slot);
    }

    pub fn set_slot_scrape_success(&mut self, slot: impl FnMut(&Tracker) + Send + 'static) {
        self.slot_scrape_success = Box::new(slot);
    }

    pub fn set_slot_scrape_failed(&mut self, slot: impl FnMut(&Tracker, &str) + Send + 'static) {
        self.slot_scrape_failed = Box::new(slot);
    }

    /// Installs the provider of uploaded/downloaded/left totals.
    pub fn set_slot_stats(&mut self, slot: impl Fn() -> AnnounceStats + Send + 'static) {
        self.slot_stats = Box::new(slot);
    }

    pub fn set_numwant(&mut self, numwant: i32) {
        self.numwant = numwant;
    }

    pub fn key(&self) -> u32 {
        self.key
    }

    pub fn set_key(&mut self, key: u32) {
        self.key = key;
    }

    pub fn set_local_ip(&mut self, ip: Option<IpAddr>) {
        self.local_ip = ip;
    }

    pub fn set_bind_ip(&mut self, ip: Option<IpAddr>) {
        self.bind_ip = ip;
    }

    pub fn set_udp_timing(&mut self, timeout: Duration, tries: u32) {
        self.udp_timeout = timeout;
        self.udp_tries = tries;
    }

    pub fn set_dht_allowed(&mut self, allowed: bool) {
        self.dht_allowed = allowed;
    }

    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }

    pub fn trackers(&self) -> &[Tracker] {
        &self.trackers
    }

    pub fn get(&self, id: TrackerId) -> Option<&Tracker> {
        self.trackers.iter().find(|t| t.id() == id)
    }

    fn get_mut(&mut self, id: TrackerId) -> Option<&mut Tracker> {
        self.trackers.iter_mut().find(|t| t.id() == id)
    }

    fn position(&self, id: TrackerId) -> Option<usize> {
        self.trackers.iter().position(|t| t.id() == id)
    }

    pub fn find_url(&self, url: &str) -> Option<&Tracker> {
        self.trackers.iter().find(|t| t.url() == url)
    }

    pub fn has_active(&self) -> bool {
        self.trackers.iter().any(Tracker::is_busy)
    }

    pub fn has_active_not_scrape(&self) -> bool {
        self.trackers.iter().any(Tracker::is_busy_not_scrape)
    }

    pub fn has_usable(&self) -> bool {
        self.trackers.iter().any(Tracker::is_usable)
    }

    pub fn count_active(&self) -> usize {
        self.trackers.iter().filter(|t| t.is_busy()).count()
    }

    pub fn count_usable(&self) -> usize {
        self.trackers.iter().filter(|t| t.is_usable()).count()
    }

    /// Index of the first tracker of `group`.
    pub fn begin_group(&self, group: u32) -> usize {
        self.trackers
            .iter()
            .position(|t| t.group() >= group)
            .unwrap_or(self.trackers.len())
    }

    /// Index one past the last tracker of `group`.
    pub fn end_group(&self, group: u32) -> usize {
        self.trackers
            .iter()
            .position(|t| t.group() > group)
            .unwrap_or(self.trackers.len())
    }

    pub fn size_group(&self) -> u32 {
        self.trackers.last().map(|t| t.group() + 1).unwrap_or(0)
    }

    /// Dispatches on the URL scheme and appends the tracker to its group.
    ///
    /// Unknown schemes log a warning and are skipped, unless the tracker was
    /// explicitly added by the user (`extra`), which makes it an error.
    pub fn insert_url(
        &mut self,
        group: u32,
        url: &str,
        extra: bool,
    ) -> Result<Option<TrackerId>, TrackerError> {
        let mut flags = FLAG_ENABLED;
        if extra {
            flags |= FLAG_EXTRA_TRACKER;
        }

        let kind = if url.starts_with("http://") || url.starts_with("https://") {
            TrackerKind::Http
        } else if url.starts_with("udp://") {
            TrackerKind::Udp
        } else if url.starts_with("dht://") && self.dht_allowed {
            TrackerKind::Dht
        } else {
            warn!(%url, "no matching tracker protocol");
            if extra {
                return Err(TrackerError::UnsupportedScheme(url.to_string()));
            }
            return Ok(None);
        };

        let id = TrackerId(self.next_tracker_id);
        self.next_tracker_id += 1;

        let tracker = Tracker::new(id, url.to_string(), group, flags, kind);
        let pos = self.end_group(group);
        self.trackers.insert(pos, tracker);

        info!(group, %url, "added tracker");
        Ok(Some(id))
    }

    /// Announces `event` through the tracker unless it is unusable or
    /// already announcing. A tracker busy with a mere scrape has the scrape
    /// cancelled in favour of the announce.
    pub fn send_state(&mut self, id: TrackerId, event: TrackerEvent) {
        let Some(tracker) = self.get_mut(id) else { return };

        if !tracker.is_usable() || event == TrackerEvent::Scrape {
            return;
        }

        if tracker.is_busy() {
            if tracker.latest_event() != TrackerEvent::Scrape {
                return;
            }
            tracker.close();
        }

        info!(
            event = event.as_query_str(),
            group = tracker.group(),
            url = tracker.url(),
            "sending announce"
        );

        let stats = (self.slot_stats)();
        let info_hash = self.info_hash;
        let peer_id = self.peer_id;
        let port = self.port;
        let key = self.key;
        let numwant = self.numwant;
        let local_ip = self.local_ip;
        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let tracker = self.get_mut(id).expect("tracker vanished");
        tracker.set_latest_event(event);
        tracker.inc_request_counter();

        let req = AnnounceRequest {
            url: tracker.url().to_string(),
            info_hash,
            peer_id,
            port,
            uploaded: stats.uploaded,
            downloaded: stats.downloaded,
            left: stats.left,
            event,
            key,
            numwant,
            tracker_id: tracker.tracker_id().map(String::from),
            local_ip,
        };

        let kind = tracker.kind();
        let client = self.client.clone();
        let bind_ip = self.bind_ip;
        let udp_timeout = self.udp_timeout;
        let udp_tries = self.udp_tries;
        let tx = self.tx.clone();

        let handle = tokio::spawn(async move {
            let result = match kind {
                TrackerKind::Http => http::announce(&client, &req).await,
                TrackerKind::Udp => udp::announce(&req, bind_ip, udp_timeout, udp_tries).await,
                TrackerKind::Dht => unreachable!("dht trackers are never usable"),
            };
            let _ = tx.send(TrackerMessage {
                tracker: id,
                request_id,
                body: TrackerMessageBody::Announce(result),
            });
        });

        let tracker = self.get_mut(id).expect("tracker vanished");
        tracker.busy = Some(InFlight { request_id, handle });
    }

    /// Issues a scrape unless the tracker is busy, unusable, unable to
    /// scrape, or scraped successfully within the last ten minutes.
    pub fn send_scrape(&mut self, id: TrackerId) {
        let Some(tracker) = self.get_mut(id) else { return };

        if tracker.is_busy() || !tracker.is_usable() || !tracker.can_scrape() {
            return;
        }

        if let Some(last) = tracker.scrape_time_last {
            if last + SCRAPE_INTERVAL > Instant::now() {
                return;
            }
        }

        info!(group = tracker.group(), url = tracker.url(), "sending scrape");

        tracker.set_latest_event(TrackerEvent::Scrape);
        tracker.inc_request_counter();

        let url = tracker.url().to_string();
        let info_hash = self.info_hash;
        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let client = self.client.clone();
        let tx = self.tx.clone();

        let handle = tokio::spawn(async move {
            let result = http::scrape(&client, &url, &info_hash).await;
            let _ = tx.send(TrackerMessage {
                tracker: id,
                request_id,
                body: TrackerMessageBody::Scrape(result),
            });
        });

        let tracker = self.get_mut(id).expect("tracker vanished");
        tracker.busy = Some(InFlight { request_id, handle });
    }

    /// Routes a completed request back into the list. Messages whose
    /// request id no longer matches the tracker's in-flight request are
    /// stale (closed or disowned) and are discarded.
    pub fn receive(&mut self, message: TrackerMessage) {
        let Some(tracker) = self.get_mut(message.tracker) else {
            debug!("dropping message for removed tracker");
            return;
        };

        match &tracker.busy {
            Some(in_flight) if in_flight.request_id == message.request_id => {}
            _ => {
                debug!(url = tracker.url(), "dropping stale tracker message");
                return;
            }
        }
        tracker.busy = None;

        match message.body {
            TrackerMessageBody::Announce(Ok(response)) => {
                self.adopt_fields(message.tracker, &response, true);
                let peers: Vec<SocketAddr> = response.all_peers().copied().collect();
                self.receive_success(message.tracker, peers);
            }
            TrackerMessageBody::Announce(Err(error)) => {
                if let TrackerError::Failure {
                    fields: Some(fields),
                    ..
                } = &error
                {
                    self.adopt_fields(message.tracker, fields, false);
                }
                self.receive_failed(message.tracker, &error.to_string());
            }
            TrackerMessageBody::Scrape(Ok(response)) => {
                self.receive_scrape_success(message.tracker, response);
            }
            TrackerMessageBody::Scrape(Err(error)) => {
                self.receive_scrape_failed(message.tracker, &error.to_string());
            }
        }
    }

    // Intervals, tracker id, and swarm counts reported by the tracker. A
    // successful announce falls back to the default intervals when the
    // tracker omits them; a failure only adopts what was actually sent.
    fn adopt_fields(&mut self, id: TrackerId, response: &AnnounceResponse, apply_defaults: bool) {
        let Some(tracker) = self.get_mut(id) else { return };

        match response.interval {
            Some(interval) => tracker.set_normal_interval(Duration::from_secs(interval as u64)),
            None if apply_defaults => tracker.set_normal_interval(TRACKER_NORMAL_INTERVAL),
            None => {}
        }
        match response.min_interval {
            Some(interval) => tracker.set_min_interval(Duration::from_secs(interval as u64)),
            None if apply_defaults => tracker.set_min_interval(TRACKER_MIN_INTERVAL),
            None => {}
        }

        tracker.set_tracker_id(response.tracker_id.clone());

        if let (Some(complete), Some(incomplete)) = (response.complete, response.incomplete) {
            tracker.scrape_complete = complete;
            tracker.scrape_incomplete = incomplete;
            tracker.scrape_time_last = Some(Instant::now());
        }
        if let Some(downloaded) = response.downloaded {
            tracker.scrape_downloaded = downloaded;
        }
    }

    /// Applies a successful announce: the tracker is promoted to the front
    /// of its group, the address list is deduplicated and handed to the
    /// success slot, and the failure streak resets.
    ///
    /// # Panics
    ///
    /// Panics if the tracker is unknown or still marked busy.
    pub fn receive_success(&mut self, id: TrackerId, mut peers: Vec<SocketAddr>) {
        let pos = self
            .position(id)
            .expect("TrackerList::receive_success() unknown tracker");
        assert!(
            !self.trackers[pos].is_busy(),
            "TrackerList::receive_success() called on a busy tracker"
        );

        let pos = self.promote(pos);

        peers.sort();
        peers.dedup();

        info!(
            peers = peers.len(),
            url = self.trackers[pos].url(),
            "tracker announce succeeded"
        );

        self.trackers[pos].record_success(Instant::now());
        self.trackers[pos].latest_sum_peers = peers.len() as u32;
        let new_peers = (self.slot_success)(&self.trackers[pos], &peers);
        self.trackers[pos].latest_new_peers = new_peers;
    }

    /// Applies a failed announce: the failure streak grows and no
    /// promotion happens.
    ///
    /// # Panics
    ///
    /// Panics if the tracker is unknown or still marked busy.
    pub fn receive_failed(&mut self, id: TrackerId, msg: &str) {
        let pos = self
            .position(id)
            .expect("TrackerList::receive_failed() unknown tracker");
        assert!(
            !self.trackers[pos].is_busy(),
            "TrackerList::receive_failed() called on a busy tracker"
        );

        info!(url = self.trackers[pos].url(), %msg, "tracker announce failed");

        self.trackers[pos].record_failure(Instant::now());
        (self.slot_failed)(&self.trackers[pos], msg);
    }

    /// Applies a successful scrape; the announce lifecycle is untouched.
    ///
    /// # Panics
    ///
    /// Panics if the tracker is unknown or still marked busy.
    pub fn receive_scrape_success(&mut self, id: TrackerId, response: ScrapeResponse) {
        let pos = self
            .position(id)
            .expect("TrackerList::receive_scrape_success() unknown tracker");
        assert!(
            !self.trackers[pos].is_busy(),
            "TrackerList::receive_scrape_success() called on a busy tracker"
        );

        debug!(
            url = self.trackers[pos].url(),
            complete = response.complete,
            incomplete = response.incomplete,
            "tracker scrape succeeded"
        );

        self.trackers[pos].record_scrape(Instant::now());
        self.trackers[pos].scrape_complete = response.complete;
        self.trackers[pos].scrape_incomplete = response.incomplete;
        self.trackers[pos].scrape_downloaded = response.downloaded;
        (self.slot_scrape_success)(&self.trackers[pos]);
    }

    /// Applies a failed scrape; only the scrape slot is told.
    ///
    /// # Panics
    ///
    /// Panics if the tracker is unknown or still marked busy.
    pub fn receive_scrape_failed(&mut self, id: TrackerId, msg: &str) {
        let pos = self
            .position(id)
            .expect("TrackerList::receive_scrape_failed() unknown tracker");
        assert!(
            !self.trackers[pos].is_busy(),
            "TrackerList::receive_scrape_failed() called on a busy tracker"
        );

        debug!(url = self.trackers[pos].url(), %msg, "tracker scrape failed");
        (self.slot_scrape_failed)(&self.trackers[pos], msg);
    }

    // Swaps the tracker to the front of its group; returns its new index.
    fn promote(&mut self, pos: usize) -> usize {
        let first = self.begin_group(self.trackers[pos].group());
        self.trackers.swap(first, pos);
        first
    }

    /// Rotates a group left by one, demoting a front tracker that keeps
    /// timing out.
    pub fn cycle_group(&mut self, group: u32) {
        let first = self.begin_group(group);
        let last = self.end_group(group);

        if last - first > 1 {
            self.trackers[first..last].rotate_left(1);
        }
    }

    /// Shuffles each group's entries (BEP-12 load balancing at metadata
    /// load time). The caller provides the generator, seeded as it sees fit.
    pub fn randomize_group_entries(&mut self, rng: &mut impl Rng) {
        let mut start = 0;
        while start < self.trackers.len() {
            let end = self.end_group(self.trackers[start].group());
            self.trackers[start..end].shuffle(rng);
            start = end;
        }
    }

    /// Picks the next tracker worth announcing to, scanning from index
    /// `start`.
    ///
    /// A never-failed usable tracker wins immediately. Otherwise the
    /// tracker with the earliest retry time is preferred, except that a
    /// later never-failed tracker whose regular announce comes due before
    /// that retry takes precedence.
    pub fn find_next_to_request(&self, start: usize) -> Option<usize> {
        let mut preferred = (start..self.trackers.len())
            .find(|&i| self.trackers[i].can_request_state())?;

        if self.trackers[preferred].failed_counter() == 0 {
            return Some(preferred);
        }

        for i in preferred + 1..self.trackers.len() {
            let t = &self.trackers[i];
            if !t.can_request_state() {
                continue;
            }

            if t.failed_counter() != 0 {
                if t.failed_time_next() < self.trackers[preferred].failed_time_next() {
                    preferred = i;
                }
            } else {
                if t.success_time_next() < self.trackers[preferred].failed_time_next() {
                    preferred = i;
                }
                break;
            }
        }

        Some(preferred)
    }

    pub fn close(&mut self, id: TrackerId) {
        if let Some(tracker) = self.get_mut(id) {
            tracker.close();
        }
    }

    pub fn disown(&mut self, id: TrackerId) {
        if let Some(tracker) = self.get_mut(id) {
            tracker.disown();
        }
    }

    /// Closes every tracker whose latest event is not in the bitmap.
    pub fn close_all_excluding(&mut self, event_bitmap: u32) {
        for tracker in &mut self.trackers {
            if event_bitmap & (1 << tracker.latest_event().bit()) != 0 {
                continue;
            }
            tracker.close();
        }
    }

    /// Disowns every tracker whose latest event is in the bitmap.
    pub fn disown_all_including(&mut self, event_bitmap: u32) {
        for tracker in &mut self.trackers {
            if event_bitmap & (1 << tracker.latest_event().bit()) != 0 {
                tracker.disown();
            }
        }
    }

    pub fn clear(&mut self) {
        for tracker in &mut self.trackers {
            tracker.close();
        }
        self.trackers.clear();
    }

    pub fn clear_stats(&mut self) {
        for tracker in &mut self.trackers {
            tracker.clear_stats();
        }
    }
}

impl std::fmt::Debug for TrackerList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackerList")
            .field("trackers", &self.trackers)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}
