use tracing::{debug, trace};

use crate::choke::{move_connections, ChokeGroup};
use crate::constants::MAX_UNCHOKED_LIMIT;
use crate::engine::{DownloadId, EngineError};

/// One download's membership in the resource manager: its group and its
/// priority weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceEntry {
    pub download: DownloadId,
    pub group: usize,
    pub priority: u16,
}

impl ResourceEntry {
    pub fn new(download: DownloadId, group: usize, priority: u16) -> Self {
        Self {
            download,
            group,
            priority,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Up,
    Down,
}

/// Budgets the global pool of unchoke slots across choke groups.
///
/// Entries are kept sorted by group, insertion-stable within a group, and
/// each group's cursors always frame its slice of the array. A max setting
/// of zero means unlimited: every queue then runs an uncapped heuristic
/// pass.
pub struct ResourceManager {
    entries: Vec<ResourceEntry>,
    groups: Vec<ChokeGroup>,
    currently_upload_unchoked: u32,
    currently_download_unchoked: u32,
    max_upload_unchoked: u32,
    max_download_unchoked: u32,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            groups: Vec::new(),
            currently_upload_unchoked: 0,
            currently_download_unchoked: 0,
            max_upload_unchoked: 0,
            max_download_unchoked: 0,
        }
    }

    pub fn entries(&self) -> &[ResourceEntry] {
        &self.entries
    }

    pub fn groups(&self) -> &[ChokeGroup] {
        &self.groups
    }

    pub fn group(&self, index: usize) -> Result<&ChokeGroup, EngineError> {
        self.groups.get(index).ok_or(EngineError::UnknownGroup)
    }

    pub fn group_mut(&mut self, index: usize) -> Result<&mut ChokeGroup, EngineError> {
        self.groups.get_mut(index).ok_or(EngineError::UnknownGroup)
    }

    pub fn group_index_of(&self, name: &str) -> Result<usize, EngineError> {
        self.groups
            .iter()
            .position(|g| g.name() == name)
            .ok_or(EngineError::UnknownGroup)
    }

    pub fn currently_upload_unchoked(&self) -> u32 {
        self.currently_upload_unchoked
    }

    pub fn currently_download_unchoked(&self) -> u32 {
        self.currently_download_unchoked
    }

    pub fn max_upload_unchoked(&self) -> u32 {
        self.max_upload_unchoked
    }

    pub fn max_download_unchoked(&self) -> u32 {
        self.max_download_unchoked
    }

    /// Sets the upload slot budget; zero means unlimited.
    pub fn set_max_upload_unchoked(&mut self, max: u32) -> Result<(), EngineError> {
        if max > MAX_UNCHOKED_LIMIT {
            return Err(EngineError::InvalidMaxUnchoked);
        }
        self.max_upload_unchoked = max;
        Ok(())
    }

    /// Sets the download slot budget; zero means unlimited.
    pub fn set_max_download_unchoked(&mut self, max: u32) -> Result<(), EngineError> {
        if max > MAX_UNCHOKED_LIMIT {
            return Err(EngineError::InvalidMaxUnchoked);
        }
        self.max_download_unchoked = max;
        Ok(())
    }

    /// Appends a new choke group. Names must be non-empty and unique.
    pub fn push_group(&mut self, name: impl Into<String>) -> Result<usize, EngineError> {
        let name = name.into();

        if name.is_empty() || self.groups.iter().any(|g| g.name() == name) {
            return Err(EngineError::DuplicateGroup(name));
        }

        let mut group = ChokeGroup::new(name);
        group.set_range(self.entries.len(), self.entries.len());
        self.groups.push(group);
        Ok(self.groups.len() - 1)
    }

    pub fn find(&self, download: DownloadId) -> Option<&ResourceEntry> {
        self.entries.iter().find(|e| e.download == download)
    }

    fn position(&self, download: DownloadId) -> Option<usize> {
        self.entries.iter().position(|e| e.download == download)
    }

    // First index past the given group's partition.
    fn find_group_end(&self, group: usize) -> usize {
        self.entries
            .iter()
            .position(|e| e.group > group)
            .unwrap_or(self.entries.len())
    }

    /// Places the entry at the end of its group's partition.
    pub fn insert(&mut self, entry: ResourceEntry) -> Result<(), EngineError> {
        if entry.group >= self.groups.len() {
            return Err(EngineError::UnknownGroup);
        }

        let pos = self.find_group_end(entry.group);
        self.entries.insert(pos, entry);
        self.update_group_cursors();

        trace!(
            download = entry.download.0,
            group = entry.group,
            "download inserted into resource manager"
        );
        Ok(())
    }

    /// Removes a download's entry, evicting its connections from the group
    /// queues (choking any that held slots).
    ///
    /// # Panics
    ///
    /// Panics if the download is not in the manager.
    pub fn erase(&mut self, download: DownloadId) {
        let pos = self
            .position(download)
            .expect("ResourceManager::erase() download not found");
        let group = self.entries[pos].group;

        let (_, up_delta) = self.groups[group].up_queue_mut().evict_download(download);
        let (_, down_delta) = self.groups[group].down_queue_mut().evict_download(download);
        self.receive_upload_unchoke(up_delta);
        self.receive_download_unchoke(down_delta);

        self.entries.remove(pos);

        let new_last = self.groups[group].last() - 1;
        self.groups[group].set_last(new_last);
        for g in &mut self.groups[group + 1..] {
            g.dec_cursors();
        }
    }

    /// Moves a download and its connections to another group.
    pub fn set_group(&mut self, download: DownloadId, group: usize) -> Result<(), EngineError> {
        let pos = self.position(download).ok_or(EngineError::UnknownDownload)?;
        let src = self.entries[pos].group;

        if src == group {
            return Ok(());
        }
        if group >= self.groups.len() {
            return Err(EngineError::UnknownGroup);
        }

        // Connections keep their choke state across the move, so the global
        // counters are untouched.
        {
            let (src_group, dst_group) = two_groups(&mut self.groups, src, group);
            move_connections(
                Some(src_group.up_queue_mut()),
                Some(dst_group.up_queue_mut()),
                download,
            );
            let (src_group, dst_group) = two_groups(&mut self.groups, src, group);
            move_connections(
                Some(src_group.down_queue_mut()),
                Some(dst_group.down_queue_mut()),
                download,
            );
        }

        let mut entry = self.entries.remove(pos);
        entry.group = group;
        let dst_pos = self.find_group_end(group);
        self.entries.insert(dst_pos, entry);

        if group < src {
            let new_last = self.groups[group].last() + 1;
            self.groups[group].set_last(new_last);
            for g in &mut self.groups[group + 1..src] {
                g.inc_cursors();
            }
            let new_first = self.groups[src].first() + 1;
            self.groups[src].set_first(new_first);
        } else {
            let new_last = self.groups[src].last() - 1;
            self.groups[src].set_last(new_last);
            for g in &mut self.groups[src + 1..group] {
                g.dec_cursors();
            }
            let new_first = self.groups[group].first() - 1;
            self.groups[group].set_first(new_first);
        }

        Ok(())
    }

    pub fn priority(&self, download: DownloadId) -> Result<u16, EngineError> {
        self.find(download)
            .map(|e| e.priority)
            .ok_or(EngineError::UnknownDownload)
    }

    pub fn set_priority(&mut self, download: DownloadId, priority: u16) -> Result<(), EngineError> {
        let pos = self.position(download).ok_or(EngineError::UnknownDownload)?;
        self.entries[pos].priority = priority;
        Ok(())
    }

    /// Sum of all entry priorities; inactive downloads are not excluded.
    pub fn total_weight(&self) -> u32 {
        self.entries.iter().map(|e| e.priority as u32).sum()
    }

    /// A choke queue unilaterally changed an upload slot between ticks.
    ///
    /// # Panics
    ///
    /// Panics when the adjustment would make the counter negative.
    pub fn receive_upload_unchoke(&mut self, delta: i32) {
        trace!(
            currently = self.currently_upload_unchoked,
            delta, "upload unchoked slots adjust"
        );
        self.currently_upload_unchoked = checked_adjust(self.currently_upload_unchoked, delta)
            .expect("ResourceManager::receive_upload_unchoke() received an invalid value");
    }

    /// A choke queue unilaterally changed a download slot between ticks.
    ///
    /// # Panics
    ///
    /// Panics when the adjustment would make the counter negative.
    pub fn receive_download_unchoke(&mut self, delta: i32) {
        trace!(
            currently = self.currently_download_unchoked,
            delta, "download unchoked slots adjust"
        );
        self.currently_download_unchoked = checked_adjust(self.currently_download_unchoked, delta)
            .expect("ResourceManager::receive_download_unchoke() received an invalid value");
    }

    /// Upload slots still available, or effectively infinite when unlimited.
    pub fn can_unchoke_upload(&self) -> i32 {
        if self.max_upload_unchoked == 0 {
            i32::MAX
        } else {
            self.max_upload_unchoked as i32 - self.currently_upload_unchoked as i32
        }
    }

    /// Download slots still available, or effectively infinite when
    /// unlimited.
    pub fn can_unchoke_download(&self) -> i32 {
        if self.max_download_unchoked == 0 {
            i32::MAX
        } else {
            self.max_download_unchoked as i32 - self.currently_download_unchoked as i32
        }
    }

    /// The once-per-second slot balancing pass.
    ///
    /// # Panics
    ///
    /// Panics when the group cursors disagree with a re-scan of the entry
    /// array, or when the per-queue unchoked totals disagree with the global
    /// counters afterwards.
    pub fn receive_tick(&mut self) {
        self.validate_group_cursors();

        let up = self.balance_unchoked(self.max_upload_unchoked, Direction::Up);
        self.currently_upload_unchoked = checked_adjust(self.currently_upload_unchoked, up)
            .expect("ResourceManager::receive_tick() upload balance went negative");

        let down = self.balance_unchoked(self.max_download_unchoked, Direction::Down);
        self.currently_download_unchoked = checked_adjust(self.currently_download_unchoked, down)
            .expect("ResourceManager::receive_tick() download balance went negative");

        let up_total: u32 = self.groups.iter().map(ChokeGroup::up_unchoked).sum();
        let down_total: u32 = self.groups.iter().map(ChokeGroup::down_unchoked).sum();

        assert_eq!(
            self.currently_upload_unchoked, up_total,
            "ResourceManager::receive_tick() upload unchoked count out of sync"
        );
        assert_eq!(
            self.currently_download_unchoked, down_total,
            "ResourceManager::receive_tick() download unchoked count out of sync"
        );
    }

    fn balance_unchoked(&mut self, max_unchoked: u32, direction: Direction) -> i32 {
        let mut change = 0;

        if max_unchoked == 0 {
            for group in &mut self.groups {
                change += queue_mut(group, direction).cycle(u32::MAX);
            }
            return change;
        }

        // Service the group requesting the fewest slots first, so heavier
        // groups inherit whatever the light ones leave on the table.
        let mut order: Vec<usize> = (0..self.groups.len()).collect();
        order.sort_by_key(|&i| match direction {
            Direction::Up => self.groups[i].up_requested(),
            Direction::Down => self.groups[i].down_requested(),
        });

        let mut quota = max_unchoked;
        let mut weight = self.groups.len() as u32;

        debug!(
            ?direction,
            max_unchoked, groups = weight, "balancing unchoke slots"
        );

        for i in order {
            let queue = queue_mut(&mut self.groups[i], direction);
            change += queue.cycle(if weight != 0 { quota / weight } else { 0 });
            quota = quota.saturating_sub(queue.size_unchoked());
            weight -= 1;
        }

        assert_eq!(
            weight, 0,
            "ResourceManager::balance_unchoked() weight did not reach zero"
        );

        change
    }

    fn update_group_cursors(&mut self) {
        let mut start = 0;
        for (index, group) in self.groups.iter_mut().enumerate() {
            let count = self.entries[start..]
                .iter()
                .take_while(|e| e.group <= index)
                .count();
            group.set_range(start, start + count);
            start += count;
        }
    }

    fn validate_group_cursors(&self) {
        let mut start = 0;
        for (index, group) in self.groups.iter().enumerate() {
            let count = self.entries[start..]
                .iter()
                .take_while(|e| e.group <= index)
                .count();

            assert!(
                group.first() == start && group.last() == start + count,
                "ResourceManager::receive_tick() invalid cursors for group {index}: \
                 stored [{}, {}), expected [{start}, {})",
                group.first(),
                group.last(),
                start + count
            );

            start += count;
        }
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        if self.currently_upload_unchoked != 0 || self.currently_download_unchoked != 0 {
            tracing::error!(
                upload = self.currently_upload_unchoked,
                download = self.currently_download_unchoked,
                "ResourceManager dropped with unchoked connections outstanding"
            );
        }
    }
}

fn queue_mut(group: &mut ChokeGroup, direction: Direction) -> &mut crate::choke::ChokeQueue {
    match direction {
        Direction::Up => group.up_queue_mut(),
        Direction::Down => group.down_queue_mut(),
    }
}

fn checked_adjust(current: u32, delta: i32) -> Option<u32> {
    let next = current as i64 + delta as i64;
    u32::try_from(next).ok()
}

// Disjoint mutable borrows of two distinct groups.
fn two_groups(
    groups: &mut [ChokeGroup],
    a: usize,
    b: usize,
) -> (&mut ChokeGroup, &mut ChokeGroup) {
    debug_assert_ne!(a, b);
    if a < b {
        let (left, right) = groups.split_at_mut(b);
        (&mut left[a], &mut right[0])
    } else {
        let (left, right) = groups.split_at_mut(a);
        (&mut right[0], &mut left[b])
    }
}
