//! The client-side vid→url cache and its small LRU of prior maps, so a
//! leader change doesn't cliff in-flight lookups: the old map stays
//! queryable for a few reconnects while the new one refills.

use std::collections::{HashMap, VecDeque};

use rpc::{Location, VolumeLocation};

pub const DEFAULT_HISTORY_DEPTH: usize = 5;

#[derive(Debug, Default, Clone)]
pub struct VidMap {
    locations: HashMap<u32, Vec<Location>>,
}

impl VidMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, vid: u32) -> Option<&[Location]> {
        self.locations.get(&vid).map(Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    /// Merges in one or more `VolumeLocation`s, overwriting any prior entry
    /// for the same vid (used for both deltas and lookup-miss refills).
    pub fn apply_new(&mut self, volumes: impl IntoIterator<Item = VolumeLocation>) {
        for vol in volumes {
            self.locations.insert(vol.vid, vol.locations);
        }
    }

    pub fn apply_deleted(&mut self, vids: impl IntoIterator<Item = u32>) {
        for vid in vids {
            self.locations.remove(&vid);
        }
    }

    pub fn replace_with_snapshot(&mut self, volumes: impl IntoIterator<Item = VolumeLocation>) {
        self.locations.clear();
        self.apply_new(volumes);
    }
}

/// Bounded history of superseded `VidMap`s, consulted as a fallback when a
/// lookup misses the current map but the requested volume was served by
/// the previous leader a moment ago.
#[derive(Debug)]
pub struct VidMapHistory {
    depth: usize,
    past: VecDeque<VidMap>,
}

impl VidMapHistory {
    pub fn new(depth: usize) -> Self {
        Self {
            depth,
            past: VecDeque::with_capacity(depth),
        }
    }

    pub fn push(&mut self, map: VidMap) {
        if map.is_empty() {
            return;
        }
        self.past.push_front(map);
        while self.past.len() > self.depth {
            self.past.pop_back();
        }
    }

    pub fn find(&self, vid: u32) -> Option<Vec<Location>> {
        self.past.iter().find_map(|m| m.get(vid).map(|s| s.to_vec()))
    }
}

impl Default for VidMapHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_DEPTH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(url: &str, dc: &str) -> Location {
        Location::new(url, url, dc)
    }

    #[test]
    fn snapshot_replaces_whole_map() {
        let mut map = VidMap::new();
        map.apply_new(vec![VolumeLocation {
            vid: 1,
            locations: vec![loc("a:1", "dc1")],
        }]);
        map.replace_with_snapshot(vec![VolumeLocation {
            vid: 2,
            locations: vec![loc("b:1", "dc1")],
        }]);
        assert!(map.get(1).is_none());
        assert!(map.get(2).is_some());
    }

    #[test]
    fn deleted_vids_are_removed() {
        let mut map = VidMap::new();
        map.apply_new(vec![VolumeLocation {
            vid: 1,
            locations: vec![loc("a:1", "dc1")],
        }]);
        map.apply_deleted(vec![1]);
        assert!(map.get(1).is_none());
    }

    #[test]
    fn history_caps_at_configured_depth() {
        let mut history = VidMapHistory::new(2);
        for vid in 0..5u32 {
            let mut map = VidMap::new();
            map.apply_new(vec![VolumeLocation {
                vid,
                locations: vec![loc("a:1", "dc1")],
            }]);
            history.push(map);
        }
        assert!(history.find(4).is_some());
        assert!(history.find(3).is_some());
        assert!(history.find(0).is_none(), "oldest entries should be evicted");
    }

    #[test]
    fn empty_maps_are_not_retained() {
        let mut history = VidMapHistory::new(5);
        history.push(VidMap::new());
        assert!(history.find(1).is_none());
        assert_eq!(history.past.len(), 0);
    }
}
