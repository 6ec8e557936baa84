//
// Copyright (c) 2024 Nathan Fiedler
//

//! Bookkeeping for hard links discovered during an upload walk.
//!
//! Hard links wholly inside one pack survive on their own, since the
//! archiver stores them natively. Links that span pack boundaries need
//! help: the walk records, for every multiply-linked inode, the first
//! path stored for it, and every later sighting from another pack
//! becomes an equivalence between two paths. A union-find pass at the
//! end turns the equivalences into the groups persisted in the metadata
//! document, which the download planner uses to re-link.

use std::collections::HashMap;
use std::path::PathBuf;

/// Classic disjoint-set forest over `usize` ids, with path compression
/// and union by rank.
pub struct DisjointSet {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl DisjointSet {
    pub fn new() -> Self {
        Self {
            parent: Vec::new(),
            rank: Vec::new(),
        }
    }

    /// Allocate a fresh singleton and return its id.
    pub fn push(&mut self) -> usize {
        let id = self.parent.len();
        self.parent.push(id);
        self.rank.push(0);
        id
    }

    /// Find the representative of the set containing `id`.
    pub fn find(&mut self, id: usize) -> usize {
        let mut root = id;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut walk = id;
        while self.parent[walk] != root {
            let next = self.parent[walk];
            self.parent[walk] = root;
            walk = next;
        }
        root
    }

    /// Merge the sets containing `a` and `b`.
    pub fn union(&mut self, a: usize, b: usize) {
        let mut root_a = self.find(a);
        let mut root_b = self.find(b);
        if root_a == root_b {
            return;
        }
        if self.rank[root_a] < self.rank[root_b] {
            std::mem::swap(&mut root_a, &mut root_b);
        }
        self.parent[root_b] = root_a;
        if self.rank[root_a] == self.rank[root_b] {
            self.rank[root_a] += 1;
        }
    }
}

impl Default for DisjointSet {
    fn default() -> Self {
        Self::new()
    }
}

///
/// The shared hard-link state threaded through the upload walk. Each
/// pack flushes its per-inode path map here; a key seen before means
/// the inode now spans two packs and the pair is queued for grouping.
///
#[derive(Default)]
pub struct HardLinkTracker {
    first_seen: HashMap<(u64, u64), PathBuf>,
    pairs: Vec<(PathBuf, PathBuf)>,
}

impl HardLinkTracker {
    pub fn new() -> Self {
        Self::default()
    }

    ///
    /// Merge one pack's `(device, inode) → path` map into the global
    /// table. The map already collapsed links within that pack, so only
    /// cross-pack sightings produce equivalences.
    ///
    pub fn absorb(&mut self, batch: HashMap<(u64, u64), PathBuf>) {
        for (key, path) in batch {
            if let Some(existing) = self.first_seen.get(&key) {
                self.pairs.push((existing.clone(), path));
            } else {
                self.first_seen.insert(key, path);
            }
        }
    }

    ///
    /// Resolve the queued equivalences into link groups. Members are
    /// sorted within each group and the groups sorted by their first
    /// member, so repeated runs emit identical documents.
    ///
    pub fn into_groups(self) -> Vec<Vec<PathBuf>> {
        let mut ids: HashMap<PathBuf, usize> = HashMap::new();
        let mut paths: Vec<PathBuf> = Vec::new();
        let mut sets = DisjointSet::new();
        let mut intern = |path: PathBuf, sets: &mut DisjointSet, paths: &mut Vec<PathBuf>| {
            *ids.entry(path.clone()).or_insert_with(|| {
                paths.push(path);
                sets.push()
            })
        };
        let mut unions: Vec<(usize, usize)> = Vec::new();
        for (a, b) in self.pairs {
            let ida = intern(a, &mut sets, &mut paths);
            let idb = intern(b, &mut sets, &mut paths);
            unions.push((ida, idb));
        }
        for (ida, idb) in unions {
            sets.union(ida, idb);
        }
        let mut components: HashMap<usize, Vec<PathBuf>> = HashMap::new();
        for (id, path) in paths.iter().enumerate() {
            let root = sets.find(id);
            components.entry(root).or_default().push(path.clone());
        }
        let mut groups: Vec<Vec<PathBuf>> = components.into_values().collect();
        for group in groups.iter_mut() {
            group.sort();
        }
        groups.sort();
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disjoint_set_components() {
        let mut sets = DisjointSet::new();
        let ids: Vec<usize> = (0..6).map(|_| sets.push()).collect();
        sets.union(ids[0], ids[1]);
        sets.union(ids[1], ids[2]);
        sets.union(ids[4], ids[5]);
        assert_eq!(sets.find(ids[0]), sets.find(ids[2]));
        assert_ne!(sets.find(ids[0]), sets.find(ids[3]));
        assert_eq!(sets.find(ids[4]), sets.find(ids[5]));
        assert_ne!(sets.find(ids[3]), sets.find(ids[4]));
    }

    #[test]
    fn test_tracker_cross_pack_pairs() {
        let mut tracker = HardLinkTracker::new();
        let mut first = HashMap::new();
        first.insert((1, 100), PathBuf::from("/tree/a"));
        tracker.absorb(first);
        let mut second = HashMap::new();
        second.insert((1, 100), PathBuf::from("/tree/sub/b"));
        second.insert((1, 200), PathBuf::from("/tree/sub/c"));
        tracker.absorb(second);
        let groups = tracker.into_groups();
        assert_eq!(groups.len(), 1);
        assert_eq!(
            groups[0],
            vec![PathBuf::from("/tree/a"), PathBuf::from("/tree/sub/b")]
        );
    }

    #[test]
    fn test_tracker_transitive_grouping() {
        let mut tracker = HardLinkTracker::new();
        for path in ["/t/one", "/t/two", "/t/three"] {
            let mut batch = HashMap::new();
            batch.insert((7, 42), PathBuf::from(path));
            tracker.absorb(batch);
        }
        let mut other = HashMap::new();
        other.insert((7, 43), PathBuf::from("/t/unrelated-a"));
        tracker.absorb(other);
        let mut other = HashMap::new();
        other.insert((7, 43), PathBuf::from("/t/unrelated-b"));
        tracker.absorb(other);
        let groups = tracker.into_groups();
        assert_eq!(groups.len(), 2);
        assert_eq!(
            groups[0],
            vec![
                PathBuf::from("/t/one"),
                PathBuf::from("/t/three"),
                PathBuf::from("/t/two")
            ]
        );
        assert_eq!(
            groups[1],
            vec![
                PathBuf::from("/t/unrelated-a"),
                PathBuf::from("/t/unrelated-b")
            ]
        );
    }

    #[test]
    fn test_tracker_no_links() {
        let tracker = HardLinkTracker::new();
        assert!(tracker.into_groups().is_empty());
    }
}
