//! Lock-free skip list specialized for minimum-first claiming
//!
//! Deletion is split in two. A dequeue *logically* deletes the first live
//! node by setting the tag bit on that node's own level-0 forward pointer
//! with a single fetch-or; the node stays linked and traversals simply walk
//! over it. Once a thread has walked over more than `max_offset` claimed
//! nodes, it *physically* unlinks the whole prefix in one batch: a single
//! CAS swings the head forward, upper head pointers are repaired, and the
//! bypassed nodes are retired to the epoch collector.
//!
//! Inserts commit at the bottom level first and thread their towers upward
//! afterwards, so a node is in the queue exactly when it is reachable at
//! level 0.

use std::ptr;
use std::sync::atomic::Ordering;

use crossbeam::epoch::{self, Atomic, Guard, Owned, Shared};
use log::trace;
use spindle_core::{Key, Value, KEY_MAX, KEY_MIN};

use crate::config::MAX_HEIGHT;

use super::marked::Forward;

/// CAS retries in the claimed-predecessor insert path before the walk
/// position is refreshed with a fresh search.
const SPLICE_RETRY_LIMIT: usize = 10;

/// One skip-list element.
///
/// The tower length is fixed at allocation and geometrically distributed.
/// `key` and `value` are immutable once the node is published; the only
/// mutable state is the atomic forward pointers. The alignment keeps the
/// low pointer bits free for the deletion tag and gives hot head-region
/// nodes their own cache lines.
#[repr(align(64))]
struct Node {
    key: Key,
    value: Value,
    tower: Vec<Forward<Node>>,
}

impl Node {
    fn new(key: Key, value: Value, height: usize) -> Self {
        let mut tower = Vec::with_capacity(height);
        for _ in 0..height {
            tower.push(Forward::null());
        }
        Self { key, value, tower }
    }

    fn sentinel(key: Key, height: usize) -> Self {
        Self::new(key, 0, height)
    }

    /// A node is logically deleted once the tag on its own level-0 forward
    /// pointer is set. The transition is irreversible.
    fn is_deleted(&self, guard: &Guard) -> bool {
        self.tower[0].load(Ordering::Acquire, guard).tag() != 0
    }

    fn is_tail(&self) -> bool {
        self.key == KEY_MAX
    }
}

/// Predecessor/successor arrays produced by a weak search.
struct Position<'g> {
    preds: [Shared<'g, Node>; MAX_HEIGHT],
    succs: [Shared<'g, Node>; MAX_HEIGHT],
}

/// Per-thread resume state for [`SkipList::delete_min`].
///
/// `obs_head` is the level-0 head pointer observed when the walk last
/// started. While it is unchanged no restructuring has run, so the claimed
/// prefix is still linked and `node` may be picked up again where the last
/// walk stopped. `offset` counts the claimed nodes walked over since
/// `obs_head` was recorded; it is the restructuring trigger.
pub(crate) struct HeadCache {
    obs_head: *const Node,
    node: *const Node,
    offset: usize,
}

impl HeadCache {
    pub(crate) fn new() -> Self {
        Self {
            obs_head: ptr::null(),
            node: ptr::null(),
            offset: 0,
        }
    }

    fn reset(&mut self, obs_head: Shared<'_, Node>) {
        self.obs_head = obs_head.as_raw();
        self.node = ptr::null();
        self.offset = 0;
    }

    fn clear(&mut self) {
        self.obs_head = ptr::null();
        self.node = ptr::null();
        self.offset = 0;
    }
}

/// The lock-free skip list backing a priority queue.
///
/// Head and tail sentinels carry [`KEY_MIN`] and [`KEY_MAX`]; every head
/// forward pointer of an empty list refers to the tail. The head sentinel
/// is never logically deleted, so its level-0 pointer is always untagged.
pub(crate) struct SkipList {
    head: Atomic<Node>,
    max_height: usize,
    max_offset: usize,
}

// SkipList is shared across threads as-is: every field of a published node
// is immutable except the atomic forward pointers, and Atomic<Node> is
// Send + Sync.

impl SkipList {
    pub(crate) fn new(max_height: usize, max_offset: usize) -> Self {
        let guard = unsafe { epoch::unprotected() };
        let tail = Owned::new(Node::sentinel(KEY_MAX, max_height)).into_shared(guard);
        let head = Owned::new(Node::sentinel(KEY_MIN, max_height));
        for level in 0..max_height {
            head.tower[level].store(tail, Ordering::Relaxed);
        }
        Self {
            head: Atomic::from(head),
            max_height,
            max_offset,
        }
    }

    /// Weak search: returns, at every level, the last node whose key is
    /// strictly less than `key` and its successor. Claimed nodes are
    /// traversed, never excised; the tag is stripped while walking.
    fn locate_preds<'g>(&self, key: Key, guard: &'g Guard) -> Position<'g> {
        let mut pos = Position {
            preds: [Shared::null(); MAX_HEIGHT],
            succs: [Shared::null(); MAX_HEIGHT],
        };
        let mut pred = self.head.load(Ordering::Acquire, guard);
        for level in (0..self.max_height).rev() {
            let mut curr =
                unsafe { pred.deref() }.tower[level].load_untagged(Ordering::Acquire, guard);
            while unsafe { curr.deref() }.key < key {
                pred = curr;
                curr = unsafe { curr.deref() }.tower[level].load_untagged(Ordering::Acquire, guard);
            }
            pos.preds[level] = pred;
            pos.succs[level] = curr;
        }
        pos
    }

    /// Inserts a node of the given tower height.
    ///
    /// The bottom-level CAS is the linearization point; it releases the
    /// node's initialization, so a reachable node is always fully built.
    /// Duplicate keys coexist and each is claimed exactly once.
    pub(crate) fn insert(&self, key: Key, value: Value, height: usize, guard: &Guard) {
        debug_assert!((1..=self.max_height).contains(&height));
        let node = Owned::new(Node::new(key, value, height)).into_shared(guard);
        let node_ref = unsafe { node.deref() };

        let mut pos = self.locate_preds(key, guard);
        loop {
            for level in 0..height {
                node_ref.tower[level].store(pos.succs[level], Ordering::Relaxed);
            }
            let pred = unsafe { pos.preds[0].deref() };
            match pred.tower[0].cas(pos.succs[0], node, guard) {
                Ok(()) => break,
                Err(observed) => {
                    if observed.tag() != 0 {
                        // The predecessor was claimed while we prepared the
                        // splice. The node still goes in at the bottom
                        // level; upper links are abandoned.
                        self.splice_after_claimed(pos.preds[0], node, guard);
                        return;
                    }
                    pos = self.locate_preds(key, guard);
                }
            }
        }
        self.link_upper_levels(node, height, pos, guard);
    }

    /// Bottom-level-only insertion used when the chosen predecessor has
    /// been claimed. Walks forward over claimed nodes and splices at the
    /// first untagged forward pointer. Runs from the head sentinel again if
    /// the walk hits the tail; the head's forward pointer is never tagged,
    /// so the walk terminates.
    fn splice_after_claimed<'g>(
        &self,
        start: Shared<'g, Node>,
        node: Shared<'g, Node>,
        guard: &'g Guard,
    ) {
        let node_ref = unsafe { node.deref() };
        let mut curr = start;
        let mut retries = 0;
        loop {
            let curr_ref = unsafe { curr.deref() };
            if curr_ref.is_tail() {
                curr = self.head.load(Ordering::Acquire, guard);
                continue;
            }
            let next = curr_ref.tower[0].load(Ordering::Acquire, guard);
            if next.tag() != 0 {
                curr = next.with_tag(0);
                continue;
            }
            node_ref.tower[0].store(next, Ordering::Relaxed);
            match curr_ref.tower[0].cas(next, node, guard) {
                Ok(()) => return,
                Err(_) => {
                    retries += 1;
                    if retries > SPLICE_RETRY_LIMIT {
                        curr = self.locate_preds(node_ref.key, guard).preds[0];
                        retries = 0;
                    }
                }
            }
        }
    }

    /// Threads a freshly committed node's tower into levels `1..height`.
    /// Linking stops as soon as the node is claimed; nothing searches for a
    /// claimed node above level 0.
    fn link_upper_levels<'g>(
        &self,
        node: Shared<'g, Node>,
        height: usize,
        mut pos: Position<'g>,
        guard: &'g Guard,
    ) {
        let node_ref = unsafe { node.deref() };
        for level in 1..height {
            loop {
                if node_ref.is_deleted(guard) {
                    return;
                }
                let curr = node_ref.tower[level].load(Ordering::Acquire, guard);
                if curr.tag() != 0 {
                    return;
                }
                if curr != pos.succs[level]
                    && node_ref.tower[level].cas(curr, pos.succs[level], guard).is_err()
                {
                    continue;
                }
                match unsafe { pos.preds[level].deref() }.tower[level]
                    .cas(pos.succs[level], node, guard)
                {
                    Ok(()) => break,
                    Err(_) => {
                        pos = self.locate_preds(node_ref.key, guard);
                        if pos.succs[0] != node {
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Claims the first live node on the bottom level and returns its entry.
    ///
    /// The winning fetch-or on the claimed node's own forward pointer is the
    /// linearization point: concurrent dequeuers claim disjoint nodes. The
    /// walk resumes from the caller's cached position while the observed
    /// head is unchanged, and triggers a batched unlink once the cache has
    /// accumulated more than `max_offset` claimed nodes.
    pub(crate) fn delete_min(&self, cache: &mut HeadCache, guard: &Guard) -> Option<(Key, Value)> {
        let head = self.head.load(Ordering::Acquire, guard);
        let obs_head =
            unsafe { head.deref() }.tower[0].load_untagged(Ordering::Acquire, guard);

        let mut curr = if ptr::eq(obs_head.as_raw(), cache.obs_head) && !cache.node.is_null() {
            Shared::from(cache.node)
        } else {
            cache.reset(obs_head);
            obs_head
        };

        let mut steps = 0;
        let claimed = loop {
            let curr_ref = unsafe { curr.deref() };
            if curr_ref.is_tail() {
                return None;
            }
            let next = curr_ref.tower[0].load(Ordering::Acquire, guard);
            let next = if next.tag() == 0 {
                match curr_ref.tower[0].try_mark(guard) {
                    Ok(_) => break curr,
                    Err(observed) => observed,
                }
            } else {
                next
            };
            curr = next.with_tag(0);
            steps += 1;
        };

        let claimed_ref = unsafe { claimed.deref() };
        // The entry leaves the node before the critical section ends; a
        // concurrent restructuring may retire the node right after.
        let entry = (claimed_ref.key, claimed_ref.value);
        cache.node = claimed.as_raw();
        cache.offset += steps;

        if cache.offset > self.max_offset
            && unsafe { head.deref() }.tower[0].load(Ordering::Acquire, guard) == obs_head
            && self.restructure(obs_head, claimed, guard)
        {
            cache.clear();
        }

        Some(entry)
    }

    /// Batched physical unlink of the claimed head prefix.
    ///
    /// Swings the level-0 head pointer from the observed first node to the
    /// node the caller just claimed. On success the half-open prefix
    /// `[obs_head, claimed)` belongs exclusively to this thread: upper head
    /// pointers are repaired past the claimed region top-down, then every
    /// node in the prefix is retired. The claimed node stays linked as the
    /// boundary and is reclaimed by the following round.
    fn restructure<'g>(
        &self,
        obs_head: Shared<'g, Node>,
        claimed: Shared<'g, Node>,
        guard: &'g Guard,
    ) -> bool {
        if ptr::eq(obs_head.as_raw(), claimed.as_raw()) {
            return false;
        }
        let head = unsafe { self.head.load(Ordering::Acquire, guard).deref() };
        if head.tower[0].cas(obs_head, claimed, guard).is_err() {
            // Another thread restructured first.
            return false;
        }

        for level in (1..self.max_height).rev() {
            loop {
                let first = head.tower[level].load(Ordering::Acquire, guard);
                let mut curr = first;
                loop {
                    let curr_ref = unsafe { curr.deref() };
                    if curr_ref.is_tail() || !curr_ref.is_deleted(guard) {
                        break;
                    }
                    curr = curr_ref.tower[level].load_untagged(Ordering::Acquire, guard);
                }
                if curr == first || head.tower[level].cas(first, curr, guard).is_ok() {
                    break;
                }
            }
        }

        let mut curr = obs_head;
        let mut batch = 0;
        while !ptr::eq(curr.as_raw(), claimed.as_raw()) {
            let next = unsafe { curr.deref() }.tower[0].load_untagged(Ordering::Relaxed, guard);
            unsafe { guard.defer_destroy(curr) };
            curr = next;
            batch += 1;
        }
        trace!("unlinked a batch of {batch} claimed nodes");
        true
    }

    /// Claims the first live node carrying `key`, if any, and returns its
    /// value. Already-claimed duplicates are walked over so that a live
    /// duplicate further along the chain is still found.
    pub(crate) fn remove(&self, key: Key, guard: &Guard) -> Option<Value> {
        let pos = self.locate_preds(key, guard);
        let mut curr = pos.succs[0];
        loop {
            let curr_ref = unsafe { curr.deref() };
            if curr_ref.key != key {
                return None;
            }
            let next = curr_ref.tower[0].load(Ordering::Acquire, guard);
            let next = if next.tag() == 0 {
                match curr_ref.tower[0].try_mark(guard) {
                    Ok(_) => return Some(curr_ref.value),
                    Err(observed) => observed,
                }
            } else {
                next
            };
            curr = next.with_tag(0);
        }
    }

    /// Key of the node the level-0 head pointer currently refers to,
    /// claimed or not. Test-only introspection for the batching behavior.
    #[cfg(test)]
    fn first_reachable_key(&self) -> Key {
        let guard = epoch::pin();
        let head = self.head.load(Ordering::Acquire, &guard);
        let first = unsafe { head.deref() }.tower[0].load_untagged(Ordering::Acquire, &guard);
        unsafe { first.deref() }.key
    }
}

impl Drop for SkipList {
    fn drop(&mut self) {
        // Exclusive access: free every node on the bottom level, then the
        // sentinels.
        unsafe {
            let guard = epoch::unprotected();
            let head = self.head.load(Ordering::Relaxed, guard);
            let mut curr = head.deref().tower[0].load_untagged(Ordering::Relaxed, guard);
            while !curr.deref().is_tail() {
                let next = curr.deref().tower[0].load_untagged(Ordering::Relaxed, guard);
                drop(curr.into_owned());
                curr = next;
            }
            drop(curr.into_owned());
            drop(head.into_owned());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(max_offset: usize) -> SkipList {
        SkipList::new(12, max_offset)
    }

    fn insert_all(list: &SkipList, keys: &[Key]) {
        let guard = epoch::pin();
        for (i, &key) in keys.iter().enumerate() {
            list.insert(key, key * 10, 1 + i % 3, &guard);
        }
    }

    fn drain_keys(list: &SkipList, cache: &mut HeadCache) -> Vec<Key> {
        let mut keys = Vec::new();
        loop {
            let guard = epoch::pin();
            match list.delete_min(cache, &guard) {
                Some((key, _)) => keys.push(key),
                None => return keys,
            }
        }
    }

    #[test]
    fn drains_in_ascending_order() {
        let list = list(32);
        insert_all(&list, &[5, 7, 3, 1, 9]);
        let guard = epoch::pin();
        let mut cache = HeadCache::new();
        for expect in [1u64, 3, 5, 7, 9] {
            assert_eq!(list.delete_min(&mut cache, &guard), Some((expect, expect * 10)));
        }
        assert_eq!(list.delete_min(&mut cache, &guard), None);
    }

    #[test]
    fn empty_list_reports_empty() {
        let list = list(32);
        let guard = epoch::pin();
        let mut cache = HeadCache::new();
        assert_eq!(list.delete_min(&mut cache, &guard), None);
        assert_eq!(list.delete_min(&mut cache, &guard), None);
    }

    #[test]
    fn duplicate_keys_each_claimed_once() {
        let list = list(32);
        let guard = epoch::pin();
        for value in [1u64, 2, 3] {
            list.insert(4, value, 1, &guard);
        }
        let mut cache = HeadCache::new();
        let mut values = Vec::new();
        for _ in 0..3 {
            let (key, value) = list.delete_min(&mut cache, &guard).unwrap();
            assert_eq!(key, 4);
            values.push(value);
        }
        values.sort_unstable();
        assert_eq!(values, [1, 2, 3]);
        assert_eq!(list.delete_min(&mut cache, &guard), None);
    }

    #[test]
    fn head_swings_once_offset_exceeded() {
        let list = list(4);
        insert_all(&list, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        let guard = epoch::pin();
        let mut cache = HeadCache::new();

        for expect in 1..=5u64 {
            assert_eq!(list.delete_min(&mut cache, &guard).unwrap().0, expect);
        }
        // The claimed prefix is still fully linked.
        assert_eq!(list.first_reachable_key(), 1);

        // The sixth claim pushes the walked offset past max_offset and
        // swings the head to the claimed boundary node.
        assert_eq!(list.delete_min(&mut cache, &guard).unwrap().0, 6);
        assert_eq!(list.first_reachable_key(), 6);

        for expect in 7..=10u64 {
            assert_eq!(list.delete_min(&mut cache, &guard).unwrap().0, expect);
        }
        assert_eq!(list.delete_min(&mut cache, &guard), None);
    }

    #[test]
    fn inserts_ahead_of_claimed_prefix() {
        let list = list(32);
        insert_all(&list, &[10, 20, 30]);
        let guard = epoch::pin();
        let mut cache = HeadCache::new();
        assert_eq!(list.delete_min(&mut cache, &guard).unwrap().0, 10);

        // A new minimum lands in front of the claimed node.
        list.insert(5, 50, 2, &guard);
        assert_eq!(list.delete_min(&mut cache, &guard), Some((5, 50)));
        assert_eq!(list.delete_min(&mut cache, &guard).unwrap().0, 20);
    }

    #[test]
    fn splices_when_predecessor_is_claimed() {
        let list = list(32);
        let guard = epoch::pin();
        list.insert(1, 10, 1, &guard);
        list.insert(5, 50, 1, &guard);
        let mut cache = HeadCache::new();
        assert_eq!(list.delete_min(&mut cache, &guard).unwrap().0, 1);

        // The predecessor of 3 is the claimed node 1: the insert falls back
        // to a bottom-level splice beyond the claimed region and still
        // succeeds.
        list.insert(3, 30, 3, &guard);
        let mut keys = drain_keys(&list, &mut cache);
        keys.sort_unstable();
        assert_eq!(keys, [3, 5]);
    }

    #[test]
    fn remove_of_missing_key_is_null() {
        let list = list(32);
        insert_all(&list, &[2, 4, 6]);
        let guard = epoch::pin();
        assert_eq!(list.remove(5, &guard), None);
        let mut cache = HeadCache::new();
        assert_eq!(drain_keys(&list, &mut cache), [2, 4, 6]);
    }

    #[test]
    fn remove_returns_value_and_excludes_key() {
        let list = list(32);
        insert_all(&list, &[2, 4, 6]);
        let guard = epoch::pin();
        assert_eq!(list.remove(4, &guard), Some(40));
        assert_eq!(list.remove(4, &guard), None);
        let mut cache = HeadCache::new();
        assert_eq!(drain_keys(&list, &mut cache), [2, 6]);
    }

    #[test]
    fn remove_skips_claimed_duplicates() {
        let list = list(32);
        let guard = epoch::pin();
        list.insert(4, 1, 1, &guard);
        list.insert(4, 2, 1, &guard);
        let mut cache = HeadCache::new();

        // The first duplicate is claimed by a dequeue but still linked;
        // remove must walk over it and claim the live one.
        let (_, claimed_value) = list.delete_min(&mut cache, &guard).unwrap();
        let removed = list.remove(4, &guard).unwrap();
        assert_ne!(claimed_value, removed);
        assert_eq!(list.remove(4, &guard), None);
        assert_eq!(list.delete_min(&mut cache, &guard), None);
    }

    #[test]
    fn stale_resume_position_recovers() {
        let list = list(2);
        insert_all(&list, &[1, 2, 3, 4, 5, 6, 7, 8]);
        let guard = epoch::pin();
        let mut first = HeadCache::new();
        let mut second = HeadCache::new();

        assert_eq!(list.delete_min(&mut second, &guard).unwrap().0, 1);

        // Three claims through the first cache push its offset past
        // max_offset and restructure, retiring the prefix the second cache
        // still refers to.
        for expect in 2..=4u64 {
            assert_eq!(list.delete_min(&mut first, &guard).unwrap().0, expect);
        }
        assert_eq!(list.first_reachable_key(), 4);

        // The second cache observes the moved head and resets.
        assert_eq!(list.delete_min(&mut second, &guard).unwrap().0, 5);
        assert_eq!(drain_keys(&list, &mut first), [6, 7, 8]);
    }

    #[test]
    fn tall_towers_are_searchable() {
        let list = list(32);
        let guard = epoch::pin();
        for key in (1..=64u64).rev() {
            list.insert(key, key, 1 + (key as usize % 12), &guard);
        }
        let mut cache = HeadCache::new();
        let keys = drain_keys(&list, &mut cache);
        assert_eq!(keys, (1..=64u64).collect::<Vec<_>>());
    }
}
