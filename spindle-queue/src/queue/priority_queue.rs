//! Public queue handle and per-thread sessions

use crossbeam::epoch;
use log::debug;
use rand::{rngs::StdRng, Rng, SeedableRng};

use spindle_core::{is_reserved, Error, Key, Result, Value};

use crate::config::QueueConfig;

use super::skip_list::{HeadCache, SkipList};

/// A concurrent priority queue shared by many threads
///
/// Threads insert `(key, value)` entries and compete to claim the entry with
/// the smallest key, without a global lock. Every operation runs through a
/// per-thread [`Session`], which carries the thread's dequeue resume state
/// and its tower-height randomness.
///
/// Duplicate keys coexist and each entry is dequeued exactly once. The queue
/// does not expose a size or ordered iteration.
///
/// # Thread Safety
///
/// The queue itself is `Send + Sync`; share it with `Arc` or borrow it into
/// scoped threads. Sessions are per-thread and not sendable.
///
/// # Example
///
/// ```
/// use spindle_queue::PriorityQueue;
///
/// let queue = PriorityQueue::new();
/// let mut session = queue.session();
///
/// session.insert(5, 500)?;
/// session.insert(3, 300)?;
/// assert_eq!(session.delete_min(), Some((3, 300)));
/// assert_eq!(session.delete_min(), Some((5, 500)));
/// assert_eq!(session.delete_min(), None);
/// # Ok::<(), spindle_core::Error>(())
/// ```
pub struct PriorityQueue {
    list: SkipList,
    config: QueueConfig,
}

impl PriorityQueue {
    /// Creates a queue with the default configuration.
    pub fn new() -> Self {
        let config = QueueConfig::default();
        debug!("creating priority queue: {config:?}");
        Self {
            list: SkipList::new(config.max_height, config.max_offset),
            config,
        }
    }

    /// Creates a queue with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the configuration is out of
    /// bounds.
    pub fn with_config(config: QueueConfig) -> Result<Self> {
        config.validate()?;
        debug!("creating priority queue: {config:?}");
        Ok(Self {
            list: SkipList::new(config.max_height, config.max_offset),
            config,
        })
    }

    /// The configuration this queue was created with.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Registers the calling thread with the queue and returns its session.
    ///
    /// Each thread that operates on the queue creates its own session; the
    /// session holds the thread's dequeue resume position, so it is not
    /// sendable to another thread.
    pub fn session(&self) -> Session<'_> {
        Session {
            list: &self.list,
            max_height: self.config.max_height,
            cache: HeadCache::new(),
            rng: StdRng::from_entropy(),
        }
    }
}

impl Default for PriorityQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// A per-thread handle to a [`PriorityQueue`]
///
/// Obtained from [`PriorityQueue::session`]. All queue operations go through
/// a session; none of them blocks, and contention is resolved internally by
/// retry.
pub struct Session<'a> {
    list: &'a SkipList,
    max_height: usize,
    cache: HeadCache,
    rng: StdRng,
}

impl Session<'_> {
    /// Samples a tower height: geometric with p = 1/2, clamped to the
    /// configured cap.
    fn random_height(&mut self) -> usize {
        let mut height = 1;
        while height < self.max_height && self.rng.gen_ratio(1, 2) {
            height += 1;
        }
        height
    }

    /// Inserts an entry. Duplicates of an existing key coexist.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReservedKey`] if `key` is one of the sentinel keys.
    pub fn insert(&mut self, key: Key, value: Value) -> Result<()> {
        if is_reserved(key) {
            return Err(Error::ReservedKey(key));
        }
        let height = self.random_height();
        let guard = epoch::pin();
        self.list.insert(key, value, height, &guard);
        Ok(())
    }

    /// Claims and returns an entry with a minimal key, or `None` if the
    /// queue is observed empty.
    ///
    /// The returned entry carried a minimal key at the instant it was
    /// claimed; concurrent callers claim disjoint entries.
    pub fn delete_min(&mut self) -> Option<(Key, Value)> {
        let guard = epoch::pin();
        self.list.delete_min(&mut self.cache, &guard)
    }

    /// Claims the first live entry carrying `key` and returns its value, or
    /// `None` if no live entry carries `key`.
    pub fn remove(&mut self, key: Key) -> Option<Value> {
        if is_reserved(key) {
            return None;
        }
        let guard = epoch::pin();
        self.list.remove(key, &guard)
    }
}
