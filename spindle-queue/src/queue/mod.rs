//! Lock-free priority queue built on a skip list
//!
//! The queue is a multi-level skip list whose dequeue side separates
//! *logical* from *physical* deletion:
//!
//! - `delete_min` claims a node by setting the tag bit on the node's own
//!   bottom-level forward pointer with one fetch-or
//! - claimed nodes stay linked until a dequeuer has walked over more than
//!   `max_offset` of them, at which point the whole prefix is unlinked with
//!   a single swing of the head pointer and retired to the epoch collector
//!
//! Inserts commit at the bottom level first, so the level-0 chain is the
//! source of truth; upper levels are only shortcuts.
//!
//! # Example
//!
//! ```
//! use spindle_queue::PriorityQueue;
//!
//! let queue = PriorityQueue::new();
//! let mut session = queue.session();
//!
//! session.insert(7, 70)?;
//! session.insert(2, 20)?;
//! assert_eq!(session.delete_min(), Some((2, 20)));
//! # Ok::<(), spindle_core::Error>(())
//! ```

mod marked;
mod priority_queue;
mod skip_list;

pub use priority_queue::{PriorityQueue, Session};
