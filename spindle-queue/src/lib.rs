//! Concurrent priority queue for Spindle
//!
//! This crate implements a lock-free shared event set: many threads perform
//! `insert` and `delete_min` against one queue without a global lock. It is
//! built from the following pieces:
//!
//! - **Skip list**: the ordered multi-level structure holding the entries
//! - **Logical deletion**: dequeues claim a node with a single atomic
//!   fetch-or on a tagged forward pointer
//! - **Batched physical unlink**: claimed head nodes are unlinked in
//!   batches, so the head cache line is written once per batch
//! - **Epoch reclamation**: claimed nodes are retired through
//!   `crossbeam::epoch` and freed only when no reader can hold them
//!
//! # Architecture
//!
//! ```text
//! Insert path:
//! Session::insert → weak search → CAS at level 0 → thread tower upward
//!
//! Dequeue path:
//! Session::delete_min → cached restart → fetch-or claim
//!                     → (offset exceeded) head swing + batch retire
//! ```
//!
//! # Example
//!
//! ```
//! use std::thread;
//!
//! use spindle_queue::PriorityQueue;
//!
//! let queue = PriorityQueue::new();
//! thread::scope(|s| {
//!     for _ in 0..4 {
//!         s.spawn(|| {
//!             let mut session = queue.session();
//!             for i in 1..100u64 {
//!                 session.insert(i, i).unwrap();
//!             }
//!             while session.delete_min().is_some() {}
//!         });
//!     }
//! });
//! ```

pub mod config;
pub mod queue;

pub use config::QueueConfig;
pub use queue::{PriorityQueue, Session};
