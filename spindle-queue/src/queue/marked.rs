//! Atomic forward pointers carrying a deletion tag in their low bit

use std::sync::atomic::Ordering;

use crossbeam::epoch::{Atomic, Guard, Shared};

/// Tag bit that marks the pointee's owner as logically deleted.
pub(crate) const DELETED: usize = 1;

/// An atomic forward reference whose low pointer bit carries the
/// logical-deletion mark.
///
/// Nodes are at least cache-line aligned, so the low bits of every forward
/// pointer are free to hold the tag. All mark-bit handling funnels through
/// this wrapper: traversals use [`load_untagged`](Forward::load_untagged),
/// logical deletion uses [`try_mark`](Forward::try_mark), and splicing uses
/// [`cas`](Forward::cas).
pub(crate) struct Forward<T>(Atomic<T>);

impl<T> Forward<T> {
    pub(crate) fn null() -> Self {
        Forward(Atomic::null())
    }

    /// Loads the full word, tag included.
    pub(crate) fn load<'g>(&self, ord: Ordering, guard: &'g Guard) -> Shared<'g, T> {
        self.0.load(ord, guard)
    }

    /// Loads the pointer with the deletion tag stripped.
    pub(crate) fn load_untagged<'g>(&self, ord: Ordering, guard: &'g Guard) -> Shared<'g, T> {
        self.0.load(ord, guard).with_tag(0)
    }

    pub(crate) fn store(&self, new: Shared<'_, T>, ord: Ordering) {
        self.0.store(new, ord)
    }

    /// Sets the deletion tag with a single fetch-or.
    ///
    /// Returns `Ok(successor)` exactly when this call flipped the tag from
    /// clear to set; `successor` is the untagged pointer that was current at
    /// the instant of the flip. Returns `Err(current)` when the tag was
    /// already set. The tag never clears again, so at most one caller ever
    /// receives `Ok` for a given `Forward`.
    pub(crate) fn try_mark<'g>(&self, guard: &'g Guard) -> Result<Shared<'g, T>, Shared<'g, T>> {
        let old = self.0.fetch_or(DELETED, Ordering::AcqRel, guard);
        if old.tag() & DELETED == 0 {
            Ok(old)
        } else {
            Err(old)
        }
    }

    /// Compare-and-swap of the full word, tag included.
    ///
    /// Successful exchanges release prior writes, so a node published through
    /// this call is fully initialized before it becomes reachable. Returns
    /// the observed value on failure.
    pub(crate) fn cas<'g>(
        &self,
        current: Shared<'g, T>,
        new: Shared<'g, T>,
        guard: &'g Guard,
    ) -> Result<(), Shared<'g, T>> {
        self.0
            .compare_exchange(current, new, Ordering::Release, Ordering::Acquire, guard)
            .map(|_| ())
            .map_err(|e| e.current)
    }
}
