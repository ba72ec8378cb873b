//! Deferred Reclamation
//!
//! A resource the CPU is done with may still be read by GPU work that has
//! been submitted but not yet retired. [`DeferredReclamationQueue`] holds such
//! resources until every queue that might reference them has completed.
//!
//! # Flow
//!
//! ```text
//!   any thread                    completion thread
//!   ──────────                    ─────────────────
//!   release(R, {Q0,Q2}) ──chan──► purge(completed)
//!                                   ├─ drain channel into pending
//!                                   ├─ split: mask ⊆ completed ?
//!                                   └─ reclaim ready entries (no lock held)
//! ```
//!
//! Producers never contend with each other or with the purge thread: the
//! release path is a lock-free `flume` send. Reclaiming runs after the
//! pending list lock has been dropped, since it takes the owning allocator's
//! lock.

use std::ops::{BitOr, BitOrAssign};

use parking_lot::Mutex;

// ─── Queue Masks ─────────────────────────────────────────────────────────────

/// Set of GPU command queues, one bit per queue index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct QueueMask(u64);

impl QueueMask {
    pub const NONE: Self = Self(0);
    pub const ALL: Self = Self(u64::MAX);

    /// Mask holding the single queue `index`.
    ///
    /// # Panics
    ///
    /// If `index >= 64`.
    #[inline]
    #[must_use]
    pub const fn queue(index: u32) -> Self {
        assert!(index < 64, "queue index out of range");
        Self(1 << index)
    }

    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    #[inline]
    #[must_use]
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Every queue in `other` is also in `self`.
    #[inline]
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        other.0 & !self.0 == 0
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for QueueMask {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for QueueMask {
    #[inline]
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

// ─── Reclaimable ─────────────────────────────────────────────────────────────

/// A resource whose real release is deferred.
///
/// `reclaim` runs exactly once, on the purging thread.
pub trait Reclaimable: Send {
    fn reclaim(self: Box<Self>);
}

/// Adapts a closure into a [`Reclaimable`].
pub struct ReclaimFn<F>(pub F);

impl<F> Reclaimable for ReclaimFn<F>
where
    F: FnOnce() + Send,
{
    fn reclaim(self: Box<Self>) {
        let Self(f) = *self;
        f();
    }
}

struct StaleEntry {
    resource: Box<dyn Reclaimable>,
    mask: QueueMask,
}

// ─── Queue ───────────────────────────────────────────────────────────────────

pub struct DeferredReclamationQueue {
    sender: flume::Sender<StaleEntry>,
    receiver: flume::Receiver<StaleEntry>,
    pending: Mutex<Vec<StaleEntry>>,
}

impl Default for DeferredReclamationQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DeferredReclamationQueue {
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = flume::unbounded();
        Self {
            sender,
            receiver,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Takes ownership of `resource` until every queue in `mask` has completed.
    ///
    /// An empty mask means no queue references the resource; it is reclaimed
    /// by the next [`purge`](Self::purge).
    pub fn release<R>(&self, resource: R, mask: QueueMask)
    where
        R: Reclaimable + 'static,
    {
        self.release_boxed(Box::new(resource), mask);
    }

    pub fn release_boxed(&self, resource: Box<dyn Reclaimable>, mask: QueueMask) {
        if self.sender.send(StaleEntry { resource, mask }).is_err() {
            unreachable!("reclamation queue owns its receiver");
        }
    }

    /// Reclaims every entry whose mask is contained in `completed`.
    /// Returns the number of resources reclaimed.
    pub fn purge(&self, completed: QueueMask) -> usize {
        let ready: Vec<StaleEntry> = {
            let mut pending = self.pending.lock();
            pending.extend(self.receiver.try_iter());
            let (ready, waiting): (Vec<_>, Vec<_>) = pending
                .drain(..)
                .partition(|entry| completed.contains(entry.mask));
            *pending = waiting;
            ready
        };

        let reclaimed = ready.len();
        for entry in ready {
            entry.resource.reclaim();
        }
        if reclaimed > 0 {
            log::debug!("Reclaimed {reclaimed} stale resource(s) for completed queues {completed:?}");
        }
        reclaimed
    }

    /// Reclaims everything regardless of mask. Only valid once the device is idle.
    pub fn purge_all(&self) -> usize {
        self.purge(QueueMask::ALL)
    }

    /// Resources released but not yet reclaimed.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len() + self.receiver.len()
    }
}

impl Drop for DeferredReclamationQueue {
    fn drop(&mut self) {
        let leftover = self.purge_all();
        if leftover > 0 {
            log::warn!("Reclamation queue dropped with {leftover} pending resource(s); reclaimed without waiting");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> ReclaimFn<Box<dyn FnOnce() + Send>>) {
        let count = Arc::new(AtomicUsize::new(0));
        let shared = Arc::clone(&count);
        let make = move || {
            let shared = Arc::clone(&shared);
            ReclaimFn(Box::new(move || {
                shared.fetch_add(1, Ordering::SeqCst);
            }) as Box<dyn FnOnce() + Send>)
        };
        (count, make)
    }

    #[test]
    fn mask_containment() {
        let q01 = QueueMask::queue(0) | QueueMask::queue(1);
        assert!(q01.contains(QueueMask::queue(1)));
        assert!(q01.contains(QueueMask::NONE));
        assert!(!QueueMask::queue(0).contains(q01));
        assert!(QueueMask::ALL.contains(q01));
    }

    #[test]
    fn entry_waits_for_every_queue() {
        let (count, make) = counter();
        let queue = DeferredReclamationQueue::new();
        queue.release(make(), QueueMask::queue(0) | QueueMask::queue(1));

        assert_eq!(queue.purge(QueueMask::queue(0)), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        assert_eq!(queue.purge(QueueMask::queue(0) | QueueMask::queue(1)), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert_eq!(queue.purge(QueueMask::ALL), 0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_reclaims_leftovers() {
        let (count, make) = counter();
        {
            let queue = DeferredReclamationQueue::new();
            queue.release(make(), QueueMask::queue(3));
            assert_eq!(queue.pending_count(), 1);
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
