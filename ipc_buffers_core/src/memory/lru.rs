use alloc::{collections::VecDeque, sync::Weak};
use log::trace;
use spin::Mutex;

/// What happened to a page when its owner was asked to reclaim it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Walk {
    /// The entry is gone from the list (the page was evicted, or was no longer reclaimable).
    Removed,
    /// The owner is busy; the entry is rotated to the tail of the list and skipped.
    Busy,
}

/// Something that owns pages that can sit on a [`ReclaimList`].
pub trait Reclaim: Send + Sync {
    /// Release the frame backing page `index`, which was just taken off the reclaim list.
    ///
    /// This is called with the list locked, so it must not call back into the list and must not
    /// block on a lock that could be held by someone waiting for the list.
    fn reclaim(&self, index: usize) -> Walk;
}

struct Entry {
    owner: Weak<dyn Reclaim>,
    index: usize,
}

impl Entry {
    fn is(&self, owner: &Weak<dyn Reclaim>, index: usize) -> bool {
        self.index == index && same_owner(&self.owner, owner)
    }
}

fn same_owner(a: &Weak<dyn Reclaim>, b: &Weak<dyn Reclaim>) -> bool {
    core::ptr::addr_eq(a.as_ptr(), b.as_ptr())
}

/// A least-recently-used list of pages that are resident but not used by any buffer.
///
/// One list is shared by every region in the system. Pages are appended when they become unused
/// and evicted from the head, so the page that has been idle the longest goes first.
#[derive(Default)]
pub struct ReclaimList {
    entries: Mutex<VecDeque<Entry>>,
}

impl ReclaimList {
    /// Create a new, empty list.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Number of pages on the list.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True if there are no pages on the list.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Append page `index` of `owner` to the tail of the list.
    pub fn push(&self, owner: Weak<dyn Reclaim>, index: usize) {
        self.entries.lock().push_back(Entry { owner, index });
    }

    /// Take page `index` of `owner` off the list. Returns false if it was not on the list.
    pub fn remove(&self, owner: &Weak<dyn Reclaim>, index: usize) -> bool {
        let mut entries = self.entries.lock();
        match entries.iter().position(|e| e.is(owner, index)) {
            Some(position) => {
                entries.remove(position);
                true
            }
            None => false,
        }
    }

    /// Drop every entry belonging to `owner`.
    pub fn purge(&self, owner: &Weak<dyn Reclaim>) {
        self.entries
            .lock()
            .retain(|e| !same_owner(&e.owner, owner));
    }

    /// Evict up to `max` pages starting from the head of the list.
    ///
    /// Returns the number of entries removed from the list. Entries whose owner has gone away
    /// are dropped and counted; entries whose owner is busy are moved to the tail and not counted.
    pub fn walk(&self, max: usize) -> usize {
        let mut entries = self.entries.lock();
        let mut removed = 0;
        for _ in 0..max.min(entries.len()) {
            let Some(entry) = entries.pop_front() else {
                break;
            };
            let result = match entry.owner.upgrade() {
                Some(owner) => owner.reclaim(entry.index),
                None => Walk::Removed,
            };
            trace!("reclaim page {} -> {result:?}", entry.index);
            match result {
                Walk::Removed => removed += 1,
                Walk::Busy => entries.push_back(entry),
            }
        }
        removed
    }
}
