//! Fixed-size tables with a rotating allocation cursor
//!
//! The mailbox registry, the message buffer pool and the wait-entry table
//! are all fixed arrays of slots. A slot is claimed by scanning circularly
//! from a cursor that keeps moving forward, so a freed slot is not handed
//! out again until the scan has wrapped around.

use alloc::vec::Vec;

/// A slot in a [`CircularTable`]
pub trait TableEntry {
    /// Is the slot available for allocation?
    fn is_free(&self) -> bool;

    /// Return the slot to its free state
    fn reset(&mut self);
}

/// Fixed-capacity arena addressed by index
#[derive(Debug)]
pub struct CircularTable<T> {
    entries: Vec<T>,
    cursor: usize,
    in_use: usize,
}

impl<T: TableEntry> CircularTable<T> {
    /// Build a table of `len` free slots
    pub fn new(len: usize, mut make: impl FnMut(usize) -> T) -> Self {
        let entries: Vec<T> = (0..len).map(&mut make).collect();
        debug_assert!(entries.iter().all(|e| e.is_free()));
        Self {
            entries,
            cursor: 0,
            in_use: 0,
        }
    }

    /// Claim the next free slot at or after the cursor
    ///
    /// Scans at most one full pass. On success `init` fills the slot (it
    /// must leave it non-free) and the cursor moves past it.
    pub fn claim(&mut self, init: impl FnOnce(usize, &mut T)) -> Option<usize> {
        let len = self.entries.len();
        if self.in_use == len {
            return None;
        }

        for step in 0..len {
            let idx = (self.cursor + step) % len;
            if self.entries[idx].is_free() {
                init(idx, &mut self.entries[idx]);
                debug_assert!(!self.entries[idx].is_free());
                self.cursor = (idx + 1) % len;
                self.in_use += 1;
                return Some(idx);
            }
        }
        None
    }

    /// Return a slot to the free state; false if it was already free
    pub fn release(&mut self, idx: usize) -> bool {
        match self.entries.get_mut(idx) {
            Some(entry) if !entry.is_free() => {
                entry.reset();
                self.in_use -= 1;
                true
            }
            _ => false,
        }
    }

    /// Slot at `idx`, free or not
    pub fn get(&self, idx: usize) -> Option<&T> {
        self.entries.get(idx)
    }

    /// Mutable slot at `idx`, free or not
    pub fn get_mut(&mut self, idx: usize) -> Option<&mut T> {
        self.entries.get_mut(idx)
    }

    /// Total number of slots
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Number of claimed slots
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// True when every slot is claimed
    pub fn is_exhausted(&self) -> bool {
        self.in_use == self.entries.len()
    }

    /// Iterate over all slots
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }
}
