//! Resource ID allocation.

use std::collections::BTreeSet;

/// Free-list plus high-water mark. The lowest released ID is reused first.
#[derive(Debug, Default)]
pub struct IdAllocator {
    free: BTreeSet<u32>,
    next: u32,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an ID, or `None` once every `u32` is taken.
    pub fn allocate(&mut self) -> Option<u32> {
        if let Some(id) = self.free.pop_first() {
            return Some(id);
        }
        let id = self.next;
        self.next = self.next.checked_add(1)?;
        Some(id)
    }

    /// Return `id` to the pool. Unknown or already free IDs are ignored.
    pub fn release(&mut self, id: u32) -> bool {
        if id >= self.next {
            return false;
        }
        self.free.insert(id)
    }

    pub fn in_use(&self) -> usize {
        self.next as usize - self.free.len()
    }
}
