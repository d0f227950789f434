//! A fixed-capacity slot pool with a free-list, the Rust-native replacement
//! for the teacher's "free-list threaded through a struct field" trick
//! (`task/process.rs`, `ipc/anon_pipe.rs`'s fixed `[Option<T>; N]` tables).
//! `Option<T>` already tells slot occupancy apart, so the free-list here
//! only needs to track *which* slots are free, not carry sentinel links.

pub struct Pool<T> {
    slots: Vec<Option<T>>,
    free: Vec<usize>,
}

impl<T> Pool<T> {
    pub fn with_capacity(cap: usize) -> Self {
        Pool {
            slots: (0..cap).map(|_| None).collect(),
            free: (0..cap).rev().collect(),
        }
    }

    /// Acquire the lowest-numbered free slot and fill it. `None` if the
    /// pool is exhausted.
    pub fn alloc(&mut self, value: T) -> Option<usize> {
        let idx = self.free.pop()?;
        self.slots[idx] = Some(value);
        Some(idx)
    }

    /// Release a slot back to the free-list, returning its prior contents.
    pub fn free(&mut self, id: usize) -> Option<T> {
        let slot = self.slots.get_mut(id)?.take();
        if slot.is_some() {
            self.free.push(id);
        }
        slot
    }

    pub fn get(&self, id: usize) -> Option<&T> {
        self.slots.get(id).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut T> {
        self.slots.get_mut(id).and_then(|s| s.as_mut())
    }

    /// Every occupied slot, lowest id first. Used by `procinfo` to snapshot
    /// the process table without caring which ids are currently free.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| s.as_ref().map(|v| (i, v)))
    }
}
