//! Per-process descriptor table — the "Core→FCB contract" of spec §6,
//! realized directly since the real file-descriptor layer is out of scope.
//!
//! Each entry binds a process-local [`Fid`] to the kind of kernel object it
//! refers to. There is no separate FCB-level refcount here: the underlying
//! object (pipe or socket) already owns the refcount that matters, and
//! `reserve`/`clear` simply drive that object's incref/decref at the call
//! sites in `kernel.rs` — matching the teacher's `fs::fd_table` pattern of a
//! flat, fixed-size, no-heap-allocation table (`fs/fd_table.rs`), generalized
//! from "VFS file or pipe end" to "pipe end or socket".

use crate::constants::{Fid, MAX_FILEID};

/// What a single descriptor slot refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdKind {
    PipeRead(usize),
    PipeWrite(usize),
    Socket(usize),
    Info(usize),
}

/// Per-process descriptor table, fixed at [`MAX_FILEID`] slots.
#[derive(Clone)]
pub struct FdTable {
    entries: Vec<Option<FdKind>>,
}

impl FdTable {
    pub fn new() -> Self {
        FdTable {
            entries: vec![None; MAX_FILEID],
        }
    }

    /// Bind the lowest free slot to `kind`. Fails if the table is full.
    pub fn reserve(&mut self, kind: FdKind) -> Option<Fid> {
        let idx = self.entries.iter().position(Option::is_none)?;
        self.entries[idx] = Some(kind);
        Some(idx as Fid)
    }

    pub fn get(&self, fid: Fid) -> Option<FdKind> {
        self.entries.get(usize::try_from(fid).ok()?).copied().flatten()
    }

    /// Clear a slot, returning whatever it held (for the caller to decref).
    pub fn clear(&mut self, fid: Fid) -> Option<FdKind> {
        let slot = self.entries.get_mut(usize::try_from(fid).ok()?)?;
        slot.take()
    }

    /// All open (fid, kind) pairs — used by `Exec` to clone the table and
    /// bump every referenced object's refcount.
    pub fn iter_open(&self) -> impl Iterator<Item = (Fid, FdKind)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.map(|k| (i as Fid, k)))
    }

    /// Drain every open slot, returning the kinds that were closed (for the
    /// caller to decref each one). Used by process/thread exit.
    pub fn drain(&mut self) -> Vec<FdKind> {
        self.entries.iter_mut().filter_map(|e| e.take()).collect()
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}
