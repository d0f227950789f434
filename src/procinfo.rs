//! `OpenInfo`'s read-only iterator over the process table — component F's
//! "trivial iterator" (§1), realized as its own descriptor kind bound
//! through the same [`crate::fd::FdTable`] pipes and sockets use.
//!
//! Grounded on the teacher's `taskmanager`, which polls a fixed-size thread
//! snapshot buffer off the live process list (`system/taskmanager/src/main.rs`)
//! rather than a streaming interface — the same shape as the snapshot taken
//! here at `OpenInfo` time.

use crate::constants::{Pid, PROCINFO_MAX_ARGS_SIZE};
use crate::proc::table::Pcb;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Alive,
    Zombie,
}

/// One process table slot's point-in-time snapshot.
#[derive(Debug, Clone, Copy)]
pub struct ProcInfoEntry {
    pub pid: Pid,
    /// `NOPROC` (-1) for pid 0 and pid 1, which have no parent.
    pub ppid: Pid,
    pub state: ProcState,
    pub thread_count: u32,
    pub args_len: usize,
    pub args: [u8; PROCINFO_MAX_ARGS_SIZE],
}

impl ProcInfoEntry {
    pub(crate) fn from_pcb(pcb: &Pcb) -> Self {
        let args_len = pcb.args.len().min(PROCINFO_MAX_ARGS_SIZE);
        let mut args = [0u8; PROCINFO_MAX_ARGS_SIZE];
        args[..args_len].copy_from_slice(&pcb.args[..args_len]);
        ProcInfoEntry {
            pid: pcb.pid,
            ppid: pcb.parent.unwrap_or(-1),
            state: pcb.state,
            thread_count: pcb.thread_count,
            args_len,
            args,
        }
    }
}

/// Per-fid cursor into the snapshot taken when its `OpenInfo` fid was
/// opened. Resolving a typed `&mut [ProcInfoEntry]` slice rather than a raw
/// byte buffer sidesteps Open Question 4 entirely (§9): there is no
/// allocate-then-short-memcpy path, since the cursor — not a caller-supplied
/// byte count — decides how many whole entries are produced each call.
pub struct InfoCursor {
    pub(crate) refcount: u32,
    entries: Vec<ProcInfoEntry>,
    cursor: usize,
}

impl InfoCursor {
    pub fn new(entries: Vec<ProcInfoEntry>) -> Self {
        InfoCursor {
            refcount: 1,
            entries,
            cursor: 0,
        }
    }

    /// Fill `out` with up to `out.len()` remaining entries, advancing the
    /// cursor. Returns the number written; `0` once the snapshot is
    /// exhausted, the same "drained producer" shape a pipe read has at EOF.
    pub fn read(&mut self, out: &mut [ProcInfoEntry]) -> i32 {
        let remaining = self.entries.len() - self.cursor;
        let n = out.len().min(remaining);
        out[..n].copy_from_slice(&self.entries[self.cursor..self.cursor + n]);
        self.cursor += n;
        n as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(pid: Pid) -> ProcInfoEntry {
        ProcInfoEntry {
            pid,
            ppid: 0,
            state: ProcState::Alive,
            thread_count: 1,
            args_len: 0,
            args: [0u8; PROCINFO_MAX_ARGS_SIZE],
        }
    }

    #[test]
    fn cursor_drains_then_returns_zero() {
        let mut c = InfoCursor::new(vec![entry(2), entry(3)]);
        let mut out = [entry(0); 1];
        assert_eq!(c.read(&mut out), 1);
        assert_eq!(out[0].pid, 2);
        assert_eq!(c.read(&mut out), 1);
        assert_eq!(out[0].pid, 3);
        assert_eq!(c.read(&mut out), 0);
    }
}
