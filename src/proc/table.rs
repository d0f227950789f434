//! The process control block and its lifecycle fields.
//!
//! Invariants (unchanged from spec): `thread_count > 0 <=> state == Alive`;
//! a `Zombie` process has already handed its `children`/`exited_children`
//! lists to init. Pid 0 (root) and pid 1 (init) both have `parent == None`
//! and are pre-populated by [`crate::kernel::Kernel::new`] — they are never
//! handed out by the ordinary acquire path.

use crate::constants::{Pid, Tid};
use crate::fd::FdTable;
use crate::proc::thread::Ptcb;
use crate::procinfo::ProcState;
use crate::sched::Cv;

pub struct Pcb {
    pub pid: Pid,
    pub state: ProcState,
    pub parent: Option<Pid>,
    pub exit_val: i32,
    pub main_thread: Option<Tid>,
    /// Owned copy of the spawn arguments, kept only for `procinfo` display —
    /// the task closure itself is `FnOnce` and is consumed by the spawned
    /// thread's trampoline, so there is nothing callable left to retain.
    pub args: Vec<u8>,
    pub children: Vec<Pid>,
    pub exited_children: Vec<Pid>,
    pub threads: Vec<Ptcb>,
    pub fds: FdTable,
    pub thread_count: u32,
    pub child_exit: Cv,
}

impl Pcb {
    pub fn new(pid: Pid, parent: Option<Pid>, args: Vec<u8>) -> Self {
        Pcb {
            pid,
            state: ProcState::Alive,
            parent,
            exit_val: 0,
            main_thread: None,
            args,
            children: Vec::new(),
            exited_children: Vec::new(),
            threads: Vec::new(),
            fds: FdTable::new(),
            thread_count: 0,
            child_exit: Cv::new(),
        }
    }

    pub fn find_thread(&self, tid: Tid) -> Option<&Ptcb> {
        self.threads.iter().find(|t| t.tid == tid)
    }

    pub fn find_thread_mut(&mut self, tid: Tid) -> Option<&mut Ptcb> {
        self.threads.iter_mut().find(|t| t.tid == tid)
    }
}
