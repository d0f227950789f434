//! PTCB — the per-thread join handle.
//!
//! Created with `refcount == 0`. `exited` flips 0 -> 1 exactly once, from
//! the exiting thread itself. Freed (removed from its owning [`super::table::Pcb`]'s
//! thread list) either by the last joiner to drop its reference once
//! `exited && refcount == 0`, or by the process's last-thread cleanup path,
//! which drains every PTCB regardless of refcount.

use crate::constants::Tid;
use crate::sched::Cv;

pub struct Ptcb {
    pub tid: Tid,
    pub exited: bool,
    pub detached: bool,
    pub refcount: u32,
    pub exit_val: i32,
    /// Broadcast on exit and on detach.
    pub exit_cv: Cv,
}

impl Ptcb {
    pub fn new(tid: Tid) -> Self {
        Ptcb {
            tid,
            exited: false,
            detached: false,
            refcount: 0,
            exit_val: 0,
            exit_cv: Cv::new(),
        }
    }

    /// A PTCB's slot can be reclaimed once it has exited and nobody is
    /// still joined to it.
    pub fn reclaimable(&self) -> bool {
        self.exited && self.refcount == 0
    }
}
