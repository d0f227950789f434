//! Internal error taxonomy for the one corner of the crate that allocates
//! from a fixed-capacity pool mid-operation and needs to unwind cleanly:
//! reserving the pipe/descriptor pair behind `pipe_create` (`alloc_pipe_pair`
//! in `kernel.rs`). Using `?` there instead of a chain of `if let Some(..)
//! { .. } else { return ... }` checks is what earns `KernelError` its keep;
//! every other syscall-shaped `Kernel` method threads spec.md's own raw
//! sentinel ABI (`-1`, `NOFILE`, `NOPROC`) straight through, matching
//! spec.md §7's "no errno, the taxonomy is behavioural" directly rather than
//! through an intermediate typed `Result`.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum KernelError {
    #[error("handle does not refer to a live object")]
    InvalidHandle,

    #[error("no free slot available")]
    ResourceExhausted,
}
