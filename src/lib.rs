//! Process/thread/IPC core of a small teaching operating system.
//!
//! This crate provides the mechanism a bare-metal kernel's syscall
//! trampoline would dispatch into: a process table with parent/child
//! reaping, per-process threads with refcounted join handles, bounded
//! pipes, and local stream sockets built on top of those pipes. It does not
//! provide a scheduler, a syscall trampoline, device drivers, or boot code
//! — those are a caller's concern. [`Kernel`] is the single entry point;
//! every operation on it is safe to call concurrently from any number of
//! backing OS threads, since it serializes all of them behind one internal
//! lock (see `kernel` for why a single lock is the right model here).
//!
//! ```
//! use tinykernel_core::Kernel;
//!
//! let kernel = Kernel::new();
//! let (reader, writer) = kernel.pipe_create().unwrap();
//! assert_eq!(kernel.write(writer, b"hi"), 2);
//! kernel.close(writer);
//! let mut buf = [0u8; 2];
//! assert_eq!(kernel.read(reader, &mut buf), 2);
//! ```

pub mod constants;
pub mod error;
pub mod fd;
pub mod ipc;
pub mod kernel;
pub mod net;
pub mod pool;
pub mod proc;
pub mod procinfo;
pub mod sched;

pub use constants::{Fid, Pid, Tid, INIT_PID, NOFILE, NOPROC, ROOT_PID};
pub use error::KernelError;
pub use kernel::{Kernel, ShutdownHow};
pub use procinfo::{ProcInfoEntry, ProcState};
