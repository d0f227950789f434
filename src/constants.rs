//! Fixed-capacity sizing for every table the core owns.
//!
//! Mirrors the teacher kernel's own style of compile-time `const` limits
//! (`MAX_PIPES`, `MAX_FDS`, `MAX_BLOCKED`, …) rather than a runtime config
//! layer — there is nothing here a caller would plausibly want to tune at
//! startup.

/// Maximum number of process table slots.
pub const MAX_PROC: usize = 128;

/// Maximum number of open descriptors per process.
pub const MAX_FILEID: usize = 64;

/// Highest valid port number. Port 0 is `NOPORT` and is never listenable.
pub const MAX_PORT: u16 = 1024;

/// Pipe ring buffer capacity in bytes, `N` in spec terms. Usable capacity is
/// `N - 1` (one-slot-empty convention).
pub const PIPE_BUFFER_SIZE: usize = 1024;

/// Maximum size in bytes of a single `procinfo` entry's embedded argument
/// preview.
pub const PROCINFO_MAX_ARGS_SIZE: usize = 256;

/// Global pipe table capacity. Not named explicitly in the syscall table,
/// but every pipe lives in one process-wide pool the same way the process
/// and socket tables do.
pub const MAX_PIPES: usize = MAX_PROC * 4;

/// Global socket table capacity, same rationale as `MAX_PIPES`.
pub const MAX_SOCKETS: usize = MAX_PROC * 4;

/// Process identifier. Negative values are never valid pids.
pub type Pid = i32;

/// Sentinel returned by pid-producing calls on failure.
pub const NOPROC: Pid = -1;

/// Per-thread join-handle identifier, unique for the lifetime of the
/// process (see `proc::thread` for the scoping rule).
pub type Tid = u32;

/// Process-scoped descriptor identifier.
pub type Fid = i32;

/// Sentinel returned by fid-producing calls on failure.
pub const NOFILE: Fid = -1;

/// The root scheduler pseudo-process. Never exits, never reaped.
pub const ROOT_PID: Pid = 0;

/// init. The universal reparent/reap target for orphaned children.
pub const INIT_PID: Pid = 1;
