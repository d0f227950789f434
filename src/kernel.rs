//! The kernel facade: owns the single lock every other module waits
//! against, and hosts the syscall-shaped public API (§6).
//!
//! Every public method locks [`Kernel`]'s one `Mutex<KernelState>` at entry
//! and holds it for the call's duration, matching "global mutex acquired at
//! syscall entry" (4.A, §5). State-mutating logic that doesn't itself block
//! is factored into free functions taking `&mut KernelState` so it can be
//! reused from inside an already-locked call (`Accept` allocating a fresh
//! socket the way `Socket` does, without relocking — `std::sync::Mutex` is
//! not reentrant). Logic that *can* block takes the `MutexGuard` by value
//! and hands it back, the same calling convention `sched::Cv::wait` uses.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::debug;

use crate::constants::{Fid, Pid, Tid, INIT_PID, MAX_PIPES, MAX_PORT, MAX_PROC, MAX_SOCKETS, NOFILE, NOPROC, ROOT_PID};
use crate::error::KernelError;
use crate::fd::FdKind;
use crate::ipc::pipe::Pipe;
use crate::net::socket::{ConnRequest, PendingConnect, Scb, SockPayload};
use crate::pool::Pool;
use crate::proc::table::Pcb;
use crate::proc::thread::Ptcb;
use crate::procinfo::{InfoCursor, ProcInfoEntry, ProcState};
use crate::sched::{self, Cv};

/// Which half(s) of a peer socket to shut down — realizes §6's
/// `{READ, WRITE, BOTH}` mode argument to `ShutDown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownHow {
    Read,
    Write,
    Both,
}

thread_local! {
    /// The (pid, tid) of the kernel-level thread backing this OS thread.
    /// Set once, by the trampoline that `exec`/`create_thread` spawn;
    /// never set at all for a thread that never called into the kernel as
    /// a spawned task (such a caller is treated as pid 0, the ambient root
    /// context every bootstrap call runs under before any process exists).
    static CURRENT: std::cell::Cell<(Pid, Tid)> = std::cell::Cell::new((ROOT_PID, 0));
}

fn current() -> (Pid, Tid) {
    CURRENT.with(|c| c.get())
}

fn set_current(pid: Pid, tid: Tid) {
    CURRENT.with(|c| c.set((pid, tid)));
}

/// All state guarded by the single kernel lock.
pub struct KernelState {
    procs: Pool<Pcb>,
    pipes: Pool<Pipe>,
    socks: Pool<Scb>,
    infos: Pool<InfoCursor>,
    /// Index 0 is the unused `NOPORT` sentinel; `1..=MAX_PORT` are real.
    port_map: Vec<Option<usize>>,
    next_tid: Tid,
    next_request_id: u64,
}

struct Inner {
    state: Mutex<KernelState>,
}

/// A cheaply-cloneable handle to the kernel core. Cloning bumps an `Arc`
/// refcount; every clone shares the same lock and tables. `exec` and
/// `create_thread` each clone a handle into the OS thread they spawn so
/// that thread can call back into the kernel (to run its trampoline's
/// final `thread_exit`) without needing a `'static` reference threaded in
/// by the caller.
#[derive(Clone)]
pub struct Kernel(Arc<Inner>);

impl Kernel {
    pub fn new() -> Self {
        let mut procs = Pool::with_capacity(MAX_PROC);
        let root = procs
            .alloc(Pcb::new(ROOT_PID, None, Vec::new()))
            .expect("MAX_PROC must be at least 2");
        let init = procs
            .alloc(Pcb::new(INIT_PID, None, Vec::new()))
            .expect("MAX_PROC must be at least 2");
        debug_assert_eq!(root, ROOT_PID as usize);
        debug_assert_eq!(init, INIT_PID as usize);
        debug!("kernel initialized: pid 0 (root) and pid 1 (init) pre-populated");
        Kernel(Arc::new(Inner {
            state: Mutex::new(KernelState {
                procs,
                pipes: Pool::with_capacity(MAX_PIPES),
                socks: Pool::with_capacity(MAX_SOCKETS),
                infos: Pool::with_capacity(MAX_PROC),
                port_map: vec![None; MAX_PORT as usize + 1],
                next_tid: 1,
                next_request_id: 1,
            }),
        }))
    }

    fn lock(&self) -> MutexGuard<'_, KernelState> {
        self.0.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    // ---- process lifecycle (4.C) ----------------------------------------

    /// Realizes `Exec`: spawns a new process running `task(&args)` on its
    /// main thread. `args` is deep-copied, matching "argl bytes are
    /// deep-copied" (§6) — unlike `create_thread`, whose closure the caller
    /// supplies directly.
    pub fn exec<F>(&self, task: F, args: &[u8]) -> Pid
    where
        F: FnOnce(&[u8]) -> i32 + Send + 'static,
    {
        let mut guard = self.lock();
        let (parent_pid, _) = current();
        let owned_args = args.to_vec();

        let idx = match guard.procs.alloc(Pcb::new(0, None, owned_args.clone())) {
            Some(i) => i,
            None => return NOPROC,
        };
        let pid = idx as Pid;
        let parent = if pid <= 1 { None } else { Some(parent_pid) };
        {
            let pcb = guard.procs.get_mut(idx).unwrap();
            pcb.pid = pid;
            pcb.parent = parent;
        }

        if let Some(ppid) = parent {
            let inherited = {
                let parent_pcb = match guard.procs.get(ppid as usize) {
                    Some(p) => p,
                    None => {
                        guard.procs.free(idx);
                        return NOPROC;
                    }
                };
                parent_pcb.fds.clone()
            };
            for (_, kind) in inherited.iter_open() {
                incref_kind(&mut guard, kind);
            }
            {
                let pcb = guard.procs.get_mut(idx).unwrap();
                pcb.fds = inherited;
            }
            if let Some(parent_pcb) = guard.procs.get_mut(ppid as usize) {
                parent_pcb.children.push(pid);
            }
        }

        let tid = guard.next_tid;
        guard.next_tid += 1;
        {
            let pcb = guard.procs.get_mut(idx).unwrap();
            pcb.threads.push(Ptcb::new(tid));
            pcb.main_thread = Some(tid);
            pcb.thread_count = 1;
        }
        drop(guard);

        debug!("exec: spawned pid {} (parent {:?})", pid, parent);
        let handle = self.clone();
        sched::spawn_thread(move || {
            set_current(pid, tid);
            let val = task(&owned_args);
            handle.thread_exit(val);
        });
        pid
    }

    /// Realizes `Exit`: writes the process-level exit value, drains init's
    /// own children first if the caller *is* init, then runs the same
    /// thread-teardown path `ThreadExit` uses.
    pub fn exit(&self, val: i32) -> ! {
        let (pid, _) = current();
        {
            let mut guard = self.lock();
            if let Some(pcb) = guard.procs.get_mut(pid as usize) {
                pcb.exit_val = val;
            }
        }
        if pid == INIT_PID {
            loop {
                if self.wait_child(NOPROC, None) == NOPROC {
                    break;
                }
            }
        }
        self.thread_exit(val)
    }

    /// Realizes `WaitChild`. `cpid == NOPROC` waits for any child.
    pub fn wait_child(&self, cpid: Pid, out: Option<&mut i32>) -> Pid {
        let mut guard = self.lock();
        let (me, _) = current();
        let idx = me as usize;

        if cpid != NOPROC {
            let valid = guard
                .procs
                .get(idx)
                .map(|p| p.children.contains(&cpid) || p.exited_children.contains(&cpid))
                .unwrap_or(false);
            if !valid {
                return NOPROC;
            }
        }

        loop {
            if cpid != NOPROC {
                let zombie = guard
                    .procs
                    .get(cpid as usize)
                    .map(|p| p.state == ProcState::Zombie)
                    .unwrap_or(false);
                if zombie {
                    return reap(&mut guard, idx, cpid, out);
                }
            } else {
                let (has_children, zombie_pid) = match guard.procs.get(idx) {
                    Some(p) => (
                        !p.children.is_empty() || !p.exited_children.is_empty(),
                        p.exited_children.first().copied(),
                    ),
                    None => (false, None),
                };
                if !has_children {
                    return NOPROC;
                }
                if let Some(zpid) = zombie_pid {
                    return reap(&mut guard, idx, zpid, out);
                }
            }
            let cv = match guard.procs.get(idx) {
                Some(p) => p.child_exit.clone(),
                None => return NOPROC,
            };
            guard = cv.wait(guard);
        }
    }

    pub fn get_pid(&self) -> Pid {
        current().0
    }

    pub fn get_ppid(&self) -> Pid {
        let (me, _) = current();
        let guard = self.lock();
        guard
            .procs
            .get(me as usize)
            .and_then(|p| p.parent)
            .unwrap_or(NOPROC)
    }

    // ---- threads (4.D) ----------------------------------------------------

    /// Realizes `CreateThread`. Unlike `exec`, `task`'s captured
    /// environment is *not* copied — the `'static` bound is how Rust
    /// expresses "caller must keep alive" in place of a raw pointer
    /// contract.
    pub fn create_thread<F>(&self, task: F) -> Tid
    where
        F: FnOnce() -> i32 + Send + 'static,
    {
        let mut guard = self.lock();
        let (pid, _) = current();
        let idx = pid as usize;
        let tid = guard.next_tid;
        guard.next_tid += 1;
        if let Some(pcb) = guard.procs.get_mut(idx) {
            pcb.threads.push(Ptcb::new(tid));
            pcb.thread_count += 1;
        }
        drop(guard);

        let handle = self.clone();
        sched::spawn_thread(move || {
            set_current(pid, tid);
            let val = task();
            handle.thread_exit(val);
        });
        tid
    }

    pub fn thread_self(&self) -> Tid {
        current().1
    }

    /// Realizes `Join`. Returns `-1` for unknown PTCB, self-join, an
    /// already-detached target, or a target that gets detached while we
    /// wait; otherwise `0` with `*out` set to the exit value.
    pub fn thread_join(&self, tid: Tid, out: Option<&mut i32>) -> i32 {
        let mut guard = self.lock();
        let (pid, me_tid) = current();
        let idx = pid as usize;

        if tid == me_tid {
            return -1;
        }
        let found = guard
            .procs
            .get(idx)
            .map(|p| p.find_thread(tid).is_some())
            .unwrap_or(false);
        if !found {
            return -1;
        }
        {
            let t = guard.procs.get_mut(idx).unwrap().find_thread_mut(tid).unwrap();
            if t.detached {
                return -1;
            }
            t.refcount += 1;
        }

        loop {
            let (exited, detached, cv) = {
                let t = guard.procs.get(idx).unwrap().find_thread(tid).unwrap();
                (t.exited, t.detached, t.exit_cv.clone())
            };
            if exited || detached {
                break;
            }
            guard = cv.wait(guard);
        }

        let pcb = guard.procs.get_mut(idx).unwrap();
        let t = pcb.find_thread_mut(tid).unwrap();
        t.refcount = t.refcount.saturating_sub(1);
        if !t.exited && t.detached {
            return -1;
        }
        let exit_val = t.exit_val;
        let reclaim = t.reclaimable();
        if let Some(o) = out {
            *o = exit_val;
        }
        if reclaim {
            pcb.threads.retain(|pt| pt.tid != tid);
        }
        0
    }

    /// Realizes `Detach`. Broadcasts so any in-flight joiner wakes and
    /// observes `detached`.
    pub fn thread_detach(&self, tid: Tid) -> i32 {
        let mut guard = self.lock();
        let (pid, _) = current();
        let idx = pid as usize;
        let pcb = match guard.procs.get_mut(idx) {
            Some(p) => p,
            None => return -1,
        };
        let t = match pcb.find_thread_mut(tid) {
            Some(t) => t,
            None => return -1,
        };
        if t.exited {
            return -1;
        }
        t.detached = true;
        t.exit_cv.broadcast();
        0
    }

    /// Realizes `ThreadExit`. Never returns — the backing OS thread parks
    /// forever once teardown completes, modeling `kernel_sleep(EXITED, ...)`.
    pub fn thread_exit(&self, val: i32) -> ! {
        let (pid, tid) = current();
        {
            let mut guard = self.lock();
            let idx = pid as usize;
            let became_idle = if let Some(pcb) = guard.procs.get_mut(idx) {
                if let Some(t) = pcb.find_thread_mut(tid) {
                    t.exit_val = val;
                    t.exited = true;
                    t.exit_cv.broadcast();
                }
                pcb.thread_count = pcb.thread_count.saturating_sub(1);
                pcb.thread_count == 0
            } else {
                false
            };
            if became_idle && pid != INIT_PID {
                finalize_process(&mut guard, idx);
            }
        }
        loop {
            std::thread::park();
        }
    }

    // ---- pipes (4.B) --------------------------------------------------------

    /// Realizes `Pipe`: reserves a `(reader_fid, writer_fid)` pair.
    pub fn pipe_create(&self) -> Result<(Fid, Fid), KernelError> {
        let mut guard = self.lock();
        let (pid, _) = current();
        alloc_pipe_pair(&mut guard, pid as usize)
    }

    pub fn write(&self, fid: Fid, buf: &[u8]) -> i32 {
        let guard = self.lock();
        let (pid, _) = current();
        let idx = pid as usize;
        let kind = guard.procs.get(idx).and_then(|p| p.fds.get(fid));
        let pipe_id = match kind.and_then(|k| resolve_write_pipe(&guard, k)) {
            Some(id) => id,
            None => return -1,
        };
        let (_g, n) = pipe_write_blocking(guard, pipe_id, buf);
        n
    }

    pub fn read(&self, fid: Fid, buf: &mut [u8]) -> i32 {
        let guard = self.lock();
        let (pid, _) = current();
        let idx = pid as usize;
        let kind = guard.procs.get(idx).and_then(|p| p.fds.get(fid));
        let pipe_id = match kind.and_then(|k| resolve_read_pipe(&guard, k)) {
            Some(id) => id,
            None => return -1,
        };
        let (_g, n) = pipe_read_blocking(guard, pipe_id, buf);
        n
    }

    /// Realizes the stream vtable's `Close` for any descriptor kind.
    pub fn close(&self, fid: Fid) -> i32 {
        let mut guard = self.lock();
        let (pid, _) = current();
        let idx = pid as usize;
        let kind = {
            let pcb = match guard.procs.get_mut(idx) {
                Some(p) => p,
                None => return -1,
            };
            pcb.fds.clear(fid)
        };
        match kind {
            Some(k) => {
                decref_kind(&mut guard, k);
                0
            }
            None => -1,
        }
    }

    // ---- sockets (4.E) ------------------------------------------------------

    pub fn socket(&self, port: u16) -> Fid {
        if port > MAX_PORT {
            return NOFILE;
        }
        let mut guard = self.lock();
        let (pid, _) = current();
        alloc_socket(&mut guard, pid as usize, port).unwrap_or(NOFILE)
    }

    pub fn listen(&self, fid: Fid) -> i32 {
        let mut guard = self.lock();
        let (pid, _) = current();
        do_listen(&mut guard, pid as usize, fid)
    }

    pub fn connect(&self, fid: Fid, port: u16, timeout: Duration) -> i32 {
        let guard = self.lock();
        let (pid, _) = current();
        let (_g, n) = do_connect(guard, pid as usize, fid, port, timeout);
        n
    }

    pub fn accept(&self, lfid: Fid) -> Fid {
        let guard = self.lock();
        let (pid, _) = current();
        let (_g, f) = do_accept(guard, pid as usize, lfid);
        f
    }

    pub fn shutdown(&self, fid: Fid, how: ShutdownHow) -> i32 {
        let mut guard = self.lock();
        let (pid, _) = current();
        let idx = pid as usize;
        let sock_id = match socket_for(&guard, idx, fid) {
            Some(id) => id,
            None => return -1,
        };
        let is_peer = guard
            .socks
            .get(sock_id)
            .map(|s| matches!(s.payload, SockPayload::Peer { .. }))
            .unwrap_or(false);
        if !is_peer {
            return -1;
        }
        let (close_r, close_w) = match how {
            ShutdownHow::Read => (true, false),
            ShutdownHow::Write => (false, true),
            ShutdownHow::Both => (true, true),
        };
        let (r, w) = {
            let s = guard.socks.get_mut(sock_id).unwrap();
            match &mut s.payload {
                SockPayload::Peer {
                    read_pipe,
                    write_pipe,
                    ..
                } => {
                    let r = if close_r { read_pipe.take() } else { None };
                    let w = if close_w { write_pipe.take() } else { None };
                    (r, w)
                }
                _ => (None, None),
            }
        };
        if let Some(id) = r {
            close_pipe_reader(&mut guard, id);
        }
        if let Some(id) = w {
            close_pipe_writer(&mut guard, id);
        }
        0
    }

    // ---- process listing (§6 OpenInfo) -------------------------------------

    /// Realizes `OpenInfo`: binds a fresh read-only snapshot of the process
    /// table to a descriptor. The snapshot is taken now, not re-read on
    /// every [`Kernel::read_info`] call — a concurrently exiting or
    /// spawning process never mutates an iterator already handed out,
    /// matching `procinfo`'s "trivial iterator" billing (§1).
    pub fn open_info(&self) -> Fid {
        let mut guard = self.lock();
        let (pid, _) = current();
        let idx = pid as usize;
        let entries: Vec<ProcInfoEntry> = guard.procs.iter().map(|(_, p)| ProcInfoEntry::from_pcb(p)).collect();
        let info_id = match guard.infos.alloc(InfoCursor::new(entries)) {
            Some(id) => id,
            None => return NOFILE,
        };
        let fid = match guard.procs.get_mut(idx) {
            Some(pcb) => pcb.fds.reserve(FdKind::Info(info_id)),
            None => {
                guard.infos.free(info_id);
                return NOFILE;
            }
        };
        match fid {
            Some(f) => f,
            None => {
                guard.infos.free(info_id);
                NOFILE
            }
        }
    }

    /// Reads up to `out.len()` entries from an `OpenInfo` descriptor's
    /// snapshot, advancing its cursor. Returns `-1` for a fid that is not
    /// an open `OpenInfo` descriptor, `0` once the snapshot is exhausted.
    pub fn read_info(&self, fid: Fid, out: &mut [ProcInfoEntry]) -> i32 {
        let mut guard = self.lock();
        let (pid, _) = current();
        let idx = pid as usize;
        let info_id = match guard.procs.get(idx).and_then(|p| p.fds.get(fid)) {
            Some(FdKind::Info(id)) => id,
            _ => return -1,
        };
        match guard.infos.get_mut(info_id) {
            Some(cursor) => cursor.read(out),
            None => -1,
        }
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Kernel::new()
    }
}

// ---- free-function helpers (no self; callable from an already-locked path) --

fn incref_kind(state: &mut KernelState, kind: FdKind) {
    match kind {
        FdKind::PipeRead(id) => {
            if let Some(p) = state.pipes.get_mut(id) {
                p.reader_refs += 1;
            }
        }
        FdKind::PipeWrite(id) => {
            if let Some(p) = state.pipes.get_mut(id) {
                p.writer_refs += 1;
            }
        }
        FdKind::Socket(id) => {
            if let Some(s) = state.socks.get_mut(id) {
                s.refcount += 1;
            }
        }
        FdKind::Info(id) => {
            if let Some(c) = state.infos.get_mut(id) {
                c.refcount += 1;
            }
        }
    }
}

fn decref_kind(state: &mut KernelState, kind: FdKind) {
    match kind {
        FdKind::PipeRead(id) => close_pipe_reader(state, id),
        FdKind::PipeWrite(id) => close_pipe_writer(state, id),
        FdKind::Socket(id) => close_socket(state, id),
        FdKind::Info(id) => close_info(state, id),
    }
}

fn close_info(state: &mut KernelState, info_id: usize) {
    let dead = {
        let c = match state.infos.get_mut(info_id) {
            Some(c) => c,
            None => return,
        };
        if c.refcount > 0 {
            c.refcount -= 1;
        }
        c.refcount == 0
    };
    if dead {
        state.infos.free(info_id);
    }
}

fn close_pipe_reader(state: &mut KernelState, pipe_id: usize) {
    let dead = {
        let p = match state.pipes.get_mut(pipe_id) {
            Some(p) => p,
            None => return,
        };
        if p.reader_refs > 0 {
            p.reader_refs -= 1;
        }
        if p.reader_refs == 0 {
            p.has_space.broadcast();
        }
        !p.reader_present() && !p.writer_present()
    };
    if dead {
        state.pipes.free(pipe_id);
    }
}

fn close_pipe_writer(state: &mut KernelState, pipe_id: usize) {
    let dead = {
        let p = match state.pipes.get_mut(pipe_id) {
            Some(p) => p,
            None => return,
        };
        if p.writer_refs > 0 {
            p.writer_refs -= 1;
        }
        if p.writer_refs == 0 {
            p.has_data.broadcast();
        }
        !p.reader_present() && !p.writer_present()
    };
    if dead {
        state.pipes.free(pipe_id);
    }
}

/// Retract `sock_id`'s own outstanding `Connect` request, if it still has
/// one, from whatever listener queue holds it, and wake the blocked caller
/// so it observes the retraction immediately rather than waiting out the
/// rest of its timeout. Idempotent: called from both a timed-out/admitted
/// `Connect`'s own cleanup and a racing `Close`, so either side may find the
/// request already gone.
fn purge_connect_request(state: &mut KernelState, sock_id: usize) {
    let pending = match state.socks.get_mut(sock_id) {
        Some(s) => s.pending_connect.take(),
        None => None,
    };
    let pending = match pending {
        Some(p) => p,
        None => return,
    };
    if let Some(listener) = state.socks.get_mut(pending.listener) {
        if let Some((queue, _)) = listener.as_listener_mut() {
            if let Some(pos) = queue.iter().position(|r| r.id == pending.request_id) {
                let req = queue.remove(pos).unwrap();
                req.connected_cv.broadcast();
            }
        }
    }
}

fn sock_decref(state: &mut KernelState, sock_id: usize) {
    let hit_zero = {
        let s = match state.socks.get_mut(sock_id) {
            Some(s) => s,
            None => return,
        };
        if s.refcount > 0 {
            s.refcount -= 1;
        }
        s.refcount == 0
    };
    if hit_zero {
        state.socks.free(sock_id);
    }
}

enum PeerTeardown {
    None,
    Listener,
    Peer {
        read_pipe: Option<usize>,
        write_pipe: Option<usize>,
    },
}

fn close_socket(state: &mut KernelState, sock_id: usize) {
    let port = match state.socks.get(sock_id) {
        Some(s) => s.port,
        None => return,
    };
    if let Some(s) = state.socks.get_mut(sock_id) {
        s.closed = true;
    }
    purge_connect_request(state, sock_id);
    let teardown = {
        let scb = state.socks.get_mut(sock_id).unwrap();
        match &mut scb.payload {
            SockPayload::Listener { .. } => PeerTeardown::Listener,
            SockPayload::Peer {
                read_pipe,
                write_pipe,
                ..
            } => PeerTeardown::Peer {
                read_pipe: read_pipe.take(),
                write_pipe: write_pipe.take(),
            },
            SockPayload::Unbound => PeerTeardown::None,
        }
    };
    match teardown {
        PeerTeardown::Listener => {
            if let Some(pidx) = port_idx(port) {
                if state.port_map.get(pidx).copied().flatten() == Some(sock_id) {
                    state.port_map[pidx] = None;
                }
            }
            if let Some(scb) = state.socks.get(sock_id) {
                if let SockPayload::Listener { req_available, .. } = &scb.payload {
                    req_available.broadcast();
                }
            }
        }
        PeerTeardown::Peer { read_pipe, write_pipe } => {
            if let Some(id) = read_pipe {
                close_pipe_reader(state, id);
            }
            if let Some(id) = write_pipe {
                close_pipe_writer(state, id);
            }
        }
        PeerTeardown::None => {}
    }
    sock_decref(state, sock_id);
}

fn port_idx(port: u16) -> Option<usize> {
    if port == 0 {
        None
    } else {
        Some(port as usize)
    }
}

fn socket_for(state: &KernelState, pid_idx: usize, fid: Fid) -> Option<usize> {
    match state.procs.get(pid_idx)?.fds.get(fid)? {
        FdKind::Socket(id) => Some(id),
        _ => None,
    }
}

fn resolve_read_pipe(state: &KernelState, kind: FdKind) -> Option<usize> {
    match kind {
        FdKind::PipeRead(id) => Some(id),
        FdKind::Socket(sock_id) => match &state.socks.get(sock_id)?.payload {
            SockPayload::Peer { read_pipe, .. } => *read_pipe,
            _ => None,
        },
        FdKind::PipeWrite(_) | FdKind::Info(_) => None,
    }
}

fn resolve_write_pipe(state: &KernelState, kind: FdKind) -> Option<usize> {
    match kind {
        FdKind::PipeWrite(id) => Some(id),
        FdKind::Socket(sock_id) => match &state.socks.get(sock_id)?.payload {
            SockPayload::Peer { write_pipe, .. } => *write_pipe,
            _ => None,
        },
        FdKind::PipeRead(_) | FdKind::Info(_) => None,
    }
}

fn reap(state: &mut KernelState, parent_idx: usize, child: Pid, out: Option<&mut i32>) -> Pid {
    let exit_val = state.procs.get(child as usize).map(|p| p.exit_val).unwrap_or(0);
    if let Some(o) = out {
        *o = exit_val;
    }
    if let Some(p) = state.procs.get_mut(parent_idx) {
        p.children.retain(|&c| c != child);
        p.exited_children.retain(|&c| c != child);
    }
    state.procs.free(child as usize);
    child
}

/// Last-thread cleanup (4.D's "if `thread_count` reaches 0 and pid != 1"
/// branch). Only PTCBs nobody still holds a join-reference to are removed
/// here — one with `refcount > 0` is left for its joiner to reclaim on
/// wake (see DESIGN.md: a joiner re-validates its own PTCB handle after
/// reacquiring the lock, so leaving it in place instead of unconditionally
/// draining it is what keeps that re-validation from ever finding nothing).
fn finalize_process(state: &mut KernelState, idx: usize) {
    let init_idx = INIT_PID as usize;
    let (pid, children, exited_children, drained_fds) = {
        let pcb = state.procs.get_mut(idx).unwrap();
        let pid = pcb.pid;
        let children = std::mem::take(&mut pcb.children);
        let exited_children = std::mem::take(&mut pcb.exited_children);
        pcb.threads.retain(|t| t.refcount > 0);
        let drained_fds = pcb.fds.drain();
        (pid, children, exited_children, drained_fds)
    };

    for &c in &children {
        if let Some(cpcb) = state.procs.get_mut(c as usize) {
            cpcb.parent = Some(INIT_PID);
        }
    }
    let any_transferred = !children.is_empty() || !exited_children.is_empty();
    if let Some(init_pcb) = state.procs.get_mut(init_idx) {
        init_pcb.children.extend(children.iter().copied());
        init_pcb.exited_children.extend(exited_children.iter().copied());
    }
    if any_transferred {
        if let Some(init_pcb) = state.procs.get(init_idx) {
            init_pcb.child_exit.broadcast();
        }
        debug!("pid {}: reparented {} child(ren) to init", pid, children.len());
    }

    for kind in drained_fds {
        decref_kind(state, kind);
    }

    let parent = state.procs.get(idx).and_then(|p| p.parent);
    if let Some(pcb) = state.procs.get_mut(idx) {
        pcb.state = ProcState::Zombie;
        pcb.main_thread = None;
    }
    if let Some(ppid) = parent {
        if let Some(ppcb) = state.procs.get_mut(ppid as usize) {
            ppcb.exited_children.push(pid);
        }
        if let Some(ppcb) = state.procs.get(ppid as usize) {
            ppcb.child_exit.broadcast();
        }
    }
    debug!("pid {} is now a zombie", pid);
}

fn alloc_pipe_pair(state: &mut KernelState, idx: usize) -> Result<(Fid, Fid), KernelError> {
    let pipe_id = state.pipes.alloc(Pipe::new()).ok_or(KernelError::ResourceExhausted)?;

    let reader_fid = {
        let pcb = state.procs.get_mut(idx).ok_or(KernelError::InvalidHandle)?;
        pcb.fds.reserve(FdKind::PipeRead(pipe_id))
    };
    let reader_fid = match reader_fid {
        Some(f) => f,
        None => {
            state.pipes.free(pipe_id);
            return Err(KernelError::ResourceExhausted);
        }
    };

    let writer_fid = {
        let pcb = state.procs.get_mut(idx).ok_or(KernelError::InvalidHandle)?;
        pcb.fds.reserve(FdKind::PipeWrite(pipe_id))
    };
    match writer_fid {
        Some(f) => Ok((reader_fid, f)),
        None => {
            let pcb = state.procs.get_mut(idx).unwrap();
            pcb.fds.clear(reader_fid);
            state.pipes.free(pipe_id);
            Err(KernelError::ResourceExhausted)
        }
    }
}

fn pipe_write_blocking<'a>(
    mut guard: MutexGuard<'a, KernelState>,
    pipe_id: usize,
    buf: &[u8],
) -> (MutexGuard<'a, KernelState>, i32) {
    if buf.is_empty() {
        return (guard, 0);
    }
    let mut written = 0usize;
    while written < buf.len() {
        loop {
            let (full, reader_alive) = match guard.pipes.get(pipe_id) {
                Some(p) => (p.is_full(), p.reader_present()),
                None => return (guard, -1),
            };
            if !full {
                break;
            }
            if !reader_alive {
                debug!("pipe {}: write found reader gone", pipe_id);
                return (guard, -1);
            }
            let cv = guard.pipes.get(pipe_id).unwrap().has_space.clone();
            guard = cv.wait(guard);
        }
        let reader_alive = guard.pipes.get(pipe_id).map(|p| p.reader_present()).unwrap_or(false);
        if !reader_alive {
            break;
        }
        let n = guard.pipes.get_mut(pipe_id).unwrap().push(&buf[written..]);
        written += n;
        if n == 0 {
            break;
        }
    }
    if let Some(p) = guard.pipes.get(pipe_id) {
        p.has_data.broadcast();
    }
    if written == 0 && !buf.is_empty() {
        let reader_alive = guard.pipes.get(pipe_id).map(|p| p.reader_present()).unwrap_or(false);
        if !reader_alive {
            return (guard, -1);
        }
    }
    (guard, written as i32)
}

fn pipe_read_blocking<'a>(
    mut guard: MutexGuard<'a, KernelState>,
    pipe_id: usize,
    buf: &mut [u8],
) -> (MutexGuard<'a, KernelState>, i32) {
    if buf.is_empty() {
        return (guard, 0);
    }
    loop {
        let (empty, writer_alive) = match guard.pipes.get(pipe_id) {
            Some(p) => (p.is_empty(), p.writer_present()),
            None => return (guard, -1),
        };
        if !empty {
            break;
        }
        if !writer_alive {
            debug!("pipe {}: read hit EOF", pipe_id);
            return (guard, 0);
        }
        let cv = guard.pipes.get(pipe_id).unwrap().has_data.clone();
        guard = cv.wait(guard);
    }
    let mut readn = 0usize;
    while readn < buf.len() {
        let empty = guard.pipes.get(pipe_id).map(|p| p.is_empty()).unwrap_or(true);
        if empty {
            break;
        }
        let n = guard.pipes.get_mut(pipe_id).unwrap().pop(&mut buf[readn..]);
        readn += n;
        if n == 0 {
            break;
        }
    }
    if let Some(p) = guard.pipes.get(pipe_id) {
        p.has_space.broadcast();
    }
    (guard, readn as i32)
}

fn alloc_socket(state: &mut KernelState, idx: usize, port: u16) -> Option<Fid> {
    let sock_id = state.socks.alloc(Scb::new(port))?;
    let fid = {
        let pcb = match state.procs.get_mut(idx) {
            Some(p) => p,
            None => {
                state.socks.free(sock_id);
                return None;
            }
        };
        pcb.fds.reserve(FdKind::Socket(sock_id))
    };
    match fid {
        Some(f) => Some(f),
        None => {
            state.socks.free(sock_id);
            None
        }
    }
}

fn do_listen(state: &mut KernelState, idx: usize, fid: Fid) -> i32 {
    let sock_id = match socket_for(state, idx, fid) {
        Some(id) => id,
        None => return -1,
    };
    let port = match state.socks.get(sock_id) {
        Some(s) if s.is_unbound() && s.port != 0 => s.port,
        _ => return -1,
    };
    let pidx = port as usize;
    if pidx >= state.port_map.len() || state.port_map[pidx].is_some() {
        return -1;
    }
    {
        let s = state.socks.get_mut(sock_id).unwrap();
        s.payload = SockPayload::Listener {
            queue: VecDeque::new(),
            req_available: Cv::new(),
        };
    }
    state.port_map[pidx] = Some(sock_id);
    debug!("port {}: listener bound", port);
    0
}

fn do_connect<'a>(
    mut guard: MutexGuard<'a, KernelState>,
    idx: usize,
    fid: Fid,
    port: u16,
    timeout: Duration,
) -> (MutexGuard<'a, KernelState>, i32) {
    let sock_id = match socket_for(&guard, idx, fid) {
        Some(id) => id,
        None => return (guard, -1),
    };
    let unbound = guard.socks.get(sock_id).map(|s| s.is_unbound()).unwrap_or(false);
    if !unbound || port == 0 || (port as usize) >= guard.port_map.len() {
        return (guard, -1);
    }
    let listener_id = match guard.port_map[port as usize] {
        Some(id) => id,
        None => return (guard, -1),
    };

    if let Some(s) = guard.socks.get_mut(sock_id) {
        s.refcount += 1;
    }
    let req_id = guard.next_request_id;
    guard.next_request_id += 1;
    let cv = Cv::new();
    let enqueued = match guard.socks.get_mut(listener_id) {
        Some(listener) => match listener.as_listener_mut() {
            Some((queue, req_available)) => {
                queue.push_back(ConnRequest {
                    id: req_id,
                    connector: sock_id,
                    connected_cv: cv.clone(),
                });
                req_available.signal();
                true
            }
            None => false,
        },
        None => false,
    };
    if !enqueued {
        sock_decref(&mut guard, sock_id);
        return (guard, -1);
    }
    if let Some(s) = guard.socks.get_mut(sock_id) {
        s.pending_connect = Some(PendingConnect {
            listener: listener_id,
            request_id: req_id,
        });
    }

    // Loops re-checking the connector's own SCB on every wake (4.A) — a
    // `Close` racing this wait broadcasts the same CV (via
    // `purge_connect_request`) without ever flipping the SCB off
    // `Unbound`, and a spurious OS wakeup falls straight back to waiting
    // rather than being mistaken for admission or a timeout.
    let (g, _not_timed_out) = cv.timedwait_while(guard, timeout, |state: &mut KernelState| {
        state.socks.get(sock_id).map(|s| s.is_unbound() && !s.closed).unwrap_or(false)
    });
    guard = g;

    let admitted = guard.socks.get(sock_id).map(|s| !s.is_unbound()).unwrap_or(false);
    let closed = guard.socks.get(sock_id).map(|s| s.closed).unwrap_or(true);
    purge_connect_request(&mut guard, sock_id);
    if !admitted {
        if closed {
            debug!("connect: request {} abandoned, socket closed while waiting", req_id);
        } else {
            debug!("connect: request {} not admitted (timeout or rejection)", req_id);
        }
    }
    sock_decref(&mut guard, sock_id);
    (guard, if admitted { 0 } else { -1 })
}

fn do_accept<'a>(mut guard: MutexGuard<'a, KernelState>, idx: usize, lfid: Fid) -> (MutexGuard<'a, KernelState>, Fid) {
    let listener_id = match socket_for(&guard, idx, lfid) {
        Some(id) => id,
        None => return (guard, NOFILE),
    };
    let listener_port = match guard.socks.get(listener_id) {
        Some(s) => match s.payload {
            SockPayload::Listener { .. } => s.port,
            _ => return (guard, NOFILE),
        },
        None => return (guard, NOFILE),
    };
    if let Some(s) = guard.socks.get_mut(listener_id) {
        s.refcount += 1;
    }

    let request: ConnRequest = loop {
        let still_bound = guard.port_map.get(listener_port as usize).copied().flatten() == Some(listener_id);
        if !still_bound {
            sock_decref(&mut guard, listener_id);
            return (guard, NOFILE);
        }
        let popped = match guard.socks.get_mut(listener_id) {
            Some(listener) => match listener.as_listener_mut() {
                Some((queue, _)) => queue.pop_front(),
                None => {
                    sock_decref(&mut guard, listener_id);
                    return (guard, NOFILE);
                }
            },
            None => return (guard, NOFILE),
        };
        if let Some(req) = popped {
            break req;
        }
        let cv = match guard.socks.get(listener_id) {
            Some(s) => match &s.payload {
                SockPayload::Listener { req_available, .. } => req_available.clone(),
                _ => {
                    sock_decref(&mut guard, listener_id);
                    return (guard, NOFILE);
                }
            },
            None => return (guard, NOFILE),
        };
        guard = cv.wait(guard);
    };

    let connector_ok = guard
        .socks
        .get(request.connector)
        .map(|s| s.is_unbound() && !s.closed)
        .unwrap_or(false);
    if !connector_ok {
        sock_decref(&mut guard, listener_id);
        return (guard, NOFILE);
    }

    let server_fid = match alloc_socket(&mut guard, idx, listener_port) {
        Some(f) => f,
        None => {
            sock_decref(&mut guard, listener_id);
            return (guard, NOFILE);
        }
    };
    let server_sock_id = match socket_for(&guard, idx, server_fid) {
        Some(id) => id,
        None => {
            sock_decref(&mut guard, listener_id);
            return (guard, NOFILE);
        }
    };

    let pipe_a = guard.pipes.alloc(Pipe::new());
    let pipe_b = guard.pipes.alloc(Pipe::new());
    let (pipe_a, pipe_b) = match (pipe_a, pipe_b) {
        (Some(a), Some(b)) => (a, b),
        (a, b) => {
            if let Some(a) = a {
                guard.pipes.free(a);
            }
            if let Some(b) = b {
                guard.pipes.free(b);
            }
            let kind = {
                let pcb = guard.procs.get_mut(idx).unwrap();
                pcb.fds.clear(server_fid)
            };
            if let Some(k) = kind {
                decref_kind(&mut guard, k);
            }
            sock_decref(&mut guard, listener_id);
            return (guard, NOFILE);
        }
    };

    {
        let s = guard.socks.get_mut(server_sock_id).unwrap();
        s.payload = SockPayload::Peer {
            peer: request.connector,
            read_pipe: Some(pipe_b),
            write_pipe: Some(pipe_a),
        };
    }
    {
        let s = guard.socks.get_mut(request.connector).unwrap();
        s.payload = SockPayload::Peer {
            peer: server_sock_id,
            read_pipe: Some(pipe_a),
            write_pipe: Some(pipe_b),
        };
    }

    request.connected_cv.broadcast();
    sock_decref(&mut guard, listener_id);
    debug!("port {}: accepted connection, server fid {}", listener_port, server_fid);
    (guard, server_fid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_populates_root_and_init() {
        let k = Kernel::new();
        assert_eq!(k.get_pid(), ROOT_PID);
    }

    /// S1: pipe loopback — write "hello", close writer, read drains it then
    /// returns EOF.
    #[test]
    fn pipe_loopback() {
        let k = Kernel::new();
        let (r, w) = k.pipe_create().unwrap();
        assert_eq!(k.write(w, b"hello"), 5);
        assert_eq!(k.close(w), 0);
        let mut buf = [0u8; 10];
        assert_eq!(k.read(r, &mut buf), 5);
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(k.read(r, &mut buf), 0);
        assert_eq!(k.close(r), 0);
    }

    #[test]
    fn write_after_reader_closed_fails() {
        let k = Kernel::new();
        let (r, w) = k.pipe_create().unwrap();
        assert_eq!(k.close(r), 0);
        assert_eq!(k.write(w, b"x"), -1);
    }

    #[test]
    fn thread_join_delivers_exit_value() {
        let k = Kernel::new();
        let handle = k.clone();
        let tid = k.create_thread(move || 7);
        let mut out = 0;
        // Poll-join: the spawned OS thread runs concurrently, so loop a
        // few times if we win the race and observe it mid-flight isn't
        // possible here (join blocks), a single call suffices.
        let rc = handle.thread_join(tid, Some(&mut out));
        assert_eq!(rc, 0);
        assert_eq!(out, 7);
    }

    #[test]
    fn wait_child_rejects_pid_that_is_not_a_child() {
        let k = Kernel::new();
        assert_eq!(k.wait_child(42, None), NOPROC);
    }

    #[test]
    fn wait_child_with_no_children_returns_noproc() {
        let k = Kernel::new();
        assert_eq!(k.wait_child(NOPROC, None), NOPROC);
    }

    #[test]
    fn wait_child_reaps_after_exit() {
        let k = Kernel::new();
        let child = k.exec(|_| 42, b"");
        let mut out = -1;
        assert_eq!(k.wait_child(child, Some(&mut out)), child);
        assert_eq!(out, 42);
        // already reaped: no longer a live or zombie child of ours
        assert_eq!(k.wait_child(child, None), NOPROC);
    }

    #[test]
    fn get_ppid_reports_real_parent() {
        let k = Kernel::new();
        let seen_ppid: Arc<Mutex<Option<Pid>>> = Arc::new(Mutex::new(None));
        let seen_ppid2 = seen_ppid.clone();
        let handle = k.clone();
        let child = k.exec(
            move |_| {
                *seen_ppid2.lock().unwrap() = Some(handle.get_ppid());
                0
            },
            b"",
        );
        // blocks until the child's thread has actually run and exited,
        // so the write above is guaranteed visible by the time we check it
        assert_eq!(k.wait_child(child, None), child);
        assert_eq!(*seen_ppid.lock().unwrap(), Some(ROOT_PID));
    }

    #[test]
    fn detach_fails_join() {
        use std::sync::{Arc, Barrier};
        let k = Kernel::new();
        let barrier = Arc::new(Barrier::new(2));
        let b2 = barrier.clone();
        let tid = k.create_thread(move || {
            b2.wait();
            0
        });
        assert_eq!(k.thread_detach(tid), 0);
        barrier.wait();
        // give the thread a moment to actually run thread_exit
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(k.thread_join(tid, None), -1);
    }
}
