//! per-thread bookkeeping
//!
//! One `ThreadRecord` per live application thread, looked up by thread
//! id. A thread writes its own execution-state and safe-point fields
//! without the list lock; any other thread reading them must hold the
//! lock or have already suspended the target, which is what the atomics
//! here encode.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use nix::unistd::Pid;

use sysgate_syscalls::Sysno;

use crate::args::SyscallArgs;
use crate::tracker::Prot;

/// pseudo-handle for the calling process, register-width all-ones.
pub const CURRENT_PROCESS: u64 = u64::max_value();
/// pseudo-handle for the calling thread.
pub const CURRENT_THREAD: u64 = u64::max_value() - 1;

/// where a thread is executing right now.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum WhereAmI {
    AppCode = 0,
    Engine = 1,
    SyscallHandler = 2,
    Trampoline = 3,
}

impl WhereAmI {
    fn from_u8(v: u8) -> WhereAmI {
        match v {
            1 => WhereAmI::Engine,
            2 => WhereAmI::SyscallHandler,
            3 => WhereAmI::Trampoline,
            _ => WhereAmI::AppCode,
        }
    }
}

/// safe-point permission ladder, written by the owning thread.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SynchPerm {
    /// not at a safe point; context would be garbage
    None = 0,
    /// context is valid but control must not be transferred
    NoXfer = 1,
    /// fully materialized, translatable context
    ValidContext = 2,
}

impl SynchPerm {
    fn from_u8(v: u8) -> SynchPerm {
        match v {
            2 => SynchPerm::ValidContext,
            1 => SynchPerm::NoXfer,
            _ => SynchPerm::None,
        }
    }
}

/// provisional tracker bookkeeping installed by a pre handler, committed
/// or rolled back by the matching post handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provisional {
    Alloc {
        size: u64,
        prot: Prot,
    },
    Free {
        base: u64,
        size: u64,
        /// protection the region had, for restore on kernel failure
        prot: Prot,
    },
    Protect {
        base: u64,
        size: u64,
        requested: Prot,
        /// set when the request was silently narrowed for safety
        narrowed: Option<Prot>,
        /// engine's view of the previous protection, reported instead
        /// of the kernel's when narrowing happened
        engine_old: Option<Prot>,
    },
    Map {
        section: u64,
    },
    Unmap {
        base: u64,
        size: u64,
    },
}

/// state of one in-flight syscall, owned by the calling thread's record.
/// Created at trap time, consumed at post time.
#[derive(Debug, Clone)]
pub struct PendingSyscall {
    pub sysno: Sysno,
    pub saved_args: SyscallArgs,
    /// pre handler predicts the kernel will fail this call
    pub expect_failure: bool,
    pub provisional: Option<Provisional>,
}

impl PendingSyscall {
    pub fn new(sysno: Sysno, saved_args: SyscallArgs) -> PendingSyscall {
        PendingSyscall {
            sysno,
            saved_args,
            expect_failure: false,
            provisional: None,
        }
    }
}

#[derive(Debug)]
pub struct ThreadRecord {
    pub tid: Pid,
    /// OS handle for thread-targeted operations
    pub handle: u64,
    whereami: AtomicU8,
    synch_perm: AtomicU8,
    suspend_count: AtomicI32,
    retakeover: AtomicBool,
    native: AtomicBool,
    exiting: AtomicBool,
    pub pending: Mutex<Option<PendingSyscall>>,
    /// client-requested extra syscall to run before returning to the app
    pub chain_request: Mutex<Option<(Sysno, SyscallArgs)>>,
}

impl ThreadRecord {
    pub fn new(tid: Pid, handle: u64) -> ThreadRecord {
        ThreadRecord {
            tid,
            handle,
            whereami: AtomicU8::new(WhereAmI::AppCode as u8),
            synch_perm: AtomicU8::new(SynchPerm::ValidContext as u8),
            suspend_count: AtomicI32::new(0),
            retakeover: AtomicBool::new(false),
            native: AtomicBool::new(false),
            exiting: AtomicBool::new(false),
            pending: Mutex::new(None),
            chain_request: Mutex::new(None),
        }
    }

    pub fn whereami(&self) -> WhereAmI {
        WhereAmI::from_u8(self.whereami.load(Ordering::Acquire))
    }

    /// owning-thread write; no list lock required.
    pub fn set_whereami(&self, w: WhereAmI) {
        self.whereami.store(w as u8, Ordering::Release);
    }

    pub fn synch_perm(&self) -> SynchPerm {
        SynchPerm::from_u8(self.synch_perm.load(Ordering::Acquire))
    }

    pub fn set_synch_perm(&self, p: SynchPerm) {
        self.synch_perm.store(p as u8, Ordering::Release);
    }

    pub fn suspend_count(&self) -> i32 {
        self.suspend_count.load(Ordering::Acquire)
    }

    /// bump the suspend count; returns the previous value so exactly
    /// one caller observes the 0 -> 1 edge.
    pub fn inc_suspend(&self) -> i32 {
        self.suspend_count.fetch_add(1, Ordering::AcqRel)
    }

    /// drop the suspend count; returns the new value.
    pub fn dec_suspend(&self) -> i32 {
        self.suspend_count.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn is_native(&self) -> bool {
        self.native.load(Ordering::Acquire)
    }

    pub fn set_native(&self, v: bool) {
        self.native.store(v, Ordering::Release);
    }

    pub fn set_retakeover(&self) {
        self.retakeover.store(true, Ordering::Release);
    }

    /// consume the retakeover flag.
    pub fn take_retakeover(&self) -> bool {
        self.retakeover.swap(false, Ordering::AcqRel)
    }

    pub fn mark_exiting(&self) {
        self.exiting.store(true, Ordering::Release);
    }

    pub fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::Acquire)
    }

    pub fn take_pending(&self) -> Option<PendingSyscall> {
        self.pending.lock().ok().and_then(|mut g| g.take())
    }
}

/// global thread list, keyed by thread id.
pub struct ThreadList {
    inner: Mutex<HashMap<i32, Arc<ThreadRecord>>>,
}

impl ThreadList {
    pub fn new() -> ThreadList {
        ThreadList {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, tid: Pid, handle: u64) -> Arc<ThreadRecord> {
        let rec = Arc::new(ThreadRecord::new(tid, handle));
        let mut g = self.inner.lock().unwrap();
        g.insert(tid.as_raw(), rec.clone());
        rec
    }

    pub fn unregister(&self, tid: Pid) -> Option<Arc<ThreadRecord>> {
        self.inner.lock().unwrap().remove(&tid.as_raw())
    }

    pub fn get(&self, tid: Pid) -> Option<Arc<ThreadRecord>> {
        self.inner.lock().unwrap().get(&tid.as_raw()).cloned()
    }

    /// consistent snapshot of every live record.
    pub fn all(&self) -> Vec<Arc<ThreadRecord>> {
        self.inner.lock().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ThreadList {
    fn default() -> Self {
        ThreadList::new()
    }
}

/// what an opaque handle value refers to. Needed because a handle may
/// carry insufficient rights to query its target id later.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HandleTarget {
    Thread(Pid),
    Process(Pid),
}

/// handle value -> thread/process id, populated on handle-creating
/// syscalls and pruned on close.
pub struct HandleMap {
    inner: Mutex<HashMap<u64, HandleTarget>>,
}

impl HandleMap {
    pub fn new() -> HandleMap {
        HandleMap {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, handle: u64, target: HandleTarget) {
        self.inner.lock().unwrap().insert(handle, target);
    }

    pub fn target(&self, handle: u64) -> Option<HandleTarget> {
        self.inner.lock().unwrap().get(&handle).cloned()
    }

    pub fn thread_for(&self, handle: u64) -> Option<Pid> {
        match self.target(handle) {
            Some(HandleTarget::Thread(t)) => Some(t),
            _ => None,
        }
    }

    pub fn process_for(&self, handle: u64) -> Option<Pid> {
        match self.target(handle) {
            Some(HandleTarget::Process(p)) => Some(p),
            _ => None,
        }
    }

    /// duplicate-handle bookkeeping: the new handle refers to whatever
    /// the source referred to.
    pub fn alias(&self, src: u64, dst: u64) {
        let mut g = self.inner.lock().unwrap();
        if let Some(t) = g.get(&src).cloned() {
            g.insert(dst, t);
        }
    }

    pub fn remove(&self, handle: u64) -> Option<HandleTarget> {
        self.inner.lock().unwrap().remove(&handle)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

impl Default for HandleMap {
    fn default() -> Self {
        HandleMap::new()
    }
}

/// section handle -> description of its backing, recorded when the
/// section is created or opened and consumed when a view is mapped.
pub struct SectionMap {
    inner: Mutex<HashMap<u64, String>>,
}

impl SectionMap {
    pub fn new() -> SectionMap {
        SectionMap {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, handle: u64, backing: String) {
        self.inner.lock().unwrap().insert(handle, backing);
    }

    pub fn backing(&self, handle: u64) -> Option<String> {
        self.inner.lock().unwrap().get(&handle).cloned()
    }

    pub fn remove(&self, handle: u64) -> Option<String> {
        self.inner.lock().unwrap().remove(&handle)
    }
}

impl Default for SectionMap {
    fn default() -> Self {
        SectionMap::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suspend_count_edges() {
        let rec = ThreadRecord::new(Pid::from_raw(100), 0x44);
        assert_eq!(rec.inc_suspend(), 0);
        assert_eq!(rec.inc_suspend(), 1);
        assert_eq!(rec.dec_suspend(), 1);
        assert_eq!(rec.dec_suspend(), 0);
    }

    #[test]
    fn retakeover_flag_is_consumed() {
        let rec = ThreadRecord::new(Pid::from_raw(100), 0x44);
        assert!(!rec.take_retakeover());
        rec.set_retakeover();
        assert!(rec.take_retakeover());
        assert!(!rec.take_retakeover());
    }

    #[test]
    fn thread_list_register_lookup() {
        let list = ThreadList::new();
        let tid = Pid::from_raw(7);
        list.register(tid, 0x10);
        assert_eq!(list.len(), 1);
        assert!(list.get(tid).is_some());
        assert!(list.get(Pid::from_raw(8)).is_none());
        list.unregister(tid);
        assert!(list.is_empty());
    }

    #[test]
    fn handle_map_alias_and_prune() {
        let map = HandleMap::new();
        map.insert(0x20, HandleTarget::Thread(Pid::from_raw(5)));
        map.alias(0x20, 0x24);
        assert_eq!(map.thread_for(0x24), Some(Pid::from_raw(5)));
        map.remove(0x20);
        assert_eq!(map.thread_for(0x20), None);
        assert_eq!(map.thread_for(0x24), Some(Pid::from_raw(5)));
        assert_eq!(map.process_for(0x24), None);
    }
}
