//! shared test doubles

use std::collections::{HashMap, HashSet};
use std::io::{Error, ErrorKind, Result};
use std::sync::{Arc, Mutex};

use nix::unistd::Pid;

use crate::context::MachineContext;
use crate::os::OsThreadOps;
use crate::remote::{GuestMemory, GuestMemoryExt, RemotePtr};
use crate::task::{SynchPerm, ThreadRecord};

/// sparse byte-addressed guest memory; unwritten bytes read as zero.
pub struct FlatMemory {
    bytes: Mutex<HashMap<u64, u8>>,
}

impl FlatMemory {
    pub fn new() -> Self {
        FlatMemory {
            bytes: Mutex::new(HashMap::new()),
        }
    }

    pub fn preset_u64(&self, addr: u64, value: u64) {
        self.poke(RemotePtr::<u64>::from_addr(addr).unwrap(), &value)
            .unwrap();
    }

    pub fn read_u64(&self, addr: u64) -> u64 {
        self.peek(RemotePtr::<u64>::from_addr(addr).unwrap()).unwrap()
    }
}

impl GuestMemory for FlatMemory {
    fn peek_bytes(&self, addr: RemotePtr<u8>, size: usize) -> Result<Vec<u8>> {
        let m = self.bytes.lock().unwrap();
        Ok((0..size)
            .map(|i| *m.get(&(addr.addr() + i as u64)).unwrap_or(&0))
            .collect())
    }

    fn poke_bytes(&self, addr: RemotePtr<u8>, bytes: &[u8]) -> Result<()> {
        let mut m = self.bytes.lock().unwrap();
        for (i, b) in bytes.iter().enumerate() {
            m.insert(addr.addr() + i as u64, *b);
        }
        Ok(())
    }
}

#[derive(Default)]
struct SimOsInner {
    alive: HashSet<i32>,
    suspend_calls: HashMap<i32, usize>,
    resume_calls: HashMap<i32, usize>,
    contexts: HashMap<i32, MachineContext>,
    perm_grants: Vec<(Arc<ThreadRecord>, usize, SynchPerm)>,
    thread_handles: HashMap<u64, i32>,
    process_handles: HashMap<u64, i32>,
}

/// simulated kernel thread operations with call counting.
pub struct SimOs {
    inner: Mutex<SimOsInner>,
}

impl SimOs {
    pub fn new() -> Self {
        SimOs {
            inner: Mutex::new(SimOsInner::default()),
        }
    }

    pub fn spawn(&self, tid: Pid) {
        self.inner.lock().unwrap().alive.insert(tid.as_raw());
    }

    pub fn kill(&self, tid: Pid) {
        self.inner.lock().unwrap().alive.remove(&tid.as_raw());
    }

    pub fn set_stop_context(&self, tid: Pid, ctx: MachineContext) {
        self.inner.lock().unwrap().contexts.insert(tid.as_raw(), ctx);
    }

    pub fn installed_context(&self, tid: Pid) -> Option<MachineContext> {
        self.inner.lock().unwrap().contexts.get(&tid.as_raw()).cloned()
    }

    pub fn suspend_calls(&self, tid: Pid) -> usize {
        *self
            .inner
            .lock()
            .unwrap()
            .suspend_calls
            .get(&tid.as_raw())
            .unwrap_or(&0)
    }

    pub fn resume_calls(&self, tid: Pid) -> usize {
        *self
            .inner
            .lock()
            .unwrap()
            .resume_calls
            .get(&tid.as_raw())
            .unwrap_or(&0)
    }

    /// publish `perm` on `rec` once its suspend-call count reaches `n`.
    pub fn grant_perm_after(&self, rec: Arc<ThreadRecord>, n: usize, perm: SynchPerm) {
        self.inner.lock().unwrap().perm_grants.push((rec, n, perm));
    }

    pub fn bind_thread_handle(&self, handle: u64, tid: Pid) {
        self.inner
            .lock()
            .unwrap()
            .thread_handles
            .insert(handle, tid.as_raw());
    }

    pub fn bind_process_handle(&self, handle: u64, pid: Pid) {
        self.inner
            .lock()
            .unwrap()
            .process_handles
            .insert(handle, pid.as_raw());
    }
}

impl OsThreadOps for SimOs {
    fn suspend(&self, tid: Pid) -> Result<()> {
        let mut g = self.inner.lock().unwrap();
        if !g.alive.contains(&tid.as_raw()) {
            return Err(Error::new(ErrorKind::NotFound, "no such thread"));
        }
        let calls = g.suspend_calls.entry(tid.as_raw()).or_insert(0);
        *calls += 1;
        let calls = *calls;
        for (rec, n, perm) in &g.perm_grants {
            if rec.tid == tid && calls >= *n {
                rec.set_synch_perm(*perm);
            }
        }
        Ok(())
    }

    fn resume(&self, tid: Pid) -> Result<()> {
        let mut g = self.inner.lock().unwrap();
        *g.resume_calls.entry(tid.as_raw()).or_insert(0) += 1;
        Ok(())
    }

    fn get_context(&self, tid: Pid) -> Result<MachineContext> {
        let g = self.inner.lock().unwrap();
        Ok(g.contexts
            .get(&tid.as_raw())
            .cloned()
            .unwrap_or_else(MachineContext::new))
    }

    fn set_context(&self, tid: Pid, ctx: &MachineContext) -> Result<()> {
        let mut g = self.inner.lock().unwrap();
        g.contexts.insert(tid.as_raw(), ctx.clone());
        Ok(())
    }

    fn terminate(&self, tid: Pid) -> Result<()> {
        self.inner.lock().unwrap().alive.remove(&tid.as_raw());
        Ok(())
    }

    fn thread_alive(&self, tid: Pid) -> bool {
        self.inner.lock().unwrap().alive.contains(&tid.as_raw())
    }

    fn thread_id_for_handle(&self, handle: u64) -> Option<Pid> {
        self.inner
            .lock()
            .unwrap()
            .thread_handles
            .get(&handle)
            .map(|t| Pid::from_raw(*t))
    }

    fn process_id_for_handle(&self, handle: u64) -> Option<Pid> {
        self.inner
            .lock()
            .unwrap()
            .process_handles
            .get(&handle)
            .map(|p| Pid::from_raw(*p))
    }

    fn pause(&self) {}
}
