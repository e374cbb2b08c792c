//! simulated engine collaborators for end-to-end mediation tests

use std::collections::{HashMap, HashSet};
use std::io::{Error, ErrorKind, Result};
use std::sync::{Arc, Mutex};

use nix::unistd::Pid;

use sysgate::args::Abi;
use sysgate::context::MachineContext;
use sysgate::inject::RemoteProcess;
use sysgate::mediator::{Mediator, ResultAction, TrapAction};
use sysgate::os::{CodeCacheMap, OsThreadOps};
use sysgate::remote::{GuestMemory, GuestMemoryExt, RemotePtr};
use sysgate::task::{SynchPerm, ThreadRecord};
use sysgate::tracker::{AccessIntent, MemoryTracker, Prot, RegionInfo};
use sysgate_common::config::EngineConfig;
use sysgate_syscalls::Sysno;

pub struct SimMemory {
    bytes: Mutex<HashMap<u64, u8>>,
}

impl SimMemory {
    pub fn new() -> Self {
        SimMemory {
            bytes: Mutex::new(HashMap::new()),
        }
    }

    pub fn write_u64(&self, addr: u64, v: u64) {
        self.poke(RemotePtr::<u64>::from_addr(addr).unwrap(), &v)
            .unwrap();
    }

    pub fn read_u64(&self, addr: u64) -> u64 {
        self.peek(RemotePtr::<u64>::from_addr(addr).unwrap()).unwrap()
    }

    pub fn write_u32(&self, addr: u64, v: u32) {
        self.poke(RemotePtr::<u32>::from_addr(addr).unwrap(), &v)
            .unwrap();
    }

    pub fn read_u32(&self, addr: u64) -> u32 {
        self.peek(RemotePtr::<u32>::from_addr(addr).unwrap()).unwrap()
    }
}

impl GuestMemory for SimMemory {
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
    terminated: Vec<i32>,
    contexts: HashMap<i32, MachineContext>,
    thread_handles: HashMap<u64, i32>,
    process_handles: HashMap<u64, i32>,
}

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

    pub fn terminated(&self) -> Vec<i32> {
        self.inner.lock().unwrap().terminated.clone()
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

    pub fn set_stop_context(&self, tid: Pid, ctx: MachineContext) {
        self.inner.lock().unwrap().contexts.insert(tid.as_raw(), ctx);
    }
}

impl OsThreadOps for SimOs {
    fn suspend(&self, tid: Pid) -> Result<()> {
        let mut g = self.inner.lock().unwrap();
        if !g.alive.contains(&tid.as_raw()) {
            return Err(Error::new(ErrorKind::NotFound, "no such thread"));
        }
        *g.suspend_calls.entry(tid.as_raw()).or_insert(0) += 1;
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
        let mut g = self.inner.lock().unwrap();
        g.alive.remove(&tid.as_raw());
        g.terminated.push(tid.as_raw());
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

pub struct SimTracker {
    regions: Mutex<HashMap<u64, RegionInfo>>,
    backings: Mutex<HashMap<u64, String>>,
}

impl SimTracker {
    pub fn new() -> Self {
        SimTracker {
            regions: Mutex::new(HashMap::new()),
            backings: Mutex::new(HashMap::new()),
        }
    }

    pub fn region_at(&self, base: u64) -> Option<RegionInfo> {
        self.query_region(base, AccessIntent::Read)
    }

    pub fn backing_at(&self, base: u64) -> Option<String> {
        self.backings.lock().unwrap().get(&base).cloned()
    }

    pub fn count(&self) -> usize {
        self.regions.lock().unwrap().len()
    }
}

impl MemoryTracker for SimTracker {
    fn region_allocated(&self, base: u64, size: u64, prot: Prot) {
        self.regions
            .lock()
            .unwrap()
            .insert(base, RegionInfo { base, size, prot });
    }

    fn region_freed(&self, base: u64, _size: u64) -> bool {
        self.regions.lock().unwrap().remove(&base).is_some()
    }

    fn region_protection_changed(&self, base: u64, _size: u64, new_prot: Prot) -> Option<Prot> {
        let mut g = self.regions.lock().unwrap();
        for r in g.values_mut() {
            if base >= r.base && base < r.base + r.size {
                let old = r.prot;
                r.prot = new_prot;
                return Some(old);
            }
        }
        None
    }

    fn region_mapped(&self, base: u64, size: u64, backing: &str) {
        self.backings
            .lock()
            .unwrap()
            .insert(base, backing.to_string());
        self.region_allocated(base, size, Prot::READ | Prot::EXEC);
    }

    fn region_unmapped(&self, base: u64, _size: u64) {
        self.regions.lock().unwrap().remove(&base);
    }

    fn query_region(&self, addr: u64, _intent: AccessIntent) -> Option<RegionInfo> {
        let g = self.regions.lock().unwrap();
        g.values()
            .find(|r| addr >= r.base && addr < r.base + r.size)
            .cloned()
    }
}

pub const CACHE_BASE: u64 = 0x7000_0000;
pub const CACHE_SIZE: u64 = 0x10_0000;
pub const APP_BASE: u64 = 0x40_0000;

/// linear cache mapping: cache pc = app pc - APP_BASE + CACHE_BASE.
pub struct SimCache {
    engine_ranges: Mutex<Vec<(u64, u64, Prot)>>,
    flushes: Mutex<Vec<(u64, u64)>>,
}

impl SimCache {
    pub fn new() -> Self {
        SimCache {
            engine_ranges: Mutex::new(Vec::new()),
            flushes: Mutex::new(Vec::new()),
        }
    }

    pub fn mark_engine_range(&self, base: u64, size: u64, prot: Prot) {
        self.engine_ranges.lock().unwrap().push((base, size, prot));
    }

    pub fn flushes(&self) -> Vec<(u64, u64)> {
        self.flushes.lock().unwrap().clone()
    }
}

impl CodeCacheMap for SimCache {
    fn in_cache(&self, pc: u64) -> bool {
        pc >= CACHE_BASE && pc < CACHE_BASE + CACHE_SIZE
    }

    fn translate_pc(&self, pc: u64) -> Option<u64> {
        if self.in_cache(pc) {
            Some(pc - CACHE_BASE + APP_BASE)
        } else {
            None
        }
    }

    fn spilled_reg(&self, _pc: u64, _slot: usize) -> Option<u64> {
        None
    }

    fn flush_range(&self, base: u64, size: u64) {
        self.flushes.lock().unwrap().push((base, size));
    }

    fn engine_prot(&self, base: u64, size: u64) -> Option<Prot> {
        let g = self.engine_ranges.lock().unwrap();
        g.iter()
            .find(|r| base < r.0 + r.1 && r.0 < base + size)
            .map(|r| r.2)
    }

    fn takeover_target(&self, pc: u64) -> u64 {
        if pc >= APP_BASE && pc < APP_BASE + CACHE_SIZE {
            pc - APP_BASE + CACHE_BASE
        } else {
            pc
        }
    }
}

#[derive(Default)]
struct SimRemoteInner {
    next_addr: u64,
    allocs: HashMap<u64, Vec<u8>>,
    env_blocks: HashMap<i32, u64>,
    images: HashMap<i32, String>,
    fail_protect: bool,
}

pub struct SimRemote {
    inner: Mutex<SimRemoteInner>,
}

impl SimRemote {
    pub fn new() -> Self {
        SimRemote {
            inner: Mutex::new(SimRemoteInner {
                next_addr: 0x20_0000,
                ..Default::default()
            }),
        }
    }

    pub fn set_image(&self, pid: Pid, name: &str) {
        self.inner
            .lock()
            .unwrap()
            .images
            .insert(pid.as_raw(), name.to_string());
    }

    pub fn fail_protect(&self) {
        self.inner.lock().unwrap().fail_protect = true;
    }

    pub fn live_allocs(&self) -> usize {
        self.inner.lock().unwrap().allocs.len()
    }

    pub fn env_block(&self, pid: Pid) -> Option<u64> {
        self.inner.lock().unwrap().env_blocks.get(&pid.as_raw()).cloned()
    }
}

impl RemoteProcess for SimRemote {
    fn allocate(&self, _pid: Pid, size: u64, _prot: Prot) -> Result<u64> {
        let mut g = self.inner.lock().unwrap();
        let addr = g.next_addr;
        g.next_addr += 0x1000;
        g.allocs.insert(addr, vec![0; size as usize]);
        Ok(addr)
    }

    fn write(&self, _pid: Pid, addr: u64, bytes: &[u8]) -> Result<()> {
        let mut g = self.inner.lock().unwrap();
        match g.allocs.get_mut(&addr) {
            Some(block) => {
                block.copy_from_slice(bytes);
                Ok(())
            }
            None => Err(Error::new(ErrorKind::InvalidInput, "bad remote address")),
        }
    }

    fn protect(&self, _pid: Pid, _addr: u64, _size: u64, _prot: Prot) -> Result<()> {
        if self.inner.lock().unwrap().fail_protect {
            return Err(Error::new(ErrorKind::PermissionDenied, "protect refused"));
        }
        Ok(())
    }

    fn free(&self, _pid: Pid, addr: u64) -> Result<()> {
        self.inner.lock().unwrap().allocs.remove(&addr);
        Ok(())
    }

    fn swap_env_block(&self, pid: Pid, new_block: u64) -> Result<u64> {
        let mut g = self.inner.lock().unwrap();
        let old = g.env_blocks.insert(pid.as_raw(), new_block).unwrap_or(0x5000);
        Ok(old)
    }

    fn image_name(&self, pid: Pid) -> Option<String> {
        self.inner.lock().unwrap().images.get(&pid.as_raw()).cloned()
    }
}

pub struct Fixture {
    pub mem: Arc<SimMemory>,
    pub os: Arc<SimOs>,
    pub cache: Arc<SimCache>,
    pub tracker: Arc<SimTracker>,
    pub remote: Arc<SimRemote>,
    pub med: Mediator,
}

pub fn fixture() -> Fixture {
    fixture_with(EngineConfig::default())
}

pub fn fixture_with(config: EngineConfig) -> Fixture {
    let mem = Arc::new(SimMemory::new());
    let os = Arc::new(SimOs::new());
    let cache = Arc::new(SimCache::new());
    let tracker = Arc::new(SimTracker::new());
    let remote = Arc::new(SimRemote::new());
    let med = Mediator::new(
        config,
        Abi::X64,
        os.clone(),
        mem.clone(),
        cache.clone(),
        tracker.clone(),
        remote.clone(),
    )
    .unwrap();
    Fixture {
        mem,
        os,
        cache,
        tracker,
        remote,
        med,
    }
}

impl Fixture {
    /// register a thread whose record starts at a safe point.
    pub fn thread(&self, tid: i32, handle: u64) -> Arc<ThreadRecord> {
        let pid = Pid::from_raw(tid);
        self.os.spawn(pid);
        self.os.bind_thread_handle(handle, pid);
        let rec = self.med.thread_started(pid, handle);
        rec.set_synch_perm(SynchPerm::ValidContext);
        rec
    }

    /// machine context for `sysno` with `args`; extra args spill to the
    /// stack block per the x64 convention.
    pub fn make_ctx(&self, sysno: Sysno, args: &[u64], sp: u64) -> MachineContext {
        let raw = self.med.catalog.lookup(sysno).unwrap_or_else(|| {
            panic!(
                "{} has no raw number in the build {} table",
                sysno, self.med.config.os_build
            )
        });
        let mut ctx = MachineContext::new();
        ctx.sysreg = raw as u64;
        ctx.sp = sp;
        for (i, v) in args.iter().enumerate() {
            if i < 4 {
                ctx.args[i] = *v;
            } else {
                self.mem.write_u64(sp + 0x28 + ((i - 4) as u64) * 8, *v);
            }
        }
        ctx
    }

    /// trap, optionally execute a simulated kernel, and post-process.
    /// Returns the application-visible status and the result action.
    pub fn run_syscall<K>(
        &self,
        rec: &Arc<ThreadRecord>,
        sysno: Sysno,
        args: &[u64],
        sp: u64,
        kernel: K,
    ) -> (i64, ResultAction)
    where
        K: FnOnce(&Fixture) -> i64,
    {
        let mut ctx = self.make_ctx(sysno, args, sp);
        match self.med.on_syscall_trap(rec, &mut ctx).unwrap() {
            TrapAction::SkipSyscall => (ctx.retval as i64, ResultAction::ReturnToApp),
            TrapAction::ExecuteSyscall => {
                let status = kernel(self);
                ctx.retval = status as u64;
                let action = self.med.on_syscall_result(rec, &mut ctx).unwrap();
                (ctx.retval as i64, action)
            }
        }
    }
}
