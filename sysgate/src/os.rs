//! OS collaborator seams
//!
//! Everything the mediation layer needs from the surrounding kernel and
//! engine lives behind these traits so the core logic is host-agnostic
//! and drivable from tests.

use std::io::Result;

use nix::unistd::Pid;

use crate::context::MachineContext;
use crate::tracker::Prot;

/// kernel-side thread operations. Implementations issue the real
/// suspend/resume/context syscalls; the mediation layer only decides
/// when they happen.
pub trait OsThreadOps: Send + Sync {
    /// suspend the target; it stops at some arbitrary point.
    fn suspend(&self, tid: Pid) -> Result<()>;
    fn resume(&self, tid: Pid) -> Result<()>;
    /// raw register state of a stopped thread.
    fn get_context(&self, tid: Pid) -> Result<MachineContext>;
    fn set_context(&self, tid: Pid, ctx: &MachineContext) -> Result<()>;
    /// hard-kill a thread that never reached a safe point.
    fn terminate(&self, tid: Pid) -> Result<()>;
    fn thread_alive(&self, tid: Pid) -> bool;
    /// thread id behind a kernel handle, when the handle carries
    /// enough rights to ask.
    fn thread_id_for_handle(&self, handle: u64) -> Option<Pid>;
    fn process_id_for_handle(&self, handle: u64) -> Option<Pid>;
    /// briefly yield so a polled thread can make progress.
    fn pause(&self);
}

/// engine code-cache queries and control transfers. A program counter
/// inside the cache must be translatable back to the app address it was
/// built from.
pub trait CodeCacheMap: Send + Sync {
    /// true when `pc` points into engine-generated code.
    fn in_cache(&self, pc: u64) -> bool;
    /// app address the cached instruction at `pc` was built from.
    fn translate_pc(&self, pc: u64) -> Option<u64>;
    /// app address holding the spilled value for engine-owned register
    /// slot `slot` at cache address `pc`, if one is live there.
    fn spilled_reg(&self, pc: u64, slot: usize) -> Option<u64>;
    /// flush cached code overlapping `[base, base+size)`.
    fn flush_range(&self, base: u64, size: u64);
    /// protection the engine itself holds on `[base, base+size)`, when
    /// the range covers engine-managed pages.
    fn engine_prot(&self, base: u64, size: u64) -> Option<Prot>;
    /// entry point resuming mediated execution at app address `pc`.
    fn takeover_target(&self, pc: u64) -> u64;
}
