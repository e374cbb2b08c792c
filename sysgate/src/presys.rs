//! pre-call mediation
//!
//! One handler per mediated syscall, dispatched by canonical id before
//! the kernel sees the call. Handlers inspect and rewrite the argument
//! block in place, install provisional tracker state for the post side,
//! predict kernel failures, or suppress the call outright.
//!
//! Argument slots follow the engine's marshaling of each call, e.g.
//! AllocateVirtualMemory is (process, *base, zero_bits, *size, type,
//! prot) and SetContextThread is (thread, *context).

use std::io::Result;
use std::sync::Arc;

use log::{debug, warn};
use nix::unistd::Pid;

use sysgate_common::consts::{page_align_down, page_align_up};
use sysgate_syscalls::{
    Sysno, NR_SYSCALLS, STATUS_NOT_SUPPORTED, STATUS_SUCCESS, STATUS_THREAD_IS_TERMINATING,
};

use crate::args::ParamView;
use crate::context::{abi, MachineContext};
use crate::mediator::{Decision, Mediator, PreHandler};
use crate::remote::{GuestMemoryExt, RemotePtr};
use crate::synch::{synch_with_all_threads, SynchOutcome};
use crate::task::{
    PendingSyscall, Provisional, SynchPerm, ThreadRecord, CURRENT_PROCESS, CURRENT_THREAD,
};
use crate::tracker::{AccessIntent, Prot};
use crate::translate::redirect_resume;

/// build the pre dispatch table. Unregistered ids default to Execute.
pub fn dispatch_table() -> [Option<PreHandler>; NR_SYSCALLS] {
    let mut t: [Option<PreHandler>; NR_SYSCALLS] = [None; NR_SYSCALLS];
    t[Sysno::Continue.index()] = Some(presys_continue);
    t[Sysno::SetContextThread.index()] = Some(presys_set_context);
    t[Sysno::TerminateProcess.index()] = Some(presys_terminate_process);
    t[Sysno::TerminateThread.index()] = Some(presys_terminate_thread);
    t[Sysno::SuspendThread.index()] = Some(presys_suspend_thread);
    t[Sysno::ResumeThread.index()] = Some(presys_resume_thread);
    t[Sysno::AllocateVirtualMemory.index()] = Some(presys_allocate_virtual_memory);
    t[Sysno::FreeVirtualMemory.index()] = Some(presys_free_virtual_memory);
    t[Sysno::ProtectVirtualMemory.index()] = Some(presys_protect_virtual_memory);
    t[Sysno::MapViewOfSection.index()] = Some(presys_map_view_of_section);
    t[Sysno::UnmapViewOfSection.index()] = Some(presys_unmap_view_of_section);
    t[Sysno::FlushInstructionCache.index()] = Some(presys_flush_instruction_cache);
    t[Sysno::Close.index()] = Some(presys_close);
    t
}

/// thread id behind a thread handle, pseudo-handles included.
pub(crate) fn resolve_thread_handle(
    med: &Mediator,
    rec: &Arc<ThreadRecord>,
    handle: u64,
) -> Option<Pid> {
    if handle == CURRENT_THREAD || handle == 0 {
        return Some(rec.tid);
    }
    med.handles
        .thread_for(handle)
        .or_else(|| med.os.thread_id_for_handle(handle))
}

fn is_own_process(med: &Mediator, handle: u64) -> bool {
    if handle == CURRENT_PROCESS || handle == 0 {
        return true;
    }
    match med
        .handles
        .process_for(handle)
        .or_else(|| med.os.process_id_for_handle(handle))
    {
        Some(pid) => pid == nix::unistd::getpid(),
        // unresolvable handle: assume it is us, a spurious all-thread
        // synch beats missing our own teardown
        None => true,
    }
}

fn read_u64_at(med: &Mediator, addr: u64) -> Result<Option<u64>> {
    match RemotePtr::<u64>::from_addr(addr) {
        Some(p) => med.mem.peek(p).map(Some),
        None => Ok(None),
    }
}

fn write_u64_at(med: &Mediator, addr: u64, v: u64) -> Result<()> {
    if let Some(p) = RemotePtr::<u64>::from_addr(addr) {
        med.mem.poke(p, &v)?;
    }
    Ok(())
}

fn read_context_blob(med: &Mediator, addr: u64) -> Result<Option<MachineContext>> {
    let ptr = match RemotePtr::<u8>::from_addr(addr) {
        Some(p) => p,
        None => return Ok(None),
    };
    let bytes = med.mem.peek_bytes(ptr, abi::CONTEXT_RAW_LEN)?;
    abi::from_raw_bytes(&bytes).map(Some)
}

fn write_context_blob(med: &Mediator, addr: u64, ctx: &MachineContext) -> Result<()> {
    if let Some(p) = RemotePtr::<u8>::from_addr(addr) {
        med.mem.poke_bytes(p, &abi::to_raw_bytes(ctx))?;
    }
    Ok(())
}

/// NtContinue: the app resumes from an exception frame. The frame's pc
/// points at app code; redirect it through the engine so execution
/// stays mediated.
fn presys_continue(
    med: &Mediator,
    _rec: &Arc<ThreadRecord>,
    view: &mut ParamView<'_>,
    pending: &mut PendingSyscall,
) -> Result<Decision> {
    let ctx_addr = view.get(0)?;
    let mut frame = match read_context_blob(med, ctx_addr)? {
        Some(f) => f,
        None => {
            pending.expect_failure = true;
            return Ok(Decision::Execute);
        }
    };
    redirect_resume(med.cache.as_ref(), &mut frame);
    write_context_blob(med, ctx_addr, &frame)?;
    Ok(Decision::ModifiedExecute)
}

/// the app installs a context on a thread. The target must sit at a
/// safe point first, and the new pc is redirected through the engine.
fn presys_set_context(
    med: &Mediator,
    rec: &Arc<ThreadRecord>,
    view: &mut ParamView<'_>,
    pending: &mut PendingSyscall,
) -> Result<Decision> {
    let handle = view.get(0)?;
    let ctx_addr = view.get(1)?;
    let mut new_ctx = match read_context_blob(med, ctx_addr)? {
        Some(c) => c,
        None => {
            pending.expect_failure = true;
            return Ok(Decision::Execute);
        }
    };

    let target_tid = match resolve_thread_handle(med, rec, handle) {
        Some(t) => t,
        None => return Ok(Decision::Execute),
    };
    if target_tid != rec.tid {
        let target = match med.threads.get(target_tid) {
            Some(t) => t,
            None => return Ok(Decision::Execute),
        };
        let ctl = med.synch_ctl();
        match ctl.synch_with_thread(&target, SynchPerm::ValidContext, true)? {
            SynchOutcome::Synched(_) => {
                redirect_resume(med.cache.as_ref(), &mut new_ctx);
                write_context_blob(med, ctx_addr, &new_ctx)?;
                ctl.release_thread(&target)?;
                Ok(Decision::ModifiedExecute)
            }
            SynchOutcome::Exhausted => {
                warn!(
                    "vetoing context install on thread {}: not at a safe point",
                    target_tid
                );
                Ok(Decision::SkipWithResult(STATUS_NOT_SUPPORTED))
            }
            SynchOutcome::Gone => {
                Ok(Decision::SkipWithResult(STATUS_THREAD_IS_TERMINATING))
            }
        }
    } else {
        redirect_resume(med.cache.as_ref(), &mut new_ctx);
        write_context_blob(med, ctx_addr, &new_ctx)?;
        Ok(Decision::ModifiedExecute)
    }
}

/// process teardown: every other thread is parked at a safe point and
/// killed before the kernel dissolves the process, so none of them dies
/// mid-update inside engine state.
fn presys_terminate_process(
    med: &Mediator,
    rec: &Arc<ThreadRecord>,
    view: &mut ParamView<'_>,
    _pending: &mut PendingSyscall,
) -> Result<Decision> {
    let handle = view.get(0)?;
    if !is_own_process(med, handle) {
        return Ok(Decision::Execute);
    }
    debug!("terminate-process from thread {}", rec.tid);
    let all = med.threads.all();
    let ctl = med.synch_ctl();
    let set = synch_with_all_threads(&ctl, &all, rec.tid, SynchPerm::NoXfer)?;
    for (other, _ctx) in &set.synched {
        other.mark_exiting();
        med.os.terminate(other.tid)?;
    }
    for other in &set.skipped {
        // never reached a safe point; kill it raw rather than leak it
        other.mark_exiting();
        med.os.terminate(other.tid)?;
    }
    rec.mark_exiting();
    Ok(Decision::Execute)
}

fn presys_terminate_thread(
    med: &Mediator,
    rec: &Arc<ThreadRecord>,
    view: &mut ParamView<'_>,
    _pending: &mut PendingSyscall,
) -> Result<Decision> {
    let handle = view.get(0)?;
    let target_tid = match resolve_thread_handle(med, rec, handle) {
        Some(t) => t,
        None => return Ok(Decision::Execute),
    };
    if target_tid == rec.tid {
        rec.mark_exiting();
        med.threads.unregister(rec.tid);
        return Ok(Decision::Execute);
    }
    if let Some(target) = med.threads.get(target_tid) {
        let ctl = med.synch_ctl();
        // park it at a safe point; it stays suspended into teardown
        match ctl.synch_with_thread(&target, SynchPerm::NoXfer, true)? {
            SynchOutcome::Synched(_) | SynchOutcome::Exhausted => {}
            SynchOutcome::Gone => {}
        }
        target.mark_exiting();
        med.threads.unregister(target_tid);
    }
    Ok(Decision::Execute)
}

/// mirror an application-issued suspend through the synch protocol so
/// the target never freezes while holding engine state.
fn presys_suspend_thread(
    med: &Mediator,
    rec: &Arc<ThreadRecord>,
    view: &mut ParamView<'_>,
    _pending: &mut PendingSyscall,
) -> Result<Decision> {
    let handle = view.get(0)?;
    let prev_ptr = view.get(1)?;
    let target_tid = match resolve_thread_handle(med, rec, handle) {
        Some(t) => t,
        None => return Ok(Decision::Execute),
    };
    if target_tid == rec.tid {
        // self-suspend cannot deadlock engine state at a syscall point
        return Ok(Decision::Execute);
    }
    let target = match med.threads.get(target_tid) {
        Some(t) => t,
        None => return Ok(Decision::Execute),
    };
    let ctl = med.synch_ctl();
    match ctl.synch_with_thread(&target, SynchPerm::NoXfer, false)? {
        SynchOutcome::Synched(_) => {
            let prev = target.suspend_count() - 1;
            write_u64_at(med, prev_ptr, prev as u64)?;
            Ok(Decision::SkipWithResult(STATUS_SUCCESS))
        }
        SynchOutcome::Exhausted => {
            warn!("suspend of thread {} falls back to the kernel", target_tid);
            Ok(Decision::Execute)
        }
        SynchOutcome::Gone => Ok(Decision::SkipWithResult(STATUS_THREAD_IS_TERMINATING)),
    }
}

fn presys_resume_thread(
    med: &Mediator,
    rec: &Arc<ThreadRecord>,
    view: &mut ParamView<'_>,
    _pending: &mut PendingSyscall,
) -> Result<Decision> {
    let handle = view.get(0)?;
    let prev_ptr = view.get(1)?;
    let target_tid = match resolve_thread_handle(med, rec, handle) {
        Some(t) => t,
        None => return Ok(Decision::Execute),
    };
    let target = match med.threads.get(target_tid) {
        Some(t) => t,
        None => return Ok(Decision::Execute),
    };
    let prev = target.suspend_count();
    if prev <= 0 {
        // no mirrored suspend on record; any real count lives in the
        // kernel (a mirror that fell back to a raw suspend leaves our
        // count at zero), so the kernel must perform the resume
        return Ok(Decision::Execute);
    }
    med.synch_ctl().release_thread(&target)?;
    write_u64_at(med, prev_ptr, prev as u64)?;
    Ok(Decision::SkipWithResult(STATUS_SUCCESS))
}

fn presys_allocate_virtual_memory(
    med: &Mediator,
    _rec: &Arc<ThreadRecord>,
    view: &mut ParamView<'_>,
    pending: &mut PendingSyscall,
) -> Result<Decision> {
    let size_ptr = view.get(3)?;
    let size = read_u64_at(med, size_ptr)?.unwrap_or(0);
    if size == 0 {
        pending.expect_failure = true;
        return Ok(Decision::Execute);
    }
    let prot = Prot(view.get(5)? as u32);
    pending.provisional = Some(Provisional::Alloc {
        size: page_align_up(size),
        prot,
    });
    Ok(Decision::Execute)
}

fn presys_free_virtual_memory(
    med: &Mediator,
    _rec: &Arc<ThreadRecord>,
    view: &mut ParamView<'_>,
    pending: &mut PendingSyscall,
) -> Result<Decision> {
    let base_ptr = view.get(1)?;
    let base = page_align_down(read_u64_at(med, base_ptr)?.unwrap_or(0));
    match med.tracker.query_region(base, AccessIntent::Update) {
        Some(region) => {
            // provisional removal, restored if the kernel refuses
            med.tracker.region_freed(region.base, region.size);
            pending.provisional = Some(Provisional::Free {
                base: region.base,
                size: region.size,
                prot: region.prot,
            });
        }
        None => {
            debug!("free of untracked region {:#x}", base);
            pending.expect_failure = true;
        }
    }
    Ok(Decision::Execute)
}

fn presys_protect_virtual_memory(
    med: &Mediator,
    _rec: &Arc<ThreadRecord>,
    view: &mut ParamView<'_>,
    pending: &mut PendingSyscall,
) -> Result<Decision> {
    let base_ptr = view.get(1)?;
    let size_ptr = view.get(2)?;
    let start = read_u64_at(med, base_ptr)?.unwrap_or(0);
    let len = read_u64_at(med, size_ptr)?.unwrap_or(0);
    // round to the page span the kernel will actually touch; rounding
    // base and size separately drops the tail of an unaligned range
    let base = page_align_down(start);
    let size = page_align_up(start.saturating_add(len)) - base;
    let requested = Prot(view.get(3)? as u32);

    if med.tracker.query_region(base, AccessIntent::Read).is_none() {
        pending.expect_failure = true;
        return Ok(Decision::Execute);
    }

    // app code becoming writable invalidates anything built from it
    if requested.is_writable() {
        med.cache.flush_range(base, size);
    }

    let mut narrowed = None;
    let engine_prot = med.cache.engine_prot(base, size);
    if engine_prot.is_some() && requested.is_writable() {
        let n = requested.without(Prot::WRITE);
        debug!(
            "narrowing protect of engine range {:#x}+{:#x}: {} -> {}",
            base, size, requested, n
        );
        narrowed = Some(n);
        view.set(3, u64::from(n.0))?;
    }

    // the tracker keeps the application's view; the kernel sees the
    // narrowed bits. Query fixups re-project the app view later.
    let engine_old = med.tracker.region_protection_changed(base, size, requested);
    pending.provisional = Some(Provisional::Protect {
        base,
        size,
        requested,
        narrowed,
        engine_old,
    });
    if narrowed.is_some() {
        Ok(Decision::ModifiedExecute)
    } else {
        Ok(Decision::Execute)
    }
}

fn presys_map_view_of_section(
    _med: &Mediator,
    _rec: &Arc<ThreadRecord>,
    view: &mut ParamView<'_>,
    pending: &mut PendingSyscall,
) -> Result<Decision> {
    let section = view.get(0)?;
    pending.provisional = Some(Provisional::Map { section });
    Ok(Decision::Execute)
}

fn presys_unmap_view_of_section(
    med: &Mediator,
    _rec: &Arc<ThreadRecord>,
    view: &mut ParamView<'_>,
    pending: &mut PendingSyscall,
) -> Result<Decision> {
    let base = view.get(1)?;
    let size = med
        .tracker
        .query_region(base, AccessIntent::Read)
        .map(|r| r.size)
        .unwrap_or(0);
    if size > 0 {
        // mapped code may vanish under the cache
        med.cache.flush_range(base, size);
    }
    pending.provisional = Some(Provisional::Unmap { base, size });
    Ok(Decision::Execute)
}

fn presys_flush_instruction_cache(
    med: &Mediator,
    _rec: &Arc<ThreadRecord>,
    view: &mut ParamView<'_>,
    _pending: &mut PendingSyscall,
) -> Result<Decision> {
    let base = view.get(1)?;
    let size = view.get(2)?;
    med.cache.flush_range(base, size);
    Ok(Decision::Execute)
}

fn presys_close(
    med: &Mediator,
    _rec: &Arc<ThreadRecord>,
    view: &mut ParamView<'_>,
    _pending: &mut PendingSyscall,
) -> Result<Decision> {
    let handle = view.get(0)?;
    if med.config.protect_tracked_handles && med.handles.target(handle).is_some() {
        debug!("swallowing close of tracked handle {:#x}", handle);
        return Ok(Decision::SkipWithResult(STATUS_SUCCESS));
    }
    Ok(Decision::Execute)
}
