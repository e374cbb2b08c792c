//! post-call mediation
//!
//! Runs after the kernel came back, only for syscalls that were allowed
//! to execute. Success commits whatever the pre side staged; failure
//! rolls it back so the tracker never drifts from the kernel's real
//! state.

use std::io::Result;
use std::sync::Arc;

use log::{debug, error, warn};

use sysgate_common::consts::{page_align_down, page_align_up};
use sysgate_common::stats_inc;
use sysgate_syscalls::{Sysno, NR_SYSCALLS};

use crate::context::{abi, MachineContext};
use crate::inject;
use crate::mediator::{Mediator, PostHandler};
use crate::presys::resolve_thread_handle;
use crate::remote::{GuestMemoryExt, RemotePtr};
use crate::task::{HandleTarget, PendingSyscall, Provisional, ThreadRecord};
use crate::translate::translate_context;

pub fn dispatch_table() -> [Option<PostHandler>; NR_SYSCALLS] {
    let mut t: [Option<PostHandler>; NR_SYSCALLS] = [None; NR_SYSCALLS];
    t[Sysno::GetContextThread.index()] = Some(postsys_get_context);
    t[Sysno::AllocateVirtualMemory.index()] = Some(postsys_allocate_virtual_memory);
    t[Sysno::FreeVirtualMemory.index()] = Some(postsys_free_virtual_memory);
    t[Sysno::ProtectVirtualMemory.index()] = Some(postsys_protect_virtual_memory);
    t[Sysno::QueryVirtualMemory.index()] = Some(postsys_query_virtual_memory);
    t[Sysno::WriteVirtualMemory.index()] = Some(postsys_write_virtual_memory);
    t[Sysno::CreateSection.index()] = Some(postsys_create_section);
    t[Sysno::OpenSection.index()] = Some(postsys_open_section);
    t[Sysno::MapViewOfSection.index()] = Some(postsys_map_view_of_section);
    t[Sysno::UnmapViewOfSection.index()] = Some(postsys_unmap_view_of_section);
    t[Sysno::Close.index()] = Some(postsys_close);
    t[Sysno::DuplicateObject.index()] = Some(postsys_duplicate_object);
    t[Sysno::OpenThread.index()] = Some(postsys_open_thread);
    t[Sysno::CreateThread.index()] = Some(postsys_create_thread);
    t[Sysno::CreateThreadEx.index()] = Some(postsys_create_thread);
    t[Sysno::CreateProcess.index()] = Some(postsys_create_process);
    t[Sysno::CreateProcessEx.index()] = Some(postsys_create_process);
    t[Sysno::CreateUserProcess.index()] = Some(postsys_create_process);
    t
}

fn read_u64_at(med: &Mediator, addr: u64) -> Result<Option<u64>> {
    match RemotePtr::<u64>::from_addr(addr) {
        Some(p) => med.mem.peek(p).map(Some),
        None => Ok(None),
    }
}

/// translate the captured context before the application reads it; the
/// target still sits suspended, so the capture point is stable.
fn postsys_get_context(
    med: &Mediator,
    _rec: &Arc<ThreadRecord>,
    _ctx: &mut MachineContext,
    success: bool,
    pending: &mut PendingSyscall,
) -> Result<()> {
    if !success {
        return Ok(());
    }
    let ctx_addr = pending.saved_args.get(1)?;
    let ptr = match RemotePtr::<u8>::from_addr(ctx_addr) {
        Some(p) => p,
        None => return Ok(()),
    };
    let bytes = med.mem.peek_bytes(ptr, abi::CONTEXT_RAW_LEN)?;
    let mut captured = abi::from_raw_bytes(&bytes)?;
    if translate_context(med.cache.as_ref(), med.mem.as_ref(), &mut captured, true)? {
        med.mem.poke_bytes(ptr, &abi::to_raw_bytes(&captured))?;
    } else {
        warn!("captured context at {:#x} has no translation", captured.pc);
    }
    Ok(())
}

fn postsys_allocate_virtual_memory(
    med: &Mediator,
    _rec: &Arc<ThreadRecord>,
    _ctx: &mut MachineContext,
    success: bool,
    pending: &mut PendingSyscall,
) -> Result<()> {
    let prot = match pending.provisional {
        Some(Provisional::Alloc { prot, .. }) => prot,
        _ => return Ok(()),
    };
    if !success {
        return Ok(());
    }
    // the kernel wrote the real placement back through the pointers
    let base = read_u64_at(med, pending.saved_args.get(1)?)?.unwrap_or(0);
    let size = read_u64_at(med, pending.saved_args.get(3)?)?.unwrap_or(0);
    let base = page_align_down(base);
    let size = page_align_up(size);
    debug!("allocation committed at {:#x}+{:#x} {}", base, size, prot);
    med.tracker.region_allocated(base, size, prot);
    Ok(())
}

fn postsys_free_virtual_memory(
    med: &Mediator,
    _rec: &Arc<ThreadRecord>,
    _ctx: &mut MachineContext,
    success: bool,
    pending: &mut PendingSyscall,
) -> Result<()> {
    if let Some(Provisional::Free { base, size, prot }) = pending.provisional {
        if success {
            med.cache.flush_range(base, size);
        } else {
            // kernel refused; the provisional removal must be undone
            debug!("free of {:#x}+{:#x} failed, restoring region", base, size);
            med.tracker.region_allocated(base, size, prot);
        }
    }
    Ok(())
}

fn postsys_protect_virtual_memory(
    med: &Mediator,
    _rec: &Arc<ThreadRecord>,
    _ctx: &mut MachineContext,
    success: bool,
    pending: &mut PendingSyscall,
) -> Result<()> {
    let (base, size, narrowed, engine_old) = match pending.provisional {
        Some(Provisional::Protect {
            base,
            size,
            narrowed,
            engine_old,
            ..
        }) => (base, size, narrowed, engine_old),
        _ => return Ok(()),
    };
    if success {
        // the kernel reported its own previous protection; for ranges
        // the engine manages, the app must see the engine's view
        if narrowed.is_some() {
            if let (Some(old), Some(ptr)) = (
                engine_old,
                RemotePtr::<u32>::from_addr(pending.saved_args.get(4)?),
            ) {
                med.mem.poke(ptr, &old.0)?;
            }
        }
    } else if let Some(old) = engine_old {
        med.tracker.region_protection_changed(base, size, old);
    }
    Ok(())
}

/// re-project the engine's protection view into the query result, so a
/// narrowed region still looks the way the app left it.
fn postsys_query_virtual_memory(
    med: &Mediator,
    _rec: &Arc<ThreadRecord>,
    _ctx: &mut MachineContext,
    success: bool,
    pending: &mut PendingSyscall,
) -> Result<()> {
    if !success {
        return Ok(());
    }
    let buffer = pending.saved_args.get(3)?;
    let base = match read_u64_at(med, buffer)? {
        Some(b) => b,
        None => return Ok(()),
    };
    if let Some(region) = med
        .tracker
        .query_region(base, crate::tracker::AccessIntent::Read)
    {
        if let Some(ptr) = RemotePtr::<u32>::from_addr(buffer + 16) {
            let reported: u32 = med.mem.peek(ptr)?;
            if reported != region.prot.0 {
                debug!(
                    "query fixup at {:#x}: {:#x} -> {}",
                    base, reported, region.prot
                );
                med.mem.poke(ptr, &region.prot.0)?;
            }
        }
    }
    Ok(())
}

/// the app patched its own memory through the kernel; anything built
/// from executable bytes in the written range is stale.
fn postsys_write_virtual_memory(
    med: &Mediator,
    _rec: &Arc<ThreadRecord>,
    _ctx: &mut MachineContext,
    success: bool,
    pending: &mut PendingSyscall,
) -> Result<()> {
    if !success {
        return Ok(());
    }
    let base = pending.saved_args.get(1)?;
    // prefer the kernel's written count; the request size otherwise
    let size = match read_u64_at(med, pending.saved_args.get(4)?)? {
        Some(n) if n > 0 => n,
        _ => pending.saved_args.get(3)?,
    };
    if size == 0 {
        return Ok(());
    }
    if let Some(region) = med
        .tracker
        .query_region(base, crate::tracker::AccessIntent::Read)
    {
        if region.prot.is_executable() {
            debug!("write into executable region at {:#x}+{:#x}", base, size);
            let start = page_align_down(base);
            med.cache
                .flush_range(start, page_align_up(base.saturating_add(size)) - start);
        }
    }
    Ok(())
}

/// remember what backs a freshly created section so later mapped views
/// can be attributed to it.
fn postsys_create_section(
    med: &Mediator,
    _rec: &Arc<ThreadRecord>,
    _ctx: &mut MachineContext,
    success: bool,
    pending: &mut PendingSyscall,
) -> Result<()> {
    if !success {
        return Ok(());
    }
    let handle = match read_u64_at(med, pending.saved_args.get(0)?)? {
        Some(h) if h != 0 => h,
        _ => return Ok(()),
    };
    let file_handle = pending.saved_args.get(6)?;
    let backing = if file_handle != 0 {
        format!("file handle {:#x}", file_handle)
    } else {
        "pagefile".to_string()
    };
    debug!("section {:#x} backed by {}", handle, backing);
    med.sections.insert(handle, backing);
    Ok(())
}

fn postsys_open_section(
    med: &Mediator,
    _rec: &Arc<ThreadRecord>,
    _ctx: &mut MachineContext,
    success: bool,
    pending: &mut PendingSyscall,
) -> Result<()> {
    if !success {
        return Ok(());
    }
    if let Some(handle) = read_u64_at(med, pending.saved_args.get(0)?)? {
        if handle != 0 {
            med.sections.insert(handle, "named section".to_string());
        }
    }
    Ok(())
}

fn postsys_map_view_of_section(
    med: &Mediator,
    _rec: &Arc<ThreadRecord>,
    _ctx: &mut MachineContext,
    success: bool,
    pending: &mut PendingSyscall,
) -> Result<()> {
    let section = match pending.provisional {
        Some(Provisional::Map { section }) => section,
        _ => return Ok(()),
    };
    if !success {
        return Ok(());
    }
    let base = read_u64_at(med, pending.saved_args.get(2)?)?.unwrap_or(0);
    let size = read_u64_at(med, pending.saved_args.get(6)?)?.unwrap_or(0);
    let backing = med
        .sections
        .backing(section)
        .unwrap_or_else(|| format!("section {:#x}", section));
    med.tracker
        .region_mapped(page_align_down(base), page_align_up(size), &backing);
    Ok(())
}

fn postsys_unmap_view_of_section(
    med: &Mediator,
    _rec: &Arc<ThreadRecord>,
    _ctx: &mut MachineContext,
    success: bool,
    pending: &mut PendingSyscall,
) -> Result<()> {
    if let Some(Provisional::Unmap { base, size }) = pending.provisional {
        if success {
            med.tracker.region_unmapped(base, size);
        }
    }
    Ok(())
}

fn postsys_close(
    med: &Mediator,
    _rec: &Arc<ThreadRecord>,
    _ctx: &mut MachineContext,
    success: bool,
    pending: &mut PendingSyscall,
) -> Result<()> {
    if success {
        let handle = pending.saved_args.get(0)?;
        med.handles.remove(handle);
        med.sections.remove(handle);
    }
    Ok(())
}

/// keep the handle map coherent when a tracked handle is duplicated.
fn postsys_duplicate_object(
    med: &Mediator,
    _rec: &Arc<ThreadRecord>,
    _ctx: &mut MachineContext,
    success: bool,
    pending: &mut PendingSyscall,
) -> Result<()> {
    if !success {
        return Ok(());
    }
    let src = pending.saved_args.get(1)?;
    if let Some(new_handle) = read_u64_at(med, pending.saved_args.get(3)?)? {
        if new_handle != 0 {
            med.handles.alias(src, new_handle);
        }
    }
    Ok(())
}

fn postsys_open_thread(
    med: &Mediator,
    rec: &Arc<ThreadRecord>,
    _ctx: &mut MachineContext,
    success: bool,
    pending: &mut PendingSyscall,
) -> Result<()> {
    if !success {
        return Ok(());
    }
    let handle = match read_u64_at(med, pending.saved_args.get(0)?)? {
        Some(h) if h != 0 => h,
        _ => return Ok(()),
    };
    if let Some(tid) = resolve_thread_handle(med, rec, handle) {
        med.handles.insert(handle, HandleTarget::Thread(tid));
    }
    Ok(())
}

/// a new thread exists; put it under mediation before the app can
/// resume it.
fn postsys_create_thread(
    med: &Mediator,
    _rec: &Arc<ThreadRecord>,
    _ctx: &mut MachineContext,
    success: bool,
    pending: &mut PendingSyscall,
) -> Result<()> {
    if !success {
        return Ok(());
    }
    let handle = match read_u64_at(med, pending.saved_args.get(0)?)? {
        Some(h) if h != 0 => h,
        _ => return Ok(()),
    };
    if let Some(tid) = med.os.thread_id_for_handle(handle) {
        med.handles.insert(handle, HandleTarget::Thread(tid));
        med.threads.register(tid, handle);
        debug!("created thread {} registered", tid);
    } else {
        warn!("created thread handle {:#x} resolves to no id", handle);
    }
    Ok(())
}

/// a new process exists, still with its first thread suspended; decide
/// whether to follow it and inject before anything in it runs.
fn postsys_create_process(
    med: &Mediator,
    _rec: &Arc<ThreadRecord>,
    _ctx: &mut MachineContext,
    success: bool,
    pending: &mut PendingSyscall,
) -> Result<()> {
    if !success {
        return Ok(());
    }
    let handle = match read_u64_at(med, pending.saved_args.get(0)?)? {
        Some(h) if h != 0 => h,
        _ => return Ok(()),
    };
    let pid = match med.os.process_id_for_handle(handle) {
        Some(p) => p,
        None => {
            warn!("created process handle {:#x} resolves to no id", handle);
            return Ok(());
        }
    };
    med.handles.insert(handle, HandleTarget::Process(pid));

    let image = med.remote.image_name(pid);
    if !inject::should_follow(&med.config, image.as_deref()) {
        debug!("not following child {} ({:?})", pid, image);
        return Ok(());
    }
    match inject::inject_child(med.remote.as_ref(), pid, &med.config) {
        Ok(()) => {
            stats_inc!(nr_children_followed);
        }
        Err(e) => {
            // remote allocations were already rolled back; the child
            // runs un-instrumented rather than half-instrumented
            error!("failed to inject into child {}: {}", pid, e);
        }
    }
    Ok(())
}
