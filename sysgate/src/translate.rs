//! context translation
//!
//! A thread stopped inside engine-generated code has a machine context
//! whose pc and register values describe the code cache, not the app.
//! Before that context is shown to the app (or used to resume it
//! natively) it must be rewritten to the app state the cached code was
//! emulating.

use std::io::{Error, ErrorKind, Result};

use log::debug;

use crate::context::{Flavor, MachineContext};
use crate::os::CodeCacheMap;
use crate::remote::{GuestMemory, GuestMemoryExt, RemotePtr};

/// register slots the engine may spill around cache exits. Slot indices
/// line up with `MachineContext::args`; the stack and frame pointers get
/// their own slots after those.
pub const SPILL_SLOT_SP: usize = 16;
pub const SPILL_SLOT_FP: usize = 17;

/// rewrite `ctx` from cache coordinates to app coordinates in place.
///
/// Idempotent: a context already tagged `Translated` is returned
/// unchanged, so callers layered on top of each other never double
/// translate. A raw context whose pc is outside the cache was already
/// executing app code and only needs retagging. `Ok(false)` means the
/// stop point has no app translation; the caller decides whether to
/// retry after letting the thread run or give up with "not supported".
///
/// `restore_memory` additionally recovers registers the cached code had
/// spilled to scratch slots; skipping it is only sound when the caller
/// will discard register values.
pub fn translate_context(
    cache: &dyn CodeCacheMap,
    mem: &dyn GuestMemory,
    ctx: &mut MachineContext,
    restore_memory: bool,
) -> Result<bool> {
    if ctx.flavor == Flavor::Translated {
        return Ok(true);
    }
    if !cache.in_cache(ctx.pc) {
        ctx.flavor = Flavor::Translated;
        return Ok(true);
    }
    let app_pc = match cache.translate_pc(ctx.pc) {
        Some(pc) => pc,
        None => {
            debug!("no app translation for cache pc {:#x}", ctx.pc);
            return Ok(false);
        }
    };
    debug!("translating cache pc {:#x} -> app pc {:#x}", ctx.pc, app_pc);

    if restore_memory {
        // recover registers the cached code had spilled to memory.
        for slot in 0..ctx.args.len() {
            if let Some(addr) = cache.spilled_reg(ctx.pc, slot) {
                ctx.args[slot] = read_spill(mem, addr)?;
            }
        }
        if let Some(addr) = cache.spilled_reg(ctx.pc, SPILL_SLOT_SP) {
            ctx.sp = read_spill(mem, addr)?;
        }
        if let Some(addr) = cache.spilled_reg(ctx.pc, SPILL_SLOT_FP) {
            ctx.fp = read_spill(mem, addr)?;
        }
    }

    ctx.pc = app_pc;
    ctx.flavor = Flavor::Translated;
    Ok(true)
}

fn read_spill(mem: &dyn GuestMemory, addr: u64) -> Result<u64> {
    let ptr = RemotePtr::<u64>::from_addr(addr).ok_or_else(|| {
        Error::new(ErrorKind::InvalidData, "null spill slot address")
    })?;
    mem.peek(ptr)
}

/// rewrite a context an app is installing (SetContextThread) so the
/// target resumes under mediation instead of jumping to raw app code.
/// The pc is redirected through the engine's takeover entry; everything
/// else passes through untouched.
pub fn redirect_resume(cache: &dyn CodeCacheMap, ctx: &mut MachineContext) {
    let target = cache.takeover_target(ctx.pc);
    if target != ctx.pc {
        debug!("redirecting resume pc {:#x} -> {:#x}", ctx.pc, target);
        ctx.pc = target;
    }
    ctx.flavor = Flavor::Raw;
}
