//! native-mode trampolines
//!
//! When a thread is allowed to run natively, the engine still has to
//! hear about the handful of syscalls that change the thread or
//! process picture. Each watched syscall wrapper in the OS stub
//! library gets a 5-byte jump patched over its entry; the landing code
//! calls back into `on_native_syscall` to decide whether the thread
//! stays native or comes back under mediation.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Error, ErrorKind, Read, Result};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use goblin::elf::Elf;
use log::{debug, warn};
use nix::unistd::Pid;

use sysgate_common::config::HookConflict;
use sysgate_common::consts::TRAMPOLINE_PATCH_LEN;
use sysgate_common::stats_inc;

use sysgate_syscalls::Sysno;

use crate::mediator::Mediator;
use crate::remote::{GuestMemory, RemotePtr};
use crate::task::WhereAmI;

const JMP_REL32: u8 = 0xe9;

/// syscalls that always pull a native thread back under mediation:
/// anything that changes the thread or process picture.
pub const RETAKE_SYSNOS: &[Sysno] = &[
    Sysno::CreateProcess,
    Sysno::CreateProcessEx,
    Sysno::CreateUserProcess,
    Sysno::CreateThread,
    Sysno::CreateThreadEx,
    Sysno::ResumeThread,
];

/// wrapper entry point of `symbol` inside the syscall stub library.
pub fn resolve_wrapper_entry(library: &Path, symbol: &str) -> Result<u64> {
    let mut bytes: Vec<u8> = Vec::new();
    let mut file = File::open(library)?;
    file.read_to_end(&mut bytes)?;
    resolve_wrapper_in(&bytes, symbol)
}

pub fn resolve_wrapper_in(bytes: &[u8], symbol: &str) -> Result<u64> {
    let elf = Elf::parse(bytes).map_err(|e| Error::new(ErrorKind::Other, e))?;
    let strtab = elf.strtab;
    for sym in elf.syms.iter() {
        if symbol == &strtab[sym.st_name] {
            return Ok(sym.st_value);
        }
    }
    let dynstrtab = elf.dynstrtab;
    for sym in elf.dynsyms.iter() {
        if symbol == &dynstrtab[sym.st_name] {
            return Ok(sym.st_value);
        }
    }
    Err(Error::new(
        ErrorKind::NotFound,
        format!("no wrapper symbol {}", symbol),
    ))
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct HookHandle(usize);

struct Hook {
    sysno: Sysno,
    entry: u64,
    saved: [u8; TRAMPOLINE_PATCH_LEN],
    /// prior hook target we displaced, under the chain policy
    displaced: Option<u64>,
    removed: bool,
}

/// installed wrapper patches, keyed by handle.
pub struct TrampolineManager {
    mem: Arc<dyn GuestMemory>,
    conflict: HookConflict,
    hooks: Mutex<HashMap<usize, Hook>>,
    next: AtomicUsize,
}

impl TrampolineManager {
    pub fn new(mem: Arc<dyn GuestMemory>, conflict: HookConflict) -> TrampolineManager {
        TrampolineManager {
            mem,
            conflict,
            hooks: Mutex::new(HashMap::new()),
            next: AtomicUsize::new(1),
        }
    }

    /// patch a jump to `target` over the wrapper at `entry`.
    pub fn install(&self, sysno: Sysno, entry: u64, target: u64) -> Result<HookHandle> {
        let entry_ptr = byte_ptr(entry)?;
        let old = self.mem.peek_bytes(entry_ptr, TRAMPOLINE_PATCH_LEN)?;
        let mut saved = [0u8; TRAMPOLINE_PATCH_LEN];
        saved.copy_from_slice(&old);

        let mut displaced = None;
        if saved[0] == JMP_REL32 {
            // somebody hooked this wrapper before us
            match self.conflict {
                HookConflict::Refuse => {
                    return Err(Error::new(
                        ErrorKind::AlreadyExists,
                        format!("wrapper for {} already hooked", sysno),
                    ));
                }
                HookConflict::Squash => {
                    debug!("squashing prior hook on {} wrapper", sysno);
                }
                HookConflict::Chain => {
                    let prior = decode_jmp_target(entry, &saved);
                    debug!("chaining prior hook at {:#x} on {} wrapper", prior, sysno);
                    displaced = Some(prior);
                }
            }
        }

        let patch = encode_jmp(entry, target)?;
        self.mem.poke_bytes(entry_ptr, &patch)?;

        let id = self.next.fetch_add(1, Ordering::Relaxed);
        let hook = Hook {
            sysno,
            entry,
            saved,
            displaced,
            removed: false,
        };
        if let Ok(mut g) = self.hooks.lock() {
            g.insert(id, hook);
        }
        Ok(HookHandle(id))
    }

    /// restore the wrapper's original bytes. Safe to call twice.
    pub fn remove(&self, handle: HookHandle) -> Result<()> {
        let mut g = match self.hooks.lock() {
            Ok(g) => g,
            Err(_) => return Ok(()),
        };
        let hook = match g.get_mut(&handle.0) {
            Some(h) => h,
            None => return Ok(()),
        };
        if hook.removed {
            return Ok(());
        }
        self.mem.poke_bytes(byte_ptr(hook.entry)?, &hook.saved)?;
        hook.removed = true;
        Ok(())
    }

    /// teardown: restore every patch that is still live. Individual
    /// failures are logged and skipped so the rest still unhook.
    pub fn remove_all(&self) {
        let mut g = match self.hooks.lock() {
            Ok(g) => g,
            Err(_) => return,
        };
        for hook in g.values_mut() {
            if hook.removed {
                continue;
            }
            let restore = byte_ptr(hook.entry)
                .and_then(|p| self.mem.poke_bytes(p, &hook.saved));
            match restore {
                Ok(()) => hook.removed = true,
                Err(e) => warn!("unhook of {} wrapper failed: {}", hook.sysno, e),
            }
        }
    }

    /// displaced third-party hook to fall through to, if chained.
    pub fn chained_target(&self, handle: HookHandle) -> Option<u64> {
        self.hooks
            .lock()
            .ok()
            .and_then(|g| g.get(&handle.0).and_then(|h| h.displaced))
    }

    pub fn live_hooks(&self) -> usize {
        self.hooks
            .lock()
            .map(|g| g.values().filter(|h| !h.removed).count())
            .unwrap_or(0)
    }
}

fn byte_ptr(addr: u64) -> Result<RemotePtr<u8>> {
    RemotePtr::from_addr(addr)
        .ok_or_else(|| Error::new(ErrorKind::InvalidInput, "null wrapper entry"))
}

fn encode_jmp(entry: u64, target: u64) -> Result<[u8; TRAMPOLINE_PATCH_LEN]> {
    let disp = (target as i64) - (entry as i64 + TRAMPOLINE_PATCH_LEN as i64);
    if disp > i64::from(i32::max_value()) || disp < i64::from(i32::min_value()) {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            "trampoline target out of rel32 range",
        ));
    }
    let mut patch = [0u8; TRAMPOLINE_PATCH_LEN];
    patch[0] = JMP_REL32;
    patch[1..].copy_from_slice(&(disp as i32).to_le_bytes());
    Ok(patch)
}

fn decode_jmp_target(entry: u64, patch: &[u8; TRAMPOLINE_PATCH_LEN]) -> u64 {
    let mut rel = [0u8; 4];
    rel.copy_from_slice(&patch[1..]);
    let disp = i64::from(i32::from_le_bytes(rel));
    (entry as i64 + TRAMPOLINE_PATCH_LEN as i64 + disp) as u64
}

/// what a trampoline hit should do with the calling thread.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NativeDisposition {
    /// let the native wrapper run the real syscall
    LetGo,
    /// bring the thread back under mediation before the syscall
    TakeOver,
    /// thread is mid-retakeover; force engine re-entry
    ReEnter,
}

/// entry point for the trampoline landing code.
pub fn on_native_syscall(med: &Mediator, tid: Pid, sysno: Sysno) -> NativeDisposition {
    stats_inc!(nr_trampoline_hits);
    let rec = match med.threads.get(tid) {
        Some(r) => r,
        // a thread the engine has never seen; not ours to steer
        None => {
            stats_inc!(nr_trampoline_native);
            return NativeDisposition::LetGo;
        }
    };
    if rec.whereami() == WhereAmI::Trampoline {
        stats_inc!(nr_trampoline_retakeover);
        return NativeDisposition::ReEnter;
    }
    rec.set_whereami(WhereAmI::Trampoline);

    if rec.take_retakeover() {
        stats_inc!(nr_trampoline_retakeover);
        rec.set_whereami(WhereAmI::Engine);
        return NativeDisposition::TakeOver;
    }
    if rec.is_native() {
        if RETAKE_SYSNOS.contains(&sysno) {
            debug!("retaking native thread {} at {}", tid, sysno);
            stats_inc!(nr_trampoline_retakeover);
            rec.set_whereami(WhereAmI::Engine);
            return NativeDisposition::TakeOver;
        }
        stats_inc!(nr_trampoline_native);
        rec.set_whereami(WhereAmI::AppCode);
        return NativeDisposition::LetGo;
    }
    // a mediated thread surfaced in a native wrapper; the engine lost
    // it somewhere, take it back
    stats_inc!(nr_trampoline_retakeover);
    rec.set_whereami(WhereAmI::Engine);
    NativeDisposition::TakeOver
}
