//! syscall mediation engine seam
//!
//! The execution engine calls `on_syscall_trap` when a thread is about
//! to enter the kernel and `on_syscall_result` when the kernel comes
//! back. The mediator never issues the application's syscall itself; it
//! decides whether the engine should, rewrites arguments in place, and
//! fixes up results afterwards.

use std::io::Result;
use std::sync::Arc;

use log::{debug, warn};
use nix::unistd::Pid;

use sysgate_common::config::EngineConfig;
use sysgate_common::stats_inc;
use sysgate_syscalls::{nt_success, SyscallCatalog, Sysno, NR_SYSCALLS};

use crate::args::{Abi, ParamView, SyscallArgs};
use crate::context::MachineContext;
use crate::inject::RemoteProcess;
use crate::os::{CodeCacheMap, OsThreadOps};
use crate::remote::GuestMemory;
use crate::synch::SynchCtl;
use crate::task::{HandleMap, PendingSyscall, SectionMap, ThreadList, ThreadRecord, WhereAmI};
use crate::tracker::MemoryTracker;
use crate::{postsys, presys};

/// what a pre handler decided about a trapped syscall.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Decision {
    /// let the kernel see it untouched
    Execute,
    /// suppress the kernel call entirely; the value becomes the
    /// application-visible status
    SkipWithResult(i64),
    /// let the kernel see it, arguments were rewritten in place
    ModifiedExecute,
}

/// what the engine should do with the trapped syscall.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TrapAction {
    ExecuteSyscall,
    /// skip the kernel; the return register already holds the status
    SkipSyscall,
}

/// what the engine should do after the kernel returned.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResultAction {
    ReturnToApp,
    /// issue one more syscall on this thread before returning
    IssueSyscall { raw: i32, args: SyscallArgs },
}

pub type PreHandler = fn(
    &Mediator,
    &Arc<ThreadRecord>,
    &mut ParamView<'_>,
    &mut PendingSyscall,
) -> Result<Decision>;

pub type PostHandler = fn(
    &Mediator,
    &Arc<ThreadRecord>,
    &mut MachineContext,
    bool,
    &mut PendingSyscall,
) -> Result<()>;

pub struct Mediator {
    pub config: EngineConfig,
    pub catalog: SyscallCatalog,
    pub abi: Abi,
    pub os: Arc<dyn OsThreadOps>,
    pub mem: Arc<dyn GuestMemory>,
    pub cache: Arc<dyn CodeCacheMap>,
    pub tracker: Arc<dyn MemoryTracker>,
    pub remote: Arc<dyn RemoteProcess>,
    pub threads: ThreadList,
    pub handles: HandleMap,
    pub sections: SectionMap,
    pre_table: [Option<PreHandler>; NR_SYSCALLS],
    post_table: [Option<PostHandler>; NR_SYSCALLS],
}

impl Mediator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        abi: Abi,
        os: Arc<dyn OsThreadOps>,
        mem: Arc<dyn GuestMemory>,
        cache: Arc<dyn CodeCacheMap>,
        tracker: Arc<dyn MemoryTracker>,
        remote: Arc<dyn RemoteProcess>,
    ) -> Result<Mediator> {
        let catalog = SyscallCatalog::for_build_number(config.os_build)?;
        Ok(Mediator {
            config,
            catalog,
            abi,
            os,
            mem,
            cache,
            tracker,
            remote,
            threads: ThreadList::new(),
            handles: HandleMap::new(),
            sections: SectionMap::new(),
            pre_table: presys::dispatch_table(),
            post_table: postsys::dispatch_table(),
        })
    }

    /// register plugin syscalls; must happen before `finish_init`.
    pub fn register_extra_syscall(&mut self, name: &str, raw: i32, nargs: usize) -> Result<()> {
        self.catalog.register_extra(name, raw, nargs)
    }

    /// seal the catalog; the mediation fast path is live after this.
    pub fn finish_init(&mut self) {
        self.catalog.finish_init();
    }

    pub fn synch_ctl(&self) -> SynchCtl<'_> {
        SynchCtl {
            os: self.os.as_ref(),
            config: &self.config,
        }
    }

    pub fn thread_started(&self, tid: Pid, handle: u64) -> Arc<ThreadRecord> {
        debug!("thread {} under mediation", tid);
        self.threads.register(tid, handle)
    }

    pub fn thread_exited(&self, tid: Pid) {
        if let Some(rec) = self.threads.unregister(tid) {
            rec.mark_exiting();
        }
    }

    /// a thread is about to enter the kernel.
    pub fn on_syscall_trap(
        &self,
        rec: &Arc<ThreadRecord>,
        ctx: &mut MachineContext,
    ) -> Result<TrapAction> {
        stats_inc!(nr_syscalls);
        let raw = ctx.sysreg as i32;
        let sysno = match self.catalog.reverse(raw) {
            Some(s) => s,
            None => {
                if let Some(extra) = self.catalog.extra_for_raw(raw) {
                    debug!("plugin syscall {} ({:#x}) passes through", extra.name, raw);
                }
                return Ok(TrapAction::ExecuteSyscall);
            }
        };
        if !self.catalog.requires_mediation(sysno) {
            return Ok(TrapAction::ExecuteSyscall);
        }
        stats_inc!(nr_mediated);
        rec.set_whereami(WhereAmI::SyscallHandler);

        let nargs = self.catalog.nargs(sysno);
        let mut view = ParamView::new(self.mem.as_ref(), ctx, self.abi, nargs);
        let saved = view.saved()?;
        let mut pending = PendingSyscall::new(sysno, saved);
        let decision = match self.pre_table[sysno.index()] {
            Some(handler) => handler(self, rec, &mut view, &mut pending)?,
            None => Decision::Execute,
        };
        debug!("pre {} -> {:?}", sysno, decision);
        match decision {
            Decision::SkipWithResult(status) => {
                stats_inc!(nr_skipped);
                ctx.retval = status as u64;
                rec.set_whereami(WhereAmI::AppCode);
                Ok(TrapAction::SkipSyscall)
            }
            Decision::ModifiedExecute => {
                stats_inc!(nr_rewritten);
                self.store_pending(rec, pending);
                Ok(TrapAction::ExecuteSyscall)
            }
            Decision::Execute => {
                self.store_pending(rec, pending);
                Ok(TrapAction::ExecuteSyscall)
            }
        }
    }

    /// the kernel returned; the status is in the return register.
    pub fn on_syscall_result(
        &self,
        rec: &Arc<ThreadRecord>,
        ctx: &mut MachineContext,
    ) -> Result<ResultAction> {
        let mut pending = match rec.take_pending() {
            Some(p) => p,
            None => return Ok(ResultAction::ReturnToApp),
        };
        let success = nt_success(ctx.retval as i64);
        if pending.expect_failure {
            if success {
                warn!(
                    "{} predicted to fail but kernel reported success",
                    pending.sysno
                );
            } else {
                stats_inc!(nr_predicted_failures);
            }
            debug_assert!(!success, "kernel contradicted a failure prediction");
        }
        if let Some(handler) = self.post_table[pending.sysno.index()] {
            handler(self, rec, ctx, success, &mut pending)?;
        }
        rec.set_whereami(WhereAmI::AppCode);

        let chained = rec.chain_request.lock().ok().and_then(|mut g| g.take());
        if let Some((sysno, args)) = chained {
            if let Some(raw) = self.catalog.lookup(sysno) {
                debug!("chaining {} after {}", sysno, pending.sysno);
                return Ok(ResultAction::IssueSyscall { raw, args });
            }
        }
        Ok(ResultAction::ReturnToApp)
    }

    /// client API: run one more syscall on `rec` before it returns to
    /// application code. One request per mediated syscall.
    pub fn chain_syscall(&self, rec: &Arc<ThreadRecord>, sysno: Sysno, args: SyscallArgs) {
        if let Ok(mut slot) = rec.chain_request.lock() {
            if slot.is_some() {
                warn!("chained syscall already pending on thread {}", rec.tid);
            } else {
                *slot = Some((sysno, args));
            }
        }
    }

    fn store_pending(&self, rec: &Arc<ThreadRecord>, pending: PendingSyscall) {
        if let Ok(mut slot) = rec.pending.lock() {
            *slot = Some(pending);
        }
    }
}
