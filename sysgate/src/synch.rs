//! cross-thread synchronization
//!
//! Getting another thread to a point where its context can be read,
//! rewritten or trusted means suspending it and checking what it was
//! doing. A thread stopped at an arbitrary point may hold engine locks
//! or sit halfway through a context switch, so the initiator loops:
//! suspend, inspect the target's self-published permission, and if the
//! stop point is unusable, resume and try again a bit later.

use std::io::{Error, ErrorKind, Result};
use std::sync::Arc;

use log::{debug, warn};

use sysgate_common::config::{EngineConfig, SynchFailure};
use sysgate_common::stats_inc;

use crate::context::MachineContext;
use crate::os::OsThreadOps;
use crate::task::{SynchPerm, ThreadRecord};

/// outcome of one synch attempt against a single target.
#[derive(Debug)]
pub enum SynchOutcome {
    /// suspended at an acceptable point, raw context captured
    Synched(MachineContext),
    /// loop bound hit without ever catching a safe point
    Exhausted,
    /// target exited (or is tearing down) before we caught it
    Gone,
}

/// collaborators a synch loop needs; the mediator lends these out.
pub struct SynchCtl<'a> {
    pub os: &'a dyn OsThreadOps,
    pub config: &'a EngineConfig,
}

impl<'a> SynchCtl<'a> {
    /// suspend `rec` and poll until its published permission reaches
    /// `need`. The suspend count only actually suspends on the 0 -> 1
    /// edge, so a target the app already suspended stays suspended and
    /// a concurrent initiator is harmless.
    pub fn synch_with_thread(
        &self,
        rec: &Arc<ThreadRecord>,
        need: SynchPerm,
        small_loop: bool,
    ) -> Result<SynchOutcome> {
        let bound = if small_loop {
            self.config.small_loop_bound()
        } else {
            self.config.synch_max_loops
        };
        for _ in 0..bound {
            if rec.is_exiting() || !self.os.thread_alive(rec.tid) {
                return Ok(SynchOutcome::Gone);
            }
            if rec.inc_suspend() == 0 {
                if let Err(e) = self.os.suspend(rec.tid) {
                    rec.dec_suspend();
                    return self.give_up(rec, Some(e));
                }
            }
            if rec.synch_perm() >= need {
                let ctx = self.os.get_context(rec.tid)?;
                return Ok(SynchOutcome::Synched(ctx));
            }
            // unusable stop point: let it run and re-catch it later
            if rec.dec_suspend() == 0 {
                self.os.resume(rec.tid)?;
            }
            stats_inc!(nr_synch_retries);
            self.os.pause();
        }
        self.give_up(rec, None)
    }

    // two distinct knobs: suspend failures follow `synch_failure`,
    // loop exhaustion follows `synch_loop_fatal`.
    fn give_up(&self, rec: &Arc<ThreadRecord>, err: Option<Error>) -> Result<SynchOutcome> {
        stats_inc!(nr_synch_failures);
        let fatal = match err {
            Some(_) => self.config.synch_failure == SynchFailure::Fatal,
            None => self.config.synch_loop_fatal,
        };
        if fatal {
            Err(err.unwrap_or_else(|| {
                Error::new(
                    ErrorKind::TimedOut,
                    format!("thread {} never reached a safe point", rec.tid),
                )
            }))
        } else {
            warn!(
                "giving up on thread {} ({})",
                rec.tid,
                err.map(|e| e.to_string())
                    .unwrap_or_else(|| "loop bound exhausted".into())
            );
            Ok(SynchOutcome::Exhausted)
        }
    }

    /// release a target this initiator synched. The count goes back
    /// down; the thread only actually resumes on the 1 -> 0 edge.
    pub fn release_thread(&self, rec: &Arc<ThreadRecord>) -> Result<()> {
        if rec.dec_suspend() == 0 {
            self.os.resume(rec.tid)?;
        }
        Ok(())
    }
}

/// the set of threads a whole-process synch managed to stop. Must be
/// handed back to `end_synch_with_all_threads`; dropping it would leave
/// the process wedged.
pub struct SynchSet {
    pub synched: Vec<(Arc<ThreadRecord>, MachineContext)>,
    /// targets skipped under the ignore policy
    pub skipped: Vec<Arc<ThreadRecord>>,
}

/// stop every thread except `self_tid` at a safe point.
///
/// Per-target failures follow the configured policy: under `Ignore` the
/// target is skipped and the rest of the set still synchs; under
/// `Fatal` every already-stopped target is released before the error
/// propagates.
pub fn synch_with_all_threads(
    ctl: &SynchCtl<'_>,
    threads: &[Arc<ThreadRecord>],
    self_tid: nix::unistd::Pid,
    need: SynchPerm,
) -> Result<SynchSet> {
    let mut set = SynchSet {
        synched: Vec::new(),
        skipped: Vec::new(),
    };
    for rec in threads {
        if rec.tid == self_tid {
            continue;
        }
        match ctl.synch_with_thread(rec, need, false) {
            Ok(SynchOutcome::Synched(ctx)) => set.synched.push((rec.clone(), ctx)),
            Ok(SynchOutcome::Exhausted) => set.skipped.push(rec.clone()),
            Ok(SynchOutcome::Gone) => {
                debug!("thread {} gone during all-thread synch", rec.tid);
            }
            Err(e) => {
                end_synch_with_all_threads(ctl, set, true)?;
                return Err(e);
            }
        }
    }
    Ok(set)
}

/// release (or deliberately keep suspended) a whole-process synch set.
/// Exiting threads are left suspended either way so teardown never
/// races their release.
pub fn end_synch_with_all_threads(
    ctl: &SynchCtl<'_>,
    set: SynchSet,
    resume: bool,
) -> Result<()> {
    for (rec, _ctx) in set.synched {
        if rec.is_exiting() {
            continue;
        }
        if resume {
            ctl.release_thread(&rec)?;
        }
    }
    Ok(())
}
