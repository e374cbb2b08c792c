//! process-wide mediation statistics

use std::sync::atomic::AtomicUsize;
use std::sync::Mutex;

/// counters bumped along the mediation fast path.
#[derive(Debug, Default)]
pub struct MediationStats {
    /// syscalls observed at trap time
    pub nr_syscalls: AtomicUsize,
    /// syscalls routed to a semantic pre handler
    pub nr_mediated: AtomicUsize,
    /// syscalls vetoed or fully emulated by a pre handler
    pub nr_skipped: AtomicUsize,
    /// syscalls whose arguments were rewritten in place
    pub nr_rewritten: AtomicUsize,
    /// native trampoline hits, total
    pub nr_trampoline_hits: AtomicUsize,
    /// trampoline hits allowed to run natively
    pub nr_trampoline_native: AtomicUsize,
    /// trampoline hits that re-took control of the thread
    pub nr_trampoline_retakeover: AtomicUsize,
    /// suspend-and-wait loop retries
    pub nr_synch_retries: AtomicUsize,
    /// targets given up on per failure policy
    pub nr_synch_failures: AtomicUsize,
    /// child processes injected into
    pub nr_children_followed: AtomicUsize,
    /// pre-handler failure predictions confirmed by the kernel
    pub nr_predicted_failures: AtomicUsize,
}

impl MediationStats {
    pub fn new() -> Self {
        MediationStats::default()
    }
}

#[derive(Debug, Default)]
pub struct SysgateState {
    pub stats: MediationStats,
}

impl SysgateState {
    pub fn new() -> Self {
        SysgateState {
            stats: MediationStats::new(),
        }
    }
}

lazy_static! {
    static ref SYSGATE_GLOBAL_STATE: Mutex<SysgateState> = Mutex::new(SysgateState::new());
}

/// global mediation state, protected by mutex.
pub fn sysgate_global_state() -> &'static Mutex<SysgateState> {
    &SYSGATE_GLOBAL_STATE
}

/// bump a counter on the global stats block.
#[macro_export]
macro_rules! stats_inc {
    ($field:ident) => {
        if let Ok(st) = $crate::state::sysgate_global_state().lock() {
            st.stats
                .$field
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    };
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    #[test]
    fn stats_inc_bumps_counter() {
        let before = {
            let st = super::sysgate_global_state().lock().unwrap();
            st.stats.nr_syscalls.load(Ordering::Relaxed)
        };
        stats_inc!(nr_syscalls);
        let after = {
            let st = super::sysgate_global_state().lock().unwrap();
            st.stats.nr_syscalls.load(Ordering::Relaxed)
        };
        assert_eq!(after, before + 1);
    }
}
