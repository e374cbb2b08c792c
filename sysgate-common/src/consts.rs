//! process-wide constants

pub const PAGE_SIZE: u64 = 0x1000;
pub const PAGE_MASK: u64 = !(PAGE_SIZE - 1);

/// upper bound on declared syscall argument count, catalog included
/// extras.
pub const MAX_SYSCALL_ARGS: usize = 16;

/// register-resident argument slots on the 64-bit convention.
pub const NR_REG_ARGS: usize = 4;

/// default bound for the suspend-and-wait poll loop; iteration based,
/// never time based.
pub const SYNCH_MAX_LOOPS_DEFAULT: u64 = 10_000;

/// divisor applied for callers that must not stall (small-loop variant).
pub const SYNCH_SMALL_LOOP_DIVISOR: u64 = 10;

/// sleep between safe-point polls, microseconds.
pub const SYNCH_POLL_INTERVAL_US: u64 = 50;

/// size of the jump patch written at a hooked wrapper entry.
pub const TRAMPOLINE_PATCH_LEN: usize = 5;

/// environment variable carrying serialized engine options into a
/// followed child process.
pub const CHILD_OPTIONS_VAR: &str = "SYSGATE_OPTIONS";

pub fn page_align_down(addr: u64) -> u64 {
    addr & PAGE_MASK
}

pub fn page_align_up(addr: u64) -> u64 {
    (addr + PAGE_SIZE - 1) & PAGE_MASK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_alignment() {
        assert_eq!(page_align_down(0x1fff), 0x1000);
        assert_eq!(page_align_up(0x1001), 0x2000);
        assert_eq!(page_align_up(0x1000), 0x1000);
        assert_eq!(page_align_down(0x1000), 0x1000);
    }
}
