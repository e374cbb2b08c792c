//! per-OS-build raw syscall number tables
//!
//! Raw numbers are not stable across OS builds, so one binary carries one
//! column per supported build. Every column has exactly `NR_SYSCALLS`
//! entries; builds that lack a syscall carry `NOT_PRESENT` in that slot.

use crate::nr::{Sysno, NR_SYSCALLS};

/// slot filler for builds that do not implement a syscall.
pub const NOT_PRESENT: i32 = -1;

/// number of raw-number columns carried per entry.
pub const NR_BUILDS: usize = 6;

/// supported OS builds, newest first. The `number` is the build's
/// version tag used for nearest-match fallback.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum OsBuild {
    VistaSp1,
    Vista,
    Win2k3,
    WinXp,
    Win2k,
    Nt4,
}

pub const BUILD_ORDER: [OsBuild; NR_BUILDS] = [
    OsBuild::VistaSp1,
    OsBuild::Vista,
    OsBuild::Win2k3,
    OsBuild::WinXp,
    OsBuild::Win2k,
    OsBuild::Nt4,
];

impl OsBuild {
    pub fn number(self) -> u32 {
        match self {
            OsBuild::VistaSp1 => 601,
            OsBuild::Vista => 600,
            OsBuild::Win2k3 => 502,
            OsBuild::WinXp => 501,
            OsBuild::Win2k => 500,
            OsBuild::Nt4 => 400,
        }
    }

    pub fn column(self) -> usize {
        BUILD_ORDER.iter().position(|b| *b == self).unwrap()
    }

    /// map a detected build number to a table column; `None` means no
    /// exact match and the caller should fall back to the nearest build.
    pub fn from_number(n: u32) -> Option<OsBuild> {
        BUILD_ORDER.iter().cloned().find(|b| b.number() == n)
    }

    /// nearest supported build by version-tag distance, used for the
    /// degraded best-effort catalog on unknown builds.
    pub fn nearest(n: u32) -> OsBuild {
        let mut best = BUILD_ORDER[0];
        let mut best_dist = u32::max_value();
        for b in BUILD_ORDER.iter() {
            let d = if b.number() > n {
                b.number() - n
            } else {
                n - b.number()
            };
            if d < best_dist {
                best_dist = d;
                best = *b;
            }
        }
        best
    }
}

/// one catalog row: canonical id, argument shape, mediation flag and the
/// raw number for each supported build (ordered as `BUILD_ORDER`).
#[derive(Debug, Copy, Clone)]
pub struct SyscallEntry {
    pub sysno: Sysno,
    /// declared argument count (64-bit convention)
    pub nargs: usize,
    /// argument block size in bytes on 32-bit
    pub arg_bytes32: usize,
    /// does the mediation layer need to act on this syscall?
    pub mediated: bool,
    pub numbers: [i32; NR_BUILDS],
}

#[rustfmt::skip]
pub static SYSCALL_TABLE: [SyscallEntry; NR_SYSCALLS] = [
    SyscallEntry { sysno: Sysno::Continue,              nargs:  2, arg_bytes32: 0x08, mediated: true,  numbers: [0x037, 0x037, 0x022, 0x020, 0x01c, 0x013] },
    SyscallEntry { sysno: Sysno::CallbackReturn,        nargs:  3, arg_bytes32: 0x0c, mediated: true,  numbers: [0x02b, 0x02b, 0x016, 0x014, 0x013, 0x00b] },
    SyscallEntry { sysno: Sysno::SetContextThread,      nargs:  2, arg_bytes32: 0x08, mediated: true,  numbers: [0x121, 0x125, 0x0dd, 0x0d5, 0x0ba, 0x099] },
    SyscallEntry { sysno: Sysno::GetContextThread,      nargs:  2, arg_bytes32: 0x08, mediated: true,  numbers: [0x097, 0x097, 0x059, 0x055, 0x049, 0x03c] },
    SyscallEntry { sysno: Sysno::CreateProcess,         nargs:  8, arg_bytes32: 0x20, mediated: true,  numbers: [0x048, 0x048, 0x031, 0x02f, 0x029, 0x01f] },
    SyscallEntry { sysno: Sysno::CreateProcessEx,       nargs:  9, arg_bytes32: 0x24, mediated: true,  numbers: [0x049, 0x049, 0x032, 0x030, NOT_PRESENT, NOT_PRESENT] },
    SyscallEntry { sysno: Sysno::CreateUserProcess,     nargs: 11, arg_bytes32: 0x2c, mediated: true,  numbers: [0x17f, 0x185, NOT_PRESENT, NOT_PRESENT, NOT_PRESENT, NOT_PRESENT] },
    SyscallEntry { sysno: Sysno::TerminateProcess,      nargs:  2, arg_bytes32: 0x08, mediated: true,  numbers: [0x14e, 0x152, 0x10a, 0x101, 0x0e0, 0x0bb] },
    SyscallEntry { sysno: Sysno::CreateThread,          nargs:  8, arg_bytes32: 0x20, mediated: true,  numbers: [0x04e, 0x04e, 0x037, 0x035, 0x02e, 0x024] },
    SyscallEntry { sysno: Sysno::CreateThreadEx,        nargs: 11, arg_bytes32: 0x2c, mediated: true,  numbers: [0x17e, 0x184, NOT_PRESENT, NOT_PRESENT, NOT_PRESENT, NOT_PRESENT] },
    SyscallEntry { sysno: Sysno::TerminateThread,       nargs:  2, arg_bytes32: 0x08, mediated: true,  numbers: [0x14f, 0x153, 0x10b, 0x102, 0x0e1, 0x0bc] },
    SyscallEntry { sysno: Sysno::SuspendThread,         nargs:  2, arg_bytes32: 0x08, mediated: true,  numbers: [0x14b, 0x14f, 0x107, 0x0fe, 0x0dd, 0x0b9] },
    SyscallEntry { sysno: Sysno::ResumeThread,          nargs:  2, arg_bytes32: 0x08, mediated: true,  numbers: [0x11a, 0x119, 0x0d6, 0x0ce, 0x0b5, 0x096] },
    SyscallEntry { sysno: Sysno::OpenThread,            nargs:  4, arg_bytes32: 0x10, mediated: true,  numbers: [0x0c2, 0x0c2, 0x0a3, 0x080, 0x06a, 0x059] },
    SyscallEntry { sysno: Sysno::AllocateVirtualMemory, nargs:  6, arg_bytes32: 0x18, mediated: true,  numbers: [0x012, 0x012, 0x012, 0x011, 0x010, 0x00a] },
    SyscallEntry { sysno: Sysno::FreeVirtualMemory,     nargs:  4, arg_bytes32: 0x10, mediated: true,  numbers: [0x093, 0x093, 0x057, 0x053, 0x047, 0x03a] },
    SyscallEntry { sysno: Sysno::ProtectVirtualMemory,  nargs:  5, arg_bytes32: 0x14, mediated: true,  numbers: [0x0d2, 0x0d2, 0x08f, 0x089, 0x077, 0x060] },
    SyscallEntry { sysno: Sysno::QueryVirtualMemory,    nargs:  6, arg_bytes32: 0x18, mediated: true,  numbers: [0x0fd, 0x0fd, 0x0ba, 0x0b2, 0x09c, 0x081] },
    SyscallEntry { sysno: Sysno::WriteVirtualMemory,    nargs:  5, arg_bytes32: 0x14, mediated: true,  numbers: [0x166, 0x16a, 0x11f, 0x115, 0x0f0, 0x0cb] },
    SyscallEntry { sysno: Sysno::CreateSection,         nargs:  7, arg_bytes32: 0x1c, mediated: true,  numbers: [0x04b, 0x04b, 0x034, 0x032, 0x02b, 0x021] },
    SyscallEntry { sysno: Sysno::OpenSection,           nargs:  3, arg_bytes32: 0x0c, mediated: true,  numbers: [0x0c5, 0x0c5, 0x083, 0x07d, 0x06c, 0x056] },
    SyscallEntry { sysno: Sysno::MapViewOfSection,      nargs: 10, arg_bytes32: 0x28, mediated: true,  numbers: [0x0b1, 0x0b1, 0x071, 0x06c, 0x05d, 0x049] },
    SyscallEntry { sysno: Sysno::UnmapViewOfSection,    nargs:  2, arg_bytes32: 0x08, mediated: true,  numbers: [0x15c, 0x160, 0x115, 0x10b, 0x0e7, 0x0c2] },
    SyscallEntry { sysno: Sysno::FlushInstructionCache, nargs:  3, arg_bytes32: 0x0c, mediated: true,  numbers: [0x08d, 0x08d, 0x052, 0x04e, 0x042, 0x036] },
    SyscallEntry { sysno: Sysno::Close,                 nargs:  1, arg_bytes32: 0x04, mediated: true,  numbers: [0x030, 0x02f, 0x01b, 0x019, 0x018, 0x00f] },
    SyscallEntry { sysno: Sysno::DuplicateObject,       nargs:  7, arg_bytes32: 0x1c, mediated: true,  numbers: [0x081, 0x081, 0x047, 0x044, 0x03a, 0x02f] },
    SyscallEntry { sysno: Sysno::TestAlert,             nargs:  0, arg_bytes32: 0x00, mediated: false, numbers: [0x150, 0x154, 0x10c, 0x103, 0x0e2, 0x0bd] },
    SyscallEntry { sysno: Sysno::RaiseException,        nargs:  3, arg_bytes32: 0x0c, mediated: false, numbers: [0x100, 0x100, 0x0bd, 0x0b5, 0x09f, 0x084] },
    SyscallEntry { sysno: Sysno::CreateFile,            nargs: 11, arg_bytes32: 0x2c, mediated: false, numbers: [0x03c, 0x03c, 0x027, 0x025, 0x020, 0x017] },
    SyscallEntry { sysno: Sysno::OpenFile,              nargs:  6, arg_bytes32: 0x18, mediated: false, numbers: [0x0ba, 0x0ba, 0x07a, 0x074, 0x064, 0x04f] },
];

/// table self-consistency: row order matches canonical ids. The equal
/// column length across builds is enforced by the array type itself.
pub fn table_is_consistent() -> bool {
    SYSCALL_TABLE
        .iter()
        .enumerate()
        .all(|(i, e)| e.sysno.index() == i)
}
