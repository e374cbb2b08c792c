//! canonical syscall ids
//!
//! The canonical id is stable across OS builds; the raw number the kernel
//! expects is resolved through the per-build tables in `tables`.

use core::fmt;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum Sysno {
    Continue = 0,
    CallbackReturn,
    SetContextThread,
    GetContextThread,
    CreateProcess,
    CreateProcessEx,
    CreateUserProcess,
    TerminateProcess,
    CreateThread,
    CreateThreadEx,
    TerminateThread,
    SuspendThread,
    ResumeThread,
    OpenThread,
    AllocateVirtualMemory,
    FreeVirtualMemory,
    ProtectVirtualMemory,
    QueryVirtualMemory,
    WriteVirtualMemory,
    CreateSection,
    OpenSection,
    MapViewOfSection,
    UnmapViewOfSection,
    FlushInstructionCache,
    Close,
    DuplicateObject,
    TestAlert,
    RaiseException,
    CreateFile,
    OpenFile,
}

/// number of canonical ids; indexes the dispatch tables and the raw
/// number columns.
pub const NR_SYSCALLS: usize = 30;

impl Sysno {
    pub const COUNT: usize = NR_SYSCALLS;

    pub fn from_u32(n: u32) -> Option<Sysno> {
        if (n as usize) < NR_SYSCALLS {
            Some(ALL_SYSNOS[n as usize])
        } else {
            None
        }
    }

    pub fn index(self) -> usize {
        self as u32 as usize
    }

    pub fn name(self) -> &'static str {
        SYSNO_NAMES[self.index()]
    }
}

impl fmt::Display for Sysno {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

pub const ALL_SYSNOS: [Sysno; NR_SYSCALLS] = [
    Sysno::Continue,
    Sysno::CallbackReturn,
    Sysno::SetContextThread,
    Sysno::GetContextThread,
    Sysno::CreateProcess,
    Sysno::CreateProcessEx,
    Sysno::CreateUserProcess,
    Sysno::TerminateProcess,
    Sysno::CreateThread,
    Sysno::CreateThreadEx,
    Sysno::TerminateThread,
    Sysno::SuspendThread,
    Sysno::ResumeThread,
    Sysno::OpenThread,
    Sysno::AllocateVirtualMemory,
    Sysno::FreeVirtualMemory,
    Sysno::ProtectVirtualMemory,
    Sysno::QueryVirtualMemory,
    Sysno::WriteVirtualMemory,
    Sysno::CreateSection,
    Sysno::OpenSection,
    Sysno::MapViewOfSection,
    Sysno::UnmapViewOfSection,
    Sysno::FlushInstructionCache,
    Sysno::Close,
    Sysno::DuplicateObject,
    Sysno::TestAlert,
    Sysno::RaiseException,
    Sysno::CreateFile,
    Sysno::OpenFile,
];

const SYSNO_NAMES: [&str; NR_SYSCALLS] = [
    "Continue",
    "CallbackReturn",
    "SetContextThread",
    "GetContextThread",
    "CreateProcess",
    "CreateProcessEx",
    "CreateUserProcess",
    "TerminateProcess",
    "CreateThread",
    "CreateThreadEx",
    "TerminateThread",
    "SuspendThread",
    "ResumeThread",
    "OpenThread",
    "AllocateVirtualMemory",
    "FreeVirtualMemory",
    "ProtectVirtualMemory",
    "QueryVirtualMemory",
    "WriteVirtualMemory",
    "CreateSection",
    "OpenSection",
    "MapViewOfSection",
    "UnmapViewOfSection",
    "FlushInstructionCache",
    "Close",
    "DuplicateObject",
    "TestAlert",
    "RaiseException",
    "CreateFile",
    "OpenFile",
];
