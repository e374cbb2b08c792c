//! versioned syscall catalog: canonical ids, per-OS-build raw numbers,
//! argument shapes and mediation flags.

pub mod catalog;
pub mod nr;
pub mod status;
pub mod tables;

pub use self::catalog::{ExtraSyscall, SyscallCatalog};
pub use self::nr::Sysno;
pub use self::nr::NR_SYSCALLS;
pub use self::nr::Sysno::*;
pub use self::status::*;
pub use self::tables::{OsBuild, SyscallEntry, NOT_PRESENT};
