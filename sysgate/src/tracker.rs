//! interface to the external memory-region tracker
//!
//! The tracker keeps the engine's view of the application address space.
//! It provides its own internal locking; callers declare read or update
//! intent.

use core::fmt;

/// page protection, engine-canonical bits.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct Prot(pub u32);

impl Prot {
    pub const NONE: Prot = Prot(0);
    pub const READ: Prot = Prot(1);
    pub const WRITE: Prot = Prot(2);
    pub const EXEC: Prot = Prot(4);

    pub fn contains(self, other: Prot) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn with(self, other: Prot) -> Prot {
        Prot(self.0 | other.0)
    }

    pub fn without(self, other: Prot) -> Prot {
        Prot(self.0 & !other.0)
    }

    pub fn is_executable(self) -> bool {
        self.contains(Prot::EXEC)
    }

    pub fn is_writable(self) -> bool {
        self.contains(Prot::WRITE)
    }
}

impl std::ops::BitOr for Prot {
    type Output = Prot;
    fn bitor(self, rhs: Prot) -> Prot {
        self.with(rhs)
    }
}

impl fmt::Display for Prot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            if self.contains(Prot::READ) { "r" } else { "-" },
            if self.contains(Prot::WRITE) { "w" } else { "-" },
            if self.contains(Prot::EXEC) { "x" } else { "-" },
        )
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AccessIntent {
    Read,
    Update,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RegionInfo {
    pub base: u64,
    pub size: u64,
    pub prot: Prot,
}

pub trait MemoryTracker: Send + Sync {
    fn region_allocated(&self, base: u64, size: u64, prot: Prot);
    /// returns false when no tracked region covers `base`.
    fn region_freed(&self, base: u64, size: u64) -> bool;
    /// returns the previous protection, `None` when the region is
    /// untracked.
    fn region_protection_changed(&self, base: u64, size: u64, new_prot: Prot) -> Option<Prot>;
    fn region_mapped(&self, base: u64, size: u64, backing: &str);
    fn region_unmapped(&self, base: u64, size: u64);
    fn query_region(&self, addr: u64, intent: AccessIntent) -> Option<RegionInfo>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prot_bit_ops() {
        let rw = Prot::READ | Prot::WRITE;
        assert!(rw.contains(Prot::READ));
        assert!(!rw.is_executable());
        assert_eq!(rw.without(Prot::WRITE), Prot::READ);
        assert_eq!(format!("{}", rw), "rw-");
        assert_eq!(format!("{}", Prot::EXEC), "--x");
    }
}
