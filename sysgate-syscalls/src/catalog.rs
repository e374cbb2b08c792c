//! catalog built once at init from the table matching the detected OS
//! build, plus a small set of plugin-registered extra syscalls.

use std::collections::HashMap;
use std::io::{Error, ErrorKind, Result};

use log::{debug, warn};

use crate::nr::{Sysno, ALL_SYSNOS, NR_SYSCALLS};
use crate::tables::{OsBuild, NOT_PRESENT, SYSCALL_TABLE};

/// a syscall registered by a plugin at init time, outside the built-in
/// canonical set. Observed (counted, passed through) but not given a
/// semantic handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraSyscall {
    pub name: String,
    pub raw: i32,
    pub nargs: usize,
}

#[derive(Debug)]
pub struct SyscallCatalog {
    build: OsBuild,
    /// true when the detected build had no exact table and the nearest
    /// one was substituted (best effort).
    degraded: bool,
    raw: [i32; NR_SYSCALLS],
    reverse: HashMap<i32, Sysno>,
    extras: Vec<ExtraSyscall>,
    extras_by_raw: HashMap<i32, usize>,
    sealed: bool,
}

impl SyscallCatalog {
    /// build the catalog for a detected OS build number. Unknown builds
    /// select the nearest table and mark the catalog degraded; refusal
    /// to run is reserved for table corruption.
    pub fn for_build_number(n: u32) -> Result<SyscallCatalog> {
        if !crate::tables::table_is_consistent() {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "syscall table rows out of canonical order",
            ));
        }
        let (build, degraded) = match OsBuild::from_number(n) {
            Some(b) => (b, false),
            None => {
                let b = OsBuild::nearest(n);
                warn!(
                    "unsupported OS build {}, using nearest table {:?} (best effort)",
                    n, b
                );
                (b, true)
            }
        };
        Ok(SyscallCatalog::for_build(build, degraded))
    }

    pub fn for_build(build: OsBuild, degraded: bool) -> SyscallCatalog {
        let col = build.column();
        let mut raw = [NOT_PRESENT; NR_SYSCALLS];
        let mut reverse = HashMap::new();
        for entry in SYSCALL_TABLE.iter() {
            let n = entry.numbers[col];
            raw[entry.sysno.index()] = n;
            if n != NOT_PRESENT {
                reverse.insert(n, entry.sysno);
            }
        }
        debug!("syscall catalog built for {:?} (degraded: {})", build, degraded);
        SyscallCatalog {
            build,
            degraded,
            raw,
            reverse,
            extras: Vec::new(),
            extras_by_raw: HashMap::new(),
            sealed: false,
        }
    }

    pub fn build(&self) -> OsBuild {
        self.build
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// canonical id -> raw number for this build, `None` when the build
    /// does not implement the syscall.
    pub fn lookup(&self, sysno: Sysno) -> Option<i32> {
        let n = self.raw[sysno.index()];
        if n == NOT_PRESENT {
            None
        } else {
            Some(n)
        }
    }

    /// raw number -> canonical id (hashed reverse lookup).
    pub fn reverse(&self, raw: i32) -> Option<Sysno> {
        self.reverse.get(&raw).cloned()
    }

    pub fn requires_mediation(&self, sysno: Sysno) -> bool {
        SYSCALL_TABLE[sysno.index()].mediated
    }

    pub fn nargs(&self, sysno: Sysno) -> usize {
        SYSCALL_TABLE[sysno.index()].nargs
    }

    pub fn arg_bytes32(&self, sysno: Sysno) -> usize {
        SYSCALL_TABLE[sysno.index()].arg_bytes32
    }

    /// register an extra syscall for observation. Only allowed before
    /// `finish_init`; the raw number must not collide with the built-in
    /// set for this build.
    pub fn register_extra(&mut self, name: &str, raw: i32, nargs: usize) -> Result<()> {
        if self.sealed {
            return Err(Error::new(
                ErrorKind::PermissionDenied,
                "syscall registration after init is not allowed",
            ));
        }
        if self.reverse.contains_key(&raw) || self.extras_by_raw.contains_key(&raw) {
            return Err(Error::new(
                ErrorKind::AlreadyExists,
                format!("raw syscall number {:#x} already cataloged", raw),
            ));
        }
        debug!("extra syscall registered: {} raw={:#x} nargs={}", name, raw, nargs);
        self.extras_by_raw.insert(raw, self.extras.len());
        self.extras.push(ExtraSyscall {
            name: name.to_string(),
            raw,
            nargs,
        });
        Ok(())
    }

    /// seal the catalog; no further registration is accepted.
    pub fn finish_init(&mut self) {
        self.sealed = true;
    }

    pub fn extra_for_raw(&self, raw: i32) -> Option<&ExtraSyscall> {
        self.extras_by_raw.get(&raw).map(|i| &self.extras[*i])
    }

    /// iterate canonical ids implemented by this build.
    pub fn implemented(&self) -> impl Iterator<Item = Sysno> + '_ {
        ALL_SYSNOS
            .iter()
            .cloned()
            .filter(move |s| self.raw[s.index()] != NOT_PRESENT)
    }
}
