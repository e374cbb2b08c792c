//! machine context as the mediation layer sees it
//!
//! The context is tagged with a `Flavor` so translation can tell a raw
//! capture (possibly mid-code-cache) from application-logical state.
//! Raw-bytes interop with OS context blobs is confined to the `abi`
//! adapter at the bottom of this module.

use std::io::{Error, ErrorKind, Result};

use sysgate_common::consts::NR_REG_ARGS;

/// raw capture vs application-logical state.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Flavor {
    Raw,
    Translated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineContext {
    pub flavor: Flavor,
    pub pc: u64,
    pub sp: u64,
    pub fp: u64,
    /// syscall-number register as captured at trap time
    pub sysreg: u64,
    /// return-value register; the status lands here after the syscall
    pub retval: u64,
    pub flags: u64,
    /// register-resident syscall arguments
    pub args: [u64; NR_REG_ARGS],
}

impl MachineContext {
    pub fn new() -> MachineContext {
        MachineContext {
            flavor: Flavor::Raw,
            pc: 0,
            sp: 0,
            fp: 0,
            sysreg: 0,
            retval: 0,
            flags: 0,
            args: [0; NR_REG_ARGS],
        }
    }

    pub fn is_translated(&self) -> bool {
        self.flavor == Flavor::Translated
    }
}

impl Default for MachineContext {
    fn default() -> Self {
        MachineContext::new()
    }
}

/// raw-bytes ABI adapter
///
/// Fixed little-endian layout, version-tagged so a blob from a different
/// engine build is rejected instead of misread:
///   u32 magic/version, u32 reserved, then pc, sp, fp, sysreg, retval,
///   flags, args[NR_REG_ARGS], each u64.
pub mod abi {
    use super::*;

    pub const CONTEXT_MAGIC_V1: u32 = 0x5347_0001;
    pub const CONTEXT_RAW_LEN: usize = 8 + 8 * (6 + NR_REG_ARGS);

    fn read_u64(b: &[u8], off: usize) -> u64 {
        let mut v = [0u8; 8];
        v.copy_from_slice(&b[off..off + 8]);
        u64::from_le_bytes(v)
    }

    fn write_u64(b: &mut [u8], off: usize, v: u64) {
        b[off..off + 8].copy_from_slice(&v.to_le_bytes());
    }

    pub fn from_raw_bytes(bytes: &[u8]) -> Result<MachineContext> {
        if bytes.len() < CONTEXT_RAW_LEN {
            return Err(Error::new(
                ErrorKind::UnexpectedEof,
                "context blob too short",
            ));
        }
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);
        if u32::from_le_bytes(magic) != CONTEXT_MAGIC_V1 {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "unknown context blob version",
            ));
        }
        let mut ctx = MachineContext::new();
        ctx.pc = read_u64(bytes, 8);
        ctx.sp = read_u64(bytes, 16);
        ctx.fp = read_u64(bytes, 24);
        ctx.sysreg = read_u64(bytes, 32);
        ctx.retval = read_u64(bytes, 40);
        ctx.flags = read_u64(bytes, 48);
        for i in 0..NR_REG_ARGS {
            ctx.args[i] = read_u64(bytes, 56 + i * 8);
        }
        Ok(ctx)
    }

    /// serialize without the flavor tag: blobs exchanged with the
    /// application are always raw-shaped.
    pub fn to_raw_bytes(ctx: &MachineContext) -> [u8; CONTEXT_RAW_LEN] {
        let mut out = [0u8; CONTEXT_RAW_LEN];
        out[0..4].copy_from_slice(&CONTEXT_MAGIC_V1.to_le_bytes());
        write_u64(&mut out, 8, ctx.pc);
        write_u64(&mut out, 16, ctx.sp);
        write_u64(&mut out, 24, ctx.fp);
        write_u64(&mut out, 32, ctx.sysreg);
        write_u64(&mut out, 40, ctx.retval);
        write_u64(&mut out, 48, ctx.flags);
        for i in 0..NR_REG_ARGS {
            write_u64(&mut out, 56 + i * 8, ctx.args[i]);
        }
        out
    }
}
