//! syscall argument access
//!
//! Computes the in-memory argument block base for the active calling
//! convention and reads/writes individual arguments by index, whether
//! they live in registers or on the stack.

use std::io::{Error, ErrorKind, Result};

use sysgate_common::consts::{MAX_SYSCALL_ARGS, NR_REG_ARGS};

use crate::context::MachineContext;
use crate::remote::{GuestMemory, GuestMemoryExt, RemotePtr};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Abi {
    /// first `NR_REG_ARGS` arguments in registers, the rest on the
    /// stack past the return address and shadow area
    X64,
    /// full argument block on the stack past the return address,
    /// 4 bytes per slot
    X86,
}

/// where the in-memory part of the argument block starts.
pub fn param_base(ctx: &MachineContext, abi: Abi) -> u64 {
    match abi {
        Abi::X64 => ctx.sp.wrapping_add(0x28),
        Abi::X86 => ctx.sp.wrapping_add(4),
    }
}

/// register-resident arguments saved at trap time, so post handlers see
/// pre-execution values even after the kernel clobbers registers.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SyscallArgs {
    args: [u64; MAX_SYSCALL_ARGS],
    nargs: usize,
}

impl SyscallArgs {
    pub fn new(nargs: usize) -> SyscallArgs {
        SyscallArgs {
            args: [0; MAX_SYSCALL_ARGS],
            nargs,
        }
    }

    pub fn from_slice(vals: &[u64]) -> SyscallArgs {
        let mut a = SyscallArgs::new(vals.len());
        a.args[..vals.len()].copy_from_slice(vals);
        a
    }

    pub fn nargs(&self) -> usize {
        self.nargs
    }

    pub fn get(&self, i: usize) -> Result<u64> {
        if i >= self.nargs {
            return Err(arg_index_error(i, self.nargs));
        }
        Ok(self.args[i])
    }

    pub fn set(&mut self, i: usize, v: u64) -> Result<()> {
        if i >= self.nargs {
            return Err(arg_index_error(i, self.nargs));
        }
        self.args[i] = v;
        Ok(())
    }
}

fn arg_index_error(i: usize, nargs: usize) -> Error {
    Error::new(
        ErrorKind::InvalidInput,
        format!("syscall argument index {} out of range (nargs {})", i, nargs),
    )
}

/// live view over a trapped syscall's arguments: register slots come
/// from the machine context, stack slots from guest memory.
pub struct ParamView<'a> {
    mem: &'a dyn GuestMemory,
    ctx: &'a mut MachineContext,
    abi: Abi,
    nargs: usize,
    base: u64,
}

impl<'a> ParamView<'a> {
    pub fn new(
        mem: &'a dyn GuestMemory,
        ctx: &'a mut MachineContext,
        abi: Abi,
        nargs: usize,
    ) -> ParamView<'a> {
        let base = param_base(ctx, abi);
        ParamView {
            mem,
            ctx,
            abi,
            nargs,
            base,
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn nargs(&self) -> usize {
        self.nargs
    }

    pub fn ctx(&self) -> &MachineContext {
        self.ctx
    }

    pub fn ctx_mut(&mut self) -> &mut MachineContext {
        self.ctx
    }

    fn stack_slot(&self, i: usize) -> Result<RemotePtr<u8>> {
        let addr = match self.abi {
            Abi::X64 => self.base + ((i - NR_REG_ARGS) as u64) * 8,
            Abi::X86 => self.base + (i as u64) * 4,
        };
        RemotePtr::from_addr(addr).ok_or_else(|| {
            Error::new(ErrorKind::InvalidInput, "null argument block base")
        })
    }

    pub fn get(&self, i: usize) -> Result<u64> {
        if i >= self.nargs {
            return Err(arg_index_error(i, self.nargs));
        }
        match self.abi {
            Abi::X64 if i < NR_REG_ARGS => Ok(self.ctx.args[i]),
            Abi::X64 => self.mem.peek(self.stack_slot(i)?.cast::<u64>()),
            Abi::X86 => {
                let v: u32 = self.mem.peek(self.stack_slot(i)?.cast::<u32>())?;
                Ok(v as u64)
            }
        }
    }

    pub fn set(&mut self, i: usize, v: u64) -> Result<()> {
        if i >= self.nargs {
            return Err(arg_index_error(i, self.nargs));
        }
        match self.abi {
            Abi::X64 if i < NR_REG_ARGS => {
                self.ctx.args[i] = v;
                Ok(())
            }
            Abi::X64 => self.mem.poke(self.stack_slot(i)?.cast::<u64>(), &v),
            Abi::X86 => self
                .mem
                .poke(self.stack_slot(i)?.cast::<u32>(), &(v as u32)),
        }
    }

    /// snapshot every declared argument.
    pub fn saved(&self) -> Result<SyscallArgs> {
        let mut out = SyscallArgs::new(self.nargs);
        for i in 0..self.nargs {
            out.set(i, self.get(i)?)?;
        }
        Ok(out)
    }
}
