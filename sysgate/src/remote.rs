//! access to application-owned memory
//!
//! All reads and writes of argument blocks, output parameters and patch
//! sites go through `GuestMemory`. In production the guest is the
//! application's own address space; tests substitute a simulated one.

use std::io::Result;
use std::ptr::NonNull;

/// a pointer into the application's address space
#[derive(Debug, PartialEq, Eq)]
pub struct RemotePtr<T> {
    ptr: NonNull<T>,
}

impl<T> RemotePtr<T>
where
    T: Sized,
{
    pub fn new(ptr: *mut T) -> Option<Self> {
        NonNull::new(ptr).map(|nll| RemotePtr { ptr: nll })
    }

    /// build from a register-sized address as it arrives at trap time.
    pub fn from_addr(addr: u64) -> Option<Self> {
        RemotePtr::new(addr as *mut T)
    }

    pub fn as_ptr(self) -> *mut T {
        self.ptr.as_ptr()
    }

    pub fn addr(self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    pub fn cast<U>(self) -> RemotePtr<U> {
        RemotePtr {
            ptr: self.ptr.cast(),
        }
    }

    pub unsafe fn offset(self, count: isize) -> Self {
        RemotePtr {
            ptr: NonNull::new(self.ptr.as_ptr().offset(count)).unwrap(),
        }
    }
}

impl<T> Clone for RemotePtr<T> {
    fn clone(&self) -> Self {
        RemotePtr { ptr: self.ptr }
    }
}

impl<T: Sized> Copy for RemotePtr<T> {}

/// byte-level guest access. Object safe; typed helpers live in
/// `GuestMemoryExt`.
pub trait GuestMemory: Send + Sync {
    fn peek_bytes(&self, addr: RemotePtr<u8>, size: usize) -> Result<Vec<u8>>;
    fn poke_bytes(&self, addr: RemotePtr<u8>, bytes: &[u8]) -> Result<()>;
}

pub trait GuestMemoryExt: GuestMemory {
    fn peek<T>(&self, addr: RemotePtr<T>) -> Result<T>
    where
        T: Sized,
    {
        let size = std::mem::size_of::<T>();
        let bytes = self.peek_bytes(addr.cast::<u8>(), size)?;
        // initialized by copy_nonoverlapping
        let mut res = std::mem::MaybeUninit::<T>::uninit();
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), res.as_mut_ptr() as *mut u8, size)
        };
        Ok(unsafe { res.assume_init() })
    }

    fn poke<T>(&self, addr: RemotePtr<T>, value: &T) -> Result<()>
    where
        T: Sized,
    {
        let value_ptr: *const T = value;
        let size = std::mem::size_of::<T>();
        let bytes: &[u8] =
            unsafe { std::slice::from_raw_parts(value_ptr as *const u8, size) };
        self.poke_bytes(addr.cast::<u8>(), bytes)
    }
}

impl<M: GuestMemory + ?Sized> GuestMemoryExt for M {}

/// in-process guest: the mediation layer runs on the application's own
/// threads, so plain loads and stores reach application memory.
pub struct LocalMemory;

impl GuestMemory for LocalMemory {
    fn peek_bytes(&self, addr: RemotePtr<u8>, size: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; size];
        unsafe {
            std::ptr::copy_nonoverlapping(addr.as_ptr() as *const u8, buf.as_mut_ptr(), size)
        };
        Ok(buf)
    }

    fn poke_bytes(&self, addr: RemotePtr<u8>, bytes: &[u8]) -> Result<()> {
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr.as_ptr(), bytes.len())
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_ptr_rejects_null() {
        assert!(RemotePtr::<u8>::from_addr(0).is_none());
        let p = RemotePtr::<u64>::from_addr(0x1000).unwrap();
        assert_eq!(p.addr(), 0x1000);
        assert_eq!(p.cast::<u8>().addr(), 0x1000);
    }

    #[test]
    fn local_memory_round_trip() {
        let mem = LocalMemory;
        let mut slot: u64 = 0;
        let ptr = RemotePtr::new(&mut slot as *mut u64).unwrap();
        mem.poke(ptr, &0xdead_beefu64).unwrap();
        assert_eq!(slot, 0xdead_beef);
        assert_eq!(mem.peek(ptr).unwrap(), 0xdead_beef);
    }
}
