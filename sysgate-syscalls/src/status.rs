//! kernel status codes as seen in the syscall return register.
//!
//! Values are the 32-bit codes sign-extended to the register width, so
//! failure codes compare negative and `nt_success` is a sign test.

pub const STATUS_SUCCESS: i64 = 0;
pub const STATUS_PENDING: i64 = 0x103;

pub const STATUS_UNSUCCESSFUL: i64 = 0xC000_0001u32 as i32 as i64;
pub const STATUS_NOT_IMPLEMENTED: i64 = 0xC000_0002u32 as i32 as i64;
pub const STATUS_INVALID_HANDLE: i64 = 0xC000_0008u32 as i32 as i64;
pub const STATUS_INVALID_PARAMETER: i64 = 0xC000_000Du32 as i32 as i64;
pub const STATUS_CONFLICTING_ADDRESSES: i64 = 0xC000_0018u32 as i32 as i64;
pub const STATUS_UNABLE_TO_FREE_VM: i64 = 0xC000_001Au32 as i32 as i64;
pub const STATUS_ACCESS_DENIED: i64 = 0xC000_0022u32 as i32 as i64;
pub const STATUS_INVALID_PAGE_PROTECTION: i64 = 0xC000_0045u32 as i32 as i64;
pub const STATUS_THREAD_IS_TERMINATING: i64 = 0xC000_004Bu32 as i32 as i64;
pub const STATUS_MEMORY_NOT_ALLOCATED: i64 = 0xC000_00A0u32 as i32 as i64;
pub const STATUS_NOT_SUPPORTED: i64 = 0xC000_00BBu32 as i32 as i64;
pub const STATUS_PROCESS_IS_TERMINATING: i64 = 0xC000_010Au32 as i32 as i64;

/// success is non-negative, warnings included.
#[inline]
pub fn nt_success(status: i64) -> bool {
    status >= 0
}

/// split a raw syscall return into `Ok(value)` or `Err(status)`.
pub fn syscall_ret(ret: i64) -> Result<i64, i64> {
    if nt_success(ret) {
        Ok(ret)
    } else {
        Err(ret)
    }
}
