//! Raw, unsafe bindings used by the `fbclock` crate.
//!
//! This crate has two jobs, kept deliberately separate from anything that
//! knows how to interpret them safely:
//!
//! - the `ptp` module mirrors the kernel's `<linux/ptp_clock.h>` structures
//!   and the `PTP_SYS_OFFSET`/`PTP_SYS_OFFSET_EXTENDED` ioctl numbers;
//! - the `shm` module mirrors the exact byte layout of the fbclock shared
//!   memory state, v1 and v2, as specified by the wire format in the design
//!   document.
//!
//! Nothing in this crate validates its inputs or retries on failure; that
//! belongs in `fbclock`.

#![allow(non_camel_case_types)]

pub mod ptp;
pub mod shm;

use std::io;

/// Convert a negative C return value into an `io::Error`, leaving non-negative
/// values untouched.
///
/// # Safety
/// Caller must have just made a libc syscall that follows the usual
/// "negative return means check errno" convention.
pub unsafe fn check_errno_syscall<F, T>(f: F) -> io::Result<T>
where
    F: FnOnce() -> T,
    T: PartialOrd + Default,
{
    let result = f();
    if result < T::default() {
        Err(io::Error::last_os_error())
    } else {
        Ok(result)
    }
}
