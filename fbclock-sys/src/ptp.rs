//! Mirrors the subset of `<linux/ptp_clock.h>` that fbclock needs to read PHC
//! time and offset samples via `ioctl(2)`.

use std::mem;

/// `PTP_MAX_SAMPLES` from the kernel header: the largest `n_samples` the
/// `PTP_SYS_OFFSET` family of ioctls will accept.
pub const PTP_MAX_SAMPLES: usize = 25;

/// A single `(seconds, nanoseconds)` timestamp, as used throughout the PTP
/// ioctl ABI.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct ptp_clock_time {
    pub sec: i64,
    pub nsec: u32,
    pub reserved: u32,
}

impl ptp_clock_time {
    /// Nanoseconds since the Unix epoch, as a single `i64`.
    pub fn to_nanos(self) -> i64 {
        self.sec * 1_000_000_000 + self.nsec as i64
    }
}

/// Argument to `PTP_SYS_OFFSET`: `n_samples` consecutive
/// `(sys_before, phc, sys_after)` readings, flattened into one array of
/// `2*n+1` timestamps alternating system/PHC/system/PHC/...
#[repr(C)]
#[derive(Copy, Clone)]
pub struct ptp_sys_offset {
    pub n_samples: u32,
    pub rsv: [u32; 3],
    pub ts: [ptp_clock_time; 2 * PTP_MAX_SAMPLES + 1],
}

impl Default for ptp_sys_offset {
    fn default() -> Self {
        // SAFETY: all-zero is a valid bit pattern for this struct.
        unsafe { mem::zeroed() }
    }
}

/// A `(sys_before, phc, sys_after)` triple as returned by
/// `PTP_SYS_OFFSET_EXTENDED`.
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct ptp_extended_triple {
    pub sys_before: ptp_clock_time,
    pub phc: ptp_clock_time,
    pub sys_after: ptp_clock_time,
}

/// Argument to `PTP_SYS_OFFSET_EXTENDED`.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct ptp_sys_offset_extended {
    pub n_samples: u32,
    pub rsv: [u32; 3],
    pub ts: [ptp_extended_triple; PTP_MAX_SAMPLES],
}

impl Default for ptp_sys_offset_extended {
    fn default() -> Self {
        // SAFETY: all-zero is a valid bit pattern for this struct.
        unsafe { mem::zeroed() }
    }
}

const PTP_CLK_MAGIC: u8 = b'=';

/// Replicates the kernel's `_IOWR` macro (see `<asm-generic/ioctl.h>`) for the
/// two PTP ioctls fbclock issues. Written out explicitly rather than pulled in
/// from a crate, since it is exactly two numbers and both are architecture
/// independent on every platform PTP hardware clocks exist on.
const fn iowr(nr: u8, size: usize) -> libc::c_ulong {
    const IOC_READ: libc::c_ulong = 2;
    const IOC_WRITE: libc::c_ulong = 1;
    const IOC_NRBITS: u32 = 8;
    const IOC_TYPEBITS: u32 = 8;
    const IOC_SIZEBITS: u32 = 14;
    const IOC_DIRSHIFT: u32 = IOC_NRBITS + IOC_TYPEBITS + IOC_SIZEBITS;

    let dir = IOC_READ | IOC_WRITE;
    (dir << IOC_DIRSHIFT)
        | ((PTP_CLK_MAGIC as libc::c_ulong) << IOC_NRBITS)
        | (nr as libc::c_ulong)
        | ((size as libc::c_ulong) << (IOC_NRBITS + IOC_TYPEBITS))
}

/// `ioctl` request number for `PTP_SYS_OFFSET`.
pub fn ptp_sys_offset_ioctl() -> libc::c_ulong {
    iowr(5, mem::size_of::<ptp_sys_offset>())
}

/// `ioctl` request number for `PTP_SYS_OFFSET_EXTENDED`.
pub fn ptp_sys_offset_extended_ioctl() -> libc::c_ulong {
    iowr(9, mem::size_of::<ptp_sys_offset_extended>())
}
