//! The stable C ABI for fbclock's gettime client core (spec §6).
//!
//! ```text
//! struct truetime { u64 earliest_ns; u64 latest_ns; }
//! struct lib      { /* opaque */ }
//! int init(lib*, const char* shm_path);
//! int destroy(lib*);
//! int gettime(lib*, truetime*);        /* TAI */
//! int gettime_utc(lib*, truetime*);    /* smeared UTC */
//! const char* strerror(int code);
//! ```
//!
//! Grounded on `clock-bound-ffi`'s `clockbound_open`/`clockbound_close`/
//! `clockbound_now` and its `Box::leak`/`Box::from_raw` opaque-context
//! pattern: the opaque `lib` struct here holds one pointer, filled in by
//! [`fbclock_init`] and consumed by [`fbclock_destroy`].

use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_void};
use std::path::Path;

use fbclock::client::{DevicePhcTimeSource, Library, TimeStandard};
use fbclock::error::ClientError;
use fbclock::shm::Protocol;

/// Default PHC device path (spec §6): a hard link maintained by the
/// manager process pointing at the network interface's PHC. Device symlink
/// management is out of scope (spec §1); this crate only opens the link.
const PHC_DEVICE_PATH: &[u8] = b"/dev/fbclock/ptp\0";

/// Spec §6 `struct truetime`.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default)]
pub struct truetime {
    pub earliest_ns: u64,
    pub latest_ns: u64,
}

/// Spec §6 `struct lib`. Opaque to C callers; holds exactly one pointer to
/// the boxed [`fbclock::client::Library`].
#[repr(C)]
pub struct lib {
    inner: *mut c_void,
}

impl Default for lib {
    fn default() -> Self {
        lib { inner: std::ptr::null_mut() }
    }
}

/// Treats a missing symlink target as "absent, proceed" rather than an
/// error (open question iii, spec §9: "the `setup_device_dir` symlink
/// logic tolerates pre-existing files — specify that a reader must handle
/// `ENOENT` on the symlink target gracefully"). Device symlink *creation*
/// remains out of scope; this only probes.
fn symlink_target_present(path: &Path) -> bool {
    match std::fs::symlink_metadata(path) {
        Ok(_) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(_) => false,
    }
}

fn protocol_for_path(path: &str) -> Protocol {
    if path.ends_with("_v2") {
        Protocol::V2
    } else {
        Protocol::V1
    }
}

/// Spec §6 `init`. Opens the PHC device and maps the SHM segment named by
/// `shm_path`, writing the resulting handle into `*out`.
///
/// # Safety
/// `out` must point to valid, writable `lib` storage; `shm_path` must be a
/// NUL-terminated C string valid for the duration of this call.
#[no_mangle]
pub unsafe extern "C" fn fbclock_init(out: *mut lib, shm_path: *const c_char) -> c_int {
    if out.is_null() || shm_path.is_null() {
        return ClientError::ShmemOpen.code();
    }
    let path = match CStr::from_ptr(shm_path).to_str() {
        Ok(s) => s,
        Err(_) => return ClientError::ShmemOpen.code(),
    };

    let phc_device_path = Path::new(std::str::from_utf8_unchecked(&PHC_DEVICE_PATH[..PHC_DEVICE_PATH.len() - 1]));
    if !symlink_target_present(phc_device_path) {
        tracing::warn!(path = %phc_device_path.display(), "PHC device link absent at init");
    }

    let phc_fd = libc::open(PHC_DEVICE_PATH.as_ptr() as *const c_char, libc::O_RDONLY);
    if phc_fd < 0 {
        return ClientError::PtpOpen.code();
    }
    let phc = Box::new(DevicePhcTimeSource::from_raw_fd(phc_fd));

    // The C ABI's `init(lib*, const char*)` signature is fixed by spec §6
    // and carries no suppression flag; CRC_MISMATCH is always surfaced
    // through this entry point.
    match Library::init(Path::new(path), protocol_for_path(path), phc, false) {
        Ok(library) => {
            (*out).inner = Box::into_raw(Box::new(library)) as *mut c_void;
            0
        }
        Err(e) => {
            libc::close(phc_fd);
            e.code()
        }
    }
}

/// Spec §6 `destroy`. Idempotent: calling twice, or on a `lib` never
/// successfully `init`'d, is a no-op.
///
/// # Safety
/// `handle` must have been produced by [`fbclock_init`], or be zeroed.
#[no_mangle]
pub unsafe extern "C" fn fbclock_destroy(handle: *mut lib) -> c_int {
    if handle.is_null() {
        return 0;
    }
    let inner = (*handle).inner;
    if !inner.is_null() {
        drop(Box::from_raw(inner as *mut Library));
        (*handle).inner = std::ptr::null_mut();
    }
    0
}

unsafe fn with_library<F>(handle: *mut lib, f: F) -> c_int
where
    F: FnOnce(&mut Library) -> Result<truetime, ClientError>,
{
    if handle.is_null() || (*handle).inner.is_null() {
        return ClientError::NoData.code();
    }
    let library = &mut *((*handle).inner as *mut Library);
    match f(library) {
        Ok(_) => 0,
        Err(e) => e.code(),
    }
}

unsafe fn gettime_impl(handle: *mut lib, out: *mut truetime, standard: TimeStandard) -> c_int {
    if out.is_null() {
        return ClientError::NoData.code();
    }
    with_library(handle, |library| {
        let tt = library.gettime(standard)?;
        *out = truetime { earliest_ns: tt.earliest_ns, latest_ns: tt.latest_ns };
        Ok(truetime::default())
    })
}

/// Spec §6 `gettime` (TAI).
///
/// # Safety
/// `handle` must be a live handle from [`fbclock_init`]; `out` must point
/// to valid, writable storage for one `truetime`.
#[no_mangle]
pub unsafe extern "C" fn fbclock_gettime(handle: *mut lib, out: *mut truetime) -> c_int {
    gettime_impl(handle, out, TimeStandard::Tai)
}

/// Spec §6 `gettime_utc` (smeared UTC).
///
/// # Safety
/// Same requirements as [`fbclock_gettime`].
#[no_mangle]
pub unsafe extern "C" fn fbclock_gettime_utc(handle: *mut lib, out: *mut truetime) -> c_int {
    gettime_impl(handle, out, TimeStandard::Utc)
}

/// Spec §6 `strerror`. Returns a pointer to static storage; callers must
/// not free it.
#[no_mangle]
pub extern "C" fn fbclock_strerror(code: c_int) -> *const c_char {
    const NO_ERROR: &[u8] = b"NO_ERROR\0";
    const SHMEM_MAP_FAILED: &[u8] = b"SHMEM_MAP_FAILED\0";
    const SHMEM_OPEN: &[u8] = b"SHMEM_OPEN\0";
    const PTP_READ_OFFSET: &[u8] = b"PTP_READ_OFFSET\0";
    const PTP_OPEN: &[u8] = b"PTP_OPEN\0";
    const NO_DATA: &[u8] = b"NO_DATA\0";
    const WOU_TOO_BIG: &[u8] = b"WOU_TOO_BIG\0";
    const PHC_IN_THE_PAST: &[u8] = b"PHC_IN_THE_PAST\0";
    const CRC_MISMATCH: &[u8] = b"CRC_MISMATCH\0";
    const UNKNOWN: &[u8] = b"UNKNOWN\0";

    let bytes: &[u8] = match ClientError::from_code(code) {
        None if code == 0 => NO_ERROR,
        None => UNKNOWN,
        Some(ClientError::ShmemMapFailed) => SHMEM_MAP_FAILED,
        Some(ClientError::ShmemOpen) => SHMEM_OPEN,
        Some(ClientError::PtpReadOffset) => PTP_READ_OFFSET,
        Some(ClientError::PtpOpen) => PTP_OPEN,
        Some(ClientError::NoData) => NO_DATA,
        Some(ClientError::WouTooBig) => WOU_TOO_BIG,
        Some(ClientError::PhcInThePast) => PHC_IN_THE_PAST,
        Some(ClientError::CrcMismatch) => CRC_MISMATCH,
    };
    bytes.as_ptr() as *const c_char
}
