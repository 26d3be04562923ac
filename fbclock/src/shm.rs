//! The lock-free single-writer/multi-reader shared-memory channel (spec
//! §4.A, §6).
//!
//! Two wire protocols share this module: v1 guards its payload with a
//! folded CRC stored in an atomic `u64`; v2 guards it with a classic
//! even/odd seqlock. Both retry up to [`RETRY_BUDGET`] times before giving
//! up. The bit-exact struct layouts live in `fbclock_sys::shm`; this module
//! owns the atomics discipline that makes reading them safe without a
//! kernel-level lock, continuing the `atomic_load`/`atomic_store` pattern
//! the teacher crate uses to read its mmap'd ring buffer header.

use std::fs::OpenOptions;
use std::io;
use std::mem::size_of;
use std::path::Path;
use std::sync::atomic::{compiler_fence, AtomicU64, Ordering};
use std::time::Duration;

use fbclock_sys::shm::{ShmStateV1, ShmStateV2, V2_SMEAR_DURATION_S};
use memmap2::{Mmap, MmapMut};

use crate::error::ShmError;

/// Bounded retry budget for both protocols (spec §4.A).
pub const RETRY_BUDGET: u32 = 1000;

/// Backoff between seqlock retries while `seq == 0` (segment not yet
/// published).
const UNINITIALIZED_BACKOFF: Duration = Duration::from_micros(10);

/// Which wire protocol a mapping speaks.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Protocol {
    V1,
    V2,
}

impl Protocol {
    fn struct_size(self) -> usize {
        match self {
            Protocol::V1 => size_of::<ShmStateV1>(),
            Protocol::V2 => size_of::<ShmStateV2>(),
        }
    }
}

/// A published state, independent of wire protocol. The estimator builds
/// one of these per cycle; [`store`] encodes it into whichever protocol the
/// mapping speaks.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct PublishedState {
    pub ingress_time_ns: i64,
    pub error_bound_ns: u32,
    pub holdover_multiplier: f64,
    pub clock_smearing_start_s: u64,
    pub clock_smearing_end_s: u64,
    pub utc_offset_pre_s: i32,
    pub utc_offset_post_s: i32,
    /// Present only when publishing over v2.
    pub v2: Option<V2Extra>,
}

/// The fields v2 adds over v1 (spec §3, §4.D step 13).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct V2Extra {
    pub clock_id: u32,
    pub phc_time_ns: i64,
    pub sysclock_time_ns: i64,
    pub coef_ppb: i64,
}

/// Encode a holdover multiplier as `round(value * 2^16)`, saturating to
/// `u32::MAX` for values that would overflow (spec §8 property 2).
pub fn encode_holdover_multiplier(value: f64) -> u32 {
    let scaled = (value * 65536.0).round();
    if !scaled.is_finite() || scaled >= u32::MAX as f64 {
        u32::MAX
    } else if scaled <= 0.0 {
        0
    } else {
        scaled as u32
    }
}

/// The inverse of [`encode_holdover_multiplier`].
pub fn decode_holdover_multiplier(bits: u32) -> f64 {
    bits as f64 / 65536.0
}

// ---------------------------------------------------------------------
// CRC-64 (protocol v1)
// ---------------------------------------------------------------------

/// CRC-64/XZ reflected polynomial, folded byte-at-a-time. spec.md specifies
/// the seed and final-XOR constants but not the generator polynomial itself
/// (see DESIGN.md for the resulting decision); this is the standard
/// reflected CRC-64 used by `xz`/`.tar.xz`, chosen because it is the only
/// widely interoperable 64-bit CRC and keeps both sides of the channel
/// trivially aligned regardless of hardware CRC32 instruction availability.
const CRC64_POLY: u64 = 0xc96c_5795_d787_0f42;

fn crc64_fold(mut crc: u64, bytes: &[u8]) -> u64 {
    for &byte in bytes {
        crc ^= byte as u64;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ CRC64_POLY;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

fn crc64_fields(ingress_time_ns: i64, error_bound_ns: u32, holdover_multiplier_ns: u32, seed: u64) -> u64 {
    let mut crc = seed;
    crc = crc64_fold(crc, &ingress_time_ns.to_le_bytes());
    crc = crc64_fold(crc, &error_bound_ns.to_le_bytes());
    crc = crc64_fold(crc, &holdover_multiplier_ns.to_le_bytes());
    crc
}

/// Current CRC variant: seed `0xFFFF_FFFF`, final XOR `0xFFFF_FFFF`.
fn crc64_current(ingress_time_ns: i64, error_bound_ns: u32, holdover_multiplier_ns: u32) -> u64 {
    crc64_fields(ingress_time_ns, error_bound_ns, holdover_multiplier_ns, 0xFFFF_FFFF) ^ 0xFFFF_FFFF
}

/// Deprecated CRC variant: seed `0x04C1_1DB7`, no final XOR. Only consulted
/// when the `legacy-crc` feature is enabled, for one migration cycle (spec
/// §4.A).
#[cfg(feature = "legacy-crc")]
fn crc64_legacy(ingress_time_ns: i64, error_bound_ns: u32, holdover_multiplier_ns: u32) -> u64 {
    crc64_fields(ingress_time_ns, error_bound_ns, holdover_multiplier_ns, 0x04C1_1DB7)
}

fn crc_matches(state: &ShmStateV1, observed: u64) -> bool {
    let computed = crc64_current(state.ingress_time_ns, state.error_bound_ns, state.holdover_multiplier_ns);
    if computed == observed {
        return true;
    }
    #[cfg(feature = "legacy-crc")]
    {
        if crc64_legacy(state.ingress_time_ns, state.error_bound_ns, state.holdover_multiplier_ns) == observed {
            return true;
        }
    }
    false
}

// ---------------------------------------------------------------------
// Raw store/load over a mapped byte region
// ---------------------------------------------------------------------

/// Publish `state` into the v1-protocol mapping. Writer-side: the non-`crc`
/// fields are copied first, then the freshly computed CRC is stored into
/// the atomic `crc` word with release ordering — readers that observe the
/// new CRC are guaranteed to observe the new payload too.
///
/// # Safety
/// `mapping` must be at least `size_of::<ShmStateV1>()` bytes and must be
/// the only writer touching this region.
pub unsafe fn store_v1(mapping: &mut [u8], mut state: ShmStateV1) -> Result<(), ShmError> {
    if mapping.len() < size_of::<ShmStateV1>() {
        return Err(ShmError::SegmentMalformed);
    }
    state.crc = 0; // recomputed below; never trust a caller-supplied value.
    let crc = crc64_current(state.ingress_time_ns, state.error_bound_ns, state.holdover_multiplier_ns);

    let base = mapping.as_mut_ptr();
    // Payload first, CRC word last: a torn crash mid-copy leaves the old
    // CRC in place, which will simply fail to validate against the new
    // (partial) payload and be retried away.
    std::ptr::write_unaligned(base.add(8) as *mut i64, state.ingress_time_ns);
    std::ptr::write_unaligned(base.add(16) as *mut u32, state.error_bound_ns);
    std::ptr::write_unaligned(base.add(20) as *mut u32, state.holdover_multiplier_ns);
    std::ptr::write_unaligned(base.add(24) as *mut u64, state.clock_smearing_start_s);
    std::ptr::write_unaligned(base.add(32) as *mut u64, state.clock_smearing_end_s);
    std::ptr::write_unaligned(base.add(40) as *mut i32, state.utc_offset_pre_s);
    std::ptr::write_unaligned(base.add(44) as *mut i32, state.utc_offset_post_s);
    compiler_fence(Ordering::SeqCst);
    (*(base as *const AtomicU64)).store(crc, Ordering::Release);
    Ok(())
}

/// Load the v1-protocol mapping, retrying up to [`RETRY_BUDGET`] times.
///
/// When `suppress_crc_mismatch` is set, exhausting the retry budget returns
/// the last-observed (unvalidated) snapshot as `Ok` instead of
/// `Err(ShmError::CrcExhausted)` — the documented legacy policy (spec §9
/// open question (i)) of falling through a persistent CRC mismatch to
/// success rather than surfacing it.
///
/// # Safety
/// `mapping` must be at least `size_of::<ShmStateV1>()` bytes, readable,
/// and may be concurrently written by a single writer following
/// [`store_v1`]'s protocol.
pub unsafe fn load_v1(mapping: &[u8], suppress_crc_mismatch: bool) -> Result<ShmStateV1, ShmError> {
    if mapping.len() < size_of::<ShmStateV1>() {
        return Err(ShmError::SegmentMalformed);
    }
    let base = mapping.as_ptr();
    let mut last = std::ptr::read_unaligned(base as *const ShmStateV1);
    for _ in 0..RETRY_BUDGET {
        let snapshot = std::ptr::read_unaligned(base as *const ShmStateV1);
        compiler_fence(Ordering::SeqCst);
        let observed_crc = (*(base as *const AtomicU64)).load(Ordering::Acquire);
        if crc_matches(&snapshot, observed_crc) {
            let mut out = snapshot;
            out.crc = observed_crc;
            return Ok(out);
        }
        last = snapshot;
    }
    if suppress_crc_mismatch {
        Ok(last)
    } else {
        Err(ShmError::CrcExhausted)
    }
}

/// Publish `state` into the v2-protocol mapping using the seqlock
/// discipline: bump to odd, write payload under a pair of compiler
/// barriers, bump to even (skipping zero on wrap, since zero means
/// "uninitialized" to readers).
///
/// # Safety
/// Same requirements as [`store_v1`], sized for `ShmStateV2`.
pub unsafe fn store_v2(mapping: &mut [u8], mut state: ShmStateV2) -> Result<(), ShmError> {
    if mapping.len() < size_of::<ShmStateV2>() {
        return Err(ShmError::SegmentMalformed);
    }
    let base = mapping.as_mut_ptr();
    let seq_atomic = &*(base as *const AtomicU64);

    let current = seq_atomic.load(Ordering::Relaxed);
    let in_progress = next_odd(current);
    seq_atomic.store(in_progress, Ordering::Release);
    compiler_fence(Ordering::SeqCst);

    state.seq = 0; // overwritten by the final even store below
    std::ptr::write_unaligned(base.add(8) as *mut i64, state.ingress_time_ns);
    std::ptr::write_unaligned(base.add(16) as *mut u32, state.error_bound_ns);
    std::ptr::write_unaligned(base.add(20) as *mut u32, state.holdover_multiplier_ns);
    std::ptr::write_unaligned(base.add(24) as *mut u64, state.clock_smearing_start_s);
    std::ptr::write_unaligned(base.add(32) as *mut i16, state.utc_offset_pre_s);
    std::ptr::write_unaligned(base.add(34) as *mut i16, state.utc_offset_post_s);
    std::ptr::write_unaligned(base.add(36) as *mut u32, state.clock_id);
    std::ptr::write_unaligned(base.add(40) as *mut i64, state.phc_time_ns);
    std::ptr::write_unaligned(base.add(48) as *mut i64, state.sysclock_time_ns);
    std::ptr::write_unaligned(base.add(56) as *mut i64, state.coef_ppb);

    compiler_fence(Ordering::SeqCst);
    let published = next_even_nonzero(in_progress);
    seq_atomic.store(published, Ordering::Release);
    Ok(())
}

fn next_odd(seq: u64) -> u64 {
    let next = seq.wrapping_add(1);
    if next % 2 == 0 {
        next.wrapping_add(1)
    } else {
        next
    }
}

fn next_even_nonzero(seq: u64) -> u64 {
    let mut next = seq.wrapping_add(1);
    if next % 2 != 0 {
        next = next.wrapping_add(1);
    }
    if next == 0 {
        next = 2;
    }
    next
}

/// Load the v2-protocol mapping, retrying up to [`RETRY_BUDGET`] times. A
/// `seq` of zero means the segment has never been published; this is
/// reported the same as an exhausted retry budget so callers see one error
/// shape (spec §4.G maps both to `NO_DATA` at the client layer).
///
/// `suppress_crc_mismatch` applies the same legacy fallthrough as
/// [`load_v1`]: exhausting the retry budget on a persistently torn read
/// returns the last-observed snapshot as `Ok` rather than
/// `Err(ShmError::SeqExhausted)`.
///
/// # Safety
/// Same requirements as [`load_v1`], sized for `ShmStateV2`.
pub unsafe fn load_v2(mapping: &[u8], suppress_crc_mismatch: bool) -> Result<ShmStateV2, ShmError> {
    if mapping.len() < size_of::<ShmStateV2>() {
        return Err(ShmError::SegmentMalformed);
    }
    let base = mapping.as_ptr();
    let seq_atomic = &*(base as *const AtomicU64);

    let mut last = std::ptr::read_unaligned(base as *const ShmStateV2);
    for _ in 0..RETRY_BUDGET {
        let seq1 = seq_atomic.load(Ordering::Acquire);
        if seq1 == 0 {
            std::thread::sleep(UNINITIALIZED_BACKOFF);
            continue;
        }
        if seq1 % 2 != 0 {
            continue;
        }
        compiler_fence(Ordering::SeqCst);
        let mut snapshot = std::ptr::read_unaligned(base as *const ShmStateV2);
        compiler_fence(Ordering::SeqCst);
        let seq2 = seq_atomic.load(Ordering::Acquire);
        if seq1 == seq2 {
            snapshot.seq = seq1;
            return Ok(snapshot);
        }
        last = snapshot;
    }
    if suppress_crc_mismatch {
        Ok(last)
    } else {
        Err(ShmError::SeqExhausted)
    }
}

impl PublishedState {
    /// Spec §4.G step 1: "If both `error_bound_ns` and `ingress_time_ns`
    /// are zero → `NO_DATA`."
    pub fn is_no_data(&self) -> bool {
        self.error_bound_ns == 0 && self.ingress_time_ns == 0
    }

    /// Spec §4.G step 1: "If `error_bound_ns == u32::MAX` or
    /// `holdover_multiplier_ns == u32::MAX` → `WOU_TOO_BIG`."
    pub fn is_wou_too_big(&self) -> bool {
        self.error_bound_ns == u32::MAX || encode_holdover_multiplier(self.holdover_multiplier) == u32::MAX
    }
}

/// Derive v2's `clock_smearing_end_s` from its fixed-duration start (spec
/// §3: "the end is derived as `start + 62_500 s`").
pub fn v2_smearing_end(start_s: u64) -> u64 {
    start_s + V2_SMEAR_DURATION_S
}

// ---------------------------------------------------------------------
// Mapping lifecycle
// ---------------------------------------------------------------------

/// Either side of the mmap'd region: mutable for the writer, read-only for
/// readers.
enum Backing {
    Writer(MmapMut),
    Reader(Mmap),
}

/// An owned, mapped SHM segment, RAII-closed on drop. Grounded on
/// ClockBound's `FdGuard`/`MmapGuard` pair (`clock-bound-shm/src/reader.rs`):
/// spec.md names the `init → {gettime}* → destroy` lifecycle (§9) but never
/// states an owning type for the mapped file descriptor, so this fills that
/// gap.
pub struct ShmMapping {
    backing: Backing,
    protocol: Protocol,
}

impl ShmMapping {
    /// Create (or truncate) the SHM file at `path` with mode `0644` and map
    /// it read-write, for the estimator side (spec §3 "Lifecycle").
    pub fn create_writer(path: &Path, protocol: Protocol) -> Result<Self, ShmError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(ShmError::Open)?;
        file.set_len(protocol.struct_size() as u64).map_err(ShmError::Open)?;
        set_world_readable(&file);
        let mmap = unsafe { MmapMut::map_mut(&file) }.map_err(ShmError::Map)?;
        Ok(ShmMapping {
            backing: Backing::Writer(mmap),
            protocol,
        })
    }

    /// Open an existing SHM file read-only, for client processes.
    pub fn open_reader(path: &Path, protocol: Protocol) -> Result<Self, ShmError> {
        let file = OpenOptions::new().read(true).open(path).map_err(ShmError::Open)?;
        let mmap = unsafe { Mmap::map(&file) }.map_err(ShmError::Map)?;
        Ok(ShmMapping {
            backing: Backing::Reader(mmap),
            protocol,
        })
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn as_slice(&self) -> &[u8] {
        match &self.backing {
            Backing::Writer(m) => &m[..],
            Backing::Reader(m) => &m[..],
        }
    }

    fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        match &mut self.backing {
            Backing::Writer(m) => Some(&mut m[..]),
            Backing::Reader(_) => None,
        }
    }

    /// Publish `state`, encoding it per this mapping's protocol.
    pub fn store(&mut self, state: &PublishedState) -> Result<(), ShmError> {
        let protocol = self.protocol;
        let mapping = self.as_mut_slice().ok_or(ShmError::SegmentMalformed)?;
        match protocol {
            Protocol::V1 => {
                let wire = ShmStateV1 {
                    crc: 0,
                    ingress_time_ns: state.ingress_time_ns,
                    error_bound_ns: state.error_bound_ns,
                    holdover_multiplier_ns: encode_holdover_multiplier(state.holdover_multiplier),
                    clock_smearing_start_s: state.clock_smearing_start_s,
                    clock_smearing_end_s: state.clock_smearing_end_s,
                    utc_offset_pre_s: state.utc_offset_pre_s,
                    utc_offset_post_s: state.utc_offset_post_s,
                };
                unsafe { store_v1(mapping, wire) }
            }
            Protocol::V2 => {
                let extra = state.v2.ok_or(ShmError::SegmentMalformed)?;
                let wire = ShmStateV2 {
                    seq: 0,
                    ingress_time_ns: state.ingress_time_ns,
                    error_bound_ns: state.error_bound_ns,
                    holdover_multiplier_ns: encode_holdover_multiplier(state.holdover_multiplier),
                    clock_smearing_start_s: state.clock_smearing_start_s,
                    utc_offset_pre_s: state.utc_offset_pre_s as i16,
                    utc_offset_post_s: state.utc_offset_post_s as i16,
                    clock_id: extra.clock_id,
                    phc_time_ns: extra.phc_time_ns,
                    sysclock_time_ns: extra.sysclock_time_ns,
                    coef_ppb: extra.coef_ppb,
                };
                unsafe { store_v2(mapping, wire) }
            }
        }
    }

    /// Load the most recently published state.
    ///
    /// `suppress_crc_mismatch` is the legacy v1/v2 fallthrough policy (spec
    /// §9 open question (i)): when `true`, exhausting the retry budget on a
    /// persistently torn read returns the last-observed snapshot as `Ok`
    /// rather than `Err(ShmError::CrcExhausted | SeqExhausted)`.
    pub fn load(&self, suppress_crc_mismatch: bool) -> Result<PublishedState, ShmError> {
        let mapping = self.as_slice();
        match self.protocol {
            Protocol::V1 => {
                let wire = unsafe { load_v1(mapping, suppress_crc_mismatch) }?;
                Ok(PublishedState {
                    ingress_time_ns: wire.ingress_time_ns,
                    error_bound_ns: wire.error_bound_ns,
                    holdover_multiplier: decode_holdover_multiplier(wire.holdover_multiplier_ns),
                    clock_smearing_start_s: wire.clock_smearing_start_s,
                    clock_smearing_end_s: wire.clock_smearing_end_s,
                    utc_offset_pre_s: wire.utc_offset_pre_s,
                    utc_offset_post_s: wire.utc_offset_post_s,
                    v2: None,
                })
            }
            Protocol::V2 => {
                let wire = unsafe { load_v2(mapping, suppress_crc_mismatch) }?;
                Ok(PublishedState {
                    ingress_time_ns: wire.ingress_time_ns,
                    error_bound_ns: wire.error_bound_ns,
                    holdover_multiplier: decode_holdover_multiplier(wire.holdover_multiplier_ns),
                    clock_smearing_start_s: wire.clock_smearing_start_s,
                    clock_smearing_end_s: v2_smearing_end(wire.clock_smearing_start_s),
                    utc_offset_pre_s: wire.utc_offset_pre_s as i32,
                    utc_offset_post_s: wire.utc_offset_post_s as i32,
                    v2: Some(V2Extra {
                        clock_id: wire.clock_id,
                        phc_time_ns: wire.phc_time_ns,
                        sysclock_time_ns: wire.sysclock_time_ns,
                        coef_ppb: wire.coef_ppb,
                    }),
                })
            }
        }
    }
}

#[cfg(unix)]
fn set_world_readable(file: &std::fs::File) {
    use std::os::unix::fs::PermissionsExt;
    let _ = file.set_permissions(std::fs::Permissions::from_mode(0o644));
}

#[cfg(not(unix))]
fn set_world_readable(_file: &std::fs::File) {}

impl From<io::Error> for ShmError {
    fn from(e: io::Error) -> Self {
        ShmError::Open(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn holdover_multiplier_quantizes_per_spec() {
        assert_eq!(encode_holdover_multiplier(0.312), 0x4FDF);
        let back = decode_holdover_multiplier(0x4FDF);
        assert!((back - 0.312).abs() < 0.001);
    }

    #[test]
    fn holdover_multiplier_saturates() {
        assert_eq!(encode_holdover_multiplier(1_000_000.0), u32::MAX);
    }

    #[test]
    fn v1_round_trips_through_mapping() {
        let file = NamedTempFile::new().unwrap();
        let mut writer = ShmMapping::create_writer(file.path(), Protocol::V1).unwrap();
        let state = PublishedState {
            ingress_time_ns: 1_700_000_000_000_000_000,
            error_bound_ns: 123,
            holdover_multiplier: 64.5,
            clock_smearing_start_s: 1_483_228_836,
            clock_smearing_end_s: 1_483_291_336,
            utc_offset_pre_s: 36,
            utc_offset_post_s: 37,
            v2: None,
        };
        writer.store(&state).unwrap();

        let reader = ShmMapping::open_reader(file.path(), Protocol::V1).unwrap();
        let loaded = reader.load(false).unwrap();
        assert_eq!(loaded.ingress_time_ns, state.ingress_time_ns);
        assert_eq!(loaded.error_bound_ns, state.error_bound_ns);
        assert!((loaded.holdover_multiplier - state.holdover_multiplier).abs() / state.holdover_multiplier < 0.001);
        assert_eq!(loaded.clock_smearing_start_s, state.clock_smearing_start_s);
        assert_eq!(loaded.clock_smearing_end_s, state.clock_smearing_end_s);
        assert_eq!(loaded.utc_offset_pre_s, state.utc_offset_pre_s);
        assert_eq!(loaded.utc_offset_post_s, state.utc_offset_post_s);
    }

    #[test]
    fn v2_round_trips_through_mapping_and_derives_end() {
        let file = NamedTempFile::new().unwrap();
        let mut writer = ShmMapping::create_writer(file.path(), Protocol::V2).unwrap();
        let state = PublishedState {
            ingress_time_ns: 42,
            error_bound_ns: 7,
            holdover_multiplier: 1.0,
            clock_smearing_start_s: 1_000,
            clock_smearing_end_s: 0, // ignored for v2 encode
            utc_offset_pre_s: 36,
            utc_offset_post_s: 37,
            v2: Some(V2Extra {
                clock_id: 9,
                phc_time_ns: 100,
                sysclock_time_ns: 90,
                coef_ppb: -493,
            }),
        };
        writer.store(&state).unwrap();

        let reader = ShmMapping::open_reader(file.path(), Protocol::V2).unwrap();
        let loaded = reader.load(false).unwrap();
        assert_eq!(loaded.clock_smearing_end_s, 1_000 + V2_SMEAR_DURATION_S);
        assert_eq!(loaded.v2.unwrap().coef_ppb, -493);
    }

    #[test]
    fn load_before_any_publish_is_seq_exhausted() {
        let file = NamedTempFile::new().unwrap();
        let _writer = ShmMapping::create_writer(file.path(), Protocol::V2).unwrap();
        let reader = ShmMapping::open_reader(file.path(), Protocol::V2).unwrap();
        let err = reader.load(false).unwrap_err();
        assert!(matches!(err, ShmError::SeqExhausted));
    }

    #[test]
    fn crc_mismatch_is_detected() {
        let file = NamedTempFile::new().unwrap();
        let mut writer = ShmMapping::create_writer(file.path(), Protocol::V1).unwrap();
        writer
            .store(&PublishedState {
                ingress_time_ns: 1,
                error_bound_ns: 2,
                holdover_multiplier: 3.0,
                clock_smearing_start_s: 0,
                clock_smearing_end_s: 0,
                utc_offset_pre_s: 0,
                utc_offset_post_s: 0,
                v2: None,
            })
            .unwrap();

        // Corrupt a payload byte without touching the CRC word.
        if let Backing::Writer(mmap) = &mut writer.backing {
            mmap[8] ^= 0xFF;
        }

        let reader = ShmMapping::open_reader(file.path(), Protocol::V1).unwrap();
        let err = reader.load(false).unwrap_err();
        assert!(matches!(err, ShmError::CrcExhausted));
    }

    #[test]
    fn suppressed_crc_mismatch_falls_through_to_last_observed() {
        let file = NamedTempFile::new().unwrap();
        let mut writer = ShmMapping::create_writer(file.path(), Protocol::V1).unwrap();
        writer
            .store(&PublishedState {
                ingress_time_ns: 1,
                error_bound_ns: 2,
                holdover_multiplier: 3.0,
                clock_smearing_start_s: 0,
                clock_smearing_end_s: 0,
                utc_offset_pre_s: 0,
                utc_offset_post_s: 0,
                v2: None,
            })
            .unwrap();

        if let Backing::Writer(mmap) = &mut writer.backing {
            mmap[8] ^= 0xFF;
        }

        let reader = ShmMapping::open_reader(file.path(), Protocol::V1).unwrap();
        // Byte 8 lands inside `ingress_time_ns`, not `error_bound_ns`; the
        // latter survives untouched in the last-observed snapshot.
        let loaded = reader.load(true).expect("suppressed read should fall through to Ok");
        assert_eq!(loaded.error_bound_ns, 2);
    }
}
