//! The gettime client core (spec §4.G).
//!
//! A small, low-latency routine, safe to call from arbitrary processes,
//! that reads the estimator's published state and the PHC's current time
//! and returns a `[earliest, latest]` interval. [`Library`] owns the
//! resources for the `init → {gettime}* → destroy` lifecycle named in
//! spec §9, modelled directly on ClockBound's `ClockBoundClient` /
//! `clockbound_ctx` pairing — `Library` is the Rust-native handle
//! `fbclock-ffi`'s opaque context wraps for the C ABI.

use std::path::Path;

use crate::error::ClientError;
use crate::shm::{Protocol, ShmMapping};
use crate::smear::{apply_smear, SmearParams};
use crate::stats::ClientStats;

/// The `[earliest, latest]` interval returned to callers (spec §6
/// `struct truetime`).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TrueTime {
    pub earliest_ns: u64,
    pub latest_ns: u64,
}

/// Which time standard a caller wants back (spec §4.G step 8, §6
/// `gettime`/`gettime_utc`).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TimeStandard {
    Tai,
    Utc,
}

/// One round-trip-timed PHC read (spec §4.G step 2).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PhcSample {
    pub phc_time_ns: i64,
    pub round_trip_delay_ns: i64,
}

/// The PHC-reading collaborator the client core needs. Implementations
/// issue `PTP_SYS_OFFSET_EXTENDED` (preferred) or `PTP_SYS_OFFSET`
/// (fallback) and reduce the resulting samples per spec §4.G step 2.
pub trait PhcTimeSource: Send {
    fn read_phc(&mut self) -> Result<PhcSample, ClientError>;
    /// For v2: the current reading of whichever system clock `clock_id`
    /// names (spec §4.G "V2 variant", §5 "Clock sources").
    fn read_sysclock(&mut self, clock_id: u32) -> i64;
}

/// A test double returning a fixed sample, for exercising the WOU
/// arithmetic without real hardware.
#[derive(Debug, Clone)]
pub struct FixedPhcTimeSource {
    pub sample: Result<PhcSample, ClientError>,
    pub sysclock_ns: i64,
}

impl PhcTimeSource for FixedPhcTimeSource {
    fn read_phc(&mut self) -> Result<PhcSample, ClientError> {
        self.sample.clone()
    }

    fn read_sysclock(&mut self, _clock_id: u32) -> i64 {
        self.sysclock_ns
    }
}

/// A Linux `PTP_SYS_OFFSET_EXTENDED`/`PTP_SYS_OFFSET` reader over an open
/// PHC character device.
pub struct DevicePhcTimeSource {
    fd: std::os::unix::io::RawFd,
}

impl DevicePhcTimeSource {
    /// # Safety
    /// `fd` must be a valid, open file descriptor for a PTP clock char
    /// device (`/dev/fbclock/ptp` per spec §6), owned for the lifetime of
    /// this value.
    pub unsafe fn from_raw_fd(fd: std::os::unix::io::RawFd) -> Self {
        DevicePhcTimeSource { fd }
    }

    fn read_extended(&self) -> Result<PhcSample, ClientError> {
        const N_SAMPLES: u32 = 5;
        let mut req: fbclock_sys::ptp::ptp_sys_offset_extended = Default::default();
        req.n_samples = N_SAMPLES;
        unsafe {
            fbclock_sys::check_errno_syscall(|| {
                libc::ioctl(
                    self.fd,
                    fbclock_sys::ptp::ptp_sys_offset_extended_ioctl(),
                    &mut req as *mut _,
                )
            })
        }
        .map_err(|_| ClientError::PtpReadOffset)?;
        let mut min_delay = i64::MAX;
        for i in 0..N_SAMPLES as usize {
            let triple = &req.ts[i];
            let delay = triple.sys_after.to_nanos() - triple.sys_before.to_nanos();
            min_delay = min_delay.min(delay);
        }
        if min_delay < 0 {
            return Err(ClientError::PtpReadOffset);
        }
        let phc_time_ns = req.ts[N_SAMPLES as usize - 1].phc.to_nanos();
        Ok(PhcSample { phc_time_ns, round_trip_delay_ns: min_delay })
    }

    fn read_legacy(&self) -> Result<PhcSample, ClientError> {
        const N_SAMPLES: u32 = 5;
        let mut req: fbclock_sys::ptp::ptp_sys_offset = Default::default();
        req.n_samples = N_SAMPLES;
        unsafe {
            fbclock_sys::check_errno_syscall(|| {
                libc::ioctl(self.fd, fbclock_sys::ptp::ptp_sys_offset_ioctl(), &mut req as *mut _)
            })
        }
        .map_err(|_| ClientError::PtpReadOffset)?;
        let mut min_delay = i64::MAX;
        for i in 0..N_SAMPLES as usize {
            let sys_before = req.ts[2 * i].to_nanos();
            let sys_after = req.ts[2 * i + 2].to_nanos();
            min_delay = min_delay.min(sys_after - sys_before);
        }
        if min_delay < 0 {
            return Err(ClientError::PtpReadOffset);
        }
        let phc_time_ns = req.ts[2 * (N_SAMPLES as usize - 1) + 1].to_nanos();
        Ok(PhcSample { phc_time_ns, round_trip_delay_ns: min_delay })
    }
}

impl PhcTimeSource for DevicePhcTimeSource {
    fn read_phc(&mut self) -> Result<PhcSample, ClientError> {
        self.read_extended().or_else(|_| self.read_legacy())
    }

    fn read_sysclock(&mut self, clock_id: u32) -> i64 {
        let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
        unsafe {
            libc::clock_gettime(clock_id as libc::clockid_t, &mut ts);
        }
        ts.tv_sec as i64 * 1_000_000_000 + ts.tv_nsec as i64
    }
}

/// The per-process library handle (spec §6 `struct lib`, §9's
/// `init → {gettime}* → destroy` lifecycle). Owns the mapped SHM region and
/// the PHC time source; tracks the monotonic minimum observed PHC-request
/// delay across every call made through this instance (spec §4.G step 3).
pub struct Library {
    shm: ShmMapping,
    phc: Box<dyn PhcTimeSource>,
    min_phc_delay_ns: i64,
    stats: ClientStats,
    suppress_crc_mismatch: bool,
}

impl Library {
    /// Open the SHM segment at `shm_path` (spec §6 `init`). `protocol` is
    /// inferred by callers from the path convention (`_v2` suffix → v2);
    /// `fbclock-ffi` performs that inference before calling here.
    ///
    /// `suppress_crc_mismatch` mirrors [`crate::config::Config::suppress_crc_mismatch`]
    /// on the reader side (spec §9 open question (i)): when `true`, a torn
    /// read that exhausts its retry budget returns the last-observed state
    /// instead of `ClientError::CrcMismatch`.
    pub fn init(
        shm_path: &Path,
        protocol: Protocol,
        phc: Box<dyn PhcTimeSource>,
        suppress_crc_mismatch: bool,
    ) -> Result<Self, ClientError> {
        let shm = ShmMapping::open_reader(shm_path, protocol)?;
        Ok(Library { shm, phc, min_phc_delay_ns: i64::MAX, stats: ClientStats::new(), suppress_crc_mismatch })
    }

    pub fn stats(&self) -> &ClientStats {
        &self.stats
    }

    /// Spec §6 `gettime`/`gettime_utc`, §4.G steps 1–9.
    pub fn gettime(&mut self, standard: TimeStandard) -> Result<TrueTime, ClientError> {
        let result = self.gettime_inner(standard);
        match &result {
            Ok(tt) => {
                let wou_ns = (tt.latest_ns - tt.earliest_ns) / 2;
                self.stats.record_success(wou_ns);
            }
            Err(_) => self.stats.record_error(),
        }
        result
    }

    fn gettime_inner(&mut self, standard: TimeStandard) -> Result<TrueTime, ClientError> {
        let state = self.shm.load(self.suppress_crc_mismatch)?;

        if state.is_no_data() {
            return Err(ClientError::NoData);
        }
        if state.is_wou_too_big() {
            return Err(ClientError::WouTooBig);
        }

        let (phc_time_ns, round_trip_delay_ns) = match &state.v2 {
            None => {
                let sample = self.phc.read_phc()?;
                (sample.phc_time_ns, sample.round_trip_delay_ns)
            }
            Some(extra) => {
                let sys_now = self.phc.read_sysclock(extra.clock_id);
                let delta = sys_now - extra.sysclock_time_ns;
                let phc_now = extra.phc_time_ns + delta + (delta as f64 * extra.coef_ppb as f64 / 1e9) as i64;
                (phc_now, 0)
            }
        };

        if round_trip_delay_ns >= 0 {
            self.min_phc_delay_ns = self.min_phc_delay_ns.min(round_trip_delay_ns);
        }
        let min_phc_delay_ns = if self.min_phc_delay_ns == i64::MAX { 0 } else { self.min_phc_delay_ns };

        if state.ingress_time_ns > phc_time_ns {
            return Err(ClientError::PhcInThePast);
        }

        let seconds_since_sync = (phc_time_ns - state.ingress_time_ns) as f64 / 1e9;
        let wou_ns = state.error_bound_ns as i64
            + min_phc_delay_ns
            + (state.holdover_multiplier * seconds_since_sync).floor() as i64;

        let base_time_ns = match standard {
            TimeStandard::Tai => phc_time_ns,
            TimeStandard::Utc => {
                let params = SmearParams {
                    smearing_start_s: state.clock_smearing_start_s,
                    smearing_end_s: state.clock_smearing_end_s,
                    utc_offset_pre_s: state.utc_offset_pre_s,
                    utc_offset_post_s: state.utc_offset_post_s,
                };
                apply_smear(phc_time_ns, &params)
            }
        };

        Ok(TrueTime {
            earliest_ns: (base_time_ns - wou_ns).max(0) as u64,
            latest_ns: (base_time_ns + wou_ns).max(0) as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::PublishedState;
    use tempfile::NamedTempFile;

    fn published(error_bound_ns: u32, holdover_multiplier: f64, ingress_time_ns: i64) -> PublishedState {
        PublishedState {
            ingress_time_ns,
            error_bound_ns,
            holdover_multiplier,
            clock_smearing_start_s: 0,
            clock_smearing_end_s: 0,
            utc_offset_pre_s: 0,
            utc_offset_post_s: 0,
            v2: None,
        }
    }

    fn library_with_state(state: &PublishedState, phc: Box<dyn PhcTimeSource>) -> (Library, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let mut writer = ShmMapping::create_writer(file.path(), Protocol::V1).unwrap();
        writer.store(state).unwrap();
        let lib = Library::init(file.path(), Protocol::V1, phc, false).unwrap();
        (lib, file)
    }

    #[test]
    fn no_data_before_any_publish() {
        let file = NamedTempFile::new().unwrap();
        let _writer = ShmMapping::create_writer(file.path(), Protocol::V1).unwrap();
        let phc = Box::new(FixedPhcTimeSource {
            sample: Ok(PhcSample { phc_time_ns: 100, round_trip_delay_ns: 1 }),
            sysclock_ns: 0,
        });
        let mut lib = Library::init(file.path(), Protocol::V1, phc, false).unwrap();
        let err = lib.gettime(TimeStandard::Tai).unwrap_err();
        assert_eq!(err, ClientError::NoData);
    }

    #[test]
    fn wou_too_big_when_error_bound_saturated() {
        let state = published(u32::MAX, 1.0, 1);
        let phc = Box::new(FixedPhcTimeSource {
            sample: Ok(PhcSample { phc_time_ns: 100, round_trip_delay_ns: 1 }),
            sysclock_ns: 0,
        });
        let (mut lib, _file) = library_with_state(&state, phc);
        assert_eq!(lib.gettime(TimeStandard::Tai).unwrap_err(), ClientError::WouTooBig);
    }

    #[test]
    fn phc_in_the_past_is_rejected() {
        let state = published(100, 1.0, 1_000_000);
        let phc = Box::new(FixedPhcTimeSource {
            sample: Ok(PhcSample { phc_time_ns: 100, round_trip_delay_ns: 1 }),
            sysclock_ns: 0,
        });
        let (mut lib, _file) = library_with_state(&state, phc);
        assert_eq!(lib.gettime(TimeStandard::Tai).unwrap_err(), ClientError::PhcInThePast);
    }

    #[test]
    fn basic_interval_is_symmetric_around_phc_time() {
        let state = published(50, 0.0, 0);
        let phc = Box::new(FixedPhcTimeSource {
            sample: Ok(PhcSample { phc_time_ns: 1_000_000, round_trip_delay_ns: 10 }),
            sysclock_ns: 0,
        });
        let (mut lib, _file) = library_with_state(&state, phc);
        let tt = lib.gettime(TimeStandard::Tai).unwrap();
        let wou = 50 + 10;
        assert_eq!(tt.earliest_ns, 1_000_000 - wou as u64);
        assert_eq!(tt.latest_ns, 1_000_000 + wou as u64);
    }

    #[test]
    fn holdover_drift_grows_wou_with_elapsed_time() {
        let state = published(50, 100.0, 0);
        let phc = Box::new(FixedPhcTimeSource {
            sample: Ok(PhcSample { phc_time_ns: 2_000_000_000, round_trip_delay_ns: 0 }),
            sysclock_ns: 0,
        });
        let (mut lib, _file) = library_with_state(&state, phc);
        let tt = lib.gettime(TimeStandard::Tai).unwrap();
        // seconds_since_sync = 2.0s, holdover growth = 100 * 2.0 = 200ns
        let wou = 50 + 200;
        assert_eq!(tt.latest_ns - tt.earliest_ns, 2 * wou as u64);
    }

    #[test]
    fn client_stats_record_errors_and_successes() {
        let state = published(50, 0.0, 0);
        let phc = Box::new(FixedPhcTimeSource {
            sample: Ok(PhcSample { phc_time_ns: 1_000, round_trip_delay_ns: 0 }),
            sysclock_ns: 0,
        });
        let (mut lib, _file) = library_with_state(&state, phc);
        lib.gettime(TimeStandard::Tai).unwrap();
        let summary = lib.stats().summary();
        assert_eq!(summary.requests, 1);
        assert_eq!(summary.errors, 0);
    }
}
