//! Estimator configuration (spec §6 "Estimator configuration").
//!
//! Plain, programmatically constructed structs — no `serde`/YAML derive.
//! Parsing a config file from disk is the excluded CLI/YAML layer (spec
//! §1); this module only defines the shape callers must fill in, and
//! validates it.

use std::time::Duration;

use crate::error::ConfigError;
use crate::eval::Expr;

/// The three user-supplied expressions evaluated each cycle (spec §4.B,
/// §6).
#[derive(Debug, Clone)]
pub struct ExpressionSet {
    pub m: Expr,
    pub w: Expr,
    pub drift: Expr,
}

impl ExpressionSet {
    /// Parse the three expression strings, reporting the first failure as
    /// a [`ConfigError::Expression`] naming which field failed.
    pub fn parse(m: &str, w: &str, drift: &str) -> Result<Self, ConfigError> {
        Ok(ExpressionSet {
            m: Expr::parse(m).map_err(|source| ConfigError::Expression { field: "math.m", source })?,
            w: Expr::parse(w).map_err(|source| ConfigError::Expression { field: "math.w", source })?,
            drift: Expr::parse(drift).map_err(|source| ConfigError::Expression { field: "math.drift", source })?,
        })
    }

    /// The built-in defaults named in spec §6.
    pub fn default_set() -> Self {
        Self::parse(
            "mean(clockaccuracy,100) + abs(mean(offset,100)) + 1.0*stddev(offset,100)",
            "mean(m,100) + 4.0*stddev(m,100)",
            "1.5*mean(freqchangeabs,99)",
        )
        .expect("built-in default expressions must always parse")
    }
}

/// How the estimator reaches the PTP client (spec §6, §9 "dynamic
/// dispatch").
#[derive(Debug, Clone)]
pub enum PtpClientAddress {
    /// Unix-datagram management socket path.
    UnixSocket(String),
    /// HTTP stats endpoint base URL.
    Http(String),
}

/// Estimator options (spec §6). Constructed programmatically by whatever
/// outer layer owns CLI/YAML parsing; this type only validates the result.
#[derive(Debug, Clone)]
pub struct Config {
    pub ptp_client_address: PtpClientAddress,
    pub ring_size: usize,
    pub interval: Duration,
    pub iface: String,
    pub sptp: bool,
    pub linearizability_test_interval: Duration,
    pub linearizability_test_max_gm_offset: Duration,
    pub boot_delay: Duration,
    pub enable_data_v2: bool,
    pub math: ExpressionSet,
    /// Opt-in legacy tolerance for a torn v1 SHM read (spec §9 open
    /// question (i)): when `true`, a reader that exhausts its CRC retry
    /// budget returns the last-observed (unvalidated) state as success
    /// instead of `ClientError::CrcMismatch`. Defaults to `false` — the
    /// mismatch is surfaced unless a caller opts into suppressing it.
    pub suppress_crc_mismatch: bool,
}

impl Config {
    /// Validate the configuration, per spec §7's "configuration error"
    /// class: bad expression, bad interval, missing required option. All
    /// are fatal at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() || self.interval > Duration::from_secs(60) {
            return Err(ConfigError::BadInterval(self.interval));
        }
        if self.ring_size == 0 {
            return Err(ConfigError::BadRingSize);
        }
        match &self.ptp_client_address {
            PtpClientAddress::UnixSocket(s) if s.is_empty() => return Err(ConfigError::MissingPtpAddress),
            PtpClientAddress::Http(s) if s.is_empty() => return Err(ConfigError::MissingPtpAddress),
            _ => {}
        }
        Ok(())
    }

    /// `N = max(configured_ring_size, ceil(60s / poll_interval))` (spec
    /// §3 "Sample ring").
    pub fn effective_ring_capacity(&self) -> usize {
        let interval_secs = self.interval.as_secs_f64().max(f64::EPSILON);
        let min_for_60s = (60.0 / interval_secs).ceil() as usize;
        self.ring_size.max(min_for_60s)
    }
}
