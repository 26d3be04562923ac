//! Error taxonomy for fbclock, grouped by where each error can occur rather
//! than by root cause: configuration errors are fatal at startup, cycle
//! errors are counted and swallowed by the estimator loop, and client errors
//! are returned to callers of [`crate::client`] as typed codes.

use std::io;

/// An error parsing or type-checking a user-supplied expression (see
/// [`crate::eval`]). Always fatal at startup: a bad expression is a
/// configuration error, never something the estimator loop can recover from
/// mid-run.
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("unexpected end of expression")]
    UnexpectedEof,

    #[error("unexpected token {0:?}")]
    UnexpectedToken(String),

    #[error("unknown variable `{0}`")]
    UnknownVariable(String),

    #[error("unknown function `{0}`")]
    UnknownFunction(String),

    #[error("`{function}` expects {expected} argument(s), got {got}")]
    Arity {
        function: &'static str,
        expected: usize,
        got: usize,
    },
}

/// A configuration error. Fatal: the estimator refuses to start.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid `{field}` expression: {source}")]
    Expression {
        field: &'static str,
        #[source]
        source: EvalError,
    },

    #[error("interval must be in (0s, 60s], got {0:?}")]
    BadInterval(std::time::Duration),

    #[error("ring_size must be greater than zero")]
    BadRingSize,

    #[error("ptp_client_address must be set")]
    MissingPtpAddress,
}

/// An error from the PTP client or PHC-device collaborators (spec §6, §9).
/// The core does not implement either wire protocol, so this only carries
/// a human-readable cause, not a structured code.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct PtpClientError(pub String);

/// An error occurring during a single estimator tick (spec §4.D, §7). None of
/// these are fatal: the loop logs, counts, and moves on to the next tick.
#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error("failed to fetch stats from the PTP client: {0}")]
    PtpClientUnavailable(String),

    #[error("failed to read PHC frequency: {0}")]
    PhcUnavailable(String),

    #[error("datapoint failed sanity check")]
    DataInvalid,

    #[error("not enough data in the ring yet")]
    InsufficientHistory,

    #[error("computed window W is not positive")]
    WindowNotPositive,

    #[error("failed to publish SHM state: {0}")]
    ShmPublishFailed(#[from] ShmError),
}

/// An error reading or writing the shared-memory channel (spec §4.A).
#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    #[error("failed to open SHM file: {0}")]
    Open(#[source] io::Error),

    #[error("failed to map SHM file: {0}")]
    Map(#[source] io::Error),

    #[error("SHM segment is too small for the expected layout")]
    SegmentMalformed,

    #[error("exhausted retry budget validating CRC")]
    CrcExhausted,

    #[error("exhausted retry budget validating sequence number")]
    SeqExhausted,
}

/// Stable integer codes for [`crate::client`] errors, forming part of the
/// external ABI (spec §4.G, §6). The discriminants are load-bearing: do not
/// renumber.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[repr(i32)]
pub enum ClientError {
    #[error("failed to map the SHM segment")]
    ShmemMapFailed = -1,
    #[error("failed to open the SHM segment")]
    ShmemOpen = -2,
    #[error("failed to read the PHC offset")]
    PtpReadOffset = -3,
    #[error("failed to open the PHC device")]
    PtpOpen = -4,
    #[error("no data has been published to the SHM segment yet")]
    NoData = -5,
    #[error("the window of uncertainty has grown unreasonably large")]
    WouTooBig = -6,
    #[error("the PHC clock moved backwards relative to the last sync")]
    PhcInThePast = -7,
    #[error("CRC validation of the SHM segment failed")]
    CrcMismatch = -8,
}

impl ClientError {
    /// The integer ABI code for this error, per spec §4.G.
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Reconstruct a `ClientError` from an ABI code, for the C-facing
    /// `strerror`-style lookup. Returns `None` for `NO_ERROR` (0) or unknown
    /// codes.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -1 => Some(Self::ShmemMapFailed),
            -2 => Some(Self::ShmemOpen),
            -3 => Some(Self::PtpReadOffset),
            -4 => Some(Self::PtpOpen),
            -5 => Some(Self::NoData),
            -6 => Some(Self::WouTooBig),
            -7 => Some(Self::PhcInThePast),
            -8 => Some(Self::CrcMismatch),
            _ => None,
        }
    }
}

/// `SegmentMalformed`/`CrcExhausted`/`SeqExhausted` only ever reach this
/// conversion when the caller did not opt into
/// `Config::suppress_crc_mismatch` (spec §9 open question (i)): with
/// suppression enabled, `shm::load_v1`/`load_v2` return the last-observed
/// snapshot as `Ok` instead of producing these variants at all, so the gate
/// lives upstream in the SHM read path rather than in this mapping.
impl From<ShmError> for ClientError {
    fn from(e: ShmError) -> Self {
        match e {
            ShmError::Open(_) => ClientError::ShmemOpen,
            ShmError::Map(_) => ClientError::ShmemMapFailed,
            ShmError::SegmentMalformed
            | ShmError::CrcExhausted
            | ShmError::SeqExhausted => ClientError::CrcMismatch,
        }
    }
}
