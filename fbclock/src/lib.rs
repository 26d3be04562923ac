//! fbclock — a true-time service core.
//!
//! Augments a locally disciplined PTP hardware clock (PHC) with a rigorously
//! bounded Window of Uncertainty (WOU). Callers receive a closed interval
//! `[earliest, latest]`, in nanoseconds, that true time is guaranteed (to a
//! target probability of at least `1 - 1e-9`) to fall within.
//!
//! The crate is split into the two subsystems that cooperate through shared
//! memory:
//!
//! - [`estimator`]: the long-lived daemon loop that turns PTP client metrics
//!   and PHC readings into a published `[error_bound, holdover_drift]` state.
//! - [`client`]: the low-latency routine, safe to call from any process, that
//!   reads that state back out and extrapolates it into a WOU.
//!
//! [`shm`] implements the lock-free single-writer/multi-reader channel that
//! connects the two. [`eval`], [`ring`], [`smear`], and [`tester`] are the
//! supporting pieces named in the design document's component table.

pub mod client;
pub mod config;
pub mod error;
pub mod estimator;
pub mod eval;
pub mod ring;
pub mod shm;
pub mod smear;
pub mod stats;
pub mod tester;

pub use error::{ClientError, ConfigError, CycleError, EvalError, PtpClientError, ShmError};
