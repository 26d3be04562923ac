//! Leap-second smearing (spec §4.E).
//!
//! Spreads a leap second's one-shot discontinuity over a multi-hour window
//! so wall-clock UTC stays monotone and continuous, instead of jumping or
//! repeating a second.

/// One entry from the tzdata-derived leap second table: the TAI instant of
/// the leap and the cumulative leap-second count in force from that instant
/// on.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LeapEvent {
    pub t_tai_s: i64,
    pub n_leap: i32,
}

/// Smearing parameters published alongside the SHM state (spec §3, §4.E).
/// All-zero means smearing is disabled (fewer than two leap records known).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct SmearParams {
    pub smearing_start_s: u64,
    pub smearing_end_s: u64,
    pub utc_offset_pre_s: i32,
    pub utc_offset_post_s: i32,
}

impl SmearParams {
    pub fn is_disabled(&self) -> bool {
        *self == SmearParams::default()
    }
}

/// The fixed duration of the smearing window. Derived from the worked
/// example in spec §8 (S1): `smearing_end_s - smearing_start_s == 62_500`,
/// the same value v2 uses to derive its own `clock_smearing_end_s` — the
/// two protocols share one fixed window, so this module is the single
/// source of truth for it (`fbclock_sys::shm::V2_SMEAR_DURATION_S`
/// re-exports the same number for the wire layout).
pub const SMEAR_WINDOW_DURATION_S: u64 = 62_500;

/// Advance UTC by 1ns every this many ns of TAI elapsed inside the smear
/// window (spec §4.E).
pub const SMEAR_STEP_NS: i64 = 65_000;

/// `UTC - TAI` when smearing is disabled (spec §4.E: "the client applies a
/// fixed `UTC−TAI = −37 s`").
pub const DISABLED_UTC_TAI_OFFSET_S: i64 = -37;

/// The constant anchoring TAI to the historical UTC leap-second count
/// (spec glossary: "they differ by a whole number of leap seconds plus
/// 10").
const TAI_UTC_ANCHOR_S: i64 = 10;

/// Compute the smearing parameters in force given a sorted-ascending list
/// of leap events. With fewer than two entries, smearing is disabled (spec
/// §4.E).
pub fn compute_smear_params(events: &[LeapEvent]) -> SmearParams {
    if events.len() < 2 {
        return SmearParams::default();
    }
    let latest = events[events.len() - 1];
    let earlier = events[events.len() - 2];

    let event_tai = latest.t_tai_s + TAI_UTC_ANCHOR_S;
    let smearing_start_s = event_tai as u64;
    let smearing_end_s = smearing_start_s + SMEAR_WINDOW_DURATION_S;

    SmearParams {
        smearing_start_s,
        smearing_end_s,
        utc_offset_pre_s: earlier.n_leap + TAI_UTC_ANCHOR_S as i32,
        utc_offset_post_s: latest.n_leap + TAI_UTC_ANCHOR_S as i32,
    }
}

/// Apply smearing to a TAI timestamp, producing smeared UTC (spec §4.E
/// "In the client"). When `params` is disabled, applies the fixed −37s
/// offset instead.
pub fn apply_smear(time_ns: i64, params: &SmearParams) -> i64 {
    if params.is_disabled() {
        return time_ns + DISABLED_UTC_TAI_OFFSET_S * 1_000_000_000;
    }

    let smear_start_ns = params.smearing_start_s as i64 * 1_000_000_000;
    let smear_end_ns = params.smearing_end_s as i64 * 1_000_000_000;
    let offset_pre_ns = params.utc_offset_pre_s as i64 * 1_000_000_000;
    let offset_post_ns = params.utc_offset_post_s as i64 * 1_000_000_000;
    let multiplier = (params.utc_offset_post_s - params.utc_offset_pre_s) as i64;

    if time_ns > smear_end_ns {
        time_ns - offset_post_ns
    } else if time_ns < smear_start_ns {
        time_ns - offset_pre_ns
    } else {
        let steps = (time_ns - smear_start_ns).div_euclid(SMEAR_STEP_NS);
        time_ns - (offset_pre_ns + multiplier * steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s1_events() -> Vec<LeapEvent> {
        vec![
            LeapEvent { t_tai_s: 1_435_708_825, n_leap: 26 },
            LeapEvent { t_tai_s: 1_483_228_826, n_leap: 27 },
        ]
    }

    #[test]
    fn s1_matches_worked_example() {
        let params = compute_smear_params(&s1_events());
        assert_eq!(params.smearing_start_s, 1_483_228_836);
        assert_eq!(params.smearing_end_s, 1_483_291_336);
        assert_eq!(params.utc_offset_pre_s, 36);
        assert_eq!(params.utc_offset_post_s, 37);
    }

    #[test]
    fn s2_fewer_than_two_leap_records_disables_smearing() {
        let params = compute_smear_params(&[]);
        assert!(params.is_disabled());
        assert_eq!(apply_smear(1_000_000_000_000, &params), 1_000_000_000_000 - 37_000_000_000);
    }

    #[test]
    fn smear_boundary_before_window_subtracts_pre_offset() {
        let params = compute_smear_params(&s1_events());
        let start_ns = params.smearing_start_s as i64 * 1_000_000_000;
        let t = start_ns - 1;
        assert_eq!(apply_smear(t, &params), t - params.utc_offset_pre_s as i64 * 1_000_000_000);
    }

    #[test]
    fn smear_boundary_after_window_subtracts_post_offset() {
        let params = compute_smear_params(&s1_events());
        let end_ns = params.smearing_end_s as i64 * 1_000_000_000;
        let t = end_ns + 1;
        assert_eq!(apply_smear(t, &params), t - params.utc_offset_post_s as i64 * 1_000_000_000);
    }

    #[test]
    fn inside_window_decreases_by_one_ns_every_65us() {
        let params = compute_smear_params(&s1_events());
        let start_ns = params.smearing_start_s as i64 * 1_000_000_000;
        let t0 = start_ns;
        let t1 = start_ns + SMEAR_STEP_NS;
        let r0 = apply_smear(t0, &params);
        let r1 = apply_smear(t1, &params);
        // r1's own wall-clock advance is SMEAR_STEP_NS, minus the 1ns smear step.
        assert_eq!(r1 - r0, SMEAR_STEP_NS - 1);
    }
}
