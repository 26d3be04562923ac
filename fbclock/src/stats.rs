//! Counters published by the estimator loop and the gettime client core
//! (spec §4.D step 3, §4.F step 5, §8 scenario S6).
//!
//! spec.md's HTTP stats endpoint is an explicit non-goal (§1); this module
//! only defines and accumulates the counters, leaving whatever serves them
//! over HTTP to the excluded outer layer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::ring::DataPoint;

/// Point-in-time gauge values the estimator republishes every cycle (spec
/// §4.D step 3, step 12).
#[derive(Debug, Copy, Clone, PartialEq, Default)]
pub struct GaugeSnapshot {
    pub master_offset_ns: f64,
    pub path_delay_ns: f64,
    pub ingress_time_ns: i64,
    pub freq_adj_ppb: f64,
    pub clock_accuracy_ns: f64,
    pub m_ns: f64,
    pub w_ns: f64,
    pub aggregate_abs_max_60: Option<DataPoint>,
}

/// Estimator-side counters: raw per-cycle gauges plus monotonic error and
/// linearizability counters.
#[derive(Debug, Default)]
pub struct EstimatorStats {
    gauges: Mutex<GaugeSnapshot>,
    data_error: AtomicU64,
    phc_error: AtomicU64,
    data_sanity_check_error: AtomicU64,
    linearizability_total_tests: AtomicU64,
    linearizability_failed_tests: AtomicU64,
    linearizability_passed_tests: AtomicU64,
}

impl EstimatorStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish the raw per-cycle fields (spec §4.D step 3).
    pub fn record_raw(&self, dp: &DataPoint) {
        let mut g = self.gauges.lock().expect("stats mutex poisoned");
        g.master_offset_ns = dp.master_offset_ns;
        g.path_delay_ns = dp.path_delay_ns;
        g.ingress_time_ns = dp.ingress_time_ns;
        g.freq_adj_ppb = dp.freq_adjustment_ppb;
        g.clock_accuracy_ns = dp.clock_accuracy_ns;
    }

    pub fn record_m(&self, m_ns: f64) {
        self.gauges.lock().expect("stats mutex poisoned").m_ns = m_ns;
    }

    pub fn record_w(&self, w_ns: f64) {
        self.gauges.lock().expect("stats mutex poisoned").w_ns = w_ns;
    }

    /// `*.60.abs_max` (spec §4.D step 12).
    pub fn record_aggregate_abs_max_60(&self, dp: DataPoint) {
        self.gauges.lock().expect("stats mutex poisoned").aggregate_abs_max_60 = Some(dp);
    }

    pub fn incr_data_error(&self) {
        self.data_error.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_phc_error(&self) {
        self.phc_error.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_data_sanity_check_error(&self) {
        self.data_sanity_check_error.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_linearizability_cycle(&self, total: u64, failed: u64, passed: u64) {
        self.linearizability_total_tests.fetch_add(total, Ordering::Relaxed);
        self.linearizability_failed_tests.fetch_add(failed, Ordering::Relaxed);
        self.linearizability_passed_tests.fetch_add(passed, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> GaugeSnapshot {
        *self.gauges.lock().expect("stats mutex poisoned")
    }

    pub fn data_error_count(&self) -> u64 {
        self.data_error.load(Ordering::Relaxed)
    }

    pub fn phc_error_count(&self) -> u64 {
        self.phc_error.load(Ordering::Relaxed)
    }

    pub fn data_sanity_check_error_count(&self) -> u64 {
        self.data_sanity_check_error.load(Ordering::Relaxed)
    }

    pub fn linearizability_counts(&self) -> (u64, u64, u64) {
        (
            self.linearizability_total_tests.load(Ordering::Relaxed),
            self.linearizability_failed_tests.load(Ordering::Relaxed),
            self.linearizability_passed_tests.load(Ordering::Relaxed),
        )
    }
}

/// Histogram buckets for observed WOU latency, in nanoseconds. Each bucket
/// is exclusive of the next: a value lands in the first bucket whose upper
/// bound it is strictly less than.
const LATENCY_BUCKETS_NS: [u64; 2] = [10_000, 100_000];

#[derive(Debug, Default)]
struct ClientStatsInner {
    requests: u64,
    errors: u64,
    wou_sum_ns: u64,
    wou_count: u64,
    wou_max_ns: u64,
    bucket_counts: [u64; LATENCY_BUCKETS_NS.len()],
}

/// Client-side call statistics (spec §8 scenario S6). Every `gettime` call
/// increments `requests`; a successful call additionally folds its WOU
/// into the running average/max and the matching latency bucket.
#[derive(Debug, Default)]
pub struct ClientStats {
    inner: Mutex<ClientStatsInner>,
}

/// A point-in-time read of [`ClientStats`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct ClientStatsSummary {
    pub requests: u64,
    pub errors: u64,
    pub wou_avg_ns: u64,
    pub wou_max_ns: u64,
    /// Count of successful calls whose WOU fell in `[0, 10us)`.
    pub count_under_10us: u64,
    /// Count of successful calls whose WOU fell in `[10us, 100us)`.
    pub count_10us_to_100us: u64,
}

impl ClientStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_error(&self) {
        let mut inner = self.inner.lock().expect("client stats mutex poisoned");
        inner.requests += 1;
        inner.errors += 1;
    }

    pub fn record_success(&self, wou_ns: u64) {
        let mut inner = self.inner.lock().expect("client stats mutex poisoned");
        inner.requests += 1;
        inner.wou_sum_ns += wou_ns;
        inner.wou_count += 1;
        inner.wou_max_ns = inner.wou_max_ns.max(wou_ns);
        if wou_ns < LATENCY_BUCKETS_NS[0] {
            inner.bucket_counts[0] += 1;
        } else if wou_ns < LATENCY_BUCKETS_NS[1] {
            inner.bucket_counts[1] += 1;
        }
    }

    pub fn summary(&self) -> ClientStatsSummary {
        let inner = self.inner.lock().expect("client stats mutex poisoned");
        ClientStatsSummary {
            requests: inner.requests,
            errors: inner.errors,
            wou_avg_ns: if inner.wou_count == 0 { 0 } else { inner.wou_sum_ns / inner.wou_count },
            wou_max_ns: inner.wou_max_ns,
            count_under_10us: inner.bucket_counts[0],
            count_10us_to_100us: inner.bucket_counts[1],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s6_stats_rollup_matches_worked_example() {
        let stats = ClientStats::new();
        stats.record_success(11);
        stats.record_success(431);
        stats.record_error();
        stats.record_success(801);
        stats.record_error();
        stats.record_success(30301);

        let summary = stats.summary();
        assert_eq!(summary.requests, 6);
        assert_eq!(summary.errors, 2);
        assert_eq!(summary.wou_avg_ns, 7886);
        assert_eq!(summary.wou_max_ns, 30301);
        assert_eq!(summary.count_under_10us, 3);
        assert_eq!(summary.count_10us_to_100us, 1);
    }

    #[test]
    fn estimator_stats_counts_errors_independently() {
        let stats = EstimatorStats::new();
        stats.incr_data_error();
        stats.incr_data_error();
        stats.incr_phc_error();
        assert_eq!(stats.data_error_count(), 2);
        assert_eq!(stats.phc_error_count(), 1);
        assert_eq!(stats.data_sanity_check_error_count(), 0);
    }

    #[test]
    fn estimator_stats_records_raw_gauges() {
        let stats = EstimatorStats::new();
        stats.record_raw(&DataPoint {
            ingress_time_ns: 10,
            master_offset_ns: 23.0,
            path_delay_ns: 213.0,
            freq_adjustment_ppb: 1.0,
            clock_accuracy_ns: 100.0,
        });
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.master_offset_ns, 23.0);
        assert_eq!(snapshot.ingress_time_ns, 10);
    }
}
