//! The mutex-guarded ring sample store (spec §4.C).
//!
//! Three independent fixed-capacity rings of identical capacity share one
//! lock: DataPoints, M-scalars, and linearizability test results. The
//! estimator and tester threads both push into this store; reads always
//! copy out, so no caller ever holds a reference into the ring across a
//! push.

use std::sync::Mutex;

/// Sentinel duration (ns) for `ClockAccuracy::Unknown` (spec §3: "equals
/// the nanosecond duration of the current `ClockAccuracy` enum"; PTP
/// reserves the top accuracy-enum value to mean "unknown", conventionally
/// mapped to the widest representable bound).
pub const CLOCK_ACCURACY_UNKNOWN_NS: f64 = u32::MAX as f64;

/// A single poll-cycle snapshot (spec §3 "DataPoint").
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct DataPoint {
    pub ingress_time_ns: i64,
    pub master_offset_ns: f64,
    pub path_delay_ns: f64,
    pub freq_adjustment_ppb: f64,
    pub clock_accuracy_ns: f64,
}

impl DataPoint {
    /// A datapoint is valid iff all five fields are non-zero and
    /// `clock_accuracy_ns` is strictly below the "unknown" sentinel (spec
    /// §3 invariant, §8 property 4).
    pub fn is_valid(&self) -> bool {
        self.ingress_time_ns != 0
            && self.master_offset_ns != 0.0
            && self.path_delay_ns != 0.0
            && self.freq_adjustment_ppb != 0.0
            && self.clock_accuracy_ns != 0.0
            && self.clock_accuracy_ns < CLOCK_ACCURACY_UNKNOWN_NS
    }
}

/// Per-target linearizability probe outcome (spec §3 "Linearizability test
/// result", §4.F).
#[derive(Debug, Clone, PartialEq)]
pub struct TestResult {
    pub endpoint: String,
    pub good: bool,
    pub explain: String,
}

/// A fixed-capacity, newest-overwrites-oldest circular buffer.
#[derive(Debug, Clone)]
struct Ring<T> {
    slots: Vec<Option<T>>,
    /// Index the *next* push will write to.
    head: usize,
    len: usize,
}

impl<T: Clone> Ring<T> {
    fn new(capacity: usize) -> Self {
        Ring {
            slots: vec![None; capacity],
            head: 0,
            len: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn push(&mut self, value: T) {
        let cap = self.capacity();
        self.slots[self.head] = Some(value);
        self.head = (self.head + 1) % cap;
        self.len = (self.len + 1).min(cap);
    }

    /// Newest-first slice of up to `n` elements. Spec: "skipping empty
    /// slots" — with a ring that never resets slots to `None` after first
    /// wraparound this only matters before the ring is first full, which
    /// `self.len` already accounts for.
    fn take_newest(&self, n: usize) -> Vec<T> {
        let cap = self.capacity();
        let count = n.min(self.len);
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            let idx = (self.head + cap - 1 - i) % cap;
            if let Some(v) = &self.slots[idx] {
                out.push(v.clone());
            }
        }
        out
    }

    fn len(&self) -> usize {
        self.len
    }
}

struct Inner {
    datapoints: Ring<DataPoint>,
    m_values: Ring<f64>,
    test_results: Ring<TestResult>,
    ingress_time_ns: i64,
}

/// The shared sample store (spec §4.C). Cloneable handle backed by an
/// `Arc<Mutex<_>>`-free single `Mutex` here since the store itself is
/// always held behind an `Arc` by callers (estimator + tester share one
/// instance).
pub struct SampleStore {
    inner: Mutex<Inner>,
}

impl SampleStore {
    pub fn new(capacity: usize) -> Self {
        SampleStore {
            inner: Mutex::new(Inner {
                datapoints: Ring::new(capacity),
                m_values: Ring::new(capacity),
                test_results: Ring::new(capacity),
                ingress_time_ns: 0,
            }),
        }
    }

    /// Size the store against [`crate::config::Config::effective_ring_capacity`]
    /// rather than the raw `ring_size` — the natural-looking `SampleStore::new(config.ring_size)`
    /// silently undersizes the ring whenever the 60s floor dominates, which
    /// permanently starves `tick()` of enough history to ever publish.
    pub fn for_config(config: &crate::config::Config) -> Self {
        Self::new(config.effective_ring_capacity())
    }

    /// Capacity shared by all three rings, for callers that need to assert
    /// it against [`crate::config::Config::effective_ring_capacity`].
    pub fn capacity(&self) -> usize {
        self.inner.lock().expect("sample store mutex poisoned").datapoints.capacity()
    }

    pub fn push_datapoint(&self, dp: DataPoint) {
        let mut inner = self.inner.lock().expect("sample store mutex poisoned");
        inner.datapoints.push(dp);
    }

    pub fn push_m(&self, m: f64) {
        let mut inner = self.inner.lock().expect("sample store mutex poisoned");
        inner.m_values.push(m);
    }

    pub fn push_linearizability_result(&self, result: TestResult) {
        let mut inner = self.inner.lock().expect("sample store mutex poisoned");
        inner.test_results.push(result);
    }

    pub fn newest_datapoints(&self, n: usize) -> Vec<DataPoint> {
        let inner = self.inner.lock().expect("sample store mutex poisoned");
        inner.datapoints.take_newest(n)
    }

    pub fn newest_m(&self, n: usize) -> Vec<f64> {
        let inner = self.inner.lock().expect("sample store mutex poisoned");
        inner.m_values.take_newest(n)
    }

    pub fn newest_test_results(&self, n: usize) -> Vec<TestResult> {
        let inner = self.inner.lock().expect("sample store mutex poisoned");
        inner.test_results.take_newest(n)
    }

    pub fn datapoint_count(&self) -> usize {
        self.inner.lock().expect("sample store mutex poisoned").datapoints.len()
    }

    pub fn m_count(&self) -> usize {
        self.inner.lock().expect("sample store mutex poisoned").m_values.len()
    }

    pub fn update_ingress_time_ns(&self, value: i64) {
        self.inner.lock().expect("sample store mutex poisoned").ingress_time_ns = value;
    }

    pub fn ingress_time_ns(&self) -> i64 {
        self.inner.lock().expect("sample store mutex poisoned").ingress_time_ns
    }

    /// Per-field elementwise max of absolute values over the newest `n`
    /// datapoints (spec §4.C, §8 property 6). Returns the zero datapoint if
    /// the ring is empty.
    pub fn aggregate_abs_max(&self, n: usize) -> DataPoint {
        let points = self.newest_datapoints(n);
        let mut out = DataPoint {
            ingress_time_ns: 0,
            master_offset_ns: 0.0,
            path_delay_ns: 0.0,
            freq_adjustment_ppb: 0.0,
            clock_accuracy_ns: 0.0,
        };
        for p in &points {
            out.ingress_time_ns = out.ingress_time_ns.max(p.ingress_time_ns.abs());
            out.master_offset_ns = out.master_offset_ns.max(p.master_offset_ns.abs());
            out.path_delay_ns = out.path_delay_ns.max(p.path_delay_ns.abs());
            out.freq_adjustment_ppb = out.freq_adjustment_ppb.max(p.freq_adjustment_ppb.abs());
            out.clock_accuracy_ns = out.clock_accuracy_ns.max(p.clock_accuracy_ns.abs());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dp(offset: f64) -> DataPoint {
        DataPoint {
            ingress_time_ns: 1,
            master_offset_ns: offset,
            path_delay_ns: 213.0,
            freq_adjustment_ppb: 1.0,
            clock_accuracy_ns: 100.0,
        }
    }

    #[test]
    fn valid_datapoint_passes_sanity_check() {
        assert!(dp(23.0).is_valid());
    }

    #[test]
    fn zero_field_fails_sanity_check() {
        let mut d = dp(23.0);
        d.path_delay_ns = 0.0;
        assert!(!d.is_valid());
    }

    #[test]
    fn unknown_clock_accuracy_fails_sanity_check() {
        let mut d = dp(23.0);
        d.clock_accuracy_ns = CLOCK_ACCURACY_UNKNOWN_NS;
        assert!(!d.is_valid());
    }

    #[test]
    fn all_zero_datapoint_fails_sanity_check() {
        let zero = DataPoint {
            ingress_time_ns: 0,
            master_offset_ns: 0.0,
            path_delay_ns: 0.0,
            freq_adjustment_ppb: 0.0,
            clock_accuracy_ns: 0.0,
        };
        assert!(!zero.is_valid());
    }

    #[test]
    fn newest_first_ordering() {
        let store = SampleStore::new(4);
        for i in 1..=3 {
            store.push_datapoint(dp(i as f64));
        }
        let newest = store.newest_datapoints(3);
        assert_eq!(newest[0].master_offset_ns, 3.0);
        assert_eq!(newest[2].master_offset_ns, 1.0);
    }

    #[test]
    fn overwrites_oldest_past_capacity() {
        let store = SampleStore::new(2);
        store.push_datapoint(dp(1.0));
        store.push_datapoint(dp(2.0));
        store.push_datapoint(dp(3.0));
        let newest = store.newest_datapoints(2);
        assert_eq!(newest.len(), 2);
        assert_eq!(newest[0].master_offset_ns, 3.0);
        assert_eq!(newest[1].master_offset_ns, 2.0);
    }

    #[test]
    fn insufficient_history_returns_short_slice() {
        let store = SampleStore::new(30);
        for _ in 0..29 {
            store.push_datapoint(dp(1.0));
        }
        assert_eq!(store.datapoint_count(), 29);
        assert!(store.newest_datapoints(30).len() < 30);
    }

    #[test]
    fn aggregate_abs_max_is_elementwise_and_order_independent() {
        let store = SampleStore::new(8);
        let a = DataPoint {
            ingress_time_ns: -5,
            master_offset_ns: -10.0,
            path_delay_ns: 1.0,
            freq_adjustment_ppb: 100.0,
            clock_accuracy_ns: 1.0,
        };
        let b = DataPoint {
            ingress_time_ns: 3,
            master_offset_ns: 2.0,
            path_delay_ns: -99.0,
            freq_adjustment_ppb: -1.0,
            clock_accuracy_ns: 2.0,
        };
        store.push_datapoint(a);
        store.push_datapoint(b);
        let agg = store.aggregate_abs_max(2);
        assert_eq!(agg.ingress_time_ns, 5);
        assert_eq!(agg.master_offset_ns, 10.0);
        assert_eq!(agg.path_delay_ns, 99.0);
        assert_eq!(agg.freq_adjustment_ppb, 100.0);
        assert_eq!(agg.clock_accuracy_ns, 2.0);

        let store2 = SampleStore::new(8);
        store2.push_datapoint(b);
        store2.push_datapoint(a);
        let agg2 = store2.aggregate_abs_max(2);
        assert_eq!(agg, agg2);
    }

    #[test]
    fn ingress_time_getter_setter_roundtrips() {
        let store = SampleStore::new(4);
        store.update_ingress_time_ns(42);
        assert_eq!(store.ingress_time_ns(), 42);
    }
}
