//! The linearizability tester coordinator (spec §4.F).
//!
//! Periodically verifies that non-selected grandmasters would yield
//! timestamps consistent with the currently selected one. Each target gets
//! a persistent [`Tester`], constructed lazily and never torn down — an
//! intentional leak the design accepts in favor of simplicity (spec §4.F
//! step 3, "Cancellation").

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::estimator::GrandmasterEndpoint;
use crate::ring::{SampleStore, TestResult};
use crate::stats::EstimatorStats;

/// The outcome of one probe against one target (spec §4.F step 4).
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Good { explain: String },
    Bad { explain: String },
    /// Too few measurements were collected to judge (spec §4.F step 4:
    /// "`noTestResults` and it is counted as failed").
    NoTestResults,
}

/// Probes one target for linearizability against the selected grandmaster.
/// The actual PTP wire exchange is an out-of-scope collaborator (spec §1);
/// implementors supply a concrete prober (e.g. one that issues a PTP
/// delay-request-style exchange and compares timestamps against
/// `max_gm_offset`).
pub trait LinearizabilityProbe: Send {
    fn probe(&mut self, target: &str, max_gm_offset: Duration) -> ProbeOutcome;
}

/// A test double that always returns a fixed outcome.
pub struct FixedOutcomeProbe(pub ProbeOutcome);

impl LinearizabilityProbe for FixedOutcomeProbe {
    fn probe(&mut self, _target: &str, _max_gm_offset: Duration) -> ProbeOutcome {
        self.0.clone()
    }
}

/// Persistent per-target state. Spec §4.F: "lazily construct a persistent
/// Tester (one per target; listeners started once per target and never
/// torn down)". `started` models the listener having been brought up once;
/// nothing in this struct is ever cleaned up by the coordinator.
#[derive(Debug, Default)]
pub struct Tester {
    started: bool,
    last_outcome: Option<ProbeOutcome>,
}

impl Tester {
    fn ensure_started(&mut self) {
        if !self.started {
            self.started = true;
        }
    }
}

/// Diff the previous and current target sets (spec §4.F step 2, §8 scenario
/// S4). Order-preserving relative to `new`.
pub fn diff_targets(old: &[String], new: &[String]) -> (Vec<String>, Vec<String>) {
    let added: Vec<String> = new.iter().filter(|t| !old.contains(t)).cloned().collect();
    let removed: Vec<String> = old.iter().filter(|t| !new.contains(t)).cloned().collect();
    (added, removed)
}

/// One cycle's aggregated counters (spec §4.F step 5).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct CycleSummary {
    pub total_tests: u64,
    pub failed_tests: u64,
    pub passed_tests: u64,
}

/// Coordinates per-target testers and aggregates results into the shared
/// ring and stats (spec §4.F).
pub struct LinearizabilityCoordinator {
    store: Arc<SampleStore>,
    stats: Arc<EstimatorStats>,
    max_gm_offset: Duration,
    testers: HashMap<String, Tester>,
    previous_targets: Vec<String>,
}

impl LinearizabilityCoordinator {
    pub fn new(store: Arc<SampleStore>, stats: Arc<EstimatorStats>, max_gm_offset: Duration) -> Self {
        LinearizabilityCoordinator {
            store,
            stats,
            max_gm_offset,
            testers: HashMap::new(),
            previous_targets: Vec::new(),
        }
    }

    /// Run one coordinator cycle (spec §4.F steps 1–5): candidates are the
    /// non-selected, error-free, GM-present endpoints already filtered out
    /// of `fetch_gms`'s full response by the caller (spec §4.F step 1).
    ///
    /// Probes run in parallel across targets, one scoped thread per target,
    /// each with its own prober from `probe_factory` (spec.md: "Run the
    /// test in parallel across targets with best-effort cancellation on
    /// context done"; "A worker pool (task group with cancellation) runs
    /// per-target probes in parallel"). `cancel` is checked by each spawned
    /// probe before it runs; a target observed post-cancellation is
    /// recorded as `NoTestResults` rather than left unaccounted for.
    pub fn run_cycle(
        &mut self,
        candidates: &[GrandmasterEndpoint],
        probe_factory: &(dyn Fn() -> Box<dyn LinearizabilityProbe> + Sync),
        cancel: &AtomicBool,
    ) -> CycleSummary {
        let targets: Vec<String> = candidates.iter().map(|gm| gm.address.clone()).collect();
        let (added, removed) = diff_targets(&self.previous_targets, &targets);
        for t in &added {
            info!(target = %t, "linearizability target added");
        }
        for t in &removed {
            info!(target = %t, "linearizability target removed");
        }
        self.previous_targets = targets.clone();

        for target in &targets {
            self.testers.entry(target.clone()).or_default().ensure_started();
        }

        let max_gm_offset = self.max_gm_offset;
        let outcomes: Vec<(String, ProbeOutcome)> = std::thread::scope(|scope| {
            let handles: Vec<_> = targets
                .iter()
                .map(|target| {
                    let target = target.clone();
                    scope.spawn(move || {
                        if cancel.load(Ordering::Relaxed) {
                            return (target, ProbeOutcome::NoTestResults);
                        }
                        let mut prober = probe_factory();
                        let outcome = prober.probe(&target, max_gm_offset);
                        (target, outcome)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("linearizability probe thread panicked"))
                .collect()
        });

        let mut summary = CycleSummary::default();
        for (target, outcome) in outcomes {
            let result = match &outcome {
                ProbeOutcome::Good { explain } => {
                    summary.passed_tests += 1;
                    TestResult { endpoint: target.clone(), good: true, explain: explain.clone() }
                }
                ProbeOutcome::Bad { explain } => {
                    summary.failed_tests += 1;
                    TestResult { endpoint: target.clone(), good: false, explain: explain.clone() }
                }
                ProbeOutcome::NoTestResults => {
                    summary.failed_tests += 1;
                    TestResult {
                        endpoint: target.clone(),
                        good: false,
                        explain: "noTestResults".to_string(),
                    }
                }
            };
            summary.total_tests += 1;
            if let Some(tester) = self.testers.get_mut(&target) {
                tester.last_outcome = Some(outcome);
            }
            self.store.push_linearizability_result(result);
        }

        self.stats.record_linearizability_cycle(summary.total_tests, summary.failed_tests, summary.passed_tests);
        summary
    }

    pub fn tester_count(&self) -> usize {
        self.testers.len()
    }
}
