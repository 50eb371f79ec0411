use std::time::Duration;

use crate::{sampler::SamplerState, trial::TrialResult};

/// Snapshot of a running sampling call.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingProgress {
    pub target: usize,
    pub accepted: usize,
    pub total_trials: u64,
    /// Accepted trials that arrived after the target was reached
    pub overshoot: u64,
    pub in_flight: u64,
    pub state: SamplerState,
    pub elapsed: Duration,
}

/// The accepted particles of one sampling call and what they cost.
#[derive(Debug, Clone)]
pub struct SamplingOutcome<P> {
    /// Exactly as many particles as requested.
    ///
    /// Which particles end up here depends on the thread interleaving and
    /// is not reproducible between runs. The trials are i.i.d., so this
    /// does not bias the population.
    pub accepted: Vec<P>,
    /// Every trial that was run, accepted or not, including trials that
    /// were still in flight when the target was reached.
    pub total_trials: u64,
}

impl<P> SamplingOutcome<P> {
    pub fn acceptance_rate(&self) -> f64 {
        if self.total_trials == 0 {
            return 0f64;
        }
        self.accepted.len() as f64 / self.total_trials as f64
    }
}

/// Owns the stopping rule and the trial accounting of one sampling call.
///
/// Results are fed in one at a time, so none of the counters need
/// synchronization. Whether a result is kept depends only on how many
/// were kept before, never on its content.
pub(crate) struct Coordinator<P> {
    target: usize,
    kept: Vec<P>,
    total_trials: u64,
    overshoot: u64,
    dispatched: u64,
    finished: u64,
}

impl<P> Coordinator<P> {
    pub(crate) fn new(target: usize) -> Self {
        Self {
            target,
            kept: Vec::with_capacity(target),
            total_trials: 0,
            overshoot: 0,
            dispatched: 0,
            finished: 0,
        }
    }

    pub(crate) fn is_full(&self) -> bool {
        self.kept.len() >= self.target
    }

    pub(crate) fn in_flight(&self) -> u64 {
        self.dispatched - self.finished
    }

    /// The target is reached and every dispatched task has reported back.
    pub(crate) fn is_drained(&self) -> bool {
        self.is_full() && self.in_flight() == 0
    }

    /// Returns the id of the new task.
    pub(crate) fn on_dispatch(&mut self) -> u64 {
        self.dispatched += 1;
        self.dispatched
    }

    pub(crate) fn observe(&mut self, result: TrialResult<P>, completes_task: bool) {
        self.total_trials += 1;
        if completes_task {
            self.finished += 1;
        }
        if let TrialResult::Accepted(payload) = result {
            if self.is_full() {
                self.overshoot += 1;
            } else {
                self.kept.push(payload);
            }
        }
    }

    pub(crate) fn on_abandoned(&mut self) {
        self.finished += 1;
    }

    pub(crate) fn accepted(&self) -> usize {
        self.kept.len()
    }

    pub(crate) fn total_trials(&self) -> u64 {
        self.total_trials
    }

    pub(crate) fn progress(&self, state: SamplerState, elapsed: Duration) -> SamplingProgress {
        SamplingProgress {
            target: self.target,
            accepted: self.kept.len(),
            total_trials: self.total_trials,
            overshoot: self.overshoot,
            in_flight: self.in_flight(),
            state,
            elapsed,
        }
    }

    pub(crate) fn into_outcome(self) -> SamplingOutcome<P> {
        debug_assert_eq!(self.kept.len(), self.target);
        SamplingOutcome {
            accepted: self.kept,
            total_trials: self.total_trials,
        }
    }
}
