//! Single simulation trials and the simulator interface.
//!
//! A trial is one call of the user supplied simulate function. The sampler
//! only looks at whether a trial was accepted; the payload is forwarded
//! untouched.

use std::panic::{self, AssertUnwindSafe};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// The outcome of a single trial.
///
/// Only accepted trials carry a payload, so a rejected trial can never be
/// mistaken for a particle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TrialResult<P> {
    Accepted(P),
    Rejected,
}

impl<P> TrialResult<P> {
    pub fn accepted(payload: P) -> Self {
        TrialResult::Accepted(payload)
    }

    pub fn rejected() -> Self {
        TrialResult::Rejected
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, TrialResult::Accepted(_))
    }

    pub fn payload(&self) -> Option<&P> {
        match self {
            TrialResult::Accepted(payload) => Some(payload),
            TrialResult::Rejected => None,
        }
    }

    pub fn into_payload(self) -> Option<P> {
        match self {
            TrialResult::Accepted(payload) => Some(payload),
            TrialResult::Rejected => None,
        }
    }
}

/// Something that can run ABC trials.
///
/// The simulator is handed to the worker pool once and borrowed by every
/// worker for the lifetime of the pool, so it only has to be `Sync`. It
/// may hold state that can neither be cloned nor serialized.
///
/// Any closure `Fn() -> anyhow::Result<TrialResult<P>>` is a simulator.
pub trait Simulator: Sync {
    /// Data attached to accepted trials.
    type Payload: Send;

    /// Run one trial.
    ///
    /// An error aborts the whole sampling call. It is never retried.
    fn simulate(&self) -> Result<TrialResult<Self::Payload>>;
}

impl<F, P> Simulator for F
where
    F: Fn() -> Result<TrialResult<P>> + Sync,
    P: Send,
{
    type Payload = P;

    fn simulate(&self) -> Result<TrialResult<P>> {
        self()
    }
}

/// Run one trial, turning a panic in the simulator into an error.
pub(crate) fn run_trial<S: Simulator + ?Sized>(simulator: &S) -> Result<TrialResult<S::Payload>> {
    match panic::catch_unwind(AssertUnwindSafe(|| simulator.simulate())) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|msg| msg.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".to_string());
            Err(anyhow!("simulate panicked: {}", message))
        }
    }
}
