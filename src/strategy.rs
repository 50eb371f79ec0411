use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use crossbeam_channel::Sender;

use crate::{
    trial::{run_trial, Simulator},
    worker::WorkerMessage,
};

/// How work is split into tasks for the worker pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum StrategyKind {
    /// One task is a single trial. Fine grained and load balances well
    /// when trial costs vary or the acceptance rate is low.
    #[default]
    EvalParallel,
    /// One task runs trials until one of them is accepted. Amortizes the
    /// dispatch overhead when individual trials are cheap.
    ParticleParallel,
}

/// How a task ended from the point of view of the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskEnd {
    /// The final trial of the task was sent.
    Completed,
    /// The stop flag was seen before the task finished.
    Abandoned,
    /// The coordinator is gone, nobody is listening anymore.
    Disconnected,
}

/// All task shapes implement this trait
pub(crate) trait Strategy: Copy + Send + Sync + 'static {
    fn kind(&self) -> StrategyKind;

    /// Run one task, sending every trial on `results`.
    ///
    /// The stop flag is only checked between simulate calls, a running
    /// trial is never interrupted.
    fn run_task<S: Simulator + ?Sized>(
        &self,
        simulator: &S,
        stop: &AtomicBool,
        results: &Sender<WorkerMessage<S::Payload>>,
    ) -> Result<TaskEnd>;
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct EvalParallel;

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ParticleParallel;

impl Strategy for EvalParallel {
    fn kind(&self) -> StrategyKind {
        StrategyKind::EvalParallel
    }

    fn run_task<S: Simulator + ?Sized>(
        &self,
        simulator: &S,
        stop: &AtomicBool,
        results: &Sender<WorkerMessage<S::Payload>>,
    ) -> Result<TaskEnd> {
        if stop.load(Ordering::Acquire) {
            return Ok(TaskEnd::Abandoned);
        }
        let result = run_trial(simulator)?;
        let message = WorkerMessage::Trial {
            result,
            completes_task: true,
        };
        match results.send(message) {
            Ok(()) => Ok(TaskEnd::Completed),
            Err(_) => Ok(TaskEnd::Disconnected),
        }
    }
}

impl Strategy for ParticleParallel {
    fn kind(&self) -> StrategyKind {
        StrategyKind::ParticleParallel
    }

    fn run_task<S: Simulator + ?Sized>(
        &self,
        simulator: &S,
        stop: &AtomicBool,
        results: &Sender<WorkerMessage<S::Payload>>,
    ) -> Result<TaskEnd> {
        loop {
            if stop.load(Ordering::Acquire) {
                return Ok(TaskEnd::Abandoned);
            }
            let result = run_trial(simulator)?;
            let accepted = result.is_accepted();
            // Rejected trials are reported too, they count towards the total
            let message = WorkerMessage::Trial {
                result,
                completes_task: accepted,
            };
            if results.send(message).is_err() {
                return Ok(TaskEnd::Disconnected);
            }
            if accepted {
                return Ok(TaskEnd::Completed);
            }
        }
    }
}
