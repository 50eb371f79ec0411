use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::available_parallelism,
    time::{Duration, Instant},
};

use anyhow::Context;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use rayon::ThreadPoolBuilder;
use thiserror::Error;

use crate::{
    coordinator::{Coordinator, SamplingOutcome, SamplingProgress},
    strategy::{EvalParallel, ParticleParallel, Strategy, StrategyKind},
    trial::{run_trial, Simulator},
    worker::{self, Task, WorkerMessage},
};

#[derive(Error, Debug)]
pub enum SampleError {
    #[error("Simulation failed in worker {worker}: {source:#}")]
    TrialFailure {
        worker: usize,
        #[source]
        source: anyhow::Error,
    },
    #[error("Could not start worker pool")]
    PoolStartup(#[source] anyhow::Error),
    #[error("Sampling was cancelled after {accepted} accepted of {total_trials} trials")]
    Cancelled { accepted: usize, total_trials: u64 },
    #[error("Number of particles to sample must be positive, got {0}")]
    InvalidTarget(usize),
    #[error("All workers disconnected before the target was reached")]
    Disconnected,
}

impl SampleError {
    /// The caller withdrew the request, nothing went wrong in the workers.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SampleError::Cancelled { .. })
    }
}

/// Lifecycle of one sampling call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerState {
    Idle,
    /// Tasks are being issued and results consumed.
    Dispatching,
    /// The target is reached, in-flight tasks are still reporting back.
    Draining,
    Completed,
    Failed,
    Cancelled,
}

/// Settings for the parallel sampler
#[derive(Debug, Clone, Copy)]
pub struct SamplerSettings {
    /// Number of worker threads. Defaults to the available parallelism.
    pub num_workers: usize,
    /// How trials are grouped into tasks.
    pub strategy: StrategyKind,
    /// How often the coordinator checks for cancellation while no results
    /// arrive.
    pub poll_interval: Duration,
    /// Give up after this long. A timeout is reported as cancellation.
    pub timeout: Option<Duration>,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            num_workers: available_parallelism().map(|n| n.get()).unwrap_or(1),
            strategy: StrategyKind::default(),
            poll_interval: Duration::from_millis(50),
            timeout: None,
        }
    }
}

pub struct ProgressCallback {
    pub callback: Box<dyn FnMut(Duration, SamplingProgress) + Send>,
    pub rate: Duration,
}

/// Cooperative cancellation of a running sampling call.
///
/// Clones share the same flag, so one clone can be handed to another
/// thread while the sampler holds on to the other.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Sample with default settings until `n` trials were accepted.
pub fn sample_until_n_accepted<S: Simulator + ?Sized>(
    n: usize,
    simulator: &S,
) -> Result<SamplingOutcome<S::Payload>, SampleError> {
    Sampler::new(SamplerSettings::default()).sample_until_n_accepted(n, simulator)
}

/// Run trials one after another on the current thread.
///
/// Useful as a reference, and for cheap generations where building a
/// thread pool costs more than it saves.
pub fn sample_sequentially<S: Simulator + ?Sized>(
    n: usize,
    simulator: &S,
) -> Result<SamplingOutcome<S::Payload>, SampleError> {
    if n == 0 {
        return Err(SampleError::InvalidTarget(n));
    }
    let mut coordinator = Coordinator::new(n);
    while !coordinator.is_full() {
        coordinator.on_dispatch();
        let result = run_trial(simulator)
            .map_err(|source| SampleError::TrialFailure { worker: 0, source })?;
        coordinator.observe(result, true);
    }
    Ok(coordinator.into_outcome())
}

/// The parallel acceptance sampler.
///
/// Each call builds a fresh worker pool and coordinator, nothing is shared
/// between calls.
pub struct Sampler {
    settings: SamplerSettings,
    progress: Option<ProgressCallback>,
}

impl Sampler {
    pub fn new(settings: SamplerSettings) -> Self {
        Self {
            settings,
            progress: None,
        }
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn settings(&self) -> &SamplerSettings {
        &self.settings
    }

    pub fn sample_until_n_accepted<S: Simulator + ?Sized>(
        &mut self,
        n: usize,
        simulator: &S,
    ) -> Result<SamplingOutcome<S::Payload>, SampleError> {
        self.sample_until_n_accepted_with_cancel(n, simulator, &CancellationToken::new())
    }

    /// Like [`Sampler::sample_until_n_accepted`], but stops early with
    /// [`SampleError::Cancelled`] once `cancel` fires. A cancel after the
    /// target was reached is ignored.
    pub fn sample_until_n_accepted_with_cancel<S: Simulator + ?Sized>(
        &mut self,
        n: usize,
        simulator: &S,
        cancel: &CancellationToken,
    ) -> Result<SamplingOutcome<S::Payload>, SampleError> {
        if n == 0 {
            return Err(SampleError::InvalidTarget(n));
        }
        match self.settings.strategy {
            StrategyKind::EvalParallel => self.run(EvalParallel, n, simulator, cancel),
            StrategyKind::ParticleParallel => self.run(ParticleParallel, n, simulator, cancel),
        }
    }

    fn run<S, T>(
        &mut self,
        strategy: T,
        n: usize,
        simulator: &S,
        cancel: &CancellationToken,
    ) -> Result<SamplingOutcome<S::Payload>, SampleError>
    where
        S: Simulator + ?Sized,
        T: Strategy,
    {
        let settings = self.settings;
        let num_workers = settings.num_workers.max(1);

        let pool = ThreadPoolBuilder::new()
            .num_threads(num_workers + 1) // One more thread because the coordinator also uses one
            .thread_name(|i| format!("abc-worker-{}", i))
            .build()
            .context("Could not build thread pool")
            .map_err(SampleError::PoolStartup)?;

        log::info!(
            "Sampling {} particles with {} workers ({:?})",
            n,
            num_workers,
            strategy.kind()
        );
        log::debug!("Sampler state {:?} -> {:?}", SamplerState::Idle, SamplerState::Dispatching);

        let progress = &mut self.progress;
        let stop = AtomicBool::new(false);
        let stop = &stop;

        pool.scope_fifo(move |scope| {
            let (task_tx, task_rx) = unbounded::<Task>();
            let (result_tx, result_rx) = unbounded();

            for worker_id in 0..num_workers {
                let tasks = task_rx.clone();
                let results = result_tx.clone();
                scope.spawn_fifo(move |_| {
                    worker::run(worker_id, simulator, strategy, tasks, results, stop);
                });
            }
            drop(task_rx);
            drop(result_tx);

            let run = CoordinatorRun {
                num_workers,
                settings,
                cancel,
                stop,
                progress,
            };
            let result = run.coordinate(n, &task_tx, &result_rx);

            // Teardown: idle workers see the closed queue, busy ones finish
            // their current trial and find nobody listening.
            stop.store(true, Ordering::Release);
            drop(task_tx);
            drop(result_rx);
            result
        })
    }
}

struct CoordinatorRun<'a> {
    num_workers: usize,
    settings: SamplerSettings,
    cancel: &'a CancellationToken,
    stop: &'a AtomicBool,
    progress: &'a mut Option<ProgressCallback>,
}

impl CoordinatorRun<'_> {
    fn coordinate<P: Send>(
        mut self,
        n: usize,
        tasks: &Sender<Task>,
        results: &Receiver<WorkerMessage<P>>,
    ) -> Result<SamplingOutcome<P>, SampleError> {
        let start_time = Instant::now();
        let mut coordinator = Coordinator::new(n);
        let mut state = SamplerState::Dispatching;

        let mut last_progress = Instant::now();
        self.report_progress(&coordinator, state, start_time);

        for _ in 0..self.num_workers {
            dispatch(&mut coordinator, tasks)?;
        }

        loop {
            let timed_out = self
                .settings
                .timeout
                .is_some_and(|timeout| start_time.elapsed() >= timeout);
            // Once the target is reached the remaining trials only drain
            let dispatching = state == SamplerState::Dispatching;
            if dispatching && (self.cancel.is_cancelled() || timed_out) {
                self.stop.store(true, Ordering::Release);
                transition(&mut state, SamplerState::Cancelled);
                log::warn!(
                    "Sampling cancelled after {} accepted of {} trials",
                    coordinator.accepted(),
                    coordinator.total_trials()
                );
                self.report_progress(&coordinator, state, start_time);
                return Err(SampleError::Cancelled {
                    accepted: coordinator.accepted(),
                    total_trials: coordinator.total_trials(),
                });
            }

            let progress_due = self
                .progress
                .as_ref()
                .is_some_and(|progress| last_progress.elapsed() >= progress.rate);
            if progress_due {
                self.report_progress(&coordinator, state, start_time);
                last_progress = Instant::now();
            }

            match results.recv_timeout(self.settings.poll_interval) {
                Ok(WorkerMessage::Trial {
                    result,
                    completes_task,
                }) => {
                    coordinator.observe(result, completes_task);
                    if coordinator.is_full() {
                        if state == SamplerState::Dispatching {
                            self.stop.store(true, Ordering::Release);
                            transition(&mut state, SamplerState::Draining);
                        }
                    } else if completes_task {
                        dispatch(&mut coordinator, tasks)?;
                    }
                }
                Ok(WorkerMessage::Abandoned) => coordinator.on_abandoned(),
                Ok(WorkerMessage::Failed { worker, error }) => {
                    self.stop.store(true, Ordering::Release);
                    transition(&mut state, SamplerState::Failed);
                    self.report_progress(&coordinator, state, start_time);
                    return Err(SampleError::TrialFailure {
                        worker,
                        source: error,
                    });
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    transition(&mut state, SamplerState::Failed);
                    return Err(SampleError::Disconnected);
                }
            }

            if coordinator.is_drained() {
                transition(&mut state, SamplerState::Completed);
                break;
            }
        }

        self.report_progress(&coordinator, state, start_time);
        log::info!(
            "Accepted {} particles in {} trials ({:.2?})",
            coordinator.accepted(),
            coordinator.total_trials(),
            start_time.elapsed()
        );
        Ok(coordinator.into_outcome())
    }

    fn report_progress<P>(
        &mut self,
        coordinator: &Coordinator<P>,
        state: SamplerState,
        start_time: Instant,
    ) {
        if let Some(progress) = self.progress.as_mut() {
            let elapsed = start_time.elapsed();
            (progress.callback)(elapsed, coordinator.progress(state, elapsed));
        }
    }
}

fn dispatch<P>(coordinator: &mut Coordinator<P>, tasks: &Sender<Task>) -> Result<(), SampleError> {
    let id = coordinator.on_dispatch();
    log::trace!("Dispatching task {}", id);
    tasks
        .send(Task { id })
        .map_err(|_| SampleError::Disconnected)
}

fn transition(state: &mut SamplerState, next: SamplerState) {
    log::debug!("Sampler state {:?} -> {:?}", state, next);
    *state = next;
}
