use std::sync::atomic::AtomicBool;

use crossbeam_channel::{Receiver, Sender};

use crate::{
    strategy::{Strategy, TaskEnd},
    trial::{Simulator, TrialResult},
};

/// A unit of work handed to the pool. What a task means is up to the
/// strategy.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Task {
    pub id: u64,
}

/// Everything a worker can tell the coordinator.
pub(crate) enum WorkerMessage<P> {
    Trial {
        result: TrialResult<P>,
        /// This was the last trial of its task
        completes_task: bool,
    },
    /// A task was dropped because sampling is stopping.
    Abandoned,
    /// The simulator failed. The worker takes no further tasks.
    Failed { worker: usize, error: anyhow::Error },
}

/// Worker loop: take tasks until the queue is closed.
///
/// The simulator is borrowed for the lifetime of the pool, it is never
/// copied or sent between threads.
pub(crate) fn run<S, T>(
    worker: usize,
    simulator: &S,
    strategy: T,
    tasks: Receiver<Task>,
    results: Sender<WorkerMessage<S::Payload>>,
    stop: &AtomicBool,
) where
    S: Simulator + ?Sized,
    T: Strategy,
{
    log::trace!("worker {} started ({:?})", worker, strategy.kind());
    while let Ok(task) = tasks.recv() {
        log::trace!("worker {} picked up task {}", worker, task.id);
        match strategy.run_task(simulator, stop, &results) {
            Ok(TaskEnd::Completed) => {}
            Ok(TaskEnd::Abandoned) => {
                if results.send(WorkerMessage::Abandoned).is_err() {
                    break;
                }
            }
            Ok(TaskEnd::Disconnected) => break,
            Err(error) => {
                log::warn!("worker {} failed in task {}: {:#}", worker, task.id, error);
                // Nobody may be listening anymore if another worker failed first
                let _ = results.send(WorkerMessage::Failed { worker, error });
                break;
            }
        }
    }
    log::trace!("worker {} stopped", worker);
}
