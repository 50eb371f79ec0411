//! Parallel acceptance sampling for ABC-SMC.
//!
//! [`Sampler::sample_until_n_accepted`] runs simulation trials on a pool of
//! worker threads until exactly `n` of them were accepted, and reports how
//! many trials that took. Trials are produced by a [`Simulator`], usually a
//! closure returning [`TrialResult`].

pub(crate) mod coordinator;
pub mod history;
pub(crate) mod particle;
pub(crate) mod sampler;
pub(crate) mod strategy;
pub(crate) mod trial;
pub(crate) mod worker;

pub use coordinator::{SamplingOutcome, SamplingProgress};
pub use history::{MemoryHistory, PopulationStore};
pub use particle::{Parameter, ParameterValue, Particle, SummaryStatistics};
pub use sampler::{
    sample_sequentially, sample_until_n_accepted, CancellationToken, ProgressCallback,
    SampleError, Sampler, SamplerSettings, SamplerState,
};
pub use strategy::StrategyKind;
pub use trial::{Simulator, TrialResult};
