//! Generation storage for ABC-SMC runs.
//!
//! The sampler never calls into this module. A generation is handed over
//! once it is complete: the accepted particles, the number of trials it
//! took and the epsilon it was sampled with.

use std::collections::BTreeMap;

use anyhow::Context;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::Serialize;
use thiserror::Error;

use crate::{
    particle::{Parameter, Particle, SummaryStatistics},
    sampler::Sampler,
    trial::Simulator,
};

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("Model probabilities are only defined for t >= 0, got {0}")]
    NegativeGeneration(i64),
    #[error("No generation {0} in history")]
    UnknownGeneration(i64),
    #[error("No model {0} in history")]
    UnknownModel(usize),
    #[error("Unknown parameter {0}")]
    UnknownParameter(String),
    #[error("History is empty")]
    Empty,
    #[error("Could not serialize run options")]
    Options(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, HistoryError>;

/// The narrow interface a generation store has to provide.
pub trait PopulationStore {
    /// Record the configuration of a run and the ground truth as
    /// generation `t = -1`.
    fn store_initial_data(&mut self, initial: InitialData) -> Result<()>;

    /// Append one sampled generation.
    ///
    /// `nr_simulations` is the total number of trials, accepted or not.
    fn append_population(
        &mut self,
        t: i64,
        epsilon: f64,
        particles: Vec<Particle>,
        nr_simulations: u64,
    ) -> Result<()>;

    /// Mark the run as finished.
    fn done(&mut self) -> Result<()>;
}

/// Everything known about a run before the first generation.
#[derive(Debug, Clone)]
pub struct InitialData {
    pub ground_truth_model: usize,
    pub ground_truth_parameter: Parameter,
    pub observed_summary_statistics: SummaryStatistics,
    pub options: serde_json::Value,
    pub distance_function: String,
    pub epsilon_function: String,
}

impl InitialData {
    pub fn new(
        ground_truth_model: usize,
        ground_truth_parameter: Parameter,
        observed_summary_statistics: SummaryStatistics,
    ) -> Self {
        Self {
            ground_truth_model,
            ground_truth_parameter,
            observed_summary_statistics,
            options: serde_json::Value::Null,
            distance_function: String::new(),
            epsilon_function: String::new(),
        }
    }

    pub fn with_options(mut self, options: &impl Serialize) -> Result<Self> {
        self.options = serde_json::to_value(options)?;
        Ok(self)
    }

    /// Name of the distance function, stored for reference only.
    pub fn with_distance_function(mut self, distance_function: impl Into<String>) -> Self {
        self.distance_function = distance_function.into();
        self
    }

    pub fn with_epsilon_function(mut self, epsilon_function: impl Into<String>) -> Self {
        self.epsilon_function = epsilon_function.into();
        self
    }
}

#[derive(Debug, Clone)]
pub struct ModelRecord {
    pub m: usize,
    pub name: String,
    pub p_model: f64,
    pub particles: Vec<Particle>,
}

#[derive(Debug, Clone)]
pub struct PopulationRecord {
    pub t: i64,
    pub epsilon: f64,
    pub nr_samples: u64,
    pub end_time: DateTime<Utc>,
    pub models: Vec<ModelRecord>,
}

/// One row per generation, see [`MemoryHistory::get_all_populations`].
#[derive(Debug, Clone, PartialEq)]
pub struct PopulationSummary {
    pub t: i64,
    pub end_time: DateTime<Utc>,
    pub nr_samples: u64,
    pub epsilon: f64,
}

/// A distance with its particle weight scaled by the model probability.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedDistance {
    pub distance: f64,
    pub w: f64,
    pub m: usize,
}

/// Group particles by model and normalize their weights.
///
/// Returns the particles of every model, with weights summing to one within
/// each model, and the marginal model probabilities.
pub fn normalize(particles: Vec<Particle>, nr_models: usize) -> (Vec<Vec<Particle>>, Vec<f64>) {
    let mut store = vec![Vec::new(); nr_models];
    for particle in particles {
        if particle.model >= nr_models {
            log::warn!(
                "Dropping particle of unknown model {} (only {} models)",
                particle.model,
                nr_models
            );
            continue;
        }
        store[particle.model].push(particle);
    }

    let model_total_weights = store
        .iter()
        .map(|model| model.iter().map(|particle| particle.weight).sum::<f64>())
        .collect_vec();
    let population_total_weight: f64 = model_total_weights.iter().sum();

    let model_probabilities = model_total_weights
        .iter()
        .map(|&weight| {
            if population_total_weight > 0f64 {
                weight / population_total_weight
            } else {
                0f64
            }
        })
        .collect_vec();

    for (model, &total) in store.iter_mut().zip(model_total_weights.iter()) {
        if total <= 0f64 {
            continue;
        }
        for particle in model.iter_mut() {
            particle.weight /= total;
        }
    }

    (store, model_probabilities)
}

/// In-memory generation store.
#[derive(Debug, Clone)]
pub struct MemoryHistory {
    nr_models: usize,
    model_names: Vec<String>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    initial: Option<InitialData>,
    populations: Vec<PopulationRecord>,
}

impl MemoryHistory {
    pub fn new(model_names: Vec<String>) -> Self {
        Self {
            nr_models: model_names.len(),
            model_names,
            start_time: None,
            end_time: None,
            initial: None,
            populations: Vec::new(),
        }
    }

    pub fn nr_models(&self) -> usize {
        self.nr_models
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    pub fn initial_data(&self) -> Option<&InitialData> {
        self.initial.as_ref()
    }

    /// The latest generation.
    pub fn max_t(&self) -> Option<i64> {
        self.populations.iter().map(|pop| pop.t).max()
    }

    /// Trials over all generations.
    pub fn total_nr_simulations(&self) -> u64 {
        self.populations.iter().map(|pop| pop.nr_samples).sum()
    }

    pub fn get_all_populations(&self) -> Vec<PopulationSummary> {
        self.populations
            .iter()
            .map(|pop| PopulationSummary {
                t: pop.t,
                end_time: pop.end_time,
                nr_samples: pop.nr_samples,
                epsilon: pop.epsilon,
            })
            .collect()
    }

    pub fn population(&self, t: i64) -> Result<&PopulationRecord> {
        self.populations
            .iter()
            .find(|pop| pop.t == t)
            .ok_or(HistoryError::UnknownGeneration(t))
    }

    fn resolve_t(&self, t: Option<i64>) -> Result<i64> {
        match t {
            Some(t) => Ok(t),
            None => self.max_t().ok_or(HistoryError::Empty),
        }
    }

    fn model(&self, t: Option<i64>, m: usize) -> Result<&ModelRecord> {
        let t = self.resolve_t(t)?;
        self.population(t)?
            .models
            .iter()
            .find(|model| model.m == m)
            .ok_or(HistoryError::UnknownModel(m))
    }

    /// Model probabilities of generation `t`, ordered by model, or of the
    /// latest generation if `t` is `None`.
    pub fn get_model_probabilities(&self, t: Option<i64>) -> Result<Vec<f64>> {
        if let Some(t) = t {
            if t < 0 {
                return Err(HistoryError::NegativeGeneration(t));
            }
        }
        let t = self.resolve_t(t)?;
        Ok(self
            .population(t)?
            .models
            .iter()
            .sorted_by_key(|model| model.m)
            .map(|model| model.p_model)
            .collect())
    }

    /// Number of models with positive probability.
    pub fn nr_of_models_alive(&self, t: Option<i64>) -> Result<usize> {
        Ok(self
            .get_model_probabilities(t)?
            .into_iter()
            .filter(|&p| p > 0f64)
            .count())
    }

    /// Flattened parameters and weights of the particles of model `m`.
    pub fn weighted_parameters(
        &self,
        t: Option<i64>,
        m: usize,
    ) -> Result<(Vec<BTreeMap<String, f64>>, Vec<f64>)> {
        let model = self.model(t, m)?;
        let parameters = model
            .particles
            .iter()
            .map(|particle| particle.flat_parameters())
            .collect();
        let weights = model.particles.iter().map(|particle| particle.weight).collect();
        Ok((parameters, weights))
    }

    /// Values of one parameter of model `m` in the latest generation,
    /// together with the particle weights.
    pub fn get_results_distribution(&self, m: usize, parameter: &str) -> Result<(Vec<f64>, Vec<f64>)> {
        let (parameters, weights) = self.weighted_parameters(None, m)?;
        let points = parameters
            .iter()
            .map(|params| {
                params
                    .get(parameter)
                    .copied()
                    .ok_or_else(|| HistoryError::UnknownParameter(parameter.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((points, weights))
    }

    /// Every sample distance of generation `t`, weighted by particle weight
    /// times model probability.
    pub fn get_weighted_distances(&self, t: Option<i64>) -> Result<Vec<WeightedDistance>> {
        let t = self.resolve_t(t)?;
        let population = self.population(t)?;
        Ok(population
            .models
            .iter()
            .flat_map(|model| {
                model.particles.iter().flat_map(move |particle| {
                    particle.distances.iter().map(move |&distance| WeightedDistance {
                        distance,
                        w: particle.weight * model.p_model,
                        m: model.m,
                    })
                })
            })
            .collect())
    }

    /// Summary statistics of every sample of model `m`, with the weight of
    /// the particle they belong to.
    pub fn get_sum_stats(
        &self,
        t: Option<i64>,
        m: usize,
    ) -> Result<(Vec<f64>, Vec<SummaryStatistics>)> {
        let model = self.model(t, m)?;
        Ok(model
            .particles
            .iter()
            .flat_map(|particle| {
                particle
                    .summary_statistics
                    .iter()
                    .map(move |stats| (particle.weight, stats.clone()))
            })
            .unzip())
    }
}

impl PopulationStore for MemoryHistory {
    fn store_initial_data(&mut self, initial: InitialData) -> Result<()> {
        let name = self
            .model_names
            .get(initial.ground_truth_model)
            .cloned()
            .ok_or(HistoryError::UnknownModel(initial.ground_truth_model))?;

        let ground_truth = Particle::new(
            initial.ground_truth_model,
            initial.ground_truth_parameter.clone(),
            1f64,
        )
        .with_sample(0f64, initial.observed_summary_statistics.clone());

        let now = Utc::now();
        self.start_time = Some(now);
        self.populations.push(PopulationRecord {
            t: -1,
            epsilon: 0f64,
            nr_samples: 0,
            end_time: now,
            models: vec![ModelRecord {
                m: initial.ground_truth_model,
                name,
                p_model: 1f64,
                particles: vec![ground_truth],
            }],
        });
        log::info!("Start run with ground truth model {}", initial.ground_truth_model);
        self.initial = Some(initial);
        Ok(())
    }

    fn append_population(
        &mut self,
        t: i64,
        epsilon: f64,
        particles: Vec<Particle>,
        nr_simulations: u64,
    ) -> Result<()> {
        let (store, model_probabilities) = normalize(particles, self.nr_models);
        let models = store
            .into_iter()
            .zip(model_probabilities)
            .zip(self.model_names.iter())
            .enumerate()
            .map(|(m, ((particles, p_model), name))| ModelRecord {
                m,
                name: name.clone(),
                p_model,
                particles,
            })
            .collect();

        self.populations.push(PopulationRecord {
            t,
            epsilon,
            nr_samples: nr_simulations,
            end_time: Utc::now(),
            models,
        });
        log::debug!(
            "Appended population {} (epsilon {}, {} simulations)",
            t,
            epsilon,
            nr_simulations
        );
        Ok(())
    }

    fn done(&mut self) -> Result<()> {
        self.end_time = Some(Utc::now());
        log::debug!("Done after {} simulations", self.total_nr_simulations());
        Ok(())
    }
}

/// Sample one generation and hand it to `store`.
///
/// Returns the number of trials the generation took.
pub fn sample_generation<S, H>(
    sampler: &mut Sampler,
    store: &mut H,
    t: i64,
    epsilon: f64,
    n: usize,
    simulator: &S,
) -> anyhow::Result<u64>
where
    S: Simulator<Payload = Particle> + ?Sized,
    H: PopulationStore,
{
    let outcome = sampler
        .sample_until_n_accepted(n, simulator)
        .with_context(|| format!("Could not sample generation {}", t))?;
    let total_trials = outcome.total_trials;
    store
        .append_population(t, epsilon, outcome.accepted, total_trials)
        .with_context(|| format!("Could not store generation {}", t))?;
    Ok(total_trials)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use anyhow::Result;
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;

    use super::{normalize, HistoryError, InitialData, MemoryHistory, PopulationStore};
    use crate::particle::{Parameter, ParameterValue, Particle};

    fn particle(model: usize, theta: f64, weight: f64, distance: f64) -> Particle {
        let mut parameter = Parameter::new();
        parameter.insert("theta".to_string(), ParameterValue::Scalar(theta));
        Particle::new(model, parameter, weight)
            .with_sample(distance, BTreeMap::from([("y".to_string(), theta * 2.0)]))
    }

    fn history() -> MemoryHistory {
        MemoryHistory::new(vec!["m0".to_string(), "m1".to_string()])
    }

    #[test]
    fn normalize_weights_and_probabilities() {
        let particles = vec![
            particle(0, 1.0, 1.0, 0.1),
            particle(0, 2.0, 3.0, 0.2),
            particle(1, 3.0, 4.0, 0.3),
        ];
        let (store, probabilities) = normalize(particles, 3);

        assert_eq!(store.len(), 3);
        assert_abs_diff_eq!(probabilities[0], 0.5);
        assert_abs_diff_eq!(probabilities[1], 0.5);
        assert_abs_diff_eq!(probabilities[2], 0.0);

        let weights = store[0].iter().map(|p| p.weight).collect::<Vec<_>>();
        assert_abs_diff_eq!(weights[0], 0.25);
        assert_abs_diff_eq!(weights[1], 0.75);
        assert_abs_diff_eq!(store[1][0].weight, 1.0);
        assert!(store[2].is_empty());
    }

    #[test]
    fn normalize_empty_population() {
        let (store, probabilities) = normalize(Vec::new(), 2);
        assert_eq!(store.len(), 2);
        assert_eq!(probabilities, vec![0.0, 0.0]);
    }

    #[test]
    fn initial_data_keeps_function_names() -> Result<()> {
        let mut history = history();
        let initial = InitialData::new(0, Parameter::new(), BTreeMap::new())
            .with_distance_function("PNormDistance(p=2)")
            .with_epsilon_function(String::from("MedianEpsilon"));
        history.store_initial_data(initial)?;

        let stored = history.initial_data().expect("initial data was stored");
        assert_eq!(stored.distance_function, "PNormDistance(p=2)");
        assert_eq!(stored.epsilon_function, "MedianEpsilon");
        assert_eq!(stored.options, serde_json::Value::Null);
        Ok(())
    }

    #[test]
    fn append_and_query() -> Result<()> {
        let mut history = history();
        let mut truth = Parameter::new();
        truth.insert("theta".to_string(), 1.5.into());
        let initial = InitialData::new(1, truth, BTreeMap::from([("y".to_string(), 3.0)]))
            .with_options(&BTreeMap::from([("population_size", 3)]))?;
        history.store_initial_data(initial)?;
        assert_eq!(history.max_t(), Some(-1));

        history.append_population(
            0,
            2.0,
            vec![
                particle(0, 1.0, 1.0, 0.5),
                particle(1, 2.0, 1.0, 0.4),
                particle(1, 4.0, 2.0, 0.3),
            ],
            17,
        )?;
        history.append_population(1, 1.0, vec![particle(1, 3.0, 1.0, 0.2)], 40)?;
        history.done()?;

        assert_eq!(history.max_t(), Some(1));
        assert_eq!(history.total_nr_simulations(), 57);
        assert_eq!(history.get_all_populations().len(), 3);
        assert!(history.end_time().is_some());

        let probabilities = history.get_model_probabilities(Some(0))?;
        assert_abs_diff_eq!(probabilities[0], 0.25);
        assert_abs_diff_eq!(probabilities[1], 0.75);
        assert_eq!(history.nr_of_models_alive(Some(0))?, 2);
        assert_eq!(history.nr_of_models_alive(None)?, 1);

        let (points, weights) = history.get_results_distribution(1, "theta")?;
        assert_eq!(points, vec![3.0]);
        assert_eq!(weights, vec![1.0]);

        let distances = history.get_weighted_distances(Some(0))?;
        assert_eq!(distances.len(), 3);
        let total: f64 = distances.iter().map(|d| d.w).sum();
        assert_abs_diff_eq!(total, 1.0, epsilon = 1e-12);

        let (weights, stats) = history.get_sum_stats(Some(0), 1)?;
        assert_eq!(stats.len(), 2);
        assert_abs_diff_eq!(weights.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        assert_eq!(stats[1]["y"], 8.0);
        Ok(())
    }

    #[test]
    fn query_errors() {
        let mut history = history();
        assert!(matches!(
            history.get_model_probabilities(None),
            Err(HistoryError::Empty)
        ));
        assert!(matches!(
            history.get_model_probabilities(Some(-1)),
            Err(HistoryError::NegativeGeneration(-1))
        ));
        history
            .append_population(0, 1.0, vec![particle(0, 1.0, 1.0, 0.1)], 1)
            .unwrap();
        assert!(matches!(
            history.get_results_distribution(0, "phi"),
            Err(HistoryError::UnknownParameter(_))
        ));
        assert!(matches!(
            history.get_sum_stats(Some(3), 0),
            Err(HistoryError::UnknownGeneration(3))
        ));
        assert!(matches!(
            history.weighted_parameters(None, 5),
            Err(HistoryError::UnknownModel(5))
        ));
    }
}
