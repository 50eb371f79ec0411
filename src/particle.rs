//! The standard payload of an accepted ABC trial.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A parameter value, either a plain number or a group of named numbers.
///
/// Grouped values are flattened to `name_key` when parameters are listed
/// per particle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Scalar(f64),
    Nested(BTreeMap<String, f64>),
}

impl From<f64> for ParameterValue {
    fn from(value: f64) -> Self {
        ParameterValue::Scalar(value)
    }
}

pub type Parameter = BTreeMap<String, ParameterValue>;
pub type SummaryStatistics = BTreeMap<String, f64>;

/// A weighted particle of one model.
///
/// There is one distance and one set of summary statistics per simulation
/// that went into the particle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Particle {
    pub model: usize,
    pub parameter: Parameter,
    pub weight: f64,
    pub distances: Vec<f64>,
    pub summary_statistics: Vec<SummaryStatistics>,
}

impl Particle {
    pub fn new(model: usize, parameter: Parameter, weight: f64) -> Self {
        Self {
            model,
            parameter,
            weight,
            distances: Vec::new(),
            summary_statistics: Vec::new(),
        }
    }

    pub fn with_sample(mut self, distance: f64, summary_statistics: SummaryStatistics) -> Self {
        self.distances.push(distance);
        self.summary_statistics.push(summary_statistics);
        self
    }

    /// Parameters with grouped values flattened to `name_key`.
    pub fn flat_parameters(&self) -> BTreeMap<String, f64> {
        let mut flat = BTreeMap::new();
        for (name, value) in self.parameter.iter() {
            match value {
                ParameterValue::Scalar(val) => {
                    flat.insert(name.clone(), *val);
                }
                ParameterValue::Nested(values) => {
                    for (key, val) in values.iter() {
                        flat.insert(format!("{}_{}", name, key), *val);
                    }
                }
            }
        }
        flat
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use anyhow::Result;
    use pretty_assertions::assert_eq;

    use super::{Parameter, ParameterValue, Particle};

    #[test]
    fn flattens_nested_parameters() {
        let mut parameter = Parameter::new();
        parameter.insert("rate".to_string(), 0.5.into());
        parameter.insert(
            "init".to_string(),
            ParameterValue::Nested(BTreeMap::from([
                ("a".to_string(), 1.0),
                ("b".to_string(), 2.0),
            ])),
        );
        let particle = Particle::new(0, parameter, 1.0);

        let flat = particle.flat_parameters();
        assert_eq!(
            flat.into_iter().collect::<Vec<_>>(),
            vec![
                ("init_a".to_string(), 1.0),
                ("init_b".to_string(), 2.0),
                ("rate".to_string(), 0.5),
            ]
        );
    }

    #[test]
    fn json_shape() -> Result<()> {
        let mut parameter = Parameter::new();
        parameter.insert("theta".to_string(), 2.0.into());
        let particle = Particle::new(1, parameter, 0.25)
            .with_sample(0.1, BTreeMap::from([("mean".to_string(), 3.0)]));

        let json = serde_json::to_value(&particle)?;
        assert_eq!(json["parameter"]["theta"], 2.0);
        assert_eq!(json["distances"][0], 0.1);

        let back: Particle = serde_json::from_value(json)?;
        assert_eq!(back, particle);
        Ok(())
    }
}
