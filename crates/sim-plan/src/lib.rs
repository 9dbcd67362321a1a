//! Experiment planning: expand a declarative sweep definition into the
//! concrete set of run variants it describes.

use std::collections::BTreeMap;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use thiserror::Error;

pub mod sampler;

pub type Catalog = BTreeMap<String, ExperimentDefinition>;

/// One entry in `experiments.json`, discriminated by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ExperimentDefinition {
    Values {
        field: String,
        values: Vec<Value>,
        steps: u64,
    },
    Linspace {
        field: String,
        start: f64,
        stop: f64,
        samples: u64,
        steps: u64,
    },
    Arange {
        field: String,
        start: f64,
        stop: f64,
        increment: f64,
        steps: u64,
    },
    Meshgrid {
        xfield: String,
        /// start, stop, samples
        x: [f64; 3],
        yfield: String,
        /// start, stop, samples
        y: [f64; 3],
        steps: u64,
    },
    Multiparameter {
        runs: Vec<String>,
        steps: u64,
    },
    MonteCarlo {
        field: String,
        samples: u64,
        steps: u64,
        #[serde(flatten)]
        distribution: Distribution,
    },
    Group {
        runs: Vec<String>,
        steps: u64,
    },
    Optimization {
        metric_objective: MetricObjective,
        max_steps: u64,
        metric_name: String,
    },
}

impl ExperimentDefinition {
    /// Tick budget per run. `None` for optimization, which never runs locally.
    pub fn steps(&self) -> Option<u64> {
        match self {
            Self::Values { steps, .. }
            | Self::Linspace { steps, .. }
            | Self::Arange { steps, .. }
            | Self::Meshgrid { steps, .. }
            | Self::Multiparameter { steps, .. }
            | Self::MonteCarlo { steps, .. }
            | Self::Group { steps, .. } => Some(*steps),
            Self::Optimization { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricObjective {
    Min,
    Max,
}

/// Distribution families for monte-carlo sweeps, discriminated by
/// `distribution`. Unknown tags fail at parse time; there is no silent
/// standard-normal fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "distribution", rename_all = "kebab-case")]
pub enum Distribution {
    Normal { mean: f64, std: f64 },
    LogNormal { mu: f64, sigma: f64 },
    Poisson { rate: f64 },
    Beta { alpha: f64, beta: f64 },
    Gamma { shape: f64, scale: f64 },
}

/// A sparse set of dotted-path overrides applied onto the base globals.
pub type PlannedRunVariant = Map<String, Value>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedRun {
    pub fields: PlannedRunVariant,
    pub steps: u64,
}

/// The full variant set for one experiment, keyed by run identifier. Order
/// is irrelevant; identifiers are unique within the plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExperimentPlan {
    pub runs: BTreeMap<String, PlannedRun>,
}

impl ExperimentPlan {
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("no experiment named '{0}' in the catalog")]
    UnknownExperiment(String),
    #[error("experiment '{0}' cannot run locally: optimization plans are produced by the platform")]
    UnsupportedExperimentType(String),
    #[error("experiment '{name}': {reason}")]
    InvalidDefinition { name: String, reason: String },
    #[error("composite definition where a non-composite was required")]
    CompositeSubDefinition,
    #[error("parsing experiments.json: {0}")]
    Catalog(String),
}

/// Parse an `experiments.json` catalog.
pub fn parse_catalog(src: &str) -> Result<Catalog, PlanError> {
    serde_json::from_str(src).map_err(|err| PlanError::Catalog(err.to_string()))
}

/// Expand the named definition into an [`ExperimentPlan`].
pub fn plan(name: &str, catalog: &Catalog) -> Result<ExperimentPlan, PlanError> {
    plan_with_rng(name, catalog, &mut rand::thread_rng())
}

/// Like [`plan`], with a caller-supplied source of randomness for
/// monte-carlo definitions.
pub fn plan_with_rng<R: Rng + ?Sized>(
    name: &str,
    catalog: &Catalog,
    rng: &mut R,
) -> Result<ExperimentPlan, PlanError> {
    let definition = catalog
        .get(name)
        .ok_or_else(|| PlanError::UnknownExperiment(name.to_string()))?;

    match definition {
        ExperimentDefinition::Optimization { .. } => {
            Err(PlanError::UnsupportedExperimentType(name.to_string()))
        }
        ExperimentDefinition::Group { runs, .. } => {
            let mut plan = ExperimentPlan::default();
            for (idx, run_name) in runs.iter().enumerate() {
                if runs[..idx].contains(run_name) {
                    return Err(PlanError::InvalidDefinition {
                        name: name.to_string(),
                        reason: format!("group lists '{}' more than once", run_name),
                    });
                }
                let sub = plan_with_rng(run_name, catalog, rng)?;
                plan.runs.extend(sub.runs);
            }
            Ok(plan)
        }
        ExperimentDefinition::Multiparameter { runs, steps } => {
            let mut merged: Vec<PlannedRunVariant> = vec![Map::new()];
            for run_name in runs {
                let sub_definition = catalog
                    .get(run_name)
                    .ok_or_else(|| PlanError::UnknownExperiment(run_name.clone()))?;
                let sub_sets = field_sets(run_name, sub_definition, rng).map_err(|err| {
                    match err {
                        PlanError::UnsupportedExperimentType(_)
                        | PlanError::CompositeSubDefinition => PlanError::InvalidDefinition {
                            name: name.to_string(),
                            reason: format!(
                                "multiparameter sub-definition '{}' must be non-composite",
                                run_name
                            ),
                        },
                        other => other,
                    }
                })?;
                // Later sub-lists overwrite overlapping fields.
                let mut next = Vec::with_capacity(merged.len() * sub_sets.len());
                for entry in &sub_sets {
                    for existing in &merged {
                        let mut combined = existing.clone();
                        for (key, value) in entry {
                            combined.insert(key.clone(), value.clone());
                        }
                        next.push(combined);
                    }
                }
                merged = next;
            }
            Ok(plan_from_sets(name, merged, *steps))
        }
        other => {
            let steps = other.steps().expect("non-optimization carries steps");
            let sets = field_sets(name, other, rng)?;
            Ok(plan_from_sets(name, sets, steps))
        }
    }
}

fn plan_from_sets(name: &str, sets: Vec<PlannedRunVariant>, steps: u64) -> ExperimentPlan {
    let mut plan = ExperimentPlan::default();
    for (idx, fields) in sets.into_iter().enumerate() {
        plan.runs
            .insert(format!("{}.{:04}", name, idx), PlannedRun { fields, steps });
    }
    plan
}

/// Expand a non-composite definition into its list of override field-sets.
fn field_sets<R: Rng + ?Sized>(
    name: &str,
    definition: &ExperimentDefinition,
    rng: &mut R,
) -> Result<Vec<PlannedRunVariant>, PlanError> {
    match definition {
        ExperimentDefinition::Values { field, values, .. } => Ok(values
            .iter()
            .map(|value| single_field(field, value.clone()))
            .collect()),
        ExperimentDefinition::Linspace {
            field,
            start,
            stop,
            samples,
            ..
        } => {
            let values = linspace(name, *start, *stop, *samples)?;
            Ok(values
                .into_iter()
                .map(|v| single_field(field, number(v)))
                .collect())
        }
        ExperimentDefinition::Arange {
            field,
            start,
            stop,
            increment,
            ..
        } => {
            if *increment <= 0.0 {
                return Err(PlanError::InvalidDefinition {
                    name: name.to_string(),
                    reason: format!("arange increment must be positive, got {}", increment),
                });
            }
            let mut sets = Vec::new();
            let mut idx = 0u64;
            loop {
                let value = start + idx as f64 * increment;
                if value > *stop {
                    break;
                }
                sets.push(single_field(field, number(value)));
                idx += 1;
            }
            Ok(sets)
        }
        ExperimentDefinition::Meshgrid {
            xfield,
            x,
            yfield,
            y,
            ..
        } => {
            let xspace = linspace(name, x[0], x[1], x[2] as u64)?;
            let yspace = linspace(name, y[0], y[1], y[2] as u64)?;
            let mut sets = Vec::with_capacity(xspace.len() * yspace.len());
            for xv in &xspace {
                for yv in &yspace {
                    let mut fields = Map::new();
                    fields.insert(xfield.clone(), number(*xv));
                    fields.insert(yfield.clone(), number(*yv));
                    sets.push(fields);
                }
            }
            Ok(sets)
        }
        ExperimentDefinition::MonteCarlo {
            field,
            samples,
            distribution,
            ..
        } => {
            if *samples == 0 {
                return Err(PlanError::InvalidDefinition {
                    name: name.to_string(),
                    reason: "monte-carlo needs at least one sample".to_string(),
                });
            }
            let mut sets = Vec::with_capacity(*samples as usize);
            for _ in 0..*samples {
                let value =
                    sampler::sample(distribution, rng).map_err(|err| PlanError::InvalidDefinition {
                        name: name.to_string(),
                        reason: err.to_string(),
                    })?;
                sets.push(single_field(field, number(value)));
            }
            Ok(sets)
        }
        ExperimentDefinition::Group { .. } | ExperimentDefinition::Multiparameter { .. } => {
            Err(PlanError::CompositeSubDefinition)
        }
        ExperimentDefinition::Optimization { .. } => {
            Err(PlanError::UnsupportedExperimentType(name.to_string()))
        }
    }
}

fn linspace(name: &str, start: f64, stop: f64, samples: u64) -> Result<Vec<f64>, PlanError> {
    if samples < 2 {
        return Err(PlanError::InvalidDefinition {
            name: name.to_string(),
            reason: format!("linspace needs at least 2 samples, got {}", samples),
        });
    }
    let delta = (stop - start) / (samples - 1) as f64;
    Ok((0..samples).map(|i| start + i as f64 * delta).collect())
}

fn single_field(field: &str, value: Value) -> PlannedRunVariant {
    let mut fields = Map::new();
    fields.insert(field.to_string(), value);
    fields
}

fn number(v: f64) -> Value {
    Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null)
}
