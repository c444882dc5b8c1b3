//! Targets and objective aggregation.
//!
//! A target compares one reference entry against one or more observables.
//! Each item residual is weighted by its subweight and aggregated into the
//! target residual; target residuals are then combined with the normalized
//! target weights into the scalar cost.

use std::collections::BTreeMap;

use super::query::ObservableMap;
use crate::schema::{
    CostFunction, ItemScore, ObjectivesConfig, ReferenceData, ReferenceValue, ResidualMethod,
    SubweightRules, Subweights, TargetScore, TargetSpec,
};

/// One reference value compared against one observable.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetItem {
    pub observable: String,
    pub reference: f64,
    pub subweight: f64,
}

/// A reference entry with its normalized weight.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub key: String,
    pub weight: f64,
    pub items: Vec<TargetItem>,
    /// Residual override for this target.
    pub residual: Option<ResidualMethod>,
    /// Item aggregation override for this target.
    pub cost: Option<CostFunction>,
}

/// Look up every requested key and normalize weights to sum to one.
///
/// Fails as a whole when any key is missing from `reference`; targets keep the
/// requested order.
pub fn build_targets(
    reference: &ReferenceData,
    specs: &[TargetSpec],
) -> Result<Vec<Target>, ReferenceKeyError> {
    let missing: Vec<String> = specs
        .iter()
        .filter(|s| !reference.contains_key(&s.key))
        .map(|s| s.key.clone())
        .collect();
    if !missing.is_empty() {
        return Err(ReferenceKeyError::Missing(missing));
    }

    let total: f64 = specs.iter().map(|s| s.weight).sum();
    if !(total.is_finite() && total > 0.0) {
        return Err(ReferenceKeyError::ZeroTotalWeight);
    }

    specs
        .iter()
        .map(|s| {
            Ok(Target {
                key: s.key.clone(),
                weight: s.weight / total,
                items: target_items(s, &reference[&s.key])?,
                residual: s.residual,
                cost: s.cost,
            })
        })
        .collect()
}

/// Expand one reference entry into weighted items.
fn target_items(
    spec: &TargetSpec,
    value: &ReferenceValue,
) -> Result<Vec<TargetItem>, ReferenceKeyError> {
    let invalid = |reason: String| ReferenceKeyError::Subweights {
        key: spec.key.clone(),
        reason,
    };

    let (names, references, mut weights): (Vec<String>, Vec<f64>, Vec<f64>) = match value {
        ReferenceValue::Scalar(v) => (vec![spec.key.clone()], vec![*v], vec![1.0]),
        ReferenceValue::Array(values) => {
            let weights = match &spec.subweights {
                None => vec![1.0; values.len()],
                Some(Subweights::List(list)) => {
                    if list.len() != values.len() {
                        return Err(invalid(format!(
                            "{} subweights for {} values",
                            list.len(),
                            values.len()
                        )));
                    }
                    list.clone()
                }
                Some(Subweights::Rules(rules)) => array_subweights(rules, values).map_err(invalid)?,
            };
            let names = (0..values.len()).map(|i| format!("{}[{i}]", spec.key)).collect();
            (names, values.clone(), weights)
        }
        ReferenceValue::Pairs(pairs) => {
            let weights = match &spec.subweights {
                None => vec![1.0; pairs.len()],
                Some(Subweights::List(list)) => {
                    if list.len() != pairs.len() {
                        return Err(invalid(format!(
                            "{} subweights for {} pairs",
                            list.len(),
                            pairs.len()
                        )));
                    }
                    list.clone()
                }
                Some(Subweights::Rules(rules)) => pair_subweights(rules, pairs).map_err(invalid)?,
            };
            (pairs.keys().cloned().collect(), pairs.values().copied().collect(), weights)
        }
    };

    let sum: f64 = weights.iter().sum();
    if !(sum > 0.0) {
        return Err(invalid("all subweights are zero".to_string()));
    }
    if spec.normalise {
        weights.iter_mut().for_each(|w| *w /= sum);
    }

    let keep_zero = !matches!(value, ReferenceValue::Pairs(_));
    Ok(names
        .into_iter()
        .zip(references)
        .zip(weights)
        .filter(|(_, w)| keep_zero || *w > 0.0)
        .map(|((observable, reference), subweight)| TargetItem {
            observable,
            reference,
            subweight,
        })
        .collect())
}

/// Subweights of an array reference from a default and overrides.
fn array_subweights(rules: &SubweightRules, values: &[f64]) -> Result<Vec<f64>, String> {
    let n = values.len();
    let mut weights = vec![rules.dflt.unwrap_or(1.0); n];
    for &(index, w) in &rules.indexes {
        if index == 0 || index > n {
            return Err(format!("index {index} outside 1..={n}"));
        }
        weights[index - 1] = w;
    }
    for &((first, last), w) in &rules.ranges {
        if first == 0 || first > last || last > n {
            return Err(format!("range [{first}, {last}] outside 1..={n}"));
        }
        for weight in &mut weights[first - 1..last] {
            *weight = weight.max(w);
        }
    }
    for &((low, high), w) in &rules.values {
        for (weight, value) in weights.iter_mut().zip(values) {
            if (low..=high).contains(value) {
                *weight = weight.max(w);
            }
        }
    }
    if !rules.keys.is_empty() {
        return Err("per-key subweights need a key-value reference".to_string());
    }
    Ok(weights)
}

/// Subweights of a key-value reference; unnamed keys get `dflt` (0 by default).
fn pair_subweights(
    rules: &SubweightRules,
    pairs: &BTreeMap<String, f64>,
) -> Result<Vec<f64>, String> {
    if let Some(unknown) = rules.keys.keys().find(|k| !pairs.contains_key(*k)) {
        return Err(format!("no reference value for '{unknown}'"));
    }
    if !(rules.indexes.is_empty() && rules.ranges.is_empty() && rules.values.is_empty()) {
        return Err("index, range and value subweights need an array reference".to_string());
    }
    let dflt = rules.dflt.unwrap_or(0.0);
    Ok(pairs
        .keys()
        .map(|k| rules.keys.get(k).copied().unwrap_or(dflt))
        .collect())
}

/// Relative deviation of `model` from `reference`.
///
/// A vanishing reference falls back to the model magnitude; when both vanish
/// the error is zero.
pub fn relative_error(reference: f64, model: f64) -> f64 {
    let diff = (model - reference).abs();
    if diff == 0.0 {
        return 0.0;
    }
    let scale = if reference != 0.0 { reference } else { model };
    diff / scale.abs()
}

/// Residual of one observable under `method`.
pub fn residual(method: ResidualMethod, reference: f64, model: f64) -> f64 {
    match method {
        ResidualMethod::Absolute => (model - reference).abs(),
        ResidualMethod::Squared => (model - reference).powi(2),
        ResidualMethod::Relative => relative_error(reference, model),
    }
}

/// Accumulate `weight * residual` (or its square for RMS).
fn accumulate(cost: CostFunction, weight: f64, residual: f64) -> f64 {
    match cost {
        CostFunction::WeightedSum => weight * residual,
        CostFunction::Rms => weight * residual * residual,
    }
}

fn finish(cost: CostFunction, total: f64) -> f64 {
    match cost {
        CostFunction::WeightedSum => total,
        CostFunction::Rms => total.sqrt(),
    }
}

/// Aggregate outcome of scoring one observable map.
#[derive(Debug, Clone, PartialEq)]
pub struct Score {
    /// Scalar cost; lower is better.
    pub fitness: f64,
    /// Maximum relative error over all weighted items.
    pub worst_relative_error: f64,
    /// Per-target breakdown, in target order.
    pub scores: Vec<TargetScore>,
}

/// The run's targets with default residual and cost definitions.
#[derive(Debug, Clone)]
pub struct TargetSet {
    targets: Vec<Target>,
    residual: ResidualMethod,
    cost: CostFunction,
    penalty: f64,
}

impl TargetSet {
    pub fn new(
        targets: Vec<Target>,
        residual: ResidualMethod,
        cost: CostFunction,
        penalty: f64,
    ) -> Self {
        Self {
            targets,
            residual,
            cost,
            penalty,
        }
    }

    /// Build targets from the objectives section and loaded reference data.
    pub fn from_config(
        config: &ObjectivesConfig,
        reference: &ReferenceData,
    ) -> Result<Self, ReferenceKeyError> {
        let targets = build_targets(reference, &config.targets)?;
        Ok(Self::new(targets, config.residual, config.cost, config.penalty))
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn penalty(&self) -> f64 {
        self.penalty
    }

    /// Score extracted observables against the targets.
    ///
    /// Unavailable observables contribute the penalty as both residual and
    /// relative error.
    pub fn score(&self, observables: &ObservableMap) -> Score {
        let mut scores = Vec::with_capacity(self.targets.len());
        let mut worst = 0.0_f64;
        let mut total = 0.0;

        for target in &self.targets {
            let method = target.residual.unwrap_or(self.residual);
            let inner = target.cost.unwrap_or(self.cost);
            let mut target_total = 0.0;
            let mut target_worst = 0.0_f64;

            let items: Vec<ItemScore> = target
                .items
                .iter()
                .map(|item| {
                    let model = observables
                        .get(&item.observable)
                        .copied()
                        .filter(|v| v.is_finite());
                    let (res, rel) = match model {
                        Some(m) => (
                            residual(method, item.reference, m),
                            relative_error(item.reference, m),
                        ),
                        None => (self.penalty, self.penalty),
                    };
                    target_total += accumulate(inner, item.subweight, res);
                    if item.subweight > 0.0 {
                        target_worst = target_worst.max(rel);
                    }
                    ItemScore {
                        observable: item.observable.clone(),
                        reference: item.reference,
                        model,
                        subweight: item.subweight,
                        residual: res,
                        relative_error: rel,
                    }
                })
                .collect();

            let target_residual = finish(inner, target_total);
            let weighted = accumulate(self.cost, target.weight, target_residual);
            total += weighted;
            worst = worst.max(target_worst);
            scores.push(TargetScore {
                key: target.key.clone(),
                weight: target.weight,
                residual: target_residual,
                relative_error: target_worst,
                weighted_residual: weighted,
                items,
            });
        }

        Score {
            fitness: finish(self.cost, total),
            worst_relative_error: worst,
            scores,
        }
    }
}

/// Target construction errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReferenceKeyError {
    #[error("Reference data has no value for: {}", .0.join(", "))]
    Missing(Vec<String>),
    #[error("Target weights must have a positive finite sum")]
    ZeroTotalWeight,
    #[error("Target '{key}': invalid subweights: {reason}")]
    Subweights { key: String, reason: String },
}
