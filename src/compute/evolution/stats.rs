//! Per-generation fitness statistics.

use crate::schema::FitnessStats;

/// Mean, population standard deviation, min and max of `values`.
///
/// Non-finite values are ignored; an empty input yields all zeros.
pub fn fitness_statistics(values: &[f64]) -> FitnessStats {
    let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return FitnessStats::default();
    }
    let n = finite.len() as f64;
    let mean = finite.iter().sum::<f64>() / n;
    let variance = finite.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    FitnessStats {
        mean,
        std: variance.sqrt(),
        min: finite.iter().copied().fold(f64::INFINITY, f64::min),
        max: finite.iter().copied().fold(f64::NEG_INFINITY, f64::max),
    }
}
