//! Regular grid over the free parameters, handed out in batches.

use crate::schema::{ParameterScanConfig, ParameterSpace};

/// Equally spaced values over `[lo, hi]`, end points included.
fn linspace(lo: f64, hi: f64, points: usize) -> Vec<f64> {
    match points {
        0 => Vec::new(),
        1 => vec![lo],
        n => (0..n)
            .map(|i| lo + (hi - lo) * i as f64 / (n - 1) as f64)
            .collect(),
    }
}

/// Every point of the scan grid.
///
/// Free parameters take `points` (or their `per_parameter` override) values
/// across their bounds; integer parameters are rounded and repeated values
/// dropped. Other parameters keep their nominal value. The last parameter
/// varies fastest.
pub fn grid_points(space: &ParameterSpace, config: &ParameterScanConfig) -> Vec<Vec<f64>> {
    for name in config.per_parameter.keys() {
        if space.by_name(name).is_none_or(|p| !p.is_free()) {
            log::warn!("Scan point count for '{name}' ignored: not a free parameter");
        }
    }

    let axes: Vec<Vec<f64>> = space
        .iter()
        .map(|p| match p.bounds() {
            Some((lo, hi)) if p.is_free() => {
                let n = config.per_parameter.get(p.name()).copied().unwrap_or(config.points);
                let mut axis: Vec<f64> = linspace(lo, hi, n).into_iter().map(|v| p.clamp(v)).collect();
                axis.dedup();
                axis
            }
            _ => vec![p.value()],
        })
        .collect();

    let mut grid = vec![Vec::with_capacity(axes.len())];
    for axis in &axes {
        grid = grid
            .into_iter()
            .flat_map(|prefix| {
                axis.iter().map(move |&v| {
                    let mut point = prefix.clone();
                    point.push(v);
                    point
                })
            })
            .collect();
    }
    grid
}

/// Scan progress over a precomputed grid.
#[derive(Debug, Clone)]
pub struct Scan {
    grid: Vec<Vec<f64>>,
    next: usize,
}

impl Scan {
    pub fn new(space: &ParameterSpace, config: &ParameterScanConfig) -> Self {
        let grid = grid_points(space, config);
        log::info!("Parameter scan over {} grid points", grid.len());
        Self { grid, next: 0 }
    }

    /// Total number of grid points.
    pub fn len(&self) -> usize {
        self.grid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grid.is_empty()
    }

    /// Points not yet handed out.
    pub fn remaining(&self) -> usize {
        self.grid.len() - self.next
    }

    /// Number of batches of `size` needed to cover the grid.
    pub fn batches(&self, size: usize) -> usize {
        self.grid.len().div_ceil(size.max(1))
    }

    /// Hand out up to `size` further points.
    pub fn next_batch(&mut self, size: usize) -> Vec<Vec<f64>> {
        let end = (self.next + size).min(self.grid.len());
        let batch = self.grid[self.next..end].to_vec();
        self.next = end;
        batch
    }
}
