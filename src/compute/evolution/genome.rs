//! Seeded variation operators over parameter vectors.
//!
//! Every operator returns vectors that lie inside the parameter space: bounded
//! values are clamped and integer parameters rounded after each change.

use rand::prelude::*;

use crate::schema::ParameterSpace;

/// Random number generator wrapper for parameter-vector operations.
pub struct ParameterRng {
    rng: StdRng,
}

impl ParameterRng {
    /// Create from seed.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Uniform sample of the free parameters; fixed ones keep their nominal value.
    pub fn random_vector(&mut self, space: &ParameterSpace) -> Vec<f64> {
        let mut values: Vec<f64> = space
            .iter()
            .map(|p| match p.bounds() {
                Some((lo, hi)) if p.is_free() => self.uniform(lo, hi),
                _ => p.value(),
            })
            .collect();
        space.clamp_vector(&mut values);
        values
    }

    /// Uniform in `[lo, hi]`.
    pub fn uniform(&mut self, lo: f64, hi: f64) -> f64 {
        if hi > lo {
            self.rng.gen_range(lo..=hi)
        } else {
            lo
        }
    }

    /// Uniform in `[0, 1)`.
    pub fn unit(&mut self) -> f64 {
        self.rng.r#gen()
    }

    /// Bernoulli trial.
    pub fn chance(&mut self, probability: f64) -> bool {
        self.unit() < probability
    }

    /// Uniform index in `0..len`.
    pub fn index(&mut self, len: usize) -> usize {
        self.rng.gen_range(0..len)
    }

    /// Gaussian mutation scaled by the width of `bounds`.
    pub fn gaussian_mutate(&mut self, value: f64, strength: f64, bounds: (f64, f64)) -> f64 {
        let noise: f64 = self.rng.sample(rand_distr::StandardNormal);
        let mutated = value + noise * strength * (bounds.1 - bounds.0);
        mutated.clamp(bounds.0, bounds.1)
    }

    /// Blend crossover of the free parameters.
    pub fn crossover(&mut self, space: &ParameterSpace, parent1: &[f64], parent2: &[f64]) -> Vec<f64> {
        let mut child: Vec<f64> = parent1.to_vec();
        for i in space.free_indices() {
            let t = self.unit();
            child[i] = blend(parent1[i], parent2[i], t);
        }
        space.clamp_vector(&mut child);
        child
    }

    /// Mutate each free parameter with probability `rate`.
    pub fn mutate(&mut self, space: &ParameterSpace, values: &mut [f64], rate: f64, strength: f64) {
        for (i, p) in space.iter().enumerate() {
            if let Some(bounds) = p.bounds()
                && p.is_free()
                && self.chance(rate)
            {
                values[i] = self.gaussian_mutate(values[i], strength, bounds);
            }
        }
        space.clamp_vector(values);
    }
}

/// Linear blend between two values.
fn blend(a: f64, b: f64, t: f64) -> f64 {
    a * (1.0 - t) + b * t
}
