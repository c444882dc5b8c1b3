//! Particle swarm state over normalized parameter coordinates.
//!
//! Each free parameter maps its `[minv, maxv]` range onto `[-1, 1]`. Fixed
//! parameters are not part of a particle and keep their nominal value.

use crate::schema::{ParameterSpace, ParticleSwarmConfig};

use super::genome::ParameterRng;

/// One particle: current and previous position plus its personal best.
#[derive(Debug, Clone)]
pub struct Particle {
    pub position: Vec<f64>,
    pub previous: Vec<f64>,
    pub best: Option<(Vec<f64>, f64)>,
}

impl Particle {
    fn new(position: Vec<f64>) -> Self {
        Self {
            previous: position.clone(),
            position,
            best: None,
        }
    }
}

/// The swarm and its global best.
#[derive(Debug, Clone)]
pub struct Swarm {
    config: ParticleSwarmConfig,
    space: ParameterSpace,
    free: Vec<usize>,
    particles: Vec<Particle>,
    global_best: Option<(Vec<f64>, f64)>,
}

impl Swarm {
    /// Start a swarm at rest at the given physical vectors.
    pub fn new(config: ParticleSwarmConfig, space: &ParameterSpace, initial: &[Vec<f64>]) -> Self {
        let free = space.free_indices();
        let particles = initial
            .iter()
            .map(|values| Particle::new(normalize(space, &free, values)))
            .collect();
        Self {
            config,
            space: space.clone(),
            free,
            particles,
            global_best: None,
        }
    }

    pub fn len(&self) -> usize {
        self.particles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }

    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }

    /// Global best cost, if any particle has been scored.
    pub fn global_best(&self) -> Option<f64> {
        self.global_best.as_ref().map(|(_, f)| *f)
    }

    /// Physical parameter vector of particle `index`.
    pub fn values(&self, index: usize) -> Vec<f64> {
        denormalize(&self.space, &self.free, &self.particles[index].position)
    }

    /// Update personal and global bests from the costs of the current positions.
    pub fn record(&mut self, fitness: &[f64]) {
        for (particle, &cost) in self.particles.iter_mut().zip(fitness) {
            if !cost.is_finite() {
                continue;
            }
            if particle.best.as_ref().is_none_or(|(_, best)| cost < *best) {
                particle.best = Some((particle.position.clone(), cost));
            }
            if self.global_best.as_ref().is_none_or(|(_, best)| cost < *best) {
                self.global_best = Some((particle.position.clone(), cost));
            }
        }
    }

    /// Move every particle once.
    pub fn advance(&mut self, rng: &mut ParameterRng) {
        let phi = self.config.acceleration / 2.0;
        for particle in &mut self.particles {
            for d in 0..particle.position.len() {
                let x = particle.position[d];
                let mut speed = self.config.inertia * (x - particle.previous[d]);
                if let Some((best, _)) = &particle.best {
                    speed += rng.uniform(0.0, phi) * (best[d] - x);
                }
                if let Some((best, _)) = &self.global_best {
                    speed += rng.uniform(0.0, phi) * (best[d] - x);
                }
                let speed = speed.clamp(self.config.smin, self.config.smax);

                let mut next = x + speed;
                if self.config.strict_bounds {
                    if next > 1.0 {
                        next = 2.0 - next;
                    } else if next < -1.0 {
                        next = -2.0 - next;
                    }
                    next = next.clamp(-1.0, 1.0);
                }
                particle.previous[d] = x;
                particle.position[d] = next;
            }
        }
    }
}

/// Map the free entries of `values` onto `[-1, 1]`.
pub fn normalize(space: &ParameterSpace, free: &[usize], values: &[f64]) -> Vec<f64> {
    free.iter()
        .filter_map(|&i| {
            let (lo, hi) = space.get(i)?.bounds()?;
            Some(2.0 * (values[i] - lo) / (hi - lo) - 1.0)
        })
        .collect()
}

/// Inverse of [`normalize`]; the result is clamped into the space.
pub fn denormalize(space: &ParameterSpace, free: &[usize], position: &[f64]) -> Vec<f64> {
    let mut values = space.nominal();
    for (&i, &x) in free.iter().zip(position) {
        if let Some((lo, hi)) = space.get(i).and_then(|p| p.bounds()) {
            values[i] = lo + (x + 1.0) / 2.0 * (hi - lo);
        }
    }
    space.clamp_vector(&mut values);
    values
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space() -> ParameterSpace {
        ParameterSpace::parse(&["a 0 -2 2", "fixed 7", "n 5 0 10 i"]).unwrap()
    }

    #[test]
    fn test_normalization() {
        let space = space();
        let free = space.free_indices();
        assert_eq!(free, [0, 2]);
        let pos = normalize(&space, &free, &[1.0, 7.0, 10.0]);
        assert_eq!(pos, [0.5, 1.0]);
        assert_eq!(denormalize(&space, &free, &pos), [1.0, 7.0, 10.0]);
        // Integer parameters round on the way back.
        assert_eq!(denormalize(&space, &free, &[0.0, 0.03])[2], 5.0);
    }

    #[test]
    fn test_record_tracks_bests() {
        let space = space();
        let initial = vec![vec![0.0, 7.0, 5.0], vec![1.0, 7.0, 2.0]];
        let mut swarm = Swarm::new(ParticleSwarmConfig::default(), &space, &initial);
        swarm.record(&[3.0, 1.0]);
        assert_eq!(swarm.global_best(), Some(1.0));
        swarm.record(&[0.5, 2.0]);
        assert_eq!(swarm.global_best(), Some(0.5));
        assert_eq!(swarm.particles()[1].best.as_ref().map(|b| b.1), Some(1.0));
    }

    #[test]
    fn test_advance_stays_in_bounds() {
        let space = space();
        let mut rng = ParameterRng::new(3);
        let initial: Vec<Vec<f64>> = (0..8).map(|_| rng.random_vector(&space)).collect();
        let mut swarm = Swarm::new(ParticleSwarmConfig::default(), &space, &initial);

        for _ in 0..100 {
            let costs: Vec<f64> = (0..swarm.len())
                .map(|i| {
                    let v = swarm.values(i);
                    (v[0] - 1.5).powi(2) + (v[2] - 3.0).powi(2)
                })
                .collect();
            swarm.record(&costs);
            swarm.advance(&mut rng);
            for p in swarm.particles() {
                assert!(p.position.iter().all(|x| (-1.0..=1.0).contains(x)));
            }
            for i in 0..swarm.len() {
                assert!(space.contains(&swarm.values(i)));
            }
        }
        assert!(swarm.global_best().is_some_and(|b| b < 0.5));
    }
}
