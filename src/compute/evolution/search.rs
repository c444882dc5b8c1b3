//! Population-based search over the parameter space.
//!
//! The generation loop is sequential: all individuals of generation `g` are
//! evaluated and recorded before generation `g + 1` is built. Evaluations within
//! a generation run in parallel on rayon; workers only fill in their own
//! candidate's outcome and the loop integrates the results.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use rayon::prelude::*;

use crate::compute::evaluator::{Evaluation, EvaluationFailure, Iteration, Objective};
use crate::schema::{
    CandidateSnapshot, EvolutionConfig, EvolutionHistory, EvolutionProgress, EvolutionResult,
    EvolutionStats, FailurePolicy, GenerationStats, GeneticAlgorithmConfig,
    NamedValue, ParameterSpace, SearchAlgorithm, SelectionMethod, StopReason,
};

use super::archive::HallOfFame;
use super::genome::ParameterRng;
use super::scan::Scan;
use super::stats::fitness_statistics;
use super::swarm::Swarm;

/// Outcome of evaluating a candidate.
#[derive(Debug, Clone)]
pub enum Fitness {
    /// Not evaluated since its values last changed.
    Pending,
    Scored(Evaluation),
    Failed(FailureRecord),
}

/// What went wrong in a failed evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureRecord {
    pub task: String,
    pub kind: &'static str,
    pub message: String,
}

impl From<EvaluationFailure> for FailureRecord {
    fn from(failure: EvaluationFailure) -> Self {
        Self {
            task: failure.task,
            kind: failure.failure.kind(),
            message: failure.failure.to_string(),
        }
    }
}

/// A candidate individual in the population.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Unique identifier.
    pub id: u64,
    values: Vec<f64>,
    fitness: Fitness,
    /// Generation created.
    pub generation: usize,
    /// Parent IDs.
    pub parents: Vec<u64>,
}

impl Candidate {
    pub fn new(id: u64, values: Vec<f64>, generation: usize, parents: Vec<u64>) -> Self {
        Self {
            id,
            values,
            fitness: Fitness::Pending,
            generation,
            parents,
        }
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Replace the values; the fitness becomes pending again.
    pub fn set_values(&mut self, values: Vec<f64>) {
        self.values = values;
        self.fitness = Fitness::Pending;
    }

    pub fn outcome(&self) -> &Fitness {
        &self.fitness
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.fitness, Fitness::Pending)
    }

    /// Cost used for ranking; failures and pending candidates score `worst`.
    pub fn cost(&self, worst: f64) -> f64 {
        match &self.fitness {
            Fitness::Scored(e) if e.fitness.is_finite() => e.fitness,
            _ => worst,
        }
    }

    /// Convert to snapshot for serialization.
    pub fn to_snapshot(&self, space: &ParameterSpace, worst: f64) -> CandidateSnapshot {
        let (worst_relative_error, target_scores, failure) = match &self.fitness {
            Fitness::Scored(e) => (Some(e.worst_relative_error), e.scores.clone(), None),
            Fitness::Failed(f) => (
                None,
                Vec::new(),
                Some(format!("{} in task '{}': {}", f.kind, f.task, f.message)),
            ),
            Fitness::Pending => (None, Vec::new(), Some("not evaluated".to_string())),
        };
        CandidateSnapshot {
            id: self.id,
            fitness: self.cost(worst),
            worst_relative_error,
            parameters: space
                .assign(&self.values)
                .map(|(name, value)| NamedValue {
                    name: name.to_string(),
                    value,
                })
                .collect(),
            target_scores,
            generation: self.generation,
            parents: self.parents.clone(),
            failure,
        }
    }
}

/// Evolution engine that runs the search.
pub struct EvolutionEngine<O: Objective> {
    config: EvolutionConfig,
    objective: O,
    rng: ParameterRng,
    population: Vec<Candidate>,
    swarm: Option<Swarm>,
    scan: Option<Scan>,
    hall_of_fame: HallOfFame,
    history: EvolutionHistory,
    running_best: Vec<f64>,
    generation: usize,
    best_fitness: f64,
    best: Option<CandidateSnapshot>,
    stagnation_count: usize,
    evaluations: u64,
    failed_evaluations: u64,
    failure_policy: FailurePolicy,
    worst_fitness: f64,
    fatal: Option<String>,
    pool: Option<rayon::ThreadPool>,
    next_id: Arc<AtomicU64>,
    cancelled: Arc<AtomicBool>,
}

impl<O: Objective> EvolutionEngine<O> {
    /// Create a new evolution engine. `config` is expected to be validated.
    pub fn new(config: EvolutionConfig, objective: O) -> Self {
        let seed = config.random_seed.unwrap_or_else(rand::random);
        log::info!("Random seed: {seed}");
        let hall_of_fame = HallOfFame::new(config.hall_of_fame);

        Self {
            config,
            objective,
            rng: ParameterRng::new(seed),
            population: Vec::new(),
            swarm: None,
            scan: None,
            hall_of_fame,
            history: EvolutionHistory::default(),
            running_best: Vec::new(),
            generation: 0,
            best_fitness: f64::INFINITY,
            best: None,
            stagnation_count: 0,
            evaluations: 0,
            failed_evaluations: 0,
            failure_policy: FailurePolicy::default(),
            worst_fitness: 1.0e10,
            fatal: None,
            pool: None,
            next_id: Arc::new(AtomicU64::new(0)),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Set how failed evaluations are treated.
    pub fn with_failure_policy(mut self, policy: FailurePolicy, worst_fitness: f64) -> Self {
        self.failure_policy = policy;
        self.worst_fitness = worst_fitness;
        self
    }

    /// Evaluate on a dedicated pool of `workers` threads (0 keeps rayon's global pool).
    pub fn with_workers(mut self, workers: usize) -> Result<Self, rayon::ThreadPoolBuildError> {
        if workers > 0 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(workers)
                .thread_name(|i| format!("skpar-eval-{i}"))
                .build()?;
            self.pool = Some(pool);
        }
        Ok(self)
    }

    /// Get cancellation handle.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn objective(&self) -> &O {
        &self.objective
    }

    pub fn population(&self) -> &[Candidate] {
        &self.population
    }

    pub fn history(&self) -> &EvolutionHistory {
        &self.history
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    fn new_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Initialize the population: the nominal configuration plus random
    /// individuals within bounds, or the first batch of a parameter scan.
    pub fn initialize(&mut self) {
        self.population.clear();
        self.generation = 0;

        let space = self.objective.space();
        let vectors = if let SearchAlgorithm::ParameterScan(config) = &self.config.algorithm {
            let mut scan = Scan::new(space, config);
            let batch = scan.next_batch(self.config.population.size);
            self.scan = Some(scan);
            batch
        } else {
            let mut nominal = space.nominal();
            space.clamp_vector(&mut nominal);
            let mut vectors = vec![nominal];
            while vectors.len() < self.config.population.size {
                vectors.push(self.rng.random_vector(space));
            }
            vectors
        };

        if let SearchAlgorithm::ParticleSwarm(pso) = &self.config.algorithm {
            self.swarm = Some(Swarm::new(pso.clone(), space, &vectors));
        }

        for values in vectors {
            let id = self.new_id();
            self.population.push(Candidate::new(id, values, 0, Vec::new()));
        }
    }

    /// Evaluate every pending candidate in the population.
    fn evaluate_population(&mut self) {
        let objective = &self.objective;
        let cancel: &AtomicBool = &self.cancelled;
        let generation = self.generation;
        let pending = self.population.iter().filter(|c| c.is_pending()).count();

        let work = |population: &mut [Candidate]| {
            population
                .par_iter_mut()
                .enumerate()
                .filter(|(_, c)| c.is_pending())
                .for_each(|(index, candidate)| {
                    let iteration = Iteration { generation, index };
                    candidate.fitness = match objective.evaluate(&candidate.values, iteration, cancel)
                    {
                        Ok(evaluation) => Fitness::Scored(evaluation),
                        Err(failure) => Fitness::Failed(failure.into()),
                    };
                });
        };
        match &self.pool {
            Some(pool) => pool.install(|| work(self.population.as_mut_slice())),
            None => work(self.population.as_mut_slice()),
        }

        for (index, candidate) in self.population.iter_mut().enumerate() {
            let Fitness::Failed(failure) = &candidate.fitness else {
                continue;
            };
            if failure.kind == "Cancelled" {
                candidate.fitness = Fitness::Pending;
                continue;
            }
            if candidate.generation != generation {
                continue;
            }
            self.failed_evaluations += 1;
            log::warn!(
                "Generation {generation}, individual {index}: task '{}' failed ({}): {}",
                failure.task,
                failure.kind,
                failure.message
            );
            if self.failure_policy == FailurePolicy::Abort && self.fatal.is_none() {
                self.fatal = Some(format!(
                    "generation {generation}, individual {index}: task '{}' failed ({})",
                    failure.task, failure.kind
                ));
            }
        }
        let remaining = self.population.iter().filter(|c| c.is_pending()).count();
        self.evaluations += (pending - remaining) as u64;
    }

    /// Record statistics of the evaluated generation and update bests.
    fn record_generation(&mut self) {
        let worst = self.worst_fitness;
        let costs: Vec<f64> = self.population.iter().map(|c| c.cost(worst)).collect();
        let fitness = fitness_statistics(&costs);
        let min_worst_error = self
            .population
            .iter()
            .filter_map(|c| match &c.fitness {
                Fitness::Scored(e) => Some(e.worst_relative_error),
                _ => None,
            })
            .reduce(f64::min);
        let failures = self
            .population
            .iter()
            .filter(|c| matches!(c.fitness, Fitness::Failed(_)))
            .count();

        log::info!(
            "Generation {}: best {:.6e}, mean {:.6e}, std {:.3e}, worst rel. error {}, failures {}",
            self.generation,
            fitness.min,
            fitness.mean,
            fitness.std,
            min_worst_error.map_or_else(|| "n/a".to_string(), |e| format!("{e:.4}")),
            failures
        );

        self.history.generations.push(GenerationStats {
            generation: self.generation,
            fitness,
            min_worst_error,
            failures,
        });

        let space = self.objective.space();
        if let Some(leader) = self
            .population
            .iter()
            .filter(|c| matches!(c.fitness, Fitness::Scored(_)))
            .min_by(|a, b| a.cost(worst).total_cmp(&b.cost(worst)))
        {
            let cost = leader.cost(worst);
            if cost < self.best_fitness {
                self.best_fitness = cost;
                self.best = Some(leader.to_snapshot(space, worst));
                self.stagnation_count = 0;
            } else {
                self.stagnation_count += 1;
            }
        } else {
            self.stagnation_count += 1;
        }
        self.running_best.push(self.best_fitness);

        for candidate in &self.population {
            if matches!(candidate.fitness, Fitness::Scored(_)) {
                self.hall_of_fame.insert(&candidate.to_snapshot(space, worst));
            }
        }

        if let Some(swarm) = &mut self.swarm {
            swarm.record(&costs);
        }
    }

    /// Run a single generation step.
    fn step_generation(&mut self) {
        match &self.config.algorithm {
            SearchAlgorithm::GeneticAlgorithm(ga_config) => {
                self.step_genetic_algorithm(ga_config.clone());
            }
            SearchAlgorithm::ParticleSwarm(_) => {
                self.step_particle_swarm();
            }
            SearchAlgorithm::ParameterScan(_) => {
                self.step_scan();
            }
        }

        self.generation += 1;
    }

    /// Replace the population with the next batch of grid points.
    fn step_scan(&mut self) {
        let Some(scan) = &mut self.scan else {
            return;
        };
        let batch = scan.next_batch(self.config.population.size);
        let next_generation = self.generation + 1;
        self.population = batch
            .into_iter()
            .map(|values| {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                Candidate::new(id, values, next_generation, Vec::new())
            })
            .collect();
    }

    /// Genetic algorithm step.
    fn step_genetic_algorithm(&mut self, ga_config: GeneticAlgorithmConfig) {
        let worst = self.worst_fitness;
        // Sort by cost (ascending)
        self.population
            .sort_by(|a, b| a.cost(worst).total_cmp(&b.cost(worst)));

        let mut next_gen = Vec::with_capacity(self.config.population.size);

        // Elitism: keep best individuals, already evaluated
        for elite in self.population.iter().take(ga_config.elitism) {
            next_gen.push(elite.clone());
        }

        while next_gen.len() < self.config.population.size {
            let idx1 = self.select_index(&ga_config.selection);
            let idx2 = self.select_index(&ga_config.selection);
            let parent1 = &self.population[idx1];
            let parent2 = &self.population[idx2];
            let parents = vec![parent1.id, parent2.id];

            let space = self.objective.space();
            let mut child = if self.rng.chance(ga_config.crossover_rate) {
                self.rng.crossover(space, &parent1.values, &parent2.values)
            } else {
                parent1.values.clone()
            };
            self.rng.mutate(
                space,
                &mut child,
                ga_config.mutation_rate,
                ga_config.mutation_strength,
            );

            let id = self.new_id();
            next_gen.push(Candidate::new(id, child, self.generation + 1, parents));
        }

        self.population = next_gen;
    }

    /// Particle swarm step: move particles and rebuild the population.
    fn step_particle_swarm(&mut self) {
        let Some(swarm) = &mut self.swarm else {
            return;
        };
        swarm.advance(&mut self.rng);

        let next_generation = self.generation + 1;
        for (index, candidate) in self.population.iter_mut().enumerate() {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            candidate.parents = vec![candidate.id];
            candidate.id = id;
            candidate.generation = next_generation;
            candidate.set_values(swarm.values(index));
        }
    }

    /// Select a parent index from the population sorted by ascending cost.
    fn select_index(&mut self, method: &SelectionMethod) -> usize {
        let worst = self.worst_fitness;
        let len = self.population.len();
        match method {
            SelectionMethod::Tournament { size } => {
                let mut best_idx = self.rng.index(len);
                for _ in 1..*size {
                    let idx = self.rng.index(len);
                    if self.population[idx].cost(worst) < self.population[best_idx].cost(worst) {
                        best_idx = idx;
                    }
                }
                best_idx
            }
            SelectionMethod::RankBased => {
                // Probability proportional to rank; the cheapest has rank `len`.
                let total_rank: usize = (1..=len).sum();
                let mut target = self.rng.index(total_rank);
                for i in 0..len {
                    let rank = len - i;
                    if target < rank {
                        return i;
                    }
                    target -= rank;
                }
                0
            }
            SelectionMethod::RouletteWheel => {
                // Weights on inverted cost relative to the cheapest candidate.
                let min = self
                    .population
                    .iter()
                    .map(|c| c.cost(worst))
                    .fold(f64::INFINITY, f64::min);
                let weights: Vec<f64> = self
                    .population
                    .iter()
                    .map(|c| 1.0 / (1.0 + c.cost(worst) - min))
                    .collect();
                let total: f64 = weights.iter().sum();
                let target = self.rng.unit() * total;
                let mut cumulative = 0.0;
                for (i, w) in weights.iter().enumerate() {
                    cumulative += w;
                    if cumulative >= target {
                        return i;
                    }
                }
                len - 1
            }
        }
    }

    /// Get current progress.
    pub fn progress(&self) -> EvolutionProgress {
        EvolutionProgress {
            generation: self.generation,
            total_generations: match &self.scan {
                Some(scan) => scan.batches(self.config.population.size).saturating_sub(1),
                None => self.config.population.max_generations,
            },
            best_fitness: self.best_fitness,
            stats: self
                .history
                .generations
                .last()
                .map(|g| g.fitness)
                .unwrap_or_default(),
            stagnation_count: self.stagnation_count,
            best_candidate: self.best.clone(),
        }
    }

    /// Check if evolution should stop.
    fn should_stop(&self) -> Option<StopReason> {
        if self.is_cancelled() {
            return Some(StopReason::Cancelled);
        }

        if let Some(message) = &self.fatal {
            return Some(StopReason::Error(message.clone()));
        }

        let population = &self.config.population;
        if let Some(target) = population.target_fitness
            && self.best_fitness <= target
        {
            return Some(StopReason::TargetReached);
        }

        if let Some(tolerance) = population.error_tolerance
            && let Some(last) = self.history.generations.last()
            && last.min_worst_error.is_some_and(|e| e <= tolerance)
        {
            return Some(StopReason::ErrorTolerance);
        }

        // A scan runs until the grid is exhausted.
        if let Some(scan) = &self.scan {
            return (scan.remaining() == 0).then_some(StopReason::ScanComplete);
        }

        if let Some(tolerance) = population.tolerance
            && self.running_best.len() > population.tolerance_window
        {
            let now = self.running_best[self.running_best.len() - 1];
            let before = self.running_best[self.running_best.len() - 1 - population.tolerance_window];
            if before.is_finite() && before - now < tolerance {
                return Some(StopReason::Converged);
            }
        }

        if let Some(limit) = population.stagnation_limit
            && self.stagnation_count >= limit
        {
            return Some(StopReason::Stagnation);
        }

        if self.generation >= population.max_generations {
            return Some(StopReason::MaxGenerations);
        }

        None
    }

    /// Run evolution with progress callback.
    pub fn run_with_callback<F>(&mut self, callback: F) -> EvolutionResult
    where
        F: Fn(&EvolutionProgress),
    {
        let start_time = Instant::now();

        self.initialize();
        self.evaluate_population();
        if !self.is_cancelled() {
            self.record_generation();
            callback(&self.progress());
        }

        let stop_reason = loop {
            if let Some(reason) = self.should_stop() {
                break reason;
            }

            self.step_generation();
            self.evaluate_population();
            if self.is_cancelled() {
                break StopReason::Cancelled;
            }
            self.record_generation();
            callback(&self.progress());
        };

        log::info!("Stopped after generation {}: {stop_reason:?}", self.generation);
        self.finish(stop_reason, start_time.elapsed().as_secs_f64())
    }

    /// Run evolution (blocking).
    pub fn run(&mut self) -> EvolutionResult {
        self.run_with_callback(|_| {})
    }

    fn finish(&self, stop_reason: StopReason, elapsed: f64) -> EvolutionResult {
        let worst = self.worst_fitness;
        let space = self.objective.space();
        let best = self.best.clone().unwrap_or_else(|| {
            let nominal = Candidate::new(u64::MAX, space.nominal(), 0, Vec::new());
            self.population
                .iter()
                .min_by(|a, b| a.cost(worst).total_cmp(&b.cost(worst)))
                .unwrap_or(&nominal)
                .to_snapshot(space, worst)
        });

        let final_avg_fitness = self
            .history
            .generations
            .last()
            .map_or(worst, |g| g.fitness.mean);

        EvolutionResult {
            best,
            hall_of_fame: self.hall_of_fame.entries().to_vec(),
            stats: EvolutionStats {
                generations: self.generation,
                total_evaluations: self.evaluations,
                failed_evaluations: self.failed_evaluations,
                best_fitness: self.best_fitness.min(worst),
                final_avg_fitness,
                elapsed_seconds: elapsed,
                evaluations_per_second: if elapsed > 0.0 {
                    self.evaluations as f64 / elapsed
                } else {
                    0.0
                },
                stop_reason,
            },
            history: self.history.clone(),
        }
    }
}
