//! skpar CLI - Fit tight-binding parameters from a JSON configuration.

use std::path::PathBuf;
use std::time::Instant;

use skpar::{
    compute::Optimizer,
    schema::{EvolutionResult, RunConfig},
};

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: {} <config.json>", args[0]);
        eprintln!();
        eprintln!("Optimize model parameters against reference data.");
        eprintln!();
        eprintln!("Arguments:");
        eprintln!("  config.json  Path to the run configuration file");
        eprintln!();
        eprintln!("Example configuration is generated with --example flag.");
        std::process::exit(1);
    }

    if args[1] == "--example" {
        print_example_config();
        return;
    }

    let config_path = PathBuf::from(&args[1]);
    let config = RunConfig::from_file(&config_path).unwrap_or_else(|e| {
        eprintln!("Error loading config: {}", e);
        std::process::exit(1);
    });

    let mut optimizer = Optimizer::from_config(&config).unwrap_or_else(|e| {
        eprintln!("Error in configuration: {}", e);
        std::process::exit(1);
    });

    println!("skpar parameter optimization");
    println!("============================");
    println!("Parameters: {}", config.parameters.len());
    println!("Tasks: {}", config.tasks.len());
    println!("Targets: {}", config.objectives.targets.len());
    println!("Algorithm: {:?}", config.evolution.algorithm);
    println!(
        "Population: {} x {} generations",
        config.evolution.population.size, config.evolution.population.max_generations
    );
    println!();

    let start = Instant::now();
    let result = optimizer
        .run_with_callback(|progress| {
            println!(
                "  Generation {}/{}: best={:.6e}, mean={:.6e}, stagnant={}",
                progress.generation,
                progress.total_generations,
                progress.best_fitness,
                progress.stats.mean,
                progress.stagnation_count,
            );
        })
        .unwrap_or_else(|e| {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        });

    print_summary(&result);
    println!("Time: {:.2}s", start.elapsed().as_secs_f32());
}

fn print_summary(result: &EvolutionResult) {
    let best = &result.best;
    println!();
    println!("Best candidate (generation {}, id {}):", best.generation, best.id);
    println!("  Cost: {:.6e}", best.fitness);
    if let Some(worst) = best.worst_relative_error {
        println!("  Worst relative error: {:.4}", worst);
    }
    for p in &best.parameters {
        println!("  {:<16} {}", p.name, p.value);
    }
    if !best.target_scores.is_empty() {
        println!();
        println!("Targets:");
        for t in &best.target_scores {
            println!(
                "  {:<16} weight={:.4} residual={:.6e} rel.err={:.4}",
                t.key, t.weight, t.residual, t.relative_error,
            );
            if t.items.len() == 1 {
                continue;
            }
            for item in &t.items {
                println!(
                    "    {:<14} ref={:<14} model={:<14} subweight={:.4}",
                    item.observable,
                    item.reference,
                    item.model.map_or("n/a".to_string(), |m| m.to_string()),
                    item.subweight,
                );
            }
        }
    }
    if let Some(failure) = &best.failure {
        println!("  Failure: {}", failure);
    }

    let stats = &result.stats;
    println!();
    println!("Stop reason: {:?}", stats.stop_reason);
    println!(
        "Evaluations: {} ({} failed, {:.1}/s)",
        stats.total_evaluations, stats.failed_evaluations, stats.evaluations_per_second
    );
}

fn print_example_config() {
    match serde_json::to_string_pretty(&RunConfig::default()) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            eprintln!("Error serializing example config: {}", e);
            std::process::exit(1);
        }
    }
}
