//! Benchmarks for the in-process parts of an evaluation.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};

use skpar::{
    compute::{
        ObservableMap, TargetSet, build_targets,
        evolution::{ParameterRng, fitness_statistics},
    },
    schema::{
        CostFunction, ParameterSpace, ReferenceData, ReferenceValue, ResidualMethod, TargetSpec,
    },
};

fn space(n: usize) -> ParameterSpace {
    let lines: Vec<String> = (0..n)
        .map(|i| {
            if i % 4 == 3 {
                format!("n{i} 4 2 12 i")
            } else {
                format!("r{i} 3.5 2.5 5.0")
            }
        })
        .collect();
    ParameterSpace::parse(&lines).expect("valid parameter lines")
}

fn bench_variation(c: &mut Criterion) {
    let mut group = c.benchmark_group("variation");

    for n in [4, 16, 64] {
        let space = space(n);
        let mut rng = ParameterRng::new(42);
        let a = rng.random_vector(&space);
        let b = rng.random_vector(&space);

        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |bench, _| {
            bench.iter(|| {
                let mut child = rng.crossover(&space, black_box(&a), black_box(&b));
                rng.mutate(&space, &mut child, 0.2, 0.1);
                child
            });
        });
    }

    group.finish();
}

fn bench_scoring(c: &mut Criterion) {
    let mut group = c.benchmark_group("target_score");

    for n in [10, 100, 1000] {
        let values: Vec<f64> = (0..n).map(|i| i as f64 * 0.1 - 5.0).collect();
        let reference: ReferenceData = (0..n)
            .map(|i| (format!("band_{i}"), ReferenceValue::Scalar(values[i])))
            .collect();
        let specs: Vec<TargetSpec> = reference.keys().map(|key| TargetSpec::new(key.as_str(), 1.0)).collect();
        let targets = build_targets(&reference, &specs).expect("all keys present");
        let set = TargetSet::new(targets, ResidualMethod::Relative, CostFunction::Rms, 1e3);
        let model: ObservableMap = (0..n)
            .map(|i| (format!("band_{i}"), values[i] * 1.01 + 0.02))
            .collect();

        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter(|| set.score(black_box(&model)));
        });
    }

    group.finish();
}

fn bench_statistics(c: &mut Criterion) {
    let costs: Vec<f64> = (0..1000).map(|i| (i as f64 * 0.37).sin().abs()).collect();
    c.bench_function("fitness_statistics_1000", |b| {
        b.iter(|| fitness_statistics(black_box(&costs)));
    });
}

criterion_group!(benches, bench_variation, bench_scoring, bench_statistics);
criterion_main!(benches);
