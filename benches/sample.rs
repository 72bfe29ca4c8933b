use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use speedy_mh::{
    FnLikelihood, McmcChain, McmcSettings, ParameterDef, ParameterSpace, Posterior, Prior,
    RunContext, Sampler, WeightedMoments,
};

fn make_posterior(dim: usize) -> Posterior {
    let prior = Prior::Uniform {
        min: -20.,
        max: 20.,
    };
    let space = ParameterSpace::new((0..dim).map(|i| {
        ParameterDef::sampled(format!("x{i}"), prior)
            .with_proposal(1.)
            .with_cost(if i < dim / 2 { 10. } else { 1. })
    }))
    .unwrap();
    let like = FnLikelihood::new("normal", |v: &[f64]| -0.5 * v.iter().map(|x| x * x).sum::<f64>());
    Posterior::new(space, vec![Box::new(like)]).unwrap()
}

fn criterion_benchmark(c: &mut Criterion) {
    for dim in [4, 32] {
        let settings = McmcSettings {
            num_chains: 1,
            ..Default::default()
        };
        let ctx = RunContext::new(Arc::new(make_posterior(dim)), settings).unwrap();
        c.bench_function(&format!("metropolis steps {dim}"), |b| {
            b.iter_batched(
                || {
                    McmcChain::initialize(0, ChaCha8Rng::seed_from_u64(42), ctx.initial_proposal(), &ctx)
                        .unwrap()
                },
                |mut chain| {
                    chain.advance(&ctx, black_box(1000)).unwrap();
                    chain
                },
                BatchSize::SmallInput,
            )
        });
    }

    let mut moments = WeightedMoments::new(32);
    let x: Vec<f64> = (0..32).map(|i| i as f64 / 7.).collect();
    c.bench_function("weighted moments add 32", |b| {
        b.iter(|| moments.add(black_box(&x), black_box(3.)))
    });

    c.bench_function("four parallel chains", |b| {
        b.iter(|| {
            let settings = McmcSettings {
                num_chains: 4,
                seed: Some(42),
                max_steps: Some(2000),
                ..Default::default()
            };
            Sampler::new(make_posterior(8), settings).unwrap().run().unwrap()
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
