use std::sync::Arc;
use std::sync::Barrier;
use std::thread;
use std::time::Instant;

use criterion::BenchmarkId;
use criterion::Criterion;
use criterion::black_box;
use criterion::criterion_group;
use criterion::criterion_main;

use shot_guard::Engine;
use shot_guard::degrade::BreakerStrategy;
use shot_guard::degrade::DegradeRule;
use shot_guard::flow::ControlBehavior;
use shot_guard::flow::FlowGrade;
use shot_guard::flow::FlowRule;
use shot_guard::param::ParamFlowRule;
use shot_guard::provider::ProviderRegistry;

const RESOURCE: &str = "bench";

fn engine_with(setup: impl FnOnce(&Engine)) -> Engine {
    let engine = Engine::builder().build().unwrap();
    setup(&engine);
    engine
}

fn bench_single_entry(group_name: &str, c: &mut Criterion, engine: &Engine) {
    let mut group = c.benchmark_group(group_name);

    group.bench_function("single-threaded", |b| {
        b.iter(|| {
            if let Ok(entry) = black_box(engine).entry(RESOURCE).with_arg(7).build() {
                entry.exit();
            }
        })
    });

    group.finish();
}

fn bench_parallel_entry(group_name: &str, c: &mut Criterion, engine: &Engine) {
    let mut group = c.benchmark_group(group_name);

    for threads in [2, 4, 8].iter() {
        let num_threads = *threads;
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}-threads", num_threads)),
            &num_threads,
            |b, &n| {
                b.iter_custom(|iters| {
                    let barrier = Arc::new(Barrier::new(n + 1));
                    let mut handles = Vec::with_capacity(n);

                    for _ in 0..n {
                        let engine = engine.clone();
                        let bar = Arc::clone(&barrier);
                        let iters_per_thread = iters / n as u64;

                        handles.push(thread::spawn(move || {
                            bar.wait();
                            for _ in 0..iters_per_thread {
                                if let Ok(entry) = black_box(&engine).entry(RESOURCE).build() {
                                    entry.exit();
                                }
                            }
                        }));
                    }

                    barrier.wait();
                    let start = Instant::now();

                    for handle in handles {
                        let _ = handle.join();
                    }

                    start.elapsed()
                });
            },
        );
    }
    group.finish();
}

fn run_all_benches(c: &mut Criterion) {
    let limit = 1_000_000.0;

    let unchecked = Engine::builder()
        .providers(ProviderRegistry::empty())
        .build()
        .unwrap();
    bench_single_entry("Empty-Chain", c, &unchecked);

    let no_rules = engine_with(|_| {});
    bench_single_entry("No-Rules", c, &no_rules);
    bench_parallel_entry("No-Rules", c, &no_rules);

    let reject = engine_with(|engine| {
        engine
            .flow_rules()
            .load_rules(vec![FlowRule::new(RESOURCE, FlowGrade::Qps, limit)])
            .unwrap();
    });
    bench_single_entry("Flow-Reject", c, &reject);
    bench_parallel_entry("Flow-Reject", c, &reject);

    let warm_up = engine_with(|engine| {
        engine
            .flow_rules()
            .load_rules(vec![
                FlowRule::new(RESOURCE, FlowGrade::Qps, limit)
                    .with_control_behavior(ControlBehavior::WarmUp),
            ])
            .unwrap();
    });
    bench_single_entry("Flow-WarmUp", c, &warm_up);

    let full = engine_with(|engine| {
        engine
            .flow_rules()
            .load_rules(vec![FlowRule::new(RESOURCE, FlowGrade::Qps, limit)])
            .unwrap();
        engine
            .degrade_rules()
            .load_rules(vec![DegradeRule::new(
                RESOURCE,
                BreakerStrategy::ErrorRatio { threshold: 0.5 },
            )])
            .unwrap();
        engine
            .param_flow_rules()
            .load_rules(vec![ParamFlowRule::new(RESOURCE, 0, FlowGrade::Qps, limit)])
            .unwrap();
    });
    bench_single_entry("Flow-Degrade-Param", c, &full);
    bench_parallel_entry("Flow-Degrade-Param", c, &full);
}

criterion_group!(benches, run_all_benches);
criterion_main!(benches);
