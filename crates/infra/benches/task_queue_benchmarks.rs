use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use serde_json::json;
use smartbill_core::TaskType;
use smartbill_infra::{EngineConfig, InMemoryTaskStore, TaskEngine, handler_fn};
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn engine() -> TaskEngine<InMemoryTaskStore> {
    let mut engine = TaskEngine::new(InMemoryTaskStore::arc(), EngineConfig::default());
    engine.register_handler(
        TaskType::InvoiceOcr,
        handler_fn(|target: String| async move { Ok(json!({ "invoice_number": target })) }),
    );
    engine
}

fn bench_submission(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("submission");

    // Every iteration inserts a new queued task.
    group.bench_function("submit_new", |b| {
        let svc = engine().service();
        let mut n = 0u64;
        b.iter(|| {
            n += 1;
            let target = format!("inv{n}");
            rt.block_on(svc.submit("invoice_ocr", "u1", "u1", black_box(&target), Some("h1")))
                .unwrap();
        });
    });

    // Same key every time: resolved by the in-flight lookup, no insert.
    group.bench_function("submit_duplicate", |b| {
        let svc = engine().service();
        rt.block_on(svc.submit("invoice_ocr", "u1", "u1", "inv1", Some("h1")))
            .unwrap();
        b.iter(|| {
            rt.block_on(svc.submit("invoice_ocr", "u1", "u1", black_box("inv1"), Some("h1")))
                .unwrap();
        });
    });

    group.finish();
}

fn bench_claim_and_complete(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("claim_and_complete");

    // Queue depth matters because the oldest task is found by scanning.
    for backlog in [0usize, 100, 1_000] {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("run_once", backlog), &backlog, |b, &backlog| {
            let engine = engine();
            let svc = engine.service();
            for n in 0..backlog {
                rt.block_on(svc.submit("invoice_ocr", "u2", "u2", &format!("backlog{n}"), None))
                    .unwrap();
            }
            let mut n = 0u64;
            b.iter(|| {
                n += 1;
                let target = format!("inv{n}");
                rt.block_on(async {
                    svc.submit("invoice_ocr", "u1", "u1", &target, None)
                        .await
                        .unwrap();
                    black_box(engine.run_once().await.unwrap());
                });
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_submission, bench_claim_and_complete);
criterion_main!(benches);
