//! Pool demo
//!
//! Runs two in-process workers: `workers/math` (permanent) and
//! `workers/report`, whose `summary` method delegates to the math worker.
//!
//! cargo run --example pool_demo

use serde_json::{json, Value};
use std::sync::Arc;
use workerlink::{
    call, default_pretty_handler, AutoWorker, LocalSpawner, LogLevel, MethodRegistry, Result, StructuredLogger,
    WorkerContext, WorkerOptions, WorkerPool,
};

fn math_worker() -> MethodRegistry {
    let mut methods = MethodRegistry::new();
    let registered = methods
        .register_sync("add", |_: &WorkerContext, (a, b): (i64, i64)| Ok(a + b))
        .and_then(|m| m.register_sync("multiply", |_: &WorkerContext, (a, b): (i64, i64)| Ok(a * b)))
        .and_then(|m| {
            m.register_sync("fibonacci", |_: &WorkerContext, (n,): (u64,)| {
                let (mut a, mut b) = (0u64, 1u64);
                for _ in 0..n {
                    let next = a.wrapping_add(b);
                    a = b;
                    b = next;
                }
                Ok(a)
            })
        })
        .and_then(|m| {
            m.register_sync("count", |ctx: &WorkerContext, (): ()| {
                ctx.update_state(|prev| json!({ "calls": prev["calls"].as_u64().unwrap_or(0) + 1 }));
                Ok(ctx.state())
            })
        });
    if let Err(err) = registered {
        eprintln!("math worker: {}", err);
    }
    methods
}

fn report_worker() -> MethodRegistry {
    let mut methods = MethodRegistry::new();
    let registered = methods.register("summary", |ctx: WorkerContext, (a, b): (i64, i64)| async move {
        let sum = ctx.call_sub_worker("workers/math", "add", (a, b)).await?;
        let product = ctx.call_sub_worker("workers/math", "multiply", (a, b)).await?;
        Ok(json!({ "sum": sum, "product": product }))
    });
    if let Err(err) = registered {
        eprintln!("report worker: {}", err);
    }
    methods
}

#[tokio::main]
async fn main() -> Result<()> {
    let logger = StructuredLogger::new(Some(Arc::new(default_pretty_handler)), LogLevel::Info, Some("demo".to_string()));

    let spawner = LocalSpawner::with_options(WorkerOptions::new().with_logger(logger.clone()));
    spawner
        .register("workers/math", math_worker)
        .register("workers/report", report_worker);

    let pool = WorkerPool::builder(Arc::new(spawner.clone()))
        .permanent_worker("workers/math")
        .logger(logger.clone())
        .build();

    // Calls made before create() are buffered and flushed in order.
    let math = Arc::new(AutoWorker::new(Arc::new(pool.clone()), "workers/math").with_logger(logger));
    let early: Vec<_> = (1..=3)
        .map(|n| {
            let math = math.clone();
            tokio::spawn(async move { call!(math, fibonacci(n * 10)).await })
        })
        .collect();
    tokio::task::yield_now().await;

    math.create().await?;
    for (n, call) in (1..=3).zip(early) {
        match call.await {
            Ok(Ok(value)) => println!("fibonacci({}) = {}", n * 10, value),
            Ok(Err(err)) => println!("fibonacci({}) failed: {}", n * 10, err),
            Err(err) => println!("fibonacci({}) task failed: {}", n * 10, err),
        }
    }

    // Published state.
    if let Some(session) = math.session() {
        let subscription = session
            .subscribe(|state: Value| println!("math state -> {}", state))
            .await?;
        for _ in 0..3 {
            call!(math, count()).await?;
        }
        subscription.unsubscribe().await?;
    }

    // Delegation: report asks the controller to run math methods for it.
    let report = pool.use_worker("workers/report").await?;
    let summary = call!(report, summary(6, 7)).await?;
    println!("summary(6, 7) = {}", summary);
    report.destroy().await?;

    math.destroy(None).await?;
    println!(
        "spawned {} instances, {} still live (workers/math is permanent)",
        spawner.spawned(),
        spawner.live()
    );

    pool.shutdown();
    Ok(())
}
