//! Demo ejecutable: corre los escenarios de `sagaflow_rust::demo` y un
//! arranque asíncrono, seguido de un escaneo de recuperación. Con el feature
//! `pg_demo` y `DATABASE_URL` el log va a Postgres.

use std::process::ExitCode;

use log::{error, info};
use rayon::prelude::*;
use sagaflow_rust::demo::{self, DemoError, DemoService, ScenarioSummary};
use sagaflow_rust::{RecoverStrategy, RecoveryCoordinator, StateMachineEngine};
use serde::Serialize;
use serde_json::json;

#[cfg(feature = "pg_demo")]
fn build_engine(service: &DemoService, runtime: tokio::runtime::Handle) -> Result<StateMachineEngine, DemoError> {
    use saga_persistence::{build_dev_pool_from_env, PgStateLogStore, PoolProvider};

    if std::env::var("DATABASE_URL").is_err() {
        eprintln!("[PG DEMO] DATABASE_URL no definido; usando log en memoria");
        return build_memory_engine(service, runtime);
    }
    let pool = build_dev_pool_from_env().map_err(|e| DemoError::Unexpected { scenario: "pg_pool",
                                                                             detail: e.to_string() })?;
    let engine = StateMachineEngine::builder().store(PgStateLogStore::new(PoolProvider { pool }))
                                              .config(sagaflow_rust::EngineConfig::from_env())
                                              .service(demo::SERVICE, service.clone())
                                              .runtime(runtime)
                                              .build();
    demo::register_machines(&engine, RecoverStrategy::Forward)?;
    Ok(engine)
}

#[cfg(not(feature = "pg_demo"))]
fn build_engine(service: &DemoService, runtime: tokio::runtime::Handle) -> Result<StateMachineEngine, DemoError> {
    build_memory_engine(service, runtime)
}

fn build_memory_engine(service: &DemoService, runtime: tokio::runtime::Handle) -> Result<StateMachineEngine, DemoError> {
    let engine = StateMachineEngine::in_memory().config(sagaflow_rust::EngineConfig::from_env())
                                                .service(demo::SERVICE, service.clone())
                                                .runtime(runtime)
                                                .build();
    demo::register_machines(&engine, RecoverStrategy::Forward)?;
    Ok(engine)
}

fn print_json(label: &str, value: &impl Serialize) {
    match serde_json::to_string(value) {
        Ok(text) => println!("{label}: {text}"),
        Err(e) => eprintln!("{label}: <render error {e}>"),
    }
}

fn run(runtime: &tokio::runtime::Runtime) -> Result<(), DemoError> {
    let service = DemoService::new();
    let engine = build_engine(&service, runtime.handle().clone())?;

    let scenarios = demo::run_scenarios(&engine)?;
    for (name, summary) in &scenarios {
        print_json(name, summary);
    }

    // Varios pedidos independientes a la vez, cada uno con su business key.
    let orders: Vec<ScenarioSummary> = (0..4).into_par_iter()
                                             .map(|n| {
                                                 let key = format!("order-{}", uuid::Uuid::new_v4());
                                                 engine.start_with_business_key("purchase", None, &key, json!({"qty": n + 1}))
                                                       .map(|i| ScenarioSummary::from(&i))
                                             })
                                             .collect::<Result<_, _>>()?;
    print_json("parallel_orders", &orders);

    let (started, handle) = engine.start_async("purchase", None, json!({"qty": 3, "noAnswer": true}))?;
    info!("async started instance_id={} at={}", started.id, chrono::Utc::now());
    let outcome = runtime.block_on(handle.wait())?;
    print_json("async_no_answer", &ScenarioSummary::from(&outcome.instance));

    let report = RecoveryCoordinator::new(engine.clone()).scan_once()?;
    print_json("recovery", &report);
    Ok(())
}

fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    demo::init_logging();
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };
    match run(&runtime) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("demo failed: {e}");
            eprintln!("demo failed: {e}");
            ExitCode::FAILURE
        }
    }
}
