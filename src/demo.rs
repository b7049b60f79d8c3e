//! Servicio y máquinas de demostración.
//!
//! `DemoService` simula un backend de pedidos: reserva stock, cobra y procesa
//! lotes. Los fallos se fuerzan desde los parámetros de arranque para poder
//! reproducir compensación, reintentos y `forward` sin infraestructura.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use saga_core::{EngineError, Expr, PersistMode, RecoverStrategy, RetryRule, ServiceError, ServiceInvoker, State, StateMachine,
                StateMachineEngine};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

pub const SERVICE: &str = "demo";

static LOGGER: Lazy<()> = Lazy::new(|| {
    let _ = pretty_env_logger::try_init(); // ignora si ya hay logger
});

/// Inicializa `pretty_env_logger` una sola vez (RUST_LOG).
pub fn init_logging() { Lazy::force(&LOGGER); }

#[derive(Debug, Error)]
pub enum DemoError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("scenario '{scenario}' ended unexpectedly: {detail}")]
    Unexpected { scenario: &'static str, detail: String },
}

/// Servicio de demo. Cuenta llamadas por método.
#[derive(Clone, Default)]
pub struct DemoService {
    calls: Arc<DashMap<String, u64>>,
}

impl DemoService {
    pub fn new() -> Self { Self::default() }

    pub fn count(&self, method: &str) -> u64 { self.calls.get(method).map(|c| *c).unwrap_or(0) }

    fn bump(&self, method: &str) -> u64 {
        let mut c = self.calls.entry(method.to_string()).or_insert(0);
        *c += 1;
        *c
    }
}

fn flag(input: &Value, name: &str) -> bool { input.get(name).and_then(Value::as_bool).unwrap_or(false) }

impl ServiceInvoker for DemoService {
    fn invoke(&self, method: &str, input: &Value) -> Result<Value, ServiceError> {
        let call = self.bump(method);
        match method {
            "reserve" => Ok(json!({ "reservation": format!("R-{call}"), "qty": input.get("qty").cloned().unwrap_or(json!(1)) })),
            "charge" => {
                if flag(input, "reject") {
                    return Err(ServiceError::new("PaymentRejected", "card declined"));
                }
                // Falla las primeras `flakyTimes` llamadas.
                let flaky = input.get("flakyTimes").and_then(Value::as_u64).unwrap_or(0);
                if call <= flaky {
                    return Err(ServiceError::new("GatewayBusy", "payment gateway busy"));
                }
                Ok(json!({ "receipt": format!("P-{call}") }))
            }
            "ship" => {
                if flag(input, "noAnswer") {
                    return Err(ServiceError::unknown("Timeout", "carrier did not answer"));
                }
                Ok(json!({ "tracking": format!("T-{call}") }))
            }
            "process" => {
                let element = input.get("element").cloned().unwrap_or(Value::Null);
                if input.get("failAt") == Some(&element) {
                    return Err(ServiceError::new("ItemRejected", format!("element {element} rejected")));
                }
                Ok(json!({ "done": element }))
            }
            "slow" => {
                let ms = input.get("sleepMs").and_then(Value::as_u64).unwrap_or(50);
                std::thread::sleep(Duration::from_millis(ms));
                Ok(json!({ "slept": ms }))
            }
            m if m.starts_with("undo") || m == "refund" || m == "release" => Ok(json!({ "undone": m })),
            other => Err(ServiceError::new("NoSuchMethod", other.to_string())),
        }
    }
}

/// `reserve -> charge -> ship`. `reserve` y `charge` se compensan; `charge`
/// reintenta los `GatewayBusy`.
pub fn purchase_machine() -> Result<StateMachine, EngineError> {
    StateMachine::builder("purchase").start_at("reserve")
                                     .comment("reserva, cobra y envía un pedido")
                                     .state(State::service_task("reserve", SERVICE, "reserve").input("qty", Expr::var("qty"))
                                                                                              .output("reservation", Expr::output("reservation"))
                                                                                              .compensate_with("release")
                                                                                              .for_update(true)
                                                                                              .next("charge"))
                                     .state(State::service_task("charge", SERVICE, "charge").input("reject", Expr::var("reject"))
                                                                                            .input("flakyTimes", Expr::var("flakyTimes"))
                                                                                            .output("receipt", Expr::output("receipt"))
                                                                                            .retry(RetryRule::new(3).on_errors(["GatewayBusy"])
                                                                                                                    .interval(Duration::from_millis(5), 1.0))
                                                                                            .compensate_with("refund")
                                                                                            .for_update(true)
                                                                                            .next("ship"))
                                     .state(State::service_task("ship", SERVICE, "ship").input("noAnswer", Expr::var("noAnswer"))
                                                                                        .output("tracking", Expr::output("tracking")))
                                     .state(State::service_task("release", SERVICE, "release").input("reservation", Expr::var("reservation")))
                                     .state(State::service_task("refund", SERVICE, "refund").input("receipt", Expr::var("receipt")))
                                     .build()
}

/// Lote sobre `items`; el elemento igual a `failAt` falla. Con
/// `RecoverStrategy::Forward` la instancia queda reanudable.
pub fn batch_machine(strategy: RecoverStrategy, retry_mode: PersistMode) -> Result<StateMachine, EngineError> {
    StateMachine::builder("batch").start_at("loop")
                                  .recover_strategy(strategy)
                                  .retry_persist_mode(retry_mode)
                                  .state(State::loop_over("loop", "items", "process").next("summary")
                                                                                      .output("results", Expr::output("")))
                                  .state(State::service_task("process", SERVICE, "process").input("element", Expr::var("loopElement"))
                                                                                           .input("failAt", Expr::var("failAt"))
                                                                                           .for_update(true)
                                                                                           .compensate_with("undoProcess"))
                                  .state(State::script("summary", Expr::var("results").len()).output("processed", Expr::output("")))
                                  .state(State::service_task("undoProcess", SERVICE, "undoProcess").input("element", Expr::var("loopElement")))
                                  .build()
}

/// Motor en memoria con `DemoService` registrado y las máquinas de demo.
pub fn in_memory_engine(service: &DemoService) -> Result<StateMachineEngine, EngineError> {
    let engine = StateMachineEngine::in_memory().service(SERVICE, service.clone()).build();
    register_machines(&engine, RecoverStrategy::Forward)?;
    Ok(engine)
}

pub fn register_machines(engine: &StateMachineEngine, batch_strategy: RecoverStrategy) -> Result<(), EngineError> {
    engine.register(purchase_machine()?)?;
    engine.register(batch_machine(batch_strategy, PersistMode::New)?)?;
    Ok(())
}

/// Resumen de un escenario para imprimir como JSON.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioSummary {
    pub instance_id: String,
    pub status: &'static str,
    pub compensation_status: Option<&'static str>,
    pub states: usize,
    pub end_params: Option<Value>,
}

impl From<&saga_core::StateMachineInstance> for ScenarioSummary {
    fn from(i: &saga_core::StateMachineInstance) -> Self {
        Self { instance_id: i.id.clone(),
               status: i.status.code(),
               compensation_status: i.compensation_status.map(|c| c.code()),
               states: i.states.len(),
               end_params: i.end_params.clone() }
    }
}

/// Ejecuta los escenarios síncronos de la demo y devuelve sus resúmenes en orden.
pub fn run_scenarios(engine: &StateMachineEngine) -> Result<IndexMap<&'static str, ScenarioSummary>, DemoError> {
    let mut out = IndexMap::new();

    let ok = engine.start("purchase", None, json!({"qty": 2, "flakyTimes": 1}))?;
    out.insert("purchase_ok", ScenarioSummary::from(&ok));

    let rejected = engine.start("purchase", None, json!({"qty": 1, "reject": true}))?;
    if rejected.compensation_status.is_none() {
        return Err(DemoError::Unexpected { scenario: "purchase_rejected",
                                           detail: "compensation did not run".into() });
    }
    out.insert("purchase_rejected", ScenarioSummary::from(&rejected));

    let items: Vec<u32> = (0..10).collect();
    let stuck = engine.start("batch", None, json!({"items": items, "failAt": 5}))?;
    out.insert("batch_stuck", ScenarioSummary::from(&stuck));
    let resumed = engine.forward(&stuck.id, Some(json!({"failAt": -1})))?;
    out.insert("batch_forwarded", ScenarioSummary::from(&resumed));

    Ok(out)
}
