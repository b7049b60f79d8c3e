mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use saga_core::engine::RecoveryReport;
use saga_core::{EngineConfig, EngineError, ExecutionStatus, Expr, GlobalStatus, RecoveryCoordinator, ServiceError, State, StateMachine,
                StateMachineEngine};
use serde_json::{json, Value};
use support::DemoService;

/// Servicio que responde "desconocido" las primeras `n` llamadas.
fn flaky_after(n: usize) -> impl Fn(&str, &Value) -> Result<Value, ServiceError> + Send + Sync + 'static {
    let calls = Arc::new(AtomicUsize::new(0));
    move |_method: &str, _input: &Value| {
        if calls.fetch_add(1, Ordering::SeqCst) < n {
            Err(ServiceError::unknown("Timeout", "no answer"))
        } else {
            Ok(json!({"ok": true}))
        }
    }
}

fn engine(svc: &DemoService, config: EngineConfig) -> StateMachineEngine {
    let _ = pretty_env_logger::try_init();
    StateMachineEngine::in_memory().config(config)
                                   .service("demo", svc.clone())
                                   .service("flaky", flaky_after(1))
                                   .build()
}

fn timed() -> StateMachine {
    StateMachine::builder("timed").start_at("foo")
                                  .state(State::service_task("foo", "demo", "foo").next("slow")
                                                                                  .compensate_with("undoFoo")
                                                                                  .for_update(true))
                                  .state(State::service_task("slow", "demo", "slow").input("sleepMs", Expr::lit(150)))
                                  .state(State::service_task("undoFoo", "demo", "compensateFoo"))
                                  .build()
                                  .unwrap()
}

#[test]
fn late_success_after_timeout_is_rolled_back() {
    let svc = DemoService::default();
    let engine = engine(&svc, EngineConfig::default().with_trans_operation_timeout(Duration::from_millis(60)));
    engine.register(timed()).unwrap();

    let inst = engine.start("timed", None, json!({})).unwrap();
    let slow = inst.states_named("slow").next().unwrap();
    assert_eq!(slow.status, ExecutionStatus::Succeeded);
    assert_eq!(inst.status, ExecutionStatus::Unknown);
    assert_eq!(inst.error.as_ref().map(|e| e.code.as_str()), Some("Timeout"));
    assert_eq!(inst.compensation_status, None);
    assert_eq!(engine.coordinator().reload(&inst.id).unwrap(), GlobalStatus::TimeoutRollbacking);

    // Sólo la compensación puede cerrar la transacción.
    assert!(matches!(engine.forward(&inst.id, None), Err(EngineError::OperationDenied(_))));
    let report = RecoveryCoordinator::new(engine.clone()).scan_once().unwrap();
    assert_eq!(report,
               RecoveryReport { scanned: 1,
                                compensated: 1,
                                ..Default::default() });
    let done = engine.get_instance(&inst.id).unwrap().unwrap();
    assert_eq!(done.compensation_status, Some(ExecutionStatus::Succeeded));
    assert_eq!(svc.count("compensateFoo"), 1);
    assert_eq!(engine.coordinator().reload(&inst.id).unwrap(), GlobalStatus::Rollbacked);
}

#[test]
fn commit_retrying_instance_is_forwarded() {
    let svc = DemoService::default();
    let engine = engine(&svc, EngineConfig::default());
    let machine = StateMachine::builder("remote").start_at("foo")
                                                 .state(State::service_task("foo", "demo", "foo").next("call"))
                                                 .state(State::service_task("call", "flaky", "call").output("ok", Expr::output("ok")))
                                                 .build()
                                                 .unwrap();
    engine.register(machine).unwrap();

    let inst = engine.start("remote", None, json!({})).unwrap();
    assert_eq!(inst.status, ExecutionStatus::Unknown);
    assert_eq!(engine.coordinator().reload(&inst.id).unwrap(), GlobalStatus::CommitRetrying);

    let report = RecoveryCoordinator::new(engine.clone()).scan_once().unwrap();
    assert_eq!(report.forwarded, 1);
    let done = engine.get_instance(&inst.id).unwrap().unwrap();
    assert_eq!(done.status, ExecutionStatus::Succeeded);
    assert_eq!(done.end_params.unwrap()["ok"], json!(true));
    // foo no se repite al reanudar.
    assert_eq!(svc.count("foo"), 1);
    assert_eq!(engine.coordinator().reload(&inst.id).unwrap(), GlobalStatus::Committed);

    // Una segunda pasada ya no encuentra nada pendiente.
    assert_eq!(RecoveryCoordinator::new(engine.clone()).scan_once().unwrap().scanned, 0);
}

#[test]
fn interrupted_compensation_is_resumed() {
    let svc = DemoService::default();
    let engine = engine(&svc, EngineConfig::default());
    let machine = StateMachine::builder("undo").start_at("foo")
                                               .state(State::service_task("foo", "demo", "foo").next("bar").compensate_with("undoFoo"))
                                               .state(State::service_task("bar", "demo", "bar"))
                                               .state(State::service_task("undoFoo", "flaky", "undo"))
                                               .build()
                                               .unwrap();
    engine.register(machine).unwrap();

    let inst = engine.start("undo", None, json!({"barFail": true})).unwrap();
    assert_eq!(inst.compensation_status, Some(ExecutionStatus::Unknown));
    assert!(!inst.is_terminal());
    assert_eq!(engine.coordinator().reload(&inst.id).unwrap(), GlobalStatus::RollbackRetrying);
    assert!(matches!(engine.forward(&inst.id, None), Err(EngineError::OperationDenied(_))));

    let report = RecoveryCoordinator::new(engine.clone()).scan_once().unwrap();
    assert_eq!(report.compensated, 1);
    let done = engine.get_instance(&inst.id).unwrap().unwrap();
    assert_eq!(done.compensation_status, Some(ExecutionStatus::Succeeded));
    let attempts: Vec<_> = done.compensation_states().map(|s| s.status).collect();
    assert_eq!(attempts, vec![ExecutionStatus::Unknown, ExecutionStatus::Succeeded]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn instances_being_driven_are_skipped() {
    let svc = DemoService::default();
    let engine = engine(&svc, EngineConfig::default());
    engine.register(timed()).unwrap();

    let (inst, handle) = engine.start_async("timed", None, json!({})).unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(engine.is_driving(&inst.id));
    let report = RecoveryCoordinator::new(engine.clone()).scan_once().unwrap();
    assert_eq!(report.scanned, 1);
    assert_eq!(report.skipped, 1);

    let outcome = handle.wait().await.unwrap();
    assert_eq!(outcome.instance.status, ExecutionStatus::Succeeded);
    assert!(!engine.is_driving(&inst.id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn started_run_holds_the_instance_against_other_drivers() {
    let svc = DemoService::default();
    let engine = engine(&svc, EngineConfig::default());
    engine.register(timed()).unwrap();

    let (inst, handle) = engine.start_async("timed", None, json!({})).unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(matches!(engine.forward(&inst.id, None), Err(EngineError::InstanceLocked(_))));
    assert!(matches!(engine.compensate(&inst.id, None), Err(EngineError::InstanceLocked(_))));

    let outcome = handle.wait().await.unwrap();
    assert_eq!(outcome.instance.status, ExecutionStatus::Succeeded);
    assert_eq!(svc.count("compensateFoo"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn poll_loop_resolves_pending_instances() {
    let svc = DemoService::default();
    let engine = engine(&svc, EngineConfig::default().with_recovery_interval(Duration::from_millis(20)));
    let machine = StateMachine::builder("remote").start_at("call")
                                                 .state(State::service_task("call", "flaky", "call"))
                                                 .build()
                                                 .unwrap();
    engine.register(machine).unwrap();
    let inst = engine.start("remote", None, json!({})).unwrap();
    assert_eq!(inst.status, ExecutionStatus::Unknown);

    let poller = RecoveryCoordinator::new(engine.clone()).spawn_loop(None).unwrap();
    let mut status = inst.status;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        status = engine.get_instance(&inst.id).unwrap().unwrap().status;
        if status == ExecutionStatus::Succeeded {
            break;
        }
    }
    poller.stop();
    assert_eq!(status, ExecutionStatus::Succeeded);
}

#[test]
fn forward_rules() {
    let svc = DemoService::default();
    let engine = engine(&svc, EngineConfig::default());
    engine.register(timed()).unwrap();
    assert!(matches!(engine.forward("missing", None), Err(EngineError::InstanceNotFound(_))));

    let inst = engine.start("timed", None, json!({})).unwrap();
    assert_eq!(inst.status, ExecutionStatus::Succeeded);
    let again = engine.forward(&inst.id, None).unwrap();
    assert_eq!(again.states.len(), inst.states.len());
}

#[test]
fn timeout_change_applies_to_later_runs() {
    let svc = DemoService::default();
    let engine = engine(&svc, EngineConfig::default());
    engine.register(timed()).unwrap();
    let before = engine.start("timed", None, json!({})).unwrap();
    assert_eq!(before.status, ExecutionStatus::Succeeded);

    engine.set_trans_operation_timeout(Duration::from_millis(10));
    assert_eq!(engine.config().trans_operation_timeout, Duration::from_millis(10));
    let after = engine.start("timed", None, json!({})).unwrap();
    assert_eq!(after.status, ExecutionStatus::Unknown);
}
