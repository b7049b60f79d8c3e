mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use saga_core::engine::AsyncResult;
use saga_core::{EngineConfig, EngineError, ExecutionStatus, Expr, InMemoryStateLogStore, State, StateInstance, StateLogStore,
                StateMachine, StateMachineEngine, StateMachineInstance, StoreError};
use serde_json::json;
use support::{engine_with, DemoService};
use tokio::sync::mpsc;

fn simple() -> StateMachine {
    StateMachine::builder("simple").start_at("foo")
                                   .state(State::service_task("foo", "demo", "foo").next("slow"))
                                   .state(State::service_task("slow", "demo", "slow").input("sleepMs", Expr::lit(20)))
                                   .build()
                                   .unwrap()
}

fn no_route() -> StateMachine {
    StateMachine::builder("noRoute").start_at("route")
                                    .state(State::choice("route").when(Expr::var("x").equals(Expr::lit(1)), "foo"))
                                    .state(State::service_task("foo", "demo", "foo"))
                                    .build()
                                    .unwrap()
}

/// Log que falla en las escrituras elegidas.
#[derive(Default)]
struct FailingStore {
    inner: InMemoryStateLogStore,
    fail_start: bool,
}

impl StateLogStore for FailingStore {
    fn record_machine_started(&self, instance: &StateMachineInstance) -> Result<(), StoreError> {
        if self.fail_start {
            return Err(StoreError::Unavailable("log offline".into()));
        }
        self.inner.record_machine_started(instance)
    }
    fn record_machine_updated(&self, instance: &StateMachineInstance) -> Result<(), StoreError> { self.inner.record_machine_updated(instance) }
    fn record_state_started(&self, _state: &StateInstance) -> Result<(), StoreError> { Err(StoreError::Unavailable("log offline".into())) }
    fn record_state_updated(&self, state: &StateInstance) -> Result<(), StoreError> { self.inner.record_state_updated(state) }
    fn get_instance(&self, id: &str) -> Result<Option<StateMachineInstance>, StoreError> { self.inner.get_instance(id) }
    fn get_instance_by_business_key(&self, key: &str, tenant: &str) -> Result<Option<StateMachineInstance>, StoreError> {
        self.inner.get_instance_by_business_key(key, tenant)
    }
    fn query_instances_by_parent_id(&self, parent_id: &str) -> Result<Vec<StateMachineInstance>, StoreError> {
        self.inner.query_instances_by_parent_id(parent_id)
    }
    fn list_recovery_candidates(&self, limit: usize) -> Result<Vec<StateMachineInstance>, StoreError> {
        self.inner.list_recovery_candidates(limit)
    }
}

fn counting_callback(count: Arc<AtomicUsize>, tx: mpsc::UnboundedSender<AsyncResult>) -> saga_core::engine::AsyncCallback {
    Box::new(move |result| {
        count.fetch_add(1, Ordering::SeqCst);
        let _ = tx.send(result);
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_async_returns_running_instance_and_handle() {
    let svc = DemoService::default();
    let engine = engine_with(&svc);
    engine.register(simple()).unwrap();

    let (instance, handle) = engine.start_async("simple", None, json!({})).unwrap();
    assert_eq!(instance.status, ExecutionStatus::Running);
    assert_eq!(handle.instance_id(), instance.id);

    let outcome = handle.wait().await.unwrap();
    assert_eq!(outcome.instance.status, ExecutionStatus::Succeeded);
    assert!(outcome.error.is_none());
    let stored = engine.get_instance(&instance.id).unwrap().unwrap();
    assert_eq!(stored.status, ExecutionStatus::Succeeded);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn callback_fires_exactly_once() {
    let svc = DemoService::default();
    let engine = engine_with(&svc);
    engine.register(simple()).unwrap();
    let count = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let instance = engine.start_async_with_callback("simple", None, None, json!({}), counting_callback(count.clone(), tx))
                         .unwrap();
    let result = rx.recv().await.unwrap().unwrap();
    assert_eq!(result.instance.id, instance.id);
    assert_eq!(result.instance.status, ExecutionStatus::Succeeded);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn callback_receives_no_choice_error_with_instance() {
    let svc = DemoService::default();
    let engine = engine_with(&svc);
    engine.register(no_route()).unwrap();
    let count = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = mpsc::unbounded_channel();

    engine.start_async_with_callback("noRoute", None, None, json!({"x": 9}), counting_callback(count.clone(), tx))
          .unwrap();
    let outcome = rx.recv().await.unwrap().unwrap();
    assert!(matches!(outcome.error, Some(EngineError::NoChoiceMatched { .. })));
    assert!(outcome.instance.ended_at.is_some());
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(svc.count("foo"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn callback_receives_store_failure() {
    let svc = DemoService::default();
    let engine = StateMachineEngine::builder().store(FailingStore::default())
                                              .service("demo", svc.clone())
                                              .build();
    engine.register(simple()).unwrap();
    let count = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = mpsc::unbounded_channel();

    engine.start_async_with_callback("simple", None, None, json!({}), counting_callback(count.clone(), tx))
          .unwrap();
    let err = rx.recv().await.unwrap().unwrap_err();
    assert!(matches!(err, EngineError::Store(StoreError::Unavailable(_))));
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_preparation_still_notifies_once() {
    let svc = DemoService::default();
    let engine = StateMachineEngine::builder().store(FailingStore { fail_start: true,
                                                                    ..Default::default() })
                                              .service("demo", svc.clone())
                                              .build();
    engine.register(simple()).unwrap();
    let count = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let err = engine.start_async_with_callback("simple", None, None, json!({}), counting_callback(count.clone(), tx))
                    .unwrap_err();
    assert!(matches!(err, EngineError::Store(_)));
    assert!(rx.recv().await.unwrap().is_err());
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_starts_do_not_interfere() {
    let svc = DemoService::default();
    let engine = engine_with(&svc);
    engine.register(simple()).unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let (_, handle) = engine.start_async("simple", None, json!({"a": i})).unwrap();
        handles.push(handle);
    }
    for handle in handles {
        let outcome = handle.wait().await.unwrap();
        assert_eq!(outcome.instance.status, ExecutionStatus::Succeeded);
        assert_eq!(outcome.instance.states.len(), 2);
    }
    assert_eq!(svc.count("slow"), 8);
}

#[test]
fn async_requires_a_runtime() {
    let svc = DemoService::default();
    let engine = engine_with(&svc);
    engine.register(simple()).unwrap();
    let err = engine.start_async("simple", None, json!({})).unwrap_err();
    assert!(matches!(err, EngineError::AsyncUnavailable(_)));
}

#[test]
fn async_can_be_disabled_and_explicit_runtime_used() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let svc = DemoService::default();
    let disabled = StateMachineEngine::in_memory().config(EngineConfig::default().with_async(false))
                                                  .runtime(runtime.handle().clone())
                                                  .service("demo", svc.clone())
                                                  .build();
    disabled.register(simple()).unwrap();
    assert!(matches!(disabled.start_async("simple", None, json!({})), Err(EngineError::AsyncUnavailable(_))));

    let enabled = StateMachineEngine::in_memory().runtime(runtime.handle().clone())
                                                 .service("demo", svc.clone())
                                                 .build();
    enabled.register(simple()).unwrap();
    let (_, handle) = enabled.start_async("simple", None, json!({})).unwrap();
    let outcome = handle.blocking_wait().unwrap();
    assert_eq!(outcome.instance.status, ExecutionStatus::Succeeded);
}
