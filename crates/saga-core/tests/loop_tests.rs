mod support;

use saga_core::{EngineError, Expr, ExecutionStatus, RecoverStrategy, ScopeSegment, State, StateMachine};
use serde_json::json;
use support::{engine_with, DemoService};

fn batch(strategy: RecoverStrategy) -> StateMachine {
    StateMachine::builder("batch").start_at("loop")
                                  .recover_strategy(strategy)
                                  .state(State::loop_over("loop", "items", "process").next("summary")
                                                                                      .output("results", Expr::output("")))
                                  .state(State::service_task("process", "demo", "item").input("element", Expr::var("loopElement"))
                                                                                       .input("failAt", Expr::var("failAt"))
                                                                                       .output("done", Expr::output("done"))
                                                                                       .for_update(true)
                                                                                       .compensate_with("undoItem"))
                                  .state(State::script("summary", Expr::var("results").len()).output("processed", Expr::output("")))
                                  .state(State::service_task("undoItem", "demo", "compensateItem").input("element", Expr::var("loopElement")))
                                  .build()
                                  .unwrap()
}

fn iteration_of(scope: &[ScopeSegment]) -> Option<usize> {
    match scope.last() {
        Some(ScopeSegment::Iteration { index, .. }) => Some(*index),
        _ => None,
    }
}

#[test]
fn every_iteration_is_recorded_in_order() {
    let svc = DemoService::default();
    let engine = engine_with(&svc);
    engine.register(batch(RecoverStrategy::Compensate)).unwrap();

    let inst = engine.start("batch", None, json!({"items": [1, 2, 3], "failAt": -1})).unwrap();
    assert_eq!(inst.status, ExecutionStatus::Succeeded);
    let indexes: Vec<_> = inst.states_named("process").map(|s| iteration_of(&s.scope)).collect();
    assert_eq!(indexes, vec![Some(0), Some(1), Some(2)]);
    let end = inst.end_params.unwrap();
    assert_eq!(end["processed"], json!(3));
    assert_eq!(end["results"], json!([{"done": 1}, {"done": 2}, {"done": 3}]));
}

#[test]
fn failed_iteration_resumes_with_forward() {
    let svc = DemoService::default();
    let engine = engine_with(&svc);
    engine.register(batch(RecoverStrategy::Forward)).unwrap();
    let items: Vec<u32> = (0..10).collect();

    let inst = engine.start("batch", None, json!({"items": items, "failAt": 5})).unwrap();
    assert_eq!(inst.status, ExecutionStatus::Unknown);
    assert_eq!(inst.compensation_status, None);
    assert_eq!(svc.count("item"), 6);

    let done = engine.forward(&inst.id, Some(json!({"failAt": -1}))).unwrap();
    assert_eq!(done.status, ExecutionStatus::Succeeded);
    // Las iteraciones 0..4 no se repiten.
    assert_eq!(svc.count("item"), 11);
    for index in 0..10 {
        let latest = done.states_named("process")
                         .filter(|s| iteration_of(&s.scope) == Some(index))
                         .last()
                         .unwrap();
        assert_eq!(latest.status, ExecutionStatus::Succeeded, "iteration {index}");
    }
    assert_eq!(done.end_params.unwrap()["processed"], json!(10));
}

#[test]
fn failed_loop_compensates_completed_iterations_in_reverse() {
    let svc = DemoService::default();
    let engine = engine_with(&svc);
    engine.register(batch(RecoverStrategy::Compensate)).unwrap();

    let inst = engine.start("batch", None, json!({"items": ["a", "b", "c"], "failAt": "c"})).unwrap();
    assert_eq!(inst.compensation_status, Some(ExecutionStatus::Succeeded));
    let undone: Vec<_> = inst.compensation_states().map(|s| s.input["element"].clone()).collect();
    assert_eq!(undone, vec![json!("b"), json!("a")]);
}

#[test]
fn non_array_collection_is_a_definition_error() {
    let svc = DemoService::default();
    let engine = engine_with(&svc);
    engine.register(batch(RecoverStrategy::Compensate)).unwrap();
    let err = engine.start("batch", None, json!({"items": "nope"})).unwrap_err();
    assert!(matches!(err.root_cause(), EngineError::Expression(_)));
}
