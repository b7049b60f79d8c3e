mod support;

use saga_core::{EngineError, Expr, ExecutionStatus, ScopeSegment, State, StateMachine};
use serde_json::json;
use support::{engine_with, DemoService};

fn fan_out(fail_fast: bool) -> StateMachine {
    StateMachine::builder("fanOut").start_at("split")
                                   .state(State::parallel("split", ["left", "right"]).next("join").fail_fast(fail_fast))
                                   .state(State::service_task("left", "demo", "foo").output("leftValue", Expr::output("value"))
                                                                                    .compensate_with("undoLeft"))
                                   .state(State::service_task("right", "demo", "bar").output("rightOk", Expr::output("ok")))
                                   .state(State::script("join", Expr::object([("left", Expr::var("leftValue")), ("right", Expr::var("rightOk"))]))
                                          .output("joined", Expr::output("")))
                                   .state(State::service_task("undoLeft", "demo", "compensateLeft"))
                                   .build()
                                   .unwrap()
}

#[test]
fn branch_outputs_are_merged_after_the_barrier() {
    let svc = DemoService::default();
    let engine = engine_with(&svc);
    engine.register(fan_out(false)).unwrap();

    let inst = engine.start("fanOut", None, json!({"a": 7})).unwrap();
    assert_eq!(inst.status, ExecutionStatus::Succeeded);
    let end = inst.end_params.clone().unwrap();
    assert_eq!(end["joined"], json!({"left": 7, "right": true}));

    let left = inst.states_named("left").next().unwrap();
    assert_eq!(left.scope,
               vec![ScopeSegment::Branch { state: "split".into(),
                                           index: 0 }]);
    let container = inst.states_named("split").next().unwrap();
    assert_eq!(container.status, ExecutionStatus::Succeeded);
}

#[test]
fn failing_branch_compensates_its_sibling() {
    let svc = DemoService::default();
    let engine = engine_with(&svc);
    engine.register(fan_out(false)).unwrap();

    let inst = engine.start("fanOut", None, json!({"barFail": true})).unwrap();
    assert_eq!(inst.compensation_status, Some(ExecutionStatus::Succeeded));
    assert_eq!(inst.error.as_ref().map(|e| e.code.as_str()), Some("BranchFailed"));
    assert_eq!(svc.count("compensateLeft"), 1);
    assert!(inst.states_named("join").next().is_none());
}

#[test]
fn branch_failure_reports_its_index() {
    let svc = DemoService::default();
    let engine = engine_with(&svc);
    engine.register(fan_out(true)).unwrap();
    let inst = engine.start("fanOut", None, json!({"barFail": true})).unwrap();
    let message = inst.error.map(|e| e.message).unwrap_or_default();
    assert!(message.contains("branch 1"), "{message}");
}

/// Rama lenta de un paso contra rama rápida de dos pasos, y un fallo después del join.
fn uneven_branches() -> StateMachine {
    StateMachine::builder("uneven").start_at("split")
                                   .state(State::parallel("split", ["slowStep", "b1"]).next("boom"))
                                   .state(State::service_task("slowStep", "demo", "slow").compensate_with("undoSlow"))
                                   .state(State::service_task("b1", "demo", "foo").next("b2").compensate_with("undoB1"))
                                   .state(State::service_task("b2", "demo", "foo").compensate_with("undoB2"))
                                   .state(State::service_task("boom", "demo", "bar"))
                                   .state(State::service_task("undoSlow", "demo", "compensateSlow"))
                                   .state(State::service_task("undoB1", "demo", "compensateB1"))
                                   .state(State::service_task("undoB2", "demo", "compensateB2"))
                                   .build()
                                   .unwrap()
}

#[test]
fn compensation_follows_reverse_completion_order_across_branches() {
    let svc = DemoService::default();
    let engine = engine_with(&svc);
    engine.register(uneven_branches()).unwrap();

    let inst = engine.start("uneven", None, json!({"sleepMs": 300, "barFail": true})).unwrap();
    assert_eq!(inst.compensation_status, Some(ExecutionStatus::Succeeded));

    let ended = |name: &str| inst.states_named(name).next().and_then(|s| s.end_seq).unwrap();
    assert!(ended("slowStep") > ended("b2"));
    assert!(ended("b2") > ended("b1"));

    let undone: Vec<String> = svc.calls().into_iter().filter(|c| c.starts_with("compensate")).collect();
    assert_eq!(undone, vec!["compensateSlow", "compensateB2", "compensateB1"]);
}

#[test]
fn branches_run_concurrently_on_the_engine_pool() {
    let svc = DemoService::default();
    let engine = engine_with(&svc);
    engine.register(StateMachine::builder("twoSlow").start_at("split")
                                                    .state(State::parallel("split", ["slowA", "slowB"]))
                                                    .state(State::service_task("slowA", "demo", "slow"))
                                                    .state(State::service_task("slowB", "demo", "slow"))
                                                    .build()
                                                    .unwrap())
          .unwrap();

    let inst = engine.start("twoSlow", None, json!({"sleepMs": 200})).unwrap();
    assert_eq!(inst.status, ExecutionStatus::Succeeded);
    let a = inst.states_named("slowA").next().unwrap();
    let b = inst.states_named("slowB").next().unwrap();
    assert!(a.started_at < b.ended_at.unwrap(), "slowA started after slowB finished");
    assert!(b.started_at < a.ended_at.unwrap(), "slowB started after slowA finished");
}

#[test]
fn parallel_without_branches_is_rejected() {
    let err = StateMachine::builder("empty").start_at("split")
                                            .state(State::parallel("split", Vec::<String>::new()))
                                            .build()
                                            .unwrap_err();
    assert!(matches!(err, EngineError::InvalidDefinition(_)));
}
