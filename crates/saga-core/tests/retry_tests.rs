mod support;

use std::time::Duration;

use saga_core::{Expr, ExecutionStatus, GlobalStatus, PersistMode, RetryRule, State, StateMachine};
use serde_json::json;
use support::{engine_with, DemoService};

fn flaky(mode: PersistMode, retries: u32) -> StateMachine {
    StateMachine::builder("flaky").start_at("foo")
                                  .retry_persist_mode(mode)
                                  .state(State::service_task("foo", "demo", "foo").next("bar").compensate_with("undo"))
                                  .state(State::service_task("bar", "demo", "bar").retry(RetryRule::new(retries).on_errors(["BarFailed"])
                                                                                                               .interval(Duration::from_millis(1), 2.0)))
                                  .state(State::service_task("undo", "demo", "compensateFoo"))
                                  .build()
                                  .unwrap()
}

#[test]
fn update_mode_keeps_a_single_record() {
    let svc = DemoService::default();
    let engine = engine_with(&svc);
    engine.register(flaky(PersistMode::Update, 3)).unwrap();

    let inst = engine.start("flaky", None, json!({"barFailTimes": 2})).unwrap();
    assert_eq!(inst.status, ExecutionStatus::Succeeded);
    assert_eq!(svc.count("bar"), 3);
    let bars: Vec<_> = inst.states_named("bar").collect();
    assert_eq!(bars.len(), 1);
    assert_eq!(bars[0].status, ExecutionStatus::Succeeded);
    assert_eq!(bars[0].error, None);
}

#[test]
fn new_mode_records_every_attempt() {
    let svc = DemoService::default();
    let engine = engine_with(&svc);
    engine.register(flaky(PersistMode::New, 3)).unwrap();

    let inst = engine.start("flaky", None, json!({"barFailTimes": 2})).unwrap();
    assert_eq!(inst.status, ExecutionStatus::Succeeded);
    let bars: Vec<_> = inst.states_named("bar").collect();
    assert_eq!(bars.len(), 3);
    assert_eq!(bars.iter().map(|b| b.status).collect::<Vec<_>>(),
               vec![ExecutionStatus::Failed, ExecutionStatus::Failed, ExecutionStatus::Succeeded]);
    assert_eq!(bars[1].retried_state_id.as_deref(), Some(bars[0].id.as_str()));
    assert_eq!(bars[2].retried_state_id.as_deref(), Some(bars[1].id.as_str()));
}

#[test]
fn state_level_mode_overrides_machine_level() {
    let svc = DemoService::default();
    let engine = engine_with(&svc);
    let machine = StateMachine::builder("override").start_at("bar")
                                                   .retry_persist_mode(PersistMode::New)
                                                   .state(State::service_task("bar", "demo", "bar").retry(RetryRule::new(2))
                                                                                                   .retry_persist_mode(PersistMode::Update))
                                                   .build()
                                                   .unwrap();
    engine.register(machine).unwrap();
    let inst = engine.start("override", None, json!({"barFailTimes": 2})).unwrap();
    assert_eq!(inst.status, ExecutionStatus::Succeeded);
    assert_eq!(inst.states_named("bar").count(), 1);
}

#[test]
fn exhausted_retries_fail_and_compensate() {
    let svc = DemoService::default();
    let engine = engine_with(&svc);
    engine.register(flaky(PersistMode::New, 2)).unwrap();

    let inst = engine.start("flaky", None, json!({"barFailTimes": 10})).unwrap();
    assert_eq!(svc.count("bar"), 3);
    assert_eq!(inst.states_named("bar").count(), 3);
    assert_eq!(inst.status, ExecutionStatus::Failed);
    assert_eq!(inst.compensation_status, Some(ExecutionStatus::Succeeded));
    assert_eq!(svc.count("compensateFoo"), 1);
}

#[test]
fn non_matching_error_kind_is_not_retried() {
    let svc = DemoService::default();
    let engine = engine_with(&svc);
    let machine = StateMachine::builder("picky").start_at("bar")
                                                .state(State::service_task("bar", "demo", "bar").retry(RetryRule::new(5).on_errors(["Other"])))
                                                .build()
                                                .unwrap();
    engine.register(machine).unwrap();
    let inst = engine.start("picky", None, json!({"barFail": true})).unwrap();
    assert_eq!(svc.count("bar"), 1);
    assert_eq!(inst.status, ExecutionStatus::Failed);
}

#[test]
fn status_rule_turns_output_into_failure() {
    let svc = DemoService::default();
    let engine = engine_with(&svc);
    let machine = StateMachine::builder("ruled").start_at("foo")
                                                .state(State::service_task("foo", "demo", "foo").status_rule(Expr::output("value").gt(Expr::lit(100)),
                                                                                                             ExecutionStatus::Failed))
                                                .build()
                                                .unwrap();
    engine.register(machine).unwrap();

    let ok = engine.start("ruled", None, json!({"a": 5})).unwrap();
    assert_eq!(ok.status, ExecutionStatus::Succeeded);

    let rejected = engine.start("ruled", None, json!({"a": 500})).unwrap();
    assert_eq!(rejected.status, ExecutionStatus::Failed);
    let foo = rejected.states_named("foo").next().unwrap();
    assert_eq!(foo.error.as_ref().map(|e| e.code.as_str()), Some("StatusMatchedFailed"));
    assert_eq!(foo.output, Some(json!({"value": 500})));
}

#[test]
fn unknown_outcome_leaves_instance_for_recovery() {
    let svc = DemoService::default();
    let engine = engine_with(&svc);
    let machine = StateMachine::builder("opaque").start_at("foo")
                                                 .state(State::service_task("foo", "demo", "foo").next("remote").compensate_with("undo"))
                                                 .state(State::service_task("remote", "demo", "unknown"))
                                                 .state(State::service_task("undo", "demo", "compensateFoo"))
                                                 .build()
                                                 .unwrap();
    engine.register(machine).unwrap();

    let inst = engine.start("opaque", None, json!({})).unwrap();
    assert_eq!(inst.status, ExecutionStatus::Unknown);
    assert_eq!(inst.compensation_status, None);
    assert!(!inst.is_terminal());
    assert_eq!(svc.count("compensateFoo"), 0);
    assert_eq!(engine.coordinator().reload(&inst.id).unwrap(), GlobalStatus::CommitRetrying);
}
