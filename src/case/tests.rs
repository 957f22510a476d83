use super::*;
use crate::context::{HookEvent, HookPoint, Layer};
use crate::extension::Capability;
use crate::models::{ensure, ensure_eq};
use std::sync::atomic::{AtomicUsize, Ordering};

fn mounted(class: CaseClass, test: usize) -> Case {
    mounted_with(class, test, CaseOptions::default(), Registry::shared())
}

fn mounted_with(class: CaseClass, test: usize, options: CaseOptions, registry: Arc<Registry>) -> Case {
    let case = Case::new("suite", Arc::new(class), test, None, options).unwrap();
    case.mount("suite", &BTreeSet::new(), registry).unwrap();
    case
}

fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

#[derive(Default)]
struct HookLog {
    seen: Mutex<Vec<&'static str>>,
    fail_on: Option<HookPoint>,
}

impl Layer for HookLog {
    fn on_skip(&self, e: &HookEvent<'_>) -> anyhow::Result<()> {
        self.note(e)
    }
    fn on_fail(&self, e: &HookEvent<'_>) -> anyhow::Result<()> {
        self.note(e)
    }
    fn on_error(&self, e: &HookEvent<'_>) -> anyhow::Result<()> {
        self.note(e)
    }
    fn on_any_error(&self, e: &HookEvent<'_>) -> anyhow::Result<()> {
        self.note(e)
    }
    fn on_success(&self, e: &HookEvent<'_>) -> anyhow::Result<()> {
        self.note(e)
    }
    fn on_run(&self, e: &HookEvent<'_>) -> anyhow::Result<()> {
        self.note(e)
    }
}

impl HookLog {
    fn note(&self, e: &HookEvent<'_>) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push(e.point.name());
        if self.fail_on == Some(e.point) {
            anyhow::bail!("hook refused");
        }
        Ok(())
    }
}

#[test]
fn test_pass_and_fail() {
    let class = CaseClass::new("Math")
        .test("test_one", |_| ensure_eq(1, 1))
        .test("test_two", |_| ensure_eq(1, 2));
    let result = RunResult::new();
    mounted(class.clone(), 0).run(&result).unwrap();
    mounted(class, 1).run(&result).unwrap();

    assert_eq!(result.successes().len(), 1);
    assert_eq!(result.failures().len(), 1);
    assert_eq!(result.tests_run(), 2);
    let failure = &result.failures()[0];
    assert_eq!(failure.id.as_str(), "suite:Math.test_two");
    assert_eq!(failure.data.kind(), Some("AssertionError"));
}

#[test]
fn test_always_success_never_enters_context() {
    let setups = counter();
    let seen = setups.clone();
    let class = CaseClass::new("Flaky")
        .setup(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .test_def(TestDef::new("test_boom", |_| Err(Signal::error("boom"))).always_success());

    let result = RunResult::new();
    mounted(class, 0).run(&result).unwrap();
    assert_eq!(result.successes().len(), 1);
    assert_eq!(setups.load(Ordering::SeqCst), 0);
}

#[test]
fn test_skip_marker_and_no_skip() {
    let class = CaseClass::new("Later").test_def(TestDef::new("test_x", |_| Ok(())).skip("not ready"));
    let log = Arc::new(HookLog::default());
    let class = class.layer(LayerHandle::from_arc(log.clone()));

    let result = RunResult::new();
    mounted(class.clone(), 0).run(&result).unwrap();
    assert_eq!(result.skipped().len(), 1);
    assert_eq!(result.skipped()[0].data.skip_reason(), Some("not ready"));
    assert_eq!(*log.seen.lock().unwrap(), vec!["on_skip"]);

    let options = CaseOptions {
        no_skip: true,
        ..Default::default()
    };
    let result = RunResult::new();
    mounted_with(class, 0, options, Registry::shared()).run(&result).unwrap();
    assert_eq!(result.successes().len(), 1);
}

#[test]
fn test_skip_test_at_runtime() {
    let class = CaseClass::new("Later").test("test_x", |_| Ok(()));
    let case = mounted(class, 0);
    case.skip_test("environment missing");
    let result = RunResult::new();
    case.run(&result).unwrap();
    assert_eq!(result.skipped().len(), 1);
}

#[test]
fn test_repeat_records_each_iteration() {
    let runs = counter();
    let seen = runs.clone();
    let class = CaseClass::new("Again")
        .repeatable(Some(3))
        .test("test_x", move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
    let result = RunResult::new();
    mounted(class, 0).run(&result).unwrap();
    assert_eq!(result.successes().len(), 3);
    assert_eq!(runs.load(Ordering::SeqCst), 3);
}

#[test]
fn test_repeat_uses_program_default_and_stops_on_failure() {
    let class = CaseClass::new("Again")
        .repeatable(None)
        .test("test_x", |ctx| ensure(ctx.iteration() < 1, "second iteration fails"));
    let options = CaseOptions {
        repeat: 5,
        ..Default::default()
    };
    let result = RunResult::new();
    mounted_with(class, 0, options, Registry::shared()).run(&result).unwrap();
    assert_eq!(result.successes().len(), 1);
    assert_eq!(result.failures().len(), 1);
    assert_eq!(result.tests_run(), 2);
}

#[test]
fn test_not_repeatable_ignores_program_repeat() {
    let class = CaseClass::new("Once").test("test_x", |_| Ok(()));
    let options = CaseOptions {
        repeat: 4,
        ..Default::default()
    };
    let result = RunResult::new();
    mounted_with(class, 0, options, Registry::shared()).run(&result).unwrap();
    assert_eq!(result.tests_run(), 1);
}

#[test]
fn test_fatal_propagates_after_teardown() {
    let teardowns = counter();
    let seen = teardowns.clone();
    let class = CaseClass::new("Abort")
        .teardown(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .test("test_x", |_| Err(Signal::fatal("interrupted")));
    let case = mounted(class, 0);
    let result = RunResult::new();
    let err = case.run(&result).unwrap_err();

    assert!(err.is_fatal_signal());
    assert!(result.should_stop());
    assert_eq!(result.tests_run(), 0);
    assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    assert_eq!(case.stopped_on().as_deref(), Some("run"));
}

#[test]
fn test_hook_failure_is_not_reclassified() {
    let log = Arc::new(HookLog {
        fail_on: Some(HookPoint::Success),
        ..Default::default()
    });
    let class = CaseClass::new("Hooked")
        .layer(LayerHandle::from_arc(log))
        .test("test_x", |_| Ok(()));
    let result = RunResult::new();
    let err = mounted(class, 0).run(&result).unwrap_err();
    assert!(matches!(err, EngineError::Framework { point: "on_success", .. }));
    assert_eq!(result.tests_run(), 0);
}

#[test]
fn test_error_hooks_fire_in_order() {
    let log = Arc::new(HookLog::default());
    let class = CaseClass::new("Hooked")
        .layer(LayerHandle::from_arc(log.clone()))
        .test("test_x", |_| Err(Signal::error("broken fixture")));
    let result = RunResult::new();
    mounted(class, 0).run(&result).unwrap();
    assert_eq!(result.errors().len(), 1);
    assert_eq!(*log.seen.lock().unwrap(), vec!["on_run", "on_error", "on_any_error"]);
}

#[test]
fn test_panic_is_failure() {
    let class = CaseClass::new("Panicky").test("test_x", |_| {
        assert_eq!(1 + 1, 3, "math is broken");
        Ok(())
    });
    let result = RunResult::new();
    mounted(class, 0).run(&result).unwrap();
    let failures = result.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].data.kind(), Some("panic"));
    assert!(failures[0].data.message().unwrap().contains("math is broken"));
}

#[test]
fn test_setup_error_skips_body_and_teardown() {
    let calls = counter();
    let body_calls = calls.clone();
    let teardown_calls = calls.clone();
    let class = CaseClass::new("Broken")
        .setup(|_| Err(Signal::error("no fixture")))
        .teardown(move |_| {
            teardown_calls.fetch_add(100, Ordering::SeqCst);
            Ok(())
        })
        .test("test_x", move |_| {
            body_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
    let result = RunResult::new();
    mounted(class, 0).run(&result).unwrap();
    assert_eq!(result.errors().len(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_teardown_error_after_success_is_error() {
    let class = CaseClass::new("Leaky")
        .teardown(|_| Err(Signal::error("cleanup failed")))
        .test("test_x", |_| Ok(()));
    let result = RunResult::new();
    mounted(class, 0).run(&result).unwrap();
    assert_eq!(result.errors().len(), 1);
    assert_eq!(result.successes().len(), 0);
}

#[test]
fn test_body_failure_wins_over_teardown_error() {
    let class = CaseClass::new("Leaky")
        .teardown(|_| Err(Signal::error("cleanup failed")))
        .test("test_x", |_| ensure(false, "nope"));
    let result = RunResult::new();
    mounted(class, 0).run(&result).unwrap();
    assert_eq!(result.failures().len(), 1);
    assert_eq!(result.tests_run(), 1);
}

#[test]
fn test_teardown_fatal_wins_over_body_failure() {
    let class = CaseClass::new("Leaky")
        .teardown(|_| Err(Signal::fatal("abort in teardown")))
        .test("test_x", |_| ensure(false, "nope"));
    let case = mounted(class, 0);
    let result = RunResult::new();
    let err = case.run(&result).unwrap_err();

    assert!(err.is_fatal_signal());
    assert!(err.to_string().contains("abort in teardown"));
    assert!(result.should_stop());
    assert_eq!(result.tests_run(), 0);
    assert_eq!(case.stopped_on().as_deref(), Some("run"));
}

#[test]
fn test_serial_flows_replay_body() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let class = CaseClass::new("Browsers")
        .flows(vec![serde_json::json!("firefox"), serde_json::json!("chrome")])
        .test("test_x", move |ctx| {
            sink.lock().unwrap().push(ctx.flow().cloned().unwrap());
            Ok(())
        });
    let result = RunResult::new();
    mounted(class, 0).run(&result).unwrap();
    assert_eq!(result.tests_run(), 1);
    assert_eq!(
        *seen.lock().unwrap(),
        vec![serde_json::json!("firefox"), serde_json::json!("chrome")]
    );
}

#[test]
fn test_split_flow_instance() {
    let class = Arc::new(
        CaseClass::new("Browsers")
            .flows(vec![serde_json::json!(1), serde_json::json!(2)])
            .test("test_x", |ctx| ensure_eq(ctx.flow().cloned(), Some(serde_json::json!(2)))),
    );
    let case = Case::new("suite", class, 0, Some((1, serde_json::json!(2))), CaseOptions::default()).unwrap();
    assert_eq!(case.id().as_str(), "suite:Browsers.test_x#1");
    case.mount("suite", &BTreeSet::new(), Registry::shared()).unwrap();
    let result = RunResult::new();
    case.run(&result).unwrap();
    assert_eq!(result.successes().len(), 1);
    assert_eq!(result.successes()[0].data.class_name(), "Browsers#1");
}

#[test]
fn test_flow_failure_reason_names_flow() {
    let class = CaseClass::new("Browsers")
        .flows(vec![serde_json::json!("ok"), serde_json::json!("bad")])
        .test("test_x", |ctx| ensure(ctx.flow() != Some(&serde_json::json!("bad")), "bad flow"));
    let result = RunResult::new();
    mounted(class, 0).run(&result).unwrap();
    let reason = result.failures()[0].data.reason().unwrap().to_string();
    assert!(reason.contains("flow: \"bad\""));
}

#[test]
fn test_steps_run_in_weight_order_with_history() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let (a, b, c, d) = (order.clone(), order.clone(), order.clone(), order.clone());
    let plan = StepPlan::new()
        .begin(move |_| {
            a.lock().unwrap().push("begin");
            Ok(())
        })
        .step(2, "submit form", move |_| {
            b.lock().unwrap().push("two");
            ensure(false, "form rejected")
        })
        .step(1, "open page", move |_| {
            c.lock().unwrap().push("one");
            Ok(())
        })
        .finish(move |_| {
            d.lock().unwrap().push("finish");
            Ok(())
        });
    assert_eq!(plan.steps()[0].weight, 1);

    let class = CaseClass::new("Flow").steps("test_login", plan);
    let result = RunResult::new();
    mounted(class, 0).run(&result).unwrap();

    assert_eq!(*order.lock().unwrap(), vec!["begin", "one", "two"]);
    let reason = result.failures()[0].data.reason().unwrap().to_string();
    assert!(reason.contains("Step 1: open page"));
    assert!(reason.contains("Step 2: submit form"));
}

#[test]
fn test_reason_annotations_reach_report() {
    let class = CaseClass::new("Noted").test("test_x", |ctx| {
        ctx.reason("url", "/login");
        Err(Signal::error("500"))
    });
    let case = mounted(class, 0);
    let result = RunResult::new();
    case.run(&result).unwrap();
    assert!(result.errors()[0].data.reason().unwrap().contains("url: /login"));
    assert_eq!(case.reason(), "url: /login");
}

#[test]
fn test_mount_gate() {
    let class = Arc::new(CaseClass::new("Gate").test("test_x", |_| Ok(())));
    let case = Case::new("suite", class, 0, None, CaseOptions::default()).unwrap();
    assert!(matches!(case.run(&RunResult::new()), Err(EngineError::Misuse(_))));
    case.mount("suite", &BTreeSet::new(), Registry::shared()).unwrap();
    assert!(matches!(
        case.mount("suite", &BTreeSet::new(), Registry::shared()),
        Err(EngineError::Misuse(_))
    ));
}

#[test]
fn test_should_stop_skips_entirely() {
    let setups = counter();
    let seen = setups.clone();
    let class = CaseClass::new("Late")
        .setup(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .test("test_x", |_| Ok(()));
    let case = mounted(class, 0);
    let result = RunResult::new();
    result.stop();
    case.run(&result).unwrap();
    assert!(!case.is_run());
    assert_eq!(result.tests_run(), 0);
    assert_eq!(setups.load(Ordering::SeqCst), 0);
}

struct Db {
    queries: u32,
}

#[test]
fn test_capability_lookup() {
    let registry = Registry::shared();
    registry
        .register_fn("db", || Ok(Box::new(Db { queries: 0 }) as Capability))
        .unwrap();
    let class = CaseClass::new("Store").requires(["db"]).test("test_x", |ctx| {
        ctx.capability::<Db>("db")?.queries += 1;
        ensure_eq(ctx.capability::<Db>("db")?.queries, 1)
    });
    let case = mounted_with(class, 0, CaseOptions::default(), registry);
    assert!(case.mount_data().unwrap().capabilities.contains("db"));
    let result = RunResult::new();
    case.run(&result).unwrap();
    assert_eq!(result.successes().len(), 1);
}

#[test]
fn test_unknown_capability_rejected_at_mount() {
    let class = Arc::new(CaseClass::new("Store").requires(["browser"]).test("test_x", |_| Ok(())));
    let case = Case::new("suite", class, 0, None, CaseOptions::default()).unwrap();
    assert!(matches!(
        case.mount("suite", &BTreeSet::new(), Registry::shared()),
        Err(EngineError::UnknownCapability(_))
    ));
}

#[test]
fn test_from_fn_factory() {
    let class = CaseClass::from_fn("test_standalone", |_| Ok(()));
    assert_eq!(class.name(), "test_standalone");
    assert_eq!(class.test_names().collect::<Vec<_>>(), vec!["test_standalone"]);
}

#[test]
fn test_async_body_runs_on_its_own_runtime() {
    let class = CaseClass::new("Waiting").test_async("test_wait", |ctx| {
        Box::pin(async move {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            ctx.reason("waited", "5ms");
            ensure_eq(ctx.method_name(), "test_wait")
        })
    });
    let result = RunResult::new();
    let case = mounted(class, 0);
    assert!(case.class().tests()[0].is_async());
    case.run(&result).unwrap();
    assert_eq!(result.successes().len(), 1);
    assert!(case.reason().contains("waited: 5ms"));
}

#[test]
fn test_async_body_inside_a_runtime() {
    let class = CaseClass::new("Nested").test_async("test_wait", |_| {
        Box::pin(async {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            ensure(false, "still failing after the wait")
        })
    });
    let case = mounted(class, 0);
    let result = RunResult::new();
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
    runtime.block_on(async { case.run(&result) }).unwrap();
    assert_eq!(result.failures().len(), 1);
}

#[test]
fn test_async_panic_is_failure() {
    let class = CaseClass::new("Panicky").test_async("test_x", |_| {
        Box::pin(async {
            tokio::task::yield_now().await;
            let rows: Vec<u32> = Vec::new();
            assert!(!rows.is_empty(), "lost the connection");
            Ok(())
        })
    });
    let result = RunResult::new();
    mounted(class, 0).run(&result).unwrap();
    let failures = result.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].data.kind(), Some("panic"));
    assert!(failures[0].data.message().unwrap().contains("lost the connection"));
}
