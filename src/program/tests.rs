use super::*;
use crate::case::CaseClass;
use crate::executor::GroupKind;
use crate::extension::Extension;
use crate::models::{ensure, Signal};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tempfile::tempdir;

type Trace = Arc<Mutex<Vec<String>>>;

fn quiet() -> RunConfig {
    RunConfig {
        color: false,
        ..Default::default()
    }
}

fn traced_suite(name: &str, trace: &Trace, fail: bool) -> Suite {
    let seen = trace.clone();
    let label = name.to_string();
    Suite::new(name).case(
        CaseClass::new("Check")
            .test("test_pass", move |_| {
                seen.lock().unwrap().push(label.clone());
                Ok(())
            })
            .test("test_maybe", move |_| ensure(!fail, "asked to fail")),
    )
}

fn program(config: RunConfig, trace: &Trace) -> Program {
    Program::new(Registry::shared(), config)
        .unwrap()
        .suite(traced_suite("alpha", trace, false))
        .suite(traced_suite("beta", trace, true))
}

#[test]
fn test_runs_every_suite_in_order() {
    let trace = Trace::default();
    let mut program = program(quiet(), &trace);
    let result = program.execute().unwrap();

    assert_eq!(result.tests_run(), 4);
    assert_eq!(result.successes().len(), 3);
    assert_eq!(result.failures().len(), 1);
    assert_eq!(*trace.lock().unwrap(), vec!["alpha", "beta"]);
    assert_eq!(Program::exit_code(&result), EXIT_FAILED);
    assert!(program.is_run());
    assert_eq!(result.children().len(), 2);
}

#[test]
fn test_selectors_pick_suites() {
    let trace = Trace::default();
    let config = RunConfig {
        tests: vec!["alpha:Check.test_pass".to_string()],
        ..quiet()
    };
    let mut program = program(config, &trace);
    let result = program.execute().unwrap();

    assert_eq!(program.suites().len(), 1);
    assert_eq!(result.tests_run(), 1);
    assert_eq!(Program::exit_code(&result), 0);
}

#[test]
fn test_unknown_selector_is_misuse() {
    let trace = Trace::default();
    let config = RunConfig {
        tests: vec!["gamma".to_string()],
        ..quiet()
    };
    let mut program = program(config, &trace);
    assert!(matches!(program.prepare(), Err(EngineError::Misuse(_))));
}

#[test]
fn test_seeded_shuffle_is_reproducible() {
    let order = |seed| {
        let trace = Trace::default();
        let mut program = Program::new(Registry::shared(), RunConfig {
            random: true,
            random_seed: Some(seed),
            ..quiet()
        })
        .unwrap();
        for name in ["a", "b", "c", "d", "e", "f"] {
            program.add_suite(traced_suite(name, &trace, false));
        }
        program.prepare().unwrap();
        assert_eq!(program.seed(), Some(seed));
        program.suites().iter().map(|s| s.name().to_string()).collect::<Vec<_>>()
    };
    let first = order(7);
    assert_eq!(first, order(7));
    let mut sorted = first.clone();
    sorted.sort();
    assert_eq!(sorted, vec!["a", "b", "c", "d", "e", "f"]);
}

#[test]
fn test_scripts_wrap_suites() {
    let trace = Trace::default();
    let (before, after) = (trace.clone(), trace.clone());
    let mut program = program(quiet(), &trace)
        .before(Script::new("warmup", move || {
            before.lock().unwrap().push("before".to_string());
            Ok(())
        }))
        .after(Script::new("cleanup", move || {
            after.lock().unwrap().push("after".to_string());
            Ok(())
        }));
    program.execute().unwrap();
    assert_eq!(*trace.lock().unwrap(), vec!["before", "alpha", "beta", "after"]);
}

#[test]
fn test_no_scripts_disables_scripts() {
    let trace = Trace::default();
    let seen = trace.clone();
    let mut program = program(RunConfig { no_scripts: true, ..quiet() }, &trace).before(Script::new(
        "warmup",
        move || {
            seen.lock().unwrap().push("before".to_string());
            Ok(())
        },
    ));
    program.execute().unwrap();
    assert_eq!(*trace.lock().unwrap(), vec!["alpha", "beta"]);
}

#[test]
fn test_fatal_before_script_still_runs_after_scripts() {
    let trace = Trace::default();
    let seen = trace.clone();
    let mut program = program(quiet(), &trace)
        .before(Script::new("abort", || Err(Signal::fatal("no environment"))))
        .after(Script::new("cleanup", move || {
            seen.lock().unwrap().push("after".to_string());
            Ok(())
        }));
    let err = program.execute().unwrap_err();
    assert!(err.to_string().contains("no environment"));
    assert_eq!(*trace.lock().unwrap(), vec!["after"]);
    assert_eq!(program.stopped_on().as_deref(), Some("run"));
}

#[test]
fn test_fatal_case_aborts_remaining_suites() {
    let trace = Trace::default();
    let mut program = Program::new(Registry::shared(), quiet())
        .unwrap()
        .suite(Suite::new("first").case(CaseClass::from_fn("Boom", |_| Err(Signal::fatal("disk gone")))))
        .suite(traced_suite("second", &trace, false));
    assert!(program.execute().is_err());
    assert!(trace.lock().unwrap().is_empty());
}

#[test]
fn test_xunit_report_written() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("reports/xunit.xml");
    let trace = Trace::default();
    let mut program = program(
        RunConfig {
            xunit_report: Some(path.clone()),
            ..quiet()
        },
        &trace,
    );
    program.execute().unwrap();
    let xml = std::fs::read_to_string(&path).unwrap();
    assert!(xml.contains("<testsuites"));
    assert!(xml.contains("test_maybe"));
}

#[test]
fn test_script_error_reaches_xunit_report() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("xunit.xml");
    let trace = Trace::default();
    let mut program = program(
        RunConfig {
            xunit_report: Some(path.clone()),
            ..quiet()
        },
        &trace,
    )
    .before(Script::new("seed-db", || Err(Signal::error("db down"))));
    let result = program.execute().unwrap();
    assert_eq!(result.errors().len(), 1);

    let xml = std::fs::read_to_string(&path).unwrap();
    assert_eq!(xml.matches("<testcase ").count(), 5);
    assert!(xml.contains(r#"<testcase name="seed-db" classname="script""#));
    assert!(xml.contains("db down"));
}

#[test]
fn test_setup_error_recorded_and_suites_not_run() {
    let trace = Trace::default();
    let teardowns = Arc::new(AtomicUsize::new(0));
    let seen = teardowns.clone();
    let mut program = program(quiet(), &trace)
        .setup(|| Err(Signal::error("no network")))
        .teardown(move || {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
    let result = program.execute().unwrap();

    assert!(trace.lock().unwrap().is_empty());
    assert_eq!(teardowns.load(Ordering::SeqCst), 0);
    assert_eq!(result.tests_run(), 1);
    let errors = result.errors();
    assert_eq!(errors[0].id.as_str(), PROGRAM_ID);
    assert_eq!(errors[0].data.class_name(), PROGRAM_ID);
    assert_eq!(errors[0].data.method_name(), "setup");
    assert_eq!(Program::exit_code(&result), EXIT_FAILED);
}

#[test]
fn test_setup_skip_skips_every_case() {
    let trace = Trace::default();
    let mut program = program(quiet(), &trace).setup(|| Err(Signal::skip("maintenance window")));
    let result = program.execute().unwrap();
    assert!(trace.lock().unwrap().is_empty());
    assert_eq!(result.skipped().len(), 4);
    assert_eq!(result.skipped()[0].data.skip_reason(), Some("maintenance window"));
    assert!(result.was_success());
}

#[test]
fn test_teardown_error_recorded_after_suites() {
    let trace = Trace::default();
    let seen = trace.clone();
    let mut program = program(quiet(), &trace)
        .setup(move || {
            seen.lock().unwrap().push("setup".to_string());
            Ok(())
        })
        .teardown(|| Err(Signal::fail("left files behind")));
    let result = program.execute().unwrap();

    assert_eq!(*trace.lock().unwrap(), vec!["setup", "alpha", "beta"]);
    assert_eq!(result.tests_run(), 5);
    let errors = result.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].data.method_name(), "teardown");
    assert_eq!(errors[0].data.message(), Some("left files behind"));
}

#[test]
fn test_teardown_fatal_aborts_run() {
    let trace = Trace::default();
    let mut program = program(quiet(), &trace).teardown(|| Err(Signal::fatal("cluster lost")));
    let err = program.execute().unwrap_err();
    assert!(err.to_string().contains("cluster lost"));
    assert_eq!(program.stopped_on().as_deref(), Some("teardown"));
}

#[test]
fn test_list_renders_tree() {
    let trace = Trace::default();
    let mut program = program(quiet(), &trace);
    let listing = program.list().unwrap();
    assert!(listing.contains("alpha\n  Check.test_pass\n  Check.test_maybe\n"));
    assert!(listing.ends_with("4 tests in 2 suites\n"));
    assert!(trace.lock().unwrap().is_empty());
}

#[test]
fn test_find_case_by_id() {
    let trace = Trace::default();
    let mut program = program(quiet(), &trace);
    program.prepare().unwrap();
    let case = program.find(&RunnableId::new("beta:Check.test_pass")).unwrap();
    assert_eq!(case.kind(), EntityKind::Case);
    assert!(program.find(&RunnableId::new("beta")).is_some());
    assert!(program.find(&RunnableId::new("nope")).is_none());
}

#[test]
fn test_threaded_suites_match_sequential() {
    let trace = Trace::default();
    let config = RunConfig {
        group: GroupKind::Threading,
        async_suites: Some(2),
        async_tests: Some(2),
        ..quiet()
    };
    let result = program(config, &trace).execute().unwrap();
    assert_eq!(result.tests_run(), 4);
    assert_eq!(result.failures().len(), 1);
}

struct Counting(Arc<AtomicUsize>);

impl Extension for Counting {
    fn name(&self) -> &str {
        "counting"
    }

    fn install(&self, _program: &Program) -> anyhow::Result<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn create(&self) -> anyhow::Result<crate::extension::Capability> {
        Ok(Box::new(0usize))
    }
}

#[test]
fn test_install_once_and_clear_on_exit() {
    let installs = Arc::new(AtomicUsize::new(0));
    let registry = Registry::shared();
    registry.register(Counting(installs.clone())).unwrap();

    let program = Program::new(registry.clone(), quiet())
        .unwrap()
        .suite(Suite::new("ok").case(CaseClass::from_fn("Fine", |_| Ok(()))));
    assert_eq!(installs.load(Ordering::SeqCst), 1);

    assert_eq!(program.main(), 0);
    assert!(registry.is_cleared());
    assert_eq!(installs.load(Ordering::SeqCst), 1);
}
