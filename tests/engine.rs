//! End-to-end runs through the public API

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use testrig::case::TestDef;
use testrig::results::render_xunit;
use testrig::{
    ensure, ensure_eq, CaseClass, Failure, GroupKind, Program, Registry, RunConfig, RunResult, Runnable,
    RunnableId, Signal, Suite, XUnitData,
};

fn quiet() -> RunConfig {
    RunConfig {
        color: false,
        ..Default::default()
    }
}

fn execute(config: RunConfig, suites: Vec<Suite>) -> RunResult {
    let mut program = Program::new(Registry::shared(), config).unwrap();
    for suite in suites {
        program.add_suite(suite);
    }
    program.execute().unwrap()
}

fn two_cases() -> Suite {
    Suite::new("scenario")
        .case(CaseClass::from_fn("A", |_| ensure_eq(1, 1)))
        .case(CaseClass::from_fn("B", |_| ensure_eq(1, 2)))
}

#[test]
fn test_pass_and_fail_are_counted() {
    let result = execute(quiet(), vec![two_cases()]);
    assert_eq!(result.successes().len(), 1);
    assert_eq!(result.failures().len(), 1);
    assert_eq!(result.errors().len(), 0);
    assert_eq!(result.skipped().len(), 0);
    assert_eq!(result.tests_run(), 2);
    assert_eq!(Program::exit_code(&result), 1);
}

#[test]
fn test_stop_skips_later_cases() {
    let ran = Arc::new(AtomicUsize::new(0));
    let seen = ran.clone();
    let suite = Suite::new("stop")
        .case(CaseClass::from_fn("A", |_| ensure(false, "first fails")))
        .case(CaseClass::from_fn("B", move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
    let config = RunConfig {
        stop_on_failure: true,
        ..quiet()
    };
    let result = execute(config, vec![suite]);
    assert_eq!(result.tests_run(), 1);
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[test]
fn test_always_success_never_enters_body() {
    let suite = Suite::new("always").case(
        CaseClass::new("Flaky")
            .setup(|_| Err(Signal::error("setup must not run")))
            .test_def(TestDef::new("test_raises", |_| panic!("body must not run")).always_success()),
    );
    let result = execute(quiet(), vec![suite]);
    assert_eq!(result.successes().len(), 1);
    assert!(result.was_success());
}

#[test]
fn test_sequential_records_one_entry_per_case() {
    let mut suite = Suite::new("many");
    for i in 0..9 {
        suite = suite.case(CaseClass::from_fn(format!("C{i}"), move |_| match i % 3 {
            0 => Ok(()),
            1 => Err(Signal::skip("later")),
            _ => Err(Signal::error("boom")),
        }));
    }
    let result = execute(quiet(), vec![suite]);
    assert_eq!(result.tests_run(), 9);
    assert_eq!(result.successes().len(), 3);
    assert_eq!(result.skipped().len(), 3);
    assert_eq!(result.errors().len(), 3);

    let mut ids: Vec<_> = result.buckets().iter().map(|e| e.id.to_string()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 9);
}

#[test]
fn test_repeat_records_k_entries() {
    let suite = Suite::new("repeat").case(CaseClass::from_fn("Again", |_| Ok(())).repeatable(None));
    let config = RunConfig { repeat: 4, ..quiet() };
    let result = execute(config, vec![suite]);
    assert_eq!(result.successes().len(), 4);
    let ids: Vec<_> = result.successes().iter().map(|e| e.id.clone()).collect();
    assert!(ids.iter().all(|id| *id == RunnableId::new("repeat:Again.Again")));
}

#[test]
fn test_groups_agree_on_counts() {
    let suites = || {
        (0..3)
            .map(|s| {
                Suite::new(format!("s{s}")).case(
                    CaseClass::new("Mixed")
                        .test("test_ok", |_| Ok(()))
                        .test("test_fail", |_| ensure(false, "nope"))
                        .test("test_skip", |ctx| ctx.skip("not today")),
                )
            })
            .collect::<Vec<_>>()
    };
    for group in [GroupKind::Sequential, GroupKind::Threading, GroupKind::Cooperative] {
        let config = RunConfig {
            group,
            async_suites: Some(2),
            async_tests: Some(3),
            ..quiet()
        };
        let result = execute(config, suites());
        assert_eq!(result.tests_run(), 9, "{group}");
        assert_eq!(result.successes().len(), 3, "{group}");
        assert_eq!(result.failures().len(), 3, "{group}");
        assert_eq!(result.skipped().len(), 3, "{group}");
    }
}

#[test]
fn test_cooperative_cases_overlap_at_await_points() {
    let mut suite = Suite::new("slow");
    for i in 0..4 {
        suite = suite.case(CaseClass::new(format!("Wait{i}")).test_async("test_wait", |_| {
            Box::pin(async {
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                Ok(())
            })
        }));
    }
    let config = RunConfig {
        group: GroupKind::Cooperative,
        async_tests: Some(4),
        ..quiet()
    };
    let started = std::time::Instant::now();
    let result = execute(config, vec![suite]);
    let elapsed = started.elapsed();
    assert_eq!(result.successes().len(), 4);
    assert!(elapsed < std::time::Duration::from_millis(350), "took {elapsed:?}");
}

#[test]
fn test_xunit_escapes_unsafe_reasons() {
    let result = RunResult::new();
    result.add_success(&RunnableId::new("x:Page.test_ok"), XUnitData::success("Page", "test_ok", 0.1));
    result.add_failure(
        &RunnableId::new("x:Page.test_inject"),
        XUnitData::failure(
            "Page",
            "test_inject",
            0.2,
            Failure::new("assertion", "bad markup").with_reason("<script>alert(1)</script>"),
        ),
    );
    let xml = render_xunit(&result);
    assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
    assert!(xml.contains("&lt;script&gt;"));
    assert!(!xml.contains("<script>"));
}

#[test]
fn test_fatal_aborts_run() {
    let after = Arc::new(AtomicUsize::new(0));
    let seen = after.clone();
    let mut program = Program::new(Registry::shared(), quiet())
        .unwrap()
        .suite(Suite::new("first").case(CaseClass::from_fn("Abort", |_| Err(Signal::fatal("interrupted")))))
        .suite(Suite::new("second").case(CaseClass::from_fn("Never", move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })));
    let err = program.execute().unwrap_err();
    assert!(err.to_string().contains("interrupted"));
    assert_eq!(after.load(Ordering::SeqCst), 0);
}

#[test]
fn test_teardown_fatal_stops_run() {
    let ran = Arc::new(AtomicUsize::new(0));
    let seen = ran.clone();
    let suite = Suite::new("scenario")
        .case(
            CaseClass::from_fn("A", |_| ensure(false, "body fails"))
                .teardown(|_| Err(Signal::fatal("abort in teardown"))),
        )
        .case(CaseClass::from_fn("B", move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
    let mut program = Program::new(Registry::shared(), quiet()).unwrap().suite(suite);
    let err = program.execute().unwrap_err();
    assert!(err.to_string().contains("abort in teardown"));
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[test]
fn test_cleared_registry_is_fatal() {
    let registry = Registry::shared();
    registry.register_fn("db", || Ok(Box::new(1u32) as testrig::extension::Capability)).unwrap();
    let suite = Suite::new("late").case(
        CaseClass::from_fn("Lookup", |ctx| {
            ctx.capability::<u32>("db")?;
            Ok(())
        })
        .requires(["db"]),
    );
    let mut program = Program::new(registry.clone(), quiet()).unwrap().suite(suite);
    program.prepare().unwrap();
    registry.clear();
    assert!(program.execute().is_err());
}

#[cfg(unix)]
mod processes {
    use super::*;
    use std::path::Path;
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::Duration;
    use testrig::executor::worker::{Batch, WorkerMode, STOP_FILE_ENV, WORKER_ENV};
    use testrig::executor::{ExecutionGroup, ProcessPool};
    use testrig::results::Entry;
    use testrig::runnable::{EntityKind, RunnableRef};
    use testrig::EngineResult;
    use tokio::process::Command;

    struct Dummy(RunnableId);

    impl Runnable for Dummy {
        fn id(&self) -> &RunnableId {
            &self.0
        }
        fn kind(&self) -> EntityKind {
            EntityKind::Case
        }
        fn run(&self, _result: &RunResult) -> EngineResult<()> {
            unreachable!("dummies only run in shell workers")
        }
        fn is_run(&self) -> bool {
            false
        }
        fn stopped_on(&self) -> Option<String> {
            None
        }
        fn reason(&self) -> String {
            String::new()
        }
    }

    fn sleeper(id: &RunnableId, _stop: &Path) -> std::io::Result<Command> {
        let mut batch = Batch::new(id.clone());
        batch.buckets.push(Entry {
            id: id.clone(),
            data: XUnitData::success("Dummy", id.as_str(), 0.2),
        });
        let line = batch.to_line().map_err(std::io::Error::other)?;
        let mut command = Command::new("sh");
        command.arg("-c").arg(format!("sleep 0.2; echo '{line}'"));
        Ok(command)
    }

    #[test]
    fn test_process_pool_bounds_alive_workers() {
        const MAX: usize = 2;
        let pool = ProcessPool::new(MAX, Duration::from_secs(10), Arc::new(sleeper));
        let collection: Vec<RunnableRef> = (0..6)
            .map(|i| Arc::new(Dummy(RunnableId::new(format!("p:D.test_{i}")))) as RunnableRef)
            .collect();
        let result = RunResult::new();

        let gauge = pool.alive_gauge();
        let done = AtomicBool::new(false);
        let sampled = thread::scope(|scope| {
            let sampler = scope.spawn(|| {
                let mut peak = 0;
                while !done.load(Ordering::SeqCst) {
                    peak = peak.max(gauge.load(Ordering::SeqCst));
                    thread::sleep(Duration::from_millis(5));
                }
                peak
            });
            pool.run(&collection, &result).unwrap();
            done.store(true, Ordering::SeqCst);
            sampler.join().unwrap()
        });

        assert!(sampled <= MAX, "sampled {sampled} alive workers");
        assert!(pool.peak_alive() <= MAX);
        assert_eq!(pool.peak_alive(), MAX);
        assert_eq!(result.successes().len(), 6);
    }

    fn relaunch(id: &RunnableId, stop: &Path) -> std::io::Result<Command> {
        let mut command = Command::new(std::env::current_exe()?);
        command
            .args(["--exact", "processes::test_worker_roundtrip", "--nocapture", "--test-threads=1"])
            .env(WORKER_ENV, id.as_str())
            .env(STOP_FILE_ENV, stop);
        Ok(command)
    }

    /// Runs as the parent normally and as a worker when re-executed by the pool
    #[test]
    fn test_worker_roundtrip() {
        let config = RunConfig {
            group: GroupKind::Multiprocessing,
            async_tests: Some(2),
            ..quiet()
        };
        let program = Program::new(Registry::shared(), config)
            .unwrap()
            .suite(two_cases())
            .launcher(Arc::new(relaunch));
        if WorkerMode::from_env().is_some() {
            std::process::exit(program.main());
        }

        let mut program = program;
        let result = program.execute().unwrap();
        assert_eq!(result.successes().len(), 1);
        assert_eq!(result.failures().len(), 1);
        assert_eq!(result.failures()[0].id, RunnableId::new("scenario:B.B"));
    }
}
