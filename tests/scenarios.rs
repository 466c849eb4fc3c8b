//! End-to-end recording and reporting against a throwaway store.

use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use autoperf::model::{self, NewStep};
use autoperf::report::ReportGenerator;
use autoperf::{
    timed_step, MetricsStore, RunMetadata, RunStatus, SessionSlot, StepKind, StepStatus,
};

fn store() -> (tempfile::TempDir, MetricsStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = MetricsStore::open(dir.path().join("data").join("performance.db")).unwrap();
    (dir, store)
}

fn last_day() -> chrono::DateTime<chrono::Utc> {
    model::now() - chrono::Duration::days(1)
}

#[derive(Debug, PartialEq)]
struct ValueError(&'static str);

impl std::fmt::Display for ValueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

#[test]
fn test_inner_step_failure_leaves_run_successful() {
    let (_dir, store) = store();
    let slot = SessionSlot::new(store.clone());

    let result = slot
        .scope(RunMetadata::new("checkout_flow"), |rec| {
            rec.record_step("open_cart", StepKind::Navigation, Duration::from_secs(1), StepStatus::Success)?;
            rec.record_step("pay", StepKind::Action, Duration::from_secs(2), StepStatus::Failed)?;
            rec.record_step("confirm", StepKind::Verification, Duration::ZERO, StepStatus::Success)?;
            Ok::<_, autoperf::UsageError>(())
        })
        .unwrap();
    assert!(result.is_ok());

    let summary = ReportGenerator::new(store.clone()).summarize(1).unwrap();
    assert_eq!(summary.total_runs, 1);
    assert_eq!(summary.successful_runs, 1);
    assert_eq!(summary.total_steps, 3);
    assert_eq!(summary.avg_step_duration, Some(1.0));

    let runs = store.query_runs(last_day(), None).unwrap();
    assert_eq!(runs[0].status, RunStatus::Success);
    assert_eq!(runs[0].total_steps, 3);
    assert_eq!(runs[0].failed_steps, 1);
}

#[test]
fn test_error_before_any_step_fails_run() {
    let (_dir, store) = store();
    let slot = SessionSlot::new(store.clone());

    let result = slot
        .scope(RunMetadata::new("checkout_flow"), |_| Err::<(), _>(ValueError("bad merchant id")))
        .unwrap();
    assert_eq!(result, Err(ValueError("bad merchant id")));

    let runs = store.query_runs(last_day(), None).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Failed);
    assert_eq!(runs[0].total_steps, 0);
    assert!(runs[0].completed_at.is_some());
}

#[test]
fn test_recording_without_session_is_silent_noop() {
    let (_dir, store) = store();
    let slot = SessionSlot::new(store.clone());

    let value = timed_step(&slot, "lookup", StepKind::Action, || Ok::<_, ValueError>("MID-001")).unwrap();
    assert_eq!(value, "MID-001");
    assert_eq!(
        slot.record_step(NewStep::new("orphan", StepKind::Wait, Duration::from_millis(5), StepStatus::Success)),
        None
    );

    assert!(store.query_runs(last_day(), None).unwrap().is_empty());
    let steps: i64 = store
        .pool()
        .get()
        .unwrap()
        .query_row("SELECT COUNT(*) FROM steps", [], |row| row.get(0))
        .unwrap();
    assert_eq!(steps, 0);
}

#[test]
fn test_bottlenecks_report_only_slow_steps() {
    let (_dir, store) = store();
    let run_id = store.insert_run(&RunMetadata::new("onboarding")).unwrap();

    let mut order = 1;
    for secs in [6.0, 7.0, 8.0, 7.8] {
        let step = NewStep::new("fill_form", StepKind::Action, Duration::from_secs_f64(secs), StepStatus::Success);
        store.insert_step(&run_id, order, &step).unwrap();
        order += 1;
    }
    for _ in 0..10 {
        let step = NewStep::new("click_button", StepKind::Action, Duration::from_millis(300), StepStatus::Success);
        store.insert_step(&run_id, order, &step).unwrap();
        order += 1;
    }
    store
        .close_run(&run_id, RunStatus::Success, model::now(), Duration::from_secs(32))
        .unwrap();

    let found = ReportGenerator::new(store).bottlenecks(1, 5.0, None).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].step_name, "fill_form");
    assert_eq!(found[0].avg_duration, 7.2);
    assert_eq!(found[0].occurrence_count, 4);
    assert_eq!(found[0].max_duration, 8.0);
}

#[test]
fn test_every_scope_exit_closes_exactly_one_run() {
    let (_dir, store) = store();
    let slot = SessionSlot::new(store.clone());

    slot.scope(RunMetadata::new("ok"), |_| Ok::<_, ValueError>(())).unwrap().unwrap();
    let _ = slot.scope(RunMetadata::new("err"), |_| Err::<(), _>(ValueError("nope"))).unwrap();
    let panicked = panic::catch_unwind(AssertUnwindSafe(|| {
        let _ = slot.scope(RunMetadata::new("panic"), |_| -> Result<(), ValueError> {
            panic!("browser crashed")
        });
    }));
    assert!(panicked.is_err());
    assert!(!slot.is_active());

    let runs = store.query_runs(last_day(), None).unwrap();
    assert_eq!(runs.len(), 3);
    assert!(runs.iter().all(|r| r.completed_at.is_some()));
    for run in &runs {
        let expected = if run.metadata.script_name == "ok" {
            RunStatus::Success
        } else {
            RunStatus::Failed
        };
        assert_eq!(run.status, expected, "{}", run.metadata.script_name);
    }
}

#[test]
fn test_detail_preserves_recording_order() {
    let (_dir, store) = store();
    let slot = SessionSlot::new(store.clone());
    let names = ["login", "search", "open_result", "add_to_cart", "logout"];

    let run_id = slot
        .scope(RunMetadata::new("ordering").environment("staging"), |rec| {
            for name in names {
                timed_step(rec.slot(), name, StepKind::Action, || Ok::<_, ValueError>(()))?;
            }
            Ok::<_, ValueError>(rec.run_id().unwrap().to_string())
        })
        .unwrap()
        .unwrap();

    let detail = store.query_run_detail(&run_id).unwrap().unwrap();
    let recorded: Vec<&str> = detail.steps.iter().map(|s| s.step.name.as_str()).collect();
    assert_eq!(recorded, names);
    let orders: Vec<u32> = detail.steps.iter().map(|s| s.step.order).collect();
    assert_eq!(orders, [1, 2, 3, 4, 5]);
    assert!(detail.steps.iter().all(|s| s.step.duration >= 0.0));
}

#[test]
fn test_failed_run_detail_points_at_failing_step() {
    let (_dir, store) = store();
    let slot = SessionSlot::new(store.clone());
    let mut run_id = String::new();

    let result = slot
        .scope(RunMetadata::new("create_merchant"), |rec| {
            run_id = rec.run_id().unwrap().to_string();
            timed_step(rec.slot(), "open_form", StepKind::Navigation, || Ok::<_, ValueError>(()))?;
            timed_step(rec.slot(), "submit", StepKind::Action, || Err::<(), _>(ValueError("422 from API")))?;
            timed_step(rec.slot(), "verify", StepKind::Verification, || Ok::<_, ValueError>(()))
        })
        .unwrap();
    assert_eq!(result, Err(ValueError("422 from API")));

    let text = ReportGenerator::new(store).detail(Some(&run_id)).unwrap();
    assert!(text.contains("FAILED"));
    assert!(text.contains("Failed In:"));
    assert!(text.contains("[2] submit"));
    assert!(text.contains("422 from API"));
    assert!(!text.contains("verify"));
}
