//! Step and action timing.
//!
//! Every helper here is a passthrough when no session is active: the work
//! still runs and its result is returned untouched, nothing is recorded.
//! Durations come from [`Instant`], so they are never negative.

use std::fmt::Display;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::model::{self, NewAction, NewStep, StepKind, StepStatus};
use crate::session::SessionSlot;

/// Scope guard timing one step.
///
/// Finish it with [`StepGuard::finish`], [`StepGuard::succeed`] or
/// [`StepGuard::fail`]. Dropping it unfinished (early return, panic)
/// records the step as `failed`. The step belongs to the session active
/// when the guard was created and is not written if that session ended.
pub struct StepGuard<'a> {
    slot: &'a SessionSlot,
    /// Session active when the step started; `None` outside a session.
    generation: Option<u64>,
    name: String,
    kind: StepKind,
    started_at: DateTime<Utc>,
    started: Instant,
    page_url: Option<String>,
    element_selector: Option<String>,
    actions: Vec<NewAction>,
    done: bool,
}

impl<'a> StepGuard<'a> {
    pub fn new(slot: &'a SessionSlot, name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            slot,
            generation: slot.active_generation(),
            name: name.into(),
            kind,
            started_at: model::now(),
            started: Instant::now(),
            page_url: None,
            element_selector: None,
            actions: Vec::new(),
            done: false,
        }
    }

    pub fn page_url(mut self, url: impl Into<String>) -> Self {
        self.page_url = Some(url.into());
        self
    }

    pub fn element_selector(mut self, selector: impl Into<String>) -> Self {
        self.element_selector = Some(selector.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Time an action inside this step. Actions are written after the step
    /// itself, once it has an id.
    pub fn action<T, E, F>(&mut self, name: &str, target: Option<&str>, work: F) -> Result<T, E>
    where
        E: Display,
        F: FnOnce() -> Result<T, E>,
    {
        let started_at = model::now();
        let started = Instant::now();
        let result = work();

        let mut action = NewAction::new(name, started.elapsed(), status_of(&result));
        action.started_at = started_at;
        action.target = target.map(str::to_string);
        if let Err(e) = &result {
            action.error_message = Some(e.to_string());
        }
        self.actions.push(action);
        result
    }

    /// Attach an action that was timed elsewhere.
    pub fn push_action(&mut self, action: NewAction) {
        self.actions.push(action);
    }

    /// Record with the status implied by `result`.
    pub fn finish<T, E: Display>(self, result: &Result<T, E>) -> Option<i64> {
        match result {
            Ok(_) => self.complete(StepStatus::Success, None),
            Err(e) => self.complete(StepStatus::Failed, Some(e.to_string())),
        }
    }

    pub fn succeed(self) -> Option<i64> {
        self.complete(StepStatus::Success, None)
    }

    pub fn fail(self, message: impl Into<String>) -> Option<i64> {
        self.complete(StepStatus::Failed, Some(message.into()))
    }

    /// Record with an explicit status, e.g. `timeout` or `skipped`.
    pub fn complete(mut self, status: StepStatus, error_message: Option<String>) -> Option<i64> {
        self.write(status, error_message)
    }

    fn write(&mut self, status: StepStatus, error_message: Option<String>) -> Option<i64> {
        self.done = true;
        let step = NewStep {
            name: std::mem::take(&mut self.name),
            kind: self.kind,
            started_at: self.started_at,
            duration: self.started.elapsed(),
            status,
            error_message,
            page_url: self.page_url.take(),
            element_selector: self.element_selector.take(),
        };

        let generation = self.generation?;
        let step_id = self.slot.record_step_in(generation, step)?;
        for action in self.actions.drain(..) {
            if let Err(e) = self.slot.record_action_in(generation, step_id, action) {
                debug!(step_id, "dropping action: {}", e);
            }
        }
        Some(step_id)
    }
}

impl Drop for StepGuard<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let message = if std::thread::panicking() {
            "panicked"
        } else {
            "scope exited before the step finished"
        };
        self.write(StepStatus::Failed, Some(message.to_string()));
    }
}

fn status_of<T, E>(result: &Result<T, E>) -> StepStatus {
    if result.is_ok() {
        StepStatus::Success
    } else {
        StepStatus::Failed
    }
}

/// Run fallible `work` as a named step.
///
/// `Ok` records `success`, `Err` records `failed` with the error text; the
/// result is returned unchanged either way.
pub fn timed_step<T, E, F>(slot: &SessionSlot, name: &str, kind: StepKind, work: F) -> Result<T, E>
where
    E: Display,
    F: FnOnce() -> Result<T, E>,
{
    let guard = StepGuard::new(slot, name, kind);
    let result = work();
    guard.finish(&result);
    result
}

/// Run infallible `work` as a named step that always succeeds unless it
/// panics.
pub fn timed<T, F>(slot: &SessionSlot, name: &str, kind: StepKind, work: F) -> T
where
    F: FnOnce() -> T,
{
    let guard = StepGuard::new(slot, name, kind);
    let value = work();
    guard.succeed();
    value
}

/// Run `work` as an action under a step the active session already recorded.
///
/// Without an active session the work runs and nothing is written. A
/// `step_id` the session never recorded is logged and the action dropped;
/// use [`SessionSlot::record_action`] directly to see that error.
pub fn timed_action<T, E, F>(slot: &SessionSlot, step_id: i64, name: &str, work: F) -> Result<T, E>
where
    E: Display,
    F: FnOnce() -> Result<T, E>,
{
    let started_at = model::now();
    let started = Instant::now();
    let result = work();

    let mut action = NewAction::new(name, started.elapsed(), status_of(&result));
    action.started_at = started_at;
    if let Err(e) = &result {
        action.error_message = Some(e.to_string());
    }
    if let Err(e) = slot.record_action(step_id, action) {
        warn!(step_id, action = name, "action not recorded: {}", e);
    }
    result
}

/// Wrap a function so every call is timed as a step named `name`.
pub fn instrumented<'a, A, T, E, F>(
    slot: &'a SessionSlot,
    name: &'a str,
    kind: StepKind,
    mut f: F,
) -> impl FnMut(A) -> Result<T, E> + 'a
where
    A: 'a,
    T: 'a,
    E: Display + 'a,
    F: FnMut(A) -> Result<T, E> + 'a,
{
    move |arg| timed_step(slot, name, kind, || f(arg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RunMetadata;
    use crate::storage::MetricsStore;

    fn slot() -> (tempfile::TempDir, SessionSlot) {
        let dir = tempfile::tempdir().unwrap();
        let store = MetricsStore::open(dir.path().join("perf.db")).unwrap();
        (dir, SessionSlot::new(store))
    }

    #[test]
    fn test_passthrough_without_session() {
        let (_dir, slot) = slot();
        let value = timed(&slot, "compute", StepKind::Action, || 41 + 1);
        assert_eq!(value, 42);

        let err = timed_step(&slot, "fails", StepKind::Action, || Err::<(), _>("boom")).unwrap_err();
        assert_eq!(err, "boom");

        let since = model::now() - chrono::Duration::days(1);
        assert!(slot.store().query_runs(since, None).unwrap().is_empty());
    }

    #[test]
    fn test_failed_step_keeps_error_and_message() {
        let (_dir, slot) = slot();
        let recorder = slot.start(RunMetadata::new("errors")).unwrap();
        let run_id = recorder.run_id().unwrap().to_string();

        let err = timed_step(&slot, "submit", StepKind::Action, || Err::<u8, _>("button disabled"))
            .unwrap_err();
        assert_eq!(err, "button disabled");
        recorder.close(crate::model::RunStatus::Success).unwrap();

        let detail = slot.store().query_run_detail(&run_id).unwrap().unwrap();
        let step = &detail.steps[0].step;
        assert_eq!(step.status, StepStatus::Failed);
        assert_eq!(step.error_message.as_deref(), Some("button disabled"));
        assert!(step.duration >= 0.0);
    }

    #[test]
    fn test_guard_records_actions_under_step() {
        let (_dir, slot) = slot();
        let recorder = slot.start(RunMetadata::new("guard")).unwrap();
        let run_id = recorder.run_id().unwrap().to_string();

        let mut step = recorder.step("login", StepKind::Action).page_url("https://osc.example/login");
        step.action("fill", Some("#username"), || Ok::<_, String>(())).unwrap();
        let _ = step.action("click", Some("#submit"), || Err::<(), _>("detached".to_string()));
        let step_id = step.succeed().unwrap();
        recorder.close(crate::model::RunStatus::Success).unwrap();

        let detail = slot.store().query_run_detail(&run_id).unwrap().unwrap();
        assert_eq!(detail.steps[0].step.id, step_id);
        let actions = &detail.steps[0].actions;
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].target.as_deref(), Some("#username"));
        assert_eq!(actions[1].status, StepStatus::Failed);
        assert_eq!(actions[1].error_message.as_deref(), Some("detached"));
    }

    #[test]
    fn test_early_exit_records_failed_step() {
        let (_dir, slot) = slot();
        let recorder = slot.start(RunMetadata::new("early")).unwrap();
        let run_id = recorder.run_id().unwrap().to_string();

        fn navigate(slot: &SessionSlot) -> Result<(), String> {
            let guard = slot.step("navigate", StepKind::Navigation);
            let page: Result<(), String> = Err("timeout".to_string());
            page?;
            guard.succeed();
            Ok(())
        }
        assert!(navigate(&slot).is_err());
        recorder.close(crate::model::RunStatus::Failed).unwrap();

        let detail = slot.store().query_run_detail(&run_id).unwrap().unwrap();
        assert_eq!(detail.steps[0].step.status, StepStatus::Failed);
    }

    #[test]
    fn test_timed_action_attaches_to_recorded_step() {
        let (_dir, slot) = slot();
        let recorder = slot.start(RunMetadata::new("actions")).unwrap();
        let run_id = recorder.run_id().unwrap().to_string();

        let step_id = recorder
            .record_step("checkout", StepKind::Action, std::time::Duration::from_millis(40), StepStatus::Success)
            .unwrap()
            .unwrap();
        let total = timed_action(&slot, step_id, "sum_cart", || Ok::<_, String>(3 + 4)).unwrap();
        assert_eq!(total, 7);
        // Unknown step: the work still runs, the action is dropped.
        assert_eq!(timed_action(&slot, step_id + 100, "ghost", || Ok::<_, String>(1)), Ok(1));
        recorder.close(crate::model::RunStatus::Success).unwrap();

        let detail = slot.store().query_run_detail(&run_id).unwrap().unwrap();
        let actions = &detail.steps[0].actions;
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].name, "sum_cart");
        assert_eq!(actions[0].status, StepStatus::Success);
    }

    #[test]
    fn test_instrumented_wraps_each_call() {
        let (_dir, slot) = slot();
        let recorder = slot.start(RunMetadata::new("decorated")).unwrap();
        let run_id = recorder.run_id().unwrap().to_string();

        let mut select_terminal = instrumented(&slot, "select_terminal", StepKind::Action, |n: u32| {
            if n % 2 == 0 {
                Ok(n)
            } else {
                Err(format!("terminal {n} unavailable"))
            }
        });
        assert_eq!(select_terminal(2), Ok(2));
        assert!(select_terminal(3).is_err());
        recorder.close(crate::model::RunStatus::Success).unwrap();

        let detail = slot.store().query_run_detail(&run_id).unwrap().unwrap();
        let statuses: Vec<_> = detail.steps.iter().map(|s| s.step.status).collect();
        assert_eq!(statuses, [StepStatus::Success, StepStatus::Failed]);
        assert!(detail.steps.iter().all(|s| s.step.name == "select_terminal"));
    }
}
