//! Session recording: one active run per automation execution.
//!
//! [`SessionSlot`] is owned by the automation entry point and passed by
//! reference to everything that records timings. It holds at most one
//! active run. [`SessionRecorder`] is the scoped handle for that run: it is
//! closed explicitly, through [`SessionSlot::scope`], or on drop, so the run
//! always reaches a terminal status.
//!
//! Storage failures inside a session are logged and swallowed; they never
//! reach the wrapped automation. Misuse is reported as [`UsageError`].

use std::collections::HashSet;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::UsageError;
use crate::instrument::StepGuard;
use crate::model::{self, BrowserMetric, NewAction, NewStep, RunMetadata, RunStatus, StepKind, StepStatus};
use crate::storage::MetricsStore;

struct ActiveRun {
    generation: u64,
    /// `None` when the run row could not be inserted; recording is then a no-op.
    run_id: Option<String>,
    script_name: String,
    started: Instant,
    next_order: u32,
    steps: HashSet<i64>,
    steps_recorded: u32,
    failed_steps: u32,
    step_time: Duration,
}

#[derive(Default)]
struct SlotState {
    generation: u64,
    active: Option<ActiveRun>,
}

/// Single-slot holder for the active session, plus the store it writes to.
pub struct SessionSlot {
    store: MetricsStore,
    state: Mutex<SlotState>,
}

/// Statistics computed when a session closes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub run_id: Option<String>,
    pub script_name: String,
    pub status: RunStatus,
    pub duration: f64,
    pub total_steps: u32,
    pub failed_steps: u32,
    pub mean_step_duration: Option<f64>,
}

impl fmt::Display for SessionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] {} in {:.2}s: {} step{} ({} failed)",
            self.script_name,
            self.run_id.as_deref().unwrap_or("unrecorded"),
            self.status.as_str().to_uppercase(),
            self.duration,
            self.total_steps,
            if self.total_steps == 1 { "" } else { "s" },
            self.failed_steps,
        )?;
        if let Some(mean) = self.mean_step_duration {
            write!(f, ", mean step {:.2}s", mean)?;
        }
        Ok(())
    }
}

impl SessionSlot {
    pub fn new(store: MetricsStore) -> Self {
        Self {
            store,
            state: Mutex::new(SlotState::default()),
        }
    }

    pub fn store(&self) -> &MetricsStore {
        &self.store
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        // A panic inside wrapped work must not stop the run from being closed.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_active(&self) -> bool {
        self.lock().active.is_some()
    }

    /// Run id of the active session, if one is active and was persisted.
    pub fn active_run_id(&self) -> Option<String> {
        self.lock().active.as_ref().and_then(|a| a.run_id.clone())
    }

    /// Open a run and occupy the slot.
    pub fn start(&self, metadata: RunMetadata) -> Result<SessionRecorder<'_>, UsageError> {
        let mut state = self.lock();
        if let Some(active) = &state.active {
            return Err(UsageError::SessionAlreadyActive {
                active_run: active.run_id.clone().unwrap_or_else(|| "unrecorded".into()),
            });
        }

        let run_id = match self.store.insert_run(&metadata) {
            Ok(id) => {
                info!(
                    run_id = %id,
                    script = %metadata.script_name,
                    environment = metadata.environment.as_deref().unwrap_or("-"),
                    browser = metadata.browser.as_deref().unwrap_or("-"),
                    "session started"
                );
                Some(id)
            }
            Err(e) => {
                error!(script = %metadata.script_name, "failed to open run, metrics disabled for this session: {}", e);
                None
            }
        };

        state.generation += 1;
        let generation = state.generation;
        state.active = Some(ActiveRun {
            generation,
            run_id: run_id.clone(),
            script_name: metadata.script_name,
            started: Instant::now(),
            next_order: 1,
            steps: HashSet::new(),
            steps_recorded: 0,
            failed_steps: 0,
            step_time: Duration::ZERO,
        });

        Ok(SessionRecorder {
            slot: self,
            generation,
            run_id,
        })
    }

    /// Run `work` inside a session.
    ///
    /// The run closes as `success` when `work` returns `Ok` and `failed` when
    /// it returns `Err` or panics. The work's result is returned unchanged.
    /// If `work` closed the session itself and also failed, the work's error
    /// is returned and the double close is only logged.
    pub fn scope<T, E, F>(&self, metadata: RunMetadata, work: F) -> Result<Result<T, E>, UsageError>
    where
        F: FnOnce(&SessionRecorder<'_>) -> Result<T, E>,
    {
        let recorder = self.start(metadata)?;
        let result = work(&recorder);
        let status = if result.is_ok() {
            RunStatus::Success
        } else {
            RunStatus::Failed
        };

        match recorder.close(status) {
            Ok(_) => Ok(result),
            Err(e) if result.is_err() => {
                error!("session closed twice: {}", e);
                Ok(result)
            }
            Err(e) => Err(e),
        }
    }

    /// Record a completed step against the active session.
    ///
    /// Without an active session this is a silent no-op returning `None`.
    pub fn record_step(&self, step: NewStep) -> Option<i64> {
        let mut state = self.lock();
        let active = state.active.as_mut()?;
        self.write_step(active, step)
    }

    /// Record an action under a step of the active session.
    ///
    /// Returns `Ok(None)` without an active session. A step id the active
    /// session never recorded is a usage error.
    pub fn record_action(&self, step_id: i64, action: NewAction) -> Result<Option<i64>, UsageError> {
        let state = self.lock();
        let Some(active) = state.active.as_ref() else {
            return Ok(None);
        };
        self.write_action(active, step_id, action)
    }

    /// Record page-level timings for the active session.
    pub fn record_browser_metric(&self, metric: &BrowserMetric) -> Option<i64> {
        let state = self.lock();
        let run_id = state.active.as_ref()?.run_id.as_deref()?;
        match self.store.insert_browser_metric(run_id, metric) {
            Ok(id) => {
                info!(
                    %run_id,
                    page = metric.page_url.as_deref().unwrap_or("-"),
                    load_secs = metric.page_load_time.unwrap_or_default(),
                    "browser metric recorded"
                );
                Some(id)
            }
            Err(e) => {
                error!(%run_id, "failed to record browser metric: {}", e);
                None
            }
        }
    }

    /// Generation of the active session, if any. Changes every time a
    /// session opens.
    pub(crate) fn active_generation(&self) -> Option<u64> {
        self.lock().active.as_ref().map(|a| a.generation)
    }

    /// Record a step only if session `generation` is still the active one.
    pub(crate) fn record_step_in(&self, generation: u64, step: NewStep) -> Option<i64> {
        let mut state = self.lock();
        match state.active.as_mut() {
            Some(active) if active.generation == generation => self.write_step(active, step),
            _ => {
                warn!(step = %step.name, "session ended before the step finished, step not recorded");
                None
            }
        }
    }

    /// Record an action only if session `generation` is still the active one.
    pub(crate) fn record_action_in(
        &self,
        generation: u64,
        step_id: i64,
        action: NewAction,
    ) -> Result<Option<i64>, UsageError> {
        let state = self.lock();
        match state.active.as_ref() {
            Some(active) if active.generation == generation => self.write_action(active, step_id, action),
            _ => {
                warn!(step_id, action = %action.name, "session ended before the action was written");
                Ok(None)
            }
        }
    }

    /// Start a step scope bound to this slot.
    pub fn step(&self, name: impl Into<String>, kind: StepKind) -> StepGuard<'_> {
        StepGuard::new(self, name, kind)
    }

    fn write_step(&self, active: &mut ActiveRun, step: NewStep) -> Option<i64> {
        let run_id = active.run_id.as_deref()?;
        let order = active.next_order;

        match self.store.insert_step(run_id, order, &step) {
            Ok(id) => {
                active.next_order += 1;
                active.steps.insert(id);
                active.steps_recorded += 1;
                active.step_time += step.duration;
                if matches!(step.status, StepStatus::Failed | StepStatus::Timeout) {
                    active.failed_steps += 1;
                }
                info!(
                    %run_id,
                    step = %step.name,
                    kind = %step.kind,
                    status = %step.status,
                    duration_secs = step.duration.as_secs_f64(),
                    "step recorded"
                );
                Some(id)
            }
            Err(e) => {
                error!(%run_id, step = %step.name, "failed to record step: {}", e);
                None
            }
        }
    }

    fn write_action(
        &self,
        active: &ActiveRun,
        step_id: i64,
        action: NewAction,
    ) -> Result<Option<i64>, UsageError> {
        let Some(run_id) = active.run_id.as_deref() else {
            return Ok(None);
        };
        if !active.steps.contains(&step_id) {
            return Err(UsageError::UnknownStep {
                run_id: run_id.to_string(),
                step_id,
            });
        }

        match self.store.insert_action(run_id, step_id, &action) {
            Ok(id) => {
                debug!(
                    %run_id,
                    step_id,
                    action = %action.name,
                    status = %action.status,
                    duration_secs = action.duration.as_secs_f64(),
                    "action recorded"
                );
                Ok(Some(id))
            }
            Err(e) => {
                error!(%run_id, step_id, action = %action.name, "failed to record action: {}", e);
                Ok(None)
            }
        }
    }

    fn close_generation(&self, generation: u64, status: RunStatus) -> Result<SessionSummary, UsageError> {
        let active = {
            let mut state = self.lock();
            match &state.active {
                Some(active) if active.generation == generation => state.active.take(),
                _ => None,
            }
        };
        let Some(active) = active else {
            return Err(UsageError::SessionClosed {
                run_id: format!("generation {generation}"),
            });
        };

        let elapsed = active.started.elapsed();
        if let Some(run_id) = &active.run_id {
            if let Err(e) = self.store.close_run(run_id, status, model::now(), elapsed) {
                error!(%run_id, "failed to close run: {}", e);
            }
        }

        let summary = SessionSummary {
            run_id: active.run_id,
            script_name: active.script_name,
            status,
            duration: elapsed.as_secs_f64(),
            total_steps: active.steps_recorded,
            failed_steps: active.failed_steps,
            mean_step_duration: (active.steps_recorded > 0)
                .then(|| active.step_time.as_secs_f64() / f64::from(active.steps_recorded)),
        };

        match status {
            RunStatus::Success => info!(summary = %summary, "session finished"),
            _ => warn!(summary = %summary, "session finished"),
        }
        Ok(summary)
    }
}

/// Scoped handle for the active run.
pub struct SessionRecorder<'a> {
    slot: &'a SessionSlot,
    generation: u64,
    run_id: Option<String>,
}

impl<'a> SessionRecorder<'a> {
    pub fn slot(&self) -> &'a SessionSlot {
        self.slot
    }

    /// Id of the persisted run; `None` if the store rejected the insert.
    pub fn run_id(&self) -> Option<&str> {
        self.run_id.as_deref()
    }

    fn with_active<R>(&self, f: impl FnOnce(&mut ActiveRun) -> R) -> Result<R, UsageError> {
        let mut state = self.slot.lock();
        match state.active.as_mut() {
            Some(active) if active.generation == self.generation => Ok(f(active)),
            _ => Err(self.closed()),
        }
    }

    fn closed(&self) -> UsageError {
        UsageError::SessionClosed {
            run_id: self.run_id.clone().unwrap_or_else(|| format!("generation {}", self.generation)),
        }
    }

    /// Record a step that already ran for `duration`.
    pub fn record_step(
        &self,
        name: impl Into<String>,
        kind: StepKind,
        duration: Duration,
        status: StepStatus,
    ) -> Result<Option<i64>, UsageError> {
        self.record(NewStep::new(name, kind, duration, status))
    }

    pub fn record(&self, step: NewStep) -> Result<Option<i64>, UsageError> {
        let slot = self.slot;
        self.with_active(|active| slot.write_step(active, step))
    }

    /// Record an action under `step_id`, which must belong to this session.
    pub fn record_action(
        &self,
        step_id: i64,
        name: impl Into<String>,
        duration: Duration,
        status: StepStatus,
    ) -> Result<Option<i64>, UsageError> {
        self.record_action_with(step_id, NewAction::new(name, duration, status))
    }

    pub fn record_action_with(&self, step_id: i64, action: NewAction) -> Result<Option<i64>, UsageError> {
        let slot = self.slot;
        self.with_active(|active| slot.write_action(active, step_id, action))?
    }

    pub fn record_browser_metric(&self, metric: &BrowserMetric) -> Result<Option<i64>, UsageError> {
        self.with_active(|_| ())?;
        Ok(self.slot.record_browser_metric(metric))
    }

    /// Start a timed step scope in this session.
    pub fn step(&self, name: impl Into<String>, kind: StepKind) -> StepGuard<'a> {
        StepGuard::new(self.slot, name, kind)
    }

    /// Close the run with `status` and release the slot.
    pub fn close(&self, status: RunStatus) -> Result<SessionSummary, UsageError> {
        self.slot
            .close_generation(self.generation, status)
            .map_err(|_| self.closed())
    }
}

impl Drop for SessionRecorder<'_> {
    fn drop(&mut self) {
        let still_active = matches!(
            &self.slot.lock().active,
            Some(active) if active.generation == self.generation
        );
        if !still_active {
            return;
        }

        let status = if std::thread::panicking() {
            RunStatus::Failed
        } else {
            RunStatus::Error
        };
        warn!(run_id = self.run_id.as_deref().unwrap_or("unrecorded"), %status, "session dropped without close");
        let _ = self.slot.close_generation(self.generation, status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot() -> (tempfile::TempDir, SessionSlot) {
        let dir = tempfile::tempdir().unwrap();
        let store = MetricsStore::open(dir.path().join("perf.db")).unwrap();
        (dir, SessionSlot::new(store))
    }

    #[test]
    fn test_second_session_is_usage_error() {
        let (_dir, slot) = slot();
        let first = slot.start(RunMetadata::new("one")).unwrap();
        let err = slot.start(RunMetadata::new("two")).err().unwrap();
        assert!(matches!(err, UsageError::SessionAlreadyActive { .. }));
        first.close(RunStatus::Success).unwrap();

        let second = slot.start(RunMetadata::new("two")).unwrap();
        second.close(RunStatus::Success).unwrap();
    }

    #[test]
    fn test_close_twice_is_usage_error() {
        let (_dir, slot) = slot();
        let recorder = slot.start(RunMetadata::new("once")).unwrap();
        recorder.close(RunStatus::Success).unwrap();
        let err = recorder.close(RunStatus::Success).unwrap_err();
        assert!(matches!(err, UsageError::SessionClosed { .. }));
        assert!(!slot.is_active());
    }

    #[test]
    fn test_recording_after_close_is_usage_error() {
        let (_dir, slot) = slot();
        let recorder = slot.start(RunMetadata::new("late")).unwrap();
        recorder.close(RunStatus::Success).unwrap();
        let err = recorder
            .record_step("late", StepKind::Action, Duration::ZERO, StepStatus::Success)
            .unwrap_err();
        assert!(matches!(err, UsageError::SessionClosed { .. }));
    }

    #[test]
    fn test_action_against_unknown_step() {
        let (_dir, slot) = slot();
        let recorder = slot.start(RunMetadata::new("actions")).unwrap();
        let step = recorder
            .record_step("login", StepKind::Action, Duration::from_millis(10), StepStatus::Success)
            .unwrap()
            .unwrap();
        recorder
            .record_action(step, "click", Duration::from_millis(3), StepStatus::Success)
            .unwrap();

        let err = recorder
            .record_action(step + 100, "click", Duration::ZERO, StepStatus::Success)
            .unwrap_err();
        assert!(matches!(err, UsageError::UnknownStep { step_id, .. } if step_id == step + 100));
        recorder.close(RunStatus::Success).unwrap();
    }

    #[test]
    fn test_drop_without_close_marks_error() {
        let (_dir, slot) = slot();
        let run_id = {
            let recorder = slot.start(RunMetadata::new("abandoned")).unwrap();
            recorder.run_id().unwrap().to_string()
        };
        assert!(!slot.is_active());
        let run = slot.store().get_run(&run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Error);
        assert!(run.completed_at.is_some());
    }

    #[test]
    fn test_panic_inside_scope_closes_run_as_failed() {
        let (_dir, slot) = slot();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = slot.scope(RunMetadata::new("panics"), |_| -> Result<(), String> {
                panic!("browser crashed");
            });
        }));
        assert!(outcome.is_err());
        assert!(!slot.is_active());

        let since = model::now() - chrono::Duration::hours(1);
        let runs = slot.store().query_runs(since, Some("panics")).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Failed);
    }

    #[test]
    fn test_step_insert_failure_is_swallowed() {
        let (_dir, slot) = slot();
        let outcome = slot
            .scope(RunMetadata::new("broken_mid_session"), |rec| {
                let first = rec
                    .record_step("login", StepKind::Action, Duration::from_millis(5), StepStatus::Success)
                    .unwrap();
                assert!(first.is_some());

                rec.slot()
                    .store()
                    .pool()
                    .get()
                    .unwrap()
                    .execute_batch("DROP TABLE actions; DROP TABLE steps;")
                    .unwrap();

                let second = rec
                    .record_step("submit", StepKind::Action, Duration::from_millis(5), StepStatus::Success)
                    .unwrap();
                assert_eq!(second, None);
                Ok::<_, String>(7)
            })
            .unwrap();

        assert_eq!(outcome, Ok(7));
        assert!(!slot.is_active());
    }

    #[test]
    fn test_run_insert_failure_disables_recording() {
        let (_dir, slot) = slot();
        slot.store()
            .pool()
            .get()
            .unwrap()
            .execute_batch("DROP TABLE actions; DROP TABLE steps; DROP TABLE browser_metrics; DROP TABLE runs;")
            .unwrap();

        let outcome = slot
            .scope(RunMetadata::new("no_store"), |rec| {
                assert_eq!(rec.run_id(), None);
                let step = rec
                    .record_step("login", StepKind::Action, Duration::from_millis(5), StepStatus::Success)
                    .unwrap();
                assert_eq!(step, None);
                let metric = rec.record_browser_metric(&BrowserMetric::default()).unwrap();
                assert_eq!(metric, None);
                Ok::<_, String>("done")
            })
            .unwrap();

        assert_eq!(outcome, Ok("done"));
        assert!(!slot.is_active());
        assert!(slot.start(RunMetadata::new("next")).is_ok());
    }

    #[test]
    fn test_step_from_previous_session_is_not_recorded_in_next() {
        let (_dir, slot) = slot();
        let first = slot.start(RunMetadata::new("first")).unwrap();
        let guard = first.step("slow_lookup", StepKind::Action);
        first.close(RunStatus::Success).unwrap();
        drop(first);

        let second = slot.start(RunMetadata::new("second")).unwrap();
        let second_id = second.run_id().unwrap().to_string();
        assert_eq!(guard.succeed(), None);
        second.close(RunStatus::Success).unwrap();

        let detail = slot.store().query_run_detail(&second_id).unwrap().unwrap();
        assert!(detail.steps.is_empty());
    }

    #[test]
    fn test_summary_counts_steps() {
        let (_dir, slot) = slot();
        let recorder = slot.start(RunMetadata::new("summary")).unwrap();
        recorder
            .record_step("a", StepKind::Action, Duration::from_secs(1), StepStatus::Success)
            .unwrap();
        recorder
            .record_step("b", StepKind::Action, Duration::from_secs(3), StepStatus::Failed)
            .unwrap();
        let summary = recorder.close(RunStatus::Success).unwrap();

        assert_eq!(summary.total_steps, 2);
        assert_eq!(summary.failed_steps, 1);
        assert_eq!(summary.mean_step_duration, Some(2.0));
        assert!(summary.to_string().contains("SUCCESS"));
    }
}
