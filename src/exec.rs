//! Run an external automation command as a recorded run.
//!
//! The child inherits stdio. Its wall time becomes a single `execute` step;
//! a non-zero exit marks both the step and the run `failed`.

use std::io;
use std::process::{Command, ExitStatus};

use tracing::{info, warn};

use crate::error::ExecError;
use crate::model::{RunMetadata, StepKind};
use crate::session::SessionSlot;

pub const EXECUTE_STEP: &str = "execute";

/// Result of a recorded command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutcome {
    /// `None` when the store could not open the run.
    pub run_id: Option<String>,
    pub exit_code: i32,
}

enum Failure {
    Exit(i32),
    Spawn(io::Error),
}

/// Run `command` (program followed by its arguments) inside a session.
pub fn run(slot: &SessionSlot, metadata: RunMetadata, command: &[String]) -> Result<ExecOutcome, ExecError> {
    let (program, args) = command.split_first().ok_or(ExecError::EmptyCommand)?;
    let mut run_id = None;

    let result = slot.scope(metadata, |recorder| {
        run_id = recorder.run_id().map(str::to_string);
        let step = recorder.step(EXECUTE_STEP, StepKind::Action);
        info!(run_id = run_id.as_deref().unwrap_or("unrecorded"), %program, ?args, "executing command");

        match Command::new(program).args(args).status() {
            Ok(status) if status.success() => {
                step.succeed();
                Ok(0)
            }
            Ok(status) => {
                let code = exit_code(status);
                step.fail(format!("exited with {status}"));
                Err(Failure::Exit(code))
            }
            Err(e) => {
                step.fail(format!("failed to start {program}: {e}"));
                Err(Failure::Spawn(e))
            }
        }
    })?;

    match result {
        Ok(exit_code) => Ok(ExecOutcome { run_id, exit_code }),
        Err(Failure::Exit(exit_code)) => {
            warn!(run_id = run_id.as_deref().unwrap_or("unrecorded"), exit_code, "command failed");
            Ok(ExecOutcome { run_id, exit_code })
        }
        Err(Failure::Spawn(source)) => Err(ExecError::Spawn {
            program: program.clone(),
            source,
        }),
    }
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(1)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::model::{RunStatus, StepStatus};
    use crate::storage::MetricsStore;

    fn slot() -> (tempfile::TempDir, SessionSlot) {
        let dir = tempfile::tempdir().unwrap();
        let store = MetricsStore::open(dir.path().join("perf.db")).unwrap();
        (dir, SessionSlot::new(store))
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    #[test]
    fn test_success_records_execute_step() {
        let (_dir, slot) = slot();
        let outcome = run(&slot, RunMetadata::new("nightly"), &sh("exit 0")).unwrap();
        assert_eq!(outcome.exit_code, 0);

        let detail = slot
            .store()
            .query_run_detail(outcome.run_id.as_deref().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(detail.run.status, RunStatus::Success);
        assert_eq!(detail.steps.len(), 1);
        assert_eq!(detail.steps[0].step.name, EXECUTE_STEP);
        assert_eq!(detail.steps[0].step.status, StepStatus::Success);
    }

    #[test]
    fn test_nonzero_exit_fails_run_and_keeps_code() {
        let (_dir, slot) = slot();
        let outcome = run(&slot, RunMetadata::new("nightly"), &sh("exit 3")).unwrap();
        assert_eq!(outcome.exit_code, 3);

        let run = slot
            .store()
            .get_run(outcome.run_id.as_deref().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.failed_steps, 1);
        assert!(!slot.is_active());
    }

    #[test]
    fn test_missing_program_is_spawn_error() {
        let (_dir, slot) = slot();
        let command = vec!["/nonexistent/autoperf-test-binary".to_string()];
        let err = run(&slot, RunMetadata::new("broken"), &command).unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));

        let since = crate::model::now() - chrono::Duration::days(1);
        let runs = slot.store().query_runs(since, Some("broken")).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Failed);
    }

    #[test]
    fn test_empty_command() {
        let (_dir, slot) = slot();
        assert!(matches!(run(&slot, RunMetadata::new("x"), &[]), Err(ExecError::EmptyCommand)));
    }
}
