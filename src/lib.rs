//! autoperf -- Performance metrics for scripted browser automation.
//!
//! This crate records one run per automation execution, with its steps,
//! actions and page-level browser timings, into a local SQLite store, and
//! produces summary, detail, bottleneck and trend reports from it.

pub mod config;
pub mod error;
pub mod exec;
pub mod instrument;
pub mod logging;
pub mod model;
pub mod report;
pub mod session;
pub mod storage;

pub use error::{ConfigError, ExecError, ReportError, StorageError, UsageError};
pub use instrument::{instrumented, timed, timed_action, timed_step, StepGuard};
pub use model::{
    BrowserMetric, NewAction, NewStep, RunMetadata, RunStatus, StepKind, StepStatus,
};
pub use report::{ExportFormat, ExportKind, ReportGenerator};
pub use session::{SessionRecorder, SessionSlot, SessionSummary};
pub use storage::MetricsStore;
