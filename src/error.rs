//! Error taxonomy for the metrics store, session recorder and reports.

use std::path::PathBuf;

use thiserror::Error;

/// Failures of the on-disk metrics store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("failed to create store directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("run {run_id} does not exist")]
    UnknownRun { run_id: String },

    #[error("step {step_id} does not exist")]
    UnknownStep { step_id: i64 },
}

/// Programming errors in the calling automation code.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UsageError {
    #[error("a session is already active (run {active_run})")]
    SessionAlreadyActive { active_run: String },

    #[error("session for run {run_id} is already closed")]
    SessionClosed { run_id: String },

    #[error("step {step_id} was not recorded in run {run_id}")]
    UnknownStep { run_id: String, step_id: i64 },

    #[error("invalid label key {key:?}: {reason}")]
    InvalidLabel { key: String, reason: &'static str },
}

/// Failures raised from explicit report calls.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("run {run_id} not found")]
    RunNotFound { run_id: String },

    #[error("no runs recorded")]
    NoRuns,

    #[error("failed to write report to {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Failures loading the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Failures running an external command under a session.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("no command given")]
    EmptyCommand,

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Usage(#[from] UsageError),
}
