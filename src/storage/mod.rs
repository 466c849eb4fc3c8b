//! SQLite metrics store -- schema, inserts, queries.
//!
//! Rows are append-only except for the single close of a run, so readers on
//! other connections only ever observe new rows appearing.

pub mod schema;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::model::{
    self, Action, BrowserMetric, BrowserMetricRecord, Labels, NewAction, NewStep, Run, RunDetail,
    RunMetadata, RunStatus, Step, StepDetail,
};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

const RUN_COLUMNS: &str = "id, script_name, environment, browser, headless, viewport, tags_json, \
     notes, labels_json, started_at, completed_at, total_duration, status, total_steps, failed_steps";

const STEP_COLUMNS: &str = "id, run_id, step_order, name, kind, started_at, duration, status, \
     error_message, page_url, element_selector";

const ACTION_COLUMNS: &str = "id, step_id, run_id, name, started_at, duration, status, target, \
     value, retry_count, error_message";

/// Format a timestamp the way every table stores it. Fixed-width UTC text
/// keeps lexical and chronological order identical.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Durable store for runs, steps, actions and browser metrics.
#[derive(Clone)]
pub struct MetricsStore {
    pool: Pool,
    path: PathBuf,
}

impl std::fmt::Debug for MetricsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsStore").field("path", &self.path).finish()
    }
}

impl MetricsStore {
    /// Open (or create) the store file and ensure the schema exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StorageError::Directory {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let manager = SqliteConnectionManager::file(&path).with_init(|c| {
            c.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
            )
        });

        let pool = R2D2Pool::builder().max_size(4).build(manager)?;

        // Run migrations on a single connection
        let conn = pool.get()?;
        schema::migrate(&conn)?;
        drop(conn);

        debug!(path = %path.display(), "metrics store ready");
        Ok(Self { pool, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Insert a new run in `running` state and return its id.
    pub fn insert_run(&self, metadata: &RunMetadata) -> Result<String, StorageError> {
        self.insert_run_at(metadata, model::now())
    }

    /// Insert a new run with an explicit start time.
    pub fn insert_run_at(
        &self,
        metadata: &RunMetadata,
        started_at: DateTime<Utc>,
    ) -> Result<String, StorageError> {
        let conn = self.pool.get()?;
        let id = uuid::Uuid::new_v4().to_string();
        let tags_json = serde_json::to_string(&metadata.tags).unwrap_or_else(|_| "[]".into());
        let labels_json = serde_json::to_string(&metadata.labels).unwrap_or_else(|_| "{}".into());

        conn.execute(
            "INSERT INTO runs (id, script_name, environment, browser, headless, viewport,
                               tags_json, notes, labels_json, started_at, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                id,
                metadata.script_name,
                metadata.environment,
                metadata.browser,
                metadata.headless,
                metadata.viewport,
                tags_json,
                metadata.notes,
                labels_json,
                format_ts(&started_at),
                RunStatus::Running.as_str(),
            ],
        )?;

        Ok(id)
    }

    /// Close a running run: set status, end time, duration and step totals.
    ///
    /// Returns `Ok(false)` (and logs a warning) when no running run with
    /// that id exists. The end time is clamped to the start time.
    pub fn close_run(
        &self,
        run_id: &str,
        status: RunStatus,
        completed_at: DateTime<Utc>,
        total_duration: Duration,
    ) -> Result<bool, StorageError> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE runs
             SET completed_at = MAX(?2, started_at),
                 total_duration = ?3,
                 status = ?4,
                 total_steps = (SELECT COUNT(*) FROM steps WHERE run_id = ?1),
                 failed_steps = (SELECT COUNT(*) FROM steps
                                 WHERE run_id = ?1 AND status IN ('failed', 'timeout'))
             WHERE id = ?1 AND status = 'running'",
            params![
                run_id,
                format_ts(&completed_at),
                total_duration.as_secs_f64(),
                status.as_str(),
            ],
        )?;

        if changed == 0 {
            warn!(%run_id, "close_run: no running run with this id");
            return Ok(false);
        }
        Ok(true)
    }

    pub fn insert_step(&self, run_id: &str, order: u32, step: &NewStep) -> Result<i64, StorageError> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO steps (run_id, step_order, name, kind, started_at, duration, status,
                                error_message, page_url, element_selector)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                run_id,
                order,
                step.name,
                step.kind.as_str(),
                format_ts(&step.started_at),
                step.duration.as_secs_f64(),
                step.status.as_str(),
                step.error_message,
                step.page_url,
                step.element_selector,
            ],
        )
        .map_err(|e| unknown_parent(e, || StorageError::UnknownRun { run_id: run_id.to_string() }))?;

        Ok(conn.last_insert_rowid())
    }

    pub fn insert_action(
        &self,
        run_id: &str,
        step_id: i64,
        action: &NewAction,
    ) -> Result<i64, StorageError> {
        let conn = self.pool.get()?;
        let owner: Option<String> = conn
            .query_row("SELECT run_id FROM steps WHERE id = ?1", [step_id], |row| row.get(0))
            .optional()?;
        if owner.as_deref() != Some(run_id) {
            return Err(StorageError::UnknownStep { step_id });
        }

        conn.execute(
            "INSERT INTO actions (step_id, run_id, name, started_at, duration, status, target,
                                  value, retry_count, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                step_id,
                run_id,
                action.name,
                format_ts(&action.started_at),
                action.duration.as_secs_f64(),
                action.status.as_str(),
                action.target,
                action.value,
                action.retry_count,
                action.error_message,
            ],
        )?;

        Ok(conn.last_insert_rowid())
    }

    pub fn insert_browser_metric(
        &self,
        run_id: &str,
        metric: &BrowserMetric,
    ) -> Result<i64, StorageError> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO browser_metrics (run_id, recorded_at, page_url, navigation_time,
                                          page_load_time, dom_content_loaded_time,
                                          network_requests, failed_network_requests,
                                          memory_usage_mb)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                run_id,
                format_ts(&model::now()),
                metric.page_url,
                metric.navigation_time,
                metric.page_load_time,
                metric.dom_content_loaded_time,
                metric.network_requests,
                metric.failed_network_requests,
                metric.memory_usage_mb,
            ],
        )
        .map_err(|e| unknown_parent(e, || StorageError::UnknownRun { run_id: run_id.to_string() }))?;

        Ok(conn.last_insert_rowid())
    }

    /// Runs started at or after `since`, newest first.
    pub fn query_runs(
        &self,
        since: DateTime<Utc>,
        script_name: Option<&str>,
    ) -> Result<Vec<Run>, StorageError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM runs
             WHERE started_at >= ?1 AND (?2 IS NULL OR script_name = ?2)
             ORDER BY started_at DESC, rowid DESC"
        ))?;

        let rows = stmt.query_map(params![format_ts(&since), script_name], run_from_row)?;
        let runs = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<Run>, StorageError> {
        let conn = self.pool.get()?;
        let run = conn
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"),
                [run_id],
                run_from_row,
            )
            .optional()?;
        Ok(run)
    }

    /// The most recently started run, if any.
    pub fn latest_run(&self) -> Result<Option<Run>, StorageError> {
        let conn = self.pool.get()?;
        let run = conn
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM runs ORDER BY started_at DESC, rowid DESC LIMIT 1"),
                [],
                run_from_row,
            )
            .optional()?;
        Ok(run)
    }

    /// A run with its steps (recording order), nested actions and browser
    /// metrics. `None` if the run does not exist.
    pub fn query_run_detail(&self, run_id: &str) -> Result<Option<RunDetail>, StorageError> {
        let conn = self.pool.get()?;
        let run = conn
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"),
                [run_id],
                run_from_row,
            )
            .optional()?;
        let Some(run) = run else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(&format!(
            "SELECT {ACTION_COLUMNS} FROM actions WHERE run_id = ?1 ORDER BY id"
        ))?;
        let mut actions_by_step: HashMap<i64, Vec<Action>> = HashMap::new();
        for action in stmt.query_map([run_id], action_from_row)? {
            let action = action?;
            actions_by_step.entry(action.step_id).or_default().push(action);
        }

        let mut stmt = conn.prepare(&format!(
            "SELECT {STEP_COLUMNS} FROM steps WHERE run_id = ?1 ORDER BY step_order, id"
        ))?;
        let steps = stmt
            .query_map([run_id], step_from_row)?
            .map(|step| {
                step.map(|step| StepDetail {
                    actions: actions_by_step.remove(&step.id).unwrap_or_default(),
                    step,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT id, run_id, recorded_at, page_url, navigation_time, page_load_time,
                    dom_content_loaded_time, network_requests, failed_network_requests,
                    memory_usage_mb
             FROM browser_metrics WHERE run_id = ?1 ORDER BY recorded_at, id",
        )?;
        let browser_metrics = stmt
            .query_map([run_id], browser_metric_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(RunDetail {
            run,
            steps,
            browser_metrics,
        }))
    }
}

fn unknown_parent(err: rusqlite::Error, parent: impl FnOnce() -> StorageError) -> StorageError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY =>
        {
            parent()
        }
        _ => StorageError::Sqlite(err),
    }
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

#[derive(Debug)]
struct BadEnum(String);

impl std::fmt::Display for BadEnum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for BadEnum {}

fn ts_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn opt_ts_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| {
        DateTime::parse_from_rfc3339(&t)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, e))
    })
    .transpose()
}

fn enum_at<T: std::str::FromStr<Err = String>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    text.parse().map_err(|e| conversion_error(idx, BadEnum(e)))
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<Run> {
    let tags_json: String = row.get(6)?;
    let labels_json: String = row.get(8)?;
    let tags: Vec<String> = serde_json::from_str(&tags_json).map_err(|e| conversion_error(6, e))?;
    let labels: Labels = serde_json::from_str(&labels_json).map_err(|e| conversion_error(8, e))?;

    Ok(Run {
        id: row.get(0)?,
        metadata: RunMetadata {
            script_name: row.get(1)?,
            environment: row.get(2)?,
            browser: row.get(3)?,
            headless: row.get(4)?,
            viewport: row.get(5)?,
            tags,
            notes: row.get(7)?,
            labels,
        },
        started_at: ts_at(row, 9)?,
        completed_at: opt_ts_at(row, 10)?,
        total_duration: row.get(11)?,
        status: enum_at(row, 12)?,
        total_steps: row.get(13)?,
        failed_steps: row.get(14)?,
    })
}

fn step_from_row(row: &Row<'_>) -> rusqlite::Result<Step> {
    Ok(Step {
        id: row.get(0)?,
        run_id: row.get(1)?,
        order: row.get(2)?,
        name: row.get(3)?,
        kind: enum_at(row, 4)?,
        started_at: ts_at(row, 5)?,
        duration: row.get(6)?,
        status: enum_at(row, 7)?,
        error_message: row.get(8)?,
        page_url: row.get(9)?,
        element_selector: row.get(10)?,
    })
}

fn action_from_row(row: &Row<'_>) -> rusqlite::Result<Action> {
    Ok(Action {
        id: row.get(0)?,
        step_id: row.get(1)?,
        run_id: row.get(2)?,
        name: row.get(3)?,
        started_at: ts_at(row, 4)?,
        duration: row.get(5)?,
        status: enum_at(row, 6)?,
        target: row.get(7)?,
        value: row.get(8)?,
        retry_count: row.get(9)?,
        error_message: row.get(10)?,
    })
}

fn browser_metric_from_row(row: &Row<'_>) -> rusqlite::Result<BrowserMetricRecord> {
    Ok(BrowserMetricRecord {
        id: row.get(0)?,
        run_id: row.get(1)?,
        recorded_at: ts_at(row, 2)?,
        metric: BrowserMetric {
            page_url: row.get(3)?,
            navigation_time: row.get(4)?,
            page_load_time: row.get(5)?,
            dom_content_loaded_time: row.get(6)?,
            network_requests: row.get(7)?,
            failed_network_requests: row.get(8)?,
            memory_usage_mb: row.get(9)?,
        },
    })
}
