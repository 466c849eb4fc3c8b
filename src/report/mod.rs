//! Report generation over the metrics store.
//!
//! Each report exists as a serializable data structure (used for JSON
//! export) and as rendered text (see [`render`]). Storage errors raised here
//! propagate to the caller; there is no automation to protect.

pub mod render;

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Serialize;
use tracing::info;

use crate::error::{ReportError, StorageError};
use crate::model::{self, Run, RunDetail};
use crate::storage::{format_ts, MetricsStore};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScriptStats {
    pub script_name: String,
    pub run_count: u32,
    pub avg_duration: Option<f64>,
    pub success_rate: f64,
}

/// Aggregate statistics over every run in a window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub period_days: u32,
    pub generated_at: DateTime<Utc>,
    pub total_runs: u32,
    pub successful_runs: u32,
    pub failed_runs: u32,
    pub incomplete_runs: u32,
    /// Percentage of successful runs, one decimal. `None` for an empty window.
    pub success_rate: Option<f64>,
    /// Mean duration of closed runs.
    pub avg_duration: Option<f64>,
    pub total_steps: u32,
    pub avg_step_duration: Option<f64>,
    pub unique_scripts: u32,
    pub scripts: Vec<ScriptStats>,
}

impl Summary {
    pub fn has_data(&self) -> bool {
        self.total_runs > 0
    }
}

/// A step name whose mean duration meets the bottleneck threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bottleneck {
    pub step_name: String,
    pub avg_duration: f64,
    pub max_duration: f64,
    pub occurrence_count: u32,
    pub failure_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyTrend {
    pub date: String,
    pub run_count: u32,
    pub avg_duration: Option<f64>,
    pub min_duration: Option<f64>,
    pub max_duration: Option<f64>,
    pub success_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepTrend {
    pub step_name: String,
    pub avg_duration: f64,
    pub max_duration: f64,
    pub execution_count: u32,
    pub success_rate: f64,
}

/// Per-day and per-step history for one script.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trends {
    pub script_name: String,
    pub period_days: u32,
    pub daily: Vec<DailyTrend>,
    pub steps: Vec<StepTrend>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Text,
    Json,
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "txt" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("unsupported export format '{}' (expected text or json)", other)),
        }
    }
}

/// Summary export: the aggregate, the runs behind it and its bottlenecks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryExport {
    #[serde(flatten)]
    pub summary: Summary,
    pub recent_runs: Vec<Run>,
    pub bottlenecks: Vec<Bottleneck>,
}

/// What to export.
#[derive(Debug, Clone, PartialEq)]
pub enum ExportKind {
    /// Summary of the last `days` days, with steps averaging at least
    /// `min_duration` seconds listed as bottlenecks.
    Summary { days: u32, min_duration: f64 },
    /// A single run; the latest one when `run_id` is `None`.
    Detail { run_id: Option<String> },
}

pub(crate) fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

fn percentage(part: u32, whole: u32) -> f64 {
    if whole == 0 {
        0.0
    } else {
        round_to(f64::from(part) / f64::from(whole) * 100.0, 1)
    }
}

/// Start of a window of `days` days ending now. Windows reaching past the
/// epoch start at the epoch, which keeps stored timestamps comparable.
fn window_start(days: u32) -> DateTime<Utc> {
    chrono::Duration::try_days(i64::from(days))
        .and_then(|span| model::now().checked_sub_signed(span))
        .filter(|start| *start > DateTime::<Utc>::UNIX_EPOCH)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Reads the metrics store and produces reports.
pub struct ReportGenerator {
    store: MetricsStore,
}

impl ReportGenerator {
    pub fn new(store: MetricsStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &MetricsStore {
        &self.store
    }

    /// Runs of the last `days` days, newest first.
    pub fn recent_runs(&self, days: u32, script_name: Option<&str>) -> Result<Vec<Run>, ReportError> {
        info!(days, script = script_name.unwrap_or("*"), "listing recent runs");
        Ok(self.store.query_runs(window_start(days), script_name)?)
    }

    /// Aggregate statistics over runs started in the last `days` days.
    pub fn summarize(&self, days: u32) -> Result<Summary, ReportError> {
        info!(days, "generating summary report");
        let since = format_ts(&window_start(days));
        let conn = self.store.pool().get().map_err(StorageError::from)?;

        let (total_runs, successful_runs, failed_runs, incomplete_runs, avg_duration, unique_scripts) =
            conn.query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(status = 'success'), 0),
                        COALESCE(SUM(status IN ('failed', 'error')), 0),
                        COALESCE(SUM(completed_at IS NULL), 0),
                        AVG(total_duration),
                        COUNT(DISTINCT script_name)
                 FROM runs WHERE started_at >= ?1",
                [&since],
                |row| {
                    Ok((
                        row.get::<_, u32>(0)?,
                        row.get::<_, u32>(1)?,
                        row.get::<_, u32>(2)?,
                        row.get::<_, u32>(3)?,
                        row.get::<_, Option<f64>>(4)?,
                        row.get::<_, u32>(5)?,
                    ))
                },
            )
            .map_err(StorageError::from)?;

        let (total_steps, avg_step_duration) = conn
            .query_row(
                "SELECT COUNT(*), AVG(s.duration)
                 FROM steps s JOIN runs r ON s.run_id = r.id
                 WHERE r.started_at >= ?1",
                [&since],
                |row| Ok((row.get::<_, u32>(0)?, row.get::<_, Option<f64>>(1)?)),
            )
            .map_err(StorageError::from)?;

        let mut stmt = conn
            .prepare(
                "SELECT script_name, COUNT(*), AVG(total_duration), SUM(status = 'success')
                 FROM runs WHERE started_at >= ?1
                 GROUP BY script_name
                 ORDER BY COUNT(*) DESC, script_name",
            )
            .map_err(StorageError::from)?;
        let scripts = stmt
            .query_map([&since], |row| {
                let run_count: u32 = row.get(1)?;
                let successes: u32 = row.get(3)?;
                Ok(ScriptStats {
                    script_name: row.get(0)?,
                    run_count,
                    avg_duration: row.get::<_, Option<f64>>(2)?.map(|d| round_to(d, 3)),
                    success_rate: percentage(successes, run_count),
                })
            })
            .map_err(StorageError::from)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StorageError::from)?;

        Ok(Summary {
            period_days: days,
            generated_at: model::now(),
            total_runs,
            successful_runs,
            failed_runs,
            incomplete_runs,
            success_rate: (total_runs > 0).then(|| percentage(successful_runs, total_runs)),
            avg_duration: avg_duration.map(|d| round_to(d, 3)),
            total_steps,
            avg_step_duration: avg_step_duration.map(|d| round_to(d, 3)),
            unique_scripts,
            scripts,
        })
    }

    /// Rendered summary for the last `days` days.
    pub fn summary(&self, days: u32) -> Result<String, ReportError> {
        Ok(render::summary(&self.summarize(days)?))
    }

    /// Full detail for `run_id`, or for the latest run when `None`.
    pub fn run_detail(&self, run_id: Option<&str>) -> Result<RunDetail, ReportError> {
        let run_id = match run_id {
            Some(id) => id.to_string(),
            None => self.store.latest_run()?.ok_or(ReportError::NoRuns)?.id,
        };
        info!(%run_id, "generating run detail report");
        self.store
            .query_run_detail(&run_id)?
            .ok_or(ReportError::RunNotFound { run_id })
    }

    /// Rendered chronological step list for one run.
    pub fn detail(&self, run_id: Option<&str>) -> Result<String, ReportError> {
        Ok(render::detail(&self.run_detail(run_id)?))
    }

    /// Step names whose mean duration over the window is at least
    /// `min_duration` seconds, slowest first.
    pub fn bottlenecks(
        &self,
        days: u32,
        min_duration: f64,
        script_name: Option<&str>,
    ) -> Result<Vec<Bottleneck>, ReportError> {
        info!(days, min_duration, script = script_name.unwrap_or("*"), "identifying bottlenecks");
        let conn = self.store.pool().get().map_err(StorageError::from)?;
        let mut stmt = conn
            .prepare(
                "SELECT s.name, AVG(s.duration), MAX(s.duration), COUNT(*),
                        SUM(s.status IN ('failed', 'timeout'))
                 FROM steps s JOIN runs r ON s.run_id = r.id
                 WHERE r.started_at >= ?1 AND (?2 IS NULL OR r.script_name = ?2)
                 GROUP BY s.name
                 HAVING AVG(s.duration) >= ?3
                 ORDER BY AVG(s.duration) DESC, s.name",
            )
            .map_err(StorageError::from)?;

        let rows = stmt
            .query_map(
                params![format_ts(&window_start(days)), script_name, min_duration],
                |row| {
                    Ok(Bottleneck {
                        step_name: row.get(0)?,
                        avg_duration: round_to(row.get(1)?, 3),
                        max_duration: round_to(row.get(2)?, 3),
                        occurrence_count: row.get(3)?,
                        failure_count: row.get(4)?,
                    })
                },
            )
            .map_err(StorageError::from)?;

        Ok(rows.collect::<Result<Vec<_>, _>>().map_err(StorageError::from)?)
    }

    /// Daily and per-step trends for one script.
    pub fn trends(&self, script_name: &str, days: u32) -> Result<Trends, ReportError> {
        info!(script = %script_name, days, "analyzing trends");
        let since = format_ts(&window_start(days));
        let conn = self.store.pool().get().map_err(StorageError::from)?;

        let mut stmt = conn
            .prepare(
                "SELECT substr(started_at, 1, 10) AS day, COUNT(*),
                        AVG(total_duration), MIN(total_duration), MAX(total_duration),
                        SUM(status = 'success')
                 FROM runs
                 WHERE script_name = ?1 AND started_at >= ?2
                 GROUP BY day
                 ORDER BY day",
            )
            .map_err(StorageError::from)?;
        let daily = stmt
            .query_map(params![script_name, since], |row| {
                let run_count: u32 = row.get(1)?;
                let successes: u32 = row.get(5)?;
                Ok(DailyTrend {
                    date: row.get(0)?,
                    run_count,
                    avg_duration: row.get::<_, Option<f64>>(2)?.map(|d| round_to(d, 2)),
                    min_duration: row.get::<_, Option<f64>>(3)?.map(|d| round_to(d, 2)),
                    max_duration: row.get::<_, Option<f64>>(4)?.map(|d| round_to(d, 2)),
                    success_rate: percentage(successes, run_count),
                })
            })
            .map_err(StorageError::from)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StorageError::from)?;

        let mut stmt = conn
            .prepare(
                "SELECT s.name, AVG(s.duration), MAX(s.duration), COUNT(*),
                        SUM(s.status = 'success')
                 FROM steps s JOIN runs r ON s.run_id = r.id
                 WHERE r.script_name = ?1 AND r.started_at >= ?2
                 GROUP BY s.name
                 ORDER BY AVG(s.duration) DESC, s.name",
            )
            .map_err(StorageError::from)?;
        let steps = stmt
            .query_map(params![script_name, since], |row| {
                let execution_count: u32 = row.get(3)?;
                let successes: u32 = row.get(4)?;
                Ok(StepTrend {
                    step_name: row.get(0)?,
                    avg_duration: round_to(row.get(1)?, 3),
                    max_duration: round_to(row.get(2)?, 3),
                    execution_count,
                    success_rate: percentage(successes, execution_count),
                })
            })
            .map_err(StorageError::from)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StorageError::from)?;

        Ok(Trends {
            script_name: script_name.to_string(),
            period_days: days,
            daily,
            steps,
        })
    }

    /// Summary, recent runs and bottlenecks for one window.
    pub fn summary_export(&self, days: u32, min_duration: f64) -> Result<SummaryExport, ReportError> {
        Ok(SummaryExport {
            summary: self.summarize(days)?,
            recent_runs: self.recent_runs(days, None)?,
            bottlenecks: self.bottlenecks(days, min_duration, None)?,
        })
    }

    /// Write a summary or detail report to `path` as text or JSON.
    pub fn export(&self, path: &Path, kind: &ExportKind, format: ExportFormat) -> Result<(), ReportError> {
        let body = match (kind, format) {
            (ExportKind::Summary { days, min_duration }, ExportFormat::Text) => {
                let export = self.summary_export(*days, *min_duration)?;
                format!(
                    "{}\nRecent Runs:\n{}\nBottlenecks:\n{}",
                    render::summary(&export.summary),
                    render::run_list(&export.recent_runs),
                    render::bottlenecks(&export.bottlenecks, *min_duration)
                )
            }
            (ExportKind::Summary { days, min_duration }, ExportFormat::Json) => {
                serde_json::to_string_pretty(&self.summary_export(*days, *min_duration)?)?
            }
            (ExportKind::Detail { run_id }, ExportFormat::Text) => self.detail(run_id.as_deref())?,
            (ExportKind::Detail { run_id }, ExportFormat::Json) => {
                serde_json::to_string_pretty(&self.run_detail(run_id.as_deref())?)?
            }
        };

        let io_err = |source| ReportError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        std::fs::write(path, body).map_err(io_err)?;

        info!(path = %path.display(), ?format, ?kind, "report exported");
        Ok(())
    }
}
