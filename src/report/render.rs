//! Plain-text rendering of reports.

use std::collections::BTreeMap;
use std::fmt::{self, Write};

use chrono::{DateTime, Utc};

use super::{Bottleneck, Summary, Trends};
use crate::model::{Run, RunDetail, RunStatus, StepStatus};

const WIDE: usize = 80;
const NARROW: usize = 62;

fn render(write: impl FnOnce(&mut String) -> fmt::Result) -> String {
    let mut out = String::new();
    // Writing into a String never fails.
    let _ = write(&mut out);
    out
}

fn timestamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn secs(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{:.2}s", v))
}

fn status_icon(status: StepStatus) -> &'static str {
    if status.is_success() {
        "✓"
    } else {
        "✗"
    }
}

fn run_status_label(run: &Run) -> String {
    if run.is_incomplete() {
        "INCOMPLETE".to_string()
    } else {
        run.status.as_str().to_uppercase()
    }
}

/// Console summary across all runs in the window.
pub fn summary(report: &Summary) -> String {
    render(|out| write_summary(out, report))
}

fn write_summary(out: &mut String, report: &Summary) -> fmt::Result {
    let rule = "=".repeat(NARROW);
    writeln!(out, "{rule}")?;
    writeln!(out, "AUTOMATION PERFORMANCE SUMMARY (last {} days)", report.period_days)?;
    writeln!(out, "{rule}")?;
    writeln!(out, "Total Runs:        {}", report.total_runs)?;

    if !report.has_data() {
        writeln!(out, "No data: no runs recorded in this period.")?;
        return Ok(());
    }

    let rate = report
        .success_rate
        .map_or_else(|| "n/a".to_string(), |r| format!("{:.1}%", r));
    writeln!(out, "Successful:        {}", report.successful_runs)?;
    writeln!(out, "Failed:            {}", report.failed_runs)?;
    writeln!(out, "Incomplete:        {}", report.incomplete_runs)?;
    writeln!(out, "Success Rate:      {rate}")?;
    writeln!(out, "Average Duration:  {}", secs(report.avg_duration))?;
    writeln!(out, "Total Steps:       {}", report.total_steps)?;
    writeln!(out, "Mean Step:         {}", secs(report.avg_step_duration))?;
    writeln!(out, "Unique Scripts:    {}", report.unique_scripts)?;
    writeln!(out)?;
    writeln!(out, "Script Performance:")?;
    writeln!(out, "{:<30} {:<8} {:<12} {:<12}", "Name", "Runs", "Avg Duration", "Success Rate")?;
    writeln!(out, "{}", "-".repeat(NARROW))?;
    for script in &report.scripts {
        writeln!(
            out,
            "{:<30} {:<8} {:<12} {:.1}%",
            script.script_name,
            script.run_count,
            secs(script.avg_duration),
            script.success_rate
        )?;
    }
    Ok(())
}

/// Chronological step list for one run, with actions indented under their
/// step.
pub fn detail(detail: &RunDetail) -> String {
    render(|out| write_detail(out, detail))
}

fn write_detail(out: &mut String, detail: &RunDetail) -> fmt::Result {
    let run = &detail.run;
    let meta = &run.metadata;
    let rule = "=".repeat(WIDE);

    writeln!(out, "{rule}")?;
    writeln!(out, "AUTOMATION RUN DETAIL")?;
    writeln!(out, "{rule}")?;
    writeln!(out, "Script Name:      {}", meta.script_name)?;
    writeln!(out, "Run ID:           {}", run.id)?;
    writeln!(out, "Status:           {}", run_status_label(run))?;
    writeln!(out, "Environment:      {}", meta.environment.as_deref().unwrap_or("N/A"))?;
    writeln!(out, "Browser:          {}", meta.browser.as_deref().unwrap_or("N/A"))?;
    if let Some(headless) = meta.headless {
        writeln!(out, "Headless:         {}", headless)?;
    }
    writeln!(out, "Started:          {}", timestamp(&run.started_at))?;
    writeln!(
        out,
        "Completed:        {}",
        run.completed_at
            .as_ref()
            .map_or_else(|| "N/A (incomplete)".to_string(), timestamp)
    )?;
    writeln!(out, "Total Duration:   {}", secs(run.total_duration))?;

    let failed = detail
        .steps
        .iter()
        .filter(|s| matches!(s.step.status, StepStatus::Failed | StepStatus::Timeout))
        .count();
    writeln!(out, "Total Steps:      {}", detail.steps.len())?;
    writeln!(out, "Failed Steps:     {}", failed)?;
    if !meta.tags.is_empty() {
        writeln!(out, "Tags:             {}", meta.tags.join(", "))?;
    }
    if !meta.labels.is_empty() {
        let labels: Vec<String> = meta.labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
        writeln!(out, "Labels:           {}", labels.join(", "))?;
    }
    if let Some(notes) = &meta.notes {
        writeln!(out, "Notes:            {}", notes)?;
    }
    if run.status == RunStatus::Failed {
        if let Some(last) = detail.steps.iter().rev().find(|s| !s.step.status.is_success()) {
            writeln!(out, "Failed In:        [{}] {}", last.step.order, last.step.name)?;
        } else if let Some(last) = detail.steps.last() {
            writeln!(out, "Failed After:     [{}] {}", last.step.order, last.step.name)?;
        } else {
            writeln!(out, "Failed Before:    first step")?;
        }
    }

    writeln!(out)?;
    writeln!(out, "{rule}")?;
    writeln!(out, "STEP BREAKDOWN")?;
    writeln!(out, "{rule}")?;
    if detail.steps.is_empty() {
        writeln!(out, "No steps recorded.")?;
    }
    for entry in &detail.steps {
        let step = &entry.step;
        writeln!(out, "{} [{}] {}", status_icon(step.status), step.order, step.name)?;
        writeln!(
            out,
            "    Type: {} | Duration: {:.2}s | Status: {}",
            step.kind, step.duration, step.status
        )?;
        if let Some(url) = &step.page_url {
            writeln!(out, "    Page: {}", url)?;
        }
        if let Some(selector) = &step.element_selector {
            writeln!(out, "    Element: {}", selector)?;
        }
        if let Some(error) = &step.error_message {
            writeln!(out, "    Error: {}", error)?;
        }
        for action in &entry.actions {
            write!(
                out,
                "      {} {} {:.3}s",
                status_icon(action.status),
                action.name,
                action.duration
            )?;
            if let Some(target) = &action.target {
                write!(out, " -> {}", target)?;
            }
            if action.retry_count > 0 {
                write!(out, " (retries: {})", action.retry_count)?;
            }
            writeln!(out)?;
            if let Some(error) = &action.error_message {
                writeln!(out, "          Error: {}", error)?;
            }
        }
    }

    if !detail.browser_metrics.is_empty() {
        let loads: Vec<f64> = detail
            .browser_metrics
            .iter()
            .filter_map(|m| m.metric.page_load_time)
            .collect();
        writeln!(out)?;
        writeln!(out, "{rule}")?;
        writeln!(out, "BROWSER PERFORMANCE METRICS")?;
        writeln!(out, "{rule}")?;
        writeln!(out, "Samples:              {}", detail.browser_metrics.len())?;
        writeln!(out, "Total Page Loads:     {}", loads.len())?;
        if !loads.is_empty() {
            let avg = loads.iter().sum::<f64>() / loads.len() as f64;
            writeln!(out, "Avg Page Load Time:   {:.2}s", avg)?;
        }
        for record in &detail.browser_metrics {
            let m = &record.metric;
            writeln!(
                out,
                "  {} {} load={} nav={}",
                timestamp(&record.recorded_at),
                m.page_url.as_deref().unwrap_or("-"),
                secs(m.page_load_time),
                secs(m.navigation_time)
            )?;
        }
    }

    // count, total duration, successes
    let mut by_action: BTreeMap<&str, (u32, f64, u32)> = BTreeMap::new();
    for action in detail.steps.iter().flat_map(|s| &s.actions) {
        let entry = by_action.entry(action.name.as_str()).or_default();
        entry.0 += 1;
        entry.1 += action.duration;
        if action.status.is_success() {
            entry.2 += 1;
        }
    }
    if !by_action.is_empty() {
        writeln!(out)?;
        writeln!(out, "{rule}")?;
        writeln!(out, "ACTION METRICS")?;
        writeln!(out, "{rule}")?;
        for (name, (count, total, ok)) in by_action {
            writeln!(
                out,
                "{}: Count: {} | Avg Duration: {:.3}s | Success Rate: {:.1}%",
                name.to_uppercase(),
                count,
                total / f64::from(count),
                f64::from(ok) / f64::from(count) * 100.0
            )?;
        }
    }

    writeln!(out, "{rule}")?;
    Ok(())
}

pub fn bottlenecks(items: &[Bottleneck], min_duration: f64) -> String {
    render(|out| write_bottlenecks(out, items, min_duration))
}

fn write_bottlenecks(out: &mut String, items: &[Bottleneck], min_duration: f64) -> fmt::Result {
    if items.is_empty() {
        writeln!(out, "No steps average {:.2}s or more.", min_duration)?;
        return Ok(());
    }
    writeln!(
        out,
        "{:<32} {:>10} {:>10} {:>8} {:>8}",
        "Step", "Avg", "Max", "Count", "Failed"
    )?;
    writeln!(out, "{}", "-".repeat(72))?;
    for b in items {
        writeln!(
            out,
            "{:<32} {:>9.2}s {:>9.2}s {:>8} {:>8}",
            b.step_name, b.avg_duration, b.max_duration, b.occurrence_count, b.failure_count
        )?;
    }
    Ok(())
}

pub fn trends(report: &Trends) -> String {
    render(|out| write_trends(out, report))
}

fn write_trends(out: &mut String, report: &Trends) -> fmt::Result {
    writeln!(
        out,
        "Trends for '{}' (last {} days)",
        report.script_name, report.period_days
    )?;
    if report.daily.is_empty() {
        writeln!(out, "No runs recorded in this period.")?;
        return Ok(());
    }
    writeln!(out)?;
    writeln!(
        out,
        "{:<12} {:>6} {:>10} {:>10} {:>10} {:>9}",
        "Date", "Runs", "Avg", "Min", "Max", "Success"
    )?;
    for day in &report.daily {
        writeln!(
            out,
            "{:<12} {:>6} {:>10} {:>10} {:>10} {:>8.1}%",
            day.date,
            day.run_count,
            secs(day.avg_duration),
            secs(day.min_duration),
            secs(day.max_duration),
            day.success_rate
        )?;
    }
    if !report.steps.is_empty() {
        writeln!(out)?;
        writeln!(
            out,
            "{:<32} {:>10} {:>10} {:>6} {:>9}",
            "Step", "Avg", "Max", "Runs", "Success"
        )?;
        for step in &report.steps {
            writeln!(
                out,
                "{:<32} {:>9.3}s {:>9.3}s {:>6} {:>8.1}%",
                step.step_name, step.avg_duration, step.max_duration, step.execution_count, step.success_rate
            )?;
        }
    }
    Ok(())
}

/// One line per run, newest first.
pub fn run_list(runs: &[Run]) -> String {
    render(|out| write_run_list(out, runs))
}

fn write_run_list(out: &mut String, runs: &[Run]) -> fmt::Result {
    if runs.is_empty() {
        writeln!(out, "No runs found.")?;
        return Ok(());
    }
    writeln!(
        out,
        "{:<36} | {:<24} | {:<10} | {:<19} | Duration",
        "Run ID", "Script", "Status", "Started"
    )?;
    writeln!(out, "{:-<36}-|-{:-<24}-|-{:-<10}-|-{:-<19}-|-{:-<8}", "", "", "", "", "")?;
    for run in runs {
        writeln!(
            out,
            "{:<36} | {:<24} | {:<10} | {:<19} | {}",
            run.id,
            run.metadata.script_name,
            run_status_label(run),
            timestamp(&run.started_at),
            secs(run.total_duration)
        )?;
    }
    Ok(())
}
