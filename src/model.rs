//! Records persisted by the metrics store.
//!
//! A [`Run`] is one top-level automation execution. [`Step`]s, [`Action`]s
//! and [`BrowserMetric`]s hang off a run and are write-once; only the run's
//! closing fields (`completed_at`, `status`, totals) are ever updated.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::error::UsageError;

const MAX_LABEL_KEY_LEN: usize = 64;
const MAX_LABEL_VALUE_LEN: usize = 512;

/// Wall-clock timestamp truncated to the precision the store keeps.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

fn started_before(duration: Duration) -> DateTime<Utc> {
    let end = now();
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| end.checked_sub_signed(d))
        .map(|start| start.trunc_subsecs(6))
        .unwrap_or(end)
}

/// Generates `as_str`, `Display` and `FromStr` for a unit-only status enum.
macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!("unknown {} {:?}", stringify!($name), other)),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Opened and not yet closed. A run left in this state after its process
    /// exited is incomplete, not failed.
    Running,
    Success,
    Failed,
    /// Recorder dropped without an explicit close and without a panic.
    Error,
}

string_enum!(RunStatus {
    Running => "running",
    Success => "success",
    Failed => "failed",
    Error => "error",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Action,
    Navigation,
    Verification,
    Wait,
}

string_enum!(StepKind {
    Action => "action",
    Navigation => "navigation",
    Verification => "verification",
    Wait => "wait",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Failed,
    Timeout,
    Skipped,
}

string_enum!(StepStatus {
    Success => "success",
    Failed => "failed",
    Timeout => "timeout",
    Skipped => "skipped",
});

impl StepStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// String key/value labels attached to a run.
///
/// Keys are 1..=64 characters of ASCII alphanumerics, `_`, `-` or `.`;
/// values are at most 512 bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Labels(BTreeMap<String, String>);

impl Labels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<(), UsageError> {
        let key = key.into();
        let value = value.into();
        validate_label(&key, &value)?;
        self.0.insert(key, value);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl TryFrom<BTreeMap<String, String>> for Labels {
    type Error = UsageError;

    fn try_from(map: BTreeMap<String, String>) -> Result<Self, Self::Error> {
        for (key, value) in &map {
            validate_label(key, value)?;
        }
        Ok(Self(map))
    }
}

fn validate_label(key: &str, value: &str) -> Result<(), UsageError> {
    let reason = if key.is_empty() {
        Some("key is empty")
    } else if key.len() > MAX_LABEL_KEY_LEN {
        Some("key longer than 64 characters")
    } else if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        Some("key may only contain ASCII letters, digits, '_', '-' or '.'")
    } else if value.len() > MAX_LABEL_VALUE_LEN {
        Some("value longer than 512 bytes")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(UsageError::InvalidLabel {
            key: key.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// Descriptive fields supplied when a session opens a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub script_name: String,
    pub environment: Option<String>,
    pub browser: Option<String>,
    pub headless: Option<bool>,
    pub viewport: Option<String>,
    pub tags: Vec<String>,
    pub notes: Option<String>,
    pub labels: Labels,
}

impl RunMetadata {
    pub fn new(script_name: impl Into<String>) -> Self {
        Self {
            script_name: script_name.into(),
            ..Self::default()
        }
    }

    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    pub fn browser(mut self, browser: impl Into<String>) -> Self {
        self.browser = Some(browser.into());
        self
    }

    pub fn headless(mut self, headless: bool) -> Self {
        self.headless = Some(headless);
        self
    }

    pub fn viewport(mut self, viewport: impl Into<String>) -> Self {
        self.viewport = Some(viewport.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Result<Self, UsageError> {
        self.labels.insert(key, value)?;
        Ok(self)
    }
}

/// A persisted automation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    #[serde(flatten)]
    pub metadata: RunMetadata,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_duration: Option<f64>,
    pub status: RunStatus,
    pub total_steps: u32,
    pub failed_steps: u32,
}

impl Run {
    /// True when the run was never closed, e.g. its process crashed.
    pub fn is_incomplete(&self) -> bool {
        self.completed_at.is_none()
    }
}

/// A step ready to be inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewStep {
    pub name: String,
    pub kind: StepKind,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub status: StepStatus,
    pub error_message: Option<String>,
    pub page_url: Option<String>,
    pub element_selector: Option<String>,
}

impl NewStep {
    /// A step that finished just now after running for `duration`.
    pub fn new(name: impl Into<String>, kind: StepKind, duration: Duration, status: StepStatus) -> Self {
        let started_at = started_before(duration);
        Self {
            name: name.into(),
            kind,
            started_at,
            duration,
            status,
            error_message: None,
            page_url: None,
            element_selector: None,
        }
    }

    pub fn error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn page_url(mut self, url: impl Into<String>) -> Self {
        self.page_url = Some(url.into());
        self
    }

    pub fn element_selector(mut self, selector: impl Into<String>) -> Self {
        self.element_selector = Some(selector.into());
        self
    }
}

/// A persisted step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: i64,
    pub run_id: String,
    /// 1-based position in recording order within the run.
    pub order: u32,
    pub name: String,
    pub kind: StepKind,
    pub started_at: DateTime<Utc>,
    pub duration: f64,
    pub status: StepStatus,
    pub error_message: Option<String>,
    pub page_url: Option<String>,
    pub element_selector: Option<String>,
}

/// An action ready to be inserted under a step.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAction {
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub status: StepStatus,
    pub target: Option<String>,
    pub value: Option<String>,
    pub retry_count: u32,
    pub error_message: Option<String>,
}

impl NewAction {
    pub fn new(name: impl Into<String>, duration: Duration, status: StepStatus) -> Self {
        let started_at = started_before(duration);
        Self {
            name: name.into(),
            started_at,
            duration,
            status,
            target: None,
            value: None,
            retry_count: 0,
            error_message: None,
        }
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn retry_count(mut self, retries: u32) -> Self {
        self.retry_count = retries;
        self
    }

    pub fn error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}

/// A persisted action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub id: i64,
    pub step_id: i64,
    pub run_id: String,
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub duration: f64,
    pub status: StepStatus,
    pub target: Option<String>,
    pub value: Option<String>,
    pub retry_count: u32,
    pub error_message: Option<String>,
}

/// Page-level timings sampled from the browser. All fields optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrowserMetric {
    pub page_url: Option<String>,
    pub navigation_time: Option<f64>,
    pub page_load_time: Option<f64>,
    pub dom_content_loaded_time: Option<f64>,
    pub network_requests: Option<u32>,
    pub failed_network_requests: Option<u32>,
    pub memory_usage_mb: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrowserMetricRecord {
    pub id: i64,
    pub run_id: String,
    pub recorded_at: DateTime<Utc>,
    #[serde(flatten)]
    pub metric: BrowserMetric,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDetail {
    #[serde(flatten)]
    pub step: Step,
    pub actions: Vec<Action>,
}

/// A run with everything recorded under it, in recording order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunDetail {
    pub run: Run,
    pub steps: Vec<StepDetail>,
    pub browser_metrics: Vec<BrowserMetricRecord>,
}
