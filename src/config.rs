//! TOML configuration with environment overrides.
//!
//! Lookup order for the file: explicit path, `AUTOPERF_CONFIG`,
//! `./autoperf.toml`, compiled-in defaults. Environment variables
//! (`AUTOPERF_DB`, `ENV`, `BROWSER_TYPE`, `HEADLESS`, `LOG_LEVEL`) are
//! applied on top of whatever was loaded.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::ConfigError;
use crate::model::RunMetadata;

pub const CONFIG_ENV: &str = "AUTOPERF_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "autoperf.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AutoperfConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AutoperfConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Resolve the configuration file and apply environment overrides.
    ///
    /// An explicit path must load; the env var and default file fall
    /// through to defaults with a warning when unreadable.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match explicit {
            Some(path) => Self::load(path)?,
            None => Self::load_or_default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "AUTOPERF_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let local = Path::new(DEFAULT_CONFIG_FILE);
        if local.exists() {
            match Self::load(local) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %local.display(),
                        error = %e,
                        "config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Apply overrides from `lookup` (normally the process environment).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup("AUTOPERF_DB") {
            self.store.path = PathBuf::from(path);
        }
        if let Some(env) = lookup("ENV") {
            self.session.environment = env;
        }
        if let Some(browser) = lookup("BROWSER_TYPE") {
            self.session.browser = browser;
        }
        if let Some(raw) = lookup("HEADLESS") {
            match parse_bool(&raw) {
                Some(headless) => self.session.headless = Some(headless),
                None => warn!(value = %raw, "ignoring HEADLESS: not a boolean"),
            }
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.logging.level = level.to_ascii_lowercase();
        }
    }

    /// Run metadata for `script_name` seeded from the session defaults.
    pub fn run_metadata(&self, script_name: impl Into<String>) -> RunMetadata {
        let mut metadata = RunMetadata::new(script_name)
            .environment(self.session.environment.clone())
            .browser(self.session.browser.clone());
        metadata.headless = self.session.headless;
        metadata.viewport = self.session.viewport.clone();
        metadata
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite file holding runs, steps, actions and browser metrics.
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/performance.db"),
        }
    }
}

/// Defaults for runs opened from the command line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub environment: String,
    pub browser: String,
    pub headless: Option<bool>,
    /// e.g. `"1920x1080"`
    pub viewport: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            environment: "dev".to_string(),
            browser: "chromium".to_string(),
            headless: None,
            viewport: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub default_days: u32,
    pub bottleneck_threshold_secs: f64,
    pub trend_days: u32,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            default_days: 7,
            bottleneck_threshold_secs: 5.0,
            trend_days: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = AutoperfConfig::default();
        assert_eq!(config.store.path, PathBuf::from("data/performance.db"));
        assert_eq!(config.session.environment, "dev");
        assert_eq!(config.report.bottleneck_threshold_secs, 5.0);
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("autoperf.toml");
        std::fs::write(
            &path,
            r#"
            [store]
            path = "/var/lib/autoperf/perf.db"

            [logging]
            format = "json"
            "#,
        )
        .unwrap();

        let config = AutoperfConfig::load(&path).unwrap();
        assert_eq!(config.store.path, PathBuf::from("/var/lib/autoperf/perf.db"));
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.report.default_days, 7);
    }

    #[test]
    fn test_invalid_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[report]\ndefault_days = \"seven\"\n").unwrap();
        assert!(matches!(AutoperfConfig::load(&path), Err(ConfigError::Parse { .. })));
        assert!(matches!(
            AutoperfConfig::load(&dir.path().join("missing.toml")),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("AUTOPERF_DB", "/tmp/perf.db"),
            ("ENV", "prod"),
            ("BROWSER_TYPE", "firefox"),
            ("HEADLESS", "true"),
            ("LOG_LEVEL", "DEBUG"),
        ]
        .into_iter()
        .collect();

        let mut config = AutoperfConfig::default();
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.store.path, PathBuf::from("/tmp/perf.db"));
        assert_eq!(config.session.environment, "prod");
        assert_eq!(config.session.browser, "firefox");
        assert_eq!(config.session.headless, Some(true));
        assert_eq!(config.logging.level, "debug");

        let meta = config.run_metadata("create_merchant");
        assert_eq!(meta.environment.as_deref(), Some("prod"));
        assert_eq!(meta.headless, Some(true));
    }

    #[test]
    fn test_bad_headless_is_ignored() {
        let mut config = AutoperfConfig::default();
        config.apply_env(|key| (key == "HEADLESS").then(|| "maybe".to_string()));
        assert_eq!(config.session.headless, None);
    }
}
