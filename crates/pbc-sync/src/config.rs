//! Run settings (environment) and the YAML target registry.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use pbc_adapters::PageShape;
use pbc_core::{IdentityPolicy, ProductRef};
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::orchestrator::DEFAULT_CONCURRENCY;

/// Pre-flight configuration problems. Nothing is dispatched when one occurs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no targets configured")]
    NoTargets,
    #[error("target `{0}` has no locators")]
    NoLocators(String),
    #[error("target `{target}`: invalid locator {locator:?}: {reason}")]
    InvalidLocator {
        target: String,
        locator: String,
        reason: String,
    },
    #[error("concurrency cap must be at least 1 (got {0})")]
    InvalidConcurrency(usize),
    #[error("invalid {key}: {reason}")]
    InvalidSetting { key: &'static str, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    Parquet,
    Json,
    #[default]
    Both,
}

impl OutputFormat {
    pub fn parquet(&self) -> bool {
        matches!(self, OutputFormat::Parquet | OutputFormat::Both)
    }

    pub fn json(&self) -> bool {
        matches!(self, OutputFormat::Json | OutputFormat::Both)
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "parquet" => Ok(Self::Parquet),
            "json" => Ok(Self::Json),
            "both" => Ok(Self::Both),
            other => Err(format!("unknown output format `{other}`")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunSettings {
    pub output_dir: PathBuf,
    pub output_format: OutputFormat,
    pub concurrency_cap: usize,
    /// Per-fetch limit; `None` lets a slow fetch hold its worker indefinitely.
    pub task_timeout: Option<Duration>,
    pub http_timeout: Duration,
    pub http_retries: usize,
    pub user_agent: String,
    pub identity: IdentityPolicy,
    pub archive_dir: Option<PathBuf>,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./reports"),
            output_format: OutputFormat::default(),
            concurrency_cap: DEFAULT_CONCURRENCY,
            task_timeout: None,
            http_timeout: Duration::from_secs(20),
            http_retries: 0,
            user_agent: "pbc-bot/0.1".to_string(),
            identity: IdentityPolicy::default(),
            archive_dir: None,
        }
    }
}

fn parse_setting<T: FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|e| ConfigError::InvalidSetting {
        key,
        reason: format!("{raw:?}: {e}"),
    })
}

impl RunSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from any key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut settings = Self::default();
        if let Some(v) = lookup("PBC_OUTPUT_DIR") {
            settings.output_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("PBC_OUTPUT_FORMAT") {
            settings.output_format = parse_setting("PBC_OUTPUT_FORMAT", &v)?;
        }
        if let Some(v) = lookup("PBC_CONCURRENCY") {
            settings.concurrency_cap = parse_setting("PBC_CONCURRENCY", &v)?;
        }
        if let Some(v) = lookup("PBC_TASK_TIMEOUT_SECS") {
            let secs = parse_setting("PBC_TASK_TIMEOUT_SECS", &v)?;
            settings.task_timeout = Some(Duration::from_secs(secs));
        }
        if let Some(v) = lookup("PBC_HTTP_TIMEOUT_SECS") {
            let secs = parse_setting("PBC_HTTP_TIMEOUT_SECS", &v)?;
            settings.http_timeout = Duration::from_secs(secs);
        }
        if let Some(v) = lookup("PBC_HTTP_RETRIES") {
            settings.http_retries = parse_setting("PBC_HTTP_RETRIES", &v)?;
        }
        if let Some(v) = lookup("PBC_USER_AGENT") {
            settings.user_agent = v;
        }
        if let Some(v) = lookup("PBC_IDENTITY") {
            settings.identity = parse_setting("PBC_IDENTITY", &v)?;
        }
        if let Some(v) = lookup("PBC_ARCHIVE_DIR") {
            settings.archive_dir = Some(PathBuf::from(v));
        }
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency_cap == 0 {
            return Err(ConfigError::InvalidConcurrency(self.concurrency_cap));
        }
        if self.task_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::InvalidSetting {
                key: "PBC_TASK_TIMEOUT_SECS",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// One comparison target: a set of locators reconciled into one table.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TargetConfig {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub shape: PageShape,
    pub locators: Vec<String>,
    /// Overrides the expected product set reported by the pages.
    #[serde(default)]
    pub expected_products: Option<Vec<ProductRef>>,
}

impl TargetConfig {
    pub fn new(shape: PageShape, locators: Vec<String>) -> Self {
        Self {
            title: None,
            shape,
            locators,
            expected_products: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Title when configured, else the first locator.
    pub fn label(&self) -> String {
        self.title
            .clone()
            .or_else(|| self.locators.first().cloned())
            .unwrap_or_else(|| "untitled".to_string())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.locators.is_empty() {
            return Err(ConfigError::NoLocators(self.label()));
        }
        for locator in &self.locators {
            validate_locator(locator).map_err(|reason| ConfigError::InvalidLocator {
                target: self.label(),
                locator: locator.clone(),
                reason,
            })?;
        }
        Ok(())
    }
}

fn validate_locator(locator: &str) -> Result<(), String> {
    let url = Url::parse(locator.trim()).map_err(|e| e.to_string())?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some_and(|h| !h.is_empty()) => Ok(()),
        "http" | "https" => Err("missing host".to_string()),
        "file" => Ok(()),
        other => Err(format!("unsupported scheme `{other}`")),
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TargetRegistry {
    pub targets: Vec<TargetConfig>,
}

impl TargetRegistry {
    pub fn single(target: TargetConfig) -> Self {
        Self {
            targets: vec![target],
        }
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.targets.is_empty() {
            return Err(ConfigError::NoTargets);
        }
        self.targets.iter().try_for_each(TargetConfig::validate)
    }
}
