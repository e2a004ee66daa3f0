use std::{io, path::Path, time::Duration};

use anyhow::{ensure, Context, Result};
use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{classify::ClassificationRule, storage::retry::RetryPolicy};

pub const CONFIG_FILE: &str = "config.toml";

/// Upper bound for every interval and timeout in seconds. Keeps derived durations far away from
/// overflow.
const MAX_SECONDS: u64 = 30 * 24 * 60 * 60;
const MAX_MILLIS: u64 = MAX_SECONDS * 1000;
const MAX_GAP_TOLERANCE_FACTOR: u32 = 1000;
const MAX_RETRY_ATTEMPTS: u32 = 100;

/// Runtime configuration of the daemon. Every field has a default, so an empty or missing file is
/// a valid configuration. Re-read on SIGHUP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrackerConfig {
    pub tick_interval_ms: u64,
    /// No distinguishing signal for this long seals the open span.
    pub idle_threshold_seconds: u64,
    /// No distinguishing signal for this long ends the session.
    pub session_timeout_seconds: u64,
    /// A tick arriving later than this many intervals after the previous one is treated as a
    /// suspension.
    pub gap_tolerance_factor: u32,
    pub checkpoint_interval_seconds: u64,
    /// Sessions only start automatically from this UTC hour on.
    pub work_start_hour: u32,
    /// Sessions end once ticks reach this UTC hour. 24 means midnight.
    pub work_end_hour: u32,
    pub shutdown_grace_seconds: u64,
    pub probe_timeout_ms: u64,
    pub classify_timeout_ms: u64,
    pub excluded_apps: Vec<String>,
    pub store: StoreConfig,
    pub rules: Vec<ClassificationRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub call_timeout_ms: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            idle_threshold_seconds: 300,
            session_timeout_seconds: 1800,
            gap_tolerance_factor: 2,
            checkpoint_interval_seconds: 30,
            work_start_hour: 0,
            work_end_hour: 24,
            shutdown_grace_seconds: 5,
            probe_timeout_ms: 500,
            classify_timeout_ms: 5000,
            excluded_apps: vec![],
            store: StoreConfig::default(),
            rules: vec![],
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_base_delay_ms: 50,
            retry_max_delay_ms: 1000,
            call_timeout_ms: 2000,
        }
    }
}

impl TrackerConfig {
    /// Reads the configuration from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("No configuration at {path:?}, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to read {path:?}")),
        };
        let config: Self =
            toml::from_str(&text).with_context(|| format!("Failed to parse {path:?}"))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        ensure!(self.tick_interval_ms > 0, "tick_interval_ms must be positive");
        ensure!(
            (1..=MAX_GAP_TOLERANCE_FACTOR).contains(&self.gap_tolerance_factor),
            "gap_tolerance_factor must be between 1 and {MAX_GAP_TOLERANCE_FACTOR}"
        );
        ensure!(
            self.session_timeout_seconds >= self.idle_threshold_seconds,
            "session_timeout_seconds can't be shorter than idle_threshold_seconds"
        );
        for (name, value) in [
            ("idle_threshold_seconds", self.idle_threshold_seconds),
            ("session_timeout_seconds", self.session_timeout_seconds),
            ("checkpoint_interval_seconds", self.checkpoint_interval_seconds),
            ("shutdown_grace_seconds", self.shutdown_grace_seconds),
        ] {
            ensure!(value <= MAX_SECONDS, "{name} can't exceed {MAX_SECONDS}");
        }
        for (name, value) in [
            ("tick_interval_ms", self.tick_interval_ms),
            ("probe_timeout_ms", self.probe_timeout_ms),
            ("classify_timeout_ms", self.classify_timeout_ms),
            ("store.retry_base_delay_ms", self.store.retry_base_delay_ms),
            ("store.retry_max_delay_ms", self.store.retry_max_delay_ms),
            ("store.call_timeout_ms", self.store.call_timeout_ms),
        ] {
            ensure!(value <= MAX_MILLIS, "{name} can't exceed {MAX_MILLIS}");
        }
        ensure!(
            self.store.retry_attempts <= MAX_RETRY_ATTEMPTS,
            "store.retry_attempts can't exceed {MAX_RETRY_ATTEMPTS}"
        );
        ensure!(
            self.work_start_hour < self.work_end_hour && self.work_end_hour <= 24,
            "work hours must satisfy work_start_hour < work_end_hour <= 24"
        );
        Ok(())
    }

    /// Whether `at` falls inside the configured work hours.
    pub fn within_work_hours(&self, at: DateTime<Utc>) -> bool {
        (self.work_start_hour..self.work_end_hour).contains(&at.hour())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn idle_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.idle_threshold_seconds as i64)
    }

    pub fn session_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.session_timeout_seconds as i64)
    }

    /// Largest wall-clock delta between two ticks that still counts as continuous sampling.
    pub fn gap_tolerance(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(
            (self.tick_interval_ms * u64::from(self.gap_tolerance_factor)) as i64,
        )
    }

    pub fn checkpoint_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.checkpoint_interval_seconds as i64)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn classify_timeout(&self) -> Duration {
        Duration::from_millis(self.classify_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.store.retry_attempts.max(1),
            base_delay: Duration::from_millis(self.store.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.store.retry_max_delay_ms),
            call_timeout: Duration::from_millis(self.store.call_timeout_ms),
        }
    }

    /// Privacy filter. Matches case-insensitively in both directions so that `firefox` excludes
    /// `/usr/lib/firefox/firefox` and a full path excludes its short name.
    pub fn is_excluded(&self, app_name: &str) -> bool {
        if app_name.is_empty() {
            return false;
        }
        let app_name = app_name.to_lowercase();
        self.excluded_apps.iter().any(|excluded| {
            let excluded = excluded.to_lowercase();
            !excluded.is_empty() && (app_name.contains(&excluded) || excluded.contains(&app_name))
        })
    }
}
