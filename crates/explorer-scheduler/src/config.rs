//! Scheduler configuration.
//!
//! Runtime views of the `ingest` and `maintenance` settings sections.

use std::time::Duration;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use explorer_types::{IngestSettings, MaintenanceSettings};

use crate::SchedulerError;

/// Batch and backoff parameters for the ingestion loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    /// Upper bound on events fetched per cycle
    pub batch_size: usize,

    /// Attempts before an event is dropped and escalated
    pub max_attempt: u32,

    /// Delay before polling again after a cycle with nothing left to do
    pub max_idle_delay: Duration,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self::from(&IngestSettings::default())
    }
}

impl From<&IngestSettings> for IngestionConfig {
    fn from(settings: &IngestSettings) -> Self {
        Self {
            batch_size: settings.batch_size.max(1),
            max_attempt: settings.max_attempt.max(1),
            max_idle_delay: Duration::from_millis(settings.max_idle_delay_ms),
        }
    }
}

impl IngestionConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_max_attempt(mut self, max_attempt: u32) -> Self {
        self.max_attempt = max_attempt.max(1);
        self
    }

    pub fn with_max_idle_delay(mut self, delay: Duration) -> Self {
        self.max_idle_delay = delay;
        self
    }
}

/// Configuration for the maintenance cron scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Default timezone for jobs (IANA timezone string).
    #[serde(default = "default_timezone")]
    pub default_timezone: String,

    /// Seconds to wait for running jobs during shutdown.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_shutdown_timeout() -> u64 {
    5
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            default_timezone: default_timezone(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl From<&MaintenanceSettings> for MaintenanceConfig {
    fn from(settings: &MaintenanceSettings) -> Self {
        Self {
            default_timezone: settings.timezone.clone(),
            ..Default::default()
        }
    }
}

impl MaintenanceConfig {
    /// Parse the configured timezone.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::InvalidTimezone` if the string is not an
    /// IANA timezone identifier.
    pub fn parse_timezone(&self) -> Result<Tz, SchedulerError> {
        self.default_timezone
            .parse::<Tz>()
            .map_err(|_| SchedulerError::InvalidTimezone(self.default_timezone.clone()))
    }
}
