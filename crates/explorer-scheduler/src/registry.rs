//! Job registry: execution status of maintenance jobs.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Result of a job execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobResult {
    /// Job completed; carries a one-line summary
    Success(String),
    /// Job failed with an error message
    Failed(String),
    /// Tick skipped because the previous run was still active
    Skipped(String),
}

/// Status of a registered job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_name: String,
    pub cron_expr: String,
    /// When the job last finished (if ever)
    pub last_run: Option<DateTime<Utc>>,
    pub last_duration_ms: Option<u64>,
    pub last_result: Option<JobResult>,
    pub run_count: u64,
    pub error_count: u64,
    pub is_running: bool,
}

impl JobStatus {
    pub fn new(job_name: String, cron_expr: String) -> Self {
        Self {
            job_name,
            cron_expr,
            last_run: None,
            last_duration_ms: None,
            last_result: None,
            run_count: 0,
            error_count: 0,
            is_running: false,
        }
    }
}

/// Thread-safe job status table.
///
/// ```
/// use explorer_scheduler::{JobRegistry, JobResult};
///
/// let registry = JobRegistry::new();
/// registry.register("queue_purge", "0 0 3 * * *");
///
/// registry.record_start("queue_purge");
/// assert!(registry.is_running("queue_purge"));
///
/// registry.record_complete("queue_purge", JobResult::Success("purged 4".into()), 12);
/// assert!(!registry.is_running("queue_purge"));
/// ```
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<String, JobStatus>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job, replacing any previous entry of the same name.
    pub fn register(&self, job_name: &str, cron_expr: &str) {
        self.jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                job_name.to_string(),
                JobStatus::new(job_name.to_string(), cron_expr.to_string()),
            );
    }

    pub fn record_start(&self, job_name: &str) {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(status) = jobs.get_mut(job_name) {
            status.is_running = true;
        }
    }

    /// Record a finished run. Skips count as runs but not as errors.
    pub fn record_complete(&self, job_name: &str, result: JobResult, duration_ms: u64) {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(status) = jobs.get_mut(job_name) {
            if !matches!(result, JobResult::Skipped(_)) {
                status.is_running = false;
            }
            status.last_run = Some(Utc::now());
            status.last_duration_ms = Some(duration_ms);
            status.run_count += 1;
            if matches!(result, JobResult::Failed(_)) {
                status.error_count += 1;
            }
            status.last_result = Some(result);
        }
    }

    pub fn get_status(&self, job_name: &str) -> Option<JobStatus> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_name)
            .cloned()
    }

    /// All jobs, sorted by name.
    pub fn get_all_status(&self) -> Vec<JobStatus> {
        let mut all: Vec<JobStatus> = self
            .jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.job_name.cmp(&b.job_name));
        all
    }

    pub fn is_running(&self, job_name: &str) -> bool {
        self.get_status(job_name)
            .map(|s| s.is_running)
            .unwrap_or(false)
    }

    pub fn job_count(&self) -> usize {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
