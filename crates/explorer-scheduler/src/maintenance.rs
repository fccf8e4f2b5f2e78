//! Cron-driven queue maintenance.
//!
//! A thin lifecycle wrapper around `tokio-cron-scheduler`. Every job
//! registered through [`MaintenanceScheduler::register_job`] skips a tick
//! while its previous run is still active and records each run in the
//! shared [`JobRegistry`].

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono_tz::Tz;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::overlap::OverlapGuard;
use crate::registry::{JobRegistry, JobResult};
use crate::{MaintenanceConfig, SchedulerError};

/// Validate a 6-field cron expression (`sec min hour day month weekday`).
///
/// ```
/// use explorer_scheduler::validate_cron_expression;
///
/// assert!(validate_cron_expression("0 */5 * * * *").is_ok());
/// assert!(validate_cron_expression("every day").is_err());
/// ```
pub fn validate_cron_expression(expr: &str) -> Result<(), SchedulerError> {
    Job::new_async(expr, |_uuid, _lock| Box::pin(async {}))
        .map(|_| ())
        .map_err(|e| SchedulerError::InvalidCron(format!("'{}': {}", expr, e)))
}

/// Lifecycle owner of the maintenance jobs.
pub struct MaintenanceScheduler {
    scheduler: JobScheduler,
    config: MaintenanceConfig,
    registry: Arc<JobRegistry>,
    shutdown_token: CancellationToken,
    is_running: AtomicBool,
}

impl MaintenanceScheduler {
    /// Create a stopped scheduler. The default timezone is validated here.
    pub async fn new(config: MaintenanceConfig) -> Result<Self, SchedulerError> {
        config.parse_timezone()?;
        let scheduler = JobScheduler::new().await?;

        Ok(Self {
            scheduler,
            config,
            registry: Arc::new(JobRegistry::new()),
            shutdown_token: CancellationToken::new(),
            is_running: AtomicBool::new(false),
        })
    }

    pub async fn start(&self) -> Result<(), SchedulerError> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }
        self.scheduler.start().await?;
        info!(jobs = self.registry.job_count(), "Maintenance scheduler started");
        Ok(())
    }

    /// Cancel running jobs, wait for them up to the configured timeout, then
    /// stop the scheduler.
    pub async fn shutdown(&mut self) -> Result<(), SchedulerError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(SchedulerError::NotRunning);
        }
        info!("Initiating maintenance scheduler shutdown");
        self.shutdown_token.cancel();

        let deadline = Instant::now() + Duration::from_secs(self.config.shutdown_timeout_secs);
        while self.registry.get_all_status().iter().any(|s| s.is_running) {
            if Instant::now() >= deadline {
                warn!("Maintenance jobs still running at shutdown deadline");
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        if let Err(e) = self.scheduler.shutdown().await {
            warn!(error = %e, "Error during maintenance scheduler shutdown");
        }
        self.is_running.store(false, Ordering::SeqCst);
        info!("Maintenance scheduler stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn registry(&self) -> Arc<JobRegistry> {
        self.registry.clone()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn parse_timezone(tz_str: &str) -> Result<Tz, SchedulerError> {
        tz_str
            .parse()
            .map_err(|_| SchedulerError::InvalidTimezone(tz_str.to_string()))
    }

    /// Register a cron job.
    ///
    /// The job returns a one-line summary on success or an error message.
    /// A tick arriving while the previous run is active, or after shutdown
    /// began, is recorded as skipped.
    pub async fn register_job<F, Fut>(
        &self,
        name: &str,
        cron_expr: &str,
        timezone: Option<&str>,
        job_fn: F,
    ) -> Result<uuid::Uuid, SchedulerError>
    where
        F: Fn() -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send,
    {
        let tz: Tz = match timezone {
            Some(tz_str) => Self::parse_timezone(tz_str)?,
            None => self.config.parse_timezone()?,
        };
        validate_cron_expression(cron_expr)?;

        self.registry.register(name, cron_expr);
        let guard = OverlapGuard::new();
        let registry = self.registry.clone();
        let shutdown_token = self.shutdown_token.clone();
        let job_name = name.to_string();

        let job = Job::new_async_tz(cron_expr, tz, move |_uuid, _lock| {
            let name = job_name.clone();
            let guard = guard.clone();
            let registry = registry.clone();
            let token = shutdown_token.clone();
            let job_fn = job_fn.clone();

            Box::pin(async move {
                if token.is_cancelled() {
                    registry.record_complete(&name, JobResult::Skipped("shutting down".into()), 0);
                    return;
                }
                let Some(_run) = guard.try_acquire() else {
                    info!(job = %name, "Previous run still active; skipping");
                    registry.record_complete(&name, JobResult::Skipped("overlap".into()), 0);
                    return;
                };

                registry.record_start(&name);
                let start = Instant::now();
                let result = match job_fn().await {
                    Ok(summary) => {
                        info!(job = %name, summary = %summary, "Job completed");
                        JobResult::Success(summary)
                    }
                    Err(e) => {
                        warn!(job = %name, error = %e, "Job failed");
                        JobResult::Failed(e)
                    }
                };
                registry.record_complete(&name, result, start.elapsed().as_millis() as u64);
            })
        })
        .map_err(|e| SchedulerError::InvalidCron(e.to_string()))?;

        let uuid = self.scheduler.add(job).await?;
        info!(job = %name, uuid = %uuid, cron = %cron_expr, timezone = %tz.name(), "Job registered");
        Ok(uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn quick_config() -> MaintenanceConfig {
        MaintenanceConfig {
            shutdown_timeout_secs: 1,
            ..Default::default()
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_start_and_shutdown() {
        let mut scheduler = MaintenanceScheduler::new(quick_config()).await.unwrap();
        assert!(!scheduler.is_running());

        scheduler.start().await.unwrap();
        assert!(matches!(scheduler.start().await, Err(SchedulerError::AlreadyRunning)));

        let token = scheduler.shutdown_token();
        scheduler.shutdown().await.unwrap();
        assert!(token.is_cancelled());
        assert!(!scheduler.is_running());
        assert!(matches!(scheduler.shutdown().await, Err(SchedulerError::NotRunning)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_invalid_timezone_config() {
        let config = MaintenanceConfig {
            default_timezone: "Invalid/Zone".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            MaintenanceScheduler::new(config).await,
            Err(SchedulerError::InvalidTimezone(_))
        ));
    }

    #[test]
    fn test_validate_cron_expression() {
        assert!(validate_cron_expression("0 0 3 * * *").is_ok());
        assert!(validate_cron_expression("*/10 * * * * *").is_ok());
        assert!(validate_cron_expression("").is_err());
        assert!(validate_cron_expression("* * *").is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_register_rejects_bad_input() {
        let scheduler = MaintenanceScheduler::new(quick_config()).await.unwrap();

        let result = scheduler
            .register_job("bad", "not a cron", None, || async { Ok(String::new()) })
            .await;
        assert!(matches!(result, Err(SchedulerError::InvalidCron(_))));

        let result = scheduler
            .register_job("bad-tz", "0 0 * * * *", Some("Mars/Olympus"), || async {
                Ok(String::new())
            })
            .await;
        assert!(matches!(result, Err(SchedulerError::InvalidTimezone(_))));
        assert_eq!(scheduler.registry().job_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_job_runs_are_recorded() {
        let mut scheduler = MaintenanceScheduler::new(quick_config()).await.unwrap();
        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();

        scheduler
            .register_job("tick", "* * * * * *", Some("UTC"), move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok("ticked".to_string())
                }
            })
            .await
            .unwrap();

        scheduler.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        scheduler.shutdown().await.unwrap();

        let status = scheduler.registry().get_status("tick").unwrap();
        assert!(runs.load(Ordering::SeqCst) >= 1);
        assert!(status.run_count >= 1);
        assert_eq!(status.error_count, 0);
        assert!(status.last_result.is_some());
    }
}
