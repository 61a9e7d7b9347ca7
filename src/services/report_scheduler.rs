use std::sync::Arc;

use chrono::Utc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::errors::AppError;
use crate::models::run::ReportType;
use crate::runner::ReportRunner;

/// Cron wiring for the five report types. Each tick triggers a run for
/// today's date; a Conflict means a run is already in flight for that key
/// and the tick is skipped, never retried.
pub struct ReportSchedulerService {
    scheduler: JobScheduler,
    runner: Arc<ReportRunner>,
}

impl ReportSchedulerService {
    pub async fn new(runner: Arc<ReportRunner>) -> Result<Self, AppError> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| AppError::External(format!("Failed to create scheduler: {}", e)))?;
        Ok(Self { scheduler, runner })
    }

    /// Start all scheduled report jobs
    pub async fn start(&mut self) -> Result<(), AppError> {
        info!("🚀 Starting report scheduler...");

        // Check if we're in test mode (runs reports every few minutes)
        let test_mode = std::env::var("REPORT_SCHEDULER_TEST_MODE")
            .unwrap_or_else(|_| "false".to_string())
            .parse::<bool>()
            .unwrap_or(false);

        if test_mode {
            info!("⚠️  REPORT SCHEDULER IN TEST MODE - Reports will run every few minutes!");
        }

        // (format: sec min hour day month weekday)
        let pre_market = if test_mode { "0 */1 * * * *" } else { "0 0 8 * * MON-FRI" };
        self.schedule_report(pre_market, ReportType::PreMarket, if test_mode {
            "Every minute (TEST MODE)"
        } else {
            "Weekdays at 8:00 AM"
        })
        .await?;

        let intraday = if test_mode { "0 */2 * * * *" } else { "0 30 12 * * MON-FRI" };
        self.schedule_report(intraday, ReportType::Intraday, if test_mode {
            "Every 2 minutes (TEST MODE)"
        } else {
            "Weekdays at 12:30 PM"
        })
        .await?;

        let end_of_day = if test_mode { "0 */3 * * * *" } else { "0 10 17 * * MON-FRI" };
        self.schedule_report(end_of_day, ReportType::EndOfDay, if test_mode {
            "Every 3 minutes (TEST MODE)"
        } else {
            "Weekdays at 5:10 PM"
        })
        .await?;

        self.schedule_report("0 0 6 * * SUN", ReportType::Weekly, "Every Sunday at 6:00 AM")
            .await?;

        self.schedule_report(
            "0 30 17 * * FRI",
            ReportType::SectorRotation,
            "Every Friday at 5:30 PM",
        )
        .await?;

        let maintenance = if test_mode { "0 */5 * * * *" } else { "0 0 3 * * *" };
        self.schedule_maintenance(maintenance, if test_mode {
            "Every 5 minutes (TEST MODE)"
        } else {
            "Daily at 3:00 AM"
        })
        .await?;

        self.scheduler
            .start()
            .await
            .map_err(|e| AppError::External(format!("Failed to start scheduler: {}", e)))?;

        info!("✅ Report scheduler started with 5 report types");
        Ok(())
    }

    /// Housekeeping tick: sweep hard-expired cache entries and drop idle
    /// registry key locks. Both structures otherwise only shrink on access,
    /// so keys that stop being read would accumulate forever.
    async fn schedule_maintenance(
        &mut self,
        schedule: &str,
        description: &str,
    ) -> Result<(), AppError> {
        let runner = self.runner.clone();

        let job = Job::new_async(schedule, move |_uuid, _l| {
            let runner = runner.clone();
            Box::pin(async move {
                match runner.cache.sweep_expired().await {
                    Ok(removed) => info!("🧹 Swept {} expired cache entries", removed),
                    Err(e) => error!("❌ Cache sweep failed: {}", e),
                }
                let pruned = runner.registry.prune_idle_locks();
                info!("🧹 Pruned {} idle registry key locks", pruned);
            })
        })
        .map_err(|e| AppError::External(format!("Failed to create maintenance job: {}", e)))?;

        self.scheduler
            .add(job)
            .await
            .map_err(|e| AppError::External(format!("Failed to add maintenance job: {}", e)))?;

        info!("📅 Scheduled: maintenance - {} [cron: {}]", description, schedule);
        Ok(())
    }

    /// Stop the scheduler gracefully
    #[allow(dead_code)]
    pub async fn stop(&mut self) -> Result<(), AppError> {
        info!("🛑 Stopping report scheduler...");
        self.scheduler
            .shutdown()
            .await
            .map_err(|e| AppError::External(format!("Failed to stop scheduler: {}", e)))?;
        info!("✅ Report scheduler stopped");
        Ok(())
    }

    async fn schedule_report(
        &mut self,
        schedule: &str,
        report_type: ReportType,
        description: &str,
    ) -> Result<(), AppError> {
        let runner = self.runner.clone();

        let job = Job::new_async(schedule, move |_uuid, _l| {
            let runner = runner.clone();
            Box::pin(async move {
                let today = Utc::now().date_naive();
                match runner.trigger(today, report_type, "cron").await {
                    Ok(ack) => {
                        info!("🏃 Triggered {} report for {} (run {})", report_type, today, ack.run_id);
                    }
                    Err(AppError::Conflict(msg)) => {
                        warn!("⏭️  Skipping {} report, already running: {}", report_type, msg);
                    }
                    Err(e) => {
                        error!("❌ Failed to trigger {} report: {}", report_type, e);
                    }
                }
            })
        })
        .map_err(|e| AppError::External(format!("Failed to create job {}: {}", report_type, e)))?;

        self.scheduler
            .add(job)
            .await
            .map_err(|e| AppError::External(format!("Failed to add job {}: {}", report_type, e)))?;

        info!("📅 Scheduled: {} - {} [cron: {}]", report_type, description, schedule);
        Ok(())
    }
}
