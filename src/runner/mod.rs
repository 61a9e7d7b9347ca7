pub mod stages;

use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::cache::CacheClient;
use crate::errors::AppError;
use crate::external::market_data::MarketDataProvider;
use crate::external::report_sink::ReportSink;
use crate::external::sentiment::SentimentProvider;
use crate::models::run::{JobRun, ReportType, Stage, StageOutcome};
use crate::registry::JobRegistry;

/// What the trigger caller gets back, always, regardless of how the run
/// eventually ends. Job failure is queryable state, not a transport error.
#[derive(Debug, Clone, Serialize)]
pub struct TriggerAck {
    pub run_id: String,
    pub scheduled_date: NaiveDate,
    pub report_type: ReportType,
    pub status: &'static str,
}

/// Orchestrates one report run: open it in the registry, walk the fixed
/// stage sequence, finalize. Stage artifacts flow through the cache.
#[derive(Clone)]
pub struct ReportRunner {
    pub(crate) registry: Arc<JobRegistry>,
    pub(crate) cache: CacheClient,
    pub(crate) market_data: Arc<dyn MarketDataProvider>,
    pub(crate) sentiment: Arc<dyn SentimentProvider>,
    pub(crate) sink: Arc<dyn ReportSink>,
}

impl ReportRunner {
    pub fn new(
        registry: Arc<JobRegistry>,
        cache: CacheClient,
        market_data: Arc<dyn MarketDataProvider>,
        sentiment: Arc<dyn SentimentProvider>,
        sink: Arc<dyn ReportSink>,
    ) -> Self {
        Self {
            registry,
            cache,
            market_data,
            sentiment,
            sink,
        }
    }

    /// Opens the run and hands the stage loop to a background task.
    /// Validation and Conflict are the only synchronous rejections.
    pub async fn trigger(
        &self,
        scheduled_date: NaiveDate,
        report_type: ReportType,
        trigger_source: &str,
    ) -> Result<TriggerAck, AppError> {
        let run = self
            .registry
            .open_run(scheduled_date, report_type, trigger_source)
            .await?;
        let ack = TriggerAck {
            run_id: run.run_id.clone(),
            scheduled_date,
            report_type,
            status: "accepted",
        };
        let runner = self.clone();
        tokio::spawn(async move {
            runner.execute_run(run).await;
        });
        Ok(ack)
    }

    /// The stage loop. Never returns an error to the trigger path: outcomes
    /// land in the registry, fatal stages stop further execution.
    pub async fn execute_run(&self, run: JobRun) {
        info!(
            "🏃 Executing run {} ({} {})",
            run.run_id, run.scheduled_date, run.report_type
        );

        for stage in Stage::SEQUENCE {
            if let Err(e) = self.registry.begin_stage(&run.run_id, stage).await {
                error!("Run {} could not begin stage {}: {}", run.run_id, stage, e);
                self.abandon(&run.run_id, &format!("stage {} could not begin: {}", stage, e))
                    .await;
                return;
            }

            let report = self.run_stage(stage, &run).await;
            let fatal = report.outcome == StageOutcome::FatalError;

            if let Err(e) = self
                .registry
                .end_stage(
                    &run.run_id,
                    stage,
                    report.outcome,
                    report.warnings,
                    report.errors,
                    report.details,
                )
                .await
            {
                error!("Run {} could not end stage {}: {}", run.run_id, stage, e);
                self.abandon(&run.run_id, &format!("stage {} could not be recorded: {}", stage, e))
                    .await;
                return;
            }

            if fatal {
                warn!("⛔ Run {} stopped at stage {}", run.run_id, stage);
                return;
            }
        }

        match self.registry.get_run(&run.run_id).await {
            Ok(Some(finished)) => info!(
                "✅ Run {} finished with status {}",
                run.run_id,
                finished.status.as_str()
            ),
            Ok(None) => error!("Run {} vanished after finalize", run.run_id),
            Err(e) => error!("Run {} status lookup failed: {}", run.run_id, e),
        }
    }

    /// Best-effort failed transition when stage bookkeeping broke. Retried a
    /// few times: leaving the run in running would block its key from ever
    /// being re-triggered.
    async fn abandon(&self, run_id: &str, reason: &str) {
        for attempt in 1..=3u32 {
            match self.registry.abandon_run(run_id, reason).await {
                Ok(()) => return,
                Err(e) => {
                    warn!("Abandon attempt {} for run {} failed: {}", attempt, run_id, e);
                    tokio::time::sleep(std::time::Duration::from_millis(50 * attempt as u64)).await;
                }
            }
        }
        error!("🚨 Run {} stuck in running; store kept rejecting writes", run_id);
    }
}
