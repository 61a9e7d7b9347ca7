pub mod memory;
pub mod pg;
pub mod store;

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::run::{
    JobDateResult, JobKey, JobRun, ReportType, RunStatus, Stage, StageLogEntry, StageOutcome,
};
use crate::registry::store::JobStore;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Explicit override: let a terminal failed/partial rerun replace a stored
    /// success result. Off by default; an automatic rerun never downgrades.
    pub overwrite_success: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            overwrite_success: false,
        }
    }
}

impl RegistryConfig {
    pub fn from_env() -> Self {
        Self {
            overwrite_success: std::env::var("REGISTRY_OVERWRITE_SUCCESS")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .unwrap_or(false),
        }
    }
}

/// State machine for job runs. Every write for a (scheduled_date, report_type)
/// key goes through that key's fair mutex, so run lifecycle transitions and
/// latest-pointer updates are FIFO-serialized per key; distinct keys never
/// contend.
pub struct JobRegistry {
    store: Arc<dyn JobStore>,
    key_locks: DashMap<JobKey, Arc<Mutex<()>>>,
    config: RegistryConfig,
}

impl JobRegistry {
    pub fn new(store: Arc<dyn JobStore>, config: RegistryConfig) -> Self {
        Self {
            store,
            key_locks: DashMap::new(),
            config,
        }
    }

    fn key_lock(&self, key: JobKey) -> Arc<Mutex<()>> {
        self.key_locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Opens a run with status running and no stage yet. Fails with Conflict
    /// while another run for the same key is still running.
    pub async fn open_run(
        &self,
        scheduled_date: NaiveDate,
        report_type: ReportType,
        trigger_source: &str,
    ) -> Result<JobRun, AppError> {
        let key = JobKey {
            scheduled_date,
            report_type,
        };
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;

        if let Some(existing) = self.store.fetch_running(&key).await? {
            return Err(AppError::Conflict(format!(
                "run {} already running for {}",
                existing.run_id, key
            )));
        }

        let run = JobRun {
            run_id: Uuid::new_v4().to_string(),
            run_seq: self.store.next_run_seq().await?,
            scheduled_date,
            report_type,
            status: RunStatus::Running,
            current_stage: None,
            stage_open: false,
            started_at: Utc::now(),
            executed_at: None,
            errors: Vec::new(),
            warnings: Vec::new(),
            trigger_source: trigger_source.to_string(),
        };
        self.store.insert_run(&run).await?;
        info!("📋 Opened run {} for {} (seq {})", run.run_id, key, run.run_seq);
        Ok(run)
    }

    /// Starts the next stage. Rejects out-of-order stages, a stage that is
    /// already open, reruns of a completed stage, and terminal runs.
    pub async fn begin_stage(&self, run_id: &str, stage: Stage) -> Result<(), AppError> {
        let key = self.run_key(run_id).await?;
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;

        let mut run = self
            .store
            .fetch_run(run_id)
            .await?
            .ok_or(AppError::NotFound)?;

        if run.status.is_terminal() {
            return Err(AppError::Sequence(format!(
                "run {} is terminal ({})",
                run_id,
                run.status.as_str()
            )));
        }
        if run.stage_open {
            return Err(AppError::Sequence(format!(
                "run {} has stage {} still open",
                run_id,
                run.current_stage.map(|s| s.as_str()).unwrap_or("?")
            )));
        }
        match Stage::expected_next(run.current_stage) {
            Some(expected) if expected == stage => {}
            Some(expected) => {
                return Err(AppError::Sequence(format!(
                    "run {} expected stage {}, got {}",
                    run_id, expected, stage
                )));
            }
            None => {
                return Err(AppError::Sequence(format!(
                    "run {} has no stages left after {}",
                    run_id,
                    Stage::Finalize
                )));
            }
        }

        self.store
            .insert_stage_log(&StageLogEntry {
                run_id: run_id.to_string(),
                stage,
                started_at: Utc::now(),
                ended_at: None,
                status: None,
                details: None,
                warnings: Vec::new(),
                errors: Vec::new(),
            })
            .await?;

        run.current_stage = Some(stage);
        run.stage_open = true;
        self.store.update_run(&run).await?;
        info!("▶️ Run {} entered stage {}", run_id, stage);
        Ok(())
    }

    /// Completes the open stage. A fatal outcome makes the run terminal
    /// immediately; a finalize completion computes the overall status from
    /// the full stage history. Either terminal transition updates the
    /// latest pointer exactly once, CAS-guarded on run_seq.
    pub async fn end_stage(
        &self,
        run_id: &str,
        stage: Stage,
        outcome: StageOutcome,
        warnings: Vec<String>,
        errors: Vec<String>,
        details: Option<String>,
    ) -> Result<(), AppError> {
        let key = self.run_key(run_id).await?;
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;

        let mut run = self
            .store
            .fetch_run(run_id)
            .await?
            .ok_or(AppError::NotFound)?;

        if run.status.is_terminal() {
            return Err(AppError::Sequence(format!(
                "run {} is terminal ({})",
                run_id,
                run.status.as_str()
            )));
        }
        if !run.stage_open || run.current_stage != Some(stage) {
            return Err(AppError::Sequence(format!(
                "run {} has no open stage {}",
                run_id, stage
            )));
        }

        let mut entry = self
            .store
            .fetch_stage_entry(run_id, stage)
            .await?
            .ok_or(AppError::NotFound)?;
        entry.ended_at = Some(Utc::now());
        entry.status = Some(outcome);
        entry.details = details;
        entry.warnings = warnings.clone();
        entry.errors = errors.clone();
        self.store.update_stage_log(&entry).await?;

        run.stage_open = false;
        run.warnings.extend(warnings);
        run.errors.extend(errors);

        match outcome {
            StageOutcome::FatalError => {
                run.status = RunStatus::Failed;
                run.executed_at = Some(Utc::now());
                self.store.update_run(&run).await?;
                warn!("⛔ Run {} failed fatally at stage {}", run_id, stage);
                self.update_latest(&run).await?;
            }
            _ if stage == Stage::Finalize => {
                run.status = self.overall_status(run_id, outcome).await?;
                run.executed_at = Some(Utc::now());
                self.store.update_run(&run).await?;
                info!(
                    "🏁 Run {} finished with status {}",
                    run_id,
                    run.status.as_str()
                );
                self.update_latest(&run).await?;
            }
            _ => {
                self.store.update_run(&run).await?;
            }
        }
        Ok(())
    }

    /// Last-resort transition for a run whose stage loop can no longer record
    /// outcomes (a store write failed mid-run). Marks the run failed so its
    /// key does not stay blocked by a running run that will never finish.
    /// No-op when the run already reached a terminal status.
    pub async fn abandon_run(&self, run_id: &str, reason: &str) -> Result<(), AppError> {
        let key = self.run_key(run_id).await?;
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;

        let mut run = self
            .store
            .fetch_run(run_id)
            .await?
            .ok_or(AppError::NotFound)?;
        if run.status.is_terminal() {
            return Ok(());
        }

        run.status = RunStatus::Failed;
        run.stage_open = false;
        run.executed_at = Some(Utc::now());
        run.errors.push(reason.to_string());
        self.store.update_run(&run).await?;
        warn!("🪦 Run {} abandoned: {}", run_id, reason);
        self.update_latest(&run).await
    }

    /// Drops key locks nobody currently holds. Locks are re-created on demand,
    /// so this only bounds the map; a count above 1 means a clone is live.
    pub fn prune_idle_locks(&self) -> usize {
        let before = self.key_locks.len();
        self.key_locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - self.key_locks.len()
    }

    /// Overall status is a pure function of the stage outcomes
    async fn overall_status(
        &self,
        run_id: &str,
        finalize_outcome: StageOutcome,
    ) -> Result<RunStatus, AppError> {
        if finalize_outcome == StageOutcome::FatalError {
            return Ok(RunStatus::Failed);
        }
        let log = self.store.fetch_stage_log(run_id).await?;
        let any_partial = log
            .iter()
            .any(|e| e.status == Some(StageOutcome::PartialError));
        Ok(if any_partial {
            RunStatus::Partial
        } else {
            RunStatus::Success
        })
    }

    /// Latest-pointer update, called once per run at its terminal transition
    /// while the key lock is held. Compare-and-swap on run_seq: a run that
    /// finishes after a logically newer run never clobbers its result. A
    /// failed or partial rerun never replaces a stored success unless the
    /// overwrite_success override is on.
    async fn update_latest(&self, run: &JobRun) -> Result<(), AppError> {
        let key = run.key();
        if let Some(prev) = self.store.fetch_latest(&key).await? {
            if run.run_seq <= prev.run_seq {
                warn!(
                    "⏮️ Run {} (seq {}) finished after seq {}; keeping newer result for {}",
                    run.run_id, run.run_seq, prev.run_seq, key
                );
                return Ok(());
            }
            if prev.status == RunStatus::Success
                && run.status != RunStatus::Success
                && !self.config.overwrite_success
            {
                info!(
                    "🛡️ Run {} ({}) not allowed to downgrade success result for {}",
                    run.run_id,
                    run.status.as_str(),
                    key
                );
                return Ok(());
            }
        }
        self.store
            .put_latest(&JobDateResult {
                scheduled_date: run.scheduled_date,
                report_type: run.report_type,
                latest_run_id: run.run_id.clone(),
                run_seq: run.run_seq,
                status: run.status,
                current_stage: run.current_stage,
                errors: run.errors.clone(),
                warnings: run.warnings.clone(),
                updated_at: Utc::now(),
            })
            .await
    }

    pub async fn get_latest(
        &self,
        scheduled_date: NaiveDate,
        report_type: ReportType,
    ) -> Result<Option<JobDateResult>, AppError> {
        self.store
            .fetch_latest(&JobKey {
                scheduled_date,
                report_type,
            })
            .await
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Option<JobRun>, AppError> {
        self.store.fetch_run(run_id).await
    }

    pub async fn stage_log(&self, run_id: &str) -> Result<Vec<StageLogEntry>, AppError> {
        self.store.fetch_stage_log(run_id).await
    }

    async fn run_key(&self, run_id: &str) -> Result<JobKey, AppError> {
        Ok(self
            .store
            .fetch_run(run_id)
            .await?
            .ok_or(AppError::NotFound)?
            .key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::memory::MemoryJobStore;

    fn registry() -> JobRegistry {
        JobRegistry::new(Arc::new(MemoryJobStore::new()), RegistryConfig::default())
    }

    fn march_first() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
    }

    async fn end_ok(reg: &JobRegistry, run_id: &str, stage: Stage) {
        reg.end_stage(run_id, stage, StageOutcome::Success, vec![], vec![], None)
            .await
            .unwrap();
    }

    async fn drive_to_terminal(reg: &JobRegistry, run_id: &str) {
        for stage in Stage::SEQUENCE {
            reg.begin_stage(run_id, stage).await.unwrap();
            end_ok(reg, run_id, stage).await;
        }
    }

    #[tokio::test]
    async fn test_concurrent_open_runs_yield_one_conflict() {
        let reg = registry();
        let (a, b) = tokio::join!(
            reg.open_run(march_first(), ReportType::Weekly, "cron"),
            reg.open_run(march_first(), ReportType::Weekly, "api"),
        );
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
        let err = if a.is_err() { a.unwrap_err() } else { b.unwrap_err() };
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_conflict() {
        let reg = registry();
        reg.open_run(march_first(), ReportType::Weekly, "cron").await.unwrap();
        reg.open_run(march_first(), ReportType::Intraday, "cron").await.unwrap();
    }

    #[tokio::test]
    async fn test_rerun_allowed_after_terminal() {
        let reg = registry();
        let run = reg.open_run(march_first(), ReportType::Weekly, "cron").await.unwrap();
        drive_to_terminal(&reg, &run.run_id).await;
        reg.open_run(march_first(), ReportType::Weekly, "manual").await.unwrap();
    }

    #[tokio::test]
    async fn test_stage_order_is_enforced() {
        let reg = registry();
        let run = reg.open_run(march_first(), ReportType::Weekly, "cron").await.unwrap();

        // ai_analysis before data_fetch has ended
        reg.begin_stage(&run.run_id, Stage::Init).await.unwrap();
        end_ok(&reg, &run.run_id, Stage::Init).await;
        let err = reg.begin_stage(&run.run_id, Stage::AiAnalysis).await.unwrap_err();
        assert!(matches!(err, AppError::Sequence(_)));

        // Correct order proceeds
        reg.begin_stage(&run.run_id, Stage::DataFetch).await.unwrap();
    }

    #[tokio::test]
    async fn test_stage_cannot_begin_while_previous_open() {
        let reg = registry();
        let run = reg.open_run(march_first(), ReportType::Weekly, "cron").await.unwrap();
        reg.begin_stage(&run.run_id, Stage::Init).await.unwrap();
        let err = reg.begin_stage(&run.run_id, Stage::DataFetch).await.unwrap_err();
        assert!(matches!(err, AppError::Sequence(_)));
    }

    #[tokio::test]
    async fn test_end_stage_requires_open_stage() {
        let reg = registry();
        let run = reg.open_run(march_first(), ReportType::Weekly, "cron").await.unwrap();
        let err = reg
            .end_stage(&run.run_id, Stage::Init, StageOutcome::Success, vec![], vec![], None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Sequence(_)));
    }

    #[tokio::test]
    async fn test_terminal_run_is_immutable() {
        let reg = registry();
        let run = reg.open_run(march_first(), ReportType::Weekly, "cron").await.unwrap();
        drive_to_terminal(&reg, &run.run_id).await;

        let err = reg.begin_stage(&run.run_id, Stage::Init).await.unwrap_err();
        assert!(matches!(err, AppError::Sequence(_)));
        let err = reg
            .end_stage(&run.run_id, Stage::Finalize, StageOutcome::Success, vec![], vec![], None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Sequence(_)));
    }

    #[tokio::test]
    async fn test_partial_run_end_to_end() {
        let reg = registry();
        let run = reg.open_run(march_first(), ReportType::Weekly, "cron").await.unwrap();

        reg.begin_stage(&run.run_id, Stage::Init).await.unwrap();
        end_ok(&reg, &run.run_id, Stage::Init).await;

        reg.begin_stage(&run.run_id, Stage::DataFetch).await.unwrap();
        reg.end_stage(
            &run.run_id,
            Stage::DataFetch,
            StageOutcome::PartialError,
            vec!["provider X timeout".to_string()],
            vec![],
            None,
        )
        .await
        .unwrap();

        for stage in [Stage::AiAnalysis, Stage::Storage, Stage::Finalize] {
            reg.begin_stage(&run.run_id, stage).await.unwrap();
            end_ok(&reg, &run.run_id, stage).await;
        }

        let stored = reg.get_run(&run.run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Partial);
        assert_eq!(stored.warnings, vec!["provider X timeout".to_string()]);

        let latest = reg
            .get_latest(march_first(), ReportType::Weekly)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.latest_run_id, run.run_id);
        assert_eq!(latest.status, RunStatus::Partial);
    }

    #[tokio::test]
    async fn test_fatal_error_short_circuits_run() {
        let reg = registry();
        let run = reg.open_run(march_first(), ReportType::Weekly, "cron").await.unwrap();

        for stage in [Stage::Init, Stage::DataFetch] {
            reg.begin_stage(&run.run_id, stage).await.unwrap();
            end_ok(&reg, &run.run_id, stage).await;
        }
        reg.begin_stage(&run.run_id, Stage::AiAnalysis).await.unwrap();
        reg.end_stage(
            &run.run_id,
            Stage::AiAnalysis,
            StageOutcome::FatalError,
            vec![],
            vec!["inference backend down".to_string()],
            None,
        )
        .await
        .unwrap();

        let stored = reg.get_run(&run.run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Failed);

        // Remaining stages cannot run
        let err = reg.begin_stage(&run.run_id, Stage::Storage).await.unwrap_err();
        assert!(matches!(err, AppError::Sequence(_)));

        let latest = reg
            .get_latest(march_first(), ReportType::Weekly)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.status, RunStatus::Failed);
        assert_eq!(latest.errors, vec!["inference backend down".to_string()]);
    }

    #[tokio::test]
    async fn test_latest_pointer_cas_rejects_out_of_order_completion() {
        let store = Arc::new(MemoryJobStore::new());
        let reg = JobRegistry::new(store.clone(), RegistryConfig::default());
        let run = reg.open_run(march_first(), ReportType::EndOfDay, "cron").await.unwrap();

        // A logically newer run already published its result
        store
            .put_latest(&JobDateResult {
                scheduled_date: march_first(),
                report_type: ReportType::EndOfDay,
                latest_run_id: "newer-run".to_string(),
                run_seq: run.run_seq + 10,
                status: RunStatus::Success,
                current_stage: Some(Stage::Finalize),
                errors: vec![],
                warnings: vec![],
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        drive_to_terminal(&reg, &run.run_id).await;

        let latest = reg
            .get_latest(march_first(), ReportType::EndOfDay)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.latest_run_id, "newer-run");
    }

    #[tokio::test]
    async fn test_failed_rerun_does_not_downgrade_success_pointer() {
        let reg = registry();
        let first = reg.open_run(march_first(), ReportType::Weekly, "cron").await.unwrap();
        drive_to_terminal(&reg, &first.run_id).await;

        let rerun = reg.open_run(march_first(), ReportType::Weekly, "manual").await.unwrap();
        reg.begin_stage(&rerun.run_id, Stage::Init).await.unwrap();
        reg.end_stage(
            &rerun.run_id,
            Stage::Init,
            StageOutcome::FatalError,
            vec![],
            vec!["boom".to_string()],
            None,
        )
        .await
        .unwrap();

        let latest = reg
            .get_latest(march_first(), ReportType::Weekly)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.latest_run_id, first.run_id);
        assert_eq!(latest.status, RunStatus::Success);
    }

    #[tokio::test]
    async fn test_overwrite_success_override_allows_downgrade() {
        let store = Arc::new(MemoryJobStore::new());
        let reg = JobRegistry::new(
            store,
            RegistryConfig {
                overwrite_success: true,
            },
        );
        let first = reg.open_run(march_first(), ReportType::Weekly, "cron").await.unwrap();
        drive_to_terminal(&reg, &first.run_id).await;

        let rerun = reg.open_run(march_first(), ReportType::Weekly, "manual").await.unwrap();
        reg.begin_stage(&rerun.run_id, Stage::Init).await.unwrap();
        reg.end_stage(
            &rerun.run_id,
            Stage::Init,
            StageOutcome::FatalError,
            vec![],
            vec!["boom".to_string()],
            None,
        )
        .await
        .unwrap();

        let latest = reg
            .get_latest(march_first(), ReportType::Weekly)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.latest_run_id, rerun.run_id);
        assert_eq!(latest.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_abandon_fails_run_and_frees_key() {
        let reg = registry();
        let run = reg.open_run(march_first(), ReportType::Weekly, "cron").await.unwrap();
        reg.begin_stage(&run.run_id, Stage::Init).await.unwrap();

        reg.abandon_run(&run.run_id, "stage bookkeeping lost").await.unwrap();

        let stored = reg.get_run(&run.run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
        assert!(!stored.stage_open);
        assert!(stored.errors.contains(&"stage bookkeeping lost".to_string()));

        // The key is open for a rerun again
        reg.open_run(march_first(), ReportType::Weekly, "manual").await.unwrap();
    }

    #[tokio::test]
    async fn test_abandon_is_a_noop_on_terminal_run() {
        let reg = registry();
        let run = reg.open_run(march_first(), ReportType::Weekly, "cron").await.unwrap();
        drive_to_terminal(&reg, &run.run_id).await;

        reg.abandon_run(&run.run_id, "late abandon").await.unwrap();

        let stored = reg.get_run(&run.run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Success);
        assert!(stored.errors.is_empty());
    }

    #[tokio::test]
    async fn test_prune_idle_locks_bounds_the_lock_map() {
        let reg = registry();
        let run = reg.open_run(march_first(), ReportType::Weekly, "cron").await.unwrap();
        drive_to_terminal(&reg, &run.run_id).await;
        let other = reg.open_run(march_first(), ReportType::Intraday, "cron").await.unwrap();
        drive_to_terminal(&reg, &other.run_id).await;

        assert_eq!(reg.prune_idle_locks(), 2);

        // Pruned keys still work; locks come back on demand
        reg.open_run(march_first(), ReportType::Weekly, "manual").await.unwrap();
    }

    #[tokio::test]
    async fn test_stage_log_is_complete_and_ordered() {
        let reg = registry();
        let run = reg.open_run(march_first(), ReportType::PreMarket, "cron").await.unwrap();
        drive_to_terminal(&reg, &run.run_id).await;

        let log = reg.stage_log(&run.run_id).await.unwrap();
        assert_eq!(log.len(), 5);
        let stages: Vec<Stage> = log.iter().map(|e| e.stage).collect();
        assert_eq!(stages, Stage::SEQUENCE.to_vec());
        assert!(log.iter().all(|e| e.ended_at.is_some()));
        assert!(log.iter().all(|e| e.status == Some(StageOutcome::Success)));
    }
}
