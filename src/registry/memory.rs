use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::errors::AppError;
use crate::models::run::{JobDateResult, JobKey, JobRun, RunStatus, Stage, StageLogEntry};
use crate::registry::store::JobStore;

/// In-memory store; the default when no DATABASE_URL is configured and the
/// backing for every registry test
#[derive(Default)]
pub struct MemoryJobStore {
    runs: DashMap<String, JobRun>,
    stage_logs: DashMap<String, Vec<StageLogEntry>>,
    latest: DashMap<JobKey, JobDateResult>,
    seq: AtomicU64,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn next_run_seq(&self) -> Result<u64, AppError> {
        Ok(self.seq.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn insert_run(&self, run: &JobRun) -> Result<(), AppError> {
        self.runs.insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    async fn update_run(&self, run: &JobRun) -> Result<(), AppError> {
        self.runs.insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    async fn fetch_run(&self, run_id: &str) -> Result<Option<JobRun>, AppError> {
        Ok(self.runs.get(run_id).map(|r| r.clone()))
    }

    async fn fetch_running(&self, key: &JobKey) -> Result<Option<JobRun>, AppError> {
        Ok(self
            .runs
            .iter()
            .find(|r| r.status == RunStatus::Running && r.value().key() == *key)
            .map(|r| r.value().clone()))
    }

    async fn insert_stage_log(&self, entry: &StageLogEntry) -> Result<(), AppError> {
        self.stage_logs
            .entry(entry.run_id.clone())
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn update_stage_log(&self, entry: &StageLogEntry) -> Result<(), AppError> {
        if let Some(mut log) = self.stage_logs.get_mut(&entry.run_id) {
            if let Some(existing) = log.iter_mut().find(|e| e.stage == entry.stage) {
                *existing = entry.clone();
                return Ok(());
            }
        }
        Err(AppError::NotFound)
    }

    async fn fetch_stage_log(&self, run_id: &str) -> Result<Vec<StageLogEntry>, AppError> {
        Ok(self
            .stage_logs
            .get(run_id)
            .map(|log| log.clone())
            .unwrap_or_default())
    }

    async fn fetch_stage_entry(
        &self,
        run_id: &str,
        stage: Stage,
    ) -> Result<Option<StageLogEntry>, AppError> {
        Ok(self
            .stage_logs
            .get(run_id)
            .and_then(|log| log.iter().find(|e| e.stage == stage).cloned()))
    }

    async fn fetch_latest(&self, key: &JobKey) -> Result<Option<JobDateResult>, AppError> {
        Ok(self.latest.get(key).map(|r| r.clone()))
    }

    async fn put_latest(&self, result: &JobDateResult) -> Result<(), AppError> {
        let key = JobKey {
            scheduled_date: result.scheduled_date,
            report_type: result.report_type,
        };
        self.latest.insert(key, result.clone());
        Ok(())
    }
}
