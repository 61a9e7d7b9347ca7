use async_trait::async_trait;

use crate::errors::AppError;
use crate::models::run::{JobDateResult, JobKey, JobRun, Stage, StageLogEntry};

/// Persistence seam for the registry. Implementations only read and write;
/// conflict checks, ordering rules, and the latest-pointer CAS all live in
/// `JobRegistry`, which calls these under the owning key's lock.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Monotonic sequence shared by every run; assigned at open
    async fn next_run_seq(&self) -> Result<u64, AppError>;

    async fn insert_run(&self, run: &JobRun) -> Result<(), AppError>;
    async fn update_run(&self, run: &JobRun) -> Result<(), AppError>;
    async fn fetch_run(&self, run_id: &str) -> Result<Option<JobRun>, AppError>;
    /// The at-most-one running run for a key, if any
    async fn fetch_running(&self, key: &JobKey) -> Result<Option<JobRun>, AppError>;

    async fn insert_stage_log(&self, entry: &StageLogEntry) -> Result<(), AppError>;
    async fn update_stage_log(&self, entry: &StageLogEntry) -> Result<(), AppError>;
    async fn fetch_stage_log(&self, run_id: &str) -> Result<Vec<StageLogEntry>, AppError>;
    async fn fetch_stage_entry(
        &self,
        run_id: &str,
        stage: Stage,
    ) -> Result<Option<StageLogEntry>, AppError>;

    async fn fetch_latest(&self, key: &JobKey) -> Result<Option<JobDateResult>, AppError>;
    async fn put_latest(&self, result: &JobDateResult) -> Result<(), AppError>;
}
