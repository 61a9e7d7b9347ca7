use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::errors::AppError;
use crate::models::run::{
    JobDateResult, JobKey, JobRun, ReportType, RunStatus, Stage, StageLogEntry, StageOutcome,
};
use crate::registry::store::JobStore;

/// Postgres-backed store. Uses the runtime query API (not the compile-time
/// macros) so builds never need a live database. Expects `job_runs`,
/// `stage_log` and `job_date_results` tables plus a `report_run_seq` sequence.
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn parse_field<T: std::str::FromStr<Err = String>>(raw: &str, what: &str) -> Result<T, AppError> {
    raw.parse::<T>()
        .map_err(|e| AppError::External(format!("corrupt {} column: {}", what, e)))
}

fn string_vec(value: serde_json::Value, what: &str) -> Result<Vec<String>, AppError> {
    serde_json::from_value(value)
        .map_err(|e| AppError::External(format!("corrupt {} column: {}", what, e)))
}

fn run_from_row(row: &PgRow) -> Result<JobRun, AppError> {
    let status: String = row.try_get("status")?;
    let current_stage: Option<String> = row.try_get("current_stage")?;
    Ok(JobRun {
        run_id: row.try_get("run_id")?,
        run_seq: row.try_get::<i64, _>("run_seq")? as u64,
        scheduled_date: row.try_get::<NaiveDate, _>("scheduled_date")?,
        report_type: parse_field::<ReportType>(&row.try_get::<String, _>("report_type")?, "report_type")?,
        status: parse_field::<RunStatus>(&status, "status")?,
        current_stage: current_stage
            .map(|s| parse_field::<Stage>(&s, "current_stage"))
            .transpose()?,
        stage_open: row.try_get("stage_open")?,
        started_at: row.try_get::<DateTime<Utc>, _>("started_at")?,
        executed_at: row.try_get::<Option<DateTime<Utc>>, _>("executed_at")?,
        errors: string_vec(row.try_get("errors")?, "errors")?,
        warnings: string_vec(row.try_get("warnings")?, "warnings")?,
        trigger_source: row.try_get("trigger_source")?,
    })
}

fn stage_entry_from_row(row: &PgRow) -> Result<StageLogEntry, AppError> {
    let status: Option<String> = row.try_get("status")?;
    Ok(StageLogEntry {
        run_id: row.try_get("run_id")?,
        stage: parse_field::<Stage>(&row.try_get::<String, _>("stage")?, "stage")?,
        started_at: row.try_get::<DateTime<Utc>, _>("started_at")?,
        ended_at: row.try_get::<Option<DateTime<Utc>>, _>("ended_at")?,
        status: status
            .map(|s| parse_field::<StageOutcome>(&s, "status"))
            .transpose()?,
        details: row.try_get("details")?,
        warnings: string_vec(row.try_get("warnings")?, "warnings")?,
        errors: string_vec(row.try_get("errors")?, "errors")?,
    })
}

fn latest_from_row(row: &PgRow) -> Result<JobDateResult, AppError> {
    let current_stage: Option<String> = row.try_get("current_stage")?;
    Ok(JobDateResult {
        scheduled_date: row.try_get::<NaiveDate, _>("scheduled_date")?,
        report_type: parse_field::<ReportType>(&row.try_get::<String, _>("report_type")?, "report_type")?,
        latest_run_id: row.try_get("latest_run_id")?,
        run_seq: row.try_get::<i64, _>("run_seq")? as u64,
        status: parse_field::<RunStatus>(&row.try_get::<String, _>("status")?, "status")?,
        current_stage: current_stage
            .map(|s| parse_field::<Stage>(&s, "current_stage"))
            .transpose()?,
        errors: string_vec(row.try_get("errors")?, "errors")?,
        warnings: string_vec(row.try_get("warnings")?, "warnings")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn next_run_seq(&self) -> Result<u64, AppError> {
        let row = sqlx::query("SELECT nextval('report_run_seq') AS seq")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("seq")? as u64)
    }

    async fn insert_run(&self, run: &JobRun) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO job_runs
                (run_id, run_seq, scheduled_date, report_type, status, current_stage,
                 stage_open, started_at, executed_at, errors, warnings, trigger_source)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(&run.run_id)
        .bind(run.run_seq as i64)
        .bind(run.scheduled_date)
        .bind(run.report_type.as_str())
        .bind(run.status.as_str())
        .bind(run.current_stage.map(|s| s.as_str()))
        .bind(run.stage_open)
        .bind(run.started_at)
        .bind(run.executed_at)
        .bind(serde_json::json!(run.errors))
        .bind(serde_json::json!(run.warnings))
        .bind(&run.trigger_source)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_run(&self, run: &JobRun) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE job_runs
            SET status = $2, current_stage = $3, stage_open = $4,
                executed_at = $5, errors = $6, warnings = $7
            WHERE run_id = $1
            "#,
        )
        .bind(&run.run_id)
        .bind(run.status.as_str())
        .bind(run.current_stage.map(|s| s.as_str()))
        .bind(run.stage_open)
        .bind(run.executed_at)
        .bind(serde_json::json!(run.errors))
        .bind(serde_json::json!(run.warnings))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_run(&self, run_id: &str) -> Result<Option<JobRun>, AppError> {
        let row = sqlx::query("SELECT * FROM job_runs WHERE run_id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn fetch_running(&self, key: &JobKey) -> Result<Option<JobRun>, AppError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM job_runs
            WHERE scheduled_date = $1 AND report_type = $2 AND status = 'running'
            LIMIT 1
            "#,
        )
        .bind(key.scheduled_date)
        .bind(key.report_type.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn insert_stage_log(&self, entry: &StageLogEntry) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO stage_log
                (run_id, stage, started_at, ended_at, status, details, warnings, errors)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&entry.run_id)
        .bind(entry.stage.as_str())
        .bind(entry.started_at)
        .bind(entry.ended_at)
        .bind(entry.status.map(|s| s.as_str()))
        .bind(&entry.details)
        .bind(serde_json::json!(entry.warnings))
        .bind(serde_json::json!(entry.errors))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_stage_log(&self, entry: &StageLogEntry) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE stage_log
            SET ended_at = $3, status = $4, details = $5, warnings = $6, errors = $7
            WHERE run_id = $1 AND stage = $2
            "#,
        )
        .bind(&entry.run_id)
        .bind(entry.stage.as_str())
        .bind(entry.ended_at)
        .bind(entry.status.map(|s| s.as_str()))
        .bind(&entry.details)
        .bind(serde_json::json!(entry.warnings))
        .bind(serde_json::json!(entry.errors))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_stage_log(&self, run_id: &str) -> Result<Vec<StageLogEntry>, AppError> {
        let rows = sqlx::query("SELECT * FROM stage_log WHERE run_id = $1 ORDER BY started_at")
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(stage_entry_from_row).collect()
    }

    async fn fetch_stage_entry(
        &self,
        run_id: &str,
        stage: Stage,
    ) -> Result<Option<StageLogEntry>, AppError> {
        let row = sqlx::query("SELECT * FROM stage_log WHERE run_id = $1 AND stage = $2")
            .bind(run_id)
            .bind(stage.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(stage_entry_from_row).transpose()
    }

    async fn fetch_latest(&self, key: &JobKey) -> Result<Option<JobDateResult>, AppError> {
        let row = sqlx::query(
            "SELECT * FROM job_date_results WHERE scheduled_date = $1 AND report_type = $2",
        )
        .bind(key.scheduled_date)
        .bind(key.report_type.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(latest_from_row).transpose()
    }

    async fn put_latest(&self, result: &JobDateResult) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO job_date_results
                (scheduled_date, report_type, latest_run_id, run_seq, status,
                 current_stage, errors, warnings, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (scheduled_date, report_type) DO UPDATE
            SET latest_run_id = EXCLUDED.latest_run_id,
                run_seq = EXCLUDED.run_seq,
                status = EXCLUDED.status,
                current_stage = EXCLUDED.current_stage,
                errors = EXCLUDED.errors,
                warnings = EXCLUDED.warnings,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(result.scheduled_date)
        .bind(result.report_type.as_str())
        .bind(&result.latest_run_id)
        .bind(result.run_seq as i64)
        .bind(result.status.as_str())
        .bind(result.current_stage.map(|s| s.as_str()))
        .bind(serde_json::json!(result.errors))
        .bind(serde_json::json!(result.warnings))
        .bind(result.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
