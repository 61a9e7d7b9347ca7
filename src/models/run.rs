use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Report flavor a scheduled run produces
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ReportType {
    PreMarket,      // Before opening bell
    Intraday,       // Midday checkpoint
    EndOfDay,       // After close
    Weekly,         // Sunday digest
    SectorRotation, // Friday sector flows
}

impl ReportType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportType::PreMarket => "pre-market",
            ReportType::Intraday => "intraday",
            ReportType::EndOfDay => "end-of-day",
            ReportType::Weekly => "weekly",
            ReportType::SectorRotation => "sector-rotation",
        }
    }
}

impl FromStr for ReportType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pre-market" => Ok(ReportType::PreMarket),
            "intraday" => Ok(ReportType::Intraday),
            "end-of-day" => Ok(ReportType::EndOfDay),
            "weekly" => Ok(ReportType::Weekly),
            "sector-rotation" => Ok(ReportType::SectorRotation),
            other => Err(format!("unknown report type: {}", other)),
        }
    }
}

impl fmt::Display for ReportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a run; `Running` is the only non-terminal state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Partial, // Completed, but at least one stage reported recoverable errors
    Failed,  // A stage ended fatally; remaining stages never ran
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        }
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "partial" => Ok(RunStatus::Partial),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status: {}", other)),
        }
    }
}

/// Ordered phases of a run. The sequence is fixed: no skipping, no reordering.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Init,
    DataFetch,
    AiAnalysis,
    Storage,
    Finalize,
}

impl Stage {
    pub const SEQUENCE: [Stage; 5] = [
        Stage::Init,
        Stage::DataFetch,
        Stage::AiAnalysis,
        Stage::Storage,
        Stage::Finalize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Init => "init",
            Stage::DataFetch => "data_fetch",
            Stage::AiAnalysis => "ai_analysis",
            Stage::Storage => "storage",
            Stage::Finalize => "finalize",
        }
    }

    /// The stage that must follow `prev` (None = start of the run)
    pub fn expected_next(prev: Option<Stage>) -> Option<Stage> {
        match prev {
            None => Some(Stage::Init),
            Some(stage) => {
                let idx = Self::SEQUENCE.iter().position(|s| *s == stage)?;
                Self::SEQUENCE.get(idx + 1).copied()
            }
        }
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "init" => Ok(Stage::Init),
            "data_fetch" => Ok(Stage::DataFetch),
            "ai_analysis" => Ok(Stage::AiAnalysis),
            "storage" => Ok(Stage::Storage),
            "finalize" => Ok(Stage::Finalize),
            other => Err(format!("unknown stage: {}", other)),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a single stage ended
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Success,
    PartialError, // Recoverable; run continues, terminal status downgrades to partial
    FatalError,   // Run stops here with status failed
}

impl StageOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageOutcome::Success => "success",
            StageOutcome::PartialError => "partial_error",
            StageOutcome::FatalError => "fatal_error",
        }
    }
}

impl FromStr for StageOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(StageOutcome::Success),
            "partial_error" => Ok(StageOutcome::PartialError),
            "fatal_error" => Ok(StageOutcome::FatalError),
            other => Err(format!("unknown stage outcome: {}", other)),
        }
    }
}

/// One execution attempt for a (scheduled_date, report_type) key.
/// Mutated only by stage transitions; frozen once terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub run_id: String,
    /// Monotonic sequence assigned at open; the latest-pointer CAS compares these
    pub run_seq: u64,
    pub scheduled_date: NaiveDate,
    pub report_type: ReportType,
    pub status: RunStatus,
    pub current_stage: Option<Stage>,
    /// True between begin_stage and end_stage for current_stage
    pub stage_open: bool,
    pub started_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub trigger_source: String,
}

impl JobRun {
    pub fn key(&self) -> JobKey {
        JobKey {
            scheduled_date: self.scheduled_date,
            report_type: self.report_type,
        }
    }
}

/// The per-key identity both the registry and the latest pointer hang off
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobKey {
    pub scheduled_date: NaiveDate,
    pub report_type: ReportType,
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scheduled_date, self.report_type)
    }
}

/// Materialized "latest outcome" pointer for a (date, report_type) key.
/// Updated exactly once per run, at its terminal transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDateResult {
    pub scheduled_date: NaiveDate,
    pub report_type: ReportType,
    pub latest_run_id: String,
    pub run_seq: u64,
    pub status: RunStatus,
    pub current_stage: Option<Stage>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only audit record; one entry per (run_id, stage)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageLogEntry {
    pub run_id: String,
    pub stage: Stage,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: Option<StageOutcome>,
    pub details: Option<String>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_sequence_is_fixed() {
        assert_eq!(Stage::expected_next(None), Some(Stage::Init));
        assert_eq!(Stage::expected_next(Some(Stage::Init)), Some(Stage::DataFetch));
        assert_eq!(Stage::expected_next(Some(Stage::DataFetch)), Some(Stage::AiAnalysis));
        assert_eq!(Stage::expected_next(Some(Stage::AiAnalysis)), Some(Stage::Storage));
        assert_eq!(Stage::expected_next(Some(Stage::Storage)), Some(Stage::Finalize));
        assert_eq!(Stage::expected_next(Some(Stage::Finalize)), None);
    }

    #[test]
    fn test_report_type_round_trips_through_str() {
        for rt in [
            ReportType::PreMarket,
            ReportType::Intraday,
            ReportType::EndOfDay,
            ReportType::Weekly,
            ReportType::SectorRotation,
        ] {
            assert_eq!(rt.as_str().parse::<ReportType>().unwrap(), rt);
        }
        assert!("quarterly".parse::<ReportType>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Success.is_terminal());
        assert!(RunStatus::Partial.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
    }
}
