use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::models::run::ReportType;

/// Single quote inside a fetched market bundle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TickerQuote {
    pub ticker: String,
    pub close: f64,
    pub change_pct: f64,
    pub volume: i64,
}

/// Everything the data_fetch stage pulls for one report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketDataBundle {
    pub scheduled_date: NaiveDate,
    pub report_type: ReportType,
    pub quotes: Vec<TickerQuote>,
    /// Degraded-fetch notes (fallback provider used, partial coverage)
    pub warnings: Vec<String>,
    pub fetched_at: DateTime<Utc>,
}

/// Score emitted by one inference model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelScore {
    pub model_role: String, // "primary" or "secondary", never a vendor name
    pub sentiment: f64,     // -1.0 to +1.0
    pub confidence: f64,    // 0.0 to 1.0
    pub summary: String,
}

/// Two-slot sentiment result from the ai_analysis stage.
/// The secondary slot is best-effort; a missing secondary is a warning, not a failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DualModelSentiment {
    pub primary: ModelScore,
    pub secondary: Option<ModelScore>,
    pub analyzed_at: DateTime<Utc>,
}

/// Assembled report payload handed to the sink by the storage stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportFragment {
    pub run_id: String,
    pub scheduled_date: NaiveDate,
    pub report_type: ReportType,
    pub quote_count: usize,
    pub headline_sentiment: f64,
    pub body: serde_json::Value,
}
