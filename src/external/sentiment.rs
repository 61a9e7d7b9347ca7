use async_trait::async_trait;
use chrono::NaiveDate;

use crate::external::ProviderError;
use crate::models::report::DualModelSentiment;
use crate::models::run::ReportType;

/// Inference seam producing the two-slot sentiment result. The secondary
/// slot is best-effort: a missing secondary comes back as None, never as an
/// error.
#[async_trait]
pub trait SentimentProvider: Send + Sync {
    async fn analyze(
        &self,
        scheduled_date: NaiveDate,
        report_type: ReportType,
    ) -> Result<DualModelSentiment, ProviderError>;
}
