use async_trait::async_trait;
use chrono::NaiveDate;

use crate::external::ProviderError;
use crate::models::report::MarketDataBundle;
use crate::models::run::ReportType;

/// Upstream market-data seam. Implementations may fall back across vendors;
/// a degraded fetch is reported through `MarketDataBundle::warnings` rather
/// than an error.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    async fn fetch_bundle(
        &self,
        scheduled_date: NaiveDate,
        report_type: ReportType,
    ) -> Result<MarketDataBundle, ProviderError>;
}
