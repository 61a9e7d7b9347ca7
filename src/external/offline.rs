use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use tokio::sync::Mutex;

use crate::external::market_data::MarketDataProvider;
use crate::external::report_sink::ReportSink;
use crate::external::sentiment::SentimentProvider;
use crate::external::ProviderError;
use crate::models::report::{
    DualModelSentiment, MarketDataBundle, ModelScore, ReportFragment, TickerQuote,
};
use crate::models::run::ReportType;

/// Deterministic fixture provider: no network, stable quotes per date.
/// Stands in wherever a live vendor integration would be wired.
#[derive(Default)]
pub struct OfflineMarketData {
    warnings: Vec<String>,
}

impl OfflineMarketData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a degraded fetch (fallback vendor, partial coverage)
    #[allow(dead_code)]
    pub fn with_warning(warning: &str) -> Self {
        Self {
            warnings: vec![warning.to_string()],
        }
    }
}

#[async_trait]
impl MarketDataProvider for OfflineMarketData {
    async fn fetch_bundle(
        &self,
        scheduled_date: NaiveDate,
        report_type: ReportType,
    ) -> Result<MarketDataBundle, ProviderError> {
        let quotes = ["SPY", "QQQ", "IWM"]
            .iter()
            .enumerate()
            .map(|(i, ticker)| TickerQuote {
                ticker: ticker.to_string(),
                close: 100.0 + i as f64,
                change_pct: 0.1 * i as f64,
                volume: 1_000_000 + i as i64 * 10_000,
            })
            .collect();
        Ok(MarketDataBundle {
            scheduled_date,
            report_type,
            quotes,
            warnings: self.warnings.clone(),
            fetched_at: Utc::now(),
        })
    }
}

/// Fixture sentiment backend with a configurable secondary slot
pub struct OfflineSentiment {
    secondary_available: bool,
}

impl OfflineSentiment {
    pub fn new() -> Self {
        Self {
            secondary_available: true,
        }
    }

    #[allow(dead_code)]
    pub fn without_secondary() -> Self {
        Self {
            secondary_available: false,
        }
    }
}

impl Default for OfflineSentiment {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SentimentProvider for OfflineSentiment {
    async fn analyze(
        &self,
        _scheduled_date: NaiveDate,
        _report_type: ReportType,
    ) -> Result<DualModelSentiment, ProviderError> {
        let secondary = self.secondary_available.then(|| ModelScore {
            model_role: "secondary".to_string(),
            sentiment: 0.18,
            confidence: 0.6,
            summary: "mildly positive".to_string(),
        });
        Ok(DualModelSentiment {
            primary: ModelScore {
                model_role: "primary".to_string(),
                sentiment: 0.25,
                confidence: 0.8,
                summary: "constructive tone in market coverage".to_string(),
            },
            secondary,
            analyzed_at: Utc::now(),
        })
    }
}

/// In-memory sink; also what runner tests use to observe the storage stage
#[derive(Default)]
pub struct MemoryReportSink {
    fragments: Mutex<Vec<ReportFragment>>,
}

impl MemoryReportSink {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(dead_code)]
    pub async fn persisted(&self) -> Vec<ReportFragment> {
        self.fragments.lock().await.clone()
    }
}

#[async_trait]
impl ReportSink for MemoryReportSink {
    async fn persist(&self, fragment: &ReportFragment) -> Result<(), ProviderError> {
        self.fragments.lock().await.push(fragment.clone());
        Ok(())
    }
}
