use std::sync::Arc;

use serde_json::json;
use tracing::debug;

use crate::models::report::{DualModelSentiment, MarketDataBundle, ReportFragment};
use crate::models::run::{JobRun, Stage, StageOutcome};
use crate::runner::ReportRunner;

/// What one stage reports back to the registry
pub(crate) struct StageReport {
    pub outcome: StageOutcome,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub details: Option<String>,
}

impl StageReport {
    fn success(details: String) -> Self {
        Self {
            outcome: StageOutcome::Success,
            warnings: Vec::new(),
            errors: Vec::new(),
            details: Some(details),
        }
    }

    fn partial(warnings: Vec<String>, details: String) -> Self {
        Self {
            outcome: StageOutcome::PartialError,
            warnings,
            errors: Vec::new(),
            details: Some(details),
        }
    }

    fn fatal(error: String) -> Self {
        Self {
            outcome: StageOutcome::FatalError,
            warnings: Vec::new(),
            errors: vec![error],
            details: None,
        }
    }
}

/// Cache key shared by every artifact a run produces
fn artifact_key(run: &JobRun) -> String {
    format!("{}:{}", run.scheduled_date, run.report_type)
}

impl ReportRunner {
    pub(crate) async fn run_stage(&self, stage: Stage, run: &JobRun) -> StageReport {
        debug!("Run {} stage {} starting", run.run_id, stage);
        match stage {
            Stage::Init => self.stage_init(run).await,
            Stage::DataFetch => self.stage_data_fetch(run).await,
            Stage::AiAnalysis => self.stage_ai_analysis(run).await,
            Stage::Storage => self.stage_storage(run).await,
            Stage::Finalize => self.stage_finalize(run).await,
        }
    }

    async fn stage_init(&self, run: &JobRun) -> StageReport {
        StageReport::success(format!(
            "run opened by {} for {} {}",
            run.trigger_source, run.scheduled_date, run.report_type
        ))
    }

    /// Pulls the market bundle through the cache; many concurrent runs for
    /// the same key share one upstream fetch
    async fn stage_data_fetch(&self, run: &JobRun) -> StageReport {
        let provider = Arc::clone(&self.market_data);
        let (date, report_type) = (run.scheduled_date, run.report_type);
        let fetched = self
            .cache
            .revalidate_with_policy("market_data", &artifact_key(run), move || async move {
                let bundle = provider.fetch_bundle(date, report_type).await?;
                Ok(serde_json::to_value(&bundle)?)
            })
            .await;

        let cached = match fetched {
            Ok(cached) => cached,
            Err(e) => return StageReport::fatal(format!("market data fetch failed: {}", e)),
        };
        let bundle: MarketDataBundle = match serde_json::from_value(cached.value) {
            Ok(bundle) => bundle,
            Err(e) => return StageReport::fatal(format!("corrupt market data artifact: {}", e)),
        };
        if bundle.quotes.is_empty() {
            return StageReport::fatal("market data bundle contained no quotes".to_string());
        }

        let details = format!(
            "{} quotes cached (age {}s{})",
            bundle.quotes.len(),
            cached.age_seconds,
            if cached.is_stale { ", stale" } else { "" }
        );
        if bundle.warnings.is_empty() {
            StageReport::success(details)
        } else {
            StageReport::partial(bundle.warnings, details)
        }
    }

    async fn stage_ai_analysis(&self, run: &JobRun) -> StageReport {
        let provider = Arc::clone(&self.sentiment);
        let (date, report_type) = (run.scheduled_date, run.report_type);
        let analyzed = self
            .cache
            .revalidate_with_policy("sentiment", &artifact_key(run), move || async move {
                let sentiment = provider.analyze(date, report_type).await?;
                Ok(serde_json::to_value(&sentiment)?)
            })
            .await;

        let cached = match analyzed {
            Ok(cached) => cached,
            Err(e) => return StageReport::fatal(format!("sentiment analysis failed: {}", e)),
        };
        let sentiment: DualModelSentiment = match serde_json::from_value(cached.value) {
            Ok(sentiment) => sentiment,
            Err(e) => return StageReport::fatal(format!("corrupt sentiment artifact: {}", e)),
        };

        let details = format!(
            "primary sentiment {:.2} (confidence {:.2})",
            sentiment.primary.sentiment, sentiment.primary.confidence
        );
        if sentiment.secondary.is_none() {
            StageReport::partial(
                vec!["secondary model unavailable; single-model sentiment".to_string()],
                details,
            )
        } else {
            StageReport::success(details)
        }
    }

    /// Assembles the fragment from the cached artifacts and hands it to the sink
    async fn stage_storage(&self, run: &JobRun) -> StageReport {
        let key = artifact_key(run);
        let market = match self.cache.get("market_data", &key).await {
            Ok(Some(cached)) => cached.value,
            Ok(None) => {
                return StageReport::fatal("market data artifact expired before storage".to_string())
            }
            Err(e) => return StageReport::fatal(format!("market data read failed: {}", e)),
        };
        let sentiment = match self.cache.get("sentiment", &key).await {
            Ok(Some(cached)) => cached.value,
            Ok(None) => {
                return StageReport::fatal("sentiment artifact expired before storage".to_string())
            }
            Err(e) => return StageReport::fatal(format!("sentiment read failed: {}", e)),
        };

        let bundle: MarketDataBundle = match serde_json::from_value(market.clone()) {
            Ok(bundle) => bundle,
            Err(e) => return StageReport::fatal(format!("corrupt market data artifact: {}", e)),
        };
        let scores: DualModelSentiment = match serde_json::from_value(sentiment.clone()) {
            Ok(scores) => scores,
            Err(e) => return StageReport::fatal(format!("corrupt sentiment artifact: {}", e)),
        };

        let fragment = ReportFragment {
            run_id: run.run_id.clone(),
            scheduled_date: run.scheduled_date,
            report_type: run.report_type,
            quote_count: bundle.quotes.len(),
            headline_sentiment: scores.primary.sentiment,
            body: json!({
                "market_data": market,
                "sentiment": sentiment,
            }),
        };

        match self.sink.persist(&fragment).await {
            Ok(()) => StageReport::success(format!(
                "fragment persisted ({} quotes)",
                fragment.quote_count
            )),
            Err(e) => StageReport::fatal(format!("report persistence failed: {}", e)),
        }
    }

    /// Publishes the run summary into the reports namespace for readers
    async fn stage_finalize(&self, run: &JobRun) -> StageReport {
        let key = artifact_key(run);
        let summary = json!({
            "run_id": run.run_id,
            "scheduled_date": run.scheduled_date,
            "report_type": run.report_type,
            "trigger_source": run.trigger_source,
        });
        let policy = self.cache.policy("reports");
        match self.cache.set("reports", &key, summary, policy.ttl).await {
            Ok(()) => StageReport::success("run summary published".to_string()),
            Err(e) => StageReport::partial(
                vec![format!("run summary cache write failed: {}", e)],
                "finalize completed without summary artifact".to_string(),
            ),
        }
    }
}
