use async_trait::async_trait;

use crate::external::ProviderError;
use crate::models::report::ReportFragment;

/// Where finished report payloads go (object store, mail-out, archive)
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn persist(&self, fragment: &ReportFragment) -> Result<(), ProviderError>;
}
