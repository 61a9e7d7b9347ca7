use std::sync::Arc;

use crate::cache::CacheClient;
use crate::registry::JobRegistry;
use crate::runner::ReportRunner;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<JobRegistry>,
    pub cache: CacheClient,
    pub runner: Arc<ReportRunner>,
}
