pub mod market_data;
pub mod offline;
pub mod report_sink;
pub mod sentiment;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("network error: {0}")]
    Network(String),

    #[error("bad response: {0}")]
    BadResponse(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),
}
