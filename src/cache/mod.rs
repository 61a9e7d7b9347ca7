pub mod actor;
pub mod client;

pub use client::{CacheClient, CacheConfig, CacheError, CacheMetricsSnapshot, CachedValue, NamespacePolicy};
