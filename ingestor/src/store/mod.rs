//! Volatile key-value state shared by the pipeline stages: per-device
//! liveness records and per-region running totals.

use crate::errors::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

#[cfg(test)]
pub mod memory;
pub mod redis;

pub use self::redis::RedisStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessRecord {
    pub device_id: String,
    /// `None` when the record exists but its heartbeat field was lost.
    pub last_seen: Option<DateTime<Utc>>,
    pub last_status: Option<bool>,
}

#[async_trait]
pub trait LivenessStore: Send + Sync {
    /// Records a heartbeat and re-arms the record's expiry.
    async fn touch(&self, device_id: &str, seen_at: DateTime<Utc>, ttl: Duration) -> Result<()>;

    async fn device_ids(&self) -> Result<Vec<String>>;

    /// `None` when the record expired since it was listed.
    async fn record(&self, device_id: &str) -> Result<Option<LivenessRecord>>;

    async fn set_last_status(&self, device_id: &str, alive: bool) -> Result<()>;

    async fn forget(&self, device_id: &str) -> Result<()>;
}

#[async_trait]
pub trait AggregateStore: Send + Sync {
    /// Adds to the region's running total and returns the new total.
    async fn add(&self, region: &str, value: f64) -> Result<f64>;

    async fn regions(&self) -> Result<Vec<String>>;

    /// Atomically reads and clears a region's total. Missing regions read as zero.
    async fn take(&self, region: &str) -> Result<f64>;
}
