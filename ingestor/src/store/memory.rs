use super::{AggregateStore, LivenessRecord, LivenessStore};
use crate::errors::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

/// In-process stand-in for Redis. Expiry is driven by the test through
/// [`MemoryStore::expire`].
#[derive(Default)]
pub struct MemoryStore {
    devices: Mutex<BTreeMap<String, LivenessRecord>>,
    regions: Mutex<BTreeMap<String, f64>>,
}

impl MemoryStore {
    pub fn expire(&self, device_id: &str) {
        self.devices.lock().unwrap().remove(device_id);
    }

    pub fn insert_record(&self, record: LivenessRecord) {
        self.devices
            .lock()
            .unwrap()
            .insert(record.device_id.clone(), record);
    }

    pub fn last_status(&self, device_id: &str) -> Option<bool> {
        self.devices
            .lock()
            .unwrap()
            .get(device_id)
            .and_then(|r| r.last_status)
    }

    pub fn region_total(&self, region: &str) -> Option<f64> {
        self.regions.lock().unwrap().get(region).copied()
    }
}

#[async_trait]
impl LivenessStore for MemoryStore {
    async fn touch(&self, device_id: &str, seen_at: DateTime<Utc>, _ttl: Duration) -> Result<()> {
        let mut devices = self.devices.lock().unwrap();
        let record = devices
            .entry(device_id.to_string())
            .or_insert_with(|| LivenessRecord {
                device_id: device_id.to_string(),
                last_seen: None,
                last_status: None,
            });
        record.last_seen = Some(seen_at);
        Ok(())
    }

    async fn device_ids(&self) -> Result<Vec<String>> {
        Ok(self.devices.lock().unwrap().keys().cloned().collect())
    }

    async fn record(&self, device_id: &str) -> Result<Option<LivenessRecord>> {
        Ok(self.devices.lock().unwrap().get(device_id).cloned())
    }

    async fn set_last_status(&self, device_id: &str, alive: bool) -> Result<()> {
        let mut devices = self.devices.lock().unwrap();
        // HSET on an expired hash recreates it without lastSeen.
        let record = devices
            .entry(device_id.to_string())
            .or_insert_with(|| LivenessRecord {
                device_id: device_id.to_string(),
                last_seen: None,
                last_status: None,
            });
        record.last_status = Some(alive);
        Ok(())
    }

    async fn forget(&self, device_id: &str) -> Result<()> {
        self.devices.lock().unwrap().remove(device_id);
        Ok(())
    }
}

#[async_trait]
impl AggregateStore for MemoryStore {
    async fn add(&self, region: &str, value: f64) -> Result<f64> {
        let mut regions = self.regions.lock().unwrap();
        let total = regions.entry(region.to_string()).or_insert(0.0);
        *total += value;
        Ok(*total)
    }

    async fn regions(&self) -> Result<Vec<String>> {
        Ok(self.regions.lock().unwrap().keys().cloned().collect())
    }

    async fn take(&self, region: &str) -> Result<f64> {
        Ok(self.regions.lock().unwrap().remove(region).unwrap_or(0.0))
    }
}
