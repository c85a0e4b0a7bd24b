use super::{AggregateStore, LivenessRecord, LivenessStore};
use crate::errors::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

const DEVICE_PREFIX: &str = "device:";
const REGION_PREFIX: &str = "region:";
const LAST_SEEN: &str = "lastSeen";
const LAST_STATUS: &str = "lastStatus";
const SCAN_COUNT: usize = 200;

/// Redis-backed liveness and aggregate state.
///
/// Liveness lives in a hash per device (`device:<id>`) that expires when
/// heartbeats stop; region totals are plain float keys (`region:<city>`).
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Connecting to Redis...");
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("Redis connection established");
        Ok(Self { conn })
    }

    /// Lists keys with the given prefix. SCAN may repeat keys, so the
    /// result is de-duplicated.
    async fn scan(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", prefix);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            keys.extend(
                batch
                    .into_iter()
                    .filter_map(|key| key.strip_prefix(prefix).map(str::to_string)),
            );
            if next == 0 {
                break;
            }
            cursor = next;
        }

        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

fn device_key(device_id: &str) -> String {
    format!("{}{}", DEVICE_PREFIX, device_id)
}

fn region_key(region: &str) -> String {
    format!("{}{}", REGION_PREFIX, region)
}

fn parse_status(raw: &str) -> Option<bool> {
    match raw {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

fn parse_record(device_id: &str, fields: &HashMap<String, String>) -> LivenessRecord {
    let last_seen = fields.get(LAST_SEEN).and_then(|raw| match DateTime::parse_from_rfc3339(raw) {
        Ok(ts) => Some(ts.with_timezone(&Utc)),
        Err(e) => {
            warn!(device_id = %device_id, "Unreadable lastSeen '{}': {}", raw, e);
            None
        }
    });
    LivenessRecord {
        device_id: device_id.to_string(),
        last_seen,
        last_status: fields.get(LAST_STATUS).and_then(|raw| parse_status(raw)),
    }
}

#[async_trait]
impl LivenessStore for RedisStore {
    async fn touch(&self, device_id: &str, seen_at: DateTime<Utc>, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let key = device_key(device_id);
        redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(&key)
            .arg(LAST_SEEN)
            .arg(seen_at.to_rfc3339())
            .ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(ttl.as_secs().max(1))
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        debug!(device_id = %device_id, "Heartbeat recorded");
        Ok(())
    }

    async fn device_ids(&self) -> Result<Vec<String>> {
        self.scan(DEVICE_PREFIX).await
    }

    async fn record(&self, device_id: &str) -> Result<Option<LivenessRecord>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(device_key(device_id))
            .query_async(&mut conn)
            .await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(parse_record(device_id, &fields)))
    }

    async fn set_last_status(&self, device_id: &str, alive: bool) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("HSET")
            .arg(device_key(device_id))
            .arg(LAST_STATUS)
            .arg(if alive { "true" } else { "false" })
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn forget(&self, device_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(device_key(device_id))
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl AggregateStore for RedisStore {
    async fn add(&self, region: &str, value: f64) -> Result<f64> {
        let mut conn = self.conn.clone();
        let total: f64 = redis::cmd("INCRBYFLOAT")
            .arg(region_key(region))
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(total)
    }

    async fn regions(&self) -> Result<Vec<String>> {
        self.scan(REGION_PREFIX).await
    }

    async fn take(&self, region: &str) -> Result<f64> {
        let mut conn = self.conn.clone();
        let key = region_key(region);
        let (total,): (Option<f64>,) = redis::pipe()
            .atomic()
            .cmd("GET")
            .arg(&key)
            .cmd("DEL")
            .arg(&key)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(total.unwrap_or(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_record() {
        let mut fields = HashMap::new();
        fields.insert(LAST_SEEN.to_string(), "2024-11-03T18:00:00+01:00".to_string());
        fields.insert(LAST_STATUS.to_string(), "false".to_string());

        let record = parse_record("dev-1", &fields);
        assert_eq!(
            record.last_seen,
            Some(Utc.with_ymd_and_hms(2024, 11, 3, 17, 0, 0).unwrap())
        );
        assert_eq!(record.last_status, Some(false));
    }

    #[test]
    fn test_parse_record_without_heartbeat() {
        let mut fields = HashMap::new();
        fields.insert(LAST_STATUS.to_string(), "1".to_string());

        let record = parse_record("dev-1", &fields);
        assert_eq!(record.last_seen, None);
        assert_eq!(record.last_status, Some(true));
    }

    #[test]
    fn test_keys() {
        assert_eq!(device_key("dev-1"), "device:dev-1");
        assert_eq!(region_key("Novi Sad"), "region:Novi Sad");
        assert_eq!(parse_status("maybe"), None);
    }
}
