use crate::errors::Result;
use crate::hub::HubHandle;
use crate::metrics::{AGGREGATES_EMITTED_TOTAL, STORE_FAILURES_TOTAL};
use crate::model::{AggregateUpdate, HubEvent};
use crate::store::AggregateStore;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Start of the period that contains `now`, aligned to the Unix epoch.
pub fn floor_boundary(now: DateTime<Utc>, period: Duration) -> DateTime<Utc> {
    let period_ms = period.as_millis().max(1) as i64;
    let millis = now.timestamp_millis();
    let floored = millis - millis.rem_euclid(period_ms);
    Utc.timestamp_millis_opt(floored).single().unwrap_or(now)
}

/// First aligned boundary strictly after `now`.
pub fn next_boundary(now: DateTime<Utc>, period: Duration) -> DateTime<Utc> {
    floor_boundary(now, period) + chrono::Duration::milliseconds(period.as_millis().max(1) as i64)
}

/// Boundary closest to `now`. Ticks may fire slightly before or after the
/// boundary they were scheduled for; both stamp that boundary.
pub fn nearest_boundary(now: DateTime<Utc>, period: Duration) -> DateTime<Utc> {
    let half = chrono::Duration::milliseconds(period.as_millis().max(1) as i64 / 2);
    floor_boundary(now + half, period)
}

/// Flushes region totals to aggregate subscribers on wall-clock aligned
/// boundaries (every five minutes by default).
pub struct AggregationScheduler {
    store: Arc<dyn AggregateStore>,
    hub: HubHandle,
    period: Duration,
}

impl AggregationScheduler {
    pub fn new(store: Arc<dyn AggregateStore>, hub: HubHandle, period: Duration) -> Self {
        Self { store, hub, period }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let now = Utc::now();
        let first = next_boundary(now, self.period);
        let wait = (first - now).to_std().unwrap_or_default();
        info!("Aggregation scheduler started, first flush at {}", first.to_rfc3339());

        let mut ticker = tokio::time::interval_at(Instant::now() + wait, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let boundary = nearest_boundary(Utc::now(), self.period);
                    match self.flush(boundary).await {
                        Ok(emitted) => debug!("Flushed {} region totals", emitted.len()),
                        Err(e) => {
                            STORE_FAILURES_TOTAL.inc();
                            warn!("Aggregate flush failed: {}", e);
                        }
                    }
                }
            }
        }

        info!("Aggregation scheduler stopped");
    }

    /// Takes every region's total, emitting an update stamped `at` for each
    /// non-zero one. A region that fails to read is left for the next flush.
    pub async fn flush(&self, at: DateTime<Utc>) -> Result<Vec<AggregateUpdate>> {
        let mut emitted = Vec::new();

        for region in self.store.regions().await? {
            let value = match self.store.take(&region).await {
                Ok(value) => value,
                Err(e) => {
                    STORE_FAILURES_TOTAL.inc();
                    warn!(region = %region, "Failed to take region total: {}", e);
                    continue;
                }
            };
            if value == 0.0 {
                continue;
            }

            let update = AggregateUpdate {
                value,
                timestamp: at,
                city: region,
            };
            if let Err(e) = self.hub.publish(&HubEvent::Aggregate(update.clone())).await {
                warn!(region = %update.city, "Failed to broadcast aggregate: {}", e);
            }
            AGGREGATES_EMITTED_TOTAL.inc();
            emitted.push(update);
        }

        Ok(emitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::tests::{spawn_hub, subscribe};
    use crate::hub::ChannelKind;
    use crate::store::memory::MemoryStore;

    const FIVE_MINUTES: Duration = Duration::from_secs(300);

    #[test]
    fn test_boundaries() {
        let now = Utc.with_ymd_and_hms(2024, 11, 3, 18, 7, 42).unwrap();
        assert_eq!(
            floor_boundary(now, FIVE_MINUTES),
            Utc.with_ymd_and_hms(2024, 11, 3, 18, 5, 0).unwrap()
        );
        assert_eq!(
            next_boundary(now, FIVE_MINUTES),
            Utc.with_ymd_and_hms(2024, 11, 3, 18, 10, 0).unwrap()
        );

        let exact = Utc.with_ymd_and_hms(2024, 11, 3, 18, 10, 0).unwrap();
        assert_eq!(floor_boundary(exact, FIVE_MINUTES), exact);
        assert_eq!(
            next_boundary(exact, FIVE_MINUTES),
            Utc.with_ymd_and_hms(2024, 11, 3, 18, 15, 0).unwrap()
        );
    }

    #[test]
    fn test_early_and_late_ticks_stamp_the_same_boundary() {
        let boundary = Utc.with_ymd_and_hms(2024, 11, 3, 18, 5, 0).unwrap();
        let early = boundary - chrono::Duration::milliseconds(10);
        let late = boundary + chrono::Duration::milliseconds(20);

        assert_eq!(nearest_boundary(early, FIVE_MINUTES), boundary);
        assert_eq!(nearest_boundary(late, FIVE_MINUTES), boundary);
        assert_eq!(nearest_boundary(boundary, FIVE_MINUTES), boundary);
        // Up to half a period late still counts as this boundary.
        assert_eq!(
            nearest_boundary(boundary + chrono::Duration::seconds(149), FIVE_MINUTES),
            boundary
        );
    }

    #[tokio::test]
    async fn test_region_total_is_emitted_once() {
        let store = Arc::new(MemoryStore::default());
        let (hub, shutdown) = spawn_hub();
        let (_, mut updates, _) = subscribe(&hub, "Novi Sad", ChannelKind::Aggregate, 8).await;
        let scheduler = AggregationScheduler::new(store.clone(), hub.clone(), FIVE_MINUTES);

        for value in [4.0, 3.5, 5.0] {
            store.add("Novi Sad", value).await.unwrap();
        }

        let at = Utc.with_ymd_and_hms(2024, 11, 3, 18, 5, 0).unwrap();
        let emitted = scheduler.flush(at).await.unwrap();
        assert_eq!(
            emitted,
            vec![AggregateUpdate {
                value: 12.5,
                timestamp: at,
                city: "Novi Sad".to_string(),
            }]
        );
        assert_eq!(store.region_total("Novi Sad"), None);

        let emitted = scheduler.flush(at + chrono::Duration::minutes(5)).await.unwrap();
        assert!(emitted.is_empty());

        hub.subscriber_count().await.unwrap();
        assert_eq!(
            updates.try_recv().unwrap(),
            r#"{"Value":12.5,"Timestamp":"2024-11-03T18:05:00Z","City":"Novi Sad"}"#
        );
        assert!(updates.try_recv().is_err());

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_zero_totals_are_skipped() {
        let store = Arc::new(MemoryStore::default());
        let (hub, shutdown) = spawn_hub();
        let scheduler = AggregationScheduler::new(store.clone(), hub, FIVE_MINUTES);

        store.add("Belgrade", 0.0).await.unwrap();
        store.add("Nis", 1.25).await.unwrap();

        let emitted = scheduler.flush(Utc::now()).await.unwrap();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].city, "Nis");

        shutdown.cancel();
    }
}
