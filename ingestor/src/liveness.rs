//! Device liveness.
//!
//! The absorber turns heartbeats into a short-lived record per device; the
//! sweeper periodically classifies every record as alive or dead and
//! persists transitions. A device whose heartbeats stop long enough for its
//! record to expire simply drops out of the sweep.

use crate::db::StatusStore;
use crate::errors::{Error, Result};
use crate::hub::HubHandle;
use crate::metrics::{
    DB_FAILURES_TOTAL, HEARTBEATS_TOTAL, INVALID_MESSAGES_TOTAL, STATUS_CHANGES_TOTAL,
    STORE_FAILURES_TOTAL, SWEEP_LATENCY_SECONDS, TIMESERIES_FAILURES_TOTAL,
};
use crate::model::{HubEvent, StatusUpdate};
use crate::store::LivenessStore;
use crate::timeseries::{status_point, TimeSeriesSink};
use crate::validate::validate_heartbeat;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wattflow_common::model::Heartbeat;
use wattflow_common::Delivery;

#[derive(Debug, Clone)]
pub struct LivenessSettings {
    pub record_ttl: Duration,
    pub stale_after: chrono::Duration,
    pub sweep_interval: Duration,
}

impl Default for LivenessSettings {
    fn default() -> Self {
        Self {
            record_ttl: Duration::from_secs(60),
            stale_after: chrono::Duration::seconds(30),
            sweep_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// No status was ever recorded for the device.
    New { alive: bool },
    Changed { alive: bool },
    Unchanged { alive: bool },
}

impl Classification {
    pub fn alive(&self) -> bool {
        match *self {
            Classification::New { alive }
            | Classification::Changed { alive }
            | Classification::Unchanged { alive } => alive,
        }
    }

    pub fn requires_write(&self) -> bool {
        !matches!(self, Classification::Unchanged { .. })
    }
}

/// A device is alive when its last heartbeat is no older than `stale_after`.
pub fn classify(
    previous: Option<bool>,
    last_seen: DateTime<Utc>,
    now: DateTime<Utc>,
    stale_after: chrono::Duration,
) -> Classification {
    let alive = now.signed_duration_since(last_seen) <= stale_after;
    match previous {
        None => Classification::New { alive },
        Some(previous) if previous != alive => Classification::Changed { alive },
        Some(_) => Classification::Unchanged { alive },
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub persisted: usize,
    pub forgotten: usize,
}

pub struct LivenessTracker {
    store: Arc<dyn LivenessStore>,
    statuses: Arc<dyn StatusStore>,
    timeseries: Arc<dyn TimeSeriesSink>,
    hub: HubHandle,
    settings: LivenessSettings,
}

impl LivenessTracker {
    pub fn new(
        store: Arc<dyn LivenessStore>,
        statuses: Arc<dyn StatusStore>,
        timeseries: Arc<dyn TimeSeriesSink>,
        hub: HubHandle,
        settings: LivenessSettings,
    ) -> Self {
        Self {
            store,
            statuses,
            timeseries,
            hub,
            settings,
        }
    }

    /// Records one heartbeat as seen at `now`. The heartbeat's own timestamp
    /// is not trusted.
    pub async fn absorb(&self, payload: &[u8], now: DateTime<Utc>) -> Result<()> {
        let heartbeat = serde_json::from_slice::<Heartbeat>(payload)
            .map_err(|e| Error::Validation(format!("JSON parse error: {}", e)))?;
        validate_heartbeat(&heartbeat)?;

        self.store
            .touch(&heartbeat.device_id, now, self.settings.record_ttl)
            .await
    }

    pub async fn run_absorber(
        self: Arc<Self>,
        mut deliveries: mpsc::Receiver<Delivery>,
        shutdown: CancellationToken,
    ) {
        info!("Heartbeat absorber started");

        loop {
            let delivery = tokio::select! {
                _ = shutdown.cancelled() => break,
                delivery = deliveries.recv() => match delivery {
                    Some(delivery) => delivery,
                    None => {
                        warn!("Heartbeat queue closed");
                        break;
                    }
                },
            };

            HEARTBEATS_TOTAL.inc();
            match self.absorb(&delivery.payload, Utc::now()).await {
                Ok(()) => {}
                Err(e @ Error::Validation(_)) => {
                    INVALID_MESSAGES_TOTAL.inc();
                    warn!("Dropping heartbeat on {}: {}", delivery.routing_key, e);
                }
                Err(e) => {
                    STORE_FAILURES_TOTAL.inc();
                    warn!("Failed to record heartbeat: {}", e);
                }
            }
        }

        info!("Heartbeat absorber stopped");
    }

    pub async fn run_sweeper(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            "Liveness sweeper started, interval {:?}, stale after {}s",
            self.settings.sweep_interval,
            self.settings.stale_after.num_seconds()
        );

        let mut ticker = tokio::time::interval(self.settings.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let timer = SWEEP_LATENCY_SECONDS.start_timer();
                    match self.sweep(Utc::now()).await {
                        Ok(report) if report.persisted > 0 || report.forgotten > 0 => {
                            debug!(
                                "Swept {} devices, {} persisted, {} forgotten",
                                report.examined, report.persisted, report.forgotten
                            );
                        }
                        Ok(_) => {}
                        Err(e) => {
                            STORE_FAILURES_TOTAL.inc();
                            warn!("Liveness sweep failed: {}", e);
                        }
                    }
                    timer.observe_duration();
                }
            }
        }

        info!("Liveness sweeper stopped");
    }

    /// Classifies every known device once. Only failing to list devices
    /// fails the sweep; per-device failures are logged and skipped.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        for device_id in self.store.device_ids().await? {
            report.examined += 1;
            match self.sweep_device(&device_id, now).await {
                Ok(Swept::Persisted) => report.persisted += 1,
                Ok(Swept::Forgotten) => report.forgotten += 1,
                Ok(Swept::Untouched) => {}
                Err(e) => {
                    STORE_FAILURES_TOTAL.inc();
                    warn!(device_id = %device_id, "Failed to sweep device: {}", e);
                }
            }
        }

        Ok(report)
    }

    async fn sweep_device(&self, device_id: &str, now: DateTime<Utc>) -> Result<Swept> {
        let Some(record) = self.store.record(device_id).await? else {
            return Ok(Swept::Untouched);
        };

        let Some(last_seen) = record.last_seen else {
            // Status written after the record expired; nothing left to judge.
            debug!(device_id = %device_id, "Dropping liveness record without heartbeat");
            self.store.forget(device_id).await?;
            return Ok(Swept::Forgotten);
        };

        let classification = classify(record.last_status, last_seen, now, self.settings.stale_after);
        let alive = classification.alive();

        let swept = if classification.requires_write() {
            self.persist(device_id, alive, now).await;
            Swept::Persisted
        } else {
            Swept::Untouched
        };

        self.store.set_last_status(device_id, alive).await?;
        Ok(swept)
    }

    /// Durable status, time-series point and live update are independent;
    /// one failing does not stop the others.
    async fn persist(&self, device_id: &str, alive: bool, now: DateTime<Utc>) {
        STATUS_CHANGES_TOTAL.inc();
        info!(device_id = %device_id, "Device is now {}", if alive { "online" } else { "offline" });

        if let Err(e) = self.statuses.upsert_status(device_id, alive).await {
            DB_FAILURES_TOTAL.inc();
            warn!(device_id = %device_id, "Failed to store device status: {}", e);
        }

        if let Err(e) = self.timeseries.write(&status_point(device_id, alive, now)).await {
            TIMESERIES_FAILURES_TOTAL.inc();
            warn!(device_id = %device_id, "Failed to write status point: {}", e);
        }

        let event = HubEvent::Status(StatusUpdate {
            device_id: device_id.to_string(),
            is_active: alive,
        });
        if let Err(e) = self.hub.publish(&event).await {
            warn!(device_id = %device_id, "Failed to broadcast status: {}", e);
        }
    }
}

enum Swept {
    Persisted,
    Forgotten,
    Untouched,
}
