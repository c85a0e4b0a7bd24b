use crate::errors::{Error, Result};
use crate::hub::HubHandle;
use crate::metrics::{
    INVALID_MESSAGES_TOTAL, MEASUREMENTS_TOTAL, STORE_FAILURES_TOTAL, TIMESERIES_FAILURES_TOTAL,
};
use crate::model::{ConsumptionUpdate, HubEvent};
use crate::store::AggregateStore;
use crate::timeseries::{consumption_point, TimeSeriesSink};
use crate::validate::validate_measurement;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wattflow_common::model::Measurement;
use wattflow_common::Delivery;

/// Consumes the measurement queue. Each valid measurement is written as a
/// time-series point, added to its region's running total and pushed to
/// live subscribers of the device.
pub struct ConsumptionIngestor {
    timeseries: Arc<dyn TimeSeriesSink>,
    aggregates: Arc<dyn AggregateStore>,
    hub: HubHandle,
}

impl ConsumptionIngestor {
    pub fn new(
        timeseries: Arc<dyn TimeSeriesSink>,
        aggregates: Arc<dyn AggregateStore>,
        hub: HubHandle,
    ) -> Self {
        Self {
            timeseries,
            aggregates,
            hub,
        }
    }

    pub async fn run(self, mut deliveries: mpsc::Receiver<Delivery>, shutdown: CancellationToken) {
        info!("Consumption ingestor started");

        loop {
            let delivery = tokio::select! {
                _ = shutdown.cancelled() => break,
                delivery = deliveries.recv() => match delivery {
                    Some(delivery) => delivery,
                    None => {
                        warn!("Measurement queue closed");
                        break;
                    }
                },
            };

            MEASUREMENTS_TOTAL.inc();
            debug!(
                "Received measurement on {}, size: {} bytes",
                delivery.routing_key,
                delivery.payload.len()
            );

            if let Err(e) = self.process(&delivery.payload).await {
                INVALID_MESSAGES_TOTAL.inc();
                warn!("Dropping measurement on {}: {}", delivery.routing_key, e);
            }
        }

        info!("Consumption ingestor stopped");
    }

    /// Only parse and validation failures are returned. The three effects are
    /// attempted independently and their failures are logged.
    pub async fn process(&self, payload: &[u8]) -> Result<()> {
        let measurement = serde_json::from_slice::<Measurement>(payload)
            .map_err(|e| Error::Validation(format!("JSON parse error: {}", e)))?;
        validate_measurement(&measurement)?;

        if let Err(e) = self.timeseries.write(&consumption_point(&measurement)).await {
            TIMESERIES_FAILURES_TOTAL.inc();
            warn!(device_id = %measurement.device_id, "Failed to write consumption point: {}", e);
        }

        let region = measurement.address.city.trim();
        if let Err(e) = self.aggregates.add(region, measurement.value).await {
            STORE_FAILURES_TOTAL.inc();
            warn!(region = %region, "Failed to add to region total: {}", e);
        }

        let event = HubEvent::Consumption(ConsumptionUpdate {
            device_id: measurement.device_id.clone(),
            consumption: measurement.value,
        });
        if let Err(e) = self.hub.publish(&event).await {
            warn!(device_id = %measurement.device_id, "Failed to broadcast consumption: {}", e);
        }

        Ok(())
    }
}
