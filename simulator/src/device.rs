//! A simulated meter and its buffered publisher.
//!
//! Measurements that cannot be published are kept in a FIFO buffer and
//! replayed, oldest first, as soon as the broker reports a reconnect and
//! always before a newer measurement is sent. Heartbeats are never
//! buffered: a missed one is superseded by the next tick.

use crate::buffer::{MessageBuffer, MessageKind, OutboundMessage};
use crate::errors::Result;
use crate::household::Household;
use crate::journal::Journal;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wattflow_common::model::{Heartbeat, Location, Measurement};
use wattflow_common::{routing, LinkStatus, Publish};

#[derive(Debug, Clone)]
pub struct DeviceSettings {
    pub measurement_interval: Duration,
    pub heartbeat_interval: Duration,
    pub time_step: chrono::Duration,
    pub flush_timeout: Duration,
}

pub struct Device {
    pub id: String,
    pub location: Location,
    household: Household,
    /// Simulated time stamped on the next measurement.
    clock: DateTime<Utc>,
    journal: Option<Journal>,
}

impl Device {
    pub fn new(id: String, location: Location, start: DateTime<Utc>, journal: Option<Journal>) -> Self {
        let household = Household::for_device(&id);
        Self {
            id,
            location,
            household,
            clock: start,
            journal,
        }
    }

    fn next_measurement(&mut self, step: chrono::Duration) -> Measurement {
        let timestamp = self.clock;
        self.clock = timestamp + step;
        Measurement {
            device_id: self.id.clone(),
            value: self.household.simulate_consumption(timestamp),
            timestamp,
            address: self.location.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Sent,
    Buffered,
    Dropped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushReport {
    pub sent: usize,
    pub remaining: usize,
}

/// Publishes buffered messages oldest first. Stops at the first failure and
/// puts that message and everything after it back, so order is preserved
/// and nothing is sent twice.
pub async fn flush(publisher: &dyn Publish, buffer: &mut MessageBuffer) -> FlushReport {
    let mut pending = buffer.take();
    let mut sent = 0;

    while let Some(message) = pending.pop_front() {
        match publisher.publish(&message.routing_key, message.payload.clone()).await {
            Ok(()) => {
                sent += 1;
                debug!("Sent buffered {:?} message", message.kind);
            }
            Err(e) => {
                debug!("Buffered message still failing: {}", e);
                pending.push_front(message);
                break;
            }
        }
    }

    let remaining = pending.len();
    buffer.restore(pending);
    FlushReport { sent, remaining }
}

pub struct BufferedPublisher {
    device: Device,
    publisher: Arc<dyn Publish>,
    link: watch::Receiver<LinkStatus>,
    last_epoch: u64,
    buffer: MessageBuffer,
    settings: DeviceSettings,
}

impl BufferedPublisher {
    pub fn new(
        device: Device,
        publisher: Arc<dyn Publish>,
        mut link: watch::Receiver<LinkStatus>,
        settings: DeviceSettings,
    ) -> Self {
        let last_epoch = link.borrow_and_update().epoch;
        Self {
            device,
            publisher,
            link,
            last_epoch,
            buffer: MessageBuffer::new(),
            settings,
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Runs until `shutdown` fires, then makes one bounded attempt to flush
    /// the buffer. Returns the number of messages that were never sent.
    pub async fn run(mut self, shutdown: CancellationToken) -> usize {
        let device_id = self.device.id.clone();
        info!(device_id = %device_id, city = %self.device.location.city, "Device started");

        let period = self.settings.measurement_interval;
        let mut measurements = interval_at(Instant::now() + period, period);
        measurements.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeats = interval(self.settings.heartbeat_interval);
        heartbeats.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut link_open = true;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,
                changed = self.link.changed(), if link_open => {
                    if changed.is_err() {
                        warn!(device_id = %device_id, "Broker link closed");
                        link_open = false;
                        continue;
                    }
                    self.on_link_change().await;
                }
                _ = measurements.tick() => {
                    self.on_measurement_tick().await;
                }
                _ = heartbeats.tick() => {
                    self.on_heartbeat_tick().await;
                }
            }
        }

        if !self.buffer.is_empty() {
            info!(device_id = %device_id, "Flushing {} buffered messages before exit", self.buffer.len());
            let publisher = self.publisher.clone();
            let flushed = tokio::time::timeout(
                self.settings.flush_timeout,
                flush(publisher.as_ref(), &mut self.buffer),
            )
            .await;
            if flushed.is_err() {
                warn!(device_id = %device_id, "Final flush timed out");
            }
        }

        let remaining = self.buffer.len();
        info!(device_id = %device_id, remaining, "Device stopped");
        remaining
    }

    pub async fn on_link_change(&mut self) {
        let status = *self.link.borrow_and_update();
        if !status.is_connected() {
            debug!(device_id = %self.device.id, "Broker link is {:?}", status.state);
            return;
        }
        if status.epoch == self.last_epoch {
            return;
        }
        self.last_epoch = status.epoch;

        if self.buffer.is_empty() {
            return;
        }
        info!(
            device_id = %self.device.id,
            "Broker reconnected, flushing {} buffered messages",
            self.buffer.len()
        );
        let report = flush(self.publisher.as_ref(), &mut self.buffer).await;
        if report.remaining > 0 {
            warn!(
                device_id = %self.device.id,
                "Flush interrupted: {} sent, {} still buffered",
                report.sent,
                report.remaining
            );
        }
    }

    pub async fn on_measurement_tick(&mut self) -> PublishOutcome {
        let measurement = self.device.next_measurement(self.settings.time_step);

        if let Some(journal) = self.device.journal.as_mut() {
            if let Err(e) = journal.append(&measurement) {
                warn!(device_id = %self.device.id, "Failed to journal measurement: {}", e);
            }
        }

        let routing_key = measurement.routing_key();
        let message = match encode(MessageKind::Measurement, routing_key, &measurement, measurement.timestamp) {
            Ok(message) => message,
            Err(e) => {
                warn!(device_id = %self.device.id, "Failed to serialize measurement: {}", e);
                return PublishOutcome::Dropped;
            }
        };

        // A newer measurement must never overtake buffered ones.
        if !self.buffer.is_empty() {
            flush(self.publisher.as_ref(), &mut self.buffer).await;
        }
        if !self.buffer.is_empty() {
            self.buffer.push(message);
            debug!(device_id = %self.device.id, "Buffered measurement, {} pending", self.buffer.len());
            return PublishOutcome::Buffered;
        }

        match self.publisher.publish(&message.routing_key, message.payload.clone()).await {
            Ok(()) => {
                debug!(device_id = %self.device.id, "Sent measurement");
                PublishOutcome::Sent
            }
            Err(e) => {
                warn!(device_id = %self.device.id, "Failed to send measurement: {}", e);
                self.buffer.push(message);
                PublishOutcome::Buffered
            }
        }
    }

    pub async fn on_heartbeat_tick(&mut self) -> PublishOutcome {
        let heartbeat = Heartbeat {
            device_id: self.device.id.clone(),
            timestamp: Utc::now(),
        };
        let routing_key = routing::heartbeat_key(&self.device.location.city);
        let message = match encode(MessageKind::Heartbeat, routing_key, &heartbeat, heartbeat.timestamp) {
            Ok(message) => message,
            Err(e) => {
                warn!(device_id = %self.device.id, "Failed to serialize heartbeat: {}", e);
                return PublishOutcome::Dropped;
            }
        };

        match self.publisher.publish(&message.routing_key, message.payload).await {
            Ok(()) => {
                debug!(device_id = %self.device.id, "Sent heartbeat");
                PublishOutcome::Sent
            }
            Err(e) => {
                warn!(device_id = %self.device.id, "Failed to send heartbeat: {}", e);
                PublishOutcome::Dropped
            }
        }
    }
}

fn encode<T: serde::Serialize>(
    kind: MessageKind,
    routing_key: String,
    body: &T,
    timestamp: DateTime<Utc>,
) -> Result<OutboundMessage> {
    Ok(OutboundMessage {
        kind,
        routing_key,
        payload: serde_json::to_vec(body)?,
        timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::Mutex;
    use wattflow_common::{ConnectionState, Error};

    /// Records successful publishes; fails while `budget` is exhausted.
    #[derive(Default)]
    struct FakePublisher {
        sent: Mutex<Vec<(String, Vec<u8>)>>,
        /// `None` = always succeed, `Some(n)` = n more successes then fail.
        budget: Mutex<Option<usize>>,
    }

    impl FakePublisher {
        fn failing() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                budget: Mutex::new(Some(0)),
            }
        }

        fn set_budget(&self, budget: Option<usize>) {
            *self.budget.lock().unwrap() = budget;
        }

        fn measurements(&self) -> Vec<Measurement> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(key, _)| key.starts_with("measurement."))
                .map(|(_, payload)| serde_json::from_slice(payload).unwrap())
                .collect()
        }
    }

    #[async_trait]
    impl Publish for FakePublisher {
        async fn publish(&self, routing_key: &str, payload: Vec<u8>) -> wattflow_common::Result<()> {
            let mut budget = self.budget.lock().unwrap();
            match budget.as_mut() {
                Some(0) => return Err(Error::NotConnected),
                Some(n) => *n -= 1,
                None => {}
            }
            self.sent.lock().unwrap().push((routing_key.to_string(), payload));
            Ok(())
        }
    }

    fn settings() -> DeviceSettings {
        DeviceSettings {
            measurement_interval: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(5),
            time_step: chrono::Duration::hours(1),
            flush_timeout: Duration::from_secs(5),
        }
    }

    fn device() -> Device {
        Device::new(
            "dev-1".to_string(),
            Location {
                city: "Novi Sad".to_string(),
                street: "Zmaj Jovina".to_string(),
                number: "4".to_string(),
            },
            Utc.with_ymd_and_hms(2024, 11, 3, 0, 0, 0).unwrap(),
            None,
        )
    }

    fn connected(epoch: u64) -> LinkStatus {
        LinkStatus {
            state: ConnectionState::Connected,
            epoch,
        }
    }

    fn buffered_publisher(fake: Arc<FakePublisher>) -> (BufferedPublisher, watch::Sender<LinkStatus>) {
        let (link_tx, link_rx) = watch::channel(connected(1));
        let publisher = BufferedPublisher::new(device(), fake, link_rx, settings());
        (publisher, link_tx)
    }

    #[test]
    fn test_buffered_messages_flushed_in_order_before_new_tick() {
        tokio_test::block_on(async {
            let fake = Arc::new(FakePublisher::failing());
            let (mut publisher, link) = buffered_publisher(fake.clone());

            link.send_replace(LinkStatus {
                state: ConnectionState::Reconnecting,
                epoch: 1,
            });
            publisher.on_link_change().await;

            for _ in 0..5 {
                assert_eq!(publisher.on_measurement_tick().await, PublishOutcome::Buffered);
            }
            assert_eq!(publisher.buffered(), 5);
            assert!(fake.measurements().is_empty());

            fake.set_budget(None);
            link.send_replace(connected(2));
            publisher.on_link_change().await;
            assert_eq!(publisher.buffered(), 0);

            assert_eq!(publisher.on_measurement_tick().await, PublishOutcome::Sent);

            let sent = fake.measurements();
            assert_eq!(sent.len(), 6);
            let start = Utc.with_ymd_and_hms(2024, 11, 3, 0, 0, 0).unwrap();
            for (i, m) in sent.iter().enumerate() {
                assert_eq!(m.timestamp, start + chrono::Duration::hours(i as i64));
            }
        });
    }

    #[test]
    fn test_interrupted_flush_keeps_order_without_duplicates() {
        tokio_test::block_on(async {
            let fake = Arc::new(FakePublisher::failing());
            let (mut publisher, link) = buffered_publisher(fake.clone());

            for _ in 0..4 {
                publisher.on_measurement_tick().await;
            }

            // Connection drops again after two messages go out.
            fake.set_budget(Some(2));
            link.send_replace(connected(2));
            publisher.on_link_change().await;
            assert_eq!(publisher.buffered(), 2);

            // A tick while still failing lands behind the leftovers.
            assert_eq!(publisher.on_measurement_tick().await, PublishOutcome::Buffered);
            assert_eq!(publisher.buffered(), 3);

            fake.set_budget(None);
            link.send_replace(connected(3));
            publisher.on_link_change().await;
            assert_eq!(publisher.buffered(), 0);

            let timestamps: Vec<_> = fake.measurements().iter().map(|m| m.timestamp).collect();
            assert_eq!(timestamps.len(), 5);
            assert!(timestamps.windows(2).all(|w| w[0] < w[1]));
        });
    }

    #[test]
    fn test_same_epoch_does_not_flush() {
        tokio_test::block_on(async {
            let fake = Arc::new(FakePublisher::failing());
            let (mut publisher, link) = buffered_publisher(fake.clone());

            publisher.on_measurement_tick().await;
            fake.set_budget(None);

            link.send_replace(connected(1));
            publisher.on_link_change().await;
            assert_eq!(publisher.buffered(), 1);
        });
    }

    #[test]
    fn test_heartbeats_are_not_buffered() {
        tokio_test::block_on(async {
            let fake = Arc::new(FakePublisher::failing());
            let (mut publisher, _link) = buffered_publisher(fake.clone());

            assert_eq!(publisher.on_heartbeat_tick().await, PublishOutcome::Dropped);
            assert_eq!(publisher.buffered(), 0);

            fake.set_budget(None);
            assert_eq!(publisher.on_heartbeat_tick().await, PublishOutcome::Sent);
            let sent = fake.sent.lock().unwrap();
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].0, "heartbeat.Novi Sad");
            let heartbeat: Heartbeat = serde_json::from_slice(&sent[0].1).unwrap();
            assert_eq!(heartbeat.device_id, "dev-1");
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_remaining_buffer() {
        let fake = Arc::new(FakePublisher::failing());
        let (mut publisher, _link) = buffered_publisher(fake.clone());

        publisher.on_measurement_tick().await;
        publisher.on_measurement_tick().await;
        fake.set_budget(None);

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let remaining = publisher.run(shutdown).await;

        assert_eq!(remaining, 0);
        assert_eq!(fake.measurements().len(), 2);
    }
}
