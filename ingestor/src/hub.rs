//! Subscriber registry and fan-out.
//!
//! The registry is owned by a single actor task. Registration, removal,
//! broadcasts and count queries all arrive as messages, so the map is never
//! shared and a slow socket can never stall a broadcast: frames are handed
//! to each subscriber's bounded outbound queue with `try_send`, and a
//! subscriber whose queue is full or closed is unregistered on the spot.

use crate::errors::{Error, Result};
use crate::metrics::{DROPPED_DELIVERIES_TOTAL, SUBSCRIBERS};
use crate::model::HubEvent;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Channel a subscriber listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Consumption,
    Status,
    Aggregate,
}

impl FromStr for ChannelKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().trim_end_matches("-update") {
            "consumption" => Ok(ChannelKind::Consumption),
            "status" => Ok(ChannelKind::Status),
            "aggregate" => Ok(ChannelKind::Aggregate),
            other => Err(Error::Validation(format!("unknown channel type '{}'", other))),
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelKind::Consumption => "consumption",
            ChannelKind::Status => "status",
            ChannelKind::Aggregate => "aggregate",
        };
        f.write_str(name)
    }
}

pub struct Subscriber {
    pub id: Uuid,
    /// Device id, or region for aggregate channels.
    pub subject: String,
    pub kind: ChannelKind,
    pub outbound: mpsc::Sender<String>,
    /// Cancelled by the hub when the subscriber is dropped from the registry.
    pub cancel: CancellationToken,
}

struct Broadcast {
    subject: String,
    kind: ChannelKind,
    frame: String,
}

pub struct Hub {
    registry: HashMap<Uuid, Subscriber>,
    register_rx: mpsc::Receiver<Subscriber>,
    unregister_rx: mpsc::UnboundedReceiver<Uuid>,
    broadcast_rx: mpsc::Receiver<Broadcast>,
    query_rx: mpsc::Receiver<oneshot::Sender<usize>>,
}

#[derive(Clone)]
pub struct HubHandle {
    register_tx: mpsc::Sender<Subscriber>,
    unregister_tx: mpsc::UnboundedSender<Uuid>,
    broadcast_tx: mpsc::Sender<Broadcast>,
    query_tx: mpsc::Sender<oneshot::Sender<usize>>,
}

impl Hub {
    pub fn new(capacity: usize) -> (Hub, HubHandle) {
        let (register_tx, register_rx) = mpsc::channel(capacity);
        let (unregister_tx, unregister_rx) = mpsc::unbounded_channel();
        let (broadcast_tx, broadcast_rx) = mpsc::channel(capacity);
        let (query_tx, query_rx) = mpsc::channel(16);

        (
            Hub {
                registry: HashMap::new(),
                register_rx,
                unregister_rx,
                broadcast_rx,
                query_rx,
            },
            HubHandle {
                register_tx,
                unregister_tx,
                broadcast_tx,
                query_tx,
            },
        )
    }

    /// Runs until `shutdown` fires, then closes every remaining subscriber.
    ///
    /// Registrations are served before removals and removals before
    /// broadcasts, so a broadcast never reaches a subscriber that has
    /// already been unregistered.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Subscription hub started");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,
                Some(subscriber) = self.register_rx.recv() => self.register(subscriber),
                Some(id) = self.unregister_rx.recv() => self.unregister(id, "subscriber left"),
                Some(broadcast) = self.broadcast_rx.recv() => self.deliver(broadcast),
                Some(reply) = self.query_rx.recv() => {
                    let _ = reply.send(self.registry.len());
                }
            }
        }

        let remaining = self.registry.len();
        for (_, subscriber) in self.registry.drain() {
            subscriber.cancel.cancel();
        }
        SUBSCRIBERS.set(0.0);
        info!("Subscription hub stopped, closed {} subscribers", remaining);
    }

    fn register(&mut self, subscriber: Subscriber) {
        debug!(
            "Registered subscriber {} for {} on {}",
            subscriber.id, subscriber.subject, subscriber.kind
        );
        self.registry.insert(subscriber.id, subscriber);
        SUBSCRIBERS.set(self.registry.len() as f64);
    }

    fn unregister(&mut self, id: Uuid, reason: &str) {
        if let Some(subscriber) = self.registry.remove(&id) {
            subscriber.cancel.cancel();
            debug!("Unregistered subscriber {}: {}", id, reason);
            SUBSCRIBERS.set(self.registry.len() as f64);
        }
    }

    fn deliver(&mut self, broadcast: Broadcast) {
        let mut failed = Vec::new();

        for (id, subscriber) in &self.registry {
            if subscriber.kind != broadcast.kind || subscriber.subject != broadcast.subject {
                continue;
            }
            match subscriber.outbound.try_send(broadcast.frame.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("Outbound queue of subscriber {} is full", id);
                    failed.push(*id);
                }
                Err(TrySendError::Closed(_)) => failed.push(*id),
            }
        }

        for id in failed {
            DROPPED_DELIVERIES_TOTAL.inc();
            self.unregister(id, "delivery failed");
        }
    }
}

impl HubHandle {
    pub async fn register(&self, subscriber: Subscriber) -> Result<()> {
        self.register_tx
            .send(subscriber)
            .await
            .map_err(|_| Error::ChannelSend)
    }

    pub fn unregister(&self, id: Uuid) {
        // The hub being gone means the registry is gone too.
        let _ = self.unregister_tx.send(id);
    }

    pub async fn broadcast(&self, subject: &str, kind: ChannelKind, frame: String) -> Result<()> {
        self.broadcast_tx
            .send(Broadcast {
                subject: subject.to_string(),
                kind,
                frame,
            })
            .await
            .map_err(|_| Error::ChannelSend)
    }

    pub async fn publish(&self, event: &HubEvent) -> Result<()> {
        let frame = event.to_frame()?;
        self.broadcast(event.subject(), event.kind(), frame).await
    }

    pub async fn subscriber_count(&self) -> Result<usize> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.query_tx
            .send(reply_tx)
            .await
            .map_err(|_| Error::ChannelSend)?;
        reply_rx.await.map_err(|_| Error::ChannelSend)
    }
}
