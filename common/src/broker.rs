//! Broker connection manager.
//!
//! A [`Broker`] is a cheap, cloneable handle. The MQTT event loop itself is
//! owned by a single connection task which tracks the link state, replays
//! queue declarations after every reconnect and routes incoming publishes
//! to the consumers registered through [`Broker::consume`].

use crate::errors::{Error, Result};
use crate::routing;
use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnAck, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const MEASUREMENTS_QUEUE: &str = "measurements_queue";
pub const HEARTBEATS_QUEUE: &str = "heartbeats_queue";

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub exchange: String,
    pub keep_alive: Duration,
    pub reconnect_delay: Duration,
    pub connect_timeout: Duration,
    /// Keep the broker-side session (and its queued messages) across reconnects.
    pub persistent_session: bool,
    pub request_capacity: usize,
    pub delivery_capacity: usize,
}

impl BrokerConfig {
    pub fn new(host: impl Into<String>, port: u16, client_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: client_id.into(),
            exchange: "watt-flow".to_string(),
            keep_alive: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            persistent_session: false,
            request_capacity: 10_000,
            delivery_capacity: 1_000,
        }
    }
}

/// A named queue bound to the exchange with a binding pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub name: String,
    pub pattern: String,
}

#[derive(Debug, Clone, Default)]
pub struct Topology {
    pub queues: Vec<QueueBinding>,
}

impl Topology {
    /// Exchange only. Used by producers, which must not subscribe to their own traffic.
    pub fn exchange_only() -> Self {
        Self::default()
    }

    /// The durable measurement and heartbeat queues.
    pub fn telemetry() -> Self {
        Self {
            queues: vec![
                QueueBinding {
                    name: MEASUREMENTS_QUEUE.to_string(),
                    pattern: routing::MEASUREMENT_PATTERN.to_string(),
                },
                QueueBinding {
                    name: HEARTBEATS_QUEUE.to_string(),
                    pattern: routing::HEARTBEAT_PATTERN.to_string(),
                },
            ],
        }
    }

    fn binding(&self, queue: &str) -> Option<&QueueBinding> {
        self.queues.iter().find(|q| q.name == queue)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Reconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkSignal {
    /// The connection was closed or a connection attempt failed.
    Lost,
    /// A new attempt has been scheduled after the reconnect delay.
    RetryScheduled,
    /// CONNACK received.
    Established,
}

impl ConnectionState {
    pub fn on(self, signal: LinkSignal) -> ConnectionState {
        match (self, signal) {
            (_, LinkSignal::Established) => ConnectionState::Connected,
            (ConnectionState::Connected, LinkSignal::Lost) => ConnectionState::Disconnected,
            (ConnectionState::Connected, LinkSignal::RetryScheduled) => ConnectionState::Connected,
            (_, LinkSignal::RetryScheduled) => ConnectionState::Reconnecting,
            (state, LinkSignal::Lost) => state,
        }
    }
}

/// Current link state plus the number of successful connections so far.
/// Dependents compare `epoch` values to spot a reconnect even when the
/// intermediate states were never observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkStatus {
    pub state: ConnectionState,
    pub epoch: u64,
}

impl LinkStatus {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub routing_key: String,
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait Publish: Send + Sync {
    async fn publish(&self, routing_key: &str, payload: Vec<u8>) -> Result<()>;
}

enum Command {
    Consume {
        queue: String,
        pattern: String,
        tx: mpsc::Sender<Delivery>,
    },
}

#[derive(Clone)]
pub struct Broker {
    client: AsyncClient,
    exchange: Arc<str>,
    topology: Arc<Topology>,
    link: watch::Receiver<LinkStatus>,
    commands: mpsc::Sender<Command>,
    delivery_capacity: usize,
    stop: CancellationToken,
}

impl Broker {
    /// Establishes the first connection and spawns the connection task.
    ///
    /// Fails if no CONNACK arrives within `connect_timeout`; callers treat
    /// that as fatal. Every later connection loss is retried forever.
    pub async fn connect(
        config: BrokerConfig,
        topology: Topology,
        shutdown: &CancellationToken,
    ) -> Result<(Broker, JoinHandle<()>)> {
        info!(
            "Connecting to broker at {}:{} as {}",
            config.host, config.port, config.client_id
        );

        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(config.keep_alive);
        options.set_clean_session(!config.persistent_session);

        let (client, mut eventloop) = AsyncClient::new(options, config.request_capacity);

        let ack = tokio::time::timeout(config.connect_timeout, wait_for_connack(&mut eventloop))
            .await
            .map_err(|_| Error::Timeout(config.connect_timeout))??;
        debug!("Initial CONNACK received, session_present={}", ack.session_present);

        let topology = Arc::new(topology);
        declare(&client, &config.exchange, &topology)?;

        let (link_tx, link_rx) = watch::channel(LinkStatus {
            state: ConnectionState::Connected,
            epoch: 1,
        });
        let (command_tx, command_rx) = mpsc::channel(16);
        let stop = shutdown.child_token();

        let task = ConnectionTask {
            client: client.clone(),
            eventloop,
            exchange: config.exchange.clone(),
            reconnect_delay: config.reconnect_delay,
            topology: topology.clone(),
            link: link_tx,
            commands: command_rx,
            consumers: Vec::new(),
        };
        let handle = tokio::spawn(task.run(stop.clone()));

        info!("Connected to broker, exchange '{}'", config.exchange);

        Ok((
            Broker {
                client,
                exchange: Arc::from(config.exchange.as_str()),
                topology,
                link: link_rx,
                commands: command_tx,
                delivery_capacity: config.delivery_capacity,
                stop,
            },
            handle,
        ))
    }

    pub fn status(&self) -> LinkStatus {
        *self.link.borrow()
    }

    /// Subscribe to link state transitions.
    pub fn link(&self) -> watch::Receiver<LinkStatus> {
        self.link.clone()
    }

    /// Starts consuming a declared queue. A second call for the same queue
    /// replaces the previous consumer.
    pub async fn consume(&self, queue: &str) -> Result<mpsc::Receiver<Delivery>> {
        if !self.status().is_connected() {
            return Err(Error::NotConnected);
        }
        let binding = self
            .topology
            .binding(queue)
            .ok_or_else(|| Error::UnknownQueue(queue.to_string()))?;

        let (tx, rx) = mpsc::channel(self.delivery_capacity);
        self.commands
            .send(Command::Consume {
                queue: binding.name.clone(),
                pattern: binding.pattern.clone(),
                tx,
            })
            .await
            .map_err(|_| Error::ChannelSend)?;
        info!("Consuming queue {} ({})", binding.name, binding.pattern);
        Ok(rx)
    }

    /// Sends DISCONNECT and stops the connection task.
    pub async fn close(&self) {
        if let Err(e) = self.client.disconnect().await {
            debug!("Disconnect request failed: {}", e);
        }
        self.stop.cancel();
    }
}

#[async_trait]
impl Publish for Broker {
    async fn publish(&self, routing_key: &str, payload: Vec<u8>) -> Result<()> {
        if !self.status().is_connected() {
            return Err(Error::NotConnected);
        }
        let topic = routing::to_topic(&self.exchange, routing_key);
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)
            .map_err(Error::Mqtt)
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<ConnAck> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code != rumqttc::ConnectReturnCode::Success {
                    return Err(Error::Refused(ack.code));
                }
                return Ok(ack);
            }
            Ok(_) => {}
            Err(e) => return Err(Error::Connection(e)),
        }
    }
}

fn declare(client: &AsyncClient, exchange: &str, topology: &Topology) -> Result<()> {
    for queue in &topology.queues {
        let filter = routing::to_filter(exchange, &queue.pattern);
        client.try_subscribe(&filter, QoS::AtLeastOnce)?;
        debug!("Declared queue {} bound to {}", queue.name, filter);
    }
    Ok(())
}

struct Consumer {
    queue: String,
    pattern: String,
    inbox: mpsc::UnboundedSender<Delivery>,
}

/// Moves deliveries from an unbounded inbox into the consumer's bounded
/// channel, so a slow consumer only backs up its own inbox and never the
/// event loop or the other queues.
fn spawn_forwarder(queue: String, tx: mpsc::Sender<Delivery>) -> mpsc::UnboundedSender<Delivery> {
    let (inbox, mut pending) = mpsc::unbounded_channel::<Delivery>();
    tokio::spawn(async move {
        while let Some(delivery) = pending.recv().await {
            if tx.send(delivery).await.is_err() {
                debug!("Consumer of {} went away", queue);
                break;
            }
        }
    });
    inbox
}

struct ConnectionTask {
    client: AsyncClient,
    eventloop: EventLoop,
    exchange: String,
    reconnect_delay: Duration,
    topology: Arc<Topology>,
    link: watch::Sender<LinkStatus>,
    commands: mpsc::Receiver<Command>,
    consumers: Vec<Consumer>,
}

impl ConnectionTask {
    async fn run(mut self, stop: CancellationToken) {
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                Some(command) = self.commands.recv() => self.handle_command(command),
                event = self.eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => self.on_established(),
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        self.dispatch(&publish.topic, publish.payload.to_vec());
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        warn!("Broker closed the connection");
                        self.transition(LinkSignal::Lost);
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        debug!("Disconnect sent to broker");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if self.link.borrow().is_connected() {
                            error!("Connection to broker lost: {}", e);
                        } else {
                            warn!("Reconnect attempt failed: {}", e);
                        }
                        self.transition(LinkSignal::Lost);
                        self.transition(LinkSignal::RetryScheduled);
                        info!("Retrying broker connection in {:?}", self.reconnect_delay);
                        tokio::select! {
                            _ = stop.cancelled() => break,
                            _ = tokio::time::sleep(self.reconnect_delay) => {}
                        }
                    }
                }
            }
        }

        self.link.send_modify(|status| status.state = ConnectionState::Disconnected);
        info!("Broker connection task stopped");
    }

    fn transition(&self, signal: LinkSignal) {
        self.link.send_if_modified(|status| {
            let next = status.state.on(signal);
            if next == status.state {
                return false;
            }
            debug!("Broker link {:?} -> {:?}", status.state, next);
            status.state = next;
            true
        });
    }

    fn on_established(&mut self) {
        if let Err(e) = declare(&self.client, &self.exchange, &self.topology) {
            // The next poll surfaces the broken connection and we retry from there.
            error!("Failed to replay declarations: {}", e);
            return;
        }
        self.link.send_modify(|status| {
            status.state = status.state.on(LinkSignal::Established);
            status.epoch += 1;
        });
        info!("Reconnected to broker");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Consume { queue, pattern, tx } => {
                self.consumers.retain(|c| c.queue != queue);
                let inbox = spawn_forwarder(queue.clone(), tx);
                self.consumers.push(Consumer {
                    queue,
                    pattern,
                    inbox,
                });
            }
        }
    }

    fn dispatch(&mut self, topic: &str, payload: Vec<u8>) {
        let Some(routing_key) = routing::from_topic(&self.exchange, topic) else {
            debug!("Ignoring message on foreign topic {}", topic);
            return;
        };

        let mut delivered = false;
        let mut closed = Vec::new();
        for consumer in &self.consumers {
            if !routing::matches(&consumer.pattern, &routing_key) {
                continue;
            }
            let delivery = Delivery {
                routing_key: routing_key.clone(),
                payload: payload.clone(),
            };
            if consumer.inbox.send(delivery).is_err() {
                closed.push(consumer.queue.clone());
            } else {
                delivered = true;
            }
        }

        if !closed.is_empty() {
            warn!("Dropping closed consumers: {:?}", closed);
            self.consumers.retain(|c| !closed.contains(&c.queue));
        }
        if !delivered {
            debug!("No consumer for {}", routing_key);
        }
    }
}
