//! Shared pieces of the watt-flow telemetry pipeline: the wire model, topic
//! routing and the broker connection manager used by both the device
//! simulator and the ingestor.

pub mod broker;
pub mod errors;
pub mod model;
pub mod routing;

pub use broker::{Broker, BrokerConfig, ConnectionState, Delivery, LinkStatus, Publish, Topology};
pub use errors::{Error, Result};
