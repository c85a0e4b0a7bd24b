use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::routing;

/// Street address of a metered household. The city doubles as the region key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    #[serde(rename = "City")]
    pub city: String,
    #[serde(rename = "Street")]
    pub street: String,
    #[serde(rename = "Number")]
    pub number: String,
}

/// One consumption reading (kWh for the tick interval).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    #[serde(rename = "DeviceID")]
    pub device_id: String,
    #[serde(rename = "Value")]
    pub value: f64,
    #[serde(rename = "Timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "Address")]
    pub address: Location,
}

impl Measurement {
    pub fn routing_key(&self) -> String {
        routing::measurement_key(&self.address.city)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    #[serde(rename = "DeviceID")]
    pub device_id: String,
    #[serde(rename = "Timestamp")]
    pub timestamp: DateTime<Utc>,
}
