use crate::errors::Result;
use crate::hub::ChannelKind;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Real-time consumption of a single device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsumptionUpdate {
    #[serde(rename = "DeviceId")]
    pub device_id: String,
    #[serde(rename = "Consumption")]
    pub consumption: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusUpdate {
    #[serde(rename = "DeviceId")]
    pub device_id: String,
    #[serde(rename = "IsActive")]
    pub is_active: bool,
}

/// Region total accumulated since the previous flush.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateUpdate {
    #[serde(rename = "Value")]
    pub value: f64,
    #[serde(rename = "Timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "City")]
    pub city: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    Consumption(ConsumptionUpdate),
    Status(StatusUpdate),
    Aggregate(AggregateUpdate),
}

impl HubEvent {
    pub fn subject(&self) -> &str {
        match self {
            HubEvent::Consumption(update) => &update.device_id,
            HubEvent::Status(update) => &update.device_id,
            HubEvent::Aggregate(update) => &update.city,
        }
    }

    pub fn kind(&self) -> ChannelKind {
        match self {
            HubEvent::Consumption(_) => ChannelKind::Consumption,
            HubEvent::Status(_) => ChannelKind::Status,
            HubEvent::Aggregate(_) => ChannelKind::Aggregate,
        }
    }

    pub fn to_frame(&self) -> Result<String> {
        let frame = match self {
            HubEvent::Consumption(update) => serde_json::to_string(update)?,
            HubEvent::Status(update) => serde_json::to_string(update)?,
            HubEvent::Aggregate(update) => serde_json::to_string(update)?,
        };
        Ok(frame)
    }
}

/// Durable status row.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DeviceStatusRow {
    pub device_id: String,
    pub is_active: bool,
    pub updated_at: DateTime<Utc>,
}

/// REST API response wrapper
#[derive(Debug, Serialize)]
pub struct DeviceStatusResponse {
    pub data: Vec<DeviceStatusRow>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}
