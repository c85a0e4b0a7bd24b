use crate::errors::{Error, Result};
use wattflow_common::model::{Heartbeat, Measurement};

/// Validates a consumption measurement
pub fn validate_measurement(measurement: &Measurement) -> Result<()> {
    if measurement.device_id.trim().is_empty() {
        return Err(Error::Validation("Device ID cannot be empty".to_string()));
    }

    if !measurement.value.is_finite() || measurement.value < 0.0 {
        return Err(Error::Validation(format!(
            "Consumption {} is not a non-negative number",
            measurement.value
        )));
    }

    if measurement.address.city.trim().is_empty() {
        return Err(Error::Validation("City cannot be empty".to_string()));
    }

    Ok(())
}

pub fn validate_heartbeat(heartbeat: &Heartbeat) -> Result<()> {
    if heartbeat.device_id.trim().is_empty() {
        return Err(Error::Validation("Device ID cannot be empty".to_string()));
    }
    Ok(())
}
