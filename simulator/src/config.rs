use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use wattflow_common::model::Location;

#[derive(Debug, Clone, Parser)]
#[command(name = "simulator", about = "Smart meter simulator publishing consumption and heartbeats")]
pub struct Config {
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    pub mqtt_broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    pub mqtt_port: u16,

    #[arg(long, env = "EXCHANGE", default_value = "watt-flow")]
    pub exchange: String,

    /// Run a single device with this id instead of synthetic ones.
    #[arg(long, env = "DEVICE_ID")]
    pub device_id: Option<String>,

    #[arg(long, env = "CITY", default_value = "Novi Sad")]
    pub city: String,

    #[arg(long, env = "STREET", default_value = "Bulevar oslobodjenja")]
    pub street: String,

    #[arg(long, env = "NUMBER", default_value = "1")]
    pub number: String,

    /// Number of synthetic devices when no device id is given.
    #[arg(long, env = "DEVICES", default_value_t = 10)]
    pub devices: usize,

    #[arg(long, env = "DEVICE_PREFIX", default_value = "dev")]
    pub device_prefix: String,

    /// Cities the synthetic devices are spread over.
    #[arg(long, env = "CITIES", value_delimiter = ',', default_value = "Novi Sad,Belgrade,Nis")]
    pub cities: Vec<String>,

    #[arg(long, env = "MEASUREMENT_INTERVAL_SECS", default_value_t = 60)]
    pub measurement_interval_secs: u64,

    #[arg(long, env = "HEARTBEAT_INTERVAL_SECS", default_value_t = 5)]
    pub heartbeat_interval_secs: u64,

    /// Simulated time that passes between two measurements.
    #[arg(long, env = "TIME_STEP_MINS", default_value_t = 60)]
    pub time_step_mins: i64,

    /// Offset of the simulated clock from the wall clock at startup.
    #[arg(long, env = "START_OFFSET_HOURS", default_value_t = 8)]
    pub start_offset_hours: i64,

    #[arg(long, env = "RECONNECT_DELAY_SECS", default_value_t = 10)]
    pub reconnect_delay_secs: u64,

    #[arg(long, env = "FLUSH_TIMEOUT_SECS", default_value_t = 5)]
    pub flush_timeout_secs: u64,

    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value_t = 60)]
    pub shutdown_timeout_secs: u64,

    /// Directory for per-device measurement journals. Disabled when unset.
    #[arg(long, env = "JOURNAL_DIR")]
    pub journal_dir: Option<PathBuf>,
}

impl Config {
    pub fn measurement_interval(&self) -> Duration {
        Duration::from_secs(self.measurement_interval_secs.max(1))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn time_step(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.time_step_mins)
    }

    pub fn start_offset(&self) -> chrono::Duration {
        chrono::Duration::hours(self.start_offset_hours)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_secs(self.flush_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Device ids and addresses to simulate.
    pub fn device_specs(&self) -> Vec<(String, Location)> {
        if let Some(device_id) = &self.device_id {
            return vec![(
                device_id.clone(),
                Location {
                    city: self.city.clone(),
                    street: self.street.clone(),
                    number: self.number.clone(),
                },
            )];
        }

        let cities: Vec<&String> = self.cities.iter().filter(|c| !c.trim().is_empty()).collect();
        (0..self.devices)
            .map(|i| {
                let city = cities
                    .get(i % cities.len().max(1))
                    .map(|c| c.trim().to_string())
                    .unwrap_or_else(|| self.city.clone());
                let location = Location {
                    city,
                    street: self.street.clone(),
                    number: (i + 1).to_string(),
                };
                (format!("{}-{}", self.device_prefix, i), location)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_devices_spread_over_cities() {
        let config = Config::parse_from([
            "simulator",
            "--devices",
            "4",
            "--cities",
            "Novi Sad,Belgrade",
        ]);
        let specs = config.device_specs();
        assert_eq!(specs.len(), 4);
        assert_eq!(specs[0].0, "dev-0");
        assert_eq!(specs[0].1.city, "Novi Sad");
        assert_eq!(specs[1].1.city, "Belgrade");
        assert_eq!(specs[2].1.city, "Novi Sad");
        assert_eq!(specs[3].1.number, "4");
    }

    #[test]
    fn test_explicit_device_wins() {
        let config = Config::parse_from([
            "simulator",
            "--device-id",
            "be781b42-c3b0-475b-bdc5-cb467d0f7f1b",
            "--city",
            "Nis",
            "--devices",
            "50",
        ]);
        let specs = config.device_specs();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].0, "be781b42-c3b0-475b-bdc5-cb467d0f7f1b");
        assert_eq!(specs[0].1.city, "Nis");
        assert_eq!(config.time_step(), chrono::Duration::hours(1));
    }
}
