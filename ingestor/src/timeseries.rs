//! Time-series points and the InfluxDB v2 writer.
//!
//! Points are rendered to line protocol and posted one at a time. A failed
//! write is reported to the caller and never retried here.

use crate::errors::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt::Write as _;
use std::time::Duration;
use tracing::debug;
use wattflow_common::model::Measurement;

pub const CONSUMPTION_MEASUREMENT: &str = "power_consumption";
pub const STATUS_MEASUREMENT: &str = "online_status";

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Bool(bool),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    measurement: String,
    tags: Vec<(String, String)>,
    fields: Vec<(String, FieldValue)>,
    timestamp: DateTime<Utc>,
}

impl Point {
    pub fn new(measurement: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            measurement: measurement.into(),
            tags: Vec::new(),
            fields: Vec::new(),
            timestamp,
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push((key.into(), value.into()));
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: FieldValue) -> Self {
        self.fields.push((key.into(), value));
        self
    }

    /// Renders the point as a single line of InfluxDB line protocol with a
    /// nanosecond timestamp. Tags are sorted by key.
    pub fn to_line_protocol(&self) -> String {
        let mut line = escape(&self.measurement, &[',', ' ']);

        let mut tags: Vec<&(String, String)> = self.tags.iter().filter(|(_, v)| !v.is_empty()).collect();
        tags.sort_by(|a, b| a.0.cmp(&b.0));
        for (key, value) in tags {
            let _ = write!(line, ",{}={}", escape(key, &[',', '=', ' ']), escape(value, &[',', '=', ' ']));
        }

        for (i, (key, value)) in self.fields.iter().enumerate() {
            line.push(if i == 0 { ' ' } else { ',' });
            line.push_str(&escape(key, &[',', '=', ' ']));
            line.push('=');
            match value {
                FieldValue::Float(v) => {
                    let _ = write!(line, "{}", v);
                }
                FieldValue::Bool(v) => line.push_str(if *v { "true" } else { "false" }),
            }
        }

        if let Some(nanos) = self.timestamp.timestamp_nanos_opt() {
            let _ = write!(line, " {}", nanos);
        }
        line
    }
}

fn escape(raw: &str, special: &[char]) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c == '\\' || special.contains(&c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

pub fn consumption_point(measurement: &Measurement) -> Point {
    Point::new(CONSUMPTION_MEASUREMENT, measurement.timestamp)
        .tag("device_id", measurement.device_id.as_str())
        .tag("city", measurement.address.city.as_str())
        .field("value", FieldValue::Float(measurement.value))
}

pub fn status_point(device_id: &str, is_active: bool, at: DateTime<Utc>) -> Point {
    Point::new(STATUS_MEASUREMENT, at)
        .tag("device_id", device_id)
        .field("value", FieldValue::Bool(is_active))
}

#[async_trait]
pub trait TimeSeriesSink: Send + Sync {
    async fn write(&self, point: &Point) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct InfluxWriter {
    client: reqwest::Client,
    write_url: String,
    org: String,
    bucket: String,
    token: String,
}

impl InfluxWriter {
    pub fn new(
        base_url: &str,
        org: impl Into<String>,
        bucket: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            write_url: format!("{}/api/v2/write", base_url.trim_end_matches('/')),
            org: org.into(),
            bucket: bucket.into(),
            token: token.into(),
        })
    }
}

#[async_trait]
impl TimeSeriesSink for InfluxWriter {
    async fn write(&self, point: &Point) -> Result<()> {
        let line = point.to_line_protocol();
        let response = self
            .client
            .post(&self.write_url)
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", "ns"),
            ])
            .header(reqwest::header::AUTHORIZATION, format!("Token {}", self.token))
            .header(reqwest::header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(line)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::TimeSeries(format!("{}: {}", status, body.trim())));
        }

        debug!("Point written to {}", self.bucket);
        Ok(())
    }
}
