//! Telemetry payload and publish rate limiting shared by the network sinks.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::time::Instant;

use crate::store::Reading;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

pub fn default_fields() -> Vec<String> {
    vec!["temp_celsius".to_string(), "relative_humidity".to_string()]
}

/// `{"timestamp": "...Z", "<field>": value, ...}`, one entry per named value.
///
/// Values without a name are dropped; names without a value are omitted.
pub fn build(reading: &Reading, fields: &[String], now: DateTime<Utc>) -> Value {
    let mut body = Map::new();
    let stamp = reading.recorded_at.unwrap_or(now);
    body.insert(
        "timestamp".to_string(),
        Value::String(stamp.format(TIMESTAMP_FORMAT).to_string()),
    );
    for (name, value) in fields.iter().zip(reading.values()) {
        body.insert(name.clone(), Value::from(value));
    }
    Value::Object(body)
}

/// Allows one action per interval.
///
/// The check and the stamp are separate calls: a module that checks, fails
/// and never stamps will simply try again next cycle.
#[derive(Debug, Clone)]
pub struct RateLimit {
    interval: Duration,
    last: Option<Instant>,
}

impl RateLimit {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn permits(&self, now: Instant) -> bool {
        match self.last {
            Some(last) => now.saturating_duration_since(last) >= self.interval,
            None => true,
        }
    }

    pub fn mark(&mut self, now: Instant) {
        self.last = Some(now);
    }
}
