//! Runs an external command when the reading exceeds a threshold inside
//! configured day and hour windows.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, Local, NaiveDateTime, Timelike};
use log::{info, warn};
use serde::Deserialize;
use tokio::{process::Command, time::Instant};

use super::payload::RateLimit;
use crate::{
    module::PostCollection,
    outcome::{ModuleError, Outcome},
    store::Reading,
};

pub const KIND: &str = "threshold-exec";

#[derive(Debug, Clone, Deserialize)]
pub struct ThresholdSettings {
    #[serde(default = "defaults::threshold")]
    pub threshold: f64,
    /// `[month, day]` pairs.
    pub effective_dates: Vec<[u32; 2]>,
    /// Inclusive `[first, last]` hour of the day.
    #[serde(default = "defaults::effective_hours")]
    pub effective_hours: [u32; 2],
    pub external_command: String,
    #[serde(default = "defaults::notify_interval_secs")]
    pub notify_interval_secs: u64,
}

mod defaults {
    pub fn threshold() -> f64 {
        28.0
    }

    pub fn effective_hours() -> [u32; 2] {
        [7, 21]
    }

    pub fn notify_interval_secs() -> u64 {
        3600
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Still inside the notify interval.
    Throttled,
    OffDay,
    OffHours,
    BelowThreshold,
    Trigger,
}

#[derive(Debug)]
pub struct ThresholdPolicy {
    threshold: f64,
    dates: Vec<[u32; 2]>,
    hours: [u32; 2],
    limit: RateLimit,
}

impl ThresholdPolicy {
    pub fn new(settings: &ThresholdSettings) -> Result<Self, ModuleError> {
        if settings.effective_dates.is_empty() {
            return Err(ModuleError::config(format!("{KIND}: no effective_dates are defined")));
        }
        if let Some([m, d]) = settings
            .effective_dates
            .iter()
            .find(|[m, d]| !(1..=12).contains(m) || !(1..=31).contains(d))
        {
            return Err(ModuleError::config(format!("{KIND}: invalid date [{m}, {d}]")));
        }
        let [first, last] = settings.effective_hours;
        if first > last || last > 23 {
            return Err(ModuleError::config(format!(
                "{KIND}: invalid effective_hours [{first}, {last}]"
            )));
        }
        Ok(Self {
            threshold: settings.threshold,
            dates: settings.effective_dates.clone(),
            hours: settings.effective_hours,
            limit: RateLimit::new(Duration::from_secs(settings.notify_interval_secs)),
        })
    }

    /// Evaluates one reading. Off-day and off-hours evaluations stamp the
    /// notify clock just like a trigger; a reading at or below the threshold
    /// does not.
    pub fn decide(&mut self, value: f64, local: NaiveDateTime, now: Instant) -> Decision {
        if !self.limit.permits(now) {
            return Decision::Throttled;
        }
        let (month, day) = (local.month(), local.day());
        if !self.dates.iter().any(|&[m, d]| m == month && d == day) {
            info!("{KIND}: today ({month:02}, {day:02}) is not an effective day, will retry later");
            self.limit.mark(now);
            return Decision::OffDay;
        }
        let hour = local.hour();
        if hour < self.hours[0] || hour > self.hours[1] {
            info!("{KIND}: {hour}h is outside effective hours, will retry later");
            self.limit.mark(now);
            return Decision::OffHours;
        }
        if value <= self.threshold {
            return Decision::BelowThreshold;
        }
        self.limit.mark(now);
        Decision::Trigger
    }
}

pub struct ThresholdExec {
    policy: ThresholdPolicy,
    command: String,
}

impl ThresholdExec {
    pub fn new(settings: ThresholdSettings) -> Result<Self, ModuleError> {
        if settings.external_command.trim().is_empty() {
            return Err(ModuleError::config(format!("{KIND}: external_command is required")));
        }
        let policy = ThresholdPolicy::new(&settings)?;
        info!(
            "{KIND}: [{}] runs above {} °C on {:?}",
            settings.external_command, settings.threshold, settings.effective_dates
        );
        Ok(Self {
            policy,
            command: settings.external_command,
        })
    }

    async fn run(&self, value: f64) -> Result<(), ModuleError> {
        let line = format!("{} {value:.1}", self.command);
        info!("{KIND}: threshold exceeded, running [{line}]");
        let status = Command::new("sh")
            .arg("-c")
            .arg(&line)
            .status()
            .await
            .map_err(|e| ModuleError::sink(format!("cannot spawn [{line}]: {e}")))?;
        if !status.success() {
            return Err(ModuleError::sink(format!("[{}] exited with {status}", self.command)));
        }
        Ok(())
    }
}

#[async_trait]
impl PostCollection for ThresholdExec {
    fn name(&self) -> &str {
        KIND
    }

    async fn step(&mut self, reading: &Reading) -> Outcome {
        if !reading.valid {
            return Outcome::Success;
        }
        let decision = self
            .policy
            .decide(reading.primary, Local::now().naive_local(), Instant::now());
        if decision != Decision::Trigger {
            return Outcome::Success;
        }
        let result = self.run(reading.primary).await;
        if let Err(e) = &result {
            warn!("{KIND}: {e}");
        }
        result.into()
    }
}
