//! Chained four-digit seven-segment display.

use std::{path::PathBuf, time::Duration};

use async_trait::async_trait;
use log::{debug, info};
use serde::Deserialize;
use tokio::time::Instant;

use crate::{
    module::PostCollection,
    outcome::{ModuleError, Outcome},
    store::Reading,
};

pub const KIND: &str = "segment-display";

/// Display hardware driver. Updates are best-effort.
#[cfg_attr(test, mockall::automock)]
pub trait SegmentDisplay: Send {
    fn update(&mut self, value: f64, slot: usize);
}

#[derive(Debug, Clone, Deserialize)]
pub struct DisplaySettings {
    pub data_pin_num: u32,
    pub clock_pin_num: u32,
    pub latch_pin_num: u32,
    pub chain_num: usize,
    pub gpiochip_path: PathBuf,
    #[serde(default = "defaults::refresh_rate_hz")]
    pub refresh_rate_hz: u32,
    #[serde(default)]
    pub max_staleness_secs: Option<u64>,
}

mod defaults {
    pub fn refresh_rate_hz() -> u32 {
        500
    }
}

impl DisplaySettings {
    pub fn validate(&self) -> Result<(), ModuleError> {
        let pins = [self.data_pin_num, self.clock_pin_num, self.latch_pin_num];
        if pins.contains(&0)
            || self.chain_num == 0
            || self.refresh_rate_hz == 0
            || self.gpiochip_path.as_os_str().is_empty()
        {
            return Err(ModuleError::config(format!(
                "{KIND}: data/clock/latch pins, chain_num, refresh_rate_hz and gpiochip_path are required"
            )));
        }
        Ok(())
    }
}

/// Text a four-digit display with one decimal place shows for `value`.
pub fn four_digit(value: f64) -> String {
    if !value.is_finite() || !(-99.95..999.95).contains(&value) {
        return "----".to_string();
    }
    format!("{value:>5.1}")
}

/// Driver that renders each slot to the log instead of GPIO lines.
pub struct ConsoleDisplay {
    shown: Vec<String>,
}

impl ConsoleDisplay {
    pub fn new(settings: &DisplaySettings) -> Self {
        info!(
            "{KIND}: data_pin {}, clock_pin {}, latch_pin {}, chain {}, {} Hz on {}",
            settings.data_pin_num,
            settings.clock_pin_num,
            settings.latch_pin_num,
            settings.chain_num,
            settings.refresh_rate_hz,
            settings.gpiochip_path.display()
        );
        Self {
            shown: vec![String::new(); settings.chain_num],
        }
    }
}

impl SegmentDisplay for ConsoleDisplay {
    fn update(&mut self, value: f64, slot: usize) {
        let text = four_digit(value);
        if let Some(current) = self.shown.get_mut(slot) {
            if *current != text {
                debug!("{KIND}[{slot}]: [{text}]");
                *current = text;
            }
        }
    }
}

pub struct DisplaySink {
    display: Box<dyn SegmentDisplay>,
    slots: usize,
    max_staleness: Option<Duration>,
}

impl DisplaySink {
    pub fn new(
        settings: &DisplaySettings,
        display: Box<dyn SegmentDisplay>,
    ) -> Result<Self, ModuleError> {
        settings.validate()?;
        Ok(Self {
            display,
            slots: settings.chain_num,
            max_staleness: settings.max_staleness_secs.map(Duration::from_secs),
        })
    }

    fn show_sentinel(&mut self) {
        for slot in 0..self.slots {
            self.display.update(Reading::SENTINEL, slot);
        }
    }
}

#[async_trait]
impl PostCollection for DisplaySink {
    fn name(&self) -> &str {
        KIND
    }

    async fn step(&mut self, reading: &Reading) -> Outcome {
        let stale = self
            .max_staleness
            .is_some_and(|tolerance| reading.is_stale(tolerance, Instant::now()));
        if !reading.valid || stale {
            self.show_sentinel();
            return Outcome::Success;
        }
        let values: Vec<f64> = reading.values().collect();
        for slot in 0..self.slots {
            let value = values.get(slot).copied().unwrap_or(Reading::SENTINEL);
            self.display.update(value, slot);
        }
        Outcome::Success
    }

    async fn destroy(&mut self) {
        self.show_sentinel();
    }
}
