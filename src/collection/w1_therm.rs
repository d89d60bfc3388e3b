//! DS18B20-style 1-Wire thermometer read through the kernel's `w1_therm`
//! sysfs file.

use std::path::PathBuf;

use async_trait::async_trait;
use log::debug;
use serde::Deserialize;

use crate::{
    module::Collection,
    outcome::{ModuleError, Outcome, TransportError},
    store::ReadingStore,
};

pub const KIND: &str = "w1-therm";

#[derive(Debug, Clone, Deserialize)]
pub struct W1ThermSettings {
    /// e.g. `/sys/bus/w1/devices/28-000005e2fdc3/w1_slave`
    pub device: PathBuf,
}

/// Parses the two-line `w1_slave` report.
///
/// ```text
/// 72 01 4b 46 7f ff 0e 10 57 : crc=57 YES
/// 72 01 4b 46 7f ff 0e 10 57 t=23125
/// ```
pub fn parse_report(report: &str) -> Result<f64, ModuleError> {
    let mut lines = report.lines();
    let status = lines
        .next()
        .ok_or_else(|| ModuleError::validation("empty w1_slave report"))?;
    if !status.trim_end().ends_with("YES") {
        return Err(ModuleError::validation(format!("sensor CRC check failed: {status}")));
    }
    let data = lines
        .next()
        .ok_or_else(|| ModuleError::validation("w1_slave report has no data line"))?;
    let (_, milli) = data
        .rsplit_once("t=")
        .ok_or_else(|| ModuleError::validation(format!("no t= field in: {data}")))?;
    let milli: i32 = milli
        .trim()
        .parse()
        .map_err(|e| ModuleError::validation(format!("bad t= value {milli:?}: {e}")))?;
    Ok(f64::from(milli) / 1000.0)
}

pub struct W1Therm {
    settings: W1ThermSettings,
    store: ReadingStore,
}

impl W1Therm {
    pub fn new(settings: W1ThermSettings, store: ReadingStore) -> Self {
        Self { settings, store }
    }

    async fn acquire(&self) -> Result<f64, ModuleError> {
        let device = &self.settings.device;
        let report = tokio::fs::read_to_string(device)
            .await
            .map_err(|e| TransportError::new(device.display().to_string(), "read()", e))?;
        parse_report(&report)
    }
}

#[async_trait]
impl Collection for W1Therm {
    fn name(&self) -> &str {
        KIND
    }

    async fn step(&mut self) -> Outcome {
        match self.acquire().await {
            Ok(temp) => self.store.publish(temp, &[]).into(),
            Err(e) => {
                debug!("{KIND}: [{}]: reading attempt skipped: {e}", self.settings.device.display());
                e.into()
            }
        }
    }
}
