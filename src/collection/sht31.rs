//! Sensirion SHT31 temperature/humidity sensor on a Linux I2C bus.

use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use log::debug;
use serde::Deserialize;

use crate::{
    bus::{self, BusConnector},
    checksum,
    module::Collection,
    outcome::{ModuleError, Outcome},
    store::ReadingStore,
};

pub const KIND: &str = "sht31";

/// Single-shot, high repeatability, clock stretching enabled.
const MEASURE_CMD: [u8; 2] = [0x2C, 0x06];
const FRAME_LEN: usize = 6;

#[derive(Debug, Clone, Deserialize)]
pub struct Sht31Settings {
    #[serde(default = "defaults::device", alias = "dht31_device_path")]
    pub device: PathBuf,
    #[serde(default = "defaults::address")]
    pub address: u16,
}

mod defaults {
    use std::path::PathBuf;

    pub fn device() -> PathBuf {
        PathBuf::from("/dev/i2c-1")
    }

    pub fn address() -> u16 {
        0x44
    }
}

/// Converts a raw temperature word to degrees Celsius.
pub fn temperature(raw: u16) -> f64 {
    f64::from(raw) * 175.0 / 65535.0 - 45.0
}

/// Converts a raw humidity word to percent, truncated to two decimals.
pub fn relative_humidity(raw: u16) -> f64 {
    f64::from((625 * u32::from(raw)) >> 12) / 100.0
}

/// Validates both CRC-protected words and returns `(°C, %RH)`.
pub fn decode(frame: &[u8; FRAME_LEN]) -> Result<(f64, f64), ModuleError> {
    let t_raw = u16::from_be_bytes([frame[0], frame[1]]);
    let h_raw = u16::from_be_bytes([frame[3], frame[4]]);
    let t_ok = checksum::word_is_valid(&[frame[0], frame[1], frame[2]]);
    let h_ok = checksum::word_is_valid(&[frame[3], frame[4], frame[5]]);
    if !(t_ok && h_ok) {
        return Err(ModuleError::validation(format!(
            "CRC8 mismatch (temperature ok: {t_ok}, humidity ok: {h_ok}); \
             rejected readings {:.2} °C, {:.2} %",
            temperature(t_raw),
            relative_humidity(h_raw)
        )));
    }
    Ok((temperature(t_raw), relative_humidity(h_raw)))
}

/// One measurement: open, trigger, read the frame, decode.
fn acquire(bus: &dyn BusConnector, settings: &Sht31Settings) -> Result<(f64, f64), ModuleError> {
    let device = settings.device.as_path();
    let mut handle = bus.open(device, settings.address)?;
    bus::write_all(handle.as_mut(), device, &MEASURE_CMD)?;
    let mut frame = [0u8; FRAME_LEN];
    bus::read_exact(handle.as_mut(), device, &mut frame)?;
    decode(&frame).map_err(|e| match e {
        ModuleError::Validation(msg) => {
            ModuleError::Validation(format!("[{}]: {msg}", device.display()))
        }
        other => other,
    })
}

/// Opens the device afresh on every acquisition.
pub struct Sht31 {
    settings: Arc<Sht31Settings>,
    store: ReadingStore,
    bus: Arc<dyn BusConnector>,
}

impl Sht31 {
    pub fn new(settings: Sht31Settings, store: ReadingStore, bus: Arc<dyn BusConnector>) -> Self {
        Self {
            settings: Arc::new(settings),
            store,
            bus,
        }
    }
}

#[async_trait]
impl Collection for Sht31 {
    fn name(&self) -> &str {
        KIND
    }

    async fn step(&mut self) -> Outcome {
        let bus = Arc::clone(&self.bus);
        let settings = Arc::clone(&self.settings);
        match bus::transact(move || acquire(bus.as_ref(), &settings)).await {
            Ok((temp, rh)) => {
                debug!("{KIND}: {temp:.2} °C, {rh:.2} %");
                self.store.publish(temp, &[rh]).into()
            }
            Err(e) => {
                debug!("{KIND}: reading attempt skipped: {e}");
                e.into()
            }
        }
    }
}
