//! INA219 current/power monitor on a UPS HAT, reported as battery charge.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use log::{debug, info};
use serde::Deserialize;
use tokio::{sync::Mutex, time::Instant};

use crate::{
    bus::{self, BusConnector, BusHandle},
    module::Collection,
    outcome::{ModuleError, Outcome},
    store::ReadingStore,
};

pub const KIND: &str = "ina219";

const REG_CONFIG: u8 = 0x00;
const REG_BUS_VOLTAGE: u8 = 0x02;
const REG_POWER: u8 = 0x03;
const REG_CURRENT: u8 = 0x04;
const REG_CALIBRATION: u8 = 0x05;

const RANGE_32V: u16 = 0x01;
const DIV_8_320MV: u16 = 0x03;
const ADCRES_12BIT_32S: u16 = 0x0D;
const SANDBVOLT_CONTINUOUS: u16 = 0x07;

/// 32 V bus range, /8 gain, 12-bit 32-sample averaging on both ADCs.
pub const CONFIG_WORD: u16 = RANGE_32V << 13
    | DIV_8_320MV << 11
    | ADCRES_12BIT_32S << 7
    | ADCRES_12BIT_32S << 3
    | SANDBVOLT_CONTINUOUS;

const CURRENT_LSB_MA: f64 = 0.1;
const POWER_LSB_W: f64 = 0.002;
const BUS_LSB_V: f64 = 0.004;

/// Two-cell pack: 6.0 V empty, 8.4 V full.
const EMPTY_V: f64 = 6.0;
const SPAN_V: f64 = 2.4;

#[derive(Debug, Clone, Deserialize)]
pub struct Ina219Settings {
    #[serde(default = "defaults::device")]
    pub device: PathBuf,
    #[serde(default = "defaults::address")]
    pub address: u16,
    #[serde(default = "defaults::calibration")]
    pub calibration: u16,
}

mod defaults {
    use std::path::PathBuf;

    pub fn device() -> PathBuf {
        PathBuf::from("/dev/i2c-1")
    }

    pub fn address() -> u16 {
        0x42
    }

    pub fn calibration() -> u16 {
        4096
    }
}

fn signed(raw: u16) -> f64 {
    let v = f64::from(raw);
    if v > f64::from(0x8000u16) { v - f64::from(0xFFFFu16) } else { v }
}

pub fn bus_voltage(raw: u16) -> f64 {
    f64::from(raw >> 3) * BUS_LSB_V
}

pub fn current_ma(raw: u16) -> f64 {
    signed(raw) * CURRENT_LSB_MA
}

pub fn power_w(raw: u16) -> f64 {
    signed(raw) * POWER_LSB_W
}

/// Unclamped charge estimate from the pack voltage.
pub fn battery_percentage(bus_v: f64) -> f64 {
    (bus_v - EMPTY_V) / SPAN_V * 100.0
}

/// Discharge-rate baseline, reset whenever the pack is charging.
///
/// The clock starts when the module is opened; the baseline percentage is
/// taken from the first sample.
#[derive(Debug)]
pub struct BatteryTracker {
    t0: Instant,
    pct0: Option<f64>,
}

impl BatteryTracker {
    pub fn new(now: Instant) -> Self {
        Self { t0: now, pct0: None }
    }

    /// Returns the clamped percentage and the hourly usage in %/h
    /// (-1 until a baseline exists).
    pub fn update(&mut self, raw_pct: f64, current_ma: f64, now: Instant) -> (f64, f64) {
        if current_ma > 0.0 {
            self.t0 = now;
            self.pct0 = Some(raw_pct);
        }
        let pct = raw_pct.clamp(0.0, 100.0);
        let hourly = match self.pct0 {
            None => {
                self.pct0 = Some(pct);
                -1.0
            }
            Some(pct0) => {
                let elapsed = now.saturating_duration_since(self.t0).as_secs_f64().floor();
                3600.0 * (pct0 - pct) / (elapsed + 1.0)
            }
        };
        (pct, hourly)
    }
}

fn write_register(
    handle: &mut dyn BusHandle,
    device: &Path,
    reg: u8,
    value: u16,
) -> Result<(), ModuleError> {
    let [hi, lo] = value.to_be_bytes();
    bus::write_all(handle, device, &[reg, hi, lo])?;
    Ok(())
}

fn read_register(handle: &mut dyn BusHandle, device: &Path, reg: u8) -> Result<u16, ModuleError> {
    bus::write_all(handle, device, &[reg])?;
    let mut buf = [0u8; 2];
    bus::read_exact(handle, device, &mut buf)?;
    Ok(u16::from_be_bytes(buf))
}

/// Bus voltage, current and power, re-writing calibration before each
/// current and power read.
fn acquire(
    handle: &mut dyn BusHandle,
    settings: &Ina219Settings,
) -> Result<[f64; 3], ModuleError> {
    let device = settings.device.as_path();
    write_register(handle, device, REG_CALIBRATION, settings.calibration)?;
    let bus_v = bus_voltage(read_register(handle, device, REG_BUS_VOLTAGE)?);
    let current = current_ma(read_register(handle, device, REG_CURRENT)?);
    write_register(handle, device, REG_CALIBRATION, settings.calibration)?;
    let power = power_w(read_register(handle, device, REG_POWER)?);
    Ok([bus_v, current, power])
}

pub struct Ina219 {
    settings: Arc<Ina219Settings>,
    store: ReadingStore,
    handle: Arc<Mutex<Box<dyn BusHandle>>>,
    tracker: BatteryTracker,
}

impl Ina219 {
    /// Opens the device and programs calibration and configuration.
    pub fn open(
        settings: Ina219Settings,
        store: ReadingStore,
        bus: &dyn BusConnector,
    ) -> Result<Self, ModuleError> {
        let device = settings.device.as_path();
        let mut handle = bus.open(device, settings.address)?;
        write_register(handle.as_mut(), device, REG_CALIBRATION, settings.calibration)?;
        write_register(handle.as_mut(), device, REG_CONFIG, CONFIG_WORD)?;
        info!(
            "{KIND}: configured [{}] at 0x{:02X} (config 0x{CONFIG_WORD:04X})",
            device.display(),
            settings.address
        );
        Ok(Self {
            settings: Arc::new(settings),
            store,
            handle: Arc::new(Mutex::new(handle)),
            tracker: BatteryTracker::new(Instant::now()),
        })
    }
}

#[async_trait]
impl Collection for Ina219 {
    fn name(&self) -> &str {
        KIND
    }

    async fn step(&mut self) -> Outcome {
        let handle = Arc::clone(&self.handle);
        let settings = Arc::clone(&self.settings);
        let measured = bus::transact(move || {
            let mut guard = handle.blocking_lock();
            acquire(guard.as_mut(), &settings)
        })
        .await;
        let [bus_v, current, power] = match measured {
            Ok(values) => values,
            Err(e) => {
                debug!("{KIND}: reading attempt skipped: {e}");
                return e.into();
            }
        };
        let (pct, hourly) = self.tracker.update(battery_percentage(bus_v), current, Instant::now());
        debug!("{KIND}: {bus_v:.3} V, {current:.1} mA, {power:.3} W, {pct:.1} %");
        self.store
            .publish(pct, &[bus_v, current / 1000.0, power, hourly])
            .into()
    }
}
