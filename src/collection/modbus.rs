//! Single-register Modbus RTU sensor on a serial line (DL11-MC style
//! thermometers report tenths of a degree in holding register 0).

use std::{path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use log::debug;
use serde::Deserialize;

use crate::{
    bus::{self, BusConnector, SerialLine},
    checksum,
    module::Collection,
    outcome::{ModuleError, Outcome},
    store::ReadingStore,
};

pub const KIND: &str = "modbus-rtu";

const READ_HOLDING: u8 = 0x03;
const READ_INPUT: u8 = 0x04;
const EXCEPTION_BIT: u8 = 0x80;

/// Address, function, byte count / exception code, CRC.
const HEAD_LEN: usize = 5;
/// Head plus the remaining register byte and CRC byte.
const RESPONSE_LEN: usize = 7;

#[derive(Debug, Clone, Deserialize)]
pub struct ModbusSettings {
    #[serde(alias = "dl11_device_path")]
    pub device: PathBuf,
    #[serde(default = "defaults::slave")]
    pub slave: u8,
    #[serde(default)]
    pub register: u16,
    #[serde(default = "defaults::function")]
    pub function: u8,
    #[serde(default = "defaults::scale")]
    pub scale: f64,
    #[serde(default = "defaults::baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,
}

mod defaults {
    pub fn slave() -> u8 {
        1
    }

    pub fn function() -> u8 {
        super::READ_HOLDING
    }

    pub fn scale() -> f64 {
        0.1
    }

    pub fn baud_rate() -> u32 {
        9600
    }

    pub fn timeout_ms() -> u64 {
        1000
    }
}

impl ModbusSettings {
    pub fn validate(&self) -> Result<(), ModuleError> {
        if !matches!(self.function, READ_HOLDING | READ_INPUT) {
            return Err(ModuleError::config(format!(
                "{KIND}: function must be 3 or 4, got {}",
                self.function
            )));
        }
        if self.slave == 0 || self.slave > 247 {
            return Err(ModuleError::config(format!(
                "{KIND}: slave address {} out of range 1..=247",
                self.slave
            )));
        }
        Ok(())
    }

    pub fn serial_line(&self) -> SerialLine {
        SerialLine {
            baud_rate: self.baud_rate,
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }
}

/// Builds a "read one register" request with its CRC appended low byte first.
pub fn request(slave: u8, function: u8, register: u16) -> [u8; 8] {
    let [reg_hi, reg_lo] = register.to_be_bytes();
    let mut frame = [slave, function, reg_hi, reg_lo, 0x00, 0x01, 0, 0];
    let [crc_lo, crc_hi] = checksum::crc16_modbus(&frame[..6]).to_le_bytes();
    frame[6] = crc_lo;
    frame[7] = crc_hi;
    frame
}

fn crc_matches(frame: &[u8]) -> bool {
    let (body, crc) = frame.split_at(frame.len() - 2);
    checksum::crc16_modbus(body).to_le_bytes() == [crc[0], crc[1]]
}

/// Validates a response and returns the register as a signed word.
pub fn parse_response(slave: u8, function: u8, frame: &[u8]) -> Result<i16, ModuleError> {
    if frame.len() == HEAD_LEN && frame[1] == function | EXCEPTION_BIT {
        if !crc_matches(frame) {
            return Err(ModuleError::validation("CRC16 mismatch in exception response"));
        }
        return Err(ModuleError::validation(format!(
            "slave {slave} returned exception code {}",
            frame[2]
        )));
    }
    if frame.len() != RESPONSE_LEN {
        return Err(ModuleError::validation(format!(
            "response length {} (expected {RESPONSE_LEN})",
            frame.len()
        )));
    }
    if !crc_matches(frame) {
        return Err(ModuleError::validation("CRC16 mismatch"));
    }
    if frame[0] != slave || frame[1] != function || frame[2] != 2 {
        return Err(ModuleError::validation(format!(
            "unexpected response header {:02X?}",
            &frame[..3]
        )));
    }
    Ok(i16::from_be_bytes([frame[3], frame[4]]))
}

/// One request/response exchange on a freshly opened line.
fn acquire(bus: &dyn BusConnector, s: &ModbusSettings) -> Result<f64, ModuleError> {
    let device = s.device.as_path();
    let mut handle = bus.open(device, u16::from(s.slave))?;
    bus::write_all(handle.as_mut(), device, &request(s.slave, s.function, s.register))?;

    let mut frame = [0u8; RESPONSE_LEN];
    bus::read_exact(handle.as_mut(), device, &mut frame[..HEAD_LEN])?;
    let len = if frame[1] & EXCEPTION_BIT != 0 {
        HEAD_LEN
    } else {
        bus::read_exact(handle.as_mut(), device, &mut frame[HEAD_LEN..])?;
        RESPONSE_LEN
    };

    let raw = parse_response(s.slave, s.function, &frame[..len]).map_err(|e| match e {
        ModuleError::Validation(msg) => {
            ModuleError::Validation(format!("[{}]: {msg}", device.display()))
        }
        other => other,
    })?;
    Ok(f64::from(raw) * s.scale)
}

pub struct ModbusRtu {
    settings: Arc<ModbusSettings>,
    store: ReadingStore,
    bus: Arc<dyn BusConnector>,
}

impl ModbusRtu {
    pub fn new(
        settings: ModbusSettings,
        store: ReadingStore,
        bus: Arc<dyn BusConnector>,
    ) -> Result<Self, ModuleError> {
        settings.validate()?;
        Ok(Self {
            settings: Arc::new(settings),
            store,
            bus,
        })
    }
}

#[async_trait]
impl Collection for ModbusRtu {
    fn name(&self) -> &str {
        KIND
    }

    async fn step(&mut self) -> Outcome {
        let bus = Arc::clone(&self.bus);
        let settings = Arc::clone(&self.settings);
        match bus::transact(move || acquire(bus.as_ref(), &settings)).await {
            Ok(value) => {
                debug!("{KIND}: register {} = {value:.1}", self.settings.register);
                self.store.publish(value, &[]).into()
            }
            Err(e) => {
                debug!("{KIND}: reading attempt skipped: {e}");
                e.into()
            }
        }
    }
}
