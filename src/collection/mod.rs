//! Acquisition modules and the provider that builds one from configuration.

pub mod http_json;
pub mod ina219;
pub mod modbus;
pub mod sht31;
pub mod w1_therm;

use std::sync::Arc;

use async_trait::async_trait;
use log::info;

use crate::{
    bus::LinuxI2c,
    config::ModuleCfg,
    module::{Collection, ModuleProvider},
    outcome::ModuleError,
    store::ReadingStore,
};

pub const KINDS: &[&str] = &[
    sht31::KIND,
    ina219::KIND,
    w1_therm::KIND,
    modbus::KIND,
    http_json::KIND,
];

/// Builds the acquisition module named by a `collection` entry.
pub struct ConfiguredCollection {
    cfg: ModuleCfg,
}

impl ConfiguredCollection {
    pub fn new(cfg: ModuleCfg) -> Self {
        Self { cfg }
    }
}

#[async_trait]
impl ModuleProvider<dyn Collection> for ConfiguredCollection {
    fn name(&self) -> &str {
        &self.cfg.kind
    }

    async fn init(&self, store: &ReadingStore) -> Result<Box<dyn Collection>, ModuleError> {
        let store = store.clone();
        let module: Box<dyn Collection> = match self.cfg.kind.as_str() {
            sht31::KIND => {
                Box::new(sht31::Sht31::new(self.cfg.settings()?, store, Arc::new(LinuxI2c)))
            }
            ina219::KIND => Box::new(ina219::Ina219::open(self.cfg.settings()?, store, &LinuxI2c)?),
            w1_therm::KIND => Box::new(w1_therm::W1Therm::new(self.cfg.settings()?, store)),
            modbus::KIND => {
                let settings: modbus::ModbusSettings = self.cfg.settings()?;
                let line = settings.serial_line();
                Box::new(modbus::ModbusRtu::new(settings, store, Arc::new(line))?)
            }
            http_json::KIND => Box::new(http_json::HttpJson::new(self.cfg.settings()?, store)?),
            other => {
                return Err(ModuleError::config(format!(
                    "unknown collection kind '{other}' (known: {})",
                    KINDS.join(", ")
                )));
            }
        };
        info!("Collection module '{}' initialized", module.name());
        Ok(module)
    }
}
