//! Output sinks and the provider that builds one from configuration.

pub mod display;
pub mod http_post;
pub mod mqtt;
pub mod payload;
pub mod stdout;
pub mod threshold;

use std::time::Duration;

use async_trait::async_trait;
use log::info;

use crate::{
    config::ModuleCfg,
    module::{ModuleProvider, PostCollection},
    outcome::ModuleError,
    store::ReadingStore,
};

pub const KINDS: &[&str] = &[
    display::KIND,
    mqtt::KIND,
    http_post::KIND,
    threshold::KIND,
    stdout::KIND,
];

/// Builds the sink named by one `post_collection` entry.
pub struct ConfiguredPostCollection {
    cfg: ModuleCfg,
}

impl ConfiguredPostCollection {
    pub fn new(cfg: ModuleCfg) -> Self {
        Self { cfg }
    }
}

#[async_trait]
impl ModuleProvider<dyn PostCollection> for ConfiguredPostCollection {
    fn name(&self) -> &str {
        &self.cfg.kind
    }

    async fn init(&self, _store: &ReadingStore) -> Result<Box<dyn PostCollection>, ModuleError> {
        let module: Box<dyn PostCollection> = match self.cfg.kind.as_str() {
            display::KIND => {
                let settings: display::DisplaySettings = self.cfg.settings()?;
                settings.validate()?;
                let driver = Box::new(display::ConsoleDisplay::new(&settings));
                Box::new(display::DisplaySink::new(&settings, driver)?)
            }
            mqtt::KIND => Box::new(mqtt::MqttSink::connect(self.cfg.settings()?).await?),
            http_post::KIND => Box::new(http_post::HttpPostSink::new(self.cfg.settings()?)?),
            threshold::KIND => Box::new(threshold::ThresholdExec::new(self.cfg.settings()?)?),
            stdout::KIND => Box::new(stdout::StdoutSink::new(&self.cfg.settings()?)?),
            other => {
                return Err(ModuleError::config(format!(
                    "unknown post_collection kind '{other}' (known: {})",
                    KINDS.join(", ")
                )));
            }
        };
        info!("Post-collection module '{}' initialized", module.name());
        Ok(module)
    }

    fn cadence(&self) -> Option<Duration> {
        self.cfg.cadence()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn unknown_kind_is_configuration_error() {
        let provider = ConfiguredPostCollection::new(ModuleCfg::new("lcd"));
        assert!(matches!(
            provider.init(&ReadingStore::new()).await.err(),
            Some(ModuleError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn display_without_pins_fails_init() {
        let provider = ConfiguredPostCollection::new(
            ModuleCfg::new(display::KIND)
                .with("data_pin_num", 17)
                .with("clock_pin_num", 0)
                .with("latch_pin_num", 22)
                .with("chain_num", 2)
                .with("gpiochip_path", "/dev/gpiochip0"),
        );
        assert!(matches!(
            provider.init(&ReadingStore::new()).await.err(),
            Some(ModuleError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn cadence_comes_from_entry() {
        let mut cfg = ModuleCfg::new(stdout::KIND);
        cfg.cadence_ms = Some(100);
        let provider = ConfiguredPostCollection::new(cfg);
        assert_eq!(provider.cadence(), Some(Duration::from_millis(100)));

        let module = provider.init(&ReadingStore::new()).await.unwrap();
        assert_eq!(module.name(), stdout::KIND);
    }
}
