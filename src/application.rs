//! Application entry point and builder pattern implementation.

use anyhow::{Context, Result};
use log::info;

use crate::{
    cancellation::CancellationFlag,
    collection::ConfiguredCollection,
    config::ConfigManager,
    event_loop::{EventLoop, LoopReport},
    post_collection::ConfiguredPostCollection,
};

/// Wires the configured modules into an [`EventLoop`] and runs it.
///
/// # Example
///
/// ```no_run
/// use thmond::application::Application;
/// use thmond::config;
///
/// # async fn example() -> anyhow::Result<()> {
/// let config_manager = config::ConfigManager::load(None).await?;
/// let mut app = Application::builder()
///     .with_config_manager(config_manager)
///     .build()?;
///
/// let report = app.run().await?;
/// println!("{}", report.status);
/// # Ok(())
/// # }
/// ```
pub struct Application {
    config_manager: ConfigManager,
    flag: CancellationFlag,
    handle_signals: bool,
}

impl Application {
    pub fn builder() -> ApplicationBuilder {
        ApplicationBuilder::new()
    }

    /// The flag that stops [`run`](Self::run).
    pub fn cancellation(&self) -> CancellationFlag {
        self.flag.clone()
    }

    /// Runs the daemon lifecycle until a signal or a fatal fault.
    ///
    /// Errors only when signal handlers cannot be installed; module failures
    /// are reported through the returned [`LoopReport`].
    pub async fn run(&mut self) -> Result<LoopReport> {
        if self.handle_signals {
            self.flag
                .install_signal_handlers()
                .context("Failed to install signal handlers")?;
        }

        let config = self.config_manager.clone_config().await;
        info!(
            "Using {} (collection '{}', {} post-collection module(s))",
            self.config_manager.path().display(),
            config.collection.kind,
            config.post_collection.len()
        );

        let interval = config.interval();
        let event_loop = config.post_collection.into_iter().fold(
            EventLoop::new(
                Box::new(ConfiguredCollection::new(config.collection)),
                interval,
                self.flag.clone(),
            ),
            |event_loop, cfg| {
                event_loop.with_post_collection(Box::new(ConfiguredPostCollection::new(cfg)))
            },
        );

        Ok(event_loop.run().await)
    }
}

/// Builder pattern for creating Application instances.
pub struct ApplicationBuilder {
    config_manager: Option<ConfigManager>,
    flag: Option<CancellationFlag>,
    handle_signals: bool,
}

impl ApplicationBuilder {
    fn new() -> Self {
        Self {
            config_manager: None,
            flag: None,
            handle_signals: true,
        }
    }

    pub fn with_config_manager(mut self, config_manager: ConfigManager) -> Self {
        self.config_manager = Some(config_manager);
        self
    }

    /// Uses an externally owned flag instead of a fresh one.
    pub fn with_cancellation(mut self, flag: CancellationFlag) -> Self {
        self.flag = Some(flag);
        self
    }

    /// Skips SIGINT/SIGTERM/SIGABRT registration.
    pub fn without_signal_handlers(mut self) -> Self {
        self.handle_signals = false;
        self
    }

    pub fn build(self) -> Result<Application> {
        let config_manager = self
            .config_manager
            .ok_or_else(|| anyhow::anyhow!("Configuration manager is required"))?;

        Ok(Application {
            config_manager,
            flag: self.flag.unwrap_or_default(),
            handle_signals: self.handle_signals,
        })
    }
}
