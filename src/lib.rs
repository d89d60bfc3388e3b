//! # thmond
//!
//! A Linux daemon that periodically reads one sensor and fans every reading
//! out to a configurable list of sinks.
//!
//! ## Features
//!
//! - **Sensors**: SHT31 and INA219 over I²C, 1-Wire thermometers, Modbus RTU
//!   over a serial line, JSON HTTP endpoints
//! - **Sinks**: seven-segment display, MQTT over TLS, HTTP POST, threshold
//!   triggered commands, stdout
//! - **Validation**: CRC-8 and CRC-16/MODBUS checks on every frame
//! - **Graceful shutdown**: SIGINT/SIGTERM/SIGABRT drain every module
//!
//! ## Architecture
//!
//! - [`EventLoop`](event_loop::EventLoop) - Module lifecycle and the acquisition cycle
//! - [`ReadingStore`](store::ReadingStore) - The shared latest reading
//! - [`CancellationFlag`](cancellation::CancellationFlag) - Signal and fault driven stop
//! - [`TaskManager`](task_manager::TaskManager) - Detached consumers
//! - Module providers built from [`config`] entries
//!
//! ## Example
//!
//! ```no_run
//! use thmond::{application::Application, config::ConfigManager};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config_manager = ConfigManager::load(None).await?;
//!     let report = Application::builder()
//!         .with_config_manager(config_manager)
//!         .build()?
//!         .run()
//!         .await?;
//!     println!("{} after {} cycles", report.status, report.cycles);
//!     Ok(())
//! }
//! ```

pub mod application;
pub mod bus;
pub mod cancellation;
pub mod checksum;
pub mod cli;
pub mod collection;
pub mod config;
pub mod event_loop;
pub mod module;
pub mod outcome;
pub mod post_collection;
pub mod store;
pub mod task_manager;
