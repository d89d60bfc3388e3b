use std::{fs::File, process::ExitCode};

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use daemonize::Daemonize;
use log::{LevelFilter, error, info};
use syslog::{BasicLogger, Facility, Formatter3164};

use thmond::{application::Application, cli::Cli, config::ConfigManager, event_loop::ExitStatus};

const DAEMON_LOG: &str = "/var/tmp/thmond.log";

fn init_log(level: LevelFilter) -> Result<()> {
    syslog::unix(Formatter3164 {
        facility: Facility::LOG_USER,
        hostname: None,
        process: "thmond".into(),
        pid: std::process::id(),
    })
    .map_err(|e| anyhow!("{e}"))
    .and_then(|logger| {
        log::set_boxed_logger(Box::new(BasicLogger::new(logger)))
            .map(|_| log::set_max_level(level))
            .map_err(|e| anyhow!("{e}"))
    })
}

fn into_daemon() -> Result<()> {
    File::create(DAEMON_LOG)
        .and_then(|out| Ok((out.try_clone()?, out)))
        .with_context(|| format!("Failed to create {DAEMON_LOG}"))
        .and_then(|(stderr, stdout)| {
            Daemonize::new()
                .stdout(stdout)
                .stderr(stderr)
                .start()
                .map_err(|e| anyhow!("{e}"))
        })
}

async fn run(cli: Cli) -> Result<ExitStatus> {
    let config_manager = ConfigManager::load(cli.config).await?;
    let report = Application::builder()
        .with_config_manager(config_manager)
        .build()?
        .run()
        .await?;
    Ok(report.status)
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_log(cli.log_level) {
        eprintln!("thmond: syslog unavailable, logging disabled: {e}");
    }
    if cli.daemonize {
        if let Err(e) = into_daemon() {
            error!("{e:#}");
            eprintln!("thmond: {e:#}");
            return ExitCode::FAILURE;
        }
    }

    // The runtime is built after daemonizing so its threads survive the fork.
    let status = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build the tokio runtime")
        .and_then(|runtime| runtime.block_on(run(cli)));

    match status {
        Ok(ExitStatus::Clean) => {
            info!("thmond exiting: {}", ExitStatus::Clean);
            ExitCode::SUCCESS
        }
        Ok(status) => {
            error!("thmond exiting: {status}");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("thmond exiting: {e:#}");
            eprintln!("thmond: {e:#}");
            ExitCode::FAILURE
        }
    }
}
