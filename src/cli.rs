use clap::Parser;
use log::LevelFilter;
use std::path::PathBuf;

/// thmond, a periodic sensor acquisition daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path, YAML or JSON (default: ~/.config/thmond/config.yml, then /etc/thmond/config.yml)
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Detach from the terminal, output goes to /var/tmp/thmond.log
    #[arg(short = 'd', long = "daemonize", default_value = "false")]
    pub daemonize: bool,

    /// Maximum log level: off, error, warn, info, debug or trace
    #[arg(long = "log-level", default_value = "info")]
    pub log_level: LevelFilter,
}
