use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    Stderr,
    // The TUI owns the terminal, so its logs go to a file.
    File(PathBuf),
}

impl LogTarget {
    pub fn for_tui(cfg: &LogConfig) -> Self {
        LogTarget::File(PathBuf::from(&cfg.file))
    }
}

fn filter(verbose: bool) -> EnvFilter {
    if verbose {
        return EnvFilter::new("debug");
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

pub fn init_logging(target: &LogTarget, json: bool, verbose: bool) -> Result<()> {
    let filter = filter(verbose);
    let res = match target {
        LogTarget::Stderr => {
            let b = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(io::stderr);
            if json { b.json().try_init() } else { b.try_init() }
        }
        LogTarget::File(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| Error::msg(format!("failed to open log file {}: {e}", path.display())))?;
            let b = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file));
            if json { b.json().try_init() } else { b.try_init() }
        }
    };
    res.map_err(|e| Error::msg(format!("failed to initialize logging: {e}")))
}
