use std::path::Path;

use anyhow::{Context, Result};
use log::LevelFilter;
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;

use crate::config::LOG_ENV;

const FILE_PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S%.3f)} {l:<5} {t} - {m}{n}";

/// Unknown names fall back to `Info`.
pub fn parse_level(level: &str) -> LevelFilter {
    level.trim().parse().unwrap_or(LevelFilter::Info)
}

/// Sends log records to a file so they never draw over the terminal UI.
///
/// A `log4rs.yaml` next to the working directory takes precedence over the
/// built-in appender.
pub fn init_file_logging(root: &Path, log_path: &Path, level: &str) -> Result<()> {
    let custom = root.join("log4rs.yaml");
    if custom.exists() {
        return log4rs::init_file(&custom, Default::default())
            .with_context(|| format!("Failed to load {}", custom.display()));
    }

    let appender = FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(FILE_PATTERN)))
        .build(log_path)
        .with_context(|| format!("Failed to open log file {}", log_path.display()))?;
    let config = Config::builder()
        .appender(Appender::builder().build("file", Box::new(appender)))
        .build(Root::builder().appender("file").build(parse_level(level)))
        .context("Invalid logging configuration")?;
    log4rs::init_config(config).context("A logger is already installed")?;
    Ok(())
}

/// Plain stderr logging for the one-shot subcommands.
pub fn init_console_logging(level: &str) -> Result<()> {
    env_logger::Builder::new()
        .filter_level(parse_level(level))
        .parse_env(LOG_ENV)
        .try_init()
        .context("A logger is already installed")
}
