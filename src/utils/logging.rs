//! Logging utilities and initialization for labflash

use anyhow::Result;
use env_logger::{Builder, Target};
use log::LevelFilter;
use std::io::Write;
use tokio::sync::mpsc;

/// Map CLI verbosity flags to a level filter
pub fn cli_level(verbose: u8, quiet: bool) -> LevelFilter {
    match (quiet, verbose) {
        (true, _) => LevelFilter::Error,
        (false, 0) => LevelFilter::Info,
        (false, 1) => LevelFilter::Debug,
        (false, _) => LevelFilter::Trace,
    }
}

/// Initialize logging for the labflash CLI
pub fn init_cli_logging(verbose: u8, quiet: bool) -> Result<()> {
    let level = cli_level(verbose, quiet);

    Builder::from_default_env()
        .target(Target::Stderr)
        .filter_level(level)
        .format_timestamp_secs()
        .format_module_path(false)
        .try_init()?;

    #[cfg(debug_assertions)]
    log_panics::init();

    log::debug!("labflash logging initialized with level: {:?}", level);
    Ok(())
}

/// Initialize logging for labflash-server
pub fn init_server_logging(
    structured: bool,
    log_file: Option<&str>,
    level: Option<LevelFilter>,
) -> Result<()> {
    let level = level.unwrap_or(LevelFilter::Info);

    if structured {
        init_json_logger(level, log_file)?;
    } else {
        init_human_readable_server_logger(level)?;
    }

    // Always initialize panic logging for server
    log_panics::init();

    log::info!("labflash server logging initialized with level: {:?}", level);
    Ok(())
}

/// Initialize JSON structured logging for server
fn init_json_logger(level: LevelFilter, log_file: Option<&str>) -> Result<()> {
    use chrono::Utc;
    use std::fs::OpenOptions;

    let target: Box<dyn Write + Send> = if let Some(file_path) = log_file {
        Box::new(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(file_path)?,
        )
    } else {
        Box::new(std::io::stdout())
    };

    Builder::from_default_env()
        .target(Target::Pipe(target))
        .filter_level(level)
        .format(|buf, record| {
            let json = serde_json::json!({
                "timestamp": Utc::now().to_rfc3339(),
                "level": record.level().to_string(),
                "module": record.module_path().unwrap_or("unknown"),
                "message": record.args().to_string(),
                "target": record.target(),
            });
            writeln!(buf, "{}", json)
        })
        .try_init()?;

    Ok(())
}

/// Initialize human-readable logging for server
fn init_human_readable_server_logger(level: LevelFilter) -> Result<()> {
    Builder::from_default_env()
        .target(Target::Stdout)
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}: {}",
                buf.timestamp(),
                record.level(),
                record.module_path().unwrap_or("unknown"),
                record.args()
            )
        })
        .try_init()?;

    Ok(())
}

/// Logs an operation's progress and mirrors each message to a line channel
/// (build log streaming, CLI progress)
#[derive(Debug, Clone, Default)]
pub struct OperationLog {
    tx: Option<mpsc::UnboundedSender<String>>,
}

impl OperationLog {
    pub fn new(tx: Option<mpsc::UnboundedSender<String>>) -> Self {
        Self { tx }
    }

    pub fn error(&self, message: String) {
        log::error!("{}", message);
        self.forward(message);
    }

    pub fn warning(&self, message: String) {
        log::warn!("{}", message);
        self.forward(message);
    }

    pub fn info(&self, message: String) {
        log::info!("{}", message);
        self.forward(message);
    }

    /// Debug logging only, never forwarded
    pub fn debug(&self, message: &str) {
        log::debug!("{}", message);
    }

    fn forward(&self, message: String) {
        if let Some(tx) = &self.tx {
            // Receiver gone means the client stopped reading; keep logging locally
            let _ = tx.send(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_operation_log_forwards_messages() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let oplog = OperationLog::new(Some(tx));

        oplog.info("🏗️  Starting build".to_string());
        oplog.debug("not forwarded");
        oplog.error("❌ Build failed".to_string());

        assert_eq!(rx.recv().await.as_deref(), Some("🏗️  Starting build"));
        assert_eq!(rx.recv().await.as_deref(), Some("❌ Build failed"));
    }

    #[test]
    fn test_operation_log_without_channel() {
        let oplog = OperationLog::default();
        oplog.warning("nobody listening".to_string());
    }

    #[test]
    fn test_log_level_selection() {
        assert_eq!(cli_level(0, true), LevelFilter::Error);
        assert_eq!(cli_level(0, false), LevelFilter::Info);
        assert_eq!(cli_level(1, false), LevelFilter::Debug);
        assert_eq!(cli_level(2, false), LevelFilter::Trace);
    }
}
