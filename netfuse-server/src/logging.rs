//! Prefixed, level-tagged logging to an optional log file and/or the
//! operating system's syslog sink.
//!
//! Grounded in spec.md §6 ("Prefixed, level-tagged lines (DEBUG|INFO|WARN|
//! ERROR) to optional log file and/or the operating system's syslog
//! sink") and the original's `dbg.h`/`dbg_set_logfile`/`dbg_enable_syslog`
//! switch. `env_logger` already gives every other binary in this
//! workspace the stderr case; this module adds the two sinks that are
//! specific to a process that may daemonize and lose its stderr.

use std::fs::File;
use std::io::Write;
use std::sync::Mutex;

use log::{Level, Log, Metadata, Record};

/// Fans a log record out to a plain-text file and/or syslog, each
/// optional. Installed as the global logger instead of `env_logger`
/// whenever either sink is configured — a daemonized server has already
/// closed stderr by the time it would otherwise log anything.
pub struct ServerLogger {
    file: Option<Mutex<File>>,
    syslog: Option<Mutex<syslog::Logger<syslog::LoggerBackend, syslog::Formatter3164>>>,
    level: Level,
}

impl ServerLogger {
    pub fn install(
        level: Level,
        logfile: Option<&std::path::Path>,
        use_syslog: bool,
    ) -> Result<(), LoggingError> {
        let file = logfile
            .map(|path| {
                std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map(Mutex::new)
                    .map_err(|e| LoggingError::OpenLogFile(path.display().to_string(), e))
            })
            .transpose()?;

        let syslog = if use_syslog {
            let formatter = syslog::Formatter3164 {
                facility: syslog::Facility::LOG_DAEMON,
                hostname: None,
                process: "netfuse-server".into(),
                pid: std::process::id(),
            };
            Some(Mutex::new(syslog::unix(formatter).map_err(LoggingError::Syslog)?))
        } else {
            None
        };

        let logger = ServerLogger { file, syslog, level };
        log::set_max_level(level.to_level_filter());
        log::set_boxed_logger(Box::new(logger)).map_err(LoggingError::AlreadyInstalled)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("could not open log file {0}: {1}")]
    OpenLogFile(String, std::io::Error),
    #[error("could not initialize syslog: {0}")]
    Syslog(#[source] syslog::Error),
    #[error("a global logger is already installed")]
    AlreadyInstalled(#[source] log::SetLoggerError),
}

impl Log for ServerLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = writeln!(file, "{} {} {}", record.level(), record.target(), record.args());
            }
        }

        if let Some(syslog) = &self.syslog {
            if let Ok(mut syslog) = syslog.lock() {
                let message = record.args().to_string();
                let _ = match record.level() {
                    Level::Error => syslog.err(message),
                    Level::Warn => syslog.warning(message),
                    Level::Info => syslog.info(message),
                    Level::Debug | Level::Trace => syslog.debug(message),
                };
            }
        }
    }

    fn flush(&self) {
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Log;

    /// Exercises the file sink directly, bypassing the process-global
    /// `log::set_boxed_logger` (which only one test in the whole binary
    /// could ever install).
    fn record_at(level: Level) -> Record<'static> {
        Record::builder()
            .level(level)
            .target("netfuse_server::logging::tests")
            .args(format_args!("hello"))
            .build()
    }

    #[test]
    fn file_sink_writes_enabled_levels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.log");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .unwrap();
        let logger = ServerLogger { file: Some(Mutex::new(file)), syslog: None, level: Level::Info };

        logger.log(&record_at(Level::Info));
        logger.log(&record_at(Level::Debug));
        logger.flush();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 1);
        assert!(contents.contains("INFO"));
        assert!(contents.contains("hello"));
    }

    #[test]
    fn enabled_respects_configured_level() {
        let logger = ServerLogger { file: None, syslog: None, level: Level::Warn };
        assert!(logger.enabled(&log::MetadataBuilder::new().level(Level::Error).build()));
        assert!(logger.enabled(&log::MetadataBuilder::new().level(Level::Warn).build()));
        assert!(!logger.enabled(&log::MetadataBuilder::new().level(Level::Info).build()));
    }
}
