use std::{
    fs::{File, OpenOptions},
    io::{stderr, stdout, Write},
    str::FromStr,
    sync::Mutex,
};

use log::{LevelFilter, Log, Metadata, Record};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::logging::LogError;

pub use log::{debug, error, info, trace, warn};

/// Where log lines end up
#[derive(Debug)]
pub enum LogTarget {
    Stdout,
    Stderr,
    File(File),
}

impl LogTarget {
    /// parses `stdout`, `stderr` or `file:///absolute/path`
    pub fn parse(target: &str) -> Result<Self, LogError> {
        match target {
            "stdout" => Ok(LogTarget::Stdout),
            "stderr" => Ok(LogTarget::Stderr),
            other => {
                let Some(path) = other.strip_prefix("file://") else {
                    return Err(LogError::InvalidLogTarget(
                        other.to_owned(),
                        "expected stdout, stderr or file://<path>",
                    ));
                };
                if path.is_empty() {
                    return Err(LogError::InvalidLogTarget(
                        other.to_owned(),
                        "missing file path",
                    ));
                }
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|io_error| LogError::OpenFile(path.to_owned(), io_error))?;
                Ok(LogTarget::File(file))
            }
        }
    }

    fn write_line(&mut self, line: &str) {
        // a failing log write has nowhere to be reported
        let _ = match self {
            LogTarget::Stdout => stdout().lock().write_all(line.as_bytes()),
            LogTarget::Stderr => stderr().lock().write_all(line.as_bytes()),
            LogTarget::File(file) => file.write_all(line.as_bytes()),
        };
    }

    fn flush(&mut self) {
        let _ = match self {
            LogTarget::Stdout => stdout().flush(),
            LogTarget::Stderr => stderr().flush(),
            LogTarget::File(file) => file.flush(),
        };
    }
}

pub struct Logger {
    tag: String,
    pid: u32,
    level: LevelFilter,
    target: Mutex<LogTarget>,
}

impl Logger {
    pub fn new(target: LogTarget, level: LevelFilter, tag: &str) -> Self {
        Logger {
            tag: tag.to_owned(),
            pid: std::process::id(),
            level: level.min(compiled_max_level()),
            target: Mutex::new(target),
        }
    }

    pub fn level(&self) -> LevelFilter {
        self.level
    }

    /// `<time> <pid> <tag> <LEVEL> <message>`
    pub fn format(&self, record: &Record) -> String {
        let now = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| String::from("-"));
        format!(
            "{} {} {} {}\t{}\n",
            now,
            self.pid,
            self.tag,
            record.level(),
            record.args()
        )
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = self.format(record);
        if let Ok(mut target) = self.target.lock() {
            target.write_line(&line);
        }
    }

    fn flush(&self) {
        if let Ok(mut target) = self.target.lock() {
            target.flush();
        }
    }
}

/// the most verbose level this build keeps
pub fn compiled_max_level() -> LevelFilter {
    if cfg!(feature = "logs-trace") {
        LevelFilter::Trace
    } else if cfg!(any(feature = "logs-debug", debug_assertions)) {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    }
}

pub fn parse_level(level: &str) -> Result<LevelFilter, LogError> {
    LevelFilter::from_str(level).map_err(|_| LogError::InvalidLogLevel(level.to_owned()))
}

/// install the process-wide logger
pub fn setup_logging(target: &str, level: &str, tag: &str) -> Result<(), LogError> {
    let level = parse_level(level)?;
    let logger = Logger::new(LogTarget::parse(target)?, level, tag);
    let max_level = logger.level();
    log::set_boxed_logger(Box::new(logger)).map_err(|_| LogError::AlreadyInstalled)?;
    log::set_max_level(max_level);
    Ok(())
}

/// stdout logging for tests and tools, silently keeps a logger installed earlier
pub fn setup_default_logging(log_enabled: bool, log_level: &str, tag: &str) {
    let level = if log_enabled { log_level } else { "off" };
    match setup_logging("stdout", level, tag) {
        Ok(()) | Err(LogError::AlreadyInstalled) => {}
        Err(error) => eprintln!("could not set up logging: {error}"),
    }
}
