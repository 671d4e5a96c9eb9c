use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde_json::Value;

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum LogLevel {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Verbose = 5,
}

impl LogLevel {
    pub fn from_config_value(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "error" => Some(Self::Error),
            "warn" | "warning" => Some(Self::Warn),
            "info" => Some(Self::Info),
            "debug" => Some(Self::Debug),
            "verbose" | "trace" => Some(Self::Verbose),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
            Self::Verbose => "VERBOSE",
        }
    }

    fn as_colored_str(self) -> &'static str {
        match self {
            Self::Error => "\x1b[31mERROR\x1b[0m",
            Self::Warn => "\x1b[33mWARN\x1b[0m",
            Self::Info => "\x1b[32mINFO\x1b[0m",
            Self::Debug => "\x1b[36mDEBUG\x1b[0m",
            Self::Verbose => "\x1b[35mVERBOSE\x1b[0m",
        }
    }
}

#[derive(Clone, Debug)]
pub struct LoggerConfig {
    pub min_level: LogLevel,
    pub human_friendly: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            min_level: LogLevel::Info,
            human_friendly: false,
        }
    }
}

pub trait LogSink: Send + Sync {
    fn write_line(&self, line: &str);
}

#[derive(Default)]
pub struct StderrSink;

impl LogSink for StderrSink {
    fn write_line(&self, line: &str) {
        let mut stderr = io::stderr().lock();
        let _ = writeln!(stderr, "{line}");
    }
}

/// Discards every line. Used where a component is built without a logger.
#[derive(Default)]
pub struct NullSink;

impl LogSink for NullSink {
    fn write_line(&self, _line: &str) {}
}

pub struct Logger {
    config: LoggerConfig,
    sink: Arc<dyn LogSink>,
}

impl Logger {
    pub fn new(config: LoggerConfig) -> Self {
        Self::with_sink(config, Arc::new(StderrSink))
    }

    pub fn with_sink(config: LoggerConfig, sink: Arc<dyn LogSink>) -> Self {
        Self { config, sink }
    }

    pub fn disabled() -> Arc<Self> {
        Arc::new(Self::with_sink(LoggerConfig::default(), Arc::new(NullSink)))
    }

    pub fn error(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Error, context, message, None);
    }

    pub fn warn(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Warn, context, message, None);
    }

    pub fn info(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Info, context, message, None);
    }

    pub fn debug(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Debug, context, message, None);
    }

    pub fn verbose(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Verbose, context, message, None);
    }

    pub fn log(
        &self,
        level: LogLevel,
        context: Option<&str>,
        message: &str,
        payload: Option<Value>,
    ) {
        if !self.enabled(level) {
            return;
        }

        let line = self.format_line(level, context, message, payload.as_ref());
        self.sink.write_line(&line);
    }

    pub fn enabled(&self, level: LogLevel) -> bool {
        level <= self.config.min_level
    }

    fn format_line(
        &self,
        level: LogLevel,
        context: Option<&str>,
        message: &str,
        payload: Option<&Value>,
    ) -> String {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let rendered_level = if self.config.human_friendly {
            level.as_colored_str()
        } else {
            level.as_str()
        };

        let context_part = match context {
            Some(ctx) if !ctx.is_empty() => format!(" [{ctx}]"),
            _ => String::new(),
        };

        let payload_part = match payload {
            Some(value) => format!(" payload={value}"),
            None => String::new(),
        };

        format!("{timestamp} [{rendered_level}]{context_part} {message}{payload_part}")
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("config", &self.config)
            .field("sink", &"<dyn LogSink>")
            .finish()
    }
}
