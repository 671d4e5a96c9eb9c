use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use toml::Value;

use crate::client::{ClientOptions, DEFAULT_PORT, server_url_from_env};
use crate::logging::{LogLevel, LoggerConfig};
use crate::pools::{DEFAULT_ACQUIRE_TIMEOUT, DEFAULT_IDLE_TIMEOUT, DEFAULT_MIN_IDLE};
use crate::worker::{
    DEFAULT_BEAT_INTERVAL, DEFAULT_CONCURRENCY, DEFAULT_SHUTDOWN_TIMEOUT, WorkerOptions,
};

pub const DEFAULT_CONFIG_FILE: &str = "faktory-worker.toml";
const CONFIG_ARG: &str = "--config";

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub worker: WorkerConfig,
    pub pool: PoolSection,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub human_friendly: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            human_friendly: false,
        }
    }
}

/// `host`, `port` and `password` take precedence over the parts of `url`
/// when set (non-empty, non-zero).
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub url: String,
    pub host: String,
    pub port: u16,
    pub password: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: server_url_from_env(),
            host: String::new(),
            port: 0,
            password: String::new(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerConfig {
    pub wid: String,
    pub labels: Vec<String>,
    pub concurrency: u64,
    pub queues: Vec<String>,
    pub shutdown_timeout_secs: u64,
    pub beat_interval_secs: u64,
    /// 0 sizes the pool at `concurrency + 2`.
    pub pool_size: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            wid: String::new(),
            labels: Vec::new(),
            concurrency: DEFAULT_CONCURRENCY as u64,
            queues: Vec::new(),
            shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT.as_secs(),
            beat_interval_secs: DEFAULT_BEAT_INTERVAL.as_secs(),
            pool_size: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct PoolSection {
    pub acquire_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub min_idle: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: DEFAULT_ACQUIRE_TIMEOUT.as_millis() as u64,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT.as_millis() as u64,
            min_idle: DEFAULT_MIN_IDLE as u64,
        }
    }
}

impl AppConfig {
    /// `--config <path>` selects the file; otherwise `./faktory-worker.toml`
    /// is used when present, else the built-in defaults. Remaining arguments
    /// are `--section.key value` overrides.
    pub fn load_with_discovery(
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let mut explicit_path = None;
        let mut overrides = Vec::new();
        let mut iter = args.into_iter();
        while let Some(arg) = iter.next() {
            if arg == CONFIG_ARG {
                let path = iter.next().ok_or_else(|| ConfigError::MissingValueForArg {
                    key: "config".to_owned(),
                })?;
                explicit_path = Some(PathBuf::from(path));
            } else {
                overrides.push(arg);
            }
        }

        match explicit_path {
            Some(path) => Self::load_from_toml_with_args(path, overrides),
            None if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
                Self::load_from_toml_with_args(DEFAULT_CONFIG_FILE, overrides)
            }
            None => Self::from_defaults_with_args(overrides),
        }
    }

    pub fn load_from_toml_with_args(
        path: impl AsRef<Path>,
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let toml_content = fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Io {
            path: path.as_ref().to_string_lossy().to_string(),
            source,
        })?;

        let file_value: Value = toml_content
            .parse()
            .map_err(|source| ConfigError::TomlParse {
                path: path.as_ref().to_string_lossy().to_string(),
                source,
            })?;
        let from_file: Self = file_value.try_into().map_err(ConfigError::Deserialize)?;

        from_file.with_overrides(args)
    }

    pub fn from_defaults_with_args(
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        Self::default().with_overrides(args)
    }

    /// Overrides are applied to the fully populated config so that keys the
    /// file left at their defaults can still be overridden.
    fn with_overrides(self, args: impl IntoIterator<Item = String>) -> Result<Self, ConfigError> {
        let overrides = parse_cli_overrides(args)?;
        if overrides.is_empty() {
            return Ok(self);
        }

        let mut root_value = Value::try_from(&self).map_err(ConfigError::Serialize)?;
        for (key_path, raw_value) in overrides {
            apply_override(&mut root_value, &key_path, &raw_value)?;
        }

        root_value.try_into().map_err(ConfigError::Deserialize)
    }

    pub fn logger_config(&self) -> Result<LoggerConfig, ConfigError> {
        let min_level = LogLevel::from_config_value(&self.logging.level).ok_or_else(|| {
            ConfigError::InvalidLogLevel {
                value: self.logging.level.clone(),
            }
        })?;

        Ok(LoggerConfig {
            min_level,
            human_friendly: self.logging.human_friendly,
        })
    }

    pub fn client_options(&self) -> Result<ClientOptions, ConfigError> {
        let url = ServerUrl::parse(&self.server.url)?;
        let mut options = ClientOptions::for_address(url.host, url.port);
        options.password = url.password;

        if !self.server.host.is_empty() {
            options.host = self.server.host.clone();
        }
        if self.server.port != 0 {
            options.port = self.server.port;
        }
        if !self.server.password.is_empty() {
            options.password = Some(self.server.password.clone());
        }

        options.pool.acquire_timeout = Duration::from_millis(self.pool.acquire_timeout_ms);
        options.pool.idle_timeout = Duration::from_millis(self.pool.idle_timeout_ms);
        options.pool.min_idle = self.pool.min_idle as usize;
        Ok(options)
    }

    pub fn worker_options(&self) -> Result<WorkerOptions, ConfigError> {
        let worker = &self.worker;
        if worker.concurrency == 0 {
            return Err(ConfigError::InvalidValueForType {
                key: "worker.concurrency".to_owned(),
                expected: "positive integer",
                value: "0".to_owned(),
            });
        }

        Ok(WorkerOptions {
            wid: Some(worker.wid.clone()).filter(|wid| !wid.is_empty()),
            labels: worker.labels.clone(),
            concurrency: worker.concurrency as usize,
            queues: worker.queues.clone(),
            shutdown_timeout: Duration::from_secs(worker.shutdown_timeout_secs),
            beat_interval: Duration::from_secs(worker.beat_interval_secs),
            pool_size: Some(worker.pool_size as usize).filter(|size| *size > 0),
            server: self.client_options()?,
        })
    }
}

/// Parsed `tcp://[user:password@]host[:port]` server address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerUrl {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
}

impl ServerUrl {
    pub fn parse(url: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &'static str| ConfigError::InvalidUrl {
            url: url.to_owned(),
            reason,
        };

        let rest = url
            .trim()
            .strip_prefix("tcp://")
            .ok_or_else(|| invalid("expected the tcp:// scheme"))?;
        let authority = rest.split('/').next().unwrap_or_default();

        let (userinfo, address) = match authority.rsplit_once('@') {
            Some((userinfo, address)) => (Some(userinfo), address),
            None => (None, authority),
        };
        let password = match userinfo.and_then(|info| info.split_once(':')) {
            Some((_, encoded)) if !encoded.is_empty() => {
                Some(percent_decode(encoded).ok_or_else(|| invalid("malformed percent-encoding"))?)
            }
            _ => None,
        };

        let (host, port) = match address.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| invalid("port is not a number"))?;
                (host, port)
            }
            None => (address, DEFAULT_PORT),
        };
        if host.is_empty() {
            return Err(invalid("missing host"));
        }

        Ok(Self {
            host: host.to_owned(),
            port,
            password,
        })
    }
}

fn percent_decode(encoded: &str) -> Option<String> {
    let bytes = encoded.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] == b'%' {
            let hex = encoded.get(index + 1..index + 3)?;
            decoded.push(u8::from_str_radix(hex, 16).ok()?);
            index += 3;
        } else {
            decoded.push(bytes[index]);
            index += 1;
        }
    }
    String::from_utf8(decoded).ok()
}

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: String,
        source: std::io::Error,
    },
    TomlParse {
        path: String,
        source: toml::de::Error,
    },
    Deserialize(toml::de::Error),
    Serialize(toml::ser::Error),
    MissingValueForArg {
        key: String,
    },
    InvalidArgFormat {
        arg: String,
    },
    InvalidPath {
        key: String,
    },
    UnknownPath {
        key: String,
    },
    UnsupportedOverrideType {
        key: String,
    },
    InvalidValueForType {
        key: String,
        expected: &'static str,
        value: String,
    },
    InvalidLogLevel {
        value: String,
    },
    InvalidUrl {
        url: String,
        reason: &'static str,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to read config file '{path}': {source}")
            }
            Self::TomlParse { path, source } => {
                write!(f, "failed to parse TOML config '{path}': {source}")
            }
            Self::Deserialize(source) => write!(f, "failed to deserialize config: {source}"),
            Self::Serialize(source) => write!(f, "failed to serialize config: {source}"),
            Self::MissingValueForArg { key } => {
                write!(f, "missing value for CLI override '--{key}'")
            }
            Self::InvalidArgFormat { arg } => write!(
                f,
                "invalid CLI argument format '{arg}', expected '--section.key value'"
            ),
            Self::InvalidPath { key } => write!(f, "invalid override key path '{key}'"),
            Self::UnknownPath { key } => write!(f, "unknown override key path '{key}'"),
            Self::UnsupportedOverrideType { key } => {
                write!(f, "override not supported for complex TOML type at '{key}'")
            }
            Self::InvalidValueForType {
                key,
                expected,
                value,
            } => write!(
                f,
                "invalid value '{value}' for '{key}', expected type {expected}"
            ),
            Self::InvalidLogLevel { value } => write!(
                f,
                "invalid logging.level '{value}'. Allowed values: error, warn, info, debug, verbose"
            ),
            Self::InvalidUrl { url, reason } => {
                write!(f, "invalid server url '{url}': {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

fn parse_cli_overrides(
    args: impl IntoIterator<Item = String>,
) -> Result<Vec<(String, String)>, ConfigError> {
    let mut parsed = Vec::new();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        let Some(stripped) = arg.strip_prefix("--") else {
            return Err(ConfigError::InvalidArgFormat { arg });
        };

        if stripped.is_empty() {
            return Err(ConfigError::InvalidArgFormat { arg });
        }

        let value = iter.next().ok_or_else(|| ConfigError::MissingValueForArg {
            key: stripped.to_owned(),
        })?;

        parsed.push((stripped.to_owned(), value));
    }

    Ok(parsed)
}

fn apply_override(root: &mut Value, key_path: &str, raw_value: &str) -> Result<(), ConfigError> {
    let parts: Vec<&str> = key_path.split('.').collect();
    if parts.iter().any(|part| part.is_empty()) {
        return Err(ConfigError::InvalidPath {
            key: key_path.to_owned(),
        });
    }
    let unknown = || ConfigError::UnknownPath {
        key: key_path.to_owned(),
    };

    let (final_key, sections) = parts.split_last().ok_or_else(|| ConfigError::InvalidPath {
        key: key_path.to_owned(),
    })?;
    let mut current = root;
    for section in sections {
        current = current
            .as_table_mut()
            .ok_or_else(unknown)?
            .get_mut(*section)
            .ok_or_else(unknown)?;
    }

    let current_value = current
        .as_table_mut()
        .ok_or_else(unknown)?
        .get_mut(*final_key)
        .ok_or_else(unknown)?;

    *current_value = parse_value_using_current_type(key_path, raw_value, current_value)?;
    Ok(())
}

fn parse_value_using_current_type(
    key_path: &str,
    raw_value: &str,
    current_value: &Value,
) -> Result<Value, ConfigError> {
    let invalid = |expected: &'static str| ConfigError::InvalidValueForType {
        key: key_path.to_owned(),
        expected,
        value: raw_value.to_owned(),
    };

    match current_value {
        Value::String(_) => Ok(Value::String(raw_value.to_owned())),
        Value::Integer(_) => raw_value
            .parse::<i64>()
            .map(Value::Integer)
            .map_err(|_| invalid("integer")),
        Value::Float(_) => raw_value
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| invalid("float")),
        Value::Boolean(_) => raw_value
            .parse::<bool>()
            .map(Value::Boolean)
            .map_err(|_| invalid("boolean")),
        // Comma-separated lists for `labels` and `queues`.
        Value::Array(items) if items.iter().all(Value::is_str) => Ok(Value::Array(
            raw_value
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(|item| Value::String(item.to_owned()))
                .collect(),
        )),
        Value::Datetime(_) | Value::Array(_) | Value::Table(_) => {
            Err(ConfigError::UnsupportedOverrideType {
                key: key_path.to_owned(),
            })
        }
    }
}
