use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::client::{Client, ClientError};

pub const DEFAULT_QUEUE: &str = "default";
pub const DEFAULT_PRIORITY: u8 = 5;
pub const DEFAULT_RETRY: i64 = 25;
pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 9;

/// Wire shape of a job. Fields the server adds on fetch (`created_at`,
/// `enqueued_at`, `failure`, ...) are kept in `extra` and sent back verbatim.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct JobPayload {
    #[serde(default)]
    pub jid: String,
    pub jobtype: String,
    #[serde(default = "default_queue")]
    pub queue: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserve_for: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<Map<String, Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_queue() -> String {
    DEFAULT_QUEUE.to_owned()
}

impl JobPayload {
    /// Fills whatever a hand-built payload left out with the builder defaults.
    pub fn with_defaults(mut self) -> Self {
        if self.jid.is_empty() {
            self.jid = Job::generate_jid();
        }
        if self.queue.is_empty() {
            self.queue = default_queue();
        }
        self.priority.get_or_insert(DEFAULT_PRIORITY);
        self.retry.get_or_insert(DEFAULT_RETRY);
        self
    }
}

#[derive(Debug)]
pub enum JobBuildError {
    EmptyJobtype,
    InvalidPriority { value: u8 },
    InvalidTimestamp {
        value: String,
        source: chrono::ParseError,
    },
}

impl fmt::Display for JobBuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyJobtype => write!(f, "job must be given a jobtype"),
            Self::InvalidPriority { value } => write!(
                f,
                "job priority must be between {MIN_PRIORITY} and {MAX_PRIORITY}, got {value}"
            ),
            Self::InvalidTimestamp { value, source } => {
                write!(f, "invalid RFC3339 timestamp '{value}': {source}")
            }
        }
    }
}

impl std::error::Error for JobBuildError {}

/// Fluent builder for a [`JobPayload`].
///
/// ```no_run
/// # use faktory_worker::{Client, ClientOptions, Job, Logger};
/// # let client = Client::new(ClientOptions::default(), Logger::disabled()).unwrap();
/// let jid = Job::new("SendWelcomeEmail")?
///     .args([serde_json::json!(42)])
///     .queue("mailers")
///     .push(&client)?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct Job {
    payload: JobPayload,
}

impl Job {
    pub fn new(jobtype: impl Into<String>) -> Result<Self, JobBuildError> {
        let jobtype = jobtype.into();
        if jobtype.trim().is_empty() {
            return Err(JobBuildError::EmptyJobtype);
        }

        Ok(Self {
            payload: JobPayload {
                jid: Self::generate_jid(),
                jobtype,
                queue: default_queue(),
                args: Vec::new(),
                priority: Some(DEFAULT_PRIORITY),
                retry: Some(DEFAULT_RETRY),
                at: None,
                reserve_for: None,
                custom: None,
                extra: Map::new(),
            },
        })
    }

    pub fn generate_jid() -> String {
        Uuid::new_v4().to_string()
    }

    pub fn jid(mut self, jid: impl Into<String>) -> Self {
        self.payload.jid = jid.into();
        self
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.payload.queue = queue.into();
        self
    }

    pub fn args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = Value>,
    {
        self.payload.args = args.into_iter().collect();
        self
    }

    pub fn priority(mut self, priority: u8) -> Result<Self, JobBuildError> {
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
            return Err(JobBuildError::InvalidPriority { value: priority });
        }
        self.payload.priority = Some(priority);
        Ok(self)
    }

    /// Number of retries; `0` sends failures straight to the dead set and
    /// `-1` discards them.
    pub fn retry(mut self, retry: i64) -> Self {
        self.payload.retry = Some(retry);
        self
    }

    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.payload.at = Some(at.to_rfc3339_opts(SecondsFormat::Millis, true));
        self
    }

    pub fn at_rfc3339(mut self, at: &str) -> Result<Self, JobBuildError> {
        let parsed =
            DateTime::parse_from_rfc3339(at).map_err(|source| JobBuildError::InvalidTimestamp {
                value: at.to_owned(),
                source,
            })?;
        self.payload.at = Some(
            parsed
                .with_timezone(&Utc)
                .to_rfc3339_opts(SecondsFormat::Millis, true),
        );
        Ok(self)
    }

    pub fn reserve_for(mut self, seconds: u64) -> Self {
        self.payload.reserve_for = Some(seconds);
        self
    }

    pub fn custom(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload
            .custom
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }

    pub fn payload(&self) -> &JobPayload {
        &self.payload
    }

    pub fn into_payload(self) -> JobPayload {
        self.payload
    }

    pub fn push(self, client: &Client) -> Result<String, ClientError> {
        client.push(&self.payload)
    }
}

impl From<Job> for JobPayload {
    fn from(job: Job) -> Self {
        job.into_payload()
    }
}
