use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::chain::JobError;
use crate::config::{ConfigError, ServerUrl};
use crate::job::{Job, JobBuildError, JobPayload};
use crate::logging::Logger;
use crate::mutation::{MUTATE_VERB, Mutation, MutationRequest, MutationTarget};
use crate::pools::{
    ConnectionFactory, FactoryConfig, Handshake, ManageConnection, Pool, PoolConfig, PoolError,
    PoolStatus,
};
use crate::wire::codec::{Command, Token};
use crate::wire::connection::{DEFAULT_IDLE_TIMEOUT, Reply, WireConnection, WireError};
use crate::wire::handshake::{
    Greeting, HELLO_VERB, HandshakeError, Hello, WorkerIdentity, assert_version, local_hostname,
};

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 7419;
pub const DEFAULT_URL: &str = "tcp://localhost:7419";
pub const URL_ENV: &str = "FAKTORY_URL";
/// Names the environment variable that holds the server URL.
pub const PROVIDER_ENV: &str = "FAKTORY_PROVIDER";
pub const MAX_BACKTRACE_LINES: usize = 100;
const OK: &str = "OK";
const LOG_CONTEXT: &str = "client";

#[derive(Clone, Debug, PartialEq)]
pub struct ClientOptions {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    /// Present for worker processes; adds `wid`, `pid` and `labels` to HELLO.
    pub identity: Option<WorkerIdentity>,
    pub pool: PoolConfig,
    pub socket_timeout: Option<Duration>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::for_address(DEFAULT_HOST, DEFAULT_PORT)
    }
}

impl ClientOptions {
    pub fn for_address(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            password: None,
            identity: None,
            pool: PoolConfig::default(),
            socket_timeout: Some(DEFAULT_IDLE_TIMEOUT),
        }
    }

    pub fn from_url(url: &str) -> Result<Self, ConfigError> {
        let parsed = ServerUrl::parse(url)?;
        let mut options = Self::for_address(parsed.host, parsed.port);
        options.password = parsed.password;
        Ok(options)
    }

    /// Reads the URL from the variable named by `FAKTORY_PROVIDER`
    /// (`FAKTORY_URL` when unset), falling back to the local default.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_url(&server_url_from_env())
    }
}

pub fn server_url_from_env() -> String {
    let provider = std::env::var(PROVIDER_ENV).unwrap_or_else(|_| URL_ENV.to_owned());
    std::env::var(provider).unwrap_or_else(|_| DEFAULT_URL.to_owned())
}

#[derive(Debug)]
pub enum ClientError {
    Wire(WireError),
    Pool(PoolError),
    Handshake(HandshakeError),
    Json(serde_json::Error),
    Build(JobBuildError),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wire(source) => write!(f, "{source}"),
            Self::Pool(source) => write!(f, "{source}"),
            Self::Handshake(source) => write!(f, "handshake failed: {source}"),
            Self::Json(source) => write!(f, "invalid JSON in server reply: {source}"),
            Self::Build(source) => write!(f, "{source}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<WireError> for ClientError {
    fn from(value: WireError) -> Self {
        Self::Wire(value)
    }
}

impl From<PoolError> for ClientError {
    fn from(value: PoolError) -> Self {
        Self::Pool(value)
    }
}

impl From<HandshakeError> for ClientError {
    fn from(value: HandshakeError) -> Self {
        Self::Handshake(value)
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

impl From<JobBuildError> for ClientError {
    fn from(value: JobBuildError) -> Self {
        Self::Build(value)
    }
}

/// Reply to `BEAT`: plain `OK`, or a server-requested state change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BeatResponse {
    Ok,
    Quiet,
    Terminate,
    Other(String),
}

#[derive(Deserialize)]
struct BeatState {
    state: String,
}

impl BeatResponse {
    pub fn parse(reply: &str) -> Result<Self, serde_json::Error> {
        if !reply.starts_with('{') {
            return Ok(match reply {
                OK => Self::Ok,
                other => Self::Other(other.to_owned()),
            });
        }

        let BeatState { state } = serde_json::from_str(reply)?;
        Ok(match state.as_str() {
            "quiet" => Self::Quiet,
            "terminate" => Self::Terminate,
            _ => Self::Other(state),
        })
    }
}

#[derive(Serialize)]
struct FailReport<'a> {
    message: &'a str,
    errtype: &'a str,
    backtrace: &'a [String],
    jid: &'a str,
}

/// Connection-pooled handle to the job server. Safe to share between threads;
/// every call borrows its own connection for the duration of one exchange.
pub struct Client {
    pool: Pool<ConnectionFactory>,
    identity: Option<WorkerIdentity>,
    logger: Arc<Logger>,
}

impl Client {
    pub fn new(options: ClientOptions, logger: Arc<Logger>) -> Result<Self, ClientError> {
        let hostname = local_hostname()?;
        let identity = options.identity.clone();
        let password = options.password.clone().filter(|value| !value.is_empty());

        let handshake: Handshake = {
            let identity = identity.clone();
            Arc::new(
                move |connection: &WireConnection, greeting: &Greeting| -> Result<(), WireError> {
                    assert_version(greeting.protocol_version)?;
                    let hello = Hello::build(
                        greeting,
                        hostname.clone(),
                        identity.as_ref(),
                        password.as_deref(),
                    );
                    connection.send_with_assert(
                        &Command::new(HELLO_VERB).arg(Token::json(&hello)?),
                        OK,
                    )?;
                    Ok(())
                },
            )
        };

        let factory = ConnectionFactory::new(
            FactoryConfig {
                idle_timeout: options.socket_timeout,
                ..FactoryConfig::new(options.host.clone(), options.port)
            },
            handshake,
            Arc::clone(&logger),
        );

        logger.debug(
            Some(LOG_CONTEXT),
            &format!(
                "client for {}:{} with pool size {}",
                options.host, options.port, options.pool.max_size
            ),
        );

        Ok(Self {
            pool: Pool::new(factory, options.pool, Arc::clone(&logger)),
            identity,
            logger,
        })
    }

    /// Opens and handshakes one connection outside the pool, then closes it.
    pub fn connect(&self) -> Result<(), ClientError> {
        let factory = self.pool.manager();
        let connection = factory.create()?;
        factory.destroy(connection);
        Ok(())
    }

    /// Waits for borrowed connections to come back, then closes all of them.
    pub fn close(&self) {
        self.pool.close();
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }

    pub fn wid(&self) -> Option<&str> {
        self.identity.as_ref().map(|identity| identity.wid.as_str())
    }

    pub fn job<I>(&self, jobtype: &str, args: I) -> Result<Job, JobBuildError>
    where
        I: IntoIterator<Item = Value>,
    {
        Job::new(jobtype).map(|job| job.args(args))
    }

    pub fn send(&self, command: &Command) -> Result<Reply, ClientError> {
        let connection = self.pool.get()?;
        Ok(connection.send(command)?)
    }

    pub fn send_with_assert(
        &self,
        command: &Command,
        expected: &str,
    ) -> Result<Reply, ClientError> {
        let connection = self.pool.get()?;
        Ok(connection.send_with_assert(command, expected)?)
    }

    /// Returns the jid of the pushed job.
    pub fn push(&self, payload: &JobPayload) -> Result<String, ClientError> {
        let payload = payload.clone().with_defaults();
        self.send_with_assert(&Command::new("PUSH").arg(Token::json(&payload)?), OK)?;
        Ok(payload.jid)
    }

    /// `None` when every given queue is empty.
    pub fn fetch<S: AsRef<str>>(&self, queues: &[S]) -> Result<Option<JobPayload>, ClientError> {
        let command = Command::new("FETCH").args(queues.iter().map(|queue| queue.as_ref()));
        match self.send(&command)?.into_text() {
            Some(body) if !body.is_empty() => Ok(Some(serde_json::from_str(&body)?)),
            _ => Ok(None),
        }
    }

    pub fn ack(&self, jid: &str) -> Result<(), ClientError> {
        self.send_with_assert(&Command::new("ACK").arg(json!({ "jid": jid })), OK)?;
        Ok(())
    }

    pub fn fail(&self, jid: &str, error: &JobError) -> Result<(), ClientError> {
        let backtrace = error.backtrace();
        let report = FailReport {
            message: error.message(),
            errtype: error.errtype(),
            backtrace: &backtrace[..backtrace.len().min(MAX_BACKTRACE_LINES)],
            jid,
        };
        self.send_with_assert(&Command::new("FAIL").arg(Token::json(&report)?), OK)?;
        Ok(())
    }

    pub fn beat(&self) -> Result<BeatResponse, ClientError> {
        let payload = match self.wid() {
            Some(wid) => json!({ "wid": wid }),
            None => json!({}),
        };
        let reply = self.send(&Command::new("BEAT").arg(payload))?;
        let response = BeatResponse::parse(reply.text().unwrap_or_default())?;
        self.logger
            .verbose(Some(LOG_CONTEXT), &format!("BEAT -> {response:?}"));
        Ok(response)
    }

    pub fn info(&self) -> Result<Value, ClientError> {
        let reply = self.send(&Command::new("INFO"))?;
        Ok(serde_json::from_str(reply.text().unwrap_or("null"))?)
    }

    pub fn flush(&self) -> Result<String, ClientError> {
        Ok(self
            .send(&Command::new("FLUSH"))?
            .into_text()
            .unwrap_or_default())
    }

    pub fn mutate(&self, request: &MutationRequest) -> Result<(), ClientError> {
        self.send_with_assert(&Command::new(MUTATE_VERB).arg(Token::json(request)?), OK)?;
        Ok(())
    }

    pub fn retries(&self) -> Mutation<'_> {
        Mutation::new(self, MutationTarget::Retries)
    }

    pub fn scheduled(&self) -> Mutation<'_> {
        Mutation::new(self, MutationTarget::Scheduled)
    }

    pub fn dead(&self) -> Mutation<'_> {
        Mutation::new(self, MutationTarget::Dead)
    }
}
