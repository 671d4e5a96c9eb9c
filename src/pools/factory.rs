use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

use serde_json::json;

use crate::logging::{LogLevel, Logger};
use crate::wire::connection::{DEFAULT_IDLE_TIMEOUT, WireConnection, WireError};
use crate::wire::handshake::Greeting;

use super::ManageConnection;

pub const BACKOFF_UNIT: Duration = Duration::from_millis(200);
pub const BACKOFF_CAP: u32 = 20;
const LOG_CONTEXT: &str = "pools::factory";

/// Runs on every freshly opened connection before it is lent out.
pub type Handshake =
    Arc<dyn Fn(&WireConnection, &Greeting) -> Result<(), WireError> + Send + Sync>;

#[derive(Clone, Debug)]
pub struct FactoryConfig {
    pub host: String,
    pub port: u16,
    pub idle_timeout: Option<Duration>,
    pub backoff_unit: Duration,
}

impl FactoryConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            backoff_unit: BACKOFF_UNIT,
        }
    }
}

/// Opens and handshakes [`WireConnection`]s for the pool.
///
/// Consecutive failures sleep `backoff_unit * min(failures, 20)` before the
/// error is returned; a success resets the counter.
pub struct ConnectionFactory {
    config: FactoryConfig,
    handshake: Handshake,
    failures: AtomicU32,
    logger: Arc<Logger>,
}

impl ConnectionFactory {
    pub fn new(config: FactoryConfig, handshake: Handshake, logger: Arc<Logger>) -> Self {
        Self {
            config,
            handshake,
            failures: AtomicU32::new(0),
            logger,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    pub fn backoff_for(&self, failures: u32) -> Duration {
        self.config.backoff_unit * failures.min(BACKOFF_CAP)
    }

    fn establish(&self, connection: &WireConnection) -> Result<(), WireError> {
        connection.set_timeout(self.config.idle_timeout)?;
        let greeting = connection.open()?;
        (self.handshake)(connection, &greeting)
    }
}

impl ManageConnection for ConnectionFactory {
    type Connection = WireConnection;
    type Error = WireError;

    fn create(&self) -> Result<WireConnection, WireError> {
        let connection = WireConnection::new(
            self.config.host.clone(),
            self.config.port,
            Arc::clone(&self.logger),
        );

        match self.establish(&connection) {
            Ok(()) => {
                self.failures.store(0, Ordering::SeqCst);
                Ok(connection)
            }
            Err(error) => {
                let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
                let backoff = self.backoff_for(failures);
                self.logger.log(
                    LogLevel::Error,
                    Some(LOG_CONTEXT),
                    "connection failed",
                    Some(json!({
                        "address": connection.address(),
                        "error": error.to_string(),
                        "attempt": failures,
                        "backoff_ms": backoff.as_millis() as u64
                    })),
                );
                connection.close();
                thread::sleep(backoff);
                Err(error)
            }
        }
    }

    fn destroy(&self, connection: WireConnection) {
        connection.detach_observers();
        connection.close();
    }

    fn validate(&self, connection: &WireConnection) -> bool {
        connection.is_open()
    }
}
