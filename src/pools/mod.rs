mod factory;

use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde_json::json;

use crate::logging::{LogLevel, Logger};

pub use factory::{
    BACKOFF_CAP, BACKOFF_UNIT, ConnectionFactory, FactoryConfig, Handshake,
};

pub const DEFAULT_MAX_SIZE: usize = 20;
pub const DEFAULT_MIN_IDLE: usize = 1;
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_millis(5_000);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(10_000);
const LOG_CONTEXT: &str = "pools";

/// Creates, validates and tears down the resources held by a [`Pool`].
pub trait ManageConnection: Send + Sync + 'static {
    type Connection: Send + 'static;
    type Error: std::error::Error + Send + 'static;

    fn create(&self) -> Result<Self::Connection, Self::Error>;
    fn destroy(&self, connection: Self::Connection);
    fn validate(&self, connection: &Self::Connection) -> bool;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_size: usize,
    pub min_idle: usize,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_SIZE,
            min_idle: DEFAULT_MIN_IDLE,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum PoolError {
    Timeout {
        waited: Duration,
        last_error: Option<String>,
    },
    Closed,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { waited, last_error } => {
                write!(
                    f,
                    "no connection available after {}ms",
                    waited.as_millis()
                )?;
                if let Some(last_error) = last_error {
                    write!(f, " (last create error: {last_error})")?;
                }
                Ok(())
            }
            Self::Closed => write!(f, "connection pool is closed"),
        }
    }
}

impl std::error::Error for PoolError {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStatus {
    pub idle: usize,
    pub borrowed: usize,
    pub max_size: usize,
    pub closed: bool,
}

struct IdleConnection<C> {
    connection: C,
    idle_since: Instant,
}

struct PoolState<C> {
    idle: VecDeque<IdleConnection<C>>,
    /// Idle, borrowed and in-creation connections.
    total: usize,
    closed: bool,
}

pub struct Pool<M: ManageConnection> {
    manager: M,
    config: PoolConfig,
    state: Mutex<PoolState<M::Connection>>,
    changed: Condvar,
    logger: Arc<Logger>,
}

impl<M: ManageConnection> Pool<M> {
    pub fn new(manager: M, config: PoolConfig, logger: Arc<Logger>) -> Self {
        let config = PoolConfig {
            max_size: config.max_size.max(1),
            min_idle: config.min_idle.min(config.max_size.max(1)),
            ..config
        };

        Self {
            manager,
            config,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                total: 0,
                closed: false,
            }),
            changed: Condvar::new(),
            logger,
        }
    }

    pub fn config(&self) -> PoolConfig {
        self.config
    }

    pub fn manager(&self) -> &M {
        &self.manager
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.lock();
        PoolStatus {
            idle: state.idle.len(),
            borrowed: state.total - state.idle.len(),
            max_size: self.config.max_size,
            closed: state.closed,
        }
    }

    /// Borrows a validated connection, creating one when the pool has room.
    /// Failed creations are retried until the acquire timeout elapses.
    pub fn get(&self) -> Result<PooledConnection<'_, M>, PoolError> {
        let started = Instant::now();
        let deadline = started + self.config.acquire_timeout;
        let mut last_error: Option<String> = None;

        loop {
            let mut state = self.lock();
            if state.closed {
                return Err(PoolError::Closed);
            }

            let evicted = self.take_expired(&mut state);
            if let Some(idle) = state.idle.pop_back() {
                drop(state);
                self.destroy_all(evicted);

                if self.manager.validate(&idle.connection) {
                    return Ok(PooledConnection {
                        pool: self,
                        connection: Some(idle.connection),
                    });
                }

                self.logger
                    .debug(Some(LOG_CONTEXT), "discarding stale idle connection");
                self.release_slot(idle.connection);
                continue;
            }

            if state.total < self.config.max_size {
                state.total += 1;
                drop(state);
                self.destroy_all(evicted);

                match self.manager.create() {
                    Ok(connection) => {
                        return Ok(PooledConnection {
                            pool: self,
                            connection: Some(connection),
                        });
                    }
                    Err(error) => {
                        self.logger.log(
                            LogLevel::Warn,
                            Some(LOG_CONTEXT),
                            "connection create failed",
                            Some(json!({ "error": error.to_string() })),
                        );
                        last_error = Some(error.to_string());
                        let mut state = self.lock();
                        state.total -= 1;
                        drop(state);
                        self.changed.notify_one();
                    }
                }

                if Instant::now() >= deadline {
                    return Err(PoolError::Timeout {
                        waited: started.elapsed(),
                        last_error,
                    });
                }
                continue;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(PoolError::Timeout {
                    waited: started.elapsed(),
                    last_error,
                });
            }
            let (state, _) = self
                .changed
                .wait_timeout(state, remaining)
                .expect("connection pool lock poisoned");
            drop(state);
            self.destroy_all(evicted);
        }
    }

    /// Stops lending, waits for every borrowed connection to come back and
    /// destroys all of them. Later borrows fail with [`PoolError::Closed`].
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        while state.total > state.idle.len() {
            state = self
                .changed
                .wait(state)
                .expect("connection pool lock poisoned");
        }

        let drained = state.idle.drain(..).collect::<Vec<_>>();
        state.total -= drained.len();
        drop(state);

        let count = drained.len();
        self.destroy_all(drained);
        self.logger.debug(
            Some(LOG_CONTEXT),
            &format!("pool drained, {count} connection(s) destroyed"),
        );
    }

    fn give_back(&self, connection: M::Connection) {
        let mut state = self.lock();
        if state.closed || !self.manager.validate(&connection) {
            drop(state);
            self.release_slot(connection);
            return;
        }

        state.idle.push_back(IdleConnection {
            connection,
            idle_since: Instant::now(),
        });
        let evicted = self.take_expired(&mut state);
        drop(state);
        self.changed.notify_all();
        self.destroy_all(evicted);
    }

    fn release_slot(&self, connection: M::Connection) {
        self.manager.destroy(connection);
        let mut state = self.lock();
        state.total -= 1;
        drop(state);
        self.changed.notify_all();
    }

    /// Runs on every borrow and return; a pool nobody touches keeps its idle
    /// connections until the next call.
    fn take_expired(
        &self,
        state: &mut PoolState<M::Connection>,
    ) -> Vec<IdleConnection<M::Connection>> {
        let mut expired = Vec::new();
        while state.total > self.config.min_idle {
            let is_expired = state
                .idle
                .front()
                .is_some_and(|idle| idle.idle_since.elapsed() >= self.config.idle_timeout);
            if !is_expired {
                break;
            }
            if let Some(idle) = state.idle.pop_front() {
                state.total -= 1;
                expired.push(idle);
            }
        }
        expired
    }

    fn destroy_all(&self, connections: Vec<IdleConnection<M::Connection>>) {
        for idle in connections {
            self.manager.destroy(idle.connection);
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<M::Connection>> {
        self.state.lock().expect("connection pool lock poisoned")
    }
}

/// Exclusive loan of one pooled connection; returned to the pool on drop.
pub struct PooledConnection<'a, M: ManageConnection> {
    pool: &'a Pool<M>,
    connection: Option<M::Connection>,
}

impl<M: ManageConnection> Deref for PooledConnection<'_, M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        self.connection
            .as_ref()
            .expect("pooled connection is present until drop")
    }
}

impl<M: ManageConnection> Drop for PooledConnection<'_, M> {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.pool.give_back(connection);
        }
    }
}
