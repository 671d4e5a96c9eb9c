//! Client and worker runtime for Faktory-compatible job queue servers.
//!
//! [`Client`] pushes and manages jobs over a pooled set of wire connections;
//! [`Worker`] fetches jobs, runs them through a middleware chain and reports
//! the outcome back to the server.

pub mod chain;
pub mod client;
pub mod config;
pub mod events;
pub mod heartbeat;
pub mod job;
pub mod logging;
pub mod mutation;
pub mod pools;
pub mod signals;
pub mod utils;
pub mod wire;
pub mod worker;

#[cfg(test)]
mod testing;

pub use chain::{ExecutionChain, JobContext, JobError, JobOutcome, Middleware, Next, Registry};
pub use client::{BeatResponse, Client, ClientError, ClientOptions};
pub use config::{AppConfig, ConfigError, ServerUrl};
pub use events::{Event, EventEmitter, WorkerEvent};
pub use job::{Job, JobBuildError, JobPayload};
pub use logging::{LogLevel, Logger, LoggerConfig};
pub use mutation::Mutation;
pub use signals::{ManualSignals, OsSignals, SignalAction, SignalSource};
pub use worker::{StopOutcome, Worker, WorkerError, WorkerOptions, WorkerState};
