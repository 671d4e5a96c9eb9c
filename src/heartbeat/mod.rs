use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Value, json};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug)]
pub enum HeartbeatError {
    InvalidInterval,
    AlreadyRunning,
    Spawn(std::io::Error),
    JoinFailed,
}

impl fmt::Display for HeartbeatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInterval => write!(f, "heartbeat interval must be greater than zero"),
            Self::AlreadyRunning => write!(f, "heartbeat is already running"),
            Self::Spawn(source) => write!(f, "failed to spawn heartbeat thread: {source}"),
            Self::JoinFailed => write!(f, "heartbeat thread panicked"),
        }
    }
}

impl std::error::Error for HeartbeatError {}

/// Recurring timer on its own thread. The pulse runs every `interval` until
/// [`Heartbeat::stop`]; stopping interrupts the wait immediately.
pub struct Heartbeat {
    started_at: DateTime<Utc>,
    interval: Duration,
    pulses: Arc<AtomicU64>,
    cancel: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl Heartbeat {
    pub fn new(interval: Duration) -> Result<Self, HeartbeatError> {
        if interval.is_zero() {
            return Err(HeartbeatError::InvalidInterval);
        }

        Ok(Self {
            started_at: Utc::now(),
            interval,
            pulses: Arc::new(AtomicU64::new(0)),
            cancel: None,
            worker: None,
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn pulses(&self) -> u64 {
        self.pulses.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn start<F>(&mut self, name: &str, mut pulse: F) -> Result<(), HeartbeatError>
    where
        F: FnMut() + Send + 'static,
    {
        if self.worker.is_some() {
            return Err(HeartbeatError::AlreadyRunning);
        }

        let (cancel, cancelled) = mpsc::channel::<()>();
        let interval = self.interval;
        let pulses = Arc::clone(&self.pulses);
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                while let Err(RecvTimeoutError::Timeout) = cancelled.recv_timeout(interval) {
                    pulse();
                    pulses.fetch_add(1, Ordering::SeqCst);
                }
            })
            .map_err(HeartbeatError::Spawn)?;

        self.started_at = Utc::now();
        self.cancel = Some(cancel);
        self.worker = Some(handle);
        Ok(())
    }

    /// Cancels the timer and waits for an in-progress pulse, unless called
    /// from the pulse itself.
    pub fn stop(&mut self) -> Result<(), HeartbeatError> {
        self.cancel.take();

        let Some(handle) = self.worker.take() else {
            return Ok(());
        };
        if handle.thread().id() == thread::current().id() {
            return Ok(());
        }
        handle.join().map_err(|_| HeartbeatError::JoinFailed)
    }

    pub fn status_payload(&self) -> Value {
        json!({
            "started_at": self.started_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            "interval_ms": self.interval.as_millis() as u64,
            "pulses": self.pulses()
        })
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
