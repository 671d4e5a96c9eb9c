use std::collections::HashMap;
use std::fmt;
use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::process;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use uuid::Uuid;

use crate::chain::{ExecutionChain, JobContext, JobError, JobOutcome, Middleware, Registry};
use crate::client::{BeatResponse, Client, ClientError, ClientOptions};
use crate::events::{EventEmitter, WorkerEvent};
use crate::heartbeat::{DEFAULT_INTERVAL, Heartbeat, HeartbeatError};
use crate::job::{DEFAULT_QUEUE, JobPayload};
use crate::logging::{LogLevel, Logger};
use crate::signals::{OsSignals, SignalAction, SignalSource};
use crate::utils::timing::measure_execution;
use crate::wire::handshake::WorkerIdentity;

pub const DEFAULT_CONCURRENCY: usize = 20;
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(8);
pub const DEFAULT_BEAT_INTERVAL: Duration = DEFAULT_INTERVAL;
pub const FETCH_ERROR_BACKOFF: Duration = Duration::from_secs(1);
pub const NO_MESSAGE: &str = "Job failed with no error or message given";
pub const STOPPED_BEFORE_START: &str = "Worker stopped before the job started";
const SLOT_RECHECK_INTERVAL: Duration = Duration::from_millis(100);
const SIGNAL_POLL_INTERVAL: Duration = Duration::from_millis(100);
const LOG_CONTEXT: &str = "worker";

#[derive(Clone, Debug)]
pub struct WorkerOptions {
    /// Generated when absent or empty.
    pub wid: Option<String>,
    pub labels: Vec<String>,
    pub concurrency: usize,
    /// Fetched in the given order; empty means `["default"]`.
    pub queues: Vec<String>,
    pub shutdown_timeout: Duration,
    pub beat_interval: Duration,
    /// Connection pool size; defaults to `concurrency + 2`.
    pub pool_size: Option<usize>,
    pub server: ClientOptions,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            wid: None,
            labels: Vec::new(),
            concurrency: DEFAULT_CONCURRENCY,
            queues: Vec::new(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            beat_interval: DEFAULT_BEAT_INTERVAL,
            pool_size: None,
            server: ClientOptions::default(),
        }
    }
}

pub fn generate_wid() -> String {
    Uuid::new_v4().to_string().chars().take(8).collect()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Working,
    Quieted,
    Stopping,
    Stopped,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Working => "working",
            Self::Quieted => "quieted",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StopOutcome {
    /// Every in-flight job reported back and the pool was closed.
    Drained,
    /// The shutdown timeout expired with these jobs still running.
    TimedOut { abandoned: Vec<String> },
}

/// Invoked with the abandoned jids when the shutdown timeout expires.
pub type ForcedExit = Arc<dyn Fn(&[String]) + Send + Sync>;

pub fn exit_process() -> ForcedExit {
    Arc::new(|_abandoned| process::exit(1))
}

#[derive(Debug)]
pub enum WorkerError {
    AlreadyWorking,
    Client(ClientError),
    Heartbeat(HeartbeatError),
    Signals(io::Error),
    Spawn(io::Error),
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyWorking => write!(f, "worker is already working"),
            Self::Client(source) => write!(f, "{source}"),
            Self::Heartbeat(source) => write!(f, "{source}"),
            Self::Signals(source) => write!(f, "failed to install signal handlers: {source}"),
            Self::Spawn(source) => write!(f, "failed to spawn worker thread: {source}"),
        }
    }
}

impl std::error::Error for WorkerError {}

impl From<ClientError> for WorkerError {
    fn from(value: ClientError) -> Self {
        Self::Client(value)
    }
}

impl From<HeartbeatError> for WorkerError {
    fn from(value: HeartbeatError) -> Self {
        Self::Heartbeat(value)
    }
}

struct InFlight {
    jobtype: String,
    started_at: Instant,
}

#[derive(Default)]
struct WorkingSet {
    jobs: HashMap<String, InFlight>,
    fetching: bool,
}

/// Fetches jobs from the configured queues and runs up to `concurrency` of
/// them at once, each on its own thread.
///
/// Cloning yields another handle to the same worker.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

struct WorkerInner {
    wid: String,
    queues: Vec<String>,
    concurrency: usize,
    shutdown_timeout: Duration,
    beat_interval: Duration,
    client: Client,
    events: Arc<EventEmitter>,
    logger: Arc<Logger>,
    registry: Mutex<Registry>,
    middleware: Mutex<Vec<Arc<dyn Middleware>>>,
    chain: Mutex<Option<Arc<ExecutionChain>>>,
    signals: Mutex<Arc<dyn SignalSource>>,
    forced_exit: Mutex<ForcedExit>,
    state: Mutex<WorkerState>,
    state_changed: Condvar,
    working: Mutex<WorkingSet>,
    slot_freed: Condvar,
    heartbeat: Mutex<Option<Heartbeat>>,
    fetcher: Mutex<Option<JoinHandle<()>>>,
    signal_watcher: Mutex<Option<JoinHandle<()>>>,
    outcome: Mutex<Option<StopOutcome>>,
    outcome_ready: Condvar,
}

impl Worker {
    pub fn new(options: WorkerOptions, logger: Arc<Logger>) -> Result<Self, WorkerError> {
        let wid = options
            .wid
            .filter(|wid| !wid.is_empty())
            .unwrap_or_else(generate_wid);
        let concurrency = options.concurrency.max(1);
        let queues = if options.queues.is_empty() {
            vec![DEFAULT_QUEUE.to_owned()]
        } else {
            options.queues
        };

        let mut server = options.server;
        server.identity = Some(WorkerIdentity {
            wid: wid.clone(),
            labels: options.labels,
            pid: process::id(),
        });
        server.pool.max_size = options
            .pool_size
            .filter(|size| *size > 0)
            .unwrap_or(concurrency + 2);
        let client = Client::new(server, Arc::clone(&logger))?;

        Ok(Self {
            inner: Arc::new(WorkerInner {
                wid,
                queues,
                concurrency,
                shutdown_timeout: options.shutdown_timeout,
                beat_interval: options.beat_interval,
                client,
                events: Arc::new(EventEmitter::new()),
                logger,
                registry: Mutex::new(Registry::new()),
                middleware: Mutex::new(Vec::new()),
                chain: Mutex::new(None),
                signals: Mutex::new(Arc::new(OsSignals::new())),
                forced_exit: Mutex::new(exit_process()),
                state: Mutex::new(WorkerState::Idle),
                state_changed: Condvar::new(),
                working: Mutex::new(WorkingSet::default()),
                slot_freed: Condvar::new(),
                heartbeat: Mutex::new(None),
                fetcher: Mutex::new(None),
                signal_watcher: Mutex::new(None),
                outcome: Mutex::new(None),
                outcome_ready: Condvar::new(),
            }),
        })
    }

    pub fn register<F>(&self, jobtype: impl Into<String>, job_fn: F) -> &Self
    where
        F: Fn(&[Value]) -> Result<JobOutcome, JobError> + Send + Sync + 'static,
    {
        let jobtype = jobtype.into();
        self.inner
            .logger
            .debug(Some(LOG_CONTEXT), &format!("registered {jobtype}"));
        self.inner
            .registry
            .lock()
            .expect("worker registry lock poisoned")
            .register(jobtype, job_fn);
        self
    }

    /// Replaces the whole registry.
    pub fn set_registry(&self, registry: Registry) -> &Self {
        *self
            .inner
            .registry
            .lock()
            .expect("worker registry lock poisoned") = registry;
        self
    }

    pub fn use_middleware<M>(&self, middleware: M) -> &Self
    where
        M: Middleware + 'static,
    {
        self.inner
            .middleware
            .lock()
            .expect("worker middleware lock poisoned")
            .push(Arc::new(middleware));
        self
    }

    pub fn set_signal_source(&self, signals: Arc<dyn SignalSource>) -> &Self {
        *self
            .inner
            .signals
            .lock()
            .expect("worker signals lock poisoned") = signals;
        self
    }

    /// Replaces the default `process::exit(1)` taken when shutdown times out.
    pub fn on_forced_exit<F>(&self, hook: F) -> &Self
    where
        F: Fn(&[String]) + Send + Sync + 'static,
    {
        *self
            .inner
            .forced_exit
            .lock()
            .expect("worker forced exit lock poisoned") = Arc::new(hook);
        self
    }

    pub fn events(&self) -> &Arc<EventEmitter> {
        &self.inner.events
    }

    pub fn client(&self) -> &Client {
        &self.inner.client
    }

    pub fn wid(&self) -> &str {
        &self.inner.wid
    }

    pub fn queues(&self) -> &[String] {
        &self.inner.queues
    }

    pub fn concurrency(&self) -> usize {
        self.inner.concurrency
    }

    pub fn state(&self) -> WorkerState {
        self.inner.state()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock_working().jobs.len()
    }

    pub fn in_flight_jids(&self) -> Vec<String> {
        let mut jids = self
            .inner
            .lock_working()
            .jobs
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        jids.sort();
        jids
    }

    /// Sends the first heartbeat, then starts the heartbeat timer, the signal
    /// watcher and the fetch loop. Returns once they are running.
    pub fn work(&self) -> Result<(), WorkerError> {
        {
            let mut state = self.inner.lock_state();
            if *state != WorkerState::Idle {
                return Err(WorkerError::AlreadyWorking);
            }
            *state = WorkerState::Working;
        }

        if let Err(error) = Arc::clone(&self.inner).start() {
            self.inner.teardown_background();
            self.inner.set_state(WorkerState::Idle);
            return Err(error);
        }
        Ok(())
    }

    /// Stops fetching; in-flight jobs keep running. Idempotent.
    pub fn quiet(&self) {
        self.inner.quiet();
    }

    pub fn beat(&self) -> Result<BeatResponse, ClientError> {
        self.inner.beat()
    }

    /// Quiets, cancels the heartbeat and signal handling, then waits up to the
    /// shutdown timeout for in-flight jobs. Concurrent callers all receive the
    /// outcome of the first call.
    ///
    /// A fetch still waiting on the server does not hold up the outcome; the
    /// client is closed once that fetch returns, and a job it delivers is
    /// failed back to the server unstarted.
    pub fn stop(&self) -> StopOutcome {
        self.inner.stop()
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("wid", &self.inner.wid)
            .field("queues", &self.inner.queues)
            .field("concurrency", &self.inner.concurrency)
            .field("state", &self.inner.state())
            .finish()
    }
}

/// Removes its job from the working set when dropped, whatever happened while
/// the job ran or reported.
struct WorkingSlot<'a> {
    inner: &'a WorkerInner,
    jid: String,
}

impl Drop for WorkingSlot<'_> {
    fn drop(&mut self) {
        let removed = self.inner.lock_working().jobs.remove(&self.jid);
        self.inner.slot_freed.notify_all();
        if let Some(in_flight) = removed {
            self.inner.logger.verbose(
                Some(LOG_CONTEXT),
                &format!(
                    "released slot of {} ({}) after {}ms",
                    in_flight.jobtype,
                    self.jid,
                    in_flight.started_at.elapsed().as_millis()
                ),
            );
        }
    }
}

impl WorkerInner {
    fn start(self: Arc<Self>) -> Result<(), WorkerError> {
        let middleware = self
            .middleware
            .lock()
            .expect("worker middleware lock poisoned")
            .clone();
        let registry = self
            .registry
            .lock()
            .expect("worker registry lock poisoned")
            .clone();
        *self.chain.lock().expect("worker chain lock poisoned") =
            Some(Arc::new(ExecutionChain::new(middleware, Arc::new(registry))));

        self.beat()?;

        let mut heartbeat = Heartbeat::new(self.beat_interval)?;
        let weak = Arc::downgrade(&self);
        heartbeat.start(&format!("worker-heartbeat-{}", self.wid), move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if let Err(error) = inner.beat() {
                inner.report_error(
                    "worker failed heartbeat",
                    json!({ "error": error.to_string() }),
                );
            }
        })?;
        let heartbeat_status = heartbeat.status_payload();
        *self.heartbeat.lock().expect("worker heartbeat lock poisoned") = Some(heartbeat);

        let signals = self.signal_source();
        signals.install().map_err(WorkerError::Signals)?;
        let weak = Arc::downgrade(&self);
        let watcher = thread::Builder::new()
            .name(format!("worker-signals-{}", self.wid))
            .spawn(move || watch_signals(weak, signals))
            .map_err(WorkerError::Spawn)?;
        *self
            .signal_watcher
            .lock()
            .expect("worker signal watcher lock poisoned") = Some(watcher);

        self.lock_working().fetching = true;
        let fetch_loop = Arc::clone(&self);
        let fetcher = thread::Builder::new()
            .name(format!("worker-fetch-{}", self.wid))
            .spawn(move || fetch_loop.run_fetch_loop())
            .map_err(|error| {
                self.lock_working().fetching = false;
                WorkerError::Spawn(error)
            })?;
        *self.fetcher.lock().expect("worker fetcher lock poisoned") = Some(fetcher);

        self.logger.log(
            LogLevel::Info,
            Some(LOG_CONTEXT),
            "worker started",
            Some(json!({
                "wid": self.wid,
                "concurrency": self.concurrency,
                "queues": self.queues,
                "heartbeat": heartbeat_status
            })),
        );
        Ok(())
    }

    fn run_fetch_loop(self: Arc<Self>) {
        while self.await_fetch_turn() {
            match self.client.fetch(&self.queues) {
                Ok(Some(job)) => self.dispatch(job),
                Ok(None) => {}
                Err(error) => {
                    self.report_error("fetch failed", json!({ "error": error.to_string() }));
                    self.pause(FETCH_ERROR_BACKOFF);
                }
            }
        }

        self.lock_working().fetching = false;
        self.slot_freed.notify_all();
        self.logger.debug(Some(LOG_CONTEXT), "fetch loop finished");
    }

    /// Blocks while quieted or while every slot is taken. `false` ends the loop.
    fn await_fetch_turn(&self) -> bool {
        loop {
            {
                let mut state = self.lock_state();
                while *state == WorkerState::Quieted {
                    state = self
                        .state_changed
                        .wait(state)
                        .expect("worker state lock poisoned");
                }
                if *state != WorkerState::Working {
                    return false;
                }
            }

            let working = self.lock_working();
            if working.jobs.len() < self.concurrency {
                return true;
            }
            let _ = self
                .slot_freed
                .wait_timeout(working, SLOT_RECHECK_INTERVAL)
                .expect("worker working set lock poisoned");
        }
    }

    fn pause(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        let mut state = self.lock_state();
        while matches!(*state, WorkerState::Working | WorkerState::Quieted) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }
            state = self
                .state_changed
                .wait_timeout(state, remaining)
                .expect("worker state lock poisoned")
                .0;
        }
    }

    fn dispatch(self: &Arc<Self>, job: JobPayload) {
        let jid = job.jid.clone();
        {
            // Held across the insert so a concurrent stop either sees this job
            // in the working set or stops it from being started.
            let state = self.lock_state();
            if !matches!(*state, WorkerState::Working | WorkerState::Quieted) {
                drop(state);
                self.return_unstarted(&job);
                return;
            }
            self.lock_working().jobs.insert(
                jid.clone(),
                InFlight {
                    jobtype: job.jobtype.clone(),
                    started_at: Instant::now(),
                },
            );
        }

        let inner = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("job-{jid}"))
            .spawn(move || inner.handle(job));
        if let Err(error) = spawned {
            self.lock_working().jobs.remove(&jid);
            self.slot_freed.notify_all();
            self.report_error(
                "failed to spawn job thread",
                json!({ "jid": jid, "error": error.to_string() }),
            );
        }
    }

    fn return_unstarted(&self, job: &JobPayload) {
        let error = JobError::new(STOPPED_BEFORE_START);
        match self.client.fail(&job.jid, &error) {
            Ok(()) => self.logger.log(
                LogLevel::Warn,
                Some(LOG_CONTEXT),
                "returned job fetched during shutdown",
                Some(json!({ "jid": job.jid, "jobtype": job.jobtype })),
            ),
            Err(error) => self.report_error(
                "failed to return job fetched during shutdown",
                json!({ "jid": job.jid, "error": error.to_string() }),
            ),
        }
    }

    fn handle(&self, job: JobPayload) {
        let _slot = WorkingSlot {
            inner: self,
            jid: job.jid.clone(),
        };
        let jid = job.jid.clone();
        let jobtype = job.jobtype.clone();
        let chain = self.execution_chain();

        let (result, _) = measure_execution(
            &format!("job {jobtype} ({jid})"),
            Some(LOG_CONTEXT),
            &self.logger,
            || {
                catch_unwind(AssertUnwindSafe(|| {
                    let mut ctx = JobContext::new(job);
                    chain.execute(&mut ctx)
                }))
                .unwrap_or_else(|panic| Err(JobError::from_panic(panic)))
            },
        );

        let reported = match result {
            Ok(()) => self.client.ack(&jid).map(|()| {
                self.logger.debug(Some(LOG_CONTEXT), &format!("ACK {jid}"));
            }),
            Err(error) => {
                let error = self.wrap_non_errors(error);
                self.client.fail(&jid, &error).map(|()| {
                    self.logger.debug(Some(LOG_CONTEXT), &format!("FAIL {jid}"));
                    self.emit(
                        WorkerEvent::Fail,
                        json!({
                            "jid": jid,
                            "jobtype": jobtype,
                            "message": error.message(),
                            "errtype": error.errtype()
                        }),
                    );
                })
            }
        };

        if let Err(error) = reported {
            self.report_error(
                "failed to report job outcome",
                json!({ "jid": jid, "error": error.to_string() }),
            );
        }
    }

    fn wrap_non_errors(&self, error: JobError) -> JobError {
        if error.has_message() {
            return error;
        }

        self.logger.warn(
            Some(LOG_CONTEXT),
            "job failed without providing an error message; return a JobError that describes the failure",
        );
        error.with_message(NO_MESSAGE)
    }

    fn execution_chain(&self) -> Arc<ExecutionChain> {
        if let Some(chain) = self
            .chain
            .lock()
            .expect("worker chain lock poisoned")
            .as_ref()
        {
            return Arc::clone(chain);
        }

        let registry = self
            .registry
            .lock()
            .expect("worker registry lock poisoned")
            .clone();
        Arc::new(ExecutionChain::new(Vec::new(), Arc::new(registry)))
    }

    fn beat(self: &Arc<Self>) -> Result<BeatResponse, ClientError> {
        let response = self.client.beat()?;
        match response {
            BeatResponse::Quiet => self.quiet(),
            BeatResponse::Terminate => {
                self.logger
                    .info(Some(LOG_CONTEXT), "server requested termination");
                let inner = Arc::clone(self);
                if let Err(error) = thread::Builder::new()
                    .name(format!("worker-stop-{}", self.wid))
                    .spawn(move || {
                        inner.stop();
                    })
                {
                    self.report_error(
                        "failed to spawn stop thread",
                        json!({ "error": error.to_string() }),
                    );
                }
            }
            BeatResponse::Ok | BeatResponse::Other(_) => {}
        }
        Ok(response)
    }

    fn quiet(&self) {
        let quieted = {
            let mut state = self.lock_state();
            if *state == WorkerState::Working {
                *state = WorkerState::Quieted;
                true
            } else {
                false
            }
        };

        if quieted {
            self.state_changed.notify_all();
            self.logger.info(Some(LOG_CONTEXT), "worker quieted");
            self.emit(WorkerEvent::Quiet, json!({ "wid": self.wid }));
        }
    }

    fn stop(self: &Arc<Self>) -> StopOutcome {
        {
            let mut state = self.lock_state();
            match *state {
                WorkerState::Idle => {
                    *state = WorkerState::Stopped;
                    drop(state);
                    self.state_changed.notify_all();
                    self.client.close();
                    return self.publish_outcome(StopOutcome::Drained);
                }
                WorkerState::Stopping | WorkerState::Stopped => {
                    drop(state);
                    return self.wait_for_outcome();
                }
                WorkerState::Working | WorkerState::Quieted => {
                    *state = WorkerState::Stopping;
                }
            }
        }
        self.state_changed.notify_all();
        self.logger.info(Some(LOG_CONTEXT), "stopping worker");

        let deadline = Instant::now() + self.shutdown_timeout;
        self.teardown_background();
        let outcome = self.await_drain(deadline);

        match &outcome {
            StopOutcome::Drained => {
                self.release_client(deadline);
                self.logger.info(Some(LOG_CONTEXT), "worker stopped");
            }
            StopOutcome::TimedOut { abandoned } => {
                self.logger.log(
                    LogLevel::Error,
                    Some(LOG_CONTEXT),
                    "shutdown timeout exceeded",
                    Some(json!({
                        "timeout_ms": self.shutdown_timeout.as_millis() as u64,
                        "abandoned": abandoned
                    })),
                );
            }
        }

        self.set_state(WorkerState::Stopped);
        let abandoned = match &outcome {
            StopOutcome::Drained => Vec::new(),
            StopOutcome::TimedOut { abandoned } => abandoned.clone(),
        };
        self.emit(
            WorkerEvent::Stop,
            json!({ "wid": self.wid, "forced": !abandoned.is_empty(), "abandoned": abandoned }),
        );
        let outcome = self.publish_outcome(outcome);

        if let StopOutcome::TimedOut { abandoned } = &outcome {
            let hook = self
                .forced_exit
                .lock()
                .expect("worker forced exit lock poisoned")
                .clone();
            hook(abandoned.as_slice());
        }
        outcome
    }

    /// Only running jobs count; an outstanding fetch never turns a drained
    /// worker into a timed-out one.
    fn await_drain(&self, deadline: Instant) -> StopOutcome {
        let mut working = self.lock_working();
        loop {
            if working.jobs.is_empty() {
                return StopOutcome::Drained;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                let mut abandoned = working.jobs.keys().cloned().collect::<Vec<_>>();
                abandoned.sort();
                return StopOutcome::TimedOut { abandoned };
            }
            working = self
                .slot_freed
                .wait_timeout(working, remaining)
                .expect("worker working set lock poisoned")
                .0;
        }
    }

    /// Closes the client once the fetch loop has exited. The loop gets until
    /// `deadline`; after that the close moves to a detached thread that waits
    /// for the outstanding fetch.
    fn release_client(self: &Arc<Self>, deadline: Instant) {
        let fetcher = self
            .fetcher
            .lock()
            .expect("worker fetcher lock poisoned")
            .take();
        let Some(handle) = fetcher else {
            self.client.close();
            return;
        };

        if self.await_fetch_exit(deadline) {
            let _ = handle.join();
            self.client.close();
            return;
        }

        self.logger.warn(
            Some(LOG_CONTEXT),
            "fetch still outstanding, client closes when it returns",
        );
        let inner = Arc::clone(self);
        let closer = thread::Builder::new()
            .name(format!("worker-close-{}", self.wid))
            .spawn(move || {
                let _ = handle.join();
                inner.client.close();
                inner.logger.debug(Some(LOG_CONTEXT), "client closed after last fetch");
            });
        if let Err(error) = closer {
            self.report_error(
                "failed to spawn client close thread",
                json!({ "error": error.to_string() }),
            );
        }
    }

    fn await_fetch_exit(&self, deadline: Instant) -> bool {
        let mut working = self.lock_working();
        while working.fetching {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            working = self
                .slot_freed
                .wait_timeout(working, remaining)
                .expect("worker working set lock poisoned")
                .0;
        }
        true
    }

    /// Uninstalls signal handling and cancels the heartbeat. Safe to call
    /// from the heartbeat or signal watcher threads.
    fn teardown_background(&self) {
        self.signal_source().uninstall();

        let heartbeat = self
            .heartbeat
            .lock()
            .expect("worker heartbeat lock poisoned")
            .take();
        if let Some(mut heartbeat) = heartbeat {
            if let Err(error) = heartbeat.stop() {
                self.logger
                    .warn(Some(LOG_CONTEXT), &format!("heartbeat stop failed: {error}"));
            }
        }

        let watcher = self
            .signal_watcher
            .lock()
            .expect("worker signal watcher lock poisoned")
            .take();
        if let Some(handle) = watcher {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    fn publish_outcome(&self, outcome: StopOutcome) -> StopOutcome {
        *self.outcome.lock().expect("worker outcome lock poisoned") = Some(outcome.clone());
        self.outcome_ready.notify_all();
        outcome
    }

    fn wait_for_outcome(&self) -> StopOutcome {
        let mut outcome = self.outcome.lock().expect("worker outcome lock poisoned");
        loop {
            if let Some(outcome) = outcome.as_ref() {
                return outcome.clone();
            }
            outcome = self
                .outcome_ready
                .wait(outcome)
                .expect("worker outcome lock poisoned");
        }
    }

    fn report_error(&self, message: &str, detail: Value) {
        self.logger
            .log(LogLevel::Error, Some(LOG_CONTEXT), message, Some(detail.clone()));
        self.emit(
            WorkerEvent::Error,
            json!({ "message": message, "detail": detail }),
        );
    }

    fn emit(&self, event: WorkerEvent, payload: Value) {
        if let Err(error) = self.events.emit_worker(event, payload) {
            self.logger.warn(Some(LOG_CONTEXT), &error.to_string());
        }
    }

    fn signal_source(&self) -> Arc<dyn SignalSource> {
        self.signals
            .lock()
            .expect("worker signals lock poisoned")
            .clone()
    }

    fn state(&self) -> WorkerState {
        *self.lock_state()
    }

    fn set_state(&self, next: WorkerState) {
        *self.lock_state() = next;
        self.state_changed.notify_all();
    }

    fn lock_state(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().expect("worker state lock poisoned")
    }

    fn lock_working(&self) -> MutexGuard<'_, WorkingSet> {
        self.working.lock().expect("worker working set lock poisoned")
    }
}

fn watch_signals(worker: Weak<WorkerInner>, signals: Arc<dyn SignalSource>) {
    loop {
        let Some(inner) = worker.upgrade() else {
            return;
        };
        if matches!(inner.state(), WorkerState::Stopping | WorkerState::Stopped) {
            return;
        }

        match signals.poll() {
            Some(SignalAction::Stop) => {
                inner.logger.info(Some(LOG_CONTEXT), "stop signal received");
                inner.stop();
                return;
            }
            Some(SignalAction::Quiet) => {
                inner.logger.info(Some(LOG_CONTEXT), "quiet signal received");
                inner.quiet();
            }
            None => {}
        }

        drop(inner);
        thread::sleep(SIGNAL_POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Condvar, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    use serde_json::{Value, json};

    use crate::chain::{JobContext, JobError, JobOutcome, Next};
    use crate::client::ClientOptions;
    use crate::logging::Logger;
    use crate::signals::{ManualSignals, SignalAction};
    use crate::testing::{MockServer, bulk_reply};

    use super::{
        NO_MESSAGE, STOPPED_BEFORE_START, StopOutcome, Worker, WorkerError, WorkerOptions,
        WorkerState,
    };

    const NIL: &str = "$-1\r\n";

    fn job_json(jid: &str, jobtype: &str, args: Value) -> String {
        json!({"jid": jid, "jobtype": jobtype, "args": args, "queue": "default"}).to_string()
    }

    fn serve_jobs(jobs: Vec<String>) -> MockServer {
        let queue = Arc::new(Mutex::new(VecDeque::from(jobs)));
        MockServer::builder()
            .reply("FETCH", move |_| {
                let next = queue.lock().expect("queue lock poisoned").pop_front();
                match next {
                    Some(job) => bulk_reply(&job),
                    None => {
                        thread::sleep(Duration::from_millis(20));
                        NIL.to_owned()
                    }
                }
            })
            .spawn()
    }

    fn options_for(server: &MockServer) -> WorkerOptions {
        WorkerOptions {
            concurrency: 2,
            shutdown_timeout: Duration::from_secs(2),
            beat_interval: Duration::from_secs(60),
            server: ClientOptions::for_address("127.0.0.1", server.port()),
            ..WorkerOptions::default()
        }
    }

    fn worker_with(options: WorkerOptions) -> (Worker, Arc<ManualSignals>) {
        let worker = Worker::new(options, Logger::disabled()).expect("worker should build");
        let signals = Arc::new(ManualSignals::new());
        worker.set_signal_source(signals.clone());
        worker.on_forced_exit(|_abandoned| {});
        (worker, signals)
    }

    fn eventually(timeout: Duration, check: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        check()
    }

    /// Blocks job threads until opened.
    #[derive(Default)]
    struct Gate {
        open: Mutex<bool>,
        changed: Condvar,
    }

    impl Gate {
        fn wait(&self) {
            let mut open = self.open.lock().expect("gate lock poisoned");
            while !*open {
                open = self.changed.wait(open).expect("gate lock poisoned");
            }
        }

        fn open(&self) {
            *self.open.lock().expect("gate lock poisoned") = true;
            self.changed.notify_all();
        }
    }

    #[test]
    fn defaults_follow_worker_conventions() {
        let server = MockServer::start();
        let worker = Worker::new(
            WorkerOptions {
                server: ClientOptions::for_address("127.0.0.1", server.port()),
                ..WorkerOptions::default()
            },
            Logger::disabled(),
        )
        .expect("worker should build");

        assert_eq!(worker.wid().len(), 8);
        assert_eq!(worker.queues(), ["default".to_owned()]);
        assert_eq!(worker.concurrency(), 20);
        assert_eq!(worker.client().pool_status().max_size, 22);
        assert_eq!(worker.client().wid(), Some(worker.wid()));
        assert_eq!(worker.state(), WorkerState::Idle);
    }

    #[test]
    fn work_twice_is_rejected() {
        let server = serve_jobs(vec![]);
        let (worker, signals) = worker_with(options_for(&server));

        worker.work().expect("first work should start");
        assert!(matches!(worker.work(), Err(WorkerError::AlreadyWorking)));
        assert!(signals.is_installed());

        assert_eq!(worker.stop(), StopOutcome::Drained);
        assert!(!signals.is_installed());
    }

    #[test]
    fn failed_initial_heartbeat_leaves_worker_idle() {
        let server = MockServer::builder()
            .reply("BEAT", |_| "-ERR unknown worker\r\n".to_owned())
            .spawn();
        let (worker, signals) = worker_with(options_for(&server));

        assert!(matches!(worker.work(), Err(WorkerError::Client(_))));
        assert_eq!(worker.state(), WorkerState::Idle);
        assert!(!signals.is_installed());
    }

    #[test]
    fn hello_and_beat_carry_worker_identity() {
        let server = serve_jobs(vec![]);
        let mut options = options_for(&server);
        options.wid = Some("wid-1234".to_owned());
        options.labels = vec!["blue".to_owned()];
        let (worker, _signals) = worker_with(options);

        worker.work().expect("work should start");
        worker.stop();

        let hello = server.commands("HELLO")[0].json();
        assert_eq!(hello["wid"], json!("wid-1234"));
        assert_eq!(hello["labels"], json!(["blue"]));
        assert_eq!(hello["pid"], json!(std::process::id()));
        assert_eq!(server.commands("BEAT")[0].json(), json!({"wid":"wid-1234"}));
    }

    #[test]
    fn successful_job_is_acked() {
        let server = serve_jobs(vec![job_json("jid-ok", "Ping", json!([1, "a"]))]);
        let (worker, _signals) = worker_with(options_for(&server));
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            worker.register("Ping", move |args| {
                seen.lock().expect("seen lock poisoned").extend_from_slice(args);
                Ok(JobOutcome::Done)
            });
        }

        worker.work().expect("work should start");
        assert!(server.wait_for_command("ACK", Duration::from_secs(2)));
        assert_eq!(worker.stop(), StopOutcome::Drained);

        assert_eq!(server.commands("ACK")[0].json(), json!({"jid":"jid-ok"}));
        assert!(server.commands("FAIL").is_empty());
        assert_eq!(*seen.lock().expect("seen lock poisoned"), vec![json!(1), json!("a")]);
        assert!(server.wait_for_command("END", Duration::from_secs(1)));
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    fn with_tenant(ctx: &mut JobContext, next: Next<'_>) -> Result<(), JobError> {
        ctx.insert("tenant", json!("acme"));
        next.run(ctx)
    }

    #[test]
    fn middleware_runs_around_worker_jobs() {
        let server = serve_jobs(vec![job_json("jid-mw", "NeedsTenant", json!([]))]);
        let (worker, _signals) = worker_with(options_for(&server));
        worker
            .use_middleware(with_tenant)
            .register("NeedsTenant", |_args| {
                Ok(JobOutcome::Thunk(Box::new(|ctx: &mut JobContext| {
                    match ctx.get("tenant") {
                        Some(_) => Ok(()),
                        None => Err(JobError::new("tenant missing")),
                    }
                })))
            });

        worker.work().expect("work should start");
        assert!(server.wait_for_command("ACK", Duration::from_secs(2)));
        worker.stop();
    }

    #[test]
    fn failing_job_is_reported_and_emitted() {
        let server = serve_jobs(vec![job_json("jid-bad", "Explode", json!([]))]);
        let (worker, _signals) = worker_with(options_for(&server));
        worker.register("Explode", |_args| {
            Err(JobError::new("database unavailable")
                .with_code("DbError")
                .with_backtrace(["at explode", "at run"]))
        });
        let failures = Arc::new(Mutex::new(Vec::new()));
        {
            let failures = Arc::clone(&failures);
            worker.events().on("worker.fail", move |event| {
                failures
                    .lock()
                    .expect("failures lock poisoned")
                    .push(event.payload.clone());
                Ok(())
            });
        }

        worker.work().expect("work should start");
        assert!(server.wait_for_command("FAIL", Duration::from_secs(2)));
        worker.stop();

        let failed = server.commands("FAIL")[0].json();
        assert_eq!(failed["jid"], json!("jid-bad"));
        assert_eq!(failed["message"], json!("database unavailable"));
        assert_eq!(failed["errtype"], json!("DbError"));
        assert_eq!(failed["backtrace"], json!(["at explode", "at run"]));
        assert!(server.commands("ACK").is_empty());

        let failures = failures.lock().expect("failures lock poisoned");
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].as_ref().map(|p| p["jid"].clone()), Some(json!("jid-bad")));
    }

    #[test]
    fn panicking_job_is_failed_not_fatal() {
        let server = serve_jobs(vec![
            job_json("jid-panic", "Panics", json!([])),
            job_json("jid-after", "Fine", json!([])),
        ]);
        let (worker, _signals) = worker_with(options_for(&server));
        worker
            .register("Panics", |_args| panic!("kaboom"))
            .register("Fine", |_args| Ok(JobOutcome::Done));

        worker.work().expect("work should start");
        assert!(server.wait_for_command("FAIL", Duration::from_secs(2)));
        assert!(server.wait_for_command("ACK", Duration::from_secs(2)));
        worker.stop();

        let failed = server.commands("FAIL")[0].json();
        assert_eq!(failed["jid"], json!("jid-panic"));
        assert_eq!(failed["message"], json!("kaboom"));
        assert_eq!(failed["errtype"], json!("Panic"));
    }

    #[test]
    fn failure_without_message_is_wrapped() {
        let server = serve_jobs(vec![job_json("jid-empty", "Silent", json!([]))]);
        let (worker, _signals) = worker_with(options_for(&server));
        worker.register("Silent", |_args| Err(JobError::new("")));

        worker.work().expect("work should start");
        assert!(server.wait_for_command("FAIL", Duration::from_secs(2)));
        worker.stop();

        assert_eq!(server.commands("FAIL").len(), 1);
        assert_eq!(server.commands("FAIL")[0].json()["message"], json!(NO_MESSAGE));
    }

    #[test]
    fn unregistered_jobtype_is_failed() {
        let server = serve_jobs(vec![job_json("jid-nope", "Nope", json!([]))]);
        let (worker, _signals) = worker_with(options_for(&server));

        worker.work().expect("work should start");
        assert!(server.wait_for_command("FAIL", Duration::from_secs(2)));
        worker.stop();

        let failed = server.commands("FAIL")[0].json();
        assert_eq!(failed["message"], json!("No jobtype registered: Nope"));
        assert_eq!(failed["errtype"], json!("UnregisteredJobtype"));
    }

    #[test]
    fn concurrency_bounds_in_flight_jobs() {
        let jobs = (0..5)
            .map(|n| job_json(&format!("jid-{n}"), "Blocking", json!([])))
            .collect();
        let server = serve_jobs(jobs);
        let (worker, _signals) = worker_with(options_for(&server));
        let gate = Arc::new(Gate::default());
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        {
            let gate = Arc::clone(&gate);
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            worker.register("Blocking", move |_args| {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                gate.wait();
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(JobOutcome::Done)
            });
        }

        worker.work().expect("work should start");
        assert!(eventually(Duration::from_secs(2), || worker.in_flight() == 2));
        thread::sleep(Duration::from_millis(150));
        assert_eq!(server.commands("FETCH").len(), 2);
        assert_eq!(worker.in_flight(), 2);

        gate.open();
        assert!(server.wait_for_count("ACK", 5, Duration::from_secs(3)));
        assert_eq!(worker.stop(), StopOutcome::Drained);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn quiet_heartbeat_stops_fetching_but_finishes_work() {
        let beats = Arc::new(AtomicUsize::new(0));
        let server = {
            let beats = Arc::clone(&beats);
            let fetched = Arc::new(AtomicUsize::new(0));
            MockServer::builder()
                .reply("BEAT", move |_| {
                    if beats.fetch_add(1, Ordering::SeqCst) < 2 {
                        "+OK\r\n".to_owned()
                    } else {
                        bulk_reply(r#"{"state":"quiet"}"#)
                    }
                })
                .reply("FETCH", move |_| {
                    if fetched.fetch_add(1, Ordering::SeqCst) == 0 {
                        bulk_reply(&job_json("jid-slow", "Slow", json!([])))
                    } else {
                        thread::sleep(Duration::from_millis(20));
                        NIL.to_owned()
                    }
                })
                .spawn()
        };
        let mut options = options_for(&server);
        options.beat_interval = Duration::from_millis(50);
        let (worker, _signals) = worker_with(options);
        worker.register("Slow", |_args| {
            thread::sleep(Duration::from_millis(400));
            Ok(JobOutcome::Done)
        });

        worker.work().expect("work should start");
        assert!(eventually(Duration::from_secs(2), || {
            worker.state() == WorkerState::Quieted
        }));
        thread::sleep(Duration::from_millis(50));
        let fetches = server.commands("FETCH").len();
        thread::sleep(Duration::from_millis(200));
        assert_eq!(server.commands("FETCH").len(), fetches);

        assert!(server.wait_for_command("ACK", Duration::from_secs(2)));
        assert_eq!(server.commands("ACK")[0].json(), json!({"jid":"jid-slow"}));
        assert_eq!(worker.stop(), StopOutcome::Drained);
    }

    #[test]
    fn terminate_heartbeat_stops_worker() {
        let beats = Arc::new(AtomicUsize::new(0));
        let server = {
            let beats = Arc::clone(&beats);
            MockServer::builder()
                .reply("BEAT", move |_| {
                    if beats.fetch_add(1, Ordering::SeqCst) == 0 {
                        "+OK\r\n".to_owned()
                    } else {
                        bulk_reply(r#"{"state":"terminate"}"#)
                    }
                })
                .reply("FETCH", |_| {
                    thread::sleep(Duration::from_millis(20));
                    NIL.to_owned()
                })
                .spawn()
        };
        let mut options = options_for(&server);
        options.beat_interval = Duration::from_millis(50);
        let (worker, _signals) = worker_with(options);

        worker.work().expect("work should start");

        assert!(eventually(Duration::from_secs(3), || {
            worker.state() == WorkerState::Stopped
        }));
        assert!(server.wait_for_command("END", Duration::from_secs(1)));
    }

    #[test]
    fn stop_waits_for_in_flight_jobs() {
        let server = serve_jobs(vec![job_json("jid-wait", "Slow", json!([]))]);
        let (worker, _signals) = worker_with(options_for(&server));
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let started_tx = Mutex::new(started_tx);
        worker.register("Slow", move |_args| {
            let _ = started_tx.lock().expect("sender lock poisoned").send(());
            thread::sleep(Duration::from_millis(200));
            Ok(JobOutcome::Done)
        });

        worker.work().expect("work should start");
        started_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("job should start");

        assert_eq!(worker.stop(), StopOutcome::Drained);
        assert_eq!(server.commands("ACK").len(), 1);
        assert_eq!(worker.in_flight(), 0);
        assert!(server.wait_for_command("END", Duration::from_secs(1)));
    }

    #[test]
    fn stop_timeout_invokes_forced_exit_once() {
        let server = serve_jobs(vec![job_json("jid-stuck", "Stuck", json!([]))]);
        let mut options = options_for(&server);
        options.shutdown_timeout = Duration::from_millis(150);
        let (worker, _signals) = worker_with(options);
        let gate = Arc::new(Gate::default());
        {
            let gate = Arc::clone(&gate);
            worker.register("Stuck", move |_args| {
                gate.wait();
                Ok(JobOutcome::Done)
            });
        }
        let forced = Arc::new(Mutex::new(Vec::new()));
        {
            let forced = Arc::clone(&forced);
            worker.on_forced_exit(move |abandoned| {
                forced
                    .lock()
                    .expect("forced lock poisoned")
                    .push(abandoned.to_vec());
            });
        }

        worker.work().expect("work should start");
        assert!(eventually(Duration::from_secs(2), || worker.in_flight() == 1));

        let handles = (0..2)
            .map(|_| {
                let worker = worker.clone();
                thread::spawn(move || worker.stop())
            })
            .collect::<Vec<_>>();
        let outcomes = handles
            .into_iter()
            .map(|handle| handle.join().expect("stop should not panic"))
            .collect::<Vec<_>>();

        let expected = StopOutcome::TimedOut {
            abandoned: vec!["jid-stuck".to_owned()],
        };
        assert_eq!(outcomes, vec![expected.clone(), expected]);
        assert_eq!(
            *forced.lock().expect("forced lock poisoned"),
            vec![vec!["jid-stuck".to_owned()]]
        );
        assert_eq!(worker.state(), WorkerState::Stopped);
        gate.open();
    }

    #[test]
    fn outstanding_fetch_does_not_force_exit() {
        let server = MockServer::builder()
            .reply("FETCH", |_| {
                thread::sleep(Duration::from_millis(600));
                NIL.to_owned()
            })
            .spawn();
        let mut options = options_for(&server);
        options.shutdown_timeout = Duration::from_millis(200);
        let (worker, _signals) = worker_with(options);
        let forced = Arc::new(AtomicUsize::new(0));
        {
            let forced = Arc::clone(&forced);
            worker.on_forced_exit(move |_abandoned| {
                forced.fetch_add(1, Ordering::SeqCst);
            });
        }

        worker.work().expect("work should start");
        assert!(server.wait_for_command("FETCH", Duration::from_secs(1)));
        thread::sleep(Duration::from_millis(100));

        let started = Instant::now();
        assert_eq!(worker.stop(), StopOutcome::Drained);
        assert!(started.elapsed() < Duration::from_millis(450));
        assert_eq!(forced.load(Ordering::SeqCst), 0);
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert!(server.wait_for_command("END", Duration::from_secs(2)));
    }

    #[test]
    fn job_fetched_during_stop_is_failed_unstarted() {
        let fetches = Arc::new(AtomicUsize::new(0));
        let server = {
            let fetches = Arc::clone(&fetches);
            MockServer::builder()
                .reply("FETCH", move |_| {
                    if fetches.fetch_add(1, Ordering::SeqCst) > 0 {
                        return NIL.to_owned();
                    }
                    thread::sleep(Duration::from_millis(300));
                    bulk_reply(&job_json("jid-late", "Late", json!([])))
                })
                .spawn()
        };
        let (worker, _signals) = worker_with(options_for(&server));
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let ran = Arc::clone(&ran);
            worker.register("Late", move |_args| {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(JobOutcome::Done)
            });
        }

        worker.work().expect("work should start");
        assert!(server.wait_for_command("FETCH", Duration::from_secs(1)));

        assert_eq!(worker.stop(), StopOutcome::Drained);
        let failures = server.commands("FAIL");
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].json()["jid"], "jid-late");
        assert_eq!(failures[0].json()["message"], STOPPED_BEFORE_START);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(server.commands("ACK").is_empty());
        assert!(server.wait_for_command("END", Duration::from_secs(1)));
    }

    #[test]
    fn signals_quiet_and_stop_the_worker() {
        let server = serve_jobs(vec![]);
        let (worker, signals) = worker_with(options_for(&server));

        worker.work().expect("work should start");
        signals.raise(SignalAction::Quiet);
        assert!(eventually(Duration::from_secs(2), || {
            worker.state() == WorkerState::Quieted
        }));

        signals.raise(SignalAction::Stop);
        assert!(eventually(Duration::from_secs(3), || {
            worker.state() == WorkerState::Stopped
        }));
        assert!(!signals.is_installed());
        assert_eq!(signals.install_count(), 1);
    }

    #[test]
    fn fetch_errors_are_emitted_and_loop_continues() {
        let fetched = Arc::new(AtomicUsize::new(0));
        let server = {
            let fetched = Arc::clone(&fetched);
            MockServer::builder()
                .reply("FETCH", move |_| match fetched.fetch_add(1, Ordering::SeqCst) {
                    0 => "-ERR queue backend unavailable\r\n".to_owned(),
                    1 => bulk_reply(&job_json("jid-retry", "Ping", json!([]))),
                    _ => {
                        thread::sleep(Duration::from_millis(20));
                        NIL.to_owned()
                    }
                })
                .spawn()
        };
        let (worker, _signals) = worker_with(options_for(&server));
        worker.register("Ping", |_args| Ok(JobOutcome::Done));
        let errors = Arc::new(AtomicUsize::new(0));
        {
            let errors = Arc::clone(&errors);
            worker.events().on("worker.error", move |_event| {
                errors.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        worker.work().expect("work should start");
        assert!(server.wait_for_command("ACK", Duration::from_secs(4)));
        worker.stop();

        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_before_work_closes_client() {
        let server = MockServer::start();
        let (worker, _signals) = worker_with(options_for(&server));

        assert_eq!(worker.stop(), StopOutcome::Drained);
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert!(matches!(worker.work(), Err(WorkerError::AlreadyWorking)));
    }
}
