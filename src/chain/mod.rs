use std::any::Any;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::job::JobPayload;

pub const UNREGISTERED_JOBTYPE_CODE: &str = "UnregisteredJobtype";
pub const PANIC_CODE: &str = "Panic";
pub const DEFAULT_ERRTYPE: &str = "Error";

/// Failure of a single job execution, reported to the server with `FAIL`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JobError {
    message: String,
    code: Option<String>,
    backtrace: Vec<String>,
}

impl JobError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            backtrace: Vec::new(),
        }
    }

    pub fn unregistered(jobtype: &str) -> Self {
        Self::new(format!("No jobtype registered: {jobtype}")).with_code(UNREGISTERED_JOBTYPE_CODE)
    }

    /// Builds a failure from any error; the `source()` chain becomes the
    /// backtrace.
    pub fn from_error(error: &(dyn Error + 'static)) -> Self {
        let mut backtrace = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            backtrace.push(format!("caused by: {cause}"));
            source = cause.source();
        }

        Self {
            message: error.to_string(),
            code: None,
            backtrace,
        }
    }

    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(text) = payload.downcast_ref::<&str>() {
            (*text).to_owned()
        } else if let Some(text) = payload.downcast_ref::<String>() {
            text.clone()
        } else {
            String::new()
        };

        Self::new(message).with_code(PANIC_CODE)
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_backtrace<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.backtrace = lines.into_iter().map(Into::into).collect();
        self
    }

    pub(crate) fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    pub fn errtype(&self) -> &str {
        self.code().unwrap_or(DEFAULT_ERRTYPE)
    }

    pub fn backtrace(&self) -> &[String] {
        &self.backtrace
    }

    pub fn has_message(&self) -> bool {
        !self.message.trim().is_empty()
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{code}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl Error for JobError {}

impl From<String> for JobError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for JobError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Second-stage work returned by a job function; invoked once with the
/// execution context.
pub type Thunk = Box<dyn FnOnce(&mut JobContext) -> Result<(), JobError> + Send>;

pub enum JobOutcome {
    Done,
    Thunk(Thunk),
}

impl fmt::Debug for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Done => f.write_str("Done"),
            Self::Thunk(_) => f.write_str("Thunk(..)"),
        }
    }
}

impl From<()> for JobOutcome {
    fn from(_: ()) -> Self {
        Self::Done
    }
}

pub type JobFn = Arc<dyn Fn(&[Value]) -> Result<JobOutcome, JobError> + Send + Sync>;

/// Jobtype to job function lookup.
#[derive(Clone, Default)]
pub struct Registry {
    jobs: HashMap<String, JobFn>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, jobtype: impl Into<String>, job_fn: F) -> &mut Self
    where
        F: Fn(&[Value]) -> Result<JobOutcome, JobError> + Send + Sync + 'static,
    {
        self.jobs.insert(jobtype.into(), Arc::new(job_fn));
        self
    }

    pub fn get(&self, jobtype: &str) -> Option<JobFn> {
        self.jobs.get(jobtype).cloned()
    }

    pub fn contains(&self, jobtype: &str) -> bool {
        self.jobs.contains_key(jobtype)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn jobtypes(&self) -> Vec<String> {
        let mut names = self.jobs.keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("jobtypes", &self.jobtypes())
            .finish()
    }
}

/// Mutable state threaded through every stage of one execution.
pub struct JobContext {
    pub job: JobPayload,
    job_fn: Option<JobFn>,
    values: HashMap<String, Value>,
}

impl JobContext {
    pub fn new(job: JobPayload) -> Self {
        Self {
            job,
            job_fn: None,
            values: HashMap::new(),
        }
    }

    pub fn job_fn(&self) -> Option<&JobFn> {
        self.job_fn.as_ref()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.values.insert(key.into(), value)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }
}

pub trait Middleware: Send + Sync {
    /// Work before `next.run(ctx)` happens on the way in; work after it on the
    /// way out.
    fn call(&self, ctx: &mut JobContext, next: Next<'_>) -> Result<(), JobError>;
}

impl<F> Middleware for F
where
    F: Fn(&mut JobContext, Next<'_>) -> Result<(), JobError> + Send + Sync,
{
    fn call(&self, ctx: &mut JobContext, next: Next<'_>) -> Result<(), JobError> {
        self(ctx, next)
    }
}

/// Continuation into the remaining stages of the chain.
pub struct Next<'a> {
    rest: &'a [Arc<dyn Middleware>],
}

impl Next<'_> {
    pub fn run(self, ctx: &mut JobContext) -> Result<(), JobError> {
        match self.rest.split_first() {
            Some((stage, rest)) => stage.call(ctx, Next { rest }),
            None => Ok(()),
        }
    }
}

struct RegistryLookup {
    registry: Arc<Registry>,
}

impl Middleware for RegistryLookup {
    fn call(&self, ctx: &mut JobContext, next: Next<'_>) -> Result<(), JobError> {
        ctx.job_fn = self.registry.get(&ctx.job.jobtype);
        next.run(ctx)
    }
}

struct InvokeJobFn;

impl Middleware for InvokeJobFn {
    fn call(&self, ctx: &mut JobContext, next: Next<'_>) -> Result<(), JobError> {
        let Some(job_fn) = ctx.job_fn.clone() else {
            return Err(JobError::unregistered(&ctx.job.jobtype));
        };

        match job_fn(&ctx.job.args)? {
            JobOutcome::Done => {}
            JobOutcome::Thunk(thunk) => thunk(ctx)?,
        }
        next.run(ctx)
    }
}

/// User middleware in registration order followed by registry lookup and
/// job function invocation.
pub struct ExecutionChain {
    stages: Vec<Arc<dyn Middleware>>,
}

impl ExecutionChain {
    pub fn new(middleware: Vec<Arc<dyn Middleware>>, registry: Arc<Registry>) -> Self {
        let mut stages = middleware;
        stages.push(Arc::new(RegistryLookup { registry }));
        stages.push(Arc::new(InvokeJobFn));
        Self { stages }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn execute(&self, ctx: &mut JobContext) -> Result<(), JobError> {
        Next {
            rest: &self.stages,
        }
        .run(ctx)
    }
}
