use std::time::{Duration, Instant};

use serde_json::json;

use crate::logging::{LogLevel, Logger};

/// Logs how long it lived at debug level when dropped.
pub struct ScopedExecutionTimer<'a> {
    label: &'a str,
    context: Option<&'a str>,
    started_at: Instant,
    logger: &'a Logger,
}

impl<'a> ScopedExecutionTimer<'a> {
    pub fn new(label: &'a str, context: Option<&'a str>, logger: &'a Logger) -> Self {
        Self {
            label,
            context,
            started_at: Instant::now(),
            logger,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

impl Drop for ScopedExecutionTimer<'_> {
    fn drop(&mut self) {
        let elapsed = self.elapsed();
        self.logger.log(
            LogLevel::Debug,
            self.context,
            &format!("{} finished in {}", self.label, format_duration(elapsed)),
            Some(json!({ "elapsed_ms": elapsed.as_millis() as u64 })),
        );
    }
}

/// Runs `task` and returns its result with the wall time it took.
pub fn measure_execution<T, F>(
    label: &str,
    context: Option<&str>,
    logger: &Logger,
    task: F,
) -> (T, Duration)
where
    F: FnOnce() -> T,
{
    let timer = ScopedExecutionTimer::new(label, context, logger);
    let result = task();
    let elapsed = timer.elapsed();
    drop(timer);
    (result, elapsed)
}

pub fn format_duration(duration: Duration) -> String {
    let total_ms = duration.as_secs_f64() * 1000.0;
    if total_ms < 1_000.0 {
        return format!("{total_ms:.2} ms");
    }

    let total_seconds = total_ms / 1_000.0;
    if total_seconds < 60.0 {
        return format!("{total_seconds:.2} s");
    }

    let minutes = (total_seconds / 60.0).floor();
    format!("{minutes:.0}m {:.2}s", total_seconds - minutes * 60.0)
}
