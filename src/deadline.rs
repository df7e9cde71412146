//! Invocation deadline racing.
//!
//! A Lambda invocation has a hard deadline; blowing through it loses all
//! in-memory progress and gets the whole batch redelivered with stale
//! tracking. The orchestration run is therefore raced against a fraction of
//! the remaining invocation time, leaving enough headroom to finalize.
//!
//! The work is spawned onto the runtime rather than raced in place: dropping
//! an in-place future would cancel it, but the engine's contract is that a
//! timed-out run is abandoned, not cancelled. The spawned run keeps going in
//! the background while finalization freezes the tracking state out from
//! under it, and any write it attempts afterwards surfaces as a loud defect.

use std::future::Future;
use std::time::Duration;

use crate::error::ConsumerError;

/// How a deadline race ended.
#[derive(Debug)]
pub enum RaceOutcome<T> {
    /// The work finished inside the time budget
    Completed(T),
    /// The time budget elapsed first; the work was left running, detached
    DeadlineElapsed,
}

impl<T> RaceOutcome<T> {
    /// Returns `true` when the deadline fired before the work finished.
    pub fn deadline_elapsed(&self) -> bool {
        matches!(self, RaceOutcome::DeadlineElapsed)
    }
}

/// Races `work` against `timeout_fraction` of the remaining invocation time.
///
/// On timeout the work keeps running detached; it is never cancelled. A
/// panic inside the work surfaces as an internal defect rather than
/// unwinding through the consumer.
pub async fn race_with_deadline<T, F>(
    work: F,
    remaining_time_ms: u64,
    timeout_fraction: f64,
) -> Result<RaceOutcome<T>, ConsumerError>
where
    T: Send + 'static,
    F: Future<Output = T> + Send + 'static,
{
    if !(timeout_fraction > 0.0 && timeout_fraction <= 1.0) {
        return Err(ConsumerError::configuration(format!(
            "timeout fraction must be in (0, 1], got {timeout_fraction}"
        )));
    }

    let budget = Duration::from_millis((remaining_time_ms as f64 * timeout_fraction) as u64);
    let handle = tokio::spawn(work);

    tokio::select! {
        joined = handle => match joined {
            Ok(value) => Ok(RaceOutcome::Completed(value)),
            Err(join_error) => Err(ConsumerError::internal(format!(
                "batch run aborted unexpectedly: {join_error}"
            ))),
        },
        _ = tokio::time::sleep(budget) => {
            tracing::warn!(
                budget_ms = budget.as_millis() as u64,
                remaining_time_ms,
                "time budget elapsed before the batch run finished; abandoning it in place"
            );
            Ok(RaceOutcome::DeadlineElapsed)
        }
    }
}
