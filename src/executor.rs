//! The task executor: runs one task (and recursively its sub-tasks) against
//! its target, updating tracking state from the execute function's outcome.
//!
//! The executor is the only writer of tracking state during a batch run.
//! Terminal instances are skipped without re-running their execute function,
//! which is what makes redelivered batches idempotent: only genuinely
//! incomplete work is ever retried. Task failures never propagate as errors
//! from here; they become tracking transitions, so one bad task can never
//! sink the batch. The only errors this module returns are orchestration
//! defects (unknown tracking paths, writes after freeze, poisoned locks).

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::config::ConsumerContext;
use crate::error::{ConsumerError, ErrorInfo};
use crate::task::{TaskDef, TaskError, TaskHandle, TaskTarget};
use crate::tracking::{self, SharedTracking, TaskState};

/// Runs `def` (and its sub-tasks) against `target`, recording outcomes in
/// `tracking`.
///
/// Returns the task's state after this round. Only orchestration defects are
/// returned as errors.
pub async fn execute_task(
    target: TaskTarget,
    def: Arc<TaskDef>,
    tracking: SharedTracking,
    ctx: Arc<ConsumerContext>,
) -> Result<TaskState, ConsumerError> {
    execute_at_path(target, def, tracking, Vec::new(), ctx).await
}

enum Attempt {
    /// The instance is already terminal; its execute function is skipped
    Skip(TaskState),
    /// A fresh attempt was started
    Run(TaskHandle),
}

fn execute_at_path(
    target: TaskTarget,
    def: Arc<TaskDef>,
    tracking: SharedTracking,
    path: Vec<String>,
    ctx: Arc<ConsumerContext>,
) -> BoxFuture<'static, Result<TaskState, ConsumerError>> {
    Box::pin(async move {
        let mut full_path = path;
        full_path.push(def.name().to_string());

        // Begin the attempt (or skip) under the lock, then release it
        // before awaiting user code.
        let attempt = {
            let mut guard = tracking::lock(&tracking)?;
            guard.ensure_mutable("starting a task attempt")?;
            let instance = guard.instance_mut(&full_path).ok_or_else(|| {
                ConsumerError::internal(format!(
                    "no tracking instance at path {full_path:?}; task definitions and tracking are out of sync"
                ))
            })?;

            if instance.state.is_terminal() {
                tracing::debug!(task = %def.name(), state = %instance.state, "skipping terminal task");
                Attempt::Skip(instance.state)
            } else {
                instance.state = TaskState::Started;
                instance.attempts += 1;
                Attempt::Run(TaskHandle::new(
                    def.name().clone(),
                    instance.attempts,
                    instance.sub_tasks.clone(),
                    ctx.clone(),
                ))
            }
        };

        let state_after = match attempt {
            Attempt::Skip(state) => state,
            Attempt::Run(handle) => {
                let attempt_number = handle.attempt();
                let outcome = (def.execute())(target.clone(), handle).await;

                let mut guard = tracking::lock(&tracking)?;
                if guard.is_frozen() {
                    // The deadline fired and finalization froze this state
                    // while the attempt was in flight; its settlement is
                    // discarded.
                    tracing::error!(
                        task = %def.name(),
                        "task settled after tracking was frozen; outcome discarded"
                    );
                    return Err(ConsumerError::frozen_state(format!(
                        "task '{}' settled after its tracking was frozen",
                        def.name()
                    )));
                }
                let instance = guard.instance_mut(&full_path).ok_or_else(|| {
                    ConsumerError::internal(format!(
                        "tracking instance at path {full_path:?} disappeared mid-attempt"
                    ))
                })?;

                match outcome {
                    Ok(_result) => {
                        instance.state = TaskState::Succeeded;
                        instance.last_error = None;
                        tracing::debug!(
                            task = %def.name(),
                            attempt = attempt_number,
                            "task succeeded"
                        );
                    }
                    Err(TaskError::Failure(info)) => {
                        instance.state = TaskState::Failed;
                        tracing::warn!(
                            task = %def.name(),
                            attempt = attempt_number,
                            error = %info,
                            "task failed"
                        );
                        instance.last_error = Some(info);
                    }
                    Err(TaskError::Rejection {
                        reason,
                        error,
                        permanent,
                    }) => {
                        instance.state = TaskState::Rejected;
                        instance.last_error = Some(
                            error.unwrap_or_else(|| ErrorInfo::new("RejectionError", reason.clone())),
                        );
                        tracing::warn!(
                            task = %def.name(),
                            attempt = attempt_number,
                            permanent,
                            reason = %reason,
                            "task explicitly rejected"
                        );
                    }
                }
                instance.state
            }
        };

        // Sub-tasks progress independently, in declared order, but only
        // when the parent did not fail outright this round.
        if state_after == TaskState::Succeeded {
            for sub_def in def.sub_task_defs() {
                execute_at_path(
                    target.clone(),
                    sub_def.clone(),
                    tracking.clone(),
                    full_path.clone(),
                    ctx.clone(),
                )
                .await?;
            }
        }

        Ok(state_after)
    })
}
