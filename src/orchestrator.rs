//! The batch orchestrator: builds the batch from the raw event and fans the
//! task executor out across every message and the batch as a whole.
//!
//! Concurrency model: one cooperative event loop, no threads of user code.
//! Independent messages and the process-one/process-all runs are interleaved
//! freely; within one target's task tree, sub-tasks stay sequential. No two
//! concurrent executions ever write the same tracking instance. The one
//! cross-cutting write, fanning batch-level outcomes onto every message,
//! happens strictly after the batch-level run settles.

use std::sync::Arc;

use futures::future::{join_all, BoxFuture};
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::config::ConsumerContext;
use crate::error::ConsumerError;
use crate::executor::execute_task;
use crate::lambda::{record_event_id, StreamEvent};
use crate::task::{validate_unique_names, BatchPayload, MessagePayload, TaskDef, TaskTarget};
use crate::tracking::{
    self, classify, MessageDisposition, SharedTracking, TaskTracking, TaskTrackingInstance,
    TrackedState,
};

/// One successfully extracted message and its tracking state.
#[derive(Debug, Clone)]
pub struct Message {
    /// The immutable record and extracted body
    pub payload: Arc<MessagePayload>,
    /// Tracking for this message's process-one tasks
    pub process_one: SharedTracking,
    /// This message's view of the process-all tasks
    pub process_all: SharedTracking,
}

impl Message {
    /// Snapshots both tracking views into the persistable form.
    pub fn tracked_state(&self) -> Result<TrackedState, ConsumerError> {
        let ones = tracking::lock(&self.process_one)?.snapshot();
        let alls = tracking::lock(&self.process_all)?.snapshot();
        Ok(TrackedState { ones, alls })
    }

    /// Classifies this message from its current tracking state.
    pub fn disposition(&self) -> Result<MessageDisposition, ConsumerError> {
        let ones = tracking::lock(&self.process_one)?;
        let alls = tracking::lock(&self.process_all)?;
        Ok(classify(&ones, &alls))
    }
}

/// The batch under orchestration: constructed at invocation start from the
/// raw event, dropped once finalization completes.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Successfully extracted messages, in record order
    pub messages: Vec<Message>,
    /// Raw records that failed extraction, in record order
    pub unusable_records: Vec<Value>,
    /// The batch-level process-all tracking (fanned out onto messages once
    /// settled)
    pub process_all: SharedTracking,
    /// The immutable batch content handed to process-all tasks
    pub payload: Arc<BatchPayload>,
}

/// Constructs the batch: extracts a message from each record and
/// initializes (or merges) its tracking state.
///
/// Extraction failures route the record to `unusable_records` and never
/// abort the batch.
pub fn build_batch(
    event: &StreamEvent,
    process_one_defs: &[Arc<TaskDef>],
    process_all_defs: &[Arc<TaskDef>],
    ctx: &ConsumerContext,
) -> Batch {
    let mut messages = Vec::new();
    let mut unusable_records = Vec::new();

    for record in &event.records {
        match ctx.config.extractor.extract(record, ctx) {
            Ok(body) => {
                let prior = prior_tracking(&body, &ctx.config.task_tracking_name);
                let process_one =
                    TaskTracking::init_or_merge(Some(&prior.ones), process_one_defs);
                let process_all =
                    TaskTracking::init_or_merge(Some(&prior.alls), process_all_defs);
                messages.push(Message {
                    payload: Arc::new(MessagePayload {
                        record: record.clone(),
                        body,
                    }),
                    process_one: tracking::shared(process_one),
                    process_all: tracking::shared(process_all),
                });
            }
            Err(error) => {
                tracing::warn!(
                    event_id = record_event_id(record).unwrap_or("<unknown>"),
                    %error,
                    "record failed extraction; routing to dead record queue"
                );
                unusable_records.push(record.clone());
            }
        }
    }

    let payload = Arc::new(BatchPayload {
        messages: messages.iter().map(|m| m.payload.clone()).collect(),
    });
    Batch {
        messages,
        unusable_records,
        process_all: tracking::shared(TaskTracking::init_or_merge(None, process_all_defs)),
        payload,
    }
}

fn prior_tracking(body: &Value, attribute: &str) -> TrackedState {
    let Some(raw) = body.get(attribute) else {
        return TrackedState::default();
    };
    match serde_json::from_value(raw.clone()) {
        Ok(state) => state,
        Err(error) => {
            tracing::warn!(%error, "embedded task tracking is malformed; starting fresh");
            TrackedState::default()
        }
    }
}

/// Per-message snapshot returned from a batch run.
#[derive(Debug, Clone)]
pub struct MessageSnapshot {
    /// The message's partition as of the end of the run
    pub disposition: MessageDisposition,
    /// Process-one tracking snapshot
    pub ones: std::collections::BTreeMap<String, TaskTrackingInstance>,
    /// Process-all tracking snapshot
    pub alls: std::collections::BTreeMap<String, TaskTrackingInstance>,
}

/// Aggregate result of one batch run.
#[derive(Debug, Clone)]
pub struct BatchResult {
    /// Number of extracted messages
    pub message_count: usize,
    /// Number of records that failed extraction
    pub unusable_count: usize,
    /// Messages with every task succeeded
    pub completed: usize,
    /// Messages with retryable work remaining
    pub incomplete: usize,
    /// Messages with at least one rejected/discarded/abandoned task
    pub rejected: usize,
    /// Per-message tracking snapshots, in record order
    pub snapshots: Vec<MessageSnapshot>,
}

/// Runs every process-one task against every message and every process-all
/// task against the batch, then re-evaluates attempt limits.
///
/// Individual task failures are absorbed into tracking state; only
/// orchestration-level defects (malformed definitions, frozen-state writes)
/// are returned as errors.
pub async fn run_batch(
    batch: Arc<Batch>,
    process_one_defs: Arc<Vec<Arc<TaskDef>>>,
    process_all_defs: Arc<Vec<Arc<TaskDef>>>,
    ctx: Arc<ConsumerContext>,
) -> Result<BatchResult, ConsumerError> {
    validate_unique_names(&process_one_defs)?;
    validate_unique_names(&process_all_defs)?;

    let semaphore = ctx
        .config
        .max_concurrency
        .map(|n| Arc::new(Semaphore::new(n)));

    let mut work: Vec<BoxFuture<'static, Result<(), ConsumerError>>> = Vec::new();

    for message in &batch.messages {
        for def in process_one_defs.iter() {
            let target = TaskTarget::Message(message.payload.clone());
            let tracking = message.process_one.clone();
            let def = def.clone();
            let ctx = ctx.clone();
            let semaphore = semaphore.clone();
            work.push(Box::pin(async move {
                let _permit = match semaphore {
                    Some(s) => Some(s.acquire_owned().await.map_err(|_| {
                        ConsumerError::internal("task concurrency semaphore closed")
                    })?),
                    None => None,
                };
                execute_task(target, def, tracking, ctx).await.map(|_| ())
            }));
        }
    }

    // The process-all run is independent of the per-message work, but its
    // fan-out must happen strictly after the batch-level tasks settle.
    {
        let batch = batch.clone();
        let process_all_defs = process_all_defs.clone();
        let ctx = ctx.clone();
        let semaphore = semaphore.clone();
        work.push(Box::pin(async move {
            let mut runs: Vec<BoxFuture<'static, Result<(), ConsumerError>>> = Vec::new();
            for def in process_all_defs.iter() {
                let target = TaskTarget::Batch(batch.payload.clone());
                let tracking = batch.process_all.clone();
                let def = def.clone();
                let ctx = ctx.clone();
                let semaphore = semaphore.clone();
                runs.push(Box::pin(async move {
                    let _permit = match semaphore {
                        Some(s) => Some(s.acquire_owned().await.map_err(|_| {
                            ConsumerError::internal("task concurrency semaphore closed")
                        })?),
                        None => None,
                    };
                    execute_task(target, def, tracking, ctx).await.map(|_| ())
                }));
            }
            let outcomes = join_all(runs).await;
            fan_out_process_all(&batch)?;
            first_defect(outcomes)
        }));
    }

    let outcomes = join_all(work).await;
    first_defect(outcomes)?;

    sweep_attempt_limits(&batch, ctx.config.max_attempts)?;

    summarize(&batch)
}

/// Applies the settled batch-level task states onto every message's
/// process-all tracking.
fn fan_out_process_all(batch: &Batch) -> Result<(), ConsumerError> {
    let batch_snapshot = tracking::lock(&batch.process_all)?.snapshot();
    for message in &batch.messages {
        let mut guard = tracking::lock(&message.process_all)?;
        guard.ensure_mutable("fanning out process-all outcomes")?;
        for (name, batch_inst) in &batch_snapshot {
            guard
                .tasks_mut()
                .entry(name.clone())
                .or_default()
                .apply_batch_outcome(batch_inst);
        }
    }
    Ok(())
}

/// Bridges "retryable failure" to "needs dead-lettering": once every
/// remaining incomplete task on a message has reached the attempt limit,
/// those tasks are discarded so the message routes to the dead message
/// queue instead of being resubmitted forever.
fn sweep_attempt_limits(batch: &Batch, max_attempts: u32) -> Result<(), ConsumerError> {
    for message in &batch.messages {
        let mut ones = tracking::lock(&message.process_one)?;
        let mut alls = tracking::lock(&message.process_all)?;
        ones.ensure_mutable("sweeping attempt limits")?;
        alls.ensure_mutable("sweeping attempt limits")?;

        let mut attempts = ones.retryable_attempts();
        attempts.extend(alls.retryable_attempts());
        if attempts.is_empty() || attempts.iter().any(|a| *a < max_attempts) {
            continue;
        }

        tracing::warn!(
            max_attempts,
            "message exhausted its attempt limit; discarding its remaining tasks"
        );
        ones.discard_exhausted(max_attempts);
        alls.discard_exhausted(max_attempts);
    }
    Ok(())
}

fn first_defect(outcomes: Vec<Result<(), ConsumerError>>) -> Result<(), ConsumerError> {
    let mut first = None;
    for outcome in outcomes {
        if let Err(error) = outcome {
            tracing::error!(%error, "orchestration defect during batch run");
            first.get_or_insert(error);
        }
    }
    match first {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

fn summarize(batch: &Batch) -> Result<BatchResult, ConsumerError> {
    let mut snapshots = Vec::with_capacity(batch.messages.len());
    let (mut completed, mut incomplete, mut rejected) = (0usize, 0usize, 0usize);

    for message in &batch.messages {
        let disposition = message.disposition()?;
        match disposition {
            MessageDisposition::Complete => completed += 1,
            MessageDisposition::Incomplete => incomplete += 1,
            MessageDisposition::Rejected => rejected += 1,
        }
        let state = message.tracked_state()?;
        snapshots.push(MessageSnapshot {
            disposition,
            ones: state.ones,
            alls: state.alls,
        });
    }

    Ok(BatchResult {
        message_count: batch.messages.len(),
        unusable_count: batch.unusable_records.len(),
        completed,
        incomplete,
        rejected,
        snapshots,
    })
}
