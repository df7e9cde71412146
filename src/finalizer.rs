//! Batch finalization: freezing tracking and routing every record to its
//! final destination.
//!
//! Finalization runs exactly once per invocation, whether the batch run
//! completed or was abandoned at the deadline. It freezes all tracking
//! first, so any still-running abandoned task that later tries to record an
//! outcome fails loudly instead of corrupting the routed state, then
//! partitions the batch:
//!
//! - unusable records go to the dead record queue,
//! - rejected messages go to the dead message queue,
//! - incomplete messages are resubmitted to their origin stream with
//!   tracking embedded so attempt counts accumulate,
//! - complete messages are simply dropped as done.
//!
//! A collaborator failure here is fatal: checkpointing past a batch whose
//! incomplete messages were never resubmitted would silently lose them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::ConsumerContext;
use crate::error::ConsumerError;
use crate::orchestrator::Batch;
use crate::tracking::{self, MessageDisposition, TaskTrackingInstance, TrackedState};
use crate::types::DestinationName;

/// A rejected message as delivered to the dead message queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadMessageEnvelope {
    /// The extracted message body
    pub message: Value,
    /// The message's final tracking state, frozen
    pub task_tracking: TrackedState,
    /// Human-readable reason the message was rejected
    pub reason: String,
    /// When the message was discarded
    pub discarded_at: DateTime<Utc>,
    /// The stream the message came from, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_stream_name: Option<DestinationName>,
}

/// Aggregate counts of where the batch's records ended up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FinalizationOutcome {
    /// Messages fully processed and dropped as done
    pub complete: usize,
    /// Messages resubmitted to the origin stream for another delivery
    pub resubmitted: usize,
    /// Messages routed to the dead message queue
    pub dead_messages: usize,
    /// Records routed to the dead record queue
    pub dead_records: usize,
}

/// Freezes the batch's tracking and routes every record to its final
/// destination.
pub async fn finalize(
    batch: &Batch,
    ctx: &ConsumerContext,
) -> Result<FinalizationOutcome, ConsumerError> {
    freeze_and_sweep(batch, ctx.config.max_attempts)?;

    let mut outcome = FinalizationOutcome::default();
    let mut dead_messages = Vec::new();
    let mut resubmissions = Vec::new();

    for message in &batch.messages {
        let state = message.tracked_state()?;
        match message.disposition()? {
            MessageDisposition::Complete => outcome.complete += 1,
            MessageDisposition::Rejected => {
                dead_messages.push(DeadMessageEnvelope {
                    reason: rejection_reason(&state),
                    message: message.payload.body.clone(),
                    task_tracking: state,
                    discarded_at: Utc::now(),
                    source_stream_name: ctx.source_stream_name.clone(),
                });
            }
            MessageDisposition::Incomplete => {
                resubmissions.push(embed_tracking(
                    &message.payload.body,
                    &state,
                    &ctx.config.task_tracking_name,
                ));
            }
        }
    }

    ctx.config
        .unusable_record_handler
        .discard(&batch.unusable_records, ctx)
        .await
        .map_err(|e| {
            ConsumerError::finalization(format!("dead record queue handler failed: {e}"))
        })?;
    outcome.dead_records = batch.unusable_records.len();

    ctx.config
        .rejected_message_handler
        .discard(&dead_messages, ctx)
        .await
        .map_err(|e| {
            ConsumerError::finalization(format!("dead message queue handler failed: {e}"))
        })?;
    outcome.dead_messages = dead_messages.len();

    if !resubmissions.is_empty() {
        let destination = ctx.source_stream_name.as_ref().ok_or_else(|| {
            ConsumerError::finalization(
                "cannot resubmit incomplete messages: origin stream name is unknown \
                 (no recognizable eventSourceARN and no configured override)",
            )
        })?;
        ctx.config
            .resubmitter
            .resubmit(&resubmissions, destination, ctx)
            .await
            .map_err(|e| ConsumerError::finalization(format!("resubmission failed: {e}")))?;
        outcome.resubmitted = resubmissions.len();
    }

    tracing::info!(
        complete = outcome.complete,
        resubmitted = outcome.resubmitted,
        dead_messages = outcome.dead_messages,
        dead_records = outcome.dead_records,
        "batch finalized"
    );
    Ok(outcome)
}

/// Freezes all tracking, then re-applies the attempt-limit sweep.
///
/// The sweep must run here as well as after the batch run: an abandoned run
/// never reaches its own sweep, and freezing may have just converted a
/// deadline-stranded `Started` attempt into the one that exhausted the
/// limit. Finalization owns the frozen state, so it mutates it directly
/// rather than going through the executor-facing mutability gate.
fn freeze_and_sweep(batch: &Batch, max_attempts: u32) -> Result<(), ConsumerError> {
    tracking::lock(&batch.process_all)?.freeze();
    for message in &batch.messages {
        let mut ones = tracking::lock(&message.process_one)?;
        let mut alls = tracking::lock(&message.process_all)?;
        ones.freeze();
        alls.freeze();

        let mut attempts = ones.retryable_attempts();
        attempts.extend(alls.retryable_attempts());
        if !attempts.is_empty() && attempts.iter().all(|a| *a >= max_attempts) {
            tracing::warn!(
                max_attempts,
                "message exhausted its attempt limit; discarding its remaining tasks"
            );
            ones.discard_exhausted(max_attempts);
            alls.discard_exhausted(max_attempts);
        }
    }
    Ok(())
}

/// Embeds the frozen tracking state into the message body for resubmission.
///
/// A non-object body cannot carry an attribute, so it is wrapped in an
/// object under `"message"`; the default extractor never produces one, but a
/// custom extractor may.
fn embed_tracking(body: &Value, state: &TrackedState, attribute: &str) -> Value {
    let mut body = match body {
        Value::Object(_) => body.clone(),
        other => json!({ "message": other }),
    };
    if let Value::Object(map) = &mut body {
        map.insert(
            attribute.to_string(),
            serde_json::to_value(state).unwrap_or(Value::Null),
        );
    }
    body
}

/// Derives a human-readable rejection reason from the first rejected
/// instance found in the tracking state.
fn rejection_reason(state: &TrackedState) -> String {
    fn find(name: &str, instance: &TaskTrackingInstance) -> Option<String> {
        if instance.state.is_rejection() {
            let detail = instance
                .last_error
                .as_ref()
                .map(|e| e.message.clone())
                .unwrap_or_else(|| format!("task was {}", instance.state));
            return Some(format!("task '{name}': {detail}"));
        }
        instance
            .sub_tasks
            .iter()
            .find_map(|(sub_name, sub)| find(sub_name, sub))
    }

    state
        .ones
        .iter()
        .chain(state.alls.iter())
        .find_map(|(name, instance)| find(name, instance))
        .unwrap_or_else(|| "message contained a rejected task".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        ConsumerConfig, ConsumerConfigBuilder, IncompleteMessageResubmitter, MessageExtractor,
        RejectedMessageHandler, StreamType, UnusableRecordHandler,
    };
    use crate::lambda::StreamEvent;
    use crate::orchestrator::build_batch;
    use crate::task::TaskDef;
    use crate::tracking::TaskState;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    /// Records every collaborator call for assertion.
    #[derive(Default)]
    struct Recorder {
        dead_records: Mutex<Vec<Vec<Value>>>,
        dead_messages: Mutex<Vec<Vec<DeadMessageEnvelope>>>,
        resubmissions: Mutex<Vec<(Vec<Value>, DestinationName)>>,
        fail_resubmit: bool,
    }

    struct BodyExtractor;
    impl MessageExtractor for BodyExtractor {
        fn extract(&self, record: &Value, _: &ConsumerContext) -> Result<Value, ConsumerError> {
            record
                .get("body")
                .cloned()
                .ok_or_else(|| ConsumerError::extraction("record has no body"))
        }
    }

    #[async_trait]
    impl UnusableRecordHandler for Recorder {
        async fn discard(
            &self,
            records: &[Value],
            _: &ConsumerContext,
        ) -> Result<(), ConsumerError> {
            self.dead_records.lock().unwrap().push(records.to_vec());
            Ok(())
        }
    }

    #[async_trait]
    impl RejectedMessageHandler for Recorder {
        async fn discard(
            &self,
            envelopes: &[DeadMessageEnvelope],
            _: &ConsumerContext,
        ) -> Result<(), ConsumerError> {
            self.dead_messages.lock().unwrap().push(envelopes.to_vec());
            Ok(())
        }
    }

    #[async_trait]
    impl IncompleteMessageResubmitter for Recorder {
        async fn resubmit(
            &self,
            messages: &[Value],
            destination: &DestinationName,
            _: &ConsumerContext,
        ) -> Result<(), ConsumerError> {
            if self.fail_resubmit {
                return Err(ConsumerError::internal("stream unavailable"));
            }
            self.resubmissions
                .lock()
                .unwrap()
                .push((messages.to_vec(), destination.clone()));
            Ok(())
        }
    }

    fn builder(recorder: Arc<Recorder>) -> ConsumerConfigBuilder {
        ConsumerConfig::builder(StreamType::Kinesis)
            .dead_record_queue_name("drq")
            .dead_message_queue_name("dmq")
            .extractor(Arc::new(BodyExtractor))
            .unusable_record_handler(recorder.clone())
            .rejected_message_handler(recorder.clone())
            .resubmitter(recorder)
    }

    fn ctx_with_source(config: ConsumerConfig) -> ConsumerContext {
        ConsumerContext::new(
            Arc::new(config),
            Some(DestinationName::new_unchecked("orders")),
        )
    }

    fn record(body: Value) -> Value {
        json!({"eventID": "ev", "body": body})
    }

    fn set_state(tracking: &crate::tracking::SharedTracking, name: &str, state: TaskState) {
        let mut guard = tracking.lock().unwrap();
        let instance = guard.instance_mut(&[name.to_string()]).unwrap();
        instance.state = state;
        instance.attempts += 1;
    }

    #[tokio::test]
    async fn test_complete_messages_are_dropped_as_done() {
        let recorder = Arc::new(Recorder::default());
        let ctx = ctx_with_source(builder(recorder.clone()).build().unwrap());
        let event = StreamEvent::from_records(vec![record(json!({"id": 1}))]);
        let defs = vec![Arc::new(TaskDef::noop("t"))];

        let batch = build_batch(&event, &defs, &[], &ctx);
        set_state(&batch.messages[0].process_one, "t", TaskState::Succeeded);

        let outcome = finalize(&batch, &ctx).await.unwrap();

        assert_eq!(outcome.complete, 1);
        assert_eq!(outcome.resubmitted, 0);
        assert_eq!(outcome.dead_messages, 0);
        assert!(recorder.resubmissions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_incomplete_messages_are_resubmitted_with_tracking() {
        let recorder = Arc::new(Recorder::default());
        let ctx = ctx_with_source(builder(recorder.clone()).build().unwrap());
        let event = StreamEvent::from_records(vec![record(json!({"id": 1}))]);
        let defs = vec![Arc::new(TaskDef::noop("t"))];

        let batch = build_batch(&event, &defs, &[], &ctx);
        set_state(&batch.messages[0].process_one, "t", TaskState::Failed);

        let outcome = finalize(&batch, &ctx).await.unwrap();

        assert_eq!(outcome.resubmitted, 1);
        let calls = recorder.resubmissions.lock().unwrap();
        let (messages, destination) = &calls[0];
        assert_eq!(destination.as_str(), "orders");
        assert_eq!(messages[0]["id"], 1);
        assert_eq!(messages[0]["taskTracking"]["ones"]["t"]["state"], "Failed");
        assert_eq!(messages[0]["taskTracking"]["ones"]["t"]["attempts"], 1);
    }

    #[tokio::test]
    async fn test_rejected_messages_go_to_the_dead_message_queue() {
        let recorder = Arc::new(Recorder::default());
        let ctx = ctx_with_source(builder(recorder.clone()).build().unwrap());
        let event = StreamEvent::from_records(vec![record(json!({"id": 1}))]);
        let defs = vec![Arc::new(TaskDef::noop("t"))];

        let batch = build_batch(&event, &defs, &[], &ctx);
        set_state(&batch.messages[0].process_one, "t", TaskState::Rejected);

        let outcome = finalize(&batch, &ctx).await.unwrap();

        assert_eq!(outcome.dead_messages, 1);
        let calls = recorder.dead_messages.lock().unwrap();
        let envelope = &calls[0][0];
        assert_eq!(envelope.message["id"], 1);
        assert!(envelope.reason.contains("'t'"));
        assert_eq!(
            envelope.task_tracking.ones["t"].state,
            TaskState::Rejected
        );
    }

    #[tokio::test]
    async fn test_unusable_records_go_to_the_dead_record_queue() {
        let recorder = Arc::new(Recorder::default());
        let ctx = ctx_with_source(builder(recorder.clone()).build().unwrap());
        let event = StreamEvent::from_records(vec![
            json!({"eventID": "bad"}), // no body
            record(json!({"id": 1})),
        ]);
        let defs = vec![Arc::new(TaskDef::noop("t"))];

        let batch = build_batch(&event, &defs, &[], &ctx);
        set_state(&batch.messages[0].process_one, "t", TaskState::Succeeded);

        let outcome = finalize(&batch, &ctx).await.unwrap();

        assert_eq!(outcome.dead_records, 1);
        let calls = recorder.dead_records.lock().unwrap();
        assert_eq!(calls[0][0]["eventID"], "bad");
    }

    #[tokio::test]
    async fn test_freeze_converts_started_to_failed_before_routing() {
        let recorder = Arc::new(Recorder::default());
        let ctx = ctx_with_source(builder(recorder.clone()).build().unwrap());
        let event = StreamEvent::from_records(vec![record(json!({"id": 1}))]);
        let defs = vec![Arc::new(TaskDef::noop("t"))];

        let batch = build_batch(&event, &defs, &[], &ctx);
        // Simulates a task abandoned mid-attempt at the deadline.
        set_state(&batch.messages[0].process_one, "t", TaskState::Started);

        let outcome = finalize(&batch, &ctx).await.unwrap();

        assert_eq!(outcome.resubmitted, 1);
        let calls = recorder.resubmissions.lock().unwrap();
        let state = &calls[0].0[0]["taskTracking"]["ones"]["t"];
        assert_eq!(state["state"], "Failed");
        assert_eq!(state["lastError"]["errorType"], "FrozenTaskError");
    }

    #[tokio::test]
    async fn test_unknown_source_with_incomplete_messages_is_fatal() {
        let recorder = Arc::new(Recorder::default());
        let config = builder(recorder).build().unwrap();
        let ctx = ConsumerContext::new(Arc::new(config), None);
        let event = StreamEvent::from_records(vec![record(json!({"id": 1}))]);
        let defs = vec![Arc::new(TaskDef::noop("t"))];

        let batch = build_batch(&event, &defs, &[], &ctx);
        set_state(&batch.messages[0].process_one, "t", TaskState::Failed);

        let err = finalize(&batch, &ctx).await.unwrap_err();
        assert!(matches!(err, ConsumerError::Finalization { .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_resubmitter_failure_is_fatal() {
        let recorder = Arc::new(Recorder {
            fail_resubmit: true,
            ..Recorder::default()
        });
        let ctx = ctx_with_source(builder(recorder).build().unwrap());
        let event = StreamEvent::from_records(vec![record(json!({"id": 1}))]);
        let defs = vec![Arc::new(TaskDef::noop("t"))];

        let batch = build_batch(&event, &defs, &[], &ctx);
        set_state(&batch.messages[0].process_one, "t", TaskState::Failed);

        let err = finalize(&batch, &ctx).await.unwrap_err();
        assert!(matches!(err, ConsumerError::Finalization { .. }));
    }

    #[tokio::test]
    async fn test_tracking_is_frozen_after_finalization() {
        let recorder = Arc::new(Recorder::default());
        let ctx = ctx_with_source(builder(recorder).build().unwrap());
        let event = StreamEvent::from_records(vec![record(json!({"id": 1}))]);

        let batch = build_batch(&event, &[], &[], &ctx);
        finalize(&batch, &ctx).await.unwrap();

        assert!(batch.messages[0].process_one.lock().unwrap().is_frozen());
        assert!(batch.messages[0].process_all.lock().unwrap().is_frozen());
        assert!(batch.process_all.lock().unwrap().is_frozen());
    }

    #[test]
    fn test_embed_tracking_wraps_non_object_body() {
        let state = TrackedState::default();
        let embedded = embed_tracking(&json!("plain string"), &state, "taskTracking");
        assert_eq!(embedded["message"], "plain string");
        assert!(embedded.get("taskTracking").is_some());
    }

    #[test]
    fn test_rejection_reason_prefers_last_error_message() {
        let mut ones = std::collections::BTreeMap::new();
        ones.insert(
            "persist".to_string(),
            TaskTrackingInstance {
                state: TaskState::Rejected,
                attempts: 1,
                last_error: Some(crate::error::ErrorInfo::new(
                    "TaskRejection",
                    "schema mismatch",
                )),
                sub_tasks: Default::default(),
            },
        );
        let reason = rejection_reason(&TrackedState {
            ones,
            alls: Default::default(),
        });
        assert_eq!(reason, "task 'persist': schema mismatch");
    }

    #[test]
    fn test_envelope_serializes_camel_case() {
        let envelope = DeadMessageEnvelope {
            message: json!({"id": 1}),
            task_tracking: TrackedState::default(),
            reason: "task 'x': boom".to_string(),
            discarded_at: Utc::now(),
            source_stream_name: Some(DestinationName::new_unchecked("orders")),
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert!(json.get("taskTracking").is_some());
        assert!(json.get("discardedAt").is_some());
        assert_eq!(json["sourceStreamName"], "orders");
    }
}
