//! The top-level stream consumer.
//!
//! A [`StreamConsumer`] is built once from a configuration and the task
//! definitions, then drives one whole invocation per call to
//! [`StreamConsumer::process_batch`]: build the batch from the raw event,
//! race the orchestration run against the invocation deadline, and finalize
//! whatever progress was made.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use aws_stream_consumer::config::{ConsumerConfig, StreamType};
//! use aws_stream_consumer::consumer::StreamConsumer;
//! use aws_stream_consumer::lambda::{JsonMessageExtractor, StreamEvent};
//! use aws_stream_consumer::task::TaskDef;
//!
//! # async fn example(
//! #     handlers: (
//! #         Arc<dyn aws_stream_consumer::config::UnusableRecordHandler>,
//! #         Arc<dyn aws_stream_consumer::config::RejectedMessageHandler>,
//! #         Arc<dyn aws_stream_consumer::config::IncompleteMessageResubmitter>,
//! #     ),
//! #     event: StreamEvent,
//! #     remaining_time_ms: u64,
//! # ) -> Result<(), aws_stream_consumer::error::ConsumerError> {
//! let config = ConsumerConfig::builder(StreamType::Kinesis)
//!     .dead_record_queue_name("orders-DRQ")
//!     .dead_message_queue_name("orders-DMQ")
//!     .extractor(Arc::new(JsonMessageExtractor))
//!     .unusable_record_handler(handlers.0)
//!     .rejected_message_handler(handlers.1)
//!     .resubmitter(handlers.2)
//!     .build()?;
//!
//! let consumer = StreamConsumer::new(config)?
//!     .process_one_task(
//!         TaskDef::builder("persist-order")
//!             .execute(|target, _handle| {
//!                 let order = target.message().unwrap().body.clone();
//!                 async move {
//!                     // ... write the order somewhere ...
//!                     let _ = order;
//!                     Ok(None)
//!                 }
//!             })
//!             .build()?,
//!     );
//!
//! let outcome = consumer.process_batch(event, remaining_time_ms).await?;
//! tracing::info!(?outcome, "batch processed");
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use crate::config::{ConsumerConfig, ConsumerContext};
use crate::deadline::{race_with_deadline, RaceOutcome};
use crate::error::ConsumerError;
use crate::finalizer::{finalize, FinalizationOutcome};
use crate::lambda::StreamEvent;
use crate::orchestrator::{build_batch, run_batch};
use crate::task::{validate_unique_names, TaskDef};
use crate::types::DestinationName;

/// A configured stream consumer, reusable across invocations.
#[derive(Clone)]
pub struct StreamConsumer {
    config: Arc<ConsumerConfig>,
    process_one_defs: Arc<Vec<Arc<TaskDef>>>,
    process_all_defs: Arc<Vec<Arc<TaskDef>>>,
}

impl std::fmt::Debug for StreamConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConsumer")
            .field("config", &self.config)
            .field(
                "process_one_tasks",
                &self
                    .process_one_defs
                    .iter()
                    .map(|d| d.name().as_str())
                    .collect::<Vec<_>>(),
            )
            .field(
                "process_all_tasks",
                &self
                    .process_all_defs
                    .iter()
                    .map(|d| d.name().as_str())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl StreamConsumer {
    /// Creates a consumer with no tasks registered yet.
    ///
    /// Re-validates the configuration's scalar invariants, since
    /// [`ConsumerConfig`]'s fields are public and it may have been assembled
    /// without the builder.
    pub fn new(config: ConsumerConfig) -> Result<Self, ConsumerError> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            process_one_defs: Arc::new(Vec::new()),
            process_all_defs: Arc::new(Vec::new()),
        })
    }

    /// Registers a task to run independently against every message.
    ///
    /// Tasks run in registration order of no particular significance; they
    /// are independent and may interleave.
    pub fn process_one_task(mut self, def: TaskDef) -> Self {
        Arc::make_mut(&mut self.process_one_defs).push(Arc::new(def));
        self
    }

    /// Registers a task to run once against the whole batch, with its
    /// outcome fanned out to every message.
    pub fn process_all_task(mut self, def: TaskDef) -> Self {
        Arc::make_mut(&mut self.process_all_defs).push(Arc::new(def));
        self
    }

    /// Processes one stream batch end to end.
    ///
    /// `remaining_time_ms` is the invocation time still available (for
    /// Lambda, `Context::get_remaining_time_in_millis`). The orchestration
    /// run gets the configured fraction of it; whatever state exists when
    /// that budget elapses is finalized as-is and the run is abandoned in
    /// place.
    ///
    /// Returns the finalization outcome, or a fatal error when the
    /// invocation must fail so the host redelivers the batch.
    pub async fn process_batch(
        &self,
        event: StreamEvent,
        remaining_time_ms: u64,
    ) -> Result<FinalizationOutcome, ConsumerError> {
        validate_unique_names(&self.process_one_defs)?;
        validate_unique_names(&self.process_all_defs)?;

        let source_stream_name = self
            .config
            .source_stream_name
            .clone()
            .or_else(|| event.source_stream_name().map(DestinationName::from));
        let ctx = Arc::new(ConsumerContext::new(self.config.clone(), source_stream_name));

        tracing::debug!(
            records = event.records.len(),
            source_stream = ctx.source_stream_name.as_ref().map(|n| n.as_str()),
            "processing stream batch"
        );

        let batch = Arc::new(build_batch(
            &event,
            &self.process_one_defs,
            &self.process_all_defs,
            &ctx,
        ));

        let run = run_batch(
            batch.clone(),
            self.process_one_defs.clone(),
            self.process_all_defs.clone(),
            ctx.clone(),
        );
        match race_with_deadline(run, remaining_time_ms, self.config.timeout_fraction).await? {
            RaceOutcome::Completed(Ok(result)) => {
                tracing::debug!(
                    completed = result.completed,
                    incomplete = result.incomplete,
                    rejected = result.rejected,
                    "batch run completed within the time budget"
                );
            }
            RaceOutcome::Completed(Err(defect)) => return Err(defect),
            RaceOutcome::DeadlineElapsed => {
                tracing::warn!("batch run abandoned at the deadline; finalizing partial progress");
            }
        }

        finalize(&batch, &ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        IncompleteMessageResubmitter, MessageExtractor, RejectedMessageHandler, StreamType,
        UnusableRecordHandler,
    };
    use crate::finalizer::DeadMessageEnvelope;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        resubmissions: Mutex<Vec<Vec<Value>>>,
        dead_messages: Mutex<Vec<Vec<DeadMessageEnvelope>>>,
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
        async fn discard(&self, _: &[Value], _: &ConsumerContext) -> Result<(), ConsumerError> {
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
            _: &DestinationName,
            _: &ConsumerContext,
        ) -> Result<(), ConsumerError> {
            self.resubmissions.lock().unwrap().push(messages.to_vec());
            Ok(())
        }
    }

    fn config(recorder: Arc<Recorder>) -> ConsumerConfig {
        ConsumerConfig::builder(StreamType::Kinesis)
            .dead_record_queue_name("drq")
            .dead_message_queue_name("dmq")
            .source_stream_name("orders")
            .extractor(Arc::new(BodyExtractor))
            .unusable_record_handler(recorder.clone())
            .rejected_message_handler(recorder.clone())
            .resubmitter(recorder)
            .build()
            .unwrap()
    }

    fn record(body: Value) -> Value {
        json!({"eventID": "ev", "body": body})
    }

    #[tokio::test]
    async fn test_successful_batch_completes() {
        let recorder = Arc::new(Recorder::default());
        let consumer = StreamConsumer::new(config(recorder.clone()))
            .unwrap()
            .process_one_task(
                TaskDef::builder("ok")
                    .execute(|_, _| async { Ok(None) })
                    .build()
                    .unwrap(),
            );

        let event = StreamEvent::from_records(vec![
            record(json!({"id": 1})),
            record(json!({"id": 2})),
        ]);
        let outcome = consumer.process_batch(event, 60_000).await.unwrap();

        assert_eq!(outcome.complete, 2);
        assert_eq!(outcome.resubmitted, 0);
        assert_eq!(outcome.dead_messages, 0);
        assert!(recorder.resubmissions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failing_task_triggers_resubmission() {
        let recorder = Arc::new(Recorder::default());
        let consumer = StreamConsumer::new(config(recorder.clone()))
            .unwrap()
            .process_one_task(
                TaskDef::builder("flaky")
                    .execute(|_, handle| {
                        let err = handle.fail("transient failure");
                        async move { Err(err) }
                    })
                    .build()
                    .unwrap(),
            );

        let event = StreamEvent::from_records(vec![record(json!({"id": 1}))]);
        let outcome = consumer.process_batch(event, 60_000).await.unwrap();

        assert_eq!(outcome.resubmitted, 1);
        let calls = recorder.resubmissions.lock().unwrap();
        assert_eq!(calls[0][0]["taskTracking"]["ones"]["flaky"]["attempts"], 1);
    }

    #[tokio::test]
    async fn test_rejecting_task_dead_letters_the_message() {
        let recorder = Arc::new(Recorder::default());
        let consumer = StreamConsumer::new(config(recorder.clone()))
            .unwrap()
            .process_one_task(
                TaskDef::builder("validator")
                    .execute(|_, handle| {
                        let err = handle.reject("schema mismatch", true);
                        async move { Err(err) }
                    })
                    .build()
                    .unwrap(),
            );

        let event = StreamEvent::from_records(vec![record(json!({"id": 1}))]);
        let outcome = consumer.process_batch(event, 60_000).await.unwrap();

        assert_eq!(outcome.dead_messages, 1);
        assert_eq!(outcome.resubmitted, 0);
        let calls = recorder.dead_messages.lock().unwrap();
        assert!(calls[0][0].reason.contains("schema mismatch"));
    }

    #[tokio::test]
    async fn test_duplicate_registration_fails_before_processing() {
        let recorder = Arc::new(Recorder::default());
        let consumer = StreamConsumer::new(config(recorder))
            .unwrap()
            .process_one_task(TaskDef::noop("dup"))
            .process_one_task(TaskDef::noop("dup"));

        let event = StreamEvent::from_records(vec![record(json!({"id": 1}))]);
        let err = consumer.process_batch(event, 60_000).await.unwrap_err();
        assert!(matches!(err, ConsumerError::TaskDefinition { .. }));
    }

    #[test]
    fn test_new_rejects_hand_assembled_invalid_config() {
        let mut cfg = config(Arc::new(Recorder::default()));
        cfg.timeout_fraction = 0.0;
        let result = StreamConsumer::new(cfg);
        assert!(matches!(result, Err(ConsumerError::Configuration { .. })));
    }

    #[tokio::test]
    async fn test_empty_event_finalizes_cleanly() {
        let recorder = Arc::new(Recorder::default());
        let consumer = StreamConsumer::new(config(recorder))
            .unwrap()
            .process_one_task(TaskDef::noop("t"));

        let outcome = consumer
            .process_batch(StreamEvent::default(), 60_000)
            .await
            .unwrap();
        assert_eq!(outcome, FinalizationOutcome::default());
    }
}
