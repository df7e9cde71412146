//! # AWS Stream Consumer
//!
//! A batch orchestration and task-tracking engine for AWS Lambda functions
//! consuming Kinesis or DynamoDB streams.
//!
//! These streams deliver at-least-once, in shard order, and checkpoint per
//! batch: a Lambda invocation either moves the whole batch forward or gets
//! the whole batch again. This crate turns that coarse contract into
//! fine-grained progress. Processing is declared as named tasks (with
//! optional sub-tasks) that run against each message individually or against
//! the batch as a whole; per-task state and attempt counts are tracked,
//! embedded in resubmitted messages, and merged back on redelivery so that
//! completed work is never repeated and failing work is retried only until a
//! configurable attempt limit.
//!
//! After each run every message lands in exactly one of three dispositions:
//!
//! - **complete**: every task succeeded; the message is dropped as done,
//! - **incomplete**: retryable work remains; the message is resubmitted to
//!   its origin stream with tracking embedded,
//! - **rejected**: a task was rejected, exhausted its attempts, or was
//!   abandoned; the message goes to the dead message queue.
//!
//! Records that cannot even be turned into messages go to the dead record
//! queue instead of poisoning the shard.
//!
//! The whole run is raced against a fraction of the remaining invocation
//! time. When the budget elapses, in-flight tasks are abandoned in place
//! (never cancelled), tracking is frozen, and whatever progress exists is
//! finalized so it survives into the next delivery.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use aws_stream_consumer::{
//!     ConsumerConfig, JsonMessageExtractor, StreamConsumer, StreamEvent, StreamType, TaskDef,
//! };
//!
//! # async fn example(
//! #     handlers: (
//! #         Arc<dyn aws_stream_consumer::UnusableRecordHandler>,
//! #         Arc<dyn aws_stream_consumer::RejectedMessageHandler>,
//! #         Arc<dyn aws_stream_consumer::IncompleteMessageResubmitter>,
//! #     ),
//! #     event: StreamEvent,
//! #     remaining_time_ms: u64,
//! # ) -> Result<(), aws_stream_consumer::ConsumerError> {
//! let config = ConsumerConfig::builder(StreamType::Kinesis)
//!     .dead_record_queue_name("orders-DRQ")
//!     .dead_message_queue_name("orders-DMQ")
//!     .max_attempts(5)
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
//!                     // ... write the order to the store ...
//!                     let _ = order;
//!                     Ok(None)
//!                 }
//!             })
//!             .build()?,
//!     );
//!
//! // Inside the Lambda handler:
//! let outcome = consumer.process_batch(event, remaining_time_ms).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`task`]: immutable task definition trees and the execute-function
//!   surface.
//! - [`tracking`]: the per-task state machine, persisted tracking layout,
//!   and merge-on-redelivery rules.
//! - [`executor`]: runs one task tree against one target, recording
//!   outcomes.
//! - [`orchestrator`]: builds the batch from the raw event and fans the
//!   executor out across messages and the batch.
//! - [`deadline`]: races the run against the invocation time budget.
//! - [`finalizer`]: freezes tracking and routes every record to its final
//!   destination.
//! - [`consumer`]: the top-level [`StreamConsumer`] tying it all together.
//! - [`config`]: invocation configuration and the injected collaborator
//!   traits.
//! - [`lambda`]: the Lambda event surface and the default JSON extractor.

#![warn(missing_docs)]

pub mod config;
pub mod consumer;
pub mod deadline;
pub mod error;
pub mod executor;
pub mod finalizer;
pub mod lambda;
pub mod orchestrator;
pub mod task;
pub mod tracking;
pub mod types;

pub use config::{
    ConsumerConfig, ConsumerConfigBuilder, ConsumerContext, IncompleteMessageResubmitter,
    MessageExtractor, RejectedMessageHandler, StreamType, UnusableRecordHandler,
};
pub use consumer::StreamConsumer;
pub use deadline::{race_with_deadline, RaceOutcome};
pub use error::{ConsumerError, ErrorInfo};
pub use finalizer::{DeadMessageEnvelope, FinalizationOutcome};
pub use lambda::{JsonMessageExtractor, StreamEvent};
pub use task::{TaskDef, TaskDefBuilder, TaskError, TaskHandle, TaskTarget};
pub use tracking::{MessageDisposition, TaskState, TaskTrackingInstance, TrackedState};
pub use types::{DestinationName, TaskName};
