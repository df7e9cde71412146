//! Configuration for a stream consumer invocation.
//!
//! All policy lives here: the stream kind being consumed, the tracking
//! attribute name, the deadline fraction, the attempt limit, the dead
//! record/message destinations, and the four injected collaborators the
//! orchestration engine calls at its boundary. Absence of any collaborator
//! is a fatal configuration error detected at build time, never at first
//! use. There is no ambient global state: the built configuration is
//! constructed once per invocation and passed by reference to every
//! component.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConsumerError;
use crate::finalizer::DeadMessageEnvelope;
use crate::types::DestinationName;

/// Default fraction of the remaining invocation time used as the soft
/// deadline, leaving headroom for finalization I/O.
pub const DEFAULT_TIMEOUT_FRACTION: f64 = 0.9;

/// Default maximum number of attempts before a task is discarded.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Default name of the message body attribute carrying task tracking.
pub const DEFAULT_TASK_TRACKING_NAME: &str = "taskTracking";

/// The kind of partitioned stream feeding this consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamType {
    /// An Amazon Kinesis data stream
    Kinesis,
    /// A DynamoDB stream
    DynamoDb,
}

impl std::fmt::Display for StreamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Kinesis => write!(f, "kinesis"),
            Self::DynamoDb => write!(f, "dynamodb"),
        }
    }
}

/// Extracts a message body from a raw stream record.
///
/// Synchronous by contract; a failure marks the record unusable (dead record
/// queue routing) and never aborts the batch.
pub trait MessageExtractor: Send + Sync {
    /// Converts one raw record into a message body.
    fn extract(&self, record: &Value, ctx: &ConsumerContext) -> Result<Value, ConsumerError>;
}

/// Discards records that failed extraction to the dead record queue.
#[async_trait]
pub trait UnusableRecordHandler: Send + Sync {
    /// Routes the given records to the dead record queue.
    ///
    /// Must not fail for an empty input; a failure is fatal to the
    /// invocation.
    async fn discard(&self, records: &[Value], ctx: &ConsumerContext) -> Result<(), ConsumerError>;
}

/// Discards rejected messages to the dead message queue.
#[async_trait]
pub trait RejectedMessageHandler: Send + Sync {
    /// Routes the given dead message envelopes to the dead message queue.
    ///
    /// Must not fail for an empty input; a failure is fatal to the
    /// invocation.
    async fn discard(
        &self,
        envelopes: &[DeadMessageEnvelope],
        ctx: &ConsumerContext,
    ) -> Result<(), ConsumerError>;
}

/// Resubmits incomplete messages back to their origin stream.
#[async_trait]
pub trait IncompleteMessageResubmitter: Send + Sync {
    /// Resubmits the given message bodies (tracking already embedded) to
    /// `destination` so the next delivery merges onto existing attempt
    /// counts.
    ///
    /// Must not fail for an empty input; a failure is fatal to the
    /// invocation.
    async fn resubmit(
        &self,
        messages: &[Value],
        destination: &DestinationName,
        ctx: &ConsumerContext,
    ) -> Result<(), ConsumerError>;
}

/// The full configuration for one invocation.
///
/// Built once via [`ConsumerConfig::builder`] and shared immutably for the
/// invocation's duration.
#[derive(Clone)]
pub struct ConsumerConfig {
    /// The kind of stream feeding this consumer
    pub stream_type: StreamType,
    /// Name of the message body attribute carrying task tracking
    pub task_tracking_name: String,
    /// Fraction (0.0, 1.0] of remaining time used as the soft deadline
    pub timeout_fraction: f64,
    /// Maximum number of attempts before a task is discarded
    pub max_attempts: u32,
    /// Destination for records that failed extraction
    pub dead_record_queue_name: DestinationName,
    /// Destination for rejected messages
    pub dead_message_queue_name: DestinationName,
    /// Optional cap on concurrent task executions; unbounded when `None`
    pub max_concurrency: Option<usize>,
    /// Explicit resubmission destination, overriding the name derived from
    /// the records' `eventSourceARN`
    pub source_stream_name: Option<DestinationName>,
    /// Extraction collaborator
    pub extractor: Arc<dyn MessageExtractor>,
    /// Dead record queue collaborator
    pub unusable_record_handler: Arc<dyn UnusableRecordHandler>,
    /// Dead message queue collaborator
    pub rejected_message_handler: Arc<dyn RejectedMessageHandler>,
    /// Resubmission collaborator
    pub resubmitter: Arc<dyn IncompleteMessageResubmitter>,
}

impl std::fmt::Debug for ConsumerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerConfig")
            .field("stream_type", &self.stream_type)
            .field("task_tracking_name", &self.task_tracking_name)
            .field("timeout_fraction", &self.timeout_fraction)
            .field("max_attempts", &self.max_attempts)
            .field("dead_record_queue_name", &self.dead_record_queue_name)
            .field("dead_message_queue_name", &self.dead_message_queue_name)
            .field("max_concurrency", &self.max_concurrency)
            .field("source_stream_name", &self.source_stream_name)
            .finish()
    }
}

impl ConsumerConfig {
    /// Checks the scalar invariants the builder enforces.
    ///
    /// The fields are public, so a configuration can be assembled without
    /// the builder; [`StreamConsumer::new`](crate::StreamConsumer::new)
    /// re-checks through this before any record is processed.
    pub fn validate(&self) -> Result<(), ConsumerError> {
        if self.task_tracking_name.is_empty() {
            return Err(ConsumerError::configuration(
                "task tracking attribute name cannot be empty",
            ));
        }
        if !(self.timeout_fraction > 0.0 && self.timeout_fraction <= 1.0) {
            return Err(ConsumerError::configuration(format!(
                "timeout fraction must be within (0.0, 1.0], got {}",
                self.timeout_fraction
            )));
        }
        if self.max_attempts == 0 {
            return Err(ConsumerError::configuration(
                "max attempts must be a positive integer",
            ));
        }
        Ok(())
    }

    /// Starts building a configuration for the given stream type.
    pub fn builder(stream_type: StreamType) -> ConsumerConfigBuilder {
        ConsumerConfigBuilder {
            stream_type,
            task_tracking_name: DEFAULT_TASK_TRACKING_NAME.to_string(),
            timeout_fraction: DEFAULT_TIMEOUT_FRACTION,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            dead_record_queue_name: None,
            dead_message_queue_name: None,
            max_concurrency: None,
            source_stream_name: None,
            extractor: None,
            unusable_record_handler: None,
            rejected_message_handler: None,
            resubmitter: None,
        }
    }
}

/// Builder for [`ConsumerConfig`].
///
/// All four collaborators and both dead-letter destinations are required;
/// [`ConsumerConfigBuilder::build`] validates everything eagerly so a
/// misconfigured consumer halts before any record is processed.
pub struct ConsumerConfigBuilder {
    stream_type: StreamType,
    task_tracking_name: String,
    timeout_fraction: f64,
    max_attempts: u32,
    dead_record_queue_name: Option<DestinationName>,
    dead_message_queue_name: Option<DestinationName>,
    max_concurrency: Option<usize>,
    source_stream_name: Option<DestinationName>,
    extractor: Option<Arc<dyn MessageExtractor>>,
    unusable_record_handler: Option<Arc<dyn UnusableRecordHandler>>,
    rejected_message_handler: Option<Arc<dyn RejectedMessageHandler>>,
    resubmitter: Option<Arc<dyn IncompleteMessageResubmitter>>,
}

impl ConsumerConfigBuilder {
    /// Sets the message body attribute name carrying task tracking.
    pub fn task_tracking_name(mut self, name: impl Into<String>) -> Self {
        self.task_tracking_name = name.into();
        self
    }

    /// Sets the soft deadline fraction.
    pub fn timeout_fraction(mut self, fraction: f64) -> Self {
        self.timeout_fraction = fraction;
        self
    }

    /// Sets the attempt limit.
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the dead record queue destination.
    pub fn dead_record_queue_name(mut self, name: impl Into<DestinationName>) -> Self {
        self.dead_record_queue_name = Some(name.into());
        self
    }

    /// Sets the dead message queue destination.
    pub fn dead_message_queue_name(mut self, name: impl Into<DestinationName>) -> Self {
        self.dead_message_queue_name = Some(name.into());
        self
    }

    /// Caps the number of concurrently executing tasks.
    pub fn max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = Some(max_concurrency);
        self
    }

    /// Overrides the resubmission destination derived from the records.
    pub fn source_stream_name(mut self, name: impl Into<DestinationName>) -> Self {
        self.source_stream_name = Some(name.into());
        self
    }

    /// Sets the extraction collaborator.
    pub fn extractor(mut self, extractor: Arc<dyn MessageExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    /// Sets the dead record queue collaborator.
    pub fn unusable_record_handler(mut self, handler: Arc<dyn UnusableRecordHandler>) -> Self {
        self.unusable_record_handler = Some(handler);
        self
    }

    /// Sets the dead message queue collaborator.
    pub fn rejected_message_handler(mut self, handler: Arc<dyn RejectedMessageHandler>) -> Self {
        self.rejected_message_handler = Some(handler);
        self
    }

    /// Sets the resubmission collaborator.
    pub fn resubmitter(mut self, resubmitter: Arc<dyn IncompleteMessageResubmitter>) -> Self {
        self.resubmitter = Some(resubmitter);
        self
    }

    /// Validates and finalizes the configuration.
    pub fn build(self) -> Result<ConsumerConfig, ConsumerError> {
        let dead_record_queue_name = self
            .dead_record_queue_name
            .ok_or_else(|| ConsumerError::configuration("dead record queue name is required"))?;
        let dead_message_queue_name = self
            .dead_message_queue_name
            .ok_or_else(|| ConsumerError::configuration("dead message queue name is required"))?;
        let extractor = self
            .extractor
            .ok_or_else(|| ConsumerError::configuration("message extractor is required"))?;
        let unusable_record_handler = self.unusable_record_handler.ok_or_else(|| {
            ConsumerError::configuration("unusable record handler is required")
        })?;
        let rejected_message_handler = self.rejected_message_handler.ok_or_else(|| {
            ConsumerError::configuration("rejected message handler is required")
        })?;
        let resubmitter = self
            .resubmitter
            .ok_or_else(|| ConsumerError::configuration("message resubmitter is required"))?;

        let config = ConsumerConfig {
            stream_type: self.stream_type,
            task_tracking_name: self.task_tracking_name,
            timeout_fraction: self.timeout_fraction,
            max_attempts: self.max_attempts,
            dead_record_queue_name,
            dead_message_queue_name,
            max_concurrency: self.max_concurrency,
            source_stream_name: self.source_stream_name,
            extractor,
            unusable_record_handler,
            rejected_message_handler,
            resubmitter,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Per-invocation context passed by reference to every component.
#[derive(Debug, Clone)]
pub struct ConsumerContext {
    /// The invocation's configuration
    pub config: Arc<ConsumerConfig>,
    /// The origin stream name resolved from the event (or the configured
    /// override); `None` when no record carried a recognizable source ARN
    pub source_stream_name: Option<DestinationName>,
}

impl ConsumerContext {
    /// Creates a new context.
    pub fn new(config: Arc<ConsumerConfig>, source_stream_name: Option<DestinationName>) -> Self {
        Self {
            config,
            source_stream_name,
        }
    }
}
