//! Shared helpers for integration tests: recording collaborators and event
//! builders.

#![allow(dead_code)]

use std::sync::{Arc, Mutex, Once};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Value};

use aws_stream_consumer::{
    ConsumerConfig, ConsumerConfigBuilder, ConsumerContext, ConsumerError, DeadMessageEnvelope,
    DestinationName, IncompleteMessageResubmitter, JsonMessageExtractor, RejectedMessageHandler,
    StreamEvent, StreamType, UnusableRecordHandler,
};

/// Installs a tracing subscriber for test output, once per process.
///
/// Filtering follows `RUST_LOG`; output goes through the test writer so it
/// is captured per test.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Records every boundary call so tests can assert on exactly what left the
/// engine.
#[derive(Default)]
pub struct RecordingCollaborators {
    pub dead_records: Mutex<Vec<Vec<Value>>>,
    pub dead_messages: Mutex<Vec<Vec<DeadMessageEnvelope>>>,
    pub resubmissions: Mutex<Vec<(Vec<Value>, DestinationName)>>,
    pub fail_resubmit: bool,
}

impl RecordingCollaborators {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_resubmit() -> Arc<Self> {
        Arc::new(Self {
            fail_resubmit: true,
            ..Self::default()
        })
    }

    /// All resubmitted message bodies across every call, flattened.
    pub fn resubmitted_bodies(&self) -> Vec<Value> {
        self.resubmissions
            .lock()
            .unwrap()
            .iter()
            .flat_map(|(bodies, _)| bodies.clone())
            .collect()
    }

    /// All dead message envelopes across every call, flattened.
    pub fn dead_message_envelopes(&self) -> Vec<DeadMessageEnvelope> {
        self.dead_messages
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .cloned()
            .collect()
    }

    /// All dead records across every call, flattened.
    pub fn dead_record_values(&self) -> Vec<Value> {
        self.dead_records
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl UnusableRecordHandler for RecordingCollaborators {
    async fn discard(&self, records: &[Value], _: &ConsumerContext) -> Result<(), ConsumerError> {
        if !records.is_empty() {
            self.dead_records.lock().unwrap().push(records.to_vec());
        }
        Ok(())
    }
}

#[async_trait]
impl RejectedMessageHandler for RecordingCollaborators {
    async fn discard(
        &self,
        envelopes: &[DeadMessageEnvelope],
        _: &ConsumerContext,
    ) -> Result<(), ConsumerError> {
        if !envelopes.is_empty() {
            self.dead_messages.lock().unwrap().push(envelopes.to_vec());
        }
        Ok(())
    }
}

#[async_trait]
impl IncompleteMessageResubmitter for RecordingCollaborators {
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

/// A config builder wired to the default extractor and the given recorders,
/// with both dead letter destinations set.
pub fn config_builder(recorder: Arc<RecordingCollaborators>) -> ConsumerConfigBuilder {
    ConsumerConfig::builder(StreamType::Kinesis)
        .dead_record_queue_name("orders-DRQ")
        .dead_message_queue_name("orders-DMQ")
        .extractor(Arc::new(JsonMessageExtractor))
        .unusable_record_handler(recorder.clone())
        .rejected_message_handler(recorder.clone())
        .resubmitter(recorder)
}

pub const ORDERS_ARN: &str = "arn:aws:kinesis:us-east-1:123456789012:stream/orders";

/// Builds a realistic Kinesis record carrying `body` base64-encoded in its
/// data blob.
pub fn kinesis_record(body: &Value) -> Value {
    json!({
        "eventID": format!("shardId-000000000000:{}", body["id"]),
        "eventName": "aws:kinesis:record",
        "eventSourceARN": ORDERS_ARN,
        "kinesis": {
            "data": BASE64.encode(serde_json::to_vec(body).unwrap()),
            "partitionKey": "pk-1",
            "sequenceNumber": "49590338271490256608559692538361571095921575989136588898"
        }
    })
}

/// Builds a stream event from message bodies.
pub fn kinesis_event(bodies: &[Value]) -> StreamEvent {
    StreamEvent::from_records(bodies.iter().map(kinesis_record).collect())
}

/// Rebuilds a stream event from previously resubmitted message bodies, the
/// way a real resubmission lands back on the shard.
pub fn redelivery_event(resubmitted_bodies: &[Value]) -> StreamEvent {
    kinesis_event(resubmitted_bodies)
}
