//! Lambda event surface for stream batches.
//!
//! The consumer is handed the raw Lambda event for a Kinesis or DynamoDB
//! stream batch. Records are kept as raw JSON values end to end (the
//! orchestration engine treats them opaquely and only the extraction
//! collaborator interprets them), but this module knows the AWS wire shapes
//! well enough to pull out source ARNs and decode record payloads for the
//! default extractor.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::Value;

use crate::config::{ConsumerContext, MessageExtractor, StreamType};
use crate::error::ConsumerError;

/// A Lambda stream batch event: the ordered records of one shard delivery.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamEvent {
    /// The raw records, in shard order
    #[serde(rename = "Records", default)]
    pub records: Vec<Value>,
}

impl StreamEvent {
    /// Creates an event from raw records; mostly useful in tests.
    pub fn from_records(records: Vec<Value>) -> Self {
        Self { records }
    }

    /// Resolves the source stream name shared by this event's records.
    ///
    /// Taken from the first record carrying a recognizable
    /// `eventSourceARN`.
    pub fn source_stream_name(&self) -> Option<String> {
        self.records
            .iter()
            .filter_map(|r| record_event_source_arn(r))
            .find_map(stream_name_from_arn)
    }
}

/// Returns the record's `eventSourceARN`, if present.
pub fn record_event_source_arn(record: &Value) -> Option<&str> {
    record.get("eventSourceARN").and_then(Value::as_str)
}

/// Returns the record's `eventID`, if present. Used for logging only.
pub fn record_event_id(record: &Value) -> Option<&str> {
    record.get("eventID").and_then(Value::as_str)
}

/// Extracts the stream (or table) name from an event source ARN.
///
/// Handles both supported shapes:
/// - `arn:aws:kinesis:<region>:<account>:stream/<name>`
/// - `arn:aws:dynamodb:<region>:<account>:table/<name>/stream/<label>`
pub fn stream_name_from_arn(arn: &str) -> Option<String> {
    if !arn.starts_with("arn:") {
        return None;
    }
    if let Some(rest) = arn.split(":stream/").nth(1) {
        return Some(rest.to_string());
    }
    if let Some(rest) = arn.split(":table/").nth(1) {
        let name = rest.split('/').next()?;
        if name.is_empty() {
            return None;
        }
        return Some(name.to_string());
    }
    None
}

/// Typed view of a Kinesis record's payload section.
#[derive(Debug, Clone, Deserialize)]
pub struct KinesisPayload {
    /// Base64-encoded record data
    pub data: String,
    /// The record's partition key
    #[serde(rename = "partitionKey", default)]
    pub partition_key: Option<String>,
    /// The record's sequence number within its shard
    #[serde(rename = "sequenceNumber", default)]
    pub sequence_number: Option<String>,
}

/// The default extraction collaborator: decodes the record payload into a
/// JSON message body.
///
/// For Kinesis records the base64 `kinesis.data` blob is decoded and parsed
/// as JSON; for DynamoDB stream records the `dynamodb.NewImage` attribute
/// map is lifted as-is. Any prior task tracking embedded in the body by a
/// previous resubmission survives unchanged and is merged downstream.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonMessageExtractor;

impl MessageExtractor for JsonMessageExtractor {
    fn extract(&self, record: &Value, ctx: &ConsumerContext) -> Result<Value, ConsumerError> {
        match ctx.config.stream_type {
            StreamType::Kinesis => {
                let payload: KinesisPayload = record
                    .get("kinesis")
                    .cloned()
                    .ok_or_else(|| {
                        ConsumerError::extraction("record has no 'kinesis' payload section")
                    })
                    .and_then(|v| {
                        serde_json::from_value(v).map_err(|e| {
                            ConsumerError::extraction(format!("malformed kinesis payload: {e}"))
                        })
                    })?;
                let bytes = BASE64.decode(payload.data.as_bytes()).map_err(|e| {
                    ConsumerError::extraction(format!("record data is not valid base64: {e}"))
                })?;
                serde_json::from_slice(&bytes).map_err(|e| {
                    ConsumerError::extraction(format!("record data is not valid JSON: {e}"))
                })
            }
            StreamType::DynamoDb => record
                .get("dynamodb")
                .and_then(|d| d.get("NewImage"))
                .cloned()
                .ok_or_else(|| {
                    ConsumerError::extraction("record has no 'dynamodb.NewImage' section")
                }),
        }
    }
}
