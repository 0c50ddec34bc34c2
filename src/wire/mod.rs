//! Batched array wire format shared by the websocket and the fallback poller.
//!
//! Every batch is a JSON array of messages and every message is itself an
//! array whose first element is a correlation id. Id `0` marks a control
//! message; any other id refers to a delivery waiting for acknowledgement.
//!
//! ```text
//! [0, 0, "time", 1718000000000]             time sync
//! [0, 0, "_sub", ["cast", {"room": 1}]]     subscribe
//! [0, 0, "_unsub", ["cast"]]                unsubscribe
//! [17, 4210, "stat", {"k": "v"}]            delivery
//! [17]                                      ack (server -> client)
//! [0, "_not", "cast", {"state": "play"}]    notification (server -> client)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Correlation id reserved for control traffic.
pub const CONTROL_ID: u64 = 0;

const TIME_TAG: &str = "time";
const SUBSCRIBE_TAG: &str = "_sub";
const UNSUBSCRIBE_TAG: &str = "_unsub";
const NOTIFICATION_TAG: &str = "_not";
/// Long-form notification tag some servers emit.
const NOTIFICATION_TAG_LONG: &str = "notification";

/// Errors raised while decoding inbound traffic.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("batch must be a JSON array")]
    NotABatch,

    #[error("message must be a non-empty JSON array")]
    NotAMessage,

    #[error("invalid correlation id: {0}")]
    InvalidCorrelationId(Value),

    #[error("control message is missing its `{0}` field")]
    MissingField(&'static str),
}

/// A message the client sends to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    TimeSync {
        client_epoch_ms: i64,
    },
    Subscribe {
        channel: String,
        initial_query: Value,
    },
    Unsubscribe {
        channel: String,
    },
    Delivery {
        correlation_id: u64,
        elapsed_ms: u64,
        queue: String,
        payload: Value,
    },
}

impl OutboundMessage {
    pub fn time_sync(now: DateTime<Utc>) -> Self {
        Self::TimeSync {
            client_epoch_ms: now.timestamp_millis(),
        }
    }

    pub fn correlation_id(&self) -> u64 {
        match self {
            Self::Delivery { correlation_id, .. } => *correlation_id,
            _ => CONTROL_ID,
        }
    }

    pub fn is_control(&self) -> bool {
        self.correlation_id() == CONTROL_ID
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::TimeSync { client_epoch_ms } => json!([CONTROL_ID, 0, TIME_TAG, client_epoch_ms]),
            Self::Subscribe {
                channel,
                initial_query,
            } => json!([CONTROL_ID, 0, SUBSCRIBE_TAG, [channel, initial_query]]),
            Self::Unsubscribe { channel } => json!([CONTROL_ID, 0, UNSUBSCRIBE_TAG, [channel]]),
            Self::Delivery {
                correlation_id,
                elapsed_ms,
                queue,
                payload,
            } => json!([correlation_id, elapsed_ms, queue, payload]),
        }
    }
}

/// Push notification addressed to a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub channel: String,
    pub payload: Value,
}

/// A message the server sends back to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Acknowledges the delivery carrying `correlation_id`.
    Ack { correlation_id: u64, data: Vec<Value> },
    Notification(Notification),
    /// Control message with a tag this client does not act on.
    Control { tag: String, rest: Vec<Value> },
}

impl InboundMessage {
    pub fn from_value(value: &Value) -> Result<Self, WireError> {
        let fields = match value.as_array() {
            Some(fields) if !fields.is_empty() => fields,
            _ => return Err(WireError::NotAMessage),
        };

        let correlation_id = fields[0]
            .as_u64()
            .ok_or_else(|| WireError::InvalidCorrelationId(fields[0].clone()))?;

        if correlation_id != CONTROL_ID {
            return Ok(Self::Ack {
                correlation_id,
                data: fields[1..].to_vec(),
            });
        }

        // The tag sits in the second slot for server pushes and in the third
        // slot when the server mirrors the client's `[0, 0, tag, ..]` layout.
        let tag_index = (1..fields.len().min(3))
            .find(|&i| fields[i].is_string())
            .ok_or(WireError::MissingField("tag"))?;
        let tag = fields[tag_index].as_str().unwrap_or_default();
        let rest = &fields[tag_index + 1..];

        match tag {
            NOTIFICATION_TAG | NOTIFICATION_TAG_LONG => {
                let channel = rest
                    .first()
                    .and_then(Value::as_str)
                    .ok_or(WireError::MissingField("channel"))?;
                Ok(Self::Notification(Notification {
                    channel: channel.to_string(),
                    payload: rest.get(1).cloned().unwrap_or(Value::Null),
                }))
            }
            _ => Ok(Self::Control {
                tag: tag.to_string(),
                rest: rest.to_vec(),
            }),
        }
    }
}

/// Result of decoding one inbound batch. Malformed entries are counted and
/// skipped so one bad message never poisons its neighbours.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DecodedBatch {
    pub messages: Vec<InboundMessage>,
    pub malformed: usize,
}

pub fn encode_batch(messages: &[OutboundMessage]) -> Value {
    Value::Array(messages.iter().map(OutboundMessage::to_value).collect())
}

pub fn encode_batch_text(messages: &[OutboundMessage]) -> String {
    encode_batch(messages).to_string()
}

pub fn decode_entries(entries: &[Value]) -> DecodedBatch {
    let mut batch = DecodedBatch::default();
    for entry in entries {
        match InboundMessage::from_value(entry) {
            Ok(message) => batch.messages.push(message),
            Err(e) => {
                tracing::debug!("Dropping malformed inbound message {entry}: {e}");
                batch.malformed += 1;
            }
        }
    }
    batch
}

pub fn decode_batch(value: &Value) -> Result<DecodedBatch, WireError> {
    value
        .as_array()
        .map(|entries| decode_entries(entries))
        .ok_or(WireError::NotABatch)
}

pub fn decode_batch_text(text: &str) -> Result<DecodedBatch, WireError> {
    let value: Value = serde_json::from_str(text)?;
    decode_batch(&value)
}

/// Body of a fallback poll request.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PollRequest {
    pub events: Vec<Value>,
}

/// Body of a fallback poll response.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PollResponse {
    #[serde(default)]
    pub completed: Vec<Value>,
}
