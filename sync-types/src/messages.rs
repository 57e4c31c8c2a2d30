//! Wire envelopes.
//!
//! Every frame is a JSON array whose first element names the command:
//!
//! ```text
//! client -> relay   ["EVENT", event] | ["REQ", sub_id, filter...] | ["CLOSE", sub_id]
//! relay -> client   ["EVENT", sub_id, event] | ["EOSE", sub_id]
//!                   ["OK", event_id, accepted, message] | ["NOTICE", message]
//!                   ["CLOSED", sub_id, message]
//! ```

use serde_json::Value;

use crate::{Event, Filter, SubscriptionId, SyncError};

/// Frames a client sends to a relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Publish an event
    Event(Event),
    /// Open a subscription
    Req {
        /// Subscription to open
        subscription_id: SubscriptionId,
        /// Filters, OR-ed together by the relay
        filters: Vec<Filter>,
    },
    /// Close a subscription
    Close(SubscriptionId),
}

/// Frames a relay sends to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    /// An event matching a subscription
    Event {
        /// Subscription the event answers
        subscription_id: SubscriptionId,
        /// The event
        event: Event,
    },
    /// End of stored events for a subscription
    Eose(SubscriptionId),
    /// Command result for a published event
    Ok {
        /// Id of the published event
        event_id: String,
        /// Whether the relay accepted it
        status: bool,
        /// Free-text reason
        message: String,
    },
    /// Human-readable notice
    Notice(String),
    /// Subscription closed by the relay
    Closed {
        /// Subscription that was closed
        subscription_id: SubscriptionId,
        /// Free-text reason
        message: String,
    },
}

fn invalid(msg: &str) -> SyncError {
    SyncError::InvalidMessage(msg.to_string())
}

fn str_at<'a>(arr: &'a [Value], index: usize, what: &str) -> Result<&'a str, SyncError> {
    arr.get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| invalid(&format!("missing {}", what)))
}

fn parse_array(text: &str) -> Result<Vec<Value>, SyncError> {
    match serde_json::from_str::<Value>(text)? {
        Value::Array(arr) => Ok(arr),
        _ => Err(invalid("frame is not a JSON array")),
    }
}

impl ClientMessage {
    /// Encode as a JSON text frame.
    pub fn to_json(&self) -> Result<String, SyncError> {
        let frame = match self {
            ClientMessage::Event(event) => {
                Value::Array(vec![Value::from("EVENT"), serde_json::to_value(event)?])
            }
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                let mut arr = vec![Value::from("REQ"), Value::from(subscription_id.as_str())];
                for filter in filters {
                    arr.push(serde_json::to_value(filter)?);
                }
                Value::Array(arr)
            }
            ClientMessage::Close(subscription_id) => Value::Array(vec![
                Value::from("CLOSE"),
                Value::from(subscription_id.as_str()),
            ]),
        };
        Ok(frame.to_string())
    }

    /// Decode a JSON text frame.
    pub fn from_json(text: &str) -> Result<Self, SyncError> {
        let arr = parse_array(text)?;
        match str_at(&arr, 0, "command")? {
            "EVENT" => {
                let event = arr.get(1).cloned().ok_or_else(|| invalid("missing event"))?;
                Ok(ClientMessage::Event(serde_json::from_value(event)?))
            }
            "REQ" => {
                let subscription_id = str_at(&arr, 1, "subscription id")?.into();
                let filters = arr[2..]
                    .iter()
                    .cloned()
                    .map(serde_json::from_value)
                    .collect::<Result<Vec<Filter>, _>>()?;
                Ok(ClientMessage::Req {
                    subscription_id,
                    filters,
                })
            }
            "CLOSE" => Ok(ClientMessage::Close(
                str_at(&arr, 1, "subscription id")?.into(),
            )),
            other => Err(SyncError::UnknownMessageType(other.to_string())),
        }
    }
}

impl RelayMessage {
    /// Encode as a JSON text frame.
    pub fn to_json(&self) -> Result<String, SyncError> {
        let frame = match self {
            RelayMessage::Event {
                subscription_id,
                event,
            } => Value::Array(vec![
                Value::from("EVENT"),
                Value::from(subscription_id.as_str()),
                serde_json::to_value(event)?,
            ]),
            RelayMessage::Eose(subscription_id) => Value::Array(vec![
                Value::from("EOSE"),
                Value::from(subscription_id.as_str()),
            ]),
            RelayMessage::Ok {
                event_id,
                status,
                message,
            } => Value::Array(vec![
                Value::from("OK"),
                Value::from(event_id.as_str()),
                Value::from(*status),
                Value::from(message.as_str()),
            ]),
            RelayMessage::Notice(message) => {
                Value::Array(vec![Value::from("NOTICE"), Value::from(message.as_str())])
            }
            RelayMessage::Closed {
                subscription_id,
                message,
            } => Value::Array(vec![
                Value::from("CLOSED"),
                Value::from(subscription_id.as_str()),
                Value::from(message.as_str()),
            ]),
        };
        Ok(frame.to_string())
    }

    /// Decode a JSON text frame.
    pub fn from_json(text: &str) -> Result<Self, SyncError> {
        let arr = parse_array(text)?;
        match str_at(&arr, 0, "command")? {
            "EVENT" => {
                let subscription_id = str_at(&arr, 1, "subscription id")?.into();
                let event = arr.get(2).cloned().ok_or_else(|| invalid("missing event"))?;
                Ok(RelayMessage::Event {
                    subscription_id,
                    event: serde_json::from_value(event)?,
                })
            }
            "EOSE" => Ok(RelayMessage::Eose(str_at(&arr, 1, "subscription id")?.into())),
            "OK" => {
                let event_id = str_at(&arr, 1, "event id")?.to_string();
                let status = arr
                    .get(2)
                    .and_then(Value::as_bool)
                    .ok_or_else(|| invalid("missing status"))?;
                let message = arr.get(3).and_then(Value::as_str).unwrap_or("").to_string();
                Ok(RelayMessage::Ok {
                    event_id,
                    status,
                    message,
                })
            }
            "NOTICE" => Ok(RelayMessage::Notice(
                arr.get(1).and_then(Value::as_str).unwrap_or("").to_string(),
            )),
            "CLOSED" => Ok(RelayMessage::Closed {
                subscription_id: str_at(&arr, 1, "subscription id")?.into(),
                message: arr.get(2).and_then(Value::as_str).unwrap_or("").to_string(),
            }),
            other => Err(SyncError::UnknownMessageType(other.to_string())),
        }
    }
}
