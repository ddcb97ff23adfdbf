//! Client and relay wire frames. Both directions are JSON arrays whose
//! first element names the frame type.

use crate::{Error, Event, Filter};
use serde_json::{json, Value};

/// Frames sent from this client to a relay.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Req { sub_id: String, filters: Vec<Filter> },
    Close { sub_id: String },
}

impl ClientMessage {
    pub fn encode(&self) -> String {
        match self {
            ClientMessage::Req { sub_id, filters } => {
                let mut frame = vec![json!("REQ"), json!(sub_id)];
                frame.extend(
                    filters
                        .iter()
                        .map(|f| serde_json::to_value(f).expect("filters serialize to JSON")),
                );
                Value::Array(frame).to_string()
            }
            ClientMessage::Close { sub_id } => json!(["CLOSE", sub_id]).to_string(),
        }
    }
}

/// Frames received from a relay. Frame types this client does not consume
/// parse to `Unknown` and are dropped by the connection task.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    Event { sub_id: String, event: Event },
    Eose { sub_id: String },
    Closed { sub_id: String, message: String },
    Notice { message: String },
    Unknown,
}

impl RelayMessage {
    pub fn parse(text: &str) -> crate::Result<Self> {
        let frame: Value = serde_json::from_str(text)?;
        let Some(frame) = frame.as_array() else {
            return Err(Error::Protocol("relay frame is not an array"));
        };
        let kind = frame
            .first()
            .and_then(Value::as_str)
            .ok_or(Error::Protocol("relay frame has no type"))?;
        let sub_id = |frame: &[Value]| {
            frame
                .get(1)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or(Error::Protocol("relay frame has no subscription id"))
        };

        Ok(match kind {
            "EVENT" => {
                let event = frame
                    .get(2)
                    .cloned()
                    .ok_or(Error::Protocol("EVENT frame has no event"))?;
                RelayMessage::Event {
                    sub_id: sub_id(frame)?,
                    event: serde_json::from_value(event)?,
                }
            }
            "EOSE" => RelayMessage::Eose {
                sub_id: sub_id(frame)?,
            },
            "CLOSED" => RelayMessage::Closed {
                sub_id: sub_id(frame)?,
                message: frame
                    .get(2)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            },
            "NOTICE" => RelayMessage::Notice {
                message: frame
                    .get(1)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            },
            _ => RelayMessage::Unknown,
        })
    }
}
