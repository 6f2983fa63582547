//! Wire messages exchanged with relays.

use crate::error::{ClientError, Result};
use nostr::{Event, Filter};
use serde_json::{Value, json};

/// Message received from a relay.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    /// `["EVENT", subscription_id, event]`
    Event(String, Event),
    /// `["OK", event_id, accepted, message]`
    Ok(String, bool, String),
    /// `["EOSE", subscription_id]`
    Eose(String),
    /// `["NOTICE", message]`
    Notice(String),
    /// `["AUTH", challenge]`
    Auth(String),
    /// `["CLOSED", subscription_id, message]`
    Closed(String, String),
}

impl RelayMessage {
    /// Only `EVENT` and `EOSE` reach the event bus.
    pub fn is_dispatched(&self) -> bool {
        matches!(self, Self::Event(..) | Self::Eose(_))
    }
}

/// Message sent to a relay.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage<'a> {
    /// `["EVENT", event]`
    Event(&'a Event),
    /// `["REQ", subscription_id, filter]`
    Req(&'a str, &'a Filter),
    /// `["CLOSE", subscription_id]`
    Close(&'a str),
}

impl ClientMessage<'_> {
    pub fn to_json(&self) -> Result<String> {
        let value = match self {
            Self::Event(event) => json!(["EVENT", event]),
            Self::Req(subscription_id, filter) => json!(["REQ", subscription_id, filter]),
            Self::Close(subscription_id) => json!(["CLOSE", subscription_id]),
        };
        Ok(serde_json::to_string(&value)?)
    }
}

/// Parse relay protocol JSON text message into typed relay message.
///
/// Returns `Ok(None)` for empty arrays and unknown tags.
pub fn parse_relay_message(text: &str) -> Result<Option<RelayMessage>> {
    let value: Value = serde_json::from_str(text)?;
    let array = value
        .as_array()
        .ok_or_else(|| ClientError::Protocol("expected JSON array relay message".to_string()))?;
    let Some(first) = array.first() else {
        return Ok(None);
    };

    let kind = first
        .as_str()
        .ok_or_else(|| ClientError::Protocol("missing relay message kind".to_string()))?;

    match kind {
        "EVENT" => {
            if array.len() < 3 {
                return Err(ClientError::Protocol("invalid EVENT message".to_string()));
            }
            let subscription_id = string_field(&array[1], "invalid EVENT subscription id")?;
            let event: Event = serde_json::from_value(array[2].clone()).map_err(|error| {
                ClientError::Protocol(format!("invalid EVENT payload: {}", error))
            })?;
            Ok(Some(RelayMessage::Event(subscription_id, event)))
        }
        "OK" => {
            if array.len() < 4 {
                return Err(ClientError::Protocol("invalid OK message".to_string()));
            }
            let event_id = string_field(&array[1], "invalid OK event id")?;
            let accepted = array[2]
                .as_bool()
                .ok_or_else(|| ClientError::Protocol("invalid OK accepted flag".to_string()))?;
            let message = string_field(&array[3], "invalid OK message text")?;
            Ok(Some(RelayMessage::Ok(event_id, accepted, message)))
        }
        "EOSE" => {
            if array.len() < 2 {
                return Err(ClientError::Protocol("invalid EOSE message".to_string()));
            }
            let subscription_id = string_field(&array[1], "invalid EOSE subscription id")?;
            Ok(Some(RelayMessage::Eose(subscription_id)))
        }
        "NOTICE" => {
            if array.len() < 2 {
                return Err(ClientError::Protocol("invalid NOTICE message".to_string()));
            }
            let message = string_field(&array[1], "invalid NOTICE message text")?;
            Ok(Some(RelayMessage::Notice(message)))
        }
        "AUTH" => {
            if array.len() < 2 {
                return Err(ClientError::Protocol("invalid AUTH message".to_string()));
            }
            let challenge = string_field(&array[1], "invalid AUTH challenge")?;
            Ok(Some(RelayMessage::Auth(challenge)))
        }
        "CLOSED" => {
            if array.len() < 2 {
                return Err(ClientError::Protocol("invalid CLOSED message".to_string()));
            }
            let subscription_id = string_field(&array[1], "invalid CLOSED subscription id")?;
            let message = match array.get(2) {
                Some(value) => string_field(value, "invalid CLOSED message text")?,
                None => String::new(),
            };
            Ok(Some(RelayMessage::Closed(subscription_id, message)))
        }
        _ => Ok(None),
    }
}

fn string_field(value: &Value, error: &str) -> Result<String> {
    value
        .as_str()
        .map(ToString::to_string)
        .ok_or_else(|| ClientError::Protocol(error.to_string()))
}
