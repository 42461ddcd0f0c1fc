//! Message types for the Pusher protocol.
//!
//! Every frame on the wire is a JSON object with an `event` name, an optional
//! `channel` and an optional `data` field. Server-originated protocol events
//! carry their `data` as a JSON-encoded string, as Pusher clients expect.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

use crate::codec::ProtocolError;

/// Event names used by the protocol.
pub mod events {
    pub const CONNECTION_ESTABLISHED: &str = "pusher:connection_established";
    pub const SUBSCRIBE: &str = "pusher:subscribe";
    pub const UNSUBSCRIBE: &str = "pusher:unsubscribe";
    pub const PING: &str = "pusher:ping";
    pub const PONG: &str = "pusher:pong";
    pub const SIGNIN: &str = "pusher:signin";
    pub const SIGNIN_SUCCESS: &str = "pusher:signin_success";
    pub const ERROR: &str = "pusher:error";
    pub const SUBSCRIPTION_SUCCEEDED: &str = "pusher_internal:subscription_succeeded";
    pub const MEMBER_ADDED: &str = "pusher_internal:member_added";
    pub const MEMBER_REMOVED: &str = "pusher_internal:member_removed";

    /// Prefix of protocol-control events.
    pub const PROTOCOL_PREFIX: &str = "pusher:";
    /// Prefix of server-internal protocol events.
    pub const INTERNAL_PREFIX: &str = "pusher_internal:";
    /// Prefix of peer-to-peer client events.
    pub const CLIENT_PREFIX: &str = "client-";
}

/// Error and close codes.
///
/// See <https://pusher.com/docs/channels/library_auth_reference/pusher-websockets-protocol#error-codes>.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
#[repr(u16)]
pub enum ErrorCode {
    /// Generic error, also used for malformed input.
    Generic = 4000,
    /// No application matches the requested key.
    AppNotFound = 4001,
    /// The client requested an unsupported protocol version.
    UnsupportedProtocol = 4007,
    /// Signature or origin check failed.
    Unauthorized = 4009,
    /// The application reached its connection capacity.
    OverCapacity = 4100,
    /// The client stopped answering pings.
    PongTimeout = 4201,
}

impl ErrorCode {
    /// The numeric code.
    #[must_use]
    pub fn code(self) -> u16 {
        self as u16
    }
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> u16 {
        code as u16
    }
}

impl TryFrom<u16> for ErrorCode {
    type Error = &'static str;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            4000 => Ok(ErrorCode::Generic),
            4001 => Ok(ErrorCode::AppNotFound),
            4007 => Ok(ErrorCode::UnsupportedProtocol),
            4009 => Ok(ErrorCode::Unauthorized),
            4100 => Ok(ErrorCode::OverCapacity),
            4201 => Ok(ErrorCode::PongTimeout),
            _ => Err("Invalid error code"),
        }
    }
}

/// Classification of an inbound event name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind<'a> {
    Subscribe,
    Unsubscribe,
    Ping,
    Pong,
    Signin,
    /// A `pusher:` or `pusher_internal:` event the server does not handle.
    UnsupportedProtocol(&'a str),
    /// A `client-` event.
    Client(&'a str),
    /// Anything else.
    Unknown(&'a str),
}

impl<'a> EventKind<'a> {
    /// Classify an event name.
    #[must_use]
    pub fn of(event: &'a str) -> Self {
        match event {
            events::SUBSCRIBE => EventKind::Subscribe,
            events::UNSUBSCRIBE => EventKind::Unsubscribe,
            events::PING => EventKind::Ping,
            events::PONG => EventKind::Pong,
            events::SIGNIN => EventKind::Signin,
            _ if event.starts_with(events::PROTOCOL_PREFIX)
                || event.starts_with(events::INTERNAL_PREFIX) =>
            {
                EventKind::UnsupportedProtocol(event)
            }
            _ if event.starts_with(events::CLIENT_PREFIX) => EventKind::Client(event),
            _ => EventKind::Unknown(event),
        }
    }
}

/// A protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PusherMessage {
    /// Event name.
    pub event: String,
    /// Target channel, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Event payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl PusherMessage {
    /// Create a message with an event name and optional channel and data.
    #[must_use]
    pub fn new(event: impl Into<String>, channel: Option<String>, data: Option<Value>) -> Self {
        Self {
            event: event.into(),
            channel,
            data,
        }
    }

    /// Classify this message's event.
    #[must_use]
    pub fn kind(&self) -> EventKind<'_> {
        EventKind::of(&self.event)
    }

    /// Decode the `data` field into a typed payload.
    ///
    /// Clients send `data` either as an object or as a JSON-encoded string;
    /// both are accepted.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` is missing or does not match `T`.
    pub fn decode_data<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        match &self.data {
            Some(Value::String(raw)) => Ok(serde_json::from_str(raw)?),
            Some(value) => Ok(T::deserialize(value)?),
            None => Err(ProtocolError::Invalid(format!(
                "Missing data for event {}",
                self.event
            ))),
        }
    }

    /// `pusher:connection_established`.
    #[must_use]
    pub fn connection_established(socket_id: &str, activity_timeout: u64) -> Self {
        Self::new(
            events::CONNECTION_ESTABLISHED,
            None,
            Some(encoded(json!({
                "socket_id": socket_id,
                "activity_timeout": activity_timeout,
            }))),
        )
    }

    /// `pusher_internal:subscription_succeeded`.
    ///
    /// Public and private channels carry an empty object; presence channels
    /// carry the member roster.
    #[must_use]
    pub fn subscription_succeeded(channel: &str, presence: Option<PresenceData>) -> Self {
        let data = match presence {
            Some(presence) => json!({ "presence": presence }),
            None => json!({}),
        };
        Self::new(
            events::SUBSCRIPTION_SUCCEEDED,
            Some(channel.to_string()),
            Some(encoded(data)),
        )
    }

    /// `pusher_internal:member_added`.
    #[must_use]
    pub fn member_added(channel: &str, user_id: &str, user_info: &Value) -> Self {
        Self::new(
            events::MEMBER_ADDED,
            Some(channel.to_string()),
            Some(encoded(json!({
                "user_id": user_id,
                "user_info": user_info,
            }))),
        )
    }

    /// `pusher_internal:member_removed`.
    #[must_use]
    pub fn member_removed(channel: &str, user_id: &str) -> Self {
        Self::new(
            events::MEMBER_REMOVED,
            Some(channel.to_string()),
            Some(encoded(json!({ "user_id": user_id }))),
        )
    }

    /// `pusher:signin_success`.
    #[must_use]
    pub fn signin_success(user_data: &str) -> Self {
        Self::new(
            events::SIGNIN_SUCCESS,
            None,
            Some(json!({ "user_data": user_data })),
        )
    }

    /// `pusher:pong`.
    #[must_use]
    pub fn pong() -> Self {
        Self::new(events::PONG, None, Some(encoded(json!({}))))
    }

    /// `pusher:error`.
    #[must_use]
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(
            events::ERROR,
            None,
            Some(json!({
                "code": code.code(),
                "message": message.into(),
            })),
        )
    }

    /// An application event on a channel, as produced by the REST API.
    #[must_use]
    pub fn channel_event(event: impl Into<String>, channel: &str, data: Value) -> Self {
        Self::new(event, Some(channel.to_string()), Some(data))
    }
}

fn encoded(value: Value) -> Value {
    Value::String(value.to_string())
}

/// Payload of `pusher:subscribe`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeData {
    pub channel: String,
    #[serde(default)]
    pub auth: Option<String>,
    /// Raw JSON of the presence member, exactly as signed.
    #[serde(default)]
    pub channel_data: Option<String>,
}

/// Payload of `pusher:unsubscribe`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnsubscribeData {
    pub channel: String,
}

/// Payload of `pusher:signin`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SigninData {
    pub user_data: String,
    pub auth: String,
}

/// The decoded `channel_data` of a presence subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelData {
    /// Either a string or a number on the wire.
    pub user_id: Value,
    #[serde(default)]
    pub user_info: Option<Value>,
}

impl ChannelData {
    /// The user id normalized to a string.
    ///
    /// Returns `None` if the id is neither a string nor a number, or empty.
    #[must_use]
    pub fn user_id(&self) -> Option<String> {
        match &self.user_id {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// The user info, or `null` when absent.
    #[must_use]
    pub fn user_info(&self) -> Value {
        self.user_info.clone().unwrap_or(Value::Null)
    }
}

/// The presence roster sent with `subscription_succeeded`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceData {
    pub ids: Vec<String>,
    pub hash: BTreeMap<String, Value>,
    pub count: usize,
}

impl PresenceData {
    /// Build the roster payload from a `user_id -> user_info` map.
    #[must_use]
    pub fn from_roster(roster: &BTreeMap<String, Value>) -> Self {
        Self {
            ids: roster.keys().cloned().collect(),
            hash: roster.clone(),
            count: roster.len(),
        }
    }
}
