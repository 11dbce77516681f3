// ABOUTME: Normalized message event and the inbound signals a transport produces
// ABOUTME: Backends turn raw protocol payloads into these shapes before dispatch

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A matched, non-self-authored chat message handed to a `respond` handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEvent {
    /// Sender in the backend's display form (nick, user name, resource)
    pub from: String,
    /// Where a reply should go, in a form `say` accepts
    pub target: String,
    /// Full message text
    pub message: String,
    /// Backend payload the event was built from
    pub raw: Value,
}

impl MessageEvent {
    pub fn new(
        from: impl Into<String>,
        target: impl Into<String>,
        message: impl Into<String>,
        raw: Value,
    ) -> Self {
        Self {
            from: from.into(),
            target: target.into(),
            message: message.into(),
            raw,
        }
    }
}

/// One protocol event, keyed by the backend's event-type name
/// (`PRIVMSG` for IRC, `message` or `channel_created` for Slack, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub event_type: String,
    pub payload: Value,
}

impl InboundEvent {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
        }
    }
}

/// What a transport reports to the serve loop that owns it.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportSignal {
    /// A protocol event to observe and dispatch
    Event(InboundEvent),
    /// The connection is gone; the reason is logged before reconnecting
    Disconnected(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_event_serializes_lowercase_fields() {
        let event = MessageEvent::new("alice", "#general", "hi", json!({"ts": "1"}));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["from"], "alice");
        assert_eq!(value["target"], "#general");
        assert_eq!(value["message"], "hi");
        assert_eq!(value["raw"]["ts"], "1");
    }
}
