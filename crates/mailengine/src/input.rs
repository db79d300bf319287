//! JSON-lines delivery input.
//!
//! Each line is either an envelope `{"topic", "subscription", "body"}` or a
//! bare event, which is routed to its kind's topic with the provider name as
//! subscription.

use mailengine_core::{Delivery, EventKind, MessageId};
use serde_json::{Map, Value};

const UNKNOWN: &str = "unknown";

/// Turns one input line into a first delivery.
///
/// Lines that are not JSON objects are still delivered, so the pipeline
/// dead-letters them like any other malformed payload.
pub fn parse_line(line: &str) -> Delivery {
    let Ok(Value::Object(mut object)) = serde_json::from_str::<Value>(line) else {
        return Delivery::new(UNKNOWN, UNKNOWN, line);
    };

    // Bare send events carry a `body` too, but always with a `kind`.
    if object.contains_key("body") && !object.contains_key("kind") {
        let topic = take_string(&mut object, "topic");
        let subscription = take_string(&mut object, "subscription");
        let body = match object.remove("body") {
            Some(Value::String(raw)) => raw,
            Some(Value::Object(mut event)) => {
                stamp_message_id(&mut event);
                Value::Object(event).to_string()
            }
            Some(other) => other.to_string(),
            None => String::new(),
        };
        let topic = topic.unwrap_or_else(|| topic_of(&body));
        let subscription = subscription.unwrap_or_else(|| UNKNOWN.to_string());
        return Delivery::new(topic, subscription, body);
    }

    stamp_message_id(&mut object);
    let subscription = object
        .get("provider_type")
        .and_then(Value::as_str)
        .map_or_else(|| UNKNOWN.to_string(), str::to_ascii_lowercase);
    let body = Value::Object(object).to_string();
    Delivery::new(topic_of(&body), subscription, body)
}

fn take_string(object: &mut Map<String, Value>, key: &str) -> Option<String> {
    match object.remove(key) {
        Some(Value::String(s)) if !s.is_empty() => Some(s),
        _ => None,
    }
}

/// Assigns a message ID to events that arrive without one, so every
/// redelivery of the line carries the same identity.
fn stamp_message_id(event: &mut Map<String, Value>) {
    if !event.contains_key("message_id") {
        event.insert(
            "message_id".to_string(),
            Value::String(MessageId::new().to_string()),
        );
    }
}

/// Topic for a raw event, from its kind tag.
fn topic_of(body: &str) -> String {
    let tag = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("kind")?.as_str().map(str::to_string));

    tag.as_deref()
        .and_then(EventKind::topic_for_tag)
        .unwrap_or(UNKNOWN)
        .to_string()
}
