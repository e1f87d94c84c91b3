//! The event record exchanged between agents and the core.
//!
//! An [`Event`] is built once by its emitter and then handed to the
//! dispatcher by value; handlers only ever see `&Event`. A handler that wants
//! to forward a changed event builds a new one (usually from a clone).

use crate::error::EventError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Wildcard matching any emitter (as an agent filter) or any event id.
pub const ALL: &str = "ALL";

/// Emitter name used for events the core originates itself.
pub const CORE_EMITTER: &str = "core";

/// Id of the terminal event enqueued by [`Dispatcher::shutdown`](crate::dispatcher::Dispatcher::shutdown).
pub const SHUTDOWN_ID: &str = "shutdown";

/// Event kinds; the dispatcher branches on these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Message,
    UserMessage,
    Command,
    Subscribe,
    Unsubscribe,
    Shutdown,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::UserMessage => "usermessage",
            Self::Command => "command",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::Shutdown => "shutdown",
        }
    }

    fn needs_agent_filter(self) -> bool {
        matches!(self, Self::Subscribe | Self::Unsubscribe)
    }
}

impl FromStr for EventKind {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "message" => Ok(Self::Message),
            "usermessage" => Ok(Self::UserMessage),
            "command" => Ok(Self::Command),
            "subscribe" => Ok(Self::Subscribe),
            "unsubscribe" => Ok(Self::Unsubscribe),
            "shutdown" => Ok(Self::Shutdown),
            _ => Err(EventError::InvalidEventKind(s.to_string())),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A routed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "EventRecord", into = "EventRecord")]
pub struct Event {
    id: String,
    body: Value,
    kind: EventKind,
    agent_filter: String,
    user: String,
    data: Map<String, Value>,
    emitter: String,
    is_agent_event: bool,
}

impl Event {
    /// Create an event of `kind` emitted by `emitter`.
    ///
    /// Subscribe and unsubscribe events need an agent filter; use
    /// [`Event::subscribe`] / [`Event::unsubscribe`] for those.
    pub fn new(
        id: impl Into<String>,
        kind: EventKind,
        emitter: impl Into<String>,
    ) -> Result<Self, EventError> {
        Self::with_filter(id, kind, String::new(), emitter)
    }

    /// Create an event from loosely-typed parts, validating the kind name.
    pub fn from_parts(
        id: impl Into<String>,
        kind: &str,
        agent_filter: impl Into<String>,
        emitter: impl Into<String>,
    ) -> Result<Self, EventError> {
        let kind = kind.parse::<EventKind>()?;
        Self::with_filter(id, kind, agent_filter, emitter)
    }

    fn with_filter(
        id: impl Into<String>,
        kind: EventKind,
        agent_filter: impl Into<String>,
        emitter: impl Into<String>,
    ) -> Result<Self, EventError> {
        let id = id.into();
        let agent_filter = agent_filter.into();
        let emitter = emitter.into();

        if id.is_empty() {
            return Err(EventError::EmptyId);
        }
        if kind.needs_agent_filter() && agent_filter.is_empty() {
            return Err(EventError::MissingAgentFilter {
                kind: kind.to_string(),
                id,
            });
        }

        let is_agent_event = emitter != CORE_EMITTER;
        Ok(Self {
            id,
            body: Value::String(String::new()),
            kind,
            agent_filter,
            user: String::new(),
            data: Map::new(),
            emitter,
            is_agent_event,
        })
    }

    /// A plain message event carrying `body`.
    pub fn message(
        id: impl Into<String>,
        body: impl Into<Value>,
        emitter: impl Into<String>,
    ) -> Result<Self, EventError> {
        Ok(Self::new(id, EventKind::Message, emitter)?.with_body(body))
    }

    /// A command event: `line` is the raw command text.
    pub fn command(
        line: impl Into<String>,
        user: impl Into<String>,
        emitter: impl Into<String>,
    ) -> Self {
        let emitter = emitter.into();
        Self {
            id: "command".to_string(),
            body: Value::String(line.into()),
            kind: EventKind::Command,
            agent_filter: String::new(),
            user: user.into(),
            data: Map::new(),
            is_agent_event: emitter != CORE_EMITTER,
            emitter,
        }
    }

    /// Subscribe `emitter` to events with `id` coming from `agent_filter`.
    pub fn subscribe(
        id: impl Into<String>,
        agent_filter: impl Into<String>,
        emitter: impl Into<String>,
    ) -> Result<Self, EventError> {
        Self::with_filter(id, EventKind::Subscribe, agent_filter, emitter)
    }

    /// Remove the subscription made by the matching [`Event::subscribe`].
    pub fn unsubscribe(
        id: impl Into<String>,
        agent_filter: impl Into<String>,
        emitter: impl Into<String>,
    ) -> Result<Self, EventError> {
        Self::with_filter(id, EventKind::Unsubscribe, agent_filter, emitter)
    }

    /// Subscription to the terminal shutdown event, from any emitter.
    pub fn subscribe_shutdown(emitter: impl Into<String>) -> Self {
        let emitter = emitter.into();
        Self {
            id: SHUTDOWN_ID.to_string(),
            body: Value::String(String::new()),
            kind: EventKind::Subscribe,
            agent_filter: ALL.to_string(),
            user: String::new(),
            data: Map::new(),
            is_agent_event: emitter != CORE_EMITTER,
            emitter,
        }
    }

    /// The terminal event enqueued at shutdown.
    pub fn shutdown() -> Self {
        Self {
            id: SHUTDOWN_ID.to_string(),
            body: Value::String(String::new()),
            kind: EventKind::Shutdown,
            agent_filter: String::new(),
            user: String::new(),
            data: Map::new(),
            emitter: CORE_EMITTER.to_string(),
            is_agent_event: false,
        }
    }

    /// Deserialize an event carried inside another event's data.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    // ── Construction-time setters ───────────────────────────────────────────

    pub fn with_body(mut self, body: impl Into<Value>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = data;
        self
    }

    pub fn with_data_entry(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    // ── Accessors ───────────────────────────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    /// The body as text, if it is a string.
    pub fn body_str(&self) -> Option<&str> {
        self.body.as_str()
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn agent_filter(&self) -> &str {
        &self.agent_filter
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    pub fn emitter(&self) -> &str {
        &self.emitter
    }

    pub fn is_agent_event(&self) -> bool {
        self.is_agent_event
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = match &self.body {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        write!(
            f,
            "emitter: '{}' id: '{}' event: '{}' kind: '{}' agent: '{}' user: '{}' data: '{}' agentevent: '{}'",
            self.emitter,
            self.id,
            body,
            self.kind,
            self.agent_filter,
            self.user,
            Value::Object(self.data.clone()),
            self.is_agent_event
        )
    }
}

/// Wire/config form of an [`Event`]; validated on the way in.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EventRecord {
    id: String,
    #[serde(default = "empty_body")]
    body: Value,
    #[serde(default = "default_kind")]
    kind: String,
    #[serde(default)]
    agent_filter: String,
    #[serde(default)]
    user: String,
    #[serde(default)]
    data: Map<String, Value>,
    #[serde(default = "default_emitter")]
    emitter: String,
}

fn empty_body() -> Value {
    Value::String(String::new())
}

fn default_kind() -> String {
    EventKind::Message.as_str().to_string()
}

fn default_emitter() -> String {
    CORE_EMITTER.to_string()
}

impl TryFrom<EventRecord> for Event {
    type Error = EventError;

    fn try_from(record: EventRecord) -> Result<Self, Self::Error> {
        Ok(
            Event::from_parts(record.id, &record.kind, record.agent_filter, record.emitter)?
                .with_body(record.body)
                .with_user(record.user)
                .with_data(record.data),
        )
    }
}

impl From<Event> for EventRecord {
    fn from(event: Event) -> Self {
        Self {
            id: event.id,
            body: event.body,
            kind: event.kind.as_str().to_string(),
            agent_filter: event.agent_filter,
            user: event.user,
            data: event.data,
            emitter: event.emitter,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_parsing() {
        assert_eq!("message".parse::<EventKind>(), Ok(EventKind::Message));
        assert_eq!("UserMessage".parse::<EventKind>(), Ok(EventKind::UserMessage));
        assert_eq!(
            "broadcast".parse::<EventKind>(),
            Err(EventError::InvalidEventKind("broadcast".to_string()))
        );
    }

    #[test]
    fn test_from_parts_rejects_unknown_kind() {
        let err = Event::from_parts("x", "eventtype2", "", "agent").unwrap_err();
        assert_eq!(err, EventError::InvalidEventKind("eventtype2".to_string()));
    }

    #[test]
    fn test_subscribe_requires_filter() {
        let err = Event::subscribe("sensor", "", "lights").unwrap_err();
        assert!(matches!(err, EventError::MissingAgentFilter { .. }));

        let err = Event::from_parts("sensor", "unsubscribe", "", "lights").unwrap_err();
        assert!(matches!(err, EventError::MissingAgentFilter { .. }));

        let ok = Event::subscribe("sensor", ALL, "lights").unwrap();
        assert_eq!(ok.kind(), EventKind::Subscribe);
        assert_eq!(ok.agent_filter(), ALL);
    }

    #[test]
    fn test_empty_id_rejected() {
        assert_eq!(
            Event::new("", EventKind::Message, "a").unwrap_err(),
            EventError::EmptyId
        );
    }

    #[test]
    fn test_agent_event_flag() {
        let ev = Event::message("id", "hi", "xmpp").unwrap();
        assert!(ev.is_agent_event());
        let ev = Event::message("id", "hi", CORE_EMITTER).unwrap();
        assert!(!ev.is_agent_event());
        assert!(!Event::shutdown().is_agent_event());
    }

    #[test]
    fn test_display_lists_every_field() {
        let ev = Event::message("eventid1", "event1", "tester")
            .unwrap()
            .with_user("bob@home")
            .with_data_entry("node", "porch");
        let dump = ev.to_string();
        for needle in [
            "emitter: 'tester'",
            "id: 'eventid1'",
            "event: 'event1'",
            "kind: 'message'",
            "agent: ''",
            "user: 'bob@home'",
            "\"node\":\"porch\"",
            "agentevent: 'true'",
        ] {
            assert!(dump.contains(needle), "missing {needle} in {dump}");
        }
    }

    #[test]
    fn test_serde_roundtrip_through_data() {
        let reply = Event::message("console", "", "console").unwrap();
        let carrier = Event::command("list", "bob", "console")
            .with_data_entry("returnevent", reply.to_value());

        let back = Event::from_value(carrier.data()["returnevent"].clone()).unwrap();
        assert_eq!(back, reply);
    }

    #[test]
    fn test_deserialize_defaults() {
        let ev: Event = serde_json::from_value(json!({
            "id": "openzwave",
            "body": "healNetwork"
        }))
        .unwrap();
        assert_eq!(ev.kind(), EventKind::Message);
        assert_eq!(ev.emitter(), CORE_EMITTER);
        assert!(ev.data().is_empty());

        let bad = serde_json::from_value::<Event>(json!({"id": "x", "kind": "nope"}));
        assert!(bad.is_err());
    }
}
