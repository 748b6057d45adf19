//! Core types shared by the session components.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter for session-minted correlation ids. Process-wide so minted ids
/// never collide across sessions.
static NEXT_AUTOGEN: AtomicU64 = AtomicU64::new(1);

/// Opaque token linking a submitted operation to its later events.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CorrelationId {
    /// Minted by the library.
    Autogen(u64),
    /// Caller-supplied integer value.
    Int(i64),
    /// Caller-supplied name.
    Name(String),
}

impl CorrelationId {
    /// Mint a fresh, process-unique id.
    pub fn new() -> Self {
        CorrelationId::Autogen(NEXT_AUTOGEN.fetch_add(1, Ordering::Relaxed))
    }

    pub fn from_int(value: i64) -> Self {
        CorrelationId::Int(value)
    }

    pub fn named(name: impl Into<String>) -> Self {
        CorrelationId::Name(name.into())
    }

    pub fn is_autogen(&self) -> bool {
        matches!(self, CorrelationId::Autogen(_))
    }

    /// Stable hash of the id, used to pin an id to a dispatcher worker.
    pub fn partition_hash(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        match self {
            CorrelationId::Autogen(v) => {
                hasher.update(&[0]);
                hasher.update(&v.to_le_bytes());
            }
            CorrelationId::Int(v) => {
                hasher.update(&[1]);
                hasher.update(&v.to_le_bytes());
            }
            CorrelationId::Name(name) => {
                hasher.update(&[2]);
                hasher.update(name.as_bytes());
            }
        }
        hasher.finalize()
    }

    /// Worker index for this id in a pool of `workers` threads.
    pub fn partition(&self, workers: usize) -> usize {
        if workers <= 1 {
            0
        } else {
            self.partition_hash() as usize % workers
        }
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CorrelationId({})", self)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrelationId::Autogen(v) => write!(f, "autogen:{}", v),
            CorrelationId::Int(v) => write!(f, "int:{}", v),
            CorrelationId::Name(name) => write!(f, "name:{}", name),
        }
    }
}

impl From<i64> for CorrelationId {
    fn from(value: i64) -> Self {
        CorrelationId::Int(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(name: &str) -> Self {
        CorrelationId::Name(name.to_string())
    }
}

/// Opaque authorization handle forwarded to the transport untouched.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity(pub String);

impl Identity {
    pub fn new(name: impl Into<String>) -> Self {
        Identity(name.into())
    }
}

/// Handle to a backend service, e.g. `//blp/mktdata`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
}

impl Service {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Service names have the form `//namespace/service`.
    pub fn is_valid_name(name: &str) -> bool {
        match name.strip_prefix("//") {
            Some(rest) => {
                let mut parts = rest.split('/');
                matches!(
                    (parts.next(), parts.next(), parts.next()),
                    (Some(ns), Some(svc), None) if !ns.is_empty() && !svc.is_empty()
                )
            }
            None => false,
        }
    }
}

/// An ad-hoc request. The payload schema belongs to the service.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Request {
    pub service: String,
    pub operation: String,
    pub payload: serde_json::Value,
}

impl Request {
    pub fn new(service: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            operation: operation.into(),
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Category of an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Template availability and other administrative status.
    Admin,
    SessionStatus,
    SubscriptionStatus,
    SubscriptionData,
    ServiceStatus,
    RequestStatus,
    PartialResponse,
    Response,
    /// No event arrived before a poll deadline.
    Timeout,
}

/// Type of a single message within an event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    SessionStarted,
    SessionStartupFailure,
    SessionTerminated,
    SessionConnectionUp,
    SessionConnectionDown,
    SubscriptionStarted,
    SubscriptionFailure,
    SubscriptionTerminated,
    ServiceUp,
    ServiceDown,
    RequestTemplateAvailable,
    RequestTemplatePending,
    RequestTemplateTerminated,
    RequestFailure,
    /// Payload-bearing message, named by the service schema.
    Data(String),
}

/// A single message, tagged with the correlation ids it belongs to.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub message_type: MessageType,
    pub correlation_ids: Vec<CorrelationId>,
    pub payload: serde_json::Value,
    /// Set on the status message confirming a resubscription.
    pub resubscription_id: Option<i64>,
}

impl Message {
    pub fn new(message_type: MessageType, correlation_ids: Vec<CorrelationId>) -> Self {
        Self {
            message_type,
            correlation_ids,
            payload: serde_json::Value::Null,
            resubscription_id: None,
        }
    }

    /// Status message for a single correlation id.
    pub fn status(message_type: MessageType, id: CorrelationId) -> Self {
        Self::new(message_type, vec![id])
    }

    /// Data message for a single correlation id.
    pub fn data(name: impl Into<String>, id: CorrelationId, payload: serde_json::Value) -> Self {
        Self::new(MessageType::Data(name.into()), vec![id]).with_payload(payload)
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// A batch of messages delivered together.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub messages: Vec<Message>,
}

impl Event {
    pub fn new(kind: EventKind, messages: Vec<Message>) -> Self {
        Self { kind, messages }
    }

    /// Sentinel returned by a poll that timed out.
    pub fn timeout() -> Self {
        Self {
            kind: EventKind::Timeout,
            messages: Vec::new(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == EventKind::Timeout
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Message> {
        self.messages.iter()
    }

    /// Distinct correlation ids carried by this event, in first-seen order.
    pub fn correlation_ids(&self) -> Vec<CorrelationId> {
        let mut ids: Vec<CorrelationId> = Vec::new();
        for id in self.messages.iter().flat_map(|m| m.correlation_ids.iter()) {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        ids
    }
}
