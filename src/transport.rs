//! Boundary to the transport that carries operations to the backend.
//!
//! The session never encodes anything itself. It hands an [`Operation`] to a
//! [`Transport`] and learns about the outcome only through events the
//! transport pushes back into the session's [`EventSink`].

use crate::session::SessionInner;
use crate::subscriptions::Topic;
use crate::types::{
    CorrelationId, Event, EventKind, Identity, Message, MessageType, Request,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;
use thiserror::Error;

/// Failure status reported by a transport for a submitted operation.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("transport error {code}: {description}")]
pub struct TransportError {
    pub code: i32,
    pub description: String,
}

impl TransportError {
    pub fn new(code: i32, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }
}

/// A subscription entry as submitted to the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionRequest {
    pub correlation_id: CorrelationId,
    pub topic: Topic,
}

/// Operation descriptor submitted to the transport.
#[derive(Clone, Debug)]
pub enum Operation {
    Subscribe {
        subscriptions: Vec<SubscriptionRequest>,
        identity: Option<Identity>,
        label: String,
    },
    Unsubscribe {
        correlation_ids: Vec<CorrelationId>,
    },
    Resubscribe {
        subscriptions: Vec<SubscriptionRequest>,
        resubscription_id: Option<i64>,
        label: String,
    },
    SendRequest {
        correlation_id: CorrelationId,
        request: Request,
        identity: Option<Identity>,
        label: String,
    },
    CreateRequestTemplate {
        correlation_id: CorrelationId,
        subscription: Topic,
        identity: Option<Identity>,
    },
    SendRequestTemplate {
        template: CorrelationId,
        correlation_id: CorrelationId,
    },
    SetStatusCorrelationId {
        service: String,
        correlation_id: CorrelationId,
        identity: Option<Identity>,
    },
    Cancel {
        correlation_ids: Vec<CorrelationId>,
    },
}

/// Connection to the backend.
///
/// Implementations deliver every inbound event through the [`EventSink`]
/// given to `connect`, starting with a session status event
/// (`SessionStarted` or `SessionStartupFailure`).
pub trait Transport: Send + Sync {
    fn connect(&self, sink: EventSink) -> Result<(), TransportError>;

    fn submit(&self, operation: Operation) -> Result<(), TransportError>;

    fn disconnect(&self);
}

/// Entry point for inbound events.
///
/// Holds only a weak reference to its session: events delivered after the
/// session is gone are dropped.
#[derive(Clone)]
pub struct EventSink {
    session: Weak<SessionInner>,
}

impl EventSink {
    pub(crate) fn new(session: Weak<SessionInner>) -> Self {
        Self { session }
    }

    /// Route an inbound event. Returns false if the session is gone.
    pub fn deliver(&self, event: Event) -> bool {
        match self.session.upgrade() {
            Some(session) => {
                session.route(event);
                true
            }
            None => false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.session.strong_count() > 0
    }
}

/// In-process transport that records submitted operations.
///
/// Confirms session start and stop on its own; everything else is left to
/// the owner, who feeds events back with [`LoopbackTransport::deliver`].
pub struct LoopbackTransport {
    sink: Mutex<Option<EventSink>>,
    operations: Mutex<Vec<Operation>>,
    rejection: Mutex<Option<TransportError>>,
    fail_startup: AtomicBool,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self {
            sink: Mutex::new(None),
            operations: Mutex::new(Vec::new()),
            rejection: Mutex::new(None),
            fail_startup: AtomicBool::new(false),
        }
    }

    /// Report `SessionStartupFailure` instead of `SessionStarted` on connect.
    pub fn failing_startup() -> Self {
        let transport = Self::new();
        transport.fail_startup.store(true, Ordering::Relaxed);
        transport
    }

    /// Reject every following submission with `code`.
    pub fn reject_with(&self, code: i32, description: impl Into<String>) {
        *self.rejection.lock() = Some(TransportError::new(code, description));
    }

    /// Accept submissions again.
    pub fn accept(&self) {
        *self.rejection.lock() = None;
    }

    /// Operations submitted so far.
    pub fn operations(&self) -> Vec<Operation> {
        self.operations.lock().clone()
    }

    pub fn take_operations(&self) -> Vec<Operation> {
        std::mem::take(&mut *self.operations.lock())
    }

    /// Push an inbound event into the connected session.
    pub fn deliver(&self, event: Event) -> bool {
        let sink = self.sink.lock().clone();
        match sink {
            Some(sink) => sink.deliver(event),
            None => false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.sink.lock().is_some()
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for LoopbackTransport {
    fn connect(&self, sink: EventSink) -> Result<(), TransportError> {
        *self.sink.lock() = Some(sink.clone());

        let status = if self.fail_startup.load(Ordering::Relaxed) {
            MessageType::SessionStartupFailure
        } else {
            MessageType::SessionStarted
        };
        sink.deliver(Event::new(
            EventKind::SessionStatus,
            vec![Message::new(status, Vec::new())],
        ));
        Ok(())
    }

    fn submit(&self, operation: Operation) -> Result<(), TransportError> {
        if let Some(error) = self.rejection.lock().clone() {
            return Err(error);
        }
        self.operations.lock().push(operation);
        Ok(())
    }

    fn disconnect(&self) {
        let sink = self.sink.lock().take();
        if let Some(sink) = sink {
            sink.deliver(Event::new(
                EventKind::SessionStatus,
                vec![Message::new(MessageType::SessionTerminated, Vec::new())],
            ));
        }
    }
}
