//! # Market Link
//!
//! Client session core for a market-data and request/response backend.
//!
//! ## Core Concepts
//!
//! - **Session**: Owns the connection lifecycle and every in-flight operation
//! - **Correlation ids**: Tokens linking each operation to its events
//! - **Subscriptions**: Streaming topics with a confirmed/pending state machine
//! - **Request templates**: Pre-bound snapshot requests that can be resent
//! - **Dispatch**: Events reach a handler pool, or a queue polled by the caller
//!
//! The wire protocol lives behind the [`Transport`] trait; the session only
//! submits [`Operation`]s and routes the events pushed back into its
//! [`EventSink`].
//!
//! ## Example
//!
//! ```ignore
//! use marketlink::{LoopbackTransport, Session, SessionOptions, SubscriptionList,
//!     SubscriptionPreprocessMode};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let transport = Arc::new(LoopbackTransport::new());
//! let session = Session::new(SessionOptions::default(), transport, None, None)?;
//! session.start();
//!
//! let mut list = SubscriptionList::new();
//! list.add("IBM US Equity?fields=LAST_PRICE", None);
//! session.subscribe(&list, None, "", SubscriptionPreprocessMode::FailOnFirstError)?;
//!
//! let event = session.next_event(Duration::from_millis(500))?;
//! session.stop();
//! ```

pub mod correlation;
pub mod dispatch;
pub mod error;
pub mod session;
pub mod shutdown;
pub mod subscriptions;
pub mod templates;
pub mod transport;
pub mod types;

// Re-exports
pub use correlation::{CorrelationRegistry, OperationContext, OperationKind};
pub use dispatch::{EventDispatcherConfig, EventHandler, EventQueue};
pub use error::{Result, SessionError};
pub use session::{Session, SessionOptions, SessionState};
pub use shutdown::{stop_all, ShutdownGuard};
pub use subscriptions::{
    PreprocessErrorCode, SubscriptionEntry, SubscriptionList, SubscriptionManager,
    SubscriptionPreprocessError, SubscriptionPreprocessMode, SubscriptionState, Topic,
};
pub use templates::{RequestTemplate, RequestTemplateCache, TemplateState};
pub use transport::{
    EventSink, LoopbackTransport, Operation, SubscriptionRequest, Transport, TransportError,
};
pub use types::*;
