//! Correlation id lifecycle.
//!
//! Every operation in flight on a session is identified by a
//! [`CorrelationId`](crate::types::CorrelationId). The registry records the
//! operation each id belongs to and guarantees that no two live operations
//! share an id. Ids are released when the operation's terminal event is
//! routed, or when the operation is cancelled.

mod registry;

pub use registry::{CorrelationRegistry, OperationContext, OperationKind};
