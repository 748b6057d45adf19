//! Event delivery.
//!
//! A session delivers events in one of two modes, fixed at construction:
//!
//! - **Handler**: a pool of dispatcher threads invokes the registered
//!   handler. Each correlation id is pinned to a worker by its stable hash,
//!   and every worker drains a FIFO queue, so events for one id are handled
//!   in the order they were generated. A message carrying ids of several
//!   workers is handled by the lowest of them while the others wait at the
//!   same point of their queues. Events for ids on different workers have
//!   no relative order.
//! - **Polling**: events accumulate in an [`EventQueue`] that the
//!   application drains with `next_event` / `try_next_event`.
//!
//! Requests may also name their own [`EventQueue`], in which case their
//! events bypass both.

mod dispatcher;
mod queue;

pub use dispatcher::{EventDispatcherConfig, EventHandler};
pub(crate) use dispatcher::EventDispatcher;
pub use queue::EventQueue;

use std::cell::Cell;

thread_local! {
    /// Id of the session whose dispatcher owns the current thread.
    static DISPATCHING: Cell<Option<u64>> = const { Cell::new(None) };
}

/// Whether the current thread is one of `session_id`'s dispatcher threads.
pub(crate) fn is_dispatching(session_id: u64) -> bool {
    DISPATCHING.with(|current| current.get() == Some(session_id))
}

fn set_dispatching(session_id: Option<u64>) {
    DISPATCHING.with(|current| current.set(session_id));
}
