//! Snapshot request templates.
//!
//! A template caches a subscription expression on the server side so that
//! repeated snapshot requests are served with low latency. Its availability
//! cycles between `Pending` and `Available` as the backing connection
//! changes, and ends in `Terminated`.

mod cache;

pub use cache::{RequestTemplate, RequestTemplateCache, TemplateState, TemplateTransition};
