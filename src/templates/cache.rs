//! Request template cache and availability state machine.

use crate::error::{Result, SessionError};
use crate::types::{CorrelationId, Message, MessageType};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Availability of a request template.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateState {
    /// Requests are accepted without a latency guarantee.
    Pending,
    /// Requests are served from the server-side cache.
    Available,
    /// Absorbing; no further requests are accepted.
    Terminated,
}

struct TemplateInner {
    state: TemplateState,
    bound_connection: Option<serde_json::Value>,
    outstanding: HashSet<CorrelationId>,
    released: bool,
}

struct TemplateEntry {
    token: CorrelationId,
    subscription: String,
    inner: Mutex<TemplateInner>,
}

/// Handle to a snapshot request template.
#[derive(Clone)]
pub struct RequestTemplate {
    entry: Arc<TemplateEntry>,
}

impl RequestTemplate {
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.entry.token
    }

    pub fn subscription_string(&self) -> &str {
        &self.entry.subscription
    }

    pub fn state(&self) -> TemplateState {
        self.entry.inner.lock().state
    }

    /// Connection the template was last bound to, as reported by the
    /// server when it became available.
    pub fn bound_connection(&self) -> Option<serde_json::Value> {
        self.entry.inner.lock().bound_connection.clone()
    }

    pub fn outstanding_requests(&self) -> usize {
        self.entry.inner.lock().outstanding.len()
    }

    /// Whether the cache has let go of the template's resources.
    pub fn is_released(&self) -> bool {
        self.entry.inner.lock().released
    }
}

impl fmt::Debug for RequestTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestTemplate")
            .field("correlation_id", &self.entry.token)
            .field("subscription", &self.entry.subscription)
            .field("state", &self.state())
            .finish()
    }
}

/// Effect of a status message on a template.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TemplateTransition {
    /// Whether the status message should reach the consumer.
    pub deliver: bool,
    /// Whether this message terminated the template.
    pub terminated: bool,
    /// Requests that were outstanding at termination and must fail.
    pub failed_requests: Vec<CorrelationId>,
}

/// Live request templates of a session, by correlation id.
pub struct RequestTemplateCache {
    templates: RwLock<HashMap<CorrelationId, Arc<TemplateEntry>>>,
}

impl RequestTemplateCache {
    pub fn new() -> Self {
        Self {
            templates: RwLock::new(HashMap::new()),
        }
    }

    /// Track a new template in `Pending`.
    pub fn create(&self, token: CorrelationId, subscription: impl Into<String>) -> RequestTemplate {
        let entry = Arc::new(TemplateEntry {
            token: token.clone(),
            subscription: subscription.into(),
            inner: Mutex::new(TemplateInner {
                state: TemplateState::Pending,
                bound_connection: None,
                outstanding: HashSet::new(),
                released: false,
            }),
        });
        self.templates.write().insert(token, Arc::clone(&entry));
        RequestTemplate { entry }
    }

    pub fn get(&self, token: &CorrelationId) -> Option<RequestTemplate> {
        self.templates
            .read()
            .get(token)
            .map(|entry| RequestTemplate {
                entry: Arc::clone(entry),
            })
    }

    /// Whether `template` is a live template of this cache.
    pub fn owns(&self, template: &RequestTemplate) -> bool {
        self.templates
            .read()
            .get(&template.entry.token)
            .map_or(false, |entry| Arc::ptr_eq(entry, &template.entry))
    }

    /// Apply a status message addressed to template `token`.
    pub fn on_status(&self, token: &CorrelationId, message: &Message) -> TemplateTransition {
        let Some(entry) = self.templates.read().get(token).cloned() else {
            return TemplateTransition::default();
        };

        match message.message_type {
            MessageType::RequestTemplateTerminated => match self.terminate(token) {
                Some(failed_requests) => TemplateTransition {
                    deliver: true,
                    terminated: true,
                    failed_requests,
                },
                None => TemplateTransition::default(),
            },
            MessageType::RequestTemplateAvailable | MessageType::RequestTemplatePending => {
                let mut inner = entry.inner.lock();
                if inner.state == TemplateState::Terminated {
                    return TemplateTransition::default();
                }
                if message.message_type == MessageType::RequestTemplateAvailable {
                    inner.state = TemplateState::Available;
                    inner.bound_connection = Some(message.payload.clone());
                } else {
                    inner.state = TemplateState::Pending;
                }
                tracing::debug!(token = %token, state = ?inner.state, "Request template transition");
                TemplateTransition {
                    deliver: true,
                    ..Default::default()
                }
            }
            _ => TemplateTransition {
                deliver: true,
                ..Default::default()
            },
        }
    }

    /// Record a request sent through `template`.
    pub fn begin_request(&self, template: &RequestTemplate, request: &CorrelationId) -> Result<()> {
        let mut inner = template.entry.inner.lock();
        if inner.state == TemplateState::Terminated {
            return Err(SessionError::InvalidState(format!(
                "request template {} is terminated",
                template.entry.token
            )));
        }
        inner.outstanding.insert(request.clone());
        Ok(())
    }

    /// A request sent through template `token` completed or was cancelled.
    pub fn request_completed(&self, token: &CorrelationId, request: &CorrelationId) {
        if let Some(entry) = self.templates.read().get(token) {
            entry.inner.lock().outstanding.remove(request);
        }
    }

    /// Terminate a template. Returns the requests that were outstanding, or
    /// `None` if the template is unknown or already terminated.
    pub fn terminate(&self, token: &CorrelationId) -> Option<Vec<CorrelationId>> {
        let entry = self.templates.write().remove(token)?;
        let mut inner = entry.inner.lock();
        if inner.state == TemplateState::Terminated {
            return None;
        }
        inner.state = TemplateState::Terminated;
        let failed: Vec<CorrelationId> = inner.outstanding.drain().collect();
        inner.released = true;
        tracing::debug!(token = %token, failed = failed.len(), "Request template terminated");
        Some(failed)
    }

    /// Drop a template without emitting anything (rollback of a rejected
    /// creation).
    pub fn remove(&self, token: &CorrelationId) {
        if let Some(entry) = self.templates.write().remove(token) {
            let mut inner = entry.inner.lock();
            inner.state = TemplateState::Terminated;
            inner.released = true;
        }
    }

    /// Release every template; used when the owning session goes away.
    pub fn clear(&self) {
        for (_, entry) in self.templates.write().drain() {
            let mut inner = entry.inner.lock();
            inner.state = TemplateState::Terminated;
            inner.outstanding.clear();
            inner.released = true;
        }
    }

    pub fn template_count(&self) -> usize {
        self.templates.read().len()
    }
}

impl Default for RequestTemplateCache {
    fn default() -> Self {
        Self::new()
    }
}
