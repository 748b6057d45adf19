//! Registry of in-flight correlation ids.

use crate::dispatch::EventQueue;
use crate::error::{Result, SessionError};
use crate::types::CorrelationId;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

/// What kind of operation holds a correlation id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Subscription,
    Request,
    RequestTemplate,
    ServiceStatus,
}

/// Context recorded for a live correlation id.
#[derive(Clone, Debug)]
pub struct OperationContext {
    pub token: CorrelationId,
    pub kind: OperationKind,
    pub label: String,
    /// Queue that receives this operation's events instead of the session.
    pub queue: Option<EventQueue>,
    /// Owning template, for requests sent through a request template.
    pub template: Option<CorrelationId>,
    /// Service name, for service status registrations.
    pub service: Option<String>,
}

impl OperationContext {
    pub fn new(token: CorrelationId, kind: OperationKind) -> Self {
        Self {
            token,
            kind,
            label: String::new(),
            queue: None,
            template: None,
            service: None,
        }
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = label.to_string();
        self
    }

    pub fn with_queue(mut self, queue: Option<EventQueue>) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_template(mut self, template: CorrelationId) -> Self {
        self.template = Some(template);
        self
    }

    pub fn with_service(mut self, service: &str) -> Self {
        self.service = Some(service.to_string());
        self
    }
}

#[derive(Default)]
struct RegistryInner {
    contexts: HashMap<CorrelationId, OperationContext>,
    /// Messages routed to the dispatcher but not yet settled, per id.
    in_flight: HashMap<CorrelationId, usize>,
    /// Ids whose remaining in-flight events must not begin dispatch. Always a
    /// subset of the keys of `in_flight`.
    silenced: HashSet<CorrelationId>,
}

/// Visit each id of `ids` once, keeping first-seen order.
fn distinct(ids: &[CorrelationId]) -> impl Iterator<Item = &CorrelationId> {
    ids.iter()
        .enumerate()
        .filter(move |(i, id)| !ids[..*i].contains(id))
        .map(|(_, id)| id)
}

/// Tracks every live correlation id and the operation it belongs to.
pub struct CorrelationRegistry {
    inner: RwLock<RegistryInner>,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    /// Register an operation under `token`, minting a fresh id when none is
    /// supplied.
    pub fn allocate(
        &self,
        token: Option<CorrelationId>,
        kind: OperationKind,
    ) -> Result<CorrelationId> {
        let token = token.unwrap_or_else(CorrelationId::new);
        self.register(OperationContext::new(token.clone(), kind))?;
        Ok(token)
    }

    /// Register a fully built context.
    pub fn register(&self, context: OperationContext) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.contexts.contains_key(&context.token) {
            return Err(SessionError::DuplicateCorrelation(context.token));
        }
        inner.silenced.remove(&context.token);
        inner.contexts.insert(context.token.clone(), context);
        Ok(())
    }

    /// Register a batch atomically: either every context is registered or,
    /// on the first duplicate, none is.
    pub fn register_all(&self, contexts: Vec<OperationContext>) -> Result<()> {
        let mut inner = self.inner.write();
        let mut seen = HashSet::with_capacity(contexts.len());
        for context in &contexts {
            if inner.contexts.contains_key(&context.token) || !seen.insert(&context.token) {
                return Err(SessionError::DuplicateCorrelation(context.token.clone()));
            }
        }
        for context in contexts {
            inner.silenced.remove(&context.token);
            inner.contexts.insert(context.token.clone(), context);
        }
        Ok(())
    }

    /// Remove a context. Unknown ids are a no-op.
    pub fn release(&self, token: &CorrelationId) -> Option<OperationContext> {
        self.inner.write().contexts.remove(token)
    }

    pub fn lookup(&self, token: &CorrelationId) -> Option<OperationContext> {
        self.inner.read().contexts.get(token).cloned()
    }

    pub fn is_active(&self, token: &CorrelationId) -> bool {
        self.inner.read().contexts.contains_key(token)
    }

    /// Stop dispatch of events for `token` that are still queued. A no-op
    /// when nothing in flight refers to `token`.
    pub fn silence(&self, token: &CorrelationId) {
        let mut inner = self.inner.write();
        if inner.in_flight.contains_key(token) {
            inner.silenced.insert(token.clone());
        }
    }

    pub fn is_silenced(&self, token: &CorrelationId) -> bool {
        self.inner.read().silenced.contains(token)
    }

    /// Number of ids currently silenced.
    pub fn silenced_len(&self) -> usize {
        self.inner.read().silenced.len()
    }

    /// Record one in-flight message carrying `ids`.
    pub fn track(&self, ids: &[CorrelationId]) {
        if ids.is_empty() {
            return;
        }
        let mut inner = self.inner.write();
        for id in distinct(ids) {
            *inner.in_flight.entry(id.clone()).or_insert(0) += 1;
        }
    }

    /// Settle one tracked message carrying `ids`, returning whether it may
    /// still be dispatched: it may unless every id it carries is silenced.
    /// An id whose last in-flight message settles is no longer silenced.
    pub fn settle(&self, ids: &[CorrelationId]) -> bool {
        if ids.is_empty() {
            return true;
        }
        let mut inner = self.inner.write();
        let deliver = ids.iter().any(|id| !inner.silenced.contains(id));
        for id in distinct(ids) {
            let Some(count) = inner.in_flight.get_mut(id) else {
                continue;
            };
            *count -= 1;
            if *count == 0 {
                inner.in_flight.remove(id);
                inner.silenced.remove(id);
            }
        }
        deliver
    }

    /// Drop every context. Silenced ids stay silenced until the events still
    /// queued for them settle.
    pub fn clear(&self) -> Vec<OperationContext> {
        self.inner.write().contexts.drain().map(|(_, c)| c).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CorrelationRegistry {
    fn default() -> Self {
        Self::new()
    }
}
