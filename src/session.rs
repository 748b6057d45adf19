//! Session tying the registry, state machines and dispatcher together.

use crate::correlation::{CorrelationRegistry, OperationContext, OperationKind};
use crate::dispatch::{self, EventDispatcher, EventDispatcherConfig, EventHandler, EventQueue};
use crate::error::{Result, SessionError};
use crate::shutdown;
use crate::subscriptions::{
    PreprocessPurpose, Preprocessed, SubscriptionList, SubscriptionManager,
    SubscriptionPreprocessError, SubscriptionPreprocessMode, SubscriptionState, Topic,
};
use crate::templates::{RequestTemplate, RequestTemplateCache, TemplateState};
use crate::transport::{EventSink, Operation, SubscriptionRequest, Transport};
use crate::types::{
    CorrelationId, Event, EventKind, Identity, Message, MessageType, Request, Service,
};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Counter for session ids.
static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Session configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionOptions {
    /// Backend host, forwarded to the transport.
    pub server_host: String,

    /// Backend port, forwarded to the transport.
    pub server_port: u16,

    /// Service used for subscription strings that do not name one.
    /// Default: `//blp/mktdata`
    pub default_subscription_service: String,

    /// Name used in log output.
    pub session_name: String,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            server_host: "localhost".to_string(),
            server_port: 8194,
            default_subscription_service: "//blp/mktdata".to_string(),
            session_name: String::new(),
        }
    }
}

/// Lifecycle state of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Starting,
    Started,
    Stopping,
    Stopped,
}

/// What to do with a routed message.
enum Route {
    Dispatch,
    Queue(EventQueue),
    Drop,
}

/// Shared session state. Dispatcher threads and event sinks hold it weakly.
pub(crate) struct SessionInner {
    id: u64,
    options: SessionOptions,
    transport: Arc<dyn Transport>,
    state: Mutex<SessionState>,
    state_changed: Condvar,
    registry: CorrelationRegistry,
    subscriptions: SubscriptionManager,
    templates: RequestTemplateCache,
    /// Service name to the id receiving its status events.
    services: Mutex<HashMap<String, CorrelationId>>,
    dispatcher: EventDispatcher,
    /// Serializes inbound routing with cancellations, so an operation's
    /// terminal status is always enqueued after anything routed for it.
    ordering: Mutex<()>,
    weak_self: Weak<SessionInner>,
}

/// A connection to the backend.
///
/// Provides a unified interface for:
/// - Starting and stopping the connection
/// - Streaming subscriptions
/// - Ad-hoc and templated requests
/// - Receiving events through a handler or by polling
///
/// Clones share the same session. When the last clone is dropped a running
/// session is stopped.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Create a session.
    ///
    /// With a `handler`, events are delivered on dispatcher threads
    /// configured by `dispatcher`. Without one, events are polled with
    /// [`Session::next_event`]; supplying `dispatcher` without a handler is
    /// an error.
    pub fn new(
        options: SessionOptions,
        transport: Arc<dyn Transport>,
        handler: Option<EventHandler>,
        dispatcher: Option<EventDispatcherConfig>,
    ) -> Result<Self> {
        if handler.is_none() && dispatcher.is_some() {
            return Err(SessionError::InvalidArgument(
                "event dispatcher is specified but event handler is None".to_string(),
            ));
        }
        if dispatcher.as_ref().map_or(false, |config| config.num_threads == 0) {
            return Err(SessionError::InvalidArgument(
                "event dispatcher needs at least one thread".to_string(),
            ));
        }
        if !Service::is_valid_name(&options.default_subscription_service) {
            return Err(SessionError::InvalidArgument(format!(
                "invalid default subscription service '{}'",
                options.default_subscription_service
            )));
        }

        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let dispatcher_config = dispatcher.unwrap_or_default();
        let inner = Arc::new_cyclic(|weak: &Weak<SessionInner>| SessionInner {
            id,
            subscriptions: SubscriptionManager::new(options.default_subscription_service.clone()),
            options,
            transport,
            state: Mutex::new(SessionState::Created),
            state_changed: Condvar::new(),
            registry: CorrelationRegistry::new(),
            templates: RequestTemplateCache::new(),
            services: Mutex::new(HashMap::new()),
            dispatcher: match handler {
                Some(handler) => {
                    EventDispatcher::workers(id, handler, &dispatcher_config, weak.clone())
                }
                None => EventDispatcher::polling(),
            },
            ordering: Mutex::new(()),
            weak_self: weak.clone(),
        });

        shutdown::register(id, Arc::downgrade(&inner));
        tracing::debug!(session = id, name = %inner.options.session_name, "Session created");

        Ok(Self { inner })
    }

    /// Create a handler-driven session.
    pub fn with_handler<F>(
        options: SessionOptions,
        transport: Arc<dyn Transport>,
        dispatcher: Option<EventDispatcherConfig>,
        handler: F,
    ) -> Result<Self>
    where
        F: Fn(&Event, &Session) + Send + Sync + 'static,
    {
        let handler: EventHandler = Arc::new(handler);
        Self::new(options, transport, Some(handler), Some(dispatcher.unwrap_or_default()))
    }

    pub(crate) fn from_inner(inner: Arc<SessionInner>) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn options(&self) -> &SessionOptions {
        &self.inner.options
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }

    // --- Lifecycle ---

    /// Start the session and wait until it is started or has failed to
    /// start. A session status event is always produced first.
    pub fn start(&self) -> bool {
        if !self.inner.begin_start() {
            return false;
        }
        let mut state = self.inner.state.lock();
        while *state == SessionState::Starting {
            self.inner.state_changed.wait(&mut state);
        }
        *state == SessionState::Started
    }

    /// Start the session without waiting. The outcome is reported by a
    /// session status event, possibly before this returns.
    pub fn start_async(&self) -> bool {
        self.inner.begin_start()
    }

    /// Stop the session and wait for every in-flight handler invocation,
    /// including the one for the final `SessionTerminated` event. Called
    /// from this session's handler it does not wait.
    pub fn stop(&self) -> bool {
        self.inner.stop()
    }

    /// Stop the session without waiting. No handler runs after the final
    /// `SessionTerminated` event.
    pub fn stop_async(&self) -> bool {
        self.inner.stop_async()
    }

    // --- Polling ---

    /// Wait up to `timeout` for the next event; zero waits indefinitely.
    /// Returns a `Timeout` event when nothing arrives in time.
    pub fn next_event(&self, timeout: Duration) -> Result<Event> {
        let queue = self.poll_queue("next_event")?;
        let deadline = if timeout.is_zero() {
            None
        } else {
            Some(Instant::now() + timeout)
        };
        loop {
            match queue.recv_until(deadline) {
                Some(event) => {
                    if let Some(event) = self.inner.admit(event) {
                        return Ok(event);
                    }
                }
                None => return Ok(Event::timeout()),
            }
        }
    }

    /// Take the next event if one is queued.
    pub fn try_next_event(&self) -> Result<Option<Event>> {
        let queue = self.poll_queue("try_next_event")?;
        while let Some(event) = queue.try_next_event() {
            if let Some(event) = self.inner.admit(event) {
                return Ok(Some(event));
            }
        }
        Ok(None)
    }

    fn poll_queue(&self, operation: &str) -> Result<&EventQueue> {
        self.inner.dispatcher.queue().ok_or_else(|| {
            SessionError::InvalidState(format!(
                "{} is not supported on a session with an event handler",
                operation
            ))
        })
    }

    // --- Subscriptions ---

    /// Subscribe to every entry of `list`.
    ///
    /// Returns `None` in `FailOnFirstError` mode, and the list of rejected
    /// entries in `ReturnIndividualErrors` mode.
    pub fn subscribe(
        &self,
        list: &SubscriptionList,
        identity: Option<&Identity>,
        label: &str,
        mode: SubscriptionPreprocessMode,
    ) -> Result<Option<Vec<SubscriptionPreprocessError>>> {
        self.inner.ensure_started("subscribe")?;

        let Preprocessed { accepted, errors } =
            self.inner
                .subscriptions
                .preprocess(list, &self.inner.registry, PreprocessPurpose::Subscribe);
        let errors = check_preprocessed(errors, mode)?;

        if !accepted.is_empty() {
            let contexts = accepted
                .iter()
                .map(|(token, _)| {
                    OperationContext::new(token.clone(), OperationKind::Subscription)
                        .with_label(label)
                })
                .collect();
            self.inner.registry.register_all(contexts)?;
            self.inner.subscriptions.insert(&accepted, label);

            let operation = Operation::Subscribe {
                subscriptions: subscription_requests(&accepted),
                identity: identity.cloned(),
                label: label.to_string(),
            };
            if let Err(e) = self.inner.transport.submit(operation) {
                let tokens: Vec<CorrelationId> = accepted.into_iter().map(|(t, _)| t).collect();
                self.inner.subscriptions.remove(&tokens);
                for token in &tokens {
                    self.inner.registry.release(token);
                }
                tracing::warn!(session = self.inner.id, code = e.code, "Subscribe rejected by transport");
                return Err(e.into());
            }
        }

        Ok(errors)
    }

    /// Cancel every subscription in `list`. Ids that do not match a current
    /// subscription are ignored.
    pub fn unsubscribe(&self, list: &SubscriptionList) -> Result<()> {
        let tokens: Vec<CorrelationId> = list.iter().map(|e| e.correlation_id.clone()).collect();
        self.inner.unsubscribe_ids(&tokens)
    }

    /// Replace the options of every subscription in `list`. The status
    /// message confirming each one carries `resubscription_id`.
    pub fn resubscribe(
        &self,
        list: &SubscriptionList,
        label: &str,
        resubscription_id: Option<i64>,
        mode: SubscriptionPreprocessMode,
    ) -> Result<Option<Vec<SubscriptionPreprocessError>>> {
        self.inner.ensure_started("resubscribe")?;

        let Preprocessed { accepted, errors } =
            self.inner
                .subscriptions
                .preprocess(list, &self.inner.registry, PreprocessPurpose::Resubscribe);
        let errors = check_preprocessed(errors, mode)?;

        let matched = self
            .inner
            .subscriptions
            .begin_resubscribe(accepted, resubscription_id);
        if !matched.is_empty() {
            let operation = Operation::Resubscribe {
                subscriptions: subscription_requests(&matched),
                resubscription_id,
                label: label.to_string(),
            };
            if let Err(e) = self.inner.transport.submit(operation) {
                let tokens: Vec<CorrelationId> = matched.into_iter().map(|(t, _)| t).collect();
                self.inner.subscriptions.revert(&tokens);
                return Err(e.into());
            }
        }

        Ok(errors)
    }

    pub fn subscription_state(&self, token: &CorrelationId) -> Option<SubscriptionState> {
        self.inner.subscriptions.state(token)
    }

    pub fn subscription_topic(&self, token: &CorrelationId) -> Option<Topic> {
        self.inner.subscriptions.topic(token)
    }

    // --- Requests ---

    /// Send a request. Its events go to `queue` when one is given. Returns
    /// the correlation id used, minted if none was supplied.
    pub fn send_request(
        &self,
        request: Request,
        identity: Option<&Identity>,
        correlation_id: Option<CorrelationId>,
        queue: Option<&EventQueue>,
        label: &str,
    ) -> Result<CorrelationId> {
        self.inner.ensure_started("send_request")?;

        let token = correlation_id.unwrap_or_else(CorrelationId::new);
        self.inner.registry.register(
            OperationContext::new(token.clone(), OperationKind::Request)
                .with_label(label)
                .with_queue(queue.cloned()),
        )?;

        let operation = Operation::SendRequest {
            correlation_id: token.clone(),
            request,
            identity: identity.cloned(),
            label: label.to_string(),
        };
        if let Err(e) = self.inner.transport.submit(operation) {
            self.inner.registry.release(&token);
            return Err(e.into());
        }
        Ok(token)
    }

    /// Create a snapshot request template for `subscription_string`,
    /// identified by `correlation_id`. The template starts `Pending`.
    pub fn create_snapshot_request_template(
        &self,
        subscription_string: &str,
        correlation_id: CorrelationId,
        identity: Option<&Identity>,
    ) -> Result<RequestTemplate> {
        self.inner.ensure_started("create_snapshot_request_template")?;

        let topic = Topic::parse(
            subscription_string,
            &self.inner.options.default_subscription_service,
        )
        .map_err(|description| {
            SessionError::InvalidArgument(format!(
                "invalid subscription string '{}': {}",
                subscription_string, description
            ))
        })?;

        self.inner.registry.register(OperationContext::new(
            correlation_id.clone(),
            OperationKind::RequestTemplate,
        ))?;
        let template = self
            .inner
            .templates
            .create(correlation_id.clone(), subscription_string);

        let operation = Operation::CreateRequestTemplate {
            correlation_id: correlation_id.clone(),
            subscription: topic,
            identity: identity.cloned(),
        };
        if let Err(e) = self.inner.transport.submit(operation) {
            self.inner.templates.remove(&correlation_id);
            self.inner.registry.release(&correlation_id);
            return Err(e.into());
        }
        Ok(template)
    }

    /// Send a request through `template`. Returns the correlation id used.
    pub fn send_request_template(
        &self,
        template: &RequestTemplate,
        correlation_id: Option<CorrelationId>,
    ) -> Result<CorrelationId> {
        self.inner.ensure_started("send_request_template")?;

        if template.state() == TemplateState::Terminated {
            return Err(SessionError::InvalidState(format!(
                "request template {} is terminated",
                template.correlation_id()
            )));
        }
        if !self.inner.templates.owns(template) {
            return Err(SessionError::InvalidArgument(format!(
                "request template {} does not belong to this session",
                template.correlation_id()
            )));
        }

        let token = correlation_id.unwrap_or_else(CorrelationId::new);
        let template_id = template.correlation_id().clone();
        self.inner.registry.register(
            OperationContext::new(token.clone(), OperationKind::Request)
                .with_template(template_id.clone()),
        )?;
        if let Err(e) = self.inner.templates.begin_request(template, &token) {
            self.inner.registry.release(&token);
            return Err(e);
        }

        let operation = Operation::SendRequestTemplate {
            template: template_id.clone(),
            correlation_id: token.clone(),
        };
        if let Err(e) = self.inner.transport.submit(operation) {
            self.inner.templates.request_completed(&template_id, &token);
            self.inner.registry.release(&token);
            return Err(e.into());
        }
        Ok(token)
    }

    pub fn request_template(&self, correlation_id: &CorrelationId) -> Option<RequestTemplate> {
        self.inner.templates.get(correlation_id)
    }

    // --- Service status ---

    /// Route the status events of `service` to `correlation_id`. A previous
    /// id associated with the service is released.
    pub fn set_status_correlation_id(
        &self,
        service: &Service,
        correlation_id: CorrelationId,
        identity: Option<&Identity>,
    ) -> Result<()> {
        self.inner.ensure_started("set_status_correlation_id")?;

        if !Service::is_valid_name(&service.name) {
            return Err(SessionError::InvalidArgument(format!(
                "invalid service name '{}'",
                service.name
            )));
        }

        self.inner.registry.register(
            OperationContext::new(correlation_id.clone(), OperationKind::ServiceStatus)
                .with_service(&service.name),
        )?;

        let operation = Operation::SetStatusCorrelationId {
            service: service.name.clone(),
            correlation_id: correlation_id.clone(),
            identity: identity.cloned(),
        };
        if let Err(e) = self.inner.transport.submit(operation) {
            self.inner.registry.release(&correlation_id);
            return Err(e.into());
        }

        let previous = self
            .inner
            .services
            .lock()
            .insert(service.name.clone(), correlation_id);
        if let Some(previous) = previous {
            self.inner.registry.release(&previous);
        }
        Ok(())
    }

    // --- Cancellation ---

    /// Cancel whatever operation holds `correlation_id`. Unknown ids are
    /// ignored.
    pub fn cancel(&self, correlation_id: &CorrelationId) -> Result<()> {
        self.inner.cancel(correlation_id)
    }

    /// Whether `correlation_id` is held by a live operation.
    pub fn is_active(&self, correlation_id: &CorrelationId) -> bool {
        self.inner.registry.is_active(correlation_id)
    }

    /// Number of live operations.
    pub fn active_operations(&self) -> usize {
        self.inner.registry.len()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("handler", &self.inner.dispatcher.has_handler())
            .finish()
    }
}

fn check_preprocessed(
    errors: Vec<SubscriptionPreprocessError>,
    mode: SubscriptionPreprocessMode,
) -> Result<Option<Vec<SubscriptionPreprocessError>>> {
    match mode {
        SubscriptionPreprocessMode::FailOnFirstError => match errors.into_iter().next() {
            Some(first) => Err(first.into()),
            None => Ok(None),
        },
        SubscriptionPreprocessMode::ReturnIndividualErrors => Ok(Some(errors)),
    }
}

fn subscription_requests(entries: &[(CorrelationId, Topic)]) -> Vec<SubscriptionRequest> {
    entries
        .iter()
        .map(|(token, topic)| SubscriptionRequest {
            correlation_id: token.clone(),
            topic: topic.clone(),
        })
        .collect()
}

fn session_status(message_type: MessageType) -> Event {
    Event::new(
        EventKind::SessionStatus,
        vec![Message::new(message_type, Vec::new())],
    )
}

impl SessionInner {
    fn ensure_started(&self, operation: &str) -> Result<()> {
        let state = *self.state.lock();
        if state == SessionState::Started {
            Ok(())
        } else {
            Err(SessionError::InvalidState(format!(
                "{} requires a started session (state is {:?})",
                operation, state
            )))
        }
    }

    fn set_state(&self, next: SessionState) {
        *self.state.lock() = next;
        self.state_changed.notify_all();
    }

    fn begin_start(&self) -> bool {
        {
            let mut state = self.state.lock();
            if *state != SessionState::Created {
                tracing::warn!(session = self.id, state = ?*state, "Session already started");
                return false;
            }
            *state = SessionState::Starting;
        }

        if let Err(e) = self.dispatcher.start() {
            tracing::error!(session = self.id, error = %e, "Failed to start dispatcher");
            self.set_state(SessionState::Stopped);
            shutdown::unregister(self.id);
            return false;
        }

        tracing::info!(
            session = self.id,
            host = %self.options.server_host,
            port = self.options.server_port,
            "Starting session"
        );
        if let Err(e) = self.transport.connect(EventSink::new(self.weak_self.clone())) {
            tracing::warn!(session = self.id, code = e.code, description = %e.description, "Transport failed to connect");
            let failure = Event::new(
                EventKind::SessionStatus,
                vec![Message::new(MessageType::SessionStartupFailure, Vec::new())
                    .with_payload(json!({"reason": {"code": e.code, "description": e.description}}))],
            );
            self.route(failure);
            return false;
        }
        true
    }

    pub(crate) fn stop(&self) -> bool {
        if dispatch::is_dispatching(self.id) {
            tracing::debug!(session = self.id, "stop called from handler, not waiting");
            return self.stop_async();
        }
        let stopped = self.stop_async();
        self.dispatcher.join();
        self.mark_stopped();
        stopped
    }

    pub(crate) fn stop_async(&self) -> bool {
        shutdown::unregister(self.id);

        let previous = {
            let mut state = self.state.lock();
            let previous = *state;
            match previous {
                SessionState::Created => *state = SessionState::Stopped,
                SessionState::Starting | SessionState::Started => *state = SessionState::Stopping,
                SessionState::Stopping | SessionState::Stopped => {}
            }
            self.state_changed.notify_all();
            previous
        };

        if matches!(previous, SessionState::Starting | SessionState::Started) {
            tracing::info!(session = self.id, "Stopping session");
            self.transport.disconnect();
            self.teardown(session_status(MessageType::SessionTerminated));
        }
        true
    }

    /// Release every operation and hand the dispatcher its final event.
    fn teardown(&self, final_event: Event) {
        shutdown::unregister(self.id);
        self.registry.clear();
        self.subscriptions.clear();
        self.services.lock().clear();
        self.dispatcher.finish(final_event);
        if !self.dispatcher.has_handler() {
            self.mark_stopped();
        }
    }

    pub(crate) fn mark_stopped(&self) {
        let mut state = self.state.lock();
        if *state == SessionState::Stopping {
            *state = SessionState::Stopped;
            self.state_changed.notify_all();
            tracing::info!(session = self.id, "Session stopped");
        }
    }

    fn unsubscribe_ids(&self, tokens: &[CorrelationId]) -> Result<()> {
        let matched = self.subscriptions.begin_unsubscribe(tokens);
        if matched.is_empty() {
            return Ok(());
        }

        let operation = Operation::Unsubscribe {
            correlation_ids: matched.clone(),
        };
        if let Err(e) = self.transport.submit(operation) {
            self.subscriptions.revert(&matched);
            return Err(e.into());
        }
        let _ordering = self.ordering.lock();
        for token in &matched {
            self.registry.silence(token);
        }
        Ok(())
    }

    fn cancel(&self, token: &CorrelationId) -> Result<()> {
        let Some(context) = self.registry.lookup(token) else {
            return Ok(());
        };
        if context.kind == OperationKind::Subscription {
            return self.unsubscribe_ids(std::slice::from_ref(token));
        }

        self.transport.submit(Operation::Cancel {
            correlation_ids: vec![token.clone()],
        })?;

        let _ordering = self.ordering.lock();
        match context.kind {
            OperationKind::Request => {
                self.registry.release(token);
                self.registry.silence(token);
                if let Some(template) = &context.template {
                    self.templates.request_completed(template, token);
                }
            }
            OperationKind::RequestTemplate => {
                if let Some(failed) = self.templates.terminate(token) {
                    self.registry.release(token);
                    let terminated = Message::status(MessageType::RequestTemplateTerminated, token.clone())
                        .with_payload(json!({"reason": {"description": "request template cancelled"}}));
                    self.enqueue(Event::new(EventKind::Admin, vec![terminated]));
                    self.fail_template_requests(failed);
                }
            }
            OperationKind::ServiceStatus => {
                self.registry.release(token);
                self.services.lock().retain(|_, id| id != token);
            }
            OperationKind::Subscription => {}
        }
        Ok(())
    }

    /// Fail requests that were outstanding on a terminated template.
    fn fail_template_requests(&self, requests: Vec<CorrelationId>) {
        for request in requests {
            let queue = self.registry.release(&request).and_then(|c| c.queue);
            let failure = Message::status(MessageType::RequestFailure, request)
                .with_payload(json!({"reason": {"description": "request template terminated"}}));
            let event = Event::new(EventKind::RequestStatus, vec![failure]);
            match queue {
                Some(queue) => queue.push(event),
                None => self.enqueue(event),
            }
        }
    }

    /// Track and dispatch an event the session produced itself.
    fn enqueue(&self, event: Event) {
        for message in &event.messages {
            self.registry.track(&message.correlation_ids);
        }
        self.dispatch_tracked(event);
    }

    /// Dispatch messages already tracked, settling them if the dispatcher
    /// refuses the event.
    fn dispatch_tracked(&self, event: Event) {
        if let Err(event) = self.dispatcher.dispatch(event) {
            for message in &event.messages {
                self.registry.settle(&message.correlation_ids);
            }
        }
    }

    // --- Inbound routing ---

    /// Apply an inbound event to the session state and forward what the
    /// consumer should see.
    pub(crate) fn route(&self, event: Event) {
        if event.kind == EventKind::SessionStatus {
            self.route_session_status(event);
            return;
        }
        if matches!(
            *self.state.lock(),
            SessionState::Stopping | SessionState::Stopped
        ) {
            tracing::debug!(session = self.id, kind = ?event.kind, "Session stopping, inbound event dropped");
            return;
        }

        let kind = event.kind;
        let mut outbound = Vec::new();
        let mut queued: Vec<(EventQueue, Message)> = Vec::new();
        let mut failed_requests = Vec::new();

        let _ordering = self.ordering.lock();
        for mut message in event.messages {
            // In flight until the consumer settles it; a cancellation after
            // this point silences it instead of missing it.
            self.registry.track(&message.correlation_ids);
            match self.route_message(kind, &mut message, &mut failed_requests) {
                Route::Dispatch => outbound.push(message),
                Route::Queue(queue) => {
                    self.registry.settle(&message.correlation_ids);
                    queued.push((queue, message));
                }
                Route::Drop => {
                    self.registry.settle(&message.correlation_ids);
                }
            }
        }

        if !outbound.is_empty() {
            self.dispatch_tracked(Event::new(kind, outbound));
        }
        for (queue, message) in queued {
            queue.push(Event::new(kind, vec![message]));
        }
        if !failed_requests.is_empty() {
            self.fail_template_requests(failed_requests);
        }
    }

    fn route_message(
        &self,
        kind: EventKind,
        message: &mut Message,
        failed_requests: &mut Vec<CorrelationId>,
    ) -> Route {
        if message.correlation_ids.is_empty() {
            return Route::Dispatch;
        }

        let tokens = message.correlation_ids.clone();
        let mut deliver = false;
        let mut queue = None;
        for (i, token) in tokens.iter().enumerate() {
            if tokens[..i].contains(token) {
                continue;
            }
            let Some(context) = self.registry.lookup(token) else {
                continue;
            };
            match context.kind {
                OperationKind::Subscription => {
                    let update = self.subscriptions.on_message(token, message);
                    if update.terminal {
                        self.registry.release(token);
                    }
                    deliver |= update.deliver;
                }
                OperationKind::Request => {
                    let terminal = kind == EventKind::Response
                        || message.message_type == MessageType::RequestFailure;
                    if terminal {
                        self.registry.release(token);
                        if let Some(template) = &context.template {
                            self.templates.request_completed(template, token);
                        }
                    }
                    deliver = true;
                    if queue.is_none() {
                        queue = context.queue;
                    }
                }
                OperationKind::RequestTemplate => {
                    let transition = self.templates.on_status(token, message);
                    if transition.terminated {
                        self.registry.release(token);
                        failed_requests.extend(transition.failed_requests);
                    }
                    deliver |= transition.deliver;
                }
                OperationKind::ServiceStatus => deliver = true,
            }
        }

        if !deliver {
            tracing::debug!(session = self.id, ids = ?tokens, "No live operation for message, dropped");
            return Route::Drop;
        }
        match queue {
            Some(queue) => Route::Queue(queue),
            None => Route::Dispatch,
        }
    }

    fn route_session_status(&self, event: Event) {
        let mut terminal = false;
        for message in &event.messages {
            match message.message_type {
                MessageType::SessionStarted => {
                    let mut state = self.state.lock();
                    if *state == SessionState::Starting {
                        *state = SessionState::Started;
                        self.state_changed.notify_all();
                        tracing::info!(session = self.id, "Session started");
                    }
                }
                MessageType::SessionStartupFailure | MessageType::SessionTerminated => {
                    terminal = true;
                }
                _ => {}
            }
        }

        let running = {
            let mut state = self.state.lock();
            let running = matches!(*state, SessionState::Starting | SessionState::Started);
            if terminal && running {
                *state = SessionState::Stopping;
                self.state_changed.notify_all();
            }
            running
        };

        if !running {
            tracing::debug!(session = self.id, "Session not running, status event dropped");
        } else if terminal {
            tracing::info!(session = self.id, "Session terminated by transport");
            self.teardown(event);
        } else if self.dispatcher.dispatch(event).is_err() {
            tracing::debug!(session = self.id, "Dispatcher finishing, status event dropped");
        }
    }

    /// Settle the messages of a dequeued event, stripping those whose every
    /// id was silenced after the event was queued. Returns `None` if nothing
    /// is left to deliver.
    pub(crate) fn admit(&self, mut event: Event) -> Option<Event> {
        if matches!(event.kind, EventKind::SessionStatus | EventKind::Timeout) {
            return Some(event);
        }
        event
            .messages
            .retain(|m| self.registry.settle(&m.correlation_ids));
        if event.messages.is_empty() {
            None
        } else {
            Some(event)
        }
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let running = matches!(
            *self.state.lock(),
            SessionState::Starting | SessionState::Started
        );
        if running {
            tracing::info!(session = self.id, "Session dropped while running");
            self.stop();
        } else if !dispatch::is_dispatching(self.id) {
            self.dispatcher.join();
        }
        self.templates.clear();
        shutdown::unregister(self.id);
    }
}
