//! Subscription state machine.

use crate::correlation::CorrelationRegistry;
use crate::types::{CorrelationId, Message, MessageType};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

use super::types::{
    PreprocessErrorCode, SubscriptionList, SubscriptionPreprocessError, SubscriptionState, Topic,
};

/// Which call a list is being preprocessed for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PreprocessPurpose {
    /// New subscriptions: ids must not be in use.
    Subscribe,
    /// Existing subscriptions: ids are matched, not allocated.
    Resubscribe,
}

/// Result of preprocessing a list.
#[derive(Debug, Default)]
pub struct Preprocessed {
    /// Valid entries in submission order.
    pub accepted: Vec<(CorrelationId, Topic)>,
    /// Rejected entries in submission order.
    pub errors: Vec<SubscriptionPreprocessError>,
}

/// Change requested on a subscription that the server has not confirmed.
#[derive(Clone, Debug)]
enum PendingChange {
    Unsubscribe,
    Resubscribe {
        topic: Topic,
        resubscription_id: Option<i64>,
    },
}

/// Internal subscription state.
struct Subscription {
    topic: Topic,
    state: SubscriptionState,
    label: String,
    pending: Option<PendingChange>,
    /// State to restore if the pending change is rejected by the transport.
    prior_state: SubscriptionState,
}

/// Outcome of routing one message through the state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubscriptionUpdate {
    /// Whether the message should reach the consumer.
    pub deliver: bool,
    /// Whether the subscription reached a terminal state; its id must be
    /// released.
    pub terminal: bool,
}

/// Owns every subscription of a session and drives its state machine.
pub struct SubscriptionManager {
    subscriptions: RwLock<HashMap<CorrelationId, Subscription>>,
    default_service: String,
}

impl SubscriptionManager {
    pub fn new(default_service: impl Into<String>) -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            default_service: default_service.into(),
        }
    }

    /// Validate every entry of `list` up front.
    pub fn preprocess(
        &self,
        list: &SubscriptionList,
        registry: &CorrelationRegistry,
        purpose: PreprocessPurpose,
    ) -> Preprocessed {
        let mut result = Preprocessed::default();
        let mut seen = HashSet::new();

        for entry in list {
            let reject = |code, description: String| SubscriptionPreprocessError {
                correlation_id: entry.correlation_id.clone(),
                subscription_string: entry.subscription_string.clone(),
                error_code: code,
                description,
            };

            let topic = match entry.to_topic(&self.default_service) {
                Ok(topic) => topic,
                Err(description) => {
                    result
                        .errors
                        .push(reject(PreprocessErrorCode::InvalidSubscriptionString, description));
                    continue;
                }
            };

            if !seen.insert(entry.correlation_id.clone()) {
                result.errors.push(reject(
                    PreprocessErrorCode::CorrelationIdError,
                    "correlation id appears more than once in the list".to_string(),
                ));
                continue;
            }

            if purpose == PreprocessPurpose::Subscribe && registry.is_active(&entry.correlation_id)
            {
                result.errors.push(reject(
                    PreprocessErrorCode::CorrelationIdError,
                    "correlation id is already in use".to_string(),
                ));
                continue;
            }

            result.accepted.push((entry.correlation_id.clone(), topic));
        }

        result
    }

    /// Track new subscriptions in `Subscribing`.
    pub fn insert(&self, entries: &[(CorrelationId, Topic)], label: &str) {
        let mut subs = self.subscriptions.write();
        for (token, topic) in entries {
            subs.insert(
                token.clone(),
                Subscription {
                    topic: topic.clone(),
                    state: SubscriptionState::Subscribing,
                    label: label.to_string(),
                    pending: None,
                    prior_state: SubscriptionState::Subscribing,
                },
            );
        }
    }

    /// Forget subscriptions outright (rollback of a rejected batch).
    pub fn remove(&self, tokens: &[CorrelationId]) {
        let mut subs = self.subscriptions.write();
        for token in tokens {
            subs.remove(token);
        }
    }

    /// Move matching subscriptions toward cancellation. Returns the ids that
    /// matched; unknown ids and subscriptions already being cancelled are
    /// skipped.
    pub fn begin_unsubscribe<'a>(
        &self,
        tokens: impl IntoIterator<Item = &'a CorrelationId>,
    ) -> Vec<CorrelationId> {
        let mut subs = self.subscriptions.write();
        let mut matched = Vec::new();
        for token in tokens {
            if let Some(sub) = subs.get_mut(token) {
                if matches!(sub.pending, Some(PendingChange::Unsubscribe)) {
                    continue;
                }
                if sub.pending.is_none() {
                    sub.prior_state = sub.state;
                }
                sub.pending = Some(PendingChange::Unsubscribe);
                sub.state = SubscriptionState::PendingCancellation;
                matched.push(token.clone());
            }
        }
        matched
    }

    /// Record new options for matching subscriptions. Returns the entries
    /// that matched.
    pub fn begin_resubscribe(
        &self,
        entries: Vec<(CorrelationId, Topic)>,
        resubscription_id: Option<i64>,
    ) -> Vec<(CorrelationId, Topic)> {
        let mut subs = self.subscriptions.write();
        let mut matched = Vec::new();
        for (token, topic) in entries {
            let Some(sub) = subs.get_mut(&token) else {
                continue;
            };
            if matches!(sub.pending, Some(PendingChange::Unsubscribe)) {
                continue;
            }
            if sub.pending.is_none() {
                sub.prior_state = sub.state;
            }
            sub.pending = Some(PendingChange::Resubscribe {
                topic: topic.clone(),
                resubscription_id,
            });
            sub.state = SubscriptionState::PendingCancellation;
            matched.push((token, topic));
        }
        matched
    }

    /// Undo a pending change the transport refused.
    pub fn revert(&self, tokens: &[CorrelationId]) {
        let mut subs = self.subscriptions.write();
        for token in tokens {
            if let Some(sub) = subs.get_mut(token) {
                if sub.pending.take().is_some() {
                    sub.state = sub.prior_state;
                }
            }
        }
    }

    /// Apply a message to the subscription `token` belongs to.
    pub fn on_message(&self, token: &CorrelationId, message: &mut Message) -> SubscriptionUpdate {
        let mut subs = self.subscriptions.write();
        let Some(sub) = subs.get_mut(token) else {
            return SubscriptionUpdate {
                deliver: false,
                terminal: false,
            };
        };

        let cancelling = matches!(sub.pending, Some(PendingChange::Unsubscribe));
        let (next, deliver) = match &message.message_type {
            MessageType::SubscriptionStarted => match sub.pending.take() {
                Some(PendingChange::Resubscribe {
                    topic,
                    resubscription_id,
                }) => {
                    sub.topic = topic;
                    message.resubscription_id = resubscription_id;
                    (SubscriptionState::Subscribed, true)
                }
                Some(PendingChange::Unsubscribe) => {
                    sub.pending = Some(PendingChange::Unsubscribe);
                    (sub.state, false)
                }
                None => (SubscriptionState::Subscribed, true),
            },
            MessageType::SubscriptionFailure | MessageType::SubscriptionTerminated => {
                if cancelling {
                    (SubscriptionState::Cancelled, false)
                } else {
                    (SubscriptionState::Unsubscribed, true)
                }
            }
            _ => (sub.state, !cancelling),
        };

        if next != sub.state {
            tracing::debug!(token = %token, from = ?sub.state, to = ?next, label = %sub.label, "Subscription transition");
            sub.state = next;
        }

        let terminal = next.is_terminal();
        if terminal {
            subs.remove(token);
        }

        SubscriptionUpdate { deliver, terminal }
    }

    pub fn state(&self, token: &CorrelationId) -> Option<SubscriptionState> {
        self.subscriptions.read().get(token).map(|s| s.state)
    }

    pub fn topic(&self, token: &CorrelationId) -> Option<Topic> {
        self.subscriptions.read().get(token).map(|s| s.topic.clone())
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    pub fn clear(&self) {
        self.subscriptions.write().clear();
    }
}
