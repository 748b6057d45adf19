//! Subscription types: lists, topics, states and preprocessing errors.

use crate::error::SessionError;
use crate::types::CorrelationId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How a batch with invalid entries is handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionPreprocessMode {
    /// Abort the whole batch and raise on the first invalid entry.
    FailOnFirstError = 1,
    /// Report each invalid entry and proceed with the valid ones.
    ReturnIndividualErrors = 2,
}

impl Default for SubscriptionPreprocessMode {
    fn default() -> Self {
        SubscriptionPreprocessMode::FailOnFirstError
    }
}

impl TryFrom<i32> for SubscriptionPreprocessMode {
    type Error = SessionError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(SubscriptionPreprocessMode::FailOnFirstError),
            2 => Ok(SubscriptionPreprocessMode::ReturnIndividualErrors),
            other => Err(SessionError::InvalidArgument(format!(
                "Unsupported SubscriptionPreprocessMode: '{}'",
                other
            ))),
        }
    }
}

/// Lifecycle state of a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Subscribing,
    Subscribed,
    PendingCancellation,
    Cancelled,
    Unsubscribed,
}

impl SubscriptionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SubscriptionState::Cancelled | SubscriptionState::Unsubscribed
        )
    }
}

/// Why an entry was rejected during preprocessing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PreprocessErrorCode {
    InvalidSubscriptionString = 1,
    CorrelationIdError = 2,
}

impl fmt::Display for PreprocessErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PreprocessErrorCode::InvalidSubscriptionString => write!(f, "INVALID_SUBSCRIPTION_STRING"),
            PreprocessErrorCode::CorrelationIdError => write!(f, "CORRELATION_ID_ERROR"),
        }
    }
}

/// An entry rejected while preprocessing a subscription list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionPreprocessError {
    pub correlation_id: CorrelationId,
    pub subscription_string: String,
    pub error_code: PreprocessErrorCode,
    pub description: String,
}

impl fmt::Display for SubscriptionPreprocessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{correlationId: {}, subscriptionString: {}, code: {}, description: {}}}",
            self.correlation_id, self.subscription_string, self.error_code, self.description
        )
    }
}

/// A parsed subscription string.
///
/// Grammar: `[//namespace/service/]topic[?fields=A,B&option&key=value]`.
/// Topics without a service are bound to the session's default
/// subscription service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topic {
    pub service: String,
    pub topic: String,
    pub fields: Vec<String>,
    pub options: Vec<String>,
}

impl Topic {
    pub fn parse(s: &str, default_service: &str) -> Result<Self, String> {
        if s.trim().is_empty() {
            return Err("subscription string is empty".to_string());
        }
        if s.chars().any(char::is_control) {
            return Err("subscription string contains control characters".to_string());
        }

        let (path, query) = match s.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (s, None),
        };

        let (service, topic) = match path.strip_prefix("//") {
            Some(rest) => {
                let mut parts = rest.splitn(3, '/');
                let namespace = parts.next().unwrap_or("");
                let name = parts.next().unwrap_or("");
                let topic = parts.next().unwrap_or("");
                if namespace.is_empty() || name.is_empty() {
                    return Err(format!("malformed service in '{}'", s));
                }
                if topic.trim().is_empty() {
                    return Err(format!("missing topic after service in '{}'", s));
                }
                (format!("//{}/{}", namespace, name), topic.to_string())
            }
            None => {
                if path.trim().is_empty() || path.trim() == "/" {
                    return Err(format!("missing topic in '{}'", s));
                }
                (default_service.to_string(), path.to_string())
            }
        };

        let mut parsed = Topic {
            service,
            topic,
            fields: Vec::new(),
            options: Vec::new(),
        };

        if let Some(query) = query {
            for param in query.split('&') {
                if param.trim().is_empty() {
                    return Err(format!("empty option in '{}'", s));
                }
                match param.strip_prefix("fields=") {
                    Some(fields) => parsed.add_fields(fields.split(','))?,
                    None => parsed.options.push(param.to_string()),
                }
            }
        }

        Ok(parsed)
    }

    /// Append field names, rejecting empty ones.
    pub fn add_fields<'a>(&mut self, fields: impl IntoIterator<Item = &'a str>) -> Result<(), String> {
        for field in fields {
            let field = field.trim();
            if field.is_empty() {
                return Err("empty field name".to_string());
            }
            self.fields.push(field.to_string());
        }
        Ok(())
    }

    /// Append options, rejecting empty ones.
    pub fn add_options<'a>(&mut self, options: impl IntoIterator<Item = &'a str>) -> Result<(), String> {
        for option in options {
            if option.trim().is_empty() {
                return Err("empty option".to_string());
            }
            self.options.push(option.to_string());
        }
        Ok(())
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.topic.starts_with('/') {
            write!(f, "{}{}", self.service, self.topic)?;
        } else {
            write!(f, "{}/{}", self.service, self.topic)?;
        }

        let mut params = Vec::new();
        if !self.fields.is_empty() {
            params.push(format!("fields={}", self.fields.join(",")));
        }
        params.extend(self.options.iter().cloned());
        if !params.is_empty() {
            write!(f, "?{}", params.join("&"))?;
        }
        Ok(())
    }
}

/// One entry of a [`SubscriptionList`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionEntry {
    pub subscription_string: String,
    pub fields: Vec<String>,
    pub options: Vec<String>,
    pub correlation_id: CorrelationId,
}

impl SubscriptionEntry {
    /// Parse the entry, merging its extra fields and options into the topic.
    pub fn to_topic(&self, default_service: &str) -> Result<Topic, String> {
        let mut topic = Topic::parse(&self.subscription_string, default_service)?;
        topic.add_fields(self.fields.iter().map(String::as_str))?;
        topic.add_options(self.options.iter().map(String::as_str))?;
        Ok(topic)
    }
}

/// Ordered list of subscriptions submitted together.
#[derive(Clone, Debug, Default)]
pub struct SubscriptionList {
    entries: Vec<SubscriptionEntry>,
}

impl SubscriptionList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscription string. A fresh id is minted when none is given.
    /// Returns the id the entry will use.
    pub fn add(
        &mut self,
        subscription_string: impl Into<String>,
        correlation_id: Option<CorrelationId>,
    ) -> CorrelationId {
        self.add_with_fields(subscription_string, &[], &[], correlation_id)
    }

    /// Add a subscription string with extra fields and options.
    pub fn add_with_fields(
        &mut self,
        subscription_string: impl Into<String>,
        fields: &[&str],
        options: &[&str],
        correlation_id: Option<CorrelationId>,
    ) -> CorrelationId {
        let correlation_id = correlation_id.unwrap_or_else(CorrelationId::new);
        self.entries.push(SubscriptionEntry {
            subscription_string: subscription_string.into(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
            options: options.iter().map(|o| o.to_string()).collect(),
            correlation_id: correlation_id.clone(),
        });
        correlation_id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SubscriptionEntry> {
        self.entries.iter()
    }

    pub fn correlation_id_at(&self, index: usize) -> Option<&CorrelationId> {
        self.entries.get(index).map(|e| &e.correlation_id)
    }

    pub fn subscription_string_at(&self, index: usize) -> Option<&str> {
        self.entries.get(index).map(|e| e.subscription_string.as_str())
    }
}

impl<'a> IntoIterator for &'a SubscriptionList {
    type Item = &'a SubscriptionEntry;
    type IntoIter = std::slice::Iter<'a, SubscriptionEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
