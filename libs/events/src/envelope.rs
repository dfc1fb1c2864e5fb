//! Notification envelope - the common wrapper for every emitted event.

use chrono::{DateTime, Utc};
use fleet_id::RequestId;
use serde::{Deserialize, Serialize};

use crate::EventError;

/// Notification priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    #[default]
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Info => write!(f, "INFO"),
            Priority::Warn => write!(f, "WARN"),
            Priority::Error => write!(f, "ERROR"),
        }
    }
}

/// The notification envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification<P = serde_json::Value> {
    /// When the notification was produced.
    pub occurred_at: DateTime<Utc>,

    /// Who emitted it, e.g. `conductor.host-a` or `compute_task`.
    pub publisher_id: String,

    /// Dotted event type, e.g. `compute_task.migrate_server`.
    pub event_type: String,

    /// Severity.
    pub priority: Priority,

    /// Correlates all notifications of one conductor request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,

    /// Event-specific payload.
    pub payload: P,
}

impl<P> Notification<P> {
    /// Creates a new notification builder.
    pub fn builder() -> NotificationBuilder<P> {
        NotificationBuilder::new()
    }

    /// The service part of the event type (`compute_task` in
    /// `compute_task.migrate_server`).
    pub fn service(&self) -> &str {
        self.event_type
            .split_once('.')
            .map(|(service, _)| service)
            .unwrap_or(&self.event_type)
    }
}

impl<P: Serialize> Notification<P> {
    /// Erases the payload type.
    pub fn into_value(self) -> Result<Notification, EventError> {
        Ok(Notification {
            occurred_at: self.occurred_at,
            publisher_id: self.publisher_id,
            event_type: self.event_type,
            priority: self.priority,
            request_id: self.request_id,
            payload: serde_json::to_value(self.payload)?,
        })
    }
}

/// Builder for notifications.
#[derive(Debug)]
pub struct NotificationBuilder<P> {
    occurred_at: Option<DateTime<Utc>>,
    publisher_id: Option<String>,
    event_type: Option<String>,
    priority: Priority,
    request_id: Option<RequestId>,
    payload: Option<P>,
}

impl<P> NotificationBuilder<P> {
    pub fn new() -> Self {
        Self {
            occurred_at: None,
            publisher_id: None,
            event_type: None,
            priority: Priority::Info,
            request_id: None,
            payload: None,
        }
    }

    pub fn occurred_at(mut self, ts: DateTime<Utc>) -> Self {
        self.occurred_at = Some(ts);
        self
    }

    pub fn publisher(mut self, publisher_id: impl Into<String>) -> Self {
        self.publisher_id = Some(publisher_id.into());
        self
    }

    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn request_id(mut self, request_id: RequestId) -> Self {
        self.request_id = Some(request_id);
        self
    }

    pub fn payload(mut self, payload: P) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Builds the notification.
    ///
    /// Fails if the publisher, event type or payload is missing, or if the
    /// event type has no service prefix.
    pub fn build(self) -> Result<Notification<P>, EventError> {
        let event_type = self
            .event_type
            .ok_or(EventError::MissingField("event_type"))?;
        match event_type.split_once('.') {
            Some((service, name)) if !service.is_empty() && !name.is_empty() => {}
            _ => return Err(EventError::InvalidEventType(event_type)),
        }

        Ok(Notification {
            occurred_at: self.occurred_at.unwrap_or_else(Utc::now),
            publisher_id: self
                .publisher_id
                .ok_or(EventError::MissingField("publisher_id"))?,
            event_type,
            priority: self.priority,
            request_id: self.request_id,
            payload: self.payload.ok_or(EventError::MissingField("payload"))?,
        })
    }
}

impl<P> Default for NotificationBuilder<P> {
    fn default() -> Self {
        Self::new()
    }
}
