//! Notifications.
//!
//! Notifying is fire-and-forget: a notification that cannot be built or
//! delivered is logged and dropped, never failing the workflow.

use std::sync::Mutex;

use fleet_events::{ActionEventPayload, ActionPhase, Notification, Priority};
use fleet_id::{InstanceId, RequestId};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::TaskResult;

/// Notification sink.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: Notification) {
        let payload = notification.payload.to_string();
        match notification.priority {
            Priority::Info => info!(
                event_type = %notification.event_type,
                publisher_id = %notification.publisher_id,
                payload = %payload,
                "Notification"
            ),
            Priority::Warn => warn!(
                event_type = %notification.event_type,
                publisher_id = %notification.publisher_id,
                payload = %payload,
                "Notification"
            ),
            Priority::Error => error!(
                event_type = %notification.event_type,
                publisher_id = %notification.publisher_id,
                payload = %payload,
                "Notification"
            ),
        }
    }
}

/// Keeps every notification for later inspection.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    notifications: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications
            .lock()
            .map(|n| n.clone())
            .unwrap_or_default()
    }

    pub fn of_type(&self, event_type: &str) -> Vec<Notification> {
        self.notifications()
            .into_iter()
            .filter(|n| n.event_type == event_type)
            .collect()
    }

    pub fn event_types(&self) -> Vec<String> {
        self.notifications()
            .into_iter()
            .map(|n| n.event_type)
            .collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: Notification) {
        if let Ok(mut notifications) = self.notifications.lock() {
            notifications.push(notification);
        }
    }
}

/// Builds and sends a notification, logging instead of failing.
pub fn emit<P: Serialize>(
    notifier: &dyn Notifier,
    publisher_id: &str,
    request_id: RequestId,
    event_type: &str,
    priority: Priority,
    payload: P,
) {
    let built = Notification::builder()
        .publisher(publisher_id)
        .event_type(event_type)
        .priority(priority)
        .request_id(request_id)
        .payload(payload)
        .build()
        .and_then(Notification::into_value);

    match built {
        Ok(notification) => notifier.notify(notification),
        Err(e) => warn!(event_type = %event_type, error = %e, "Dropping notification"),
    }
}

/// Emits `conductor.<action>.start|end|error` around a manager operation.
pub struct ActionReporter<'a> {
    notifier: &'a dyn Notifier,
    publisher_id: &'a str,
    request_id: RequestId,
    action: &'static str,
    instance_ids: Vec<InstanceId>,
}

impl<'a> ActionReporter<'a> {
    /// Emits the start event.
    pub fn start(
        notifier: &'a dyn Notifier,
        publisher_id: &'a str,
        request_id: RequestId,
        action: &'static str,
        instance_ids: Vec<InstanceId>,
    ) -> Self {
        let reporter = Self {
            notifier,
            publisher_id,
            request_id,
            action,
            instance_ids,
        };
        reporter.emit(ActionPhase::Start, Priority::Info, None);
        reporter
    }

    /// Emits the end or error event for `result`.
    pub fn finish<T>(self, result: &TaskResult<T>) {
        match result {
            Ok(_) => self.emit(ActionPhase::End, Priority::Info, None),
            Err(e) => self.emit(ActionPhase::Error, Priority::Error, Some(e.to_string())),
        }
    }

    fn emit(&self, phase: ActionPhase, priority: Priority, error: Option<String>) {
        emit(
            self.notifier,
            self.publisher_id,
            self.request_id,
            &phase.event_type(self.action),
            priority,
            ActionEventPayload {
                action: self.action.to_string(),
                instance_ids: self.instance_ids.clone(),
                phase,
                error,
            },
        );
    }
}
