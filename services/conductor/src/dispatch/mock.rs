//! Recording dispatcher for testing.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use super::{ComputeOperation, DispatchError, DispatchMode, Dispatcher};

/// One dispatched operation.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRecord {
    pub host: String,
    pub operation: ComputeOperation,
    pub mode: DispatchMode,
    pub args: Value,
}

impl DispatchRecord {
    /// Decodes the arguments into their typed form.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.args.clone())
    }
}

/// Mock dispatcher.
///
/// Every dispatch is recorded, including failed ones. Failures are queued
/// per `(host, operation)`; call replies per operation default to null.
#[derive(Debug, Default)]
pub struct MockDispatcher {
    records: Mutex<Vec<DispatchRecord>>,
    failures: Mutex<HashMap<(String, ComputeOperation), VecDeque<DispatchError>>>,
    replies: Mutex<HashMap<ComputeOperation, Value>>,
}

impl MockDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next dispatch of `operation` to `host` fail with `error`.
    pub fn fail_next(&self, host: &str, operation: ComputeOperation, error: DispatchError) {
        if let Ok(mut failures) = self.failures.lock() {
            failures
                .entry((host.to_string(), operation))
                .or_default()
                .push_back(error);
        }
    }

    /// Reply returned by every successful call of `operation`.
    pub fn reply_with(&self, operation: ComputeOperation, reply: Value) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.insert(operation, reply);
        }
    }

    pub fn records(&self) -> Vec<DispatchRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn records_for(&self, operation: ComputeOperation) -> Vec<DispatchRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.operation == operation)
            .collect()
    }

    pub fn count(&self, operation: ComputeOperation) -> usize {
        self.records_for(operation).len()
    }

    fn record(
        &self,
        host: &str,
        operation: ComputeOperation,
        mode: DispatchMode,
        args: Value,
    ) -> Result<(), DispatchError> {
        debug!(host = %host, operation = %operation, "[MOCK] dispatch");
        if let Ok(mut records) = self.records.lock() {
            records.push(DispatchRecord {
                host: host.to_string(),
                operation,
                mode,
                args,
            });
        }
        let failure = self
            .failures
            .lock()
            .ok()
            .and_then(|mut f| f.get_mut(&(host.to_string(), operation))?.pop_front());
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Dispatcher for MockDispatcher {
    async fn cast(
        &self,
        host: &str,
        operation: ComputeOperation,
        args: Value,
    ) -> Result<(), DispatchError> {
        self.record(host, operation, DispatchMode::Cast, args)
    }

    async fn call(
        &self,
        host: &str,
        operation: ComputeOperation,
        args: Value,
    ) -> Result<Value, DispatchError> {
        self.record(host, operation, DispatchMode::Call, args)?;
        Ok(self
            .replies
            .lock()
            .ok()
            .and_then(|r| r.get(&operation).cloned())
            .unwrap_or(Value::Null))
    }
}
