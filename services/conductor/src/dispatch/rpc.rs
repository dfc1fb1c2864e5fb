//! Versioned RPC over a pluggable transport.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

use super::{ComputeOperation, DispatchError, Dispatcher, RemoteFault, TransportError};
use crate::compat::{make_compatible, Version};
use crate::config::ConductorConfig;

/// Topic a host's compute agent listens on.
pub fn compute_topic(host: &str) -> String {
    format!("compute.{host}")
}

/// A message on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcMessage {
    pub topic: String,
    pub operation: ComputeOperation,
    pub version: Version,
    pub args: Value,
}

/// Message bus.
///
/// A transport error means delivery state is unknown. A `call` that reaches
/// its handler returns the handler's outcome as the inner result.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn cast(&self, message: RpcMessage) -> Result<(), TransportError>;

    async fn call(&self, message: RpcMessage) -> Result<Result<Value, RemoteFault>, TransportError>;
}

/// Dispatcher that negotiates a version per host and backports payloads.
pub struct RpcDispatcher {
    transport: Arc<dyn Transport>,
    default_cap: Version,
    pins: RwLock<HashMap<String, Version>>,
    call_timeout: Duration,
}

impl RpcDispatcher {
    pub fn new(transport: Arc<dyn Transport>, config: &ConductorConfig) -> Self {
        Self {
            transport,
            default_cap: config.compute_version_cap,
            pins: RwLock::new(HashMap::new()),
            call_timeout: config.rpc_call_timeout,
        }
    }

    /// Pins a host to an explicit version cap, e.g. during a rolling upgrade.
    pub fn pin_host_version(&self, host: &str, cap: Version) {
        if let Ok(mut pins) = self.pins.write() {
            pins.insert(host.to_string(), cap);
        }
    }

    pub fn cap_for(&self, host: &str) -> Version {
        self.pins
            .read()
            .ok()
            .and_then(|pins| pins.get(host).copied())
            .unwrap_or(self.default_cap)
    }

    /// Builds the message for `host`, backported to its cap.
    pub fn prepare(
        &self,
        host: &str,
        operation: ComputeOperation,
        args: Value,
    ) -> Result<RpcMessage, DispatchError> {
        let cap = self.cap_for(host);
        let version = operation.latest_version().min(cap);
        if version < operation.min_version() {
            return Err(TransportError::Incompatible {
                host: host.to_string(),
                operation,
                cap,
                minimum: operation.min_version(),
            }
            .into());
        }

        let Value::Object(mut fields) = args else {
            return Err(DispatchError::Encode {
                operation,
                reason: "arguments must be an object".to_string(),
            });
        };
        make_compatible(
            &mut fields,
            operation.latest_version(),
            version,
            operation.backports(),
        )
        .map_err(|e| DispatchError::Encode {
            operation,
            reason: e.to_string(),
        })?;

        Ok(RpcMessage {
            topic: compute_topic(host),
            operation,
            version,
            args: Value::Object(fields),
        })
    }
}

#[async_trait]
impl Dispatcher for RpcDispatcher {
    #[instrument(skip(self, operation, args), fields(operation = %operation))]
    async fn cast(
        &self,
        host: &str,
        operation: ComputeOperation,
        args: Value,
    ) -> Result<(), DispatchError> {
        let message = self.prepare(host, operation, args)?;
        debug!(version = %message.version, "Casting to compute");
        self.transport.cast(message).await?;
        Ok(())
    }

    #[instrument(skip(self, operation, args), fields(operation = %operation))]
    async fn call(
        &self,
        host: &str,
        operation: ComputeOperation,
        args: Value,
    ) -> Result<Value, DispatchError> {
        let message = self.prepare(host, operation, args)?;
        debug!(version = %message.version, "Calling compute");

        match tokio::time::timeout(self.call_timeout, self.transport.call(message)).await {
            Err(_) => Err(DispatchError::timeout(host, operation, self.call_timeout)),
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(Err(fault))) => Err(DispatchError::remote(host, operation, fault)),
            Ok(Ok(Ok(reply))) => Ok(reply),
        }
    }
}
