//! In-process transport.
//!
//! Each registered host gets a [`HandlerRegistry`] mapping operations to
//! async handlers. Casts run the handler on a spawned task; calls await it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;
use tracing::{info, warn};

use super::{compute_topic, ComputeOperation, FaultKind, RemoteFault, RpcMessage, Transport, TransportError};

type Handler = Arc<dyn Fn(RpcMessage) -> BoxFuture<'static, Result<Value, RemoteFault>> + Send + Sync>;

/// Operation handlers of one compute agent, resolved at startup.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<ComputeOperation, Handler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(mut self, operation: ComputeOperation, handler: F) -> Self
    where
        F: Fn(RpcMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RemoteFault>> + Send + 'static,
    {
        self.handlers
            .insert(operation, Arc::new(move |message| handler(message).boxed()));
        self
    }

    /// Agent that logs and accepts every operation.
    pub fn acknowledging(host: &str) -> Self {
        ComputeOperation::ALL
            .into_iter()
            .fold(Self::new(), |registry, operation| {
                let host = host.to_string();
                registry.register(operation, move |message: RpcMessage| {
                    let host = host.clone();
                    async move {
                        info!(
                            host = %host,
                            operation = %message.operation,
                            version = %message.version,
                            "[DEV] Compute operation accepted"
                        );
                        Ok(Value::Null)
                    }
                })
            })
    }

    pub fn handles(&self, operation: ComputeOperation) -> bool {
        self.handlers.contains_key(&operation)
    }

    async fn handle(&self, message: RpcMessage) -> Result<Value, RemoteFault> {
        match self.handlers.get(&message.operation) {
            Some(handler) => handler(message).await,
            None => Err(RemoteFault::new(
                FaultKind::Unsupported,
                format!("no handler for {}", message.operation),
            )),
        }
    }
}

/// Routes messages by topic to registered agents.
#[derive(Default)]
pub struct LocalTransport {
    agents: RwLock<HashMap<String, Arc<HandlerRegistry>>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_agent(&self, host: &str, handlers: HandlerRegistry) {
        if let Ok(mut agents) = self.agents.write() {
            agents.insert(compute_topic(host), Arc::new(handlers));
        }
    }

    pub fn remove_agent(&self, host: &str) {
        if let Ok(mut agents) = self.agents.write() {
            agents.remove(&compute_topic(host));
        }
    }

    fn agent(&self, topic: &str) -> Result<Arc<HandlerRegistry>, TransportError> {
        self.agents
            .read()
            .map_err(|_| TransportError::Connection("agent table lock poisoned".to_string()))?
            .get(topic)
            .cloned()
            .ok_or_else(|| TransportError::Unreachable(topic.to_string()))
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn cast(&self, message: RpcMessage) -> Result<(), TransportError> {
        let agent = self.agent(&message.topic)?;
        tokio::spawn(async move {
            let topic = message.topic.clone();
            let operation = message.operation;
            if let Err(fault) = agent.handle(message).await {
                warn!(topic = %topic, operation = %operation, error = %fault, "Cast handler failed");
            }
        });
        Ok(())
    }

    async fn call(&self, message: RpcMessage) -> Result<Result<Value, RemoteFault>, TransportError> {
        let agent = self.agent(&message.topic)?;
        Ok(agent.handle(message).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compat::Version;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn message(host: &str, operation: ComputeOperation) -> RpcMessage {
        RpcMessage {
            topic: compute_topic(host),
            operation,
            version: Version::new(4, 0),
            args: json!({}),
        }
    }

    #[tokio::test]
    async fn test_call_reaches_handler() {
        let transport = LocalTransport::new();
        transport.register_agent(
            "host-b",
            HandlerRegistry::new().register(
                ComputeOperation::CheckCanLiveMigrateDestination,
                |_| async { Ok(json!({"block_migration": false})) },
            ),
        );

        let reply = transport
            .call(message("host-b", ComputeOperation::CheckCanLiveMigrateDestination))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply["block_migration"], json!(false));
    }

    #[tokio::test]
    async fn test_missing_handler_is_unsupported_fault() {
        let transport = LocalTransport::new();
        transport.register_agent("host-b", HandlerRegistry::new());

        let fault = transport
            .call(message("host-b", ComputeOperation::PrepResize))
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(fault.kind, FaultKind::Unsupported);
    }

    #[tokio::test]
    async fn test_cast_runs_handler_in_background() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = LocalTransport::new();
        transport.register_agent(
            "host-b",
            HandlerRegistry::new().register(ComputeOperation::StartInstance, move |m| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(m.operation);
                    Ok(Value::Null)
                }
            }),
        );

        transport
            .cast(message("host-b", ComputeOperation::StartInstance))
            .await
            .unwrap();
        assert_eq!(rx.recv().await, Some(ComputeOperation::StartInstance));
    }

    #[tokio::test]
    async fn test_removed_agent_is_unreachable() {
        let transport = LocalTransport::new();
        transport.register_agent("host-b", HandlerRegistry::acknowledging("host-b"));
        assert!(transport
            .call(message("host-b", ComputeOperation::StartInstance))
            .await
            .is_ok());

        transport.remove_agent("host-b");
        assert!(matches!(
            transport
                .cast(message("host-b", ComputeOperation::StartInstance))
                .await,
            Err(TransportError::Unreachable(_))
        ));
    }

    #[test]
    fn test_acknowledging_agent_handles_everything() {
        let registry = HandlerRegistry::acknowledging("host-a");
        assert!(ComputeOperation::ALL.iter().all(|op| registry.handles(*op)));
    }
}
