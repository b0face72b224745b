//! Node handlers - the per-type collaborator seam
//!
//! A handler is what actually talks to a navigation backend, a speech
//! dialogue or a detector. The executor only needs a `success` flag back;
//! everything else in the output is opaque data recorded on the node.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::{Map, Value};

use crate::graph::NodeType;

/// Context for node execution (immutable, clonable)
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub task_id: String,
    pub graph_id: String,
    pub scene: String,
    pub node_id: String,
    /// Snapshot of the task context at dispatch time
    pub context: Map<String, Value>,
}

impl NodeContext {
    pub fn new(
        task_id: impl Into<String>,
        graph_id: impl Into<String>,
        scene: impl Into<String>,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            graph_id: graph_id.into(),
            scene: scene.into(),
            node_id: node_id.into(),
            context: Map::new(),
        }
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    /// Get a context value by key
    pub fn get<T: serde::de::DeserializeOwned>(&self, key: &str) -> anyhow::Result<T> {
        let value = self
            .context
            .get(key)
            .ok_or_else(|| anyhow::anyhow!("Context key '{}' not found", key))?;
        serde_json::from_value(value.clone())
            .map_err(|e| anyhow::anyhow!("Failed to deserialize context key '{}': {}", key, e))
    }

    /// Get optional context value
    pub fn get_opt<T: serde::de::DeserializeOwned>(&self, key: &str) -> anyhow::Result<Option<T>> {
        match self.context.get(key) {
            Some(value) if !value.is_null() => {
                let parsed = serde_json::from_value(value.clone()).map_err(|e| {
                    anyhow::anyhow!("Failed to deserialize context key '{}': {}", key, e)
                })?;
                Ok(Some(parsed))
            }
            _ => Ok(None),
        }
    }
}

/// What a collaborator reports back
#[derive(Debug, Clone, PartialEq)]
pub struct NodeOutput {
    pub outputs: Option<Value>,
    pub success: bool,
    pub metadata: Option<Value>,
}

impl NodeOutput {
    pub fn success(outputs: Value) -> Self {
        Self {
            outputs: Some(outputs),
            success: true,
            metadata: None,
        }
    }

    pub fn success_empty() -> Self {
        Self {
            outputs: None,
            success: true,
            metadata: None,
        }
    }

    /// The collaborator ran but reports that the step did not succeed
    pub fn failure(outputs: Value) -> Self {
        Self {
            outputs: Some(outputs),
            success: false,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Collaborator for one node type
#[async_trait]
pub trait NodeHandler: Send + Sync {
    fn node_type(&self) -> NodeType;

    /// Run the step described by `config`
    async fn handle(&self, config: &Map<String, Value>, ctx: &NodeContext)
        -> anyhow::Result<NodeOutput>;
}

type HandlerFn =
    dyn Fn(Map<String, Value>, NodeContext) -> BoxFuture<'static, anyhow::Result<NodeOutput>>
        + Send
        + Sync;

/// Adapts an async closure into a [`NodeHandler`]
pub struct FnHandler {
    node_type: NodeType,
    func: Arc<HandlerFn>,
}

impl FnHandler {
    pub fn new<F, Fut>(node_type: NodeType, func: F) -> Self
    where
        F: Fn(Map<String, Value>, NodeContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<NodeOutput>> + Send + 'static,
    {
        Self {
            node_type,
            func: Arc::new(move |config, ctx| Box::pin(func(config, ctx))),
        }
    }
}

#[async_trait]
impl NodeHandler for FnHandler {
    fn node_type(&self) -> NodeType {
        self.node_type.clone()
    }

    async fn handle(
        &self,
        config: &Map<String, Value>,
        ctx: &NodeContext,
    ) -> anyhow::Result<NodeOutput> {
        (self.func)(config.clone(), ctx.clone()).await
    }
}

/// Registry of node handlers keyed by node type
#[derive(Clone)]
pub struct HandlerRegistry {
    handlers: Arc<RwLock<HashMap<NodeType, Arc<dyn NodeHandler>>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a handler, replacing any previous one for the same type
    pub fn register(&self, handler: Arc<dyn NodeHandler>) {
        let mut handlers = self.handlers.write();
        handlers.insert(handler.node_type(), handler);
    }

    pub fn unregister(&self, node_type: &NodeType) -> bool {
        self.handlers.write().remove(node_type).is_some()
    }

    pub fn get(&self, node_type: &NodeType) -> Option<Arc<dyn NodeHandler>> {
        self.handlers.read().get(node_type).cloned()
    }

    pub fn contains(&self, node_type: &NodeType) -> bool {
        self.handlers.read().contains_key(node_type)
    }

    pub fn list(&self) -> Vec<NodeType> {
        self.handlers.read().keys().cloned().collect()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
