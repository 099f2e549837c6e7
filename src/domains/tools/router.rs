//! Call Router - dispatches qualified tool calls against the live registry.
//!
//! The router never caches a registry. Every call reads the current
//! generation, so a reload is visible to the very next call.

use std::sync::Arc;

use rmcp::model::Tool;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, instrument};

use super::error::ToolError;
use crate::domains::registry::AggregatedRegistry;

/// Routes calls to the descriptor that owns them.
#[derive(Clone)]
pub struct CallRouter {
    registry: watch::Receiver<Arc<AggregatedRegistry>>,
}

impl CallRouter {
    /// Create a router reading from the published registry.
    pub fn new(registry: watch::Receiver<Arc<AggregatedRegistry>>) -> Self {
        Self { registry }
    }

    /// The generation currently live.
    pub fn snapshot(&self) -> Arc<AggregatedRegistry> {
        self.registry.borrow().clone()
    }

    /// Wait until a new generation is published.
    ///
    /// Returns `false` once the publisher is gone.
    pub async fn changed(&mut self) -> bool {
        self.registry.changed().await.is_ok()
    }

    /// Tool models for every exposed tool.
    pub fn list_tools(&self) -> Vec<Tool> {
        self.snapshot().tools().iter().map(|d| d.to_tool()).collect()
    }

    /// Call `qualified_name` with `arguments`.
    #[instrument(skip(self, arguments))]
    pub async fn call(&self, qualified_name: &str, arguments: Option<Value>) -> Result<Value, ToolError> {
        let registry = self.snapshot();
        let Some(descriptor) = registry.get(qualified_name) else {
            debug!("Unknown tool requested: {}", qualified_name);
            return Err(ToolError::not_found(qualified_name, registry.tool_names()));
        };
        // Holding the descriptor keeps it usable even if a reload swaps the
        // registry mid-call.
        drop(registry);
        descriptor.invoke(arguments).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::connections::{ConnectionManager, ConnectionSettings};
    use crate::domains::directory::MemoryDirectory;
    use crate::domains::tools::{ParamSchema, ToolDescriptor};
    use serde_json::json;

    #[tokio::test]
    async fn test_unknown_tool_lists_known_names() {
        let directory = Arc::new(MemoryDirectory::new());
        let pool = ConnectionManager::new(directory.clone(), directory.clone(), ConnectionSettings::default());
        let registry = AggregatedRegistry::new(
            1,
            vec![(
                "a".to_string(),
                vec![ToolDescriptor::new("a", "echo", "", ParamSchema::Any, pool.clone())],
            )],
        );
        let (_tx, rx) = watch::channel(Arc::new(registry));
        let router = CallRouter::new(rx);

        let err = router.call("b/sum", Some(json!({}))).await.unwrap_err();
        match err {
            ToolError::NotFound { name, known } => {
                assert_eq!(name, "b/sum");
                assert_eq!(known, vec!["a/echo"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(directory.launch_lookups(), 0);
        assert_eq!(pool.opened_connections(), 0);
    }

    #[tokio::test]
    async fn test_router_sees_new_generation() {
        let (tx, rx) = watch::channel(Arc::new(AggregatedRegistry::empty()));
        let mut router = CallRouter::new(rx);
        assert!(router.list_tools().is_empty());

        let directory = Arc::new(MemoryDirectory::new());
        let pool = ConnectionManager::new(directory.clone(), directory, ConnectionSettings::default());
        tx.send_replace(Arc::new(AggregatedRegistry::new(
            2,
            vec![(
                "a".to_string(),
                vec![ToolDescriptor::new("a", "echo", "Echo", ParamSchema::Any, pool)],
            )],
        )));

        assert!(router.changed().await);
        let tools = router.list_tools();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "a/echo");
        assert_eq!(router.snapshot().generation(), 2);
    }
}
