//! Tool registry: name-keyed catalog of tools, shared by every agent loop.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{Capability, Tool, ToolDefinition, ToolError};

/// Catalog entry.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
    pub capability: Capability,
}

/// Read-mostly; the write lock is taken only while registering.
pub struct ToolRegistry {
    inner: Arc<RwLock<BTreeMap<String, Arc<dyn Tool>>>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// Add a tool. Names are unique; a second registration fails instead of replacing.
    pub async fn register(&self, tool: Arc<dyn Tool>) -> Result<(), ToolError> {
        let name = tool.name().to_string();
        let mut g = self.inner.write().await;
        if g.contains_key(&name) {
            return Err(ToolError::DuplicateTool(name));
        }
        log::debug!("registered tool {} ({})", name, tool.capability().as_str());
        g.insert(name, tool);
        Ok(())
    }

    pub async fn resolve(&self, name: &str) -> Result<Arc<dyn Tool>, ToolError> {
        self.inner
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))
    }

    /// Current catalog, sorted by name.
    pub async fn list(&self) -> Vec<ToolDescriptor> {
        self.inner
            .read()
            .await
            .values()
            .map(|t| ToolDescriptor {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters(),
                capability: t.capability(),
            })
            .collect()
    }

    /// Catalog in the provider's function-calling format.
    pub async fn definitions(&self) -> Vec<ToolDefinition> {
        self.list()
            .await
            .into_iter()
            .map(|d| ToolDefinition::function(&d.name, &d.description, d.parameters))
            .collect()
    }

    pub async fn names(&self) -> Vec<String> {
        self.inner.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolContext;
    use async_trait::async_trait;
    use serde_json::{json, Map, Value};

    struct Named(&'static str);

    #[async_trait]
    impl Tool for Named {
        fn name(&self) -> &str {
            self.0
        }
        fn description(&self) -> &str {
            "test tool"
        }
        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }
        fn capability(&self) -> Capability {
            Capability::Filesystem
        }
        async fn execute(&self, _args: Map<String, Value>, _ctx: &ToolContext) -> Result<String, ToolError> {
            Ok(self.0.to_string())
        }
    }

    #[tokio::test]
    async fn duplicate_registration_fails_and_keeps_original() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(Named("read_file"))).await.unwrap();
        let err = registry.register(Arc::new(Named("read_file"))).await.unwrap_err();
        assert_eq!(err, ToolError::DuplicateTool("read_file".to_string()));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn resolve_unknown_fails() {
        let registry = ToolRegistry::new();
        assert!(matches!(
            registry.resolve("nope").await,
            Err(ToolError::UnknownTool(n)) if n == "nope"
        ));
    }

    #[tokio::test]
    async fn list_is_sorted_and_definitions_match() {
        let registry = ToolRegistry::new();
        for n in ["write_file", "exec", "list_dir"] {
            registry.register(Arc::new(Named(n))).await.unwrap();
        }
        let names: Vec<String> = registry.list().await.into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["exec", "list_dir", "write_file"]);
        let defs = registry.definitions().await;
        assert_eq!(defs.len(), 3);
        assert_eq!(defs[0].typ, "function");
        assert_eq!(defs[0].function.name, "exec");
    }
}
