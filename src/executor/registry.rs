//! Registry of operation handlers, keyed by operation kind

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::executor::handler::OperationHandler;

/// Shared, cloneable map of operation kind to handler
#[derive(Clone)]
pub struct OperationRegistry {
    handlers: Arc<RwLock<HashMap<String, Arc<dyn OperationHandler>>>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a handler, replacing any previous one for the same operation
    pub fn register(&self, handler: Arc<dyn OperationHandler>) {
        let operation = handler.operation().to_string();
        debug!(operation = %operation, "registering operation handler");
        self.handlers.write().insert(operation, handler);
    }

    pub fn get(&self, operation: &str) -> Option<Arc<dyn OperationHandler>> {
        self.handlers.read().get(operation).cloned()
    }

    pub fn contains(&self, operation: &str) -> bool {
        self.handlers.read().contains_key(operation)
    }

    /// Registered operation kinds, sorted
    pub fn operations(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::operations::register_builtin_operations;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_builtin_operations_are_registered() {
        let registry = OperationRegistry::new();
        register_builtin_operations(&registry, &Default::default());
        assert_eq!(
            registry.operations(),
            vec![
                "convert",
                "export/url",
                "import/upload",
                "import/url",
                "import/webpage",
                "merge"
            ]
        );
        assert!(registry.contains("convert"));
        assert!(registry.get("transcode").is_none());
    }
}
