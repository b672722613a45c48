//! Tool Registry: the name → capability-record map the Turn Loop hands to
//! the LLM adapter (as tool definitions) and the Queue (to dispatch a
//! tool-use block to its implementation).

use std::collections::HashMap;
use std::sync::Arc;

use ac_domain::capability::ToolCapability;
use ac_domain::tool::ToolDefinition;

/// Immutable once built. One instance is shared across every turn in a
/// session; tools themselves hold no turn-scoped state.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn ToolCapability>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: HashMap::new() }
    }

    pub fn register(&mut self, tool: Arc<dyn ToolCapability>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolCapability>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// Tool definitions for the LLM adapter, restricted to `toolset` when
    /// it's non-empty (empty means "every registered tool").
    pub fn definitions(&self, toolset: &[String]) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .filter(|t| toolset.is_empty() || toolset.iter().any(|n| n == t.name()))
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: String::new(),
                parameters: t.input_schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Tools a `safe_mode` turn may use: read-only capabilities only.
    pub fn read_only_names(&self) -> Vec<String> {
        self.tools.values().filter(|t| t.is_read_only()).map(|t| t.name().to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ac_domain::capability::{ToolEvent, ToolEventStream};
    use ac_domain::context::ToolUseContext;
    use ac_domain::Result;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct Dummy;

    #[async_trait]
    impl ToolCapability for Dummy {
        fn name(&self) -> &'static str {
            "Dummy"
        }
        fn input_schema(&self) -> Value {
            json!({})
        }
        fn is_read_only(&self) -> bool {
            true
        }
        async fn validate_input(&self, _input: &Value, _ctx: &ToolUseContext) -> Result<()> {
            Ok(())
        }
        fn call(&self, _input: Value, _ctx: ToolUseContext) -> ToolEventStream {
            Box::pin(futures_util::stream::once(async { Ok(ToolEvent::ok(json!({}), "")) }))
        }
    }

    #[test]
    fn register_and_lookup() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(Dummy));
        assert!(reg.get("Dummy").is_some());
        assert!(reg.get("Nope").is_none());
    }

    #[test]
    fn definitions_filtered_by_toolset() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(Dummy));
        assert_eq!(reg.definitions(&[]).len(), 1);
        assert_eq!(reg.definitions(&["Dummy".to_string()]).len(), 1);
        assert_eq!(reg.definitions(&["Other".to_string()]).len(), 0);
    }

    #[test]
    fn read_only_names_includes_dummy() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(Dummy));
        assert_eq!(reg.read_only_names(), vec!["Dummy".to_string()]);
    }
}
