//! Tools the assistant can call in the middle of a spoken reply.
//!
//! Each tool implements the [`Tool`] trait and is looked up by name in a
//! [`ToolRegistry`] when the model requests it.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use parley_core::config::{Config, ToolsConfig};
use parley_providers::ToolDefinition;

pub mod weather;

/// Context provided to tools during execution.
pub struct ToolContext {
    pub session_id: String,
    pub config: Arc<Config>,
}

/// Output from a tool execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// The core tool trait.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name as exposed to the LLM (e.g., "get_weather").
    fn name(&self) -> &str;

    /// JSON Schema describing the tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Human-readable description for the LLM.
    fn description(&self) -> &str;

    /// Execute the tool. Failures the model should hear about are returned
    /// as an error [`ToolOutput`]; `Err` is for failures of the tool itself.
    async fn execute(&self, params: serde_json::Value, context: &ToolContext) -> anyhow::Result<ToolOutput>;
}

/// Registry of available tools.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. A tool with the same name replaces the earlier one.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.retain(|t| t.name() != tool.name());
        self.tools.push(tool);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.iter().find(|t| t.name() == name).map(|t| t.as_ref())
    }

    pub fn list(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Tool definitions for the LLM request.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters_schema: t.parameters_schema(),
            })
            .collect()
    }

    /// Drop tools not permitted by the `tools.allow` / `tools.deny` lists.
    /// Deny wins over allow.
    pub fn apply_policy(&mut self, policy: &ToolsConfig) {
        if let Some(allow) = &policy.allow {
            self.tools.retain(|t| allow.iter().any(|a| a == t.name()));
        }
        if let Some(deny) = &policy.deny {
            self.tools.retain(|t| !deny.iter().any(|d| d == t.name()));
        }
    }
}

/// Register the built-in tools and apply the configured policy.
pub fn register_builtin_tools(registry: &mut ToolRegistry, config: &Config) {
    let tools_config = config.tools.clone().unwrap_or_default();
    let weather = tools_config.weather.clone().unwrap_or_default();
    registry.register(Box::new(weather::GetWeatherTool::new(&weather)));
    registry.apply_policy(&tools_config);
    tracing::debug!(tools = ?registry.list(), "Registered built-in tools");
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo(&'static str);

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            self.0
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        fn description(&self) -> &str {
            "echo"
        }
        async fn execute(&self, params: serde_json::Value, _context: &ToolContext) -> anyhow::Result<ToolOutput> {
            Ok(ToolOutput::ok(params.to_string()))
        }
    }

    #[test]
    fn test_register_replaces_same_name() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(Echo("a")));
        registry.register(Box::new(Echo("a")));
        registry.register(Box::new(Echo("b")));
        assert_eq!(registry.list(), vec!["a", "b"]);
        assert_eq!(registry.definitions()[1].name, "b");
    }

    #[test]
    fn test_policy_deny_wins() {
        let mut registry = ToolRegistry::new();
        for name in ["a", "b", "c"] {
            registry.register(Box::new(Echo(name)));
        }
        registry.apply_policy(&ToolsConfig {
            allow: Some(vec!["a".into(), "b".into()]),
            deny: Some(vec!["b".into()]),
            weather: None,
        });
        assert_eq!(registry.list(), vec!["a"]);
    }

    #[test]
    fn test_builtin_weather_registered() {
        let mut registry = ToolRegistry::new();
        register_builtin_tools(&mut registry, &Config::default());
        assert!(registry.get("get_weather").is_some());

        let denied = Config::parse(r#"{ tools: { deny: ["get_weather"] } }"#).unwrap();
        let mut registry = ToolRegistry::new();
        register_builtin_tools(&mut registry, &denied);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_execute_through_registry() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(Echo("echo")));
        let ctx = ToolContext {
            session_id: "s".into(),
            config: Arc::new(Config::default()),
        };
        let out = registry
            .get("echo")
            .unwrap()
            .execute(serde_json::json!({"x": 1}), &ctx)
            .await
            .unwrap();
        assert_eq!(out, ToolOutput::ok(r#"{"x":1}"#));
    }
}
