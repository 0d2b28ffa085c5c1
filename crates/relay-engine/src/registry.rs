use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

use relay_core::tools::{Tool, ToolDefinition, ToolError};

use crate::error::RegistryError;

/// Closure-backed executor: arguments in, JSON value out.
pub type ToolFn = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, ToolError>> + Send + Sync>;

const MAX_NAME_LEN: usize = 64;

/// How a registered tool is executed.
#[derive(Clone)]
pub enum Executor {
    Tool(Arc<dyn Tool>),
    Fn {
        definition: ToolDefinition,
        func: ToolFn,
    },
}

impl Executor {
    pub fn definition(&self) -> ToolDefinition {
        match self {
            Self::Tool(tool) => tool.to_definition(),
            Self::Fn { definition, .. } => definition.clone(),
        }
    }

    pub fn execute(&self, args: Value) -> BoxFuture<'static, Result<Value, ToolError>> {
        match self {
            Self::Tool(tool) => {
                let tool = Arc::clone(tool);
                async move { tool.execute(args).await }.boxed()
            }
            Self::Fn { func, .. } => func(args),
        }
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tool(tool) => f.debug_tuple("Tool").field(&tool.name()).finish(),
            Self::Fn { definition, .. } => f.debug_tuple("Fn").field(&definition.name).finish(),
        }
    }
}

/// Name → executor table. Entries are validated when registered, so anything
/// the dispatcher finds here has a legal name and an object parameter schema.
#[derive(Clone, Debug, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Executor>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), RegistryError> {
        let definition = tool.to_definition();
        self.insert(definition, Executor::Tool(tool))
    }

    /// Register an async closure as a tool.
    pub fn register_fn<F, Fut>(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        func: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        let definition = ToolDefinition {
            name: name.into(),
            description: description.into(),
            parameters,
        };
        let func: ToolFn = Arc::new(move |args| func(args).boxed());
        self.insert(definition.clone(), Executor::Fn { definition, func })
    }

    fn insert(&mut self, definition: ToolDefinition, executor: Executor) -> Result<(), RegistryError> {
        validate_name(&definition.name)?;
        validate_parameters(&definition)?;
        if self.tools.contains_key(&definition.name) {
            return Err(RegistryError::Duplicate(definition.name));
        }
        self.tools.insert(definition.name, executor);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Executor> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Definitions sent to the backend, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self.tools.values().map(Executor::definition).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

fn validate_name(name: &str) -> Result<(), RegistryError> {
    let legal = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if legal {
        Ok(())
    } else {
        Err(RegistryError::InvalidName(name.to_string()))
    }
}

fn validate_parameters(definition: &ToolDefinition) -> Result<(), RegistryError> {
    let invalid = |reason: &str| RegistryError::InvalidSchema {
        name: definition.name.clone(),
        reason: reason.to_string(),
    };
    let Some(schema) = definition.parameters.as_object() else {
        return Err(invalid("parameters must be a JSON object"));
    };
    match schema.get("type").and_then(Value::as_str) {
        Some("object") => {}
        _ => return Err(invalid("parameters must have \"type\": \"object\"")),
    }
    if let Some(props) = schema.get("properties") {
        if !props.is_object() {
            return Err(invalid("\"properties\" must be an object"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    struct Weather;

    #[async_trait]
    impl Tool for Weather {
        fn name(&self) -> &str {
            "get_weather"
        }
        fn description(&self) -> &str {
            "Current weather for a city"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object", "properties": {"city": {"type": "string"}}, "required": ["city"]})
        }
        async fn execute(&self, args: Value) -> Result<Value, ToolError> {
            let city = args["city"]
                .as_str()
                .ok_or_else(|| ToolError::InvalidArguments("missing city".into()))?;
            Ok(json!({"city": city, "temp_c": 21}))
        }
    }

    fn object_schema() -> Value {
        json!({"type": "object", "properties": {}})
    }

    #[test]
    fn register_and_lookup() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Weather)).unwrap();
        assert!(registry.contains("get_weather"));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("nope").is_none());
    }

    #[test]
    fn duplicate_rejected() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Weather)).unwrap();
        let err = registry.register(Arc::new(Weather)).unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate(name) if name == "get_weather"));
    }

    #[test]
    fn invalid_names_rejected() {
        let mut registry = ToolRegistry::new();
        let long = "x".repeat(65);
        for name in ["", "has space", "dots.not.ok", long.as_str()] {
            let err = registry
                .register_fn(name, "bad", object_schema(), |_| async { Ok(json!(null)) })
                .unwrap_err();
            assert!(matches!(err, RegistryError::InvalidName(_)), "{name:?}");
        }
        registry
            .register_fn("ok-name_1", "fine", object_schema(), |_| async { Ok(json!(null)) })
            .unwrap();
    }

    #[test]
    fn non_object_schema_rejected() {
        let mut registry = ToolRegistry::new();
        let err = registry
            .register_fn("t", "d", json!({"type": "string"}), |_| async { Ok(json!(1)) })
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidSchema { .. }));

        let err = registry
            .register_fn("t", "d", json!([]), |_| async { Ok(json!(1)) })
            .unwrap_err();
        assert!(err.to_string().contains("JSON object"));
        assert!(registry.is_empty());
    }

    #[test]
    fn definitions_sorted() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Weather)).unwrap();
        registry
            .register_fn("add", "Add two numbers", object_schema(), |_| async { Ok(json!(0)) })
            .unwrap();
        let names: Vec<String> = registry.definitions().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["add", "get_weather"]);
        assert_eq!(registry.names(), names);
    }

    #[tokio::test]
    async fn both_executor_kinds_run() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Weather)).unwrap();
        registry
            .register_fn("add", "Add", object_schema(), |args: Value| async move {
                let a = args["a"].as_i64().unwrap_or(0);
                let b = args["b"].as_i64().unwrap_or(0);
                Ok(json!(a + b))
            })
            .unwrap();

        let weather = registry.get("get_weather").unwrap();
        let out = weather.execute(json!({"city": "Oslo"})).await.unwrap();
        assert_eq!(out["city"], "Oslo");

        let add = registry.get("add").unwrap();
        assert_eq!(add.execute(json!({"a": 2, "b": 3})).await.unwrap(), json!(5));
        assert!(matches!(
            weather.execute(json!({})).await,
            Err(ToolError::InvalidArguments(_))
        ));
    }
}
