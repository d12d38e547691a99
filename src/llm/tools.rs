//! Named, schema-validated functions the model may call during a cycle.

use super::ToolDefinition;
use crate::{Error, Result};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

pub type ToolFuture = BoxFuture<'static, anyhow::Result<Value>>;

pub type ToolHandler = Arc<dyn Fn(Value) -> ToolFuture + Send + Sync>;

/// Outcome of one `tool_use` request. Exactly one of `output` and `error`
/// is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub tool_use_id: String,
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct RegisteredTool {
    definition: ToolDefinition,
    handler: ToolHandler,
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<RegisteredTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async handler. Re-registering a name replaces the old tool
    /// in place, keeping its position in [`definitions`](Self::definitions).
    pub fn register(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: ToolHandler,
    ) {
        let tool = Arc::new(RegisteredTool {
            definition: ToolDefinition { name: name.into(), description: description.into(), input_schema },
            handler,
        });
        match self.tools.iter().position(|t| t.definition.name == tool.definition.name) {
            | Some(i) => self.tools[i] = tool,
            | None => self.tools.push(tool),
        }
    }

    /// Register a synchronous handler.
    pub fn register_fn<F>(&mut self, name: impl Into<String>, description: impl Into<String>, input_schema: Value, f: F)
    where
        F: Fn(Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let handler: ToolHandler = Arc::new(move |args| {
            let f = f.clone();
            Box::pin(async move { f(args) })
        });
        self.register(name, description, input_schema, handler);
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t.definition.name == name)
    }

    /// Tool schemas in registration order, for inclusion in provider requests.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition.clone()).collect()
    }

    pub async fn execute(&self, name: &str, args: Value) -> Result<Value> {
        let tool = self
            .tools
            .iter()
            .find(|t| t.definition.name == name)
            .cloned()
            .ok_or_else(|| Error::ToolNotFound(name.to_string()))?;
        validate(&tool.definition.input_schema, &args, "input")
            .map_err(|message| Error::ToolValidation { tool: name.to_string(), message })?;
        (tool.handler)(args)
            .await
            .map_err(|e| Error::ToolExecution { tool: name.to_string(), message: format!("{:#}", e) })
    }

    /// Execute and capture the outcome; never fails.
    pub async fn run(&self, tool_use_id: &str, name: &str, args: Value) -> ToolResult {
        let (output, error) = match self.execute(name, args).await {
            | Ok(v) => (Some(v), None),
            | Err(e) => (None, Some(e.to_string())),
        };
        ToolResult { tool_use_id: tool_use_id.to_string(), tool_name: name.to_string(), output, error }
    }
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        | "object" => value.is_object(),
        | "array" => value.is_array(),
        | "string" => value.is_string(),
        | "number" => value.is_number(),
        | "integer" => value.is_i64() || value.is_u64() || value.as_f64().map_or(false, |f| f.fract() == 0.0),
        | "boolean" => value.is_boolean(),
        | "null" => value.is_null(),
        | _ => true,
    }
}

/// Validate `value` against the JSON-schema subset `type`, `properties`,
/// `required`, `enum`, `items`, `minimum` and `maximum`.
pub fn validate(schema: &Value, value: &Value, path: &str) -> std::result::Result<(), String> {
    match schema.get("type") {
        | Some(Value::String(t)) if !type_matches(t, value) => {
            return Err(format!("{} must be of type {}", path, t));
        }
        | Some(Value::Array(types)) => {
            if !types.iter().filter_map(Value::as_str).any(|t| type_matches(t, value)) {
                return Err(format!("{} has none of the allowed types", path));
            }
        }
        | _ => {}
    }

    if let Some(options) = schema.get("enum").and_then(Value::as_array) {
        if !options.contains(value) {
            return Err(format!("{} must be one of {}", path, Value::Array(options.clone())));
        }
    }

    if let Some(n) = value.as_f64() {
        if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
            if n < min {
                return Err(format!("{} must be >= {}", path, min));
            }
        }
        if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
            if n > max {
                return Err(format!("{} must be <= {}", path, max));
            }
        }
    }

    if let Some(obj) = value.as_object() {
        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for key in required.iter().filter_map(Value::as_str) {
                if !obj.contains_key(key) {
                    return Err(format!("{}.{} is required", path, key));
                }
            }
        }
        if let Some(props) = schema.get("properties").and_then(Value::as_object) {
            for (key, sub) in props {
                if let Some(v) = obj.get(key) {
                    validate(sub, v, &format!("{}.{}", path, key))?;
                }
            }
        }
    }

    if let (Some(items), Some(arr)) = (schema.get("items"), value.as_array()) {
        for (i, v) in arr.iter().enumerate() {
            validate(items, v, &format!("{}[{}]", path, i))?;
        }
    }
    Ok(())
}
