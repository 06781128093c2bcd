//! Tool trait and registry.

use super::{ToolError, ToolSpec};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use storage::ToolCall;
use tracing::warn;

/// A callable tool.
///
/// This is the boundary between the model loop and side effects. Tools are
/// invoked only after their arguments passed [`ToolSpec::validate`].
#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> &ToolSpec;

    async fn invoke(&self, args: Map<String, Value>) -> Result<Value, ToolError>;
}

/// A tool backed by an async closure.
pub struct FnTool<F> {
    spec: ToolSpec,
    f: F,
}

impl<F> FnTool<F> {
    pub fn new(spec: ToolSpec, f: F) -> Self {
        Self { spec, f }
    }
}

#[async_trait]
impl<F, Fut> Tool for FnTool<F>
where
    F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
{
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    async fn invoke(&self, args: Map<String, Value>) -> Result<Value, ToolError> {
        (self.f)(args).await
    }
}

/// Name-keyed tool table, built once at startup.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.tools.keys()).finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under its spec name. A later registration with the
    /// same name replaces the earlier one.
    pub fn register(&mut self, tool: impl Tool + 'static) -> &mut Self {
        let name = tool.spec().name.clone();
        if self.tools.insert(name.clone(), Arc::new(tool)).is_some() {
            warn!(tool = %name, "tool registered twice; keeping the latest");
        }
        self
    }

    pub fn register_fn<F, Fut>(&mut self, spec: ToolSpec, f: F) -> &mut Self
    where
        F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        self.register(FnTool::new(spec, f))
    }

    pub fn resolve(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name).map(|tool| tool.spec())
    }

    /// Specs of every registered tool, sorted by name.
    pub fn specs(&self) -> Vec<&ToolSpec> {
        self.tools.values().map(|tool| tool.spec()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Look up the tool for a call and check its arguments.
    pub fn validate(&self, call: &ToolCall) -> Result<Arc<dyn Tool>, ToolError> {
        let tool = self
            .tools
            .get(&call.name)
            .ok_or_else(|| ToolError::NotFound(call.name.clone()))?;
        tool.spec().validate(&call.args)?;
        Ok(Arc::clone(tool))
    }

    /// Validate and invoke a tool directly, without timeout or isolation.
    pub async fn invoke(&self, name: &str, args: Map<String, Value>) -> Result<Value, ToolError> {
        let call = ToolCall::new(name, args);
        let tool = self.validate(&call)?;
        tool.invoke(call.args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ParamKind;
    use serde_json::json;

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register_fn(
            ToolSpec::new("echo", "Echo the input").required("text", ParamKind::String, ""),
            |args| async move { Ok::<_, ToolError>(args["text"].clone()) },
        );
        registry
    }

    #[tokio::test]
    async fn invoke_registered_tool() {
        let mut args = Map::new();
        args.insert("text".into(), json!("hi"));
        assert_eq!(registry().invoke("echo", args).await, Ok(json!("hi")));
    }

    #[tokio::test]
    async fn unknown_tool_is_not_found() {
        let err = registry().invoke("nope", Map::new()).await.unwrap_err();
        assert_eq!(err, ToolError::NotFound("nope".into()));
    }

    #[tokio::test]
    async fn validation_runs_before_invoke() {
        let err = registry().invoke("echo", Map::new()).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidInput(_)));
    }

    #[test]
    fn later_registration_wins() {
        let mut registry = registry();
        registry.register_fn(ToolSpec::new("echo", "replaced"), |_| async {
            Ok::<_, ToolError>(Value::Null)
        });
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.resolve("echo").map(|s| s.description.as_str()), Some("replaced"));
    }

    #[test]
    fn specs_are_sorted_by_name() {
        let mut registry = registry();
        registry.register_fn(ToolSpec::new("alpha", ""), |_| async {
            Ok::<_, ToolError>(Value::Null)
        });
        let names: Vec<_> = registry.specs().into_iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["alpha", "echo"]);
    }
}
