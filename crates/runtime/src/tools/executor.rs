//! Sequential batch executor with per-call fault isolation.

use super::{Tool, ToolError, ToolRegistry};
use serde_json::{Map, Value};
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use storage::{ToolCall, ToolResult};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Runs tool calls against a registry.
///
/// Every call yields exactly one [`ToolResult`]: validation errors, tool
/// errors, timeouts and panics all become failed results instead of
/// propagating.
#[derive(Debug, Clone)]
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    timeout: Option<Duration>,
}

impl ToolExecutor {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            timeout: Some(Self::DEFAULT_TIMEOUT),
        }
    }

    /// Per-call timeout. `None` lets calls run unbounded.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Execute a batch in order.
    ///
    /// Cancellation is checked before each call starts; a call already
    /// running is allowed to finish. The returned list is the results of
    /// the calls that were started, in call order.
    pub async fn execute_batch(
        &self,
        calls: &[ToolCall],
        cancel: &CancellationToken,
    ) -> Vec<ToolResult> {
        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            if cancel.is_cancelled() {
                info!(remaining = calls.len() - results.len(), "batch interrupted");
                break;
            }
            results.push(self.execute(call).await);
        }
        results
    }

    /// Execute a single call.
    pub async fn execute(&self, call: &ToolCall) -> ToolResult {
        let outcome = match self.registry.validate(call) {
            Ok(tool) => self.run(tool, call.args.clone()).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(output) => {
                debug!(tool = %call.name, "tool succeeded");
                ToolResult::success(&call.name, output)
            }
            Err(e) => {
                warn!(tool = %call.name, error = %e, "tool failed");
                ToolResult::failure(&call.name, e.to_string())
            }
        }
    }

    async fn run(&self, tool: Arc<dyn Tool>, args: Map<String, Value>) -> Result<Value, ToolError> {
        let mut handle = tokio::spawn(async move { tool.invoke(args).await });
        let joined = match self.timeout {
            None => (&mut handle).await,
            Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    handle.abort();
                    let ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX);
                    return Err(ToolError::Timeout(ms));
                }
            },
        };
        match joined {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => Err(ToolError::Panicked(panic_message(e.into_panic()))),
            Err(e) => Err(ToolError::execution(e.to_string())),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
