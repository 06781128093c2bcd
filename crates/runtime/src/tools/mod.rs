//! Tool registry and execution.

pub mod errors;
mod executor;
mod registry;
mod types;

pub use errors::ToolError;
pub use executor::ToolExecutor;
pub use registry::{FnTool, Tool, ToolRegistry};
pub use types::{Param, ParamKind, ToolSpec};
