//! Skein runtime: streaming execution engine for tool-using agents.
//!
//! A model streams back a mixed payload of reasoning, tool batches and
//! user-facing text. The runtime parses that stream no matter how it is
//! fragmented, executes requested tools, feeds results back, and persists
//! every durable event to an append-only log that provider context is
//! rebuilt from.
//!
//! # Overview
//!
//! - **protocol**: [`Lexer`] and [`Parser`] turn raw fragments into events.
//!   Marker tokens live in a [`Syntax`] value.
//! - **Accumulator**: buffers calls until their `execute` boundary, runs the
//!   batch through the [`ToolExecutor`], persists and emits the outcome.
//! - **tools**: [`ToolRegistry`] maps names to [`Tool`]s and validates
//!   arguments against each [`ToolSpec`].
//! - **context**: [`ContextAssembler`] rebuilds provider [`Message`]s from
//!   the log, optionally windowed.
//! - **providers**: [`Provider`] streams text; providers with sessions also
//!   support resume mode.
//! - **Conversation**: runs turns and hides whether the provider is resumed
//!   or replayed.
//!
//! # Example
//!
//! ```ignore
//! use runtime::{AnthropicAuth, AnthropicProvider, Conversation, RuntimeConfig, ToolRegistry};
//! use std::sync::Arc;
//! use storage::EventStore;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> runtime::Result<()> {
//! let auth = AnthropicAuth::ApiKey("sk-ant-api01-...".into());
//! let provider = AnthropicProvider::builder(auth, "claude-sonnet-4-20250514").build();
//! let store = EventStore::in_memory()?;
//!
//! let mut conversation = Conversation::new(
//!     Arc::new(store),
//!     Arc::new(provider),
//!     Arc::new(ToolRegistry::new()),
//!     RuntimeConfig::default(),
//! );
//! let mut events = Vec::new();
//! let outcome = conversation
//!     .turn("Hello!", &mut events, &CancellationToken::new())
//!     .await?;
//! println!("{}", outcome.response);
//! # Ok(())
//! # }
//! ```

mod accumulator;
mod config;
pub mod context;
mod conversation;
mod error;
pub mod protocol;
mod providers;
pub mod tools;
mod turn;

pub use accumulator::{Accumulator, EventSink, Step};
pub use config::{Granularity, ModePreference, RetryPolicy, RuntimeConfig};
pub use context::{ContextAssembler, Message, Role, system_prompt};
pub use conversation::{Conversation, ExecutionMode, TurnOutcome};
pub use error::{Error, Result};
pub use protocol::{Lexer, Marker, Parsed, Parser, Syntax, TextKind};
pub use providers::{
    AnthropicAuth, AnthropicProvider, AnthropicProviderBuilder, FragmentStream, Provider,
    ProviderSession, StdioProvider,
};
pub use tools::{FnTool, Param, ParamKind, Tool, ToolError, ToolExecutor, ToolRegistry, ToolSpec};
pub use turn::{Phase, TurnState};
